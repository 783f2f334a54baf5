use std::path::Path;

use clap::Args;

#[derive(Args)]
pub struct InitArgs {
    /// Module name, e.g. example.com/myconf
    pub module: Option<String>,
}

/// Check that a module name has a plausible registry host.
fn validate_module(module: &str) -> anyhow::Result<()> {
    let host = module.split('/').next().unwrap_or("");
    if host.is_empty() || !host.contains('.') {
        anyhow::bail!("invalid module name {module:?}: expected a dotted host like example.com");
    }
    Ok(())
}

pub async fn execute(conf: &Path, args: &InitArgs) -> anyhow::Result<()> {
    let module = match &args.module {
        Some(module) => {
            validate_module(module)?;
            module.clone()
        }
        // An empty module is valid and easy for the user to fill in later.
        None => String::new(),
    };

    let mod_dir = conf.join("cue.mod");
    if mod_dir.exists() {
        anyhow::bail!("cue.mod directory already exists");
    }
    std::fs::create_dir_all(&mod_dir)?;
    std::fs::write(
        mod_dir.join("module.cue"),
        format!("module: {module:?}\n"),
    )?;
    std::fs::create_dir(mod_dir.join("usr"))?;
    std::fs::create_dir(mod_dir.join("pkg"))?;
    Ok(())
}
