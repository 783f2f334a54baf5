use std::path::Path;

use clap::Args;

use sloop_runtime::config::{lookup, resolve};
use sloop_runtime::Loader;

#[derive(Args)]
pub struct PrintArgs {
    /// Dotted path into the evaluated configuration (e.g. services.web.image)
    pub path: String,
}

pub async fn execute(conf: &Path, args: &PrintArgs) -> anyhow::Result<()> {
    let value = Loader::new().raw(conf)?;
    resolve(&value)?;
    match lookup(&value, &args.path) {
        Some(sub) => {
            println!("{}", serde_json::to_string_pretty(sub)?);
            Ok(())
        }
        None => anyhow::bail!("no value at path {:?}", args.path),
    }
}
