use std::path::Path;

use sloop_runtime::Loader;

use super::build_reconciler;

pub async fn execute(conf: &Path, base: &Path) -> anyhow::Result<()> {
    let config = Loader::new().load(conf)?;
    let reconciler = build_reconciler(base)?;
    reconciler.run(&config).await?;
    Ok(())
}
