use std::path::Path;

use sloop_runtime::Loader;

pub async fn execute(conf: &Path) -> anyhow::Result<()> {
    let config = Loader::new().load(conf)?;
    println!("{config:#?}");
    Ok(())
}
