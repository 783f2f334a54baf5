use std::path::Path;

use clap::Args;

use super::open_image_store;

#[derive(Args)]
pub struct FetchArgs {
    /// Image repository (e.g. docker.io/library/alpine)
    pub repo: String,
    /// Image tag (e.g. 3.19)
    pub tag: String,
}

pub async fn execute(base: &Path, args: &FetchArgs) -> anyhow::Result<()> {
    let store = open_image_store(base)?;
    let bundle = store.fetch(&format!("{}:{}", args.repo, args.tag)).await?;
    println!("{}", bundle.display());
    Ok(())
}
