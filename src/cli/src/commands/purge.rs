use std::path::Path;

use clap::Args;

use super::build_reconciler;

#[derive(Args)]
pub struct PurgeArgs {
    /// Also remove the image store
    #[arg(long, short)]
    pub images: bool,
}

pub async fn execute(base: &Path, args: &PurgeArgs) -> anyhow::Result<()> {
    let reconciler = build_reconciler(base)?;
    reconciler.purge(args.images).await?;
    Ok(())
}
