//! CLI command definitions and dispatch.

mod check;
mod fetch;
mod init;
mod print;
mod purge;
mod run;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};

use sloop_core::paths::{Paths, DEFAULT_BASE};
use sloop_runtime::{ImageStore, Reconciler, RegistryTransport, SystemctlManager};

/// Sloop - a container generator and configurator.
///
/// Renders a declarative configuration into systemd units running
/// systemd-nspawn containers, and converges the host toward it.
#[derive(Parser)]
#[command(name = "sloop", version, about)]
pub struct Cli {
    /// Configuration root directory
    #[arg(long, global = true, default_value = ".")]
    pub conf: PathBuf,

    /// State directory holding volumes, images, units, and services
    #[arg(long, global = true, default_value = DEFAULT_BASE)]
    pub base: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Validate the configuration and print the decoded model
    Check,
    /// Validate the configuration and print the value at a dotted path
    Print(print::PrintArgs),
    /// Reconcile the host toward the configuration
    Run,
    /// Stop, disable, and delete everything sloop manages
    Purge(purge::PurgeArgs),
    /// Pre-fetch an image bundle into the image store
    Fetch(fetch::FetchArgs),
    /// Initialize a configuration directory
    Init(init::InitArgs),
}

/// Resolve the state root into an absolute path.
pub(crate) fn absolute_base(base: &Path) -> anyhow::Result<PathBuf> {
    if base.is_absolute() {
        Ok(base.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(base))
    }
}

pub(crate) fn open_image_store(base: &Path) -> anyhow::Result<ImageStore> {
    let paths = Paths::new(absolute_base(base)?)?;
    Ok(ImageStore::new(
        paths.images(),
        Arc::new(RegistryTransport::new()),
    ))
}

pub(crate) fn build_reconciler(base: &Path) -> anyhow::Result<Reconciler> {
    let paths = Paths::new(absolute_base(base)?)?;
    let store = ImageStore::new(paths.images(), Arc::new(RegistryTransport::new()));
    Ok(Reconciler::new(
        paths,
        Arc::new(SystemctlManager::new()),
        store,
    ))
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Check => check::execute(&cli.conf).await,
        Command::Print(ref args) => print::execute(&cli.conf, args).await,
        Command::Run => run::execute(&cli.conf, &cli.base).await,
        Command::Purge(ref args) => purge::execute(&cli.base, args).await,
        Command::Fetch(ref args) => fetch::execute(&cli.base, args).await,
        Command::Init(ref args) => init::execute(&cli.conf, args).await,
    }
}
