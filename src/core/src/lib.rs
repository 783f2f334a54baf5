//! Sloop core - foundational types.
//!
//! Error kinds, the typed desired-state model, and the on-disk state layout
//! shared by the runtime and the CLI.

pub mod error;
pub mod model;
pub mod paths;

pub use error::{ConfigPhase, Error, ImageOp, Result, RuntimeOp, UnitOp};
pub use model::{
    Bridge, Config, Dependency, Exec, File, Image, Interface, Network, Service, ServiceType,
    Timer, TimerAction, TimerRun, Volume, VolumeMapping,
};
pub use paths::{Paths, DEFAULT_BASE};

/// Sloop version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
