//! Sloop runtime.
//!
//! Everything between the typed model and the host: configuration loading and
//! resolution, the OCI bundle store, systemd unit rendering, the service
//! manager wrapper, and the reconciler that converges the host toward the
//! desired state.

pub mod config;
pub mod image;
pub mod reconciler;
pub mod systemd;
pub mod units;

pub use config::Loader;
pub use image::{ImageStore, ImageTransport, RegistryTransport};
pub use reconciler::Reconciler;
pub use systemd::{Manager, SystemctlManager, UnitStatus};
