//! State-directory layout.
//!
//! Pure mapping from a base directory to the well-known subdirectories the
//! reconciler manages. No state, no I/O.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Default state root on a production host.
pub const DEFAULT_BASE: &str = "/var/lib/sloop";

/// Absolute paths of everything sloop persists under its base directory.
#[derive(Debug, Clone)]
pub struct Paths {
    base: PathBuf,
}

impl Paths {
    /// Create the layout rooted at `base`. The base must be absolute.
    pub fn new(base: impl Into<PathBuf>) -> Result<Self> {
        let base = base.into();
        if !base.is_absolute() {
            return Err(Error::filesystem(
                format!("base directory {} is not absolute", base.display()),
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "relative base"),
            ));
        }
        Ok(Self { base })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Managed volume directories.
    pub fn volumes(&self) -> PathBuf {
        self.base.join("volumes")
    }

    pub fn volume(&self, name: &str) -> PathBuf {
        self.volumes().join(name)
    }

    /// Unpacked OCI bundles.
    pub fn images(&self) -> PathBuf {
        self.base.join("images")
    }

    /// Unit files, linked into systemd from here.
    pub fn units(&self) -> PathBuf {
        self.base.join("units")
    }

    pub fn unit(&self, basename: &str) -> PathBuf {
        self.units().join(basename)
    }

    /// Per-service artifact directories.
    pub fn services(&self) -> PathBuf {
        self.base.join("services")
    }

    pub fn service(&self, name: &str) -> PathBuf {
        self.services().join(name)
    }

    /// Helper binaries and scripts shipped by sloop itself.
    pub fn utils(&self) -> PathBuf {
        self.base.join("utils")
    }

    /// The pinned container init binary.
    pub fn init(&self) -> PathBuf {
        self.utils().join("init")
    }

    /// The reload helper script.
    pub fn nsenter(&self) -> PathBuf {
        self.utils().join("nsenter")
    }
}
