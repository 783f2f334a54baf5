//! OCI bundle store.
//!
//! Bundles live under `<base>/images/`, one directory per image reference.
//! The directory name is the reference with its final `:` replaced by `-`
//! (`docker.io/foo:1.2` -> `docker.io/foo-1.2`), so references with registry
//! components nest naturally. A directory is a bundle iff it carries the
//! `umoci.json` marker.

mod spec;
mod transport;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use walkdir::WalkDir;

use sloop_core::error::{Error, ImageOp, Result};

pub use spec::{OciCapabilities, OciLinux, OciNamespace, OciProcess, OciRoot, OciSpec};
pub use transport::{ImageTransport, RegistryTransport, BUNDLE_MARKER};

/// Split `repo:tag` on the final colon.
pub fn split_ref(from: &str) -> Result<(&str, &str)> {
    match from.rfind(':') {
        Some(idx) if idx > 0 && idx + 1 < from.len() => Ok((&from[..idx], &from[idx + 1..])),
        _ => Err(Error::image(
            ImageOp::Fetch,
            format!("invalid image reference {from:?}: expected repo:tag"),
        )),
    }
}

/// Bundle directory for a reference, relative to the images root.
pub fn bundle_rel_path(from: &str) -> PathBuf {
    match from.rfind(':') {
        Some(idx) => PathBuf::from(format!("{}-{}", &from[..idx], &from[idx + 1..])),
        None => PathBuf::from(from),
    }
}

/// Inverse of [`bundle_rel_path`]: map a bundle directory name back to the
/// image reference by restoring the final `-` to `:`.
pub fn ref_from_rel_path(rel: &str) -> String {
    match rel.rfind('-') {
        Some(idx) => format!("{}:{}", &rel[..idx], &rel[idx + 1..]),
        None => rel.to_string(),
    }
}

/// Content store for unpacked OCI bundles.
pub struct ImageStore {
    images_dir: PathBuf,
    transport: Arc<dyn ImageTransport>,
}

impl ImageStore {
    pub fn new(images_dir: impl Into<PathBuf>, transport: Arc<dyn ImageTransport>) -> Self {
        Self {
            images_dir: images_dir.into(),
            transport,
        }
    }

    pub fn images_dir(&self) -> &Path {
        &self.images_dir
    }

    pub fn bundle_dir(&self, from: &str) -> PathBuf {
        self.images_dir.join(bundle_rel_path(from))
    }

    pub fn rootfs_dir(&self, from: &str) -> PathBuf {
        self.bundle_dir(from).join("rootfs")
    }

    /// Fetch a bundle. Success without action when the bundle directory
    /// already exists.
    pub async fn fetch(&self, from: &str) -> Result<PathBuf> {
        let (repo, tag) = split_ref(from)?;
        let dest = self.bundle_dir(from);
        if dest.exists() {
            tracing::debug!(reference = %from, "bundle already present");
            return Ok(dest);
        }
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::filesystem(format!("cannot create {}", parent.display()), e)
            })?;
        }
        self.transport.fetch(repo, tag, &dest).await?;
        Ok(dest)
    }

    /// Parse a bundle's `config.json` into the partial runtime spec.
    pub fn read_metadata(&self, from: &str) -> Result<OciSpec> {
        let path = self.bundle_dir(from).join("config.json");
        let data = std::fs::read(&path).map_err(|e| {
            Error::image(
                ImageOp::Metadata,
                format!("cannot read {}: {e}", path.display()),
            )
        })?;
        serde_json::from_slice(&data).map_err(|e| {
            Error::image(
                ImageOp::Metadata,
                format!("cannot parse {}: {e}", path.display()),
            )
        })
    }

    /// References of every complete bundle on disk, sorted.
    pub fn observed(&self) -> Result<Vec<String>> {
        if !self.images_dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut refs = Vec::new();
        let mut it = WalkDir::new(&self.images_dir).min_depth(1).into_iter();
        while let Some(entry) = it.next() {
            let entry = entry.map_err(|e| {
                let io = e
                    .into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("walk error"));
                Error::filesystem("cannot list image bundles", io)
            })?;
            if !entry.file_type().is_dir() {
                continue;
            }
            if entry.path().join(BUNDLE_MARKER).is_file() {
                if let Ok(rel) = entry.path().strip_prefix(&self.images_dir) {
                    refs.push(ref_from_rel_path(&rel.to_string_lossy()));
                }
                it.skip_current_dir();
            }
        }
        refs.sort();
        Ok(refs)
    }

    /// Delete a bundle directory.
    pub fn remove(&self, from: &str) -> Result<()> {
        let dir = self.bundle_dir(from);
        tracing::info!(reference = %from, "removing image bundle");
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::filesystem(
                format!("cannot remove image bundle {}", dir.display()),
                e,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct MockTransport {
        calls: Mutex<Vec<String>>,
    }

    impl MockTransport {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ImageTransport for MockTransport {
        async fn fetch(&self, repo: &str, tag: &str, dest: &Path) -> Result<()> {
            self.calls.lock().unwrap().push(format!("{repo}:{tag}"));
            std::fs::create_dir_all(dest.join("rootfs")).unwrap();
            std::fs::write(dest.join("config.json"), b"{}").unwrap();
            std::fs::write(dest.join(BUNDLE_MARKER), b"{}").unwrap();
            Ok(())
        }
    }

    #[test]
    fn test_ref_path_mapping() {
        assert_eq!(
            bundle_rel_path("docker.io/foo:1.2"),
            PathBuf::from("docker.io/foo-1.2")
        );
        assert_eq!(ref_from_rel_path("docker.io/foo-1.2"), "docker.io/foo:1.2");
        assert_eq!(bundle_rel_path("alpine:3"), PathBuf::from("alpine-3"));
        assert_eq!(ref_from_rel_path("alpine-3"), "alpine:3");
    }

    #[test]
    fn test_split_ref() {
        assert_eq!(split_ref("alpine:3").unwrap(), ("alpine", "3"));
        assert_eq!(
            split_ref("ghcr.io/org/app:v1.2").unwrap(),
            ("ghcr.io/org/app", "v1.2")
        );
        assert!(split_ref("noversion").is_err());
        assert!(split_ref(":3").is_err());
        assert!(split_ref("repo:").is_err());
    }

    #[tokio::test]
    async fn test_fetch_skips_existing_bundle() {
        let tmp = TempDir::new().unwrap();
        let transport = Arc::new(MockTransport::new());
        let store = ImageStore::new(tmp.path().join("images"), transport.clone());

        store.fetch("alpine:3").await.unwrap();
        store.fetch("alpine:3").await.unwrap();
        assert_eq!(transport.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_observed_finds_nested_bundles() {
        let tmp = TempDir::new().unwrap();
        let transport = Arc::new(MockTransport::new());
        let store = ImageStore::new(tmp.path().join("images"), transport);

        store.fetch("docker.io/library/nginx:1.25").await.unwrap();
        store.fetch("alpine:3").await.unwrap();
        // A stray directory without a marker is not a bundle.
        std::fs::create_dir_all(tmp.path().join("images/scratch")).unwrap();

        let observed = store.observed().unwrap();
        assert_eq!(
            observed,
            vec![
                "alpine:3".to_string(),
                "docker.io/library/nginx:1.25".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_remove_bundle() {
        let tmp = TempDir::new().unwrap();
        let transport = Arc::new(MockTransport::new());
        let store = ImageStore::new(tmp.path().join("images"), transport);

        store.fetch("alpine:3").await.unwrap();
        assert!(store.bundle_dir("alpine:3").exists());
        store.remove("alpine:3").unwrap();
        assert!(!store.bundle_dir("alpine:3").exists());
        // Removing a missing bundle is fine.
        store.remove("alpine:3").unwrap();
    }

    #[test]
    fn test_observed_empty_when_dir_missing() {
        let transport: Arc<dyn ImageTransport> = Arc::new(MockTransport::new());
        let store = ImageStore::new("/nonexistent/images", transport);
        assert!(store.observed().unwrap().is_empty());
    }
}
