//! Registry transport: pull and unpack an OCI image into a bundle.
//!
//! The transport is the seam between the image store and the outside world.
//! The production implementation pulls manifest, config, and layers with
//! `oci-distribution`, unpacks the layer tarballs into `rootfs/` (honoring
//! whiteouts), synthesizes a runtime `config.json` from the image
//! configuration, and drops the `umoci.json` marker that identifies a
//! complete bundle.

use std::io::Read;
use std::path::Path;

use async_trait::async_trait;
use flate2::read::GzDecoder;
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::manifest::{OciImageManifest, OciManifest};
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::{Client, Reference};
use oci_spec::image::ImageConfiguration;
use serde_json::{json, Value};
use tar::Archive;

use sloop_core::error::{Error, ImageOp, Result};

/// Marker file written last; a bundle directory without it is incomplete.
pub const BUNDLE_MARKER: &str = "umoci.json";

/// Fetches an OCI bundle for `repo:tag` into a destination directory.
#[async_trait]
pub trait ImageTransport: Send + Sync {
    async fn fetch(&self, repo: &str, tag: &str, dest: &Path) -> Result<()>;
}

/// Production transport backed by a container registry.
pub struct RegistryTransport {
    client: Client,
    auth: RegistryAuth,
}

impl Default for RegistryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryTransport {
    pub fn new() -> Self {
        let config = ClientConfig {
            protocol: ClientProtocol::Https,
            ..Default::default()
        };
        Self {
            client: Client::new(config),
            auth: RegistryAuth::Anonymous,
        }
    }
}

#[async_trait]
impl ImageTransport for RegistryTransport {
    async fn fetch(&self, repo: &str, tag: &str, dest: &Path) -> Result<()> {
        let ref_str = format!("{repo}:{tag}");
        let reference: Reference = ref_str.parse().map_err(|e| {
            Error::image(
                ImageOp::Fetch,
                format!("invalid image reference {ref_str}: {e}"),
            )
        })?;

        tracing::info!(reference = %ref_str, dest = %dest.display(), "fetching image");

        let (manifest, digest) = self
            .client
            .pull_manifest(&reference, &self.auth)
            .await
            .map_err(|e| {
                Error::image(ImageOp::Fetch, format!("cannot pull manifest for {ref_str}: {e}"))
            })?;
        let manifest = match manifest {
            OciManifest::Image(m) => m,
            OciManifest::ImageIndex(_) => {
                return Err(Error::image(
                    ImageOp::Fetch,
                    format!("{ref_str} resolves to a manifest index, expected an image manifest"),
                ))
            }
        };

        let image_config = self.pull_image_config(&reference, &manifest, &ref_str).await?;

        let rootfs = dest.join("rootfs");
        std::fs::create_dir_all(&rootfs)
            .map_err(|e| Error::filesystem(format!("cannot create {}", rootfs.display()), e))?;

        for layer in &manifest.layers {
            tracing::debug!(digest = %layer.digest, size = layer.size, "pulling layer");
            let mut data: Vec<u8> = Vec::new();
            self.client
                .pull_blob(&reference, layer, &mut data)
                .await
                .map_err(|e| {
                    Error::image(
                        ImageOp::Fetch,
                        format!("cannot pull layer {} of {ref_str}: {e}", layer.digest),
                    )
                })?;
            let gzip = layer.media_type.contains("gzip");
            if !gzip && !layer.media_type.contains("tar") {
                return Err(Error::image(
                    ImageOp::Fetch,
                    format!(
                        "unsupported layer media type {} in {ref_str}",
                        layer.media_type
                    ),
                ));
            }
            apply_layer(&data, gzip, &rootfs)?;
        }

        let runtime_spec = synthesize_runtime_spec(&image_config);
        write_json(&dest.join("config.json"), &runtime_spec)?;
        write_json(
            &dest.join(BUNDLE_MARKER),
            &json!({"ref": ref_str, "digest": digest}),
        )?;

        tracing::info!(reference = %ref_str, "image unpacked");
        Ok(())
    }
}

impl RegistryTransport {
    async fn pull_image_config(
        &self,
        reference: &Reference,
        manifest: &OciImageManifest,
        ref_str: &str,
    ) -> Result<ImageConfiguration> {
        let mut data: Vec<u8> = Vec::new();
        self.client
            .pull_blob(reference, &manifest.config, &mut data)
            .await
            .map_err(|e| {
                Error::image(
                    ImageOp::Fetch,
                    format!("cannot pull image config of {ref_str}: {e}"),
                )
            })?;
        serde_json::from_slice(&data).map_err(|e| {
            Error::image(
                ImageOp::Fetch,
                format!("cannot parse image config of {ref_str}: {e}"),
            )
        })
    }
}

fn write_json(path: &Path, value: &Value) -> Result<()> {
    let data = serde_json::to_vec_pretty(value).map_err(|e| {
        Error::image(ImageOp::Fetch, format!("cannot serialize {}: {e}", path.display()))
    })?;
    std::fs::write(path, data)
        .map_err(|e| Error::filesystem(format!("cannot write {}", path.display()), e))
}

/// Unpack one layer tarball, applying OCI whiteouts.
fn apply_layer(data: &[u8], gzip: bool, rootfs: &Path) -> Result<()> {
    let reader: Box<dyn Read + '_> = if gzip {
        Box::new(GzDecoder::new(data))
    } else {
        Box::new(data)
    };
    let mut archive = Archive::new(reader);
    archive.set_preserve_permissions(true);

    let entries = archive
        .entries()
        .map_err(|e| Error::image(ImageOp::Fetch, format!("cannot read layer archive: {e}")))?;
    for entry in entries {
        let mut entry = entry
            .map_err(|e| Error::image(ImageOp::Fetch, format!("corrupt layer entry: {e}")))?;
        let path = entry
            .path()
            .map_err(|e| Error::image(ImageOp::Fetch, format!("bad path in layer: {e}")))?
            .into_owned();

        let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if let Some(target) = file_name.strip_prefix(".wh.") {
            let parent = rootfs.join(path.parent().unwrap_or_else(|| Path::new("")));
            if target == ".wh..opq" {
                remove_dir_contents(&parent)?;
            } else {
                remove_existing(&parent.join(target))?;
            }
            continue;
        }

        entry.unpack_in(rootfs).map_err(|e| {
            Error::image(
                ImageOp::Fetch,
                format!("cannot unpack {} into rootfs: {e}", path.display()),
            )
        })?;
    }
    Ok(())
}

fn remove_existing(path: &Path) -> Result<()> {
    let res = if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    match res {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::filesystem(
            format!("cannot apply whiteout for {}", path.display()),
            e,
        )),
    }
}

fn remove_dir_contents(dir: &Path) -> Result<()> {
    if !dir.is_dir() {
        return Ok(());
    }
    let entries = std::fs::read_dir(dir)
        .map_err(|e| Error::filesystem(format!("cannot read {}", dir.display()), e))?;
    for entry in entries {
        let entry =
            entry.map_err(|e| Error::filesystem(format!("cannot read {}", dir.display()), e))?;
        remove_existing(&entry.path())?;
    }
    Ok(())
}

/// Build the runtime spec a fresh bundle starts from.
///
/// Shape follows what umoci generates: args from entrypoint followed by cmd,
/// image env, default namespaces including `network`, a minimal bounding set.
fn synthesize_runtime_spec(image_config: &ImageConfiguration) -> Value {
    let config = image_config.config().as_ref();

    let mut args: Vec<String> = Vec::new();
    if let Some(entrypoint) = config.and_then(|c| c.entrypoint().as_ref()) {
        args.extend(entrypoint.iter().cloned());
    }
    if let Some(cmd) = config.and_then(|c| c.cmd().as_ref()) {
        args.extend(cmd.iter().cloned());
    }

    let env: Vec<String> = config
        .and_then(|c| c.env().as_ref())
        .cloned()
        .unwrap_or_else(|| {
            vec!["PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string()]
        });

    let cwd = config
        .and_then(|c| c.working_dir().as_ref())
        .cloned()
        .filter(|d| !d.is_empty())
        .unwrap_or_else(|| "/".to_string());

    let caps = json!(["CAP_AUDIT_WRITE", "CAP_KILL", "CAP_NET_BIND_SERVICE"]);
    let (bounding, effective, inheritable, permitted, ambient) = (
        caps.clone(),
        caps.clone(),
        caps.clone(),
        caps.clone(),
        caps,
    );

    json!({
        "ociVersion": "1.0.2",
        "process": {
            "terminal": false,
            "user": {"uid": 0, "gid": 0},
            "args": args,
            "env": env,
            "cwd": cwd,
            "capabilities": {
                "bounding": bounding,
                "effective": effective,
                "inheritable": inheritable,
                "permitted": permitted,
                "ambient": ambient
            },
            "noNewPrivileges": false
        },
        "root": {"path": "rootfs", "readonly": false},
        "hostname": "sloop",
        "mounts": [
            {"destination": "/proc", "type": "proc", "source": "proc"},
            {
                "destination": "/dev",
                "type": "tmpfs",
                "source": "tmpfs",
                "options": ["nosuid", "strictatime", "mode=755", "size=65536k"]
            },
            {
                "destination": "/dev/pts",
                "type": "devpts",
                "source": "devpts",
                "options": ["nosuid", "noexec", "newinstance", "ptmxmode=0666", "mode=0620"]
            },
            {
                "destination": "/dev/shm",
                "type": "tmpfs",
                "source": "shm",
                "options": ["nosuid", "noexec", "nodev", "mode=1777", "size=65536k"]
            },
            {
                "destination": "/dev/mqueue",
                "type": "mqueue",
                "source": "mqueue",
                "options": ["nosuid", "noexec", "nodev"]
            },
            {
                "destination": "/sys",
                "type": "sysfs",
                "source": "sysfs",
                "options": ["nosuid", "noexec", "nodev", "ro"]
            }
        ],
        "linux": {
            "namespaces": [
                {"type": "pid"},
                {"type": "network"},
                {"type": "ipc"},
                {"type": "uts"},
                {"type": "mount"}
            ],
            "maskedPaths": [
                "/proc/kcore",
                "/proc/latency_stats",
                "/proc/timer_list",
                "/proc/timer_stats",
                "/proc/sched_debug",
                "/sys/firmware",
                "/proc/scsi"
            ],
            "readonlyPaths": [
                "/proc/asound",
                "/proc/bus",
                "/proc/fs",
                "/proc/irq",
                "/proc/sys",
                "/proc/sysrq-trigger"
            ],
            "resources": {"devices": [{"allow": false, "access": "rwm"}]}
        }
    })
}
