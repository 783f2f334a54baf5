//! The reconciler.
//!
//! One pass converges the host toward the desired state in a strict phase
//! order: prepare directories, observe, prune stale units, install helpers,
//! render singletons, bridges, volumes, images, service artifacts, service
//! units, hosts files, timers, then a single reload followed by starting the
//! umbrella target. Change detection is bytewise everywhere; re-running a
//! pass with no configuration change performs no transitions.

use std::collections::{BTreeMap, BTreeSet};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::timeout;

use sloop_core::error::{Error, Result, RuntimeOp, UnitOp};
use sloop_core::model::{Config, Service, ServiceType};
use sloop_core::paths::Paths;

use crate::image::ImageStore;
use crate::systemd::{Manager, UnitStatus, MODE_REPLACE};
use crate::units;

/// How long to wait on a single start/stop job before aborting the pass.
const JOB_TIMEOUT: Duration = Duration::from_secs(60);

/// The pinned init binary shipped into every container as `/catatonit`.
const INIT_BIN: &[u8] = include_bytes!("../assets/init");

/// Reload helper: finds the container payload PID through the slice cgroup,
/// snapshots its environment, and execs the reload command inside all of the
/// container's namespaces.
const NSENTER_SCRIPT: &str = r#"#!/bin/bash
service=$1
shift
cmd="$@"
pid=$(head -n 1 /sys/fs/cgroup/sloop.slice/${service}.service/payload/cgroup.procs)
env=$(cat /proc/${pid}/environ | xargs -0)
exec nsenter -a -t ${pid} env -i - ${env} ${cmd}
"#;

const HOSTS_PREAMBLE: &str =
    "\n127.0.0.1\tlocalhost.localdomain\tlocalhost\n::1\t\tlocalhost.localdomain\tlocalhost\n\n";

/// Every unit basename the configuration wants on disk.
pub fn desired_units(config: &Config) -> BTreeSet<String> {
    let mut units: BTreeSet<String> = BTreeSet::new();
    units.insert(units::TARGET_UNIT.to_string());
    units.insert(units::SLICE_UNIT.to_string());
    for svc in config.services.values() {
        units.insert(svc.unit_name());
    }
    for timer in config.timers.values() {
        units.insert(timer.timer_unit_name());
        units.insert(timer.service_unit_name());
    }
    for bridge in config.bridges.values() {
        units.insert(bridge.unit_name());
    }
    units
}

fn fs_err(message: impl Into<String>) -> impl FnOnce(std::io::Error) -> Error {
    let message = message.into();
    move |e| Error::filesystem(message, e)
}

fn remove_ignore_missing(path: &Path) -> Result<()> {
    let res = if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    match res {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::filesystem(
            format!("cannot remove {}", path.display()),
            e,
        )),
    }
}

/// Write `bytes` to `path` iff they differ from what is on disk.
fn write_if_changed(path: &Path, bytes: &[u8], mode: u32) -> Result<bool> {
    let old = std::fs::read(path).ok();
    if old.as_deref() == Some(bytes) {
        return Ok(false);
    }
    std::fs::write(path, bytes).map_err(fs_err(format!("cannot write {}", path.display())))?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .map_err(fs_err(format!("cannot chmod {}", path.display())))?;
    Ok(true)
}

/// Drives one reconciliation pass (or a purge) against the host.
pub struct Reconciler {
    paths: Paths,
    manager: Arc<dyn Manager>,
    store: ImageStore,
}

impl Reconciler {
    pub fn new(paths: Paths, manager: Arc<dyn Manager>, store: ImageStore) -> Self {
        Self {
            paths,
            manager,
            store,
        }
    }

    /// Converge the host toward `config`.
    pub async fn run(&self, config: &Config) -> Result<()> {
        self.prepare_directories()?;

        let observed_units = self.observed_units()?;
        let observed_images: BTreeSet<String> = self.store.observed()?.into_iter().collect();
        let desired = desired_units(config);

        let mut reload = false;

        for unit in observed_units.difference(&desired) {
            self.stop_disable_delete(unit).await?;
            if let Some(name) = unit.strip_suffix(".service") {
                remove_ignore_missing(&self.paths.service(name))?;
            }
            reload = true;
        }

        self.install_helpers()?;

        reload |= self
            .write_link_unit(units::SLICE_UNIT, units::SLICE_TEXT, false)
            .await?;
        reload |= self
            .write_link_unit(units::TARGET_UNIT, units::TARGET_TEXT, true)
            .await?;

        for bridge in config.bridges.values() {
            let text = units::render_bridge(bridge)?;
            let unit = bridge.unit_name();
            let changed = self.write_link_unit(&unit, &text, false).await?;
            if changed {
                self.stop_unit_if_active(&unit).await?;
                reload = true;
            }
        }

        for volume in config.volumes.values() {
            if volume.is_host_path() {
                continue;
            }
            let dir = self.paths.volume(&volume.name);
            std::fs::create_dir_all(&dir)
                .map_err(fs_err(format!("cannot create volume {}", dir.display())))?;
        }

        let needed: BTreeSet<String> = config
            .services
            .values()
            .map(|s| s.image.from.clone())
            .collect();
        for image in &needed {
            self.store.fetch(image).await?;
        }
        for stale in observed_images.difference(&needed) {
            self.store.remove(stale)?;
        }

        let mut artifacts_changed: BTreeMap<String, bool> = BTreeMap::new();
        for (name, svc) in &config.services {
            artifacts_changed.insert(name.clone(), self.service_artifacts(svc).await?);
        }

        for (name, svc) in &config.services {
            let start = self.resolve_start(svc)?;
            let text = units::render_service(svc, &self.paths, &start);
            let unit = svc.unit_name();
            let changed = self.write_link_unit(&unit, &text, svc.enable).await?;
            let artifacts = artifacts_changed.get(name).copied().unwrap_or(false);
            if changed && !artifacts {
                self.stop_unit_if_active(&unit).await?;
            }
            reload |= changed || artifacts;
        }

        self.write_hosts(config)?;

        for timer in config.timers.values() {
            let timer_unit = timer.timer_unit_name();
            let service_unit = timer.service_unit_name();
            let timer_text = units::render_timer(timer);
            let service_text = units::render_timer_service(timer);
            let old_timer = std::fs::read(self.paths.unit(&timer_unit)).ok();
            let old_service = std::fs::read(self.paths.unit(&service_unit)).ok();
            if old_timer.as_deref() == Some(timer_text.as_bytes())
                && old_service.as_deref() == Some(service_text.as_bytes())
            {
                continue;
            }
            self.stop_unit_if_active(&timer_unit).await?;
            self.stop_unit_if_active(&service_unit).await?;
            self.write_link_unit(&timer_unit, &timer_text, true).await?;
            self.write_link_unit(&service_unit, &service_text, false)
                .await?;
            reload = true;
        }

        if reload {
            tracing::info!("reloading service manager");
            self.manager.reload().await?;
        }
        self.start_unit(units::TARGET_UNIT).await?;
        Ok(())
    }

    /// Tear everything down: stop, disable, and delete every managed unit,
    /// then remove the unit and service trees (and images when asked).
    pub async fn purge(&self, images: bool) -> Result<()> {
        let units_dir = self.paths.units();
        if units_dir.is_dir() {
            let entries = std::fs::read_dir(&units_dir)
                .map_err(fs_err(format!("cannot list {}", units_dir.display())))?;
            for entry in entries {
                let entry =
                    entry.map_err(fs_err(format!("cannot list {}", units_dir.display())))?;
                if let Some(name) = entry.file_name().to_str() {
                    self.stop_disable_delete(name).await?;
                }
            }
            remove_ignore_missing(&units_dir)?;
        }
        remove_ignore_missing(&self.paths.services())?;
        if images {
            remove_ignore_missing(&self.paths.images())?;
        }
        self.manager.reload().await
    }

    fn prepare_directories(&self) -> Result<()> {
        for dir in [
            self.paths.volumes(),
            self.paths.images(),
            self.paths.units(),
            self.paths.services(),
            self.paths.utils(),
        ] {
            std::fs::create_dir_all(&dir)
                .map_err(fs_err(format!("cannot create {}", dir.display())))?;
        }
        Ok(())
    }

    fn observed_units(&self) -> Result<BTreeSet<String>> {
        let units_dir = self.paths.units();
        let entries = std::fs::read_dir(&units_dir)
            .map_err(fs_err(format!("cannot list {}", units_dir.display())))?;
        let mut units = BTreeSet::new();
        for entry in entries {
            let entry = entry.map_err(fs_err(format!("cannot list {}", units_dir.display())))?;
            if let Some(name) = entry.file_name().to_str() {
                units.insert(name.to_string());
            }
        }
        Ok(units)
    }

    fn install_helpers(&self) -> Result<()> {
        write_if_changed(&self.paths.init(), INIT_BIN, 0o777)?;
        write_if_changed(&self.paths.nsenter(), NSENTER_SCRIPT.as_bytes(), 0o777)?;
        Ok(())
    }

    /// Write a unit file and register it with the manager.
    ///
    /// Always writes and always links/enables (both are idempotent); the
    /// return value reports whether the bytes changed.
    async fn write_link_unit(&self, name: &str, content: &str, enable: bool) -> Result<bool> {
        let path = self.paths.unit(name);
        let old = std::fs::read(&path).ok();
        let changed = old.as_deref() != Some(content.as_bytes());
        std::fs::write(&path, content)
            .map_err(|e| Error::unit(UnitOp::Write, format!("cannot write unit {name}: {e}")))?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644))
            .map_err(|e| Error::unit(UnitOp::Write, format!("cannot chmod unit {name}: {e}")))?;
        if enable {
            tracing::info!(unit = %name, "enabling unit");
            self.manager.enable_unit_files(&[path]).await?;
        } else {
            tracing::info!(unit = %name, "linking unit");
            self.manager.link_unit_files(&[path]).await?;
        }
        Ok(changed)
    }

    async fn unit_status(&self, name: &str) -> Result<UnitStatus> {
        let statuses = self
            .manager
            .list_units_by_name(&[name.to_string()])
            .await?;
        statuses.into_iter().next().ok_or_else(|| {
            Error::runtime(RuntimeOp::List, format!("no status returned for {name}"))
        })
    }

    async fn wait_job(
        &self,
        rx: oneshot::Receiver<String>,
        op: RuntimeOp,
        name: &str,
    ) -> Result<()> {
        match timeout(JOB_TIMEOUT, rx).await {
            Err(_) => Err(Error::runtime(
                op,
                format!("timed out waiting for job on {name}"),
            )),
            Ok(Err(_)) => Err(Error::runtime(
                op,
                format!("job completion channel for {name} closed"),
            )),
            Ok(Ok(status)) if status == "done" => Ok(()),
            Ok(Ok(status)) => Err(Error::runtime(
                op,
                format!("job for {name} finished with status {status}"),
            )),
        }
    }

    async fn start_unit(&self, name: &str) -> Result<()> {
        tracing::info!(unit = %name, "starting unit");
        let rx = self.manager.start_unit(name, MODE_REPLACE).await?;
        self.wait_job(rx, RuntimeOp::Start, name).await
    }

    async fn stop_unit_if_active(&self, name: &str) -> Result<()> {
        let status = self.unit_status(name).await?;
        if !status.is_active() {
            return Ok(());
        }
        tracing::info!(unit = %name, "stopping unit");
        let rx = self.manager.stop_unit(name, MODE_REPLACE).await?;
        self.wait_job(rx, RuntimeOp::Stop, name).await
    }

    async fn stop_disable_delete(&self, name: &str) -> Result<()> {
        tracing::info!(unit = %name, "removing unit");
        let status = self.unit_status(name).await?;
        if status.is_active() {
            let rx = self.manager.stop_unit(name, MODE_REPLACE).await?;
            self.wait_job(rx, RuntimeOp::Stop, name).await?;
        }
        if status.is_loaded() {
            self.manager
                .disable_unit_files(&[name.to_string()])
                .await?;
        }
        remove_ignore_missing(&self.paths.unit(name))
    }

    /// The resolved start command line: configured, or the image entrypoint.
    fn resolve_start(&self, service: &Service) -> Result<Vec<String>> {
        if !service.exec.start.is_empty() {
            return Ok(service.exec.start.clone());
        }
        let spec = self.store.read_metadata(&service.image.from)?;
        Ok(spec.args().to_vec())
    }

    /// Rebuild `services/<name>/` when the service's snapshot changed.
    ///
    /// Returns whether anything was rebuilt. The snapshot is written last so
    /// a failed rebuild is retried on the next pass.
    async fn service_artifacts(&self, service: &Service) -> Result<bool> {
        let dir = self.paths.service(&service.name);
        let conf_path = dir.join("conf.cue");
        let snapshot = serde_json::to_vec_pretty(service).map_err(|e| {
            Error::filesystem(
                format!("cannot serialize snapshot of {}", service.name),
                std::io::Error::other(e),
            )
        })?;
        let old = std::fs::read(&conf_path).ok();
        if old.as_deref() == Some(snapshot.as_slice()) {
            return Ok(false);
        }

        tracing::info!(service = %service.name, "rebuilding service artifacts");
        self.stop_unit_if_active(&service.unit_name()).await?;
        remove_ignore_missing(&dir)?;
        let files_dir = dir.join("files");
        std::fs::create_dir_all(&files_dir)
            .map_err(fs_err(format!("cannot create {}", files_dir.display())))?;

        for (overlay, file) in &service.image.files {
            let full = units::overlay_source(&self.paths, &service.name, overlay);
            if let Some(parent) = full.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(fs_err(format!("cannot create {}", parent.display())))?;
            }
            std::fs::write(&full, file.content.as_bytes())
                .map_err(fs_err(format!("cannot write {}", full.display())))?;
            std::fs::set_permissions(
                &full,
                std::fs::Permissions::from_mode(u32::from(file.permissions)),
            )
            .map_err(fs_err(format!("cannot chmod {}", full.display())))?;
        }

        let mut spec = self.store.read_metadata(&service.image.from)?;
        for (key, value) in &service.image.env {
            spec.append_env(key, value);
        }
        if service.service_type != ServiceType::Oneshot {
            spec.append_env("NOTIFY_SOCKET", "/run/systemd/notify");
        }
        if !service.net.private {
            spec.drop_namespace("network");
        }
        spec.append_bounding_cap("CAP_CHOWN");
        spec.set_root_path(&self.store.rootfs_dir(&service.image.from));

        let spec_bytes = serde_json::to_vec_pretty(&spec).map_err(|e| {
            Error::filesystem(
                format!("cannot serialize config.json of {}", service.name),
                std::io::Error::other(e),
            )
        })?;
        std::fs::write(dir.join("config.json"), spec_bytes)
            .map_err(fs_err(format!("cannot write config.json of {}", service.name)))?;

        std::fs::write(&conf_path, &snapshot)
            .map_err(fs_err(format!("cannot write snapshot of {}", service.name)))?;
        Ok(true)
    }

    /// Synthesize `/etc/hosts` for every service.
    ///
    /// Private services see the blocks of the bridges they are attached to;
    /// host-network services see every bridge's block.
    fn write_hosts(&self, config: &Config) -> Result<()> {
        let mut blocks: BTreeMap<&str, String> = BTreeMap::new();
        for (name, svc) in &config.services {
            if !svc.net.private {
                continue;
            }
            for iface in svc.net.interfaces.values() {
                blocks
                    .entry(iface.bridge.name.as_str())
                    .or_default()
                    .push_str(&format!("{}\t{}\n", iface.ip, name));
            }
        }
        for (name, svc) in &config.services {
            let mut text = String::from(HOSTS_PREAMBLE);
            if svc.net.private {
                for iface in svc.net.interfaces.values() {
                    if let Some(block) = blocks.get(iface.bridge.name.as_str()) {
                        text.push_str(block);
                    }
                }
            } else {
                for block in blocks.values() {
                    text.push_str(block);
                }
            }
            let dir = self.paths.service(name);
            std::fs::create_dir_all(&dir)
                .map_err(fs_err(format!("cannot create {}", dir.display())))?;
            write_if_changed(&dir.join("hosts"), text.as_bytes(), 0o666)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sloop_core::model::{Bridge, Exec, Image, Network, Timer};

    fn minimal_service(name: &str) -> Service {
        Service {
            name: name.into(),
            image: Image {
                from: "alpine:3".into(),
                files: BTreeMap::new(),
                env: BTreeMap::new(),
                volumes: vec![],
            },
            exec: Exec::default(),
            net: Network::default(),
            service_type: ServiceType::Oneshot,
            enable: true,
            capabilities: vec![],
            wants: vec![],
            requires: vec![],
            after: vec![],
        }
    }

    #[test]
    fn test_desired_units_covers_every_object() {
        let mut config = Config::default();
        config
            .services
            .insert("web".into(), minimal_service("web"));
        config.bridges.insert(
            "br0".into(),
            Bridge {
                name: "br0".into(),
                ip: "10.0.0.1".parse().unwrap(),
                prefix: 24,
            },
        );
        config.timers.insert(
            "tick".into(),
            Timer {
                name: "tick".into(),
                run: vec![],
                on_calendar: vec![],
                on_active_sec: vec![],
                persistent: true,
            },
        );
        let units = desired_units(&config);
        let expected: BTreeSet<String> = [
            "sloop.target",
            "sloop.slice",
            "web.service",
            "tick.timer",
            "tick.service",
            "sloop-bridge-br0.service",
        ]
        .into_iter()
        .map(String::from)
        .collect();
        assert_eq!(units, expected);
    }

    #[test]
    fn test_desired_units_empty_config_keeps_singletons() {
        let units = desired_units(&Config::default());
        assert_eq!(units.len(), 2);
        assert!(units.contains("sloop.target"));
        assert!(units.contains("sloop.slice"));
    }

    #[test]
    fn test_write_if_changed_detects_identical_bytes() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("helper");
        assert!(write_if_changed(&path, b"payload", 0o777).unwrap());
        assert!(!write_if_changed(&path, b"payload", 0o777).unwrap());
        assert!(write_if_changed(&path, b"payload2", 0o777).unwrap());
    }
}
