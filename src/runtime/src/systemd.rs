//! Service manager control.
//!
//! A thin, trait-shaped wrapper over the host's systemd so the reconciler can
//! be driven against a recording fake in tests. `start`/`stop` are job-based:
//! they hand back a one-shot channel carrying the job's final status string,
//! and the caller must treat anything other than `done` as a failure.

use std::path::PathBuf;
use std::process::Output;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::oneshot;

use sloop_core::error::{Error, Result, RuntimeOp, UnitOp};

/// The only job mode sloop uses.
pub const MODE_REPLACE: &str = "replace";

/// Observed state of one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitStatus {
    pub name: String,
    pub active_state: String,
    pub load_state: String,
}

impl UnitStatus {
    pub fn is_active(&self) -> bool {
        self.active_state == "active"
    }

    pub fn is_loaded(&self) -> bool {
        self.load_state != "not-found"
    }
}

/// Synchronous-feeling wrappers over the service manager.
#[async_trait]
pub trait Manager: Send + Sync {
    async fn list_units_by_name(&self, names: &[String]) -> Result<Vec<UnitStatus>>;
    async fn link_unit_files(&self, paths: &[PathBuf]) -> Result<()>;
    async fn enable_unit_files(&self, paths: &[PathBuf]) -> Result<()>;
    async fn disable_unit_files(&self, names: &[String]) -> Result<()>;
    async fn reload(&self) -> Result<()>;
    async fn start_unit(&self, name: &str, mode: &str) -> Result<oneshot::Receiver<String>>;
    async fn stop_unit(&self, name: &str, mode: &str) -> Result<oneshot::Receiver<String>>;
}

/// Production manager shelling out to `systemctl`.
#[derive(Debug, Default)]
pub struct SystemctlManager;

impl SystemctlManager {
    pub fn new() -> Self {
        Self
    }
}

async fn systemctl(args: &[&str]) -> std::io::Result<Output> {
    Command::new("systemctl").args(args).output().await
}

fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim_end().to_string()
}

/// Parse `systemctl show -p ActiveState,LoadState` output.
///
/// Unknown units still produce a successful `show` with
/// `LoadState=not-found`, so missing properties default conservatively.
fn parse_show_output(name: &str, out: &str) -> UnitStatus {
    let mut active_state = "inactive".to_string();
    let mut load_state = "not-found".to_string();
    for line in out.lines() {
        if let Some(v) = line.strip_prefix("ActiveState=") {
            active_state = v.trim().to_string();
        } else if let Some(v) = line.strip_prefix("LoadState=") {
            load_state = v.trim().to_string();
        }
    }
    UnitStatus {
        name: name.to_string(),
        active_state,
        load_state,
    }
}

/// Spawn a job and forward its completion status into a one-shot channel.
fn job(verb: &'static str, name: &str, mode: &str) -> oneshot::Receiver<String> {
    let (tx, rx) = oneshot::channel();
    let name = name.to_string();
    let job_mode = format!("--job-mode={mode}");
    tokio::spawn(async move {
        let status = match systemctl(&[verb, &job_mode, &name]).await {
            Ok(out) if out.status.success() => "done".to_string(),
            Ok(out) => {
                tracing::warn!(unit = %name, verb, stderr = %stderr_of(&out), "job failed");
                "failed".to_string()
            }
            Err(e) => {
                tracing::warn!(unit = %name, verb, error = %e, "cannot run systemctl");
                "failed".to_string()
            }
        };
        let _ = tx.send(status);
    });
    rx
}

#[async_trait]
impl Manager for SystemctlManager {
    async fn list_units_by_name(&self, names: &[String]) -> Result<Vec<UnitStatus>> {
        let mut statuses = Vec::with_capacity(names.len());
        for name in names {
            let out = systemctl(&["show", name, "--property=ActiveState,LoadState", "--no-pager"])
                .await
                .map_err(|e| {
                    Error::runtime(RuntimeOp::List, format!("cannot run systemctl show: {e}"))
                })?;
            if !out.status.success() {
                return Err(Error::runtime(
                    RuntimeOp::List,
                    format!("systemctl show {name} failed: {}", stderr_of(&out)),
                ));
            }
            statuses.push(parse_show_output(name, &String::from_utf8_lossy(&out.stdout)));
        }
        Ok(statuses)
    }

    async fn link_unit_files(&self, paths: &[PathBuf]) -> Result<()> {
        let mut args = vec!["link".to_string(), "--force".to_string()];
        args.extend(paths.iter().map(|p| p.display().to_string()));
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let out = systemctl(&arg_refs)
            .await
            .map_err(|e| Error::unit(UnitOp::Link, format!("cannot run systemctl link: {e}")))?;
        if !out.status.success() {
            return Err(Error::unit(
                UnitOp::Link,
                format!("systemctl link failed: {}", stderr_of(&out)),
            ));
        }
        Ok(())
    }

    async fn enable_unit_files(&self, paths: &[PathBuf]) -> Result<()> {
        let mut args = vec!["enable".to_string(), "--force".to_string()];
        args.extend(paths.iter().map(|p| p.display().to_string()));
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let out = systemctl(&arg_refs).await.map_err(|e| {
            Error::unit(UnitOp::Enable, format!("cannot run systemctl enable: {e}"))
        })?;
        if !out.status.success() {
            return Err(Error::unit(
                UnitOp::Enable,
                format!("systemctl enable failed: {}", stderr_of(&out)),
            ));
        }
        Ok(())
    }

    async fn disable_unit_files(&self, names: &[String]) -> Result<()> {
        let mut args = vec!["disable".to_string()];
        args.extend(names.iter().cloned());
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let out = systemctl(&arg_refs).await.map_err(|e| {
            Error::unit(UnitOp::Disable, format!("cannot run systemctl disable: {e}"))
        })?;
        if !out.status.success() {
            return Err(Error::unit(
                UnitOp::Disable,
                format!("systemctl disable failed: {}", stderr_of(&out)),
            ));
        }
        Ok(())
    }

    async fn reload(&self) -> Result<()> {
        let out = systemctl(&["daemon-reload"]).await.map_err(|e| {
            Error::runtime(RuntimeOp::Reload, format!("cannot run daemon-reload: {e}"))
        })?;
        if !out.status.success() {
            return Err(Error::runtime(
                RuntimeOp::Reload,
                format!("daemon-reload failed: {}", stderr_of(&out)),
            ));
        }
        Ok(())
    }

    async fn start_unit(&self, name: &str, mode: &str) -> Result<oneshot::Receiver<String>> {
        Ok(job("start", name, mode))
    }

    async fn stop_unit(&self, name: &str, mode: &str) -> Result<oneshot::Receiver<String>> {
        Ok(job("stop", name, mode))
    }
}
