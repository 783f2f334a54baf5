//! Typed desired-state model.
//!
//! This is what the config loader produces and the reconciler consumes. All
//! maps are `BTreeMap` so that every serialization derived from the model
//! (unit text, `conf.cue` snapshots, hosts files) is deterministic.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// Sentinel meaning "no address assigned yet"; resolved by IP injection.
pub const UNASSIGNED_IP: Ipv4Addr = Ipv4Addr::new(0, 0, 0, 0);

/// Normalize an object name into a unit-file basename component.
///
/// Underscores are valid in config keys but not wanted in unit names.
pub fn normalize_name(name: &str) -> String {
    name.replace('_', "-")
}

/// A logical bind destination.
///
/// Names starting with `/` are absolute host paths not owned by sloop;
/// anything else is a managed directory under `<base>/volumes/<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub name: String,
}

impl Volume {
    /// Whether this volume is an absolute host path rather than a managed
    /// directory.
    pub fn is_host_path(&self) -> bool {
        self.name.starts_with('/')
    }
}

/// A Linux bridge owning the subnet `ip/prefix`.
///
/// `ip` is the bridge's own address and the default gateway for attached
/// interfaces. Interfaces embed a copy of this value as their bridge
/// reference, which keeps the model cycle-free.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bridge {
    pub name: String,
    pub ip: Ipv4Addr,
    pub prefix: u8,
}

impl Bridge {
    /// Unit basename of the service that materializes this bridge.
    pub fn unit_name(&self) -> String {
        format!("sloop-bridge-{}.service", self.name)
    }

    /// Half-open `[start, end)` range of the subnet as integers.
    ///
    /// `end` is `u64` because a wide prefix on a high subnet would overflow
    /// `u32`. Fails on prefixes outside `1..=31`.
    pub fn subnet_range(&self) -> Result<(u64, u64)> {
        if self.prefix == 0 || self.prefix > 31 {
            return Err(Error::ip(format!(
                "bridge {} has invalid prefix /{}",
                self.name, self.prefix
            )));
        }
        let mask = (!0u32) << (32 - self.prefix);
        let start = u64::from(u32::from(self.ip) & mask);
        let end = start + (1u64 << (32 - self.prefix));
        Ok((start, end))
    }

    /// Subnet base address (`10.0.0.1/24` -> `10.0.0.0`).
    pub fn network(&self) -> Result<Ipv4Addr> {
        let (start, _) = self.subnet_range()?;
        Ok(Ipv4Addr::from(start as u32))
    }
}

/// An endpoint attached to exactly one bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    pub name: String,
    pub ip: Ipv4Addr,
    pub bridge: Bridge,
}

impl Interface {
    pub fn is_unassigned(&self) -> bool {
        self.ip == UNASSIGNED_IP
    }
}

/// A service's network stance.
///
/// `private=true` runs the service in a fresh network namespace with the
/// listed interfaces; `private=false` shares the host namespace and
/// `interfaces` is empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Network {
    pub private: bool,
    pub interfaces: BTreeMap<String, Interface>,
}

/// An overlay file installed into the container rootfs via bind mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct File {
    pub content: String,
    pub permissions: u16,
}

/// One volume bind: `name` resolves per `Volume`, `dest` is the mount point
/// inside the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMapping {
    pub name: String,
    pub dest: PathBuf,
}

/// Image stanza of a service: base reference plus overlays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    /// Reference of the form `repo:tag`.
    pub from: String,
    pub files: BTreeMap<PathBuf, File>,
    pub env: BTreeMap<String, String>,
    /// Ordered by `dest` (sorted raw map keys).
    pub volumes: Vec<VolumeMapping>,
}

/// Start and reload command lines. An empty `start` means "use the OCI image
/// entrypoint".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Exec {
    pub start: Vec<String>,
    pub reload: Vec<String>,
}

/// Service unit type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    #[default]
    Simple,
    Notify,
    Oneshot,
}

/// A dependency is either a literal unit name (ends in
/// `.service`/`.target`/`.socket`) or a bare service reference, disambiguated
/// syntactically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dependency {
    Unit(String),
    Service(String),
}

impl Dependency {
    pub fn parse(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        if raw.ends_with(".service") || raw.ends_with(".target") || raw.ends_with(".socket") {
            Dependency::Unit(raw)
        } else {
            Dependency::Service(raw)
        }
    }

    /// The string as it appeared in the configuration.
    pub fn raw(&self) -> &str {
        match self {
            Dependency::Unit(s) | Dependency::Service(s) => s,
        }
    }

    /// Fully qualified unit name: the literal verbatim, or the bare service
    /// name suffixed `.service`.
    pub fn unit_name(&self) -> String {
        match self {
            Dependency::Unit(s) => s.clone(),
            Dependency::Service(s) => format!("{s}.service"),
        }
    }
}

impl Serialize for Dependency {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.raw())
    }
}

impl<'de> Deserialize<'de> for Dependency {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Dependency::parse(raw))
    }
}

/// A containerized service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    pub image: Image,
    pub exec: Exec,
    pub net: Network,
    #[serde(rename = "type")]
    pub service_type: ServiceType,
    pub enable: bool,
    pub capabilities: Vec<String>,
    pub wants: Vec<Dependency>,
    pub requires: Vec<Dependency>,
    pub after: Vec<Dependency>,
}

impl Service {
    pub fn unit_name(&self) -> String {
        format!("{}.service", self.name)
    }
}

/// What a timer does when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimerAction {
    Start,
    Reload,
}

/// One entry of a timer's run list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerRun {
    /// Name of a configured service.
    pub service: String,
    pub action: TimerAction,
}

/// A periodic timer driving one or more services.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timer {
    pub name: String,
    pub run: Vec<TimerRun>,
    pub on_calendar: Vec<String>,
    pub on_active_sec: Vec<String>,
    pub persistent: bool,
}

impl Timer {
    pub fn timer_unit_name(&self) -> String {
        format!("{}.timer", self.name)
    }

    /// The paired oneshot service that the timer activates.
    pub fn service_unit_name(&self) -> String {
        format!("{}.service", self.name)
    }
}

/// The desired state: four maps keyed by (normalized) object name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Config {
    pub volumes: BTreeMap<String, Volume>,
    pub bridges: BTreeMap<String, Bridge>,
    pub services: BTreeMap<String, Service>,
    pub timers: BTreeMap<String, Timer>,
}
