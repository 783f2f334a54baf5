//! Raw configuration schema.
//!
//! The shape the constraint evaluator emits, before normalization. Serde
//! defaults implement the schema's optional fields and shorthands; the
//! conversion functions turn raw objects into the typed model, normalizing
//! names and qualifying dependencies.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use serde::Deserialize;

use sloop_core::error::{ConfigPhase, Error, Result};
use sloop_core::model::{
    normalize_name, Bridge, Dependency, Exec, File, Image, Interface, Network, Service,
    ServiceType, Timer, TimerAction, TimerRun, Volume, VolumeMapping, UNASSIGNED_IP,
};

/// Default mode for bare-string file shorthands.
const DEFAULT_FILE_MODE: u16 = 0o666;

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct RawConfig {
    #[serde(default)]
    pub volumes: BTreeMap<String, RawVolume>,
    #[serde(default)]
    pub bridges: BTreeMap<String, RawBridge>,
    #[serde(default)]
    pub services: BTreeMap<String, RawService>,
    #[serde(default)]
    pub timers: BTreeMap<String, RawTimer>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct RawVolume {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawBridge {
    #[serde(default)]
    pub name: Option<String>,
    pub ip: Ipv4Addr,
    pub prefix: u8,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawInterface {
    #[serde(default)]
    pub name: Option<String>,
    /// Only "bridge" interfaces exist today.
    #[serde(default, rename = "type")]
    pub if_type: Option<String>,
    #[serde(default)]
    pub ip: Option<Ipv4Addr>,
    pub bridge: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawNetwork {
    #[serde(default = "default_true")]
    pub private: bool,
    #[serde(default)]
    pub interfaces: BTreeMap<String, RawInterface>,
}

/// A file overlay: either a bare content string or the full form.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum RawFile {
    Inline(String),
    Full { content: String, permissions: u16 },
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawImage {
    pub from: String,
    #[serde(default)]
    pub files: BTreeMap<PathBuf, RawFile>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// `dest -> volume name`; ordering in the model follows the sorted keys.
    #[serde(default)]
    pub volumes: BTreeMap<PathBuf, String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct RawExec {
    #[serde(default)]
    pub start: Vec<String>,
    #[serde(default)]
    pub reload: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawService {
    #[serde(default)]
    pub name: Option<String>,
    pub image: RawImage,
    #[serde(default)]
    pub exec: RawExec,
    #[serde(default)]
    pub net: Option<RawNetwork>,
    #[serde(default, rename = "type")]
    pub service_type: ServiceType,
    #[serde(default = "default_true")]
    pub enable: bool,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub wants: Vec<String>,
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default)]
    pub after: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawTimerRun {
    pub service: String,
    pub action: TimerAction,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct RawTimer {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub run: Vec<RawTimerRun>,
    #[serde(default)]
    pub on_calendar: Vec<String>,
    #[serde(default)]
    pub on_active_sec: Vec<String>,
    #[serde(default = "default_true")]
    pub persistent: bool,
}

/// Service names become unit basenames, so they are restricted.
fn check_service_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-');
    if ok {
        Ok(())
    } else {
        Err(Error::config(
            ConfigPhase::Convert,
            format!("service name {name:?} does not match ^[A-Za-z0-9-]+$"),
        ))
    }
}

pub fn convert_volumes(raw: BTreeMap<String, RawVolume>) -> Result<BTreeMap<String, Volume>> {
    let mut volumes = BTreeMap::new();
    for (key, rv) in raw {
        let name = rv.name.unwrap_or_else(|| normalize_name(&key));
        if volumes
            .insert(name.clone(), Volume { name: name.clone() })
            .is_some()
        {
            return Err(Error::config(
                ConfigPhase::Decode,
                format!("duplicate volume name {name} after normalization"),
            ));
        }
    }
    Ok(volumes)
}

pub fn convert_bridges(raw: BTreeMap<String, RawBridge>) -> Result<BTreeMap<String, Bridge>> {
    let mut bridges = BTreeMap::new();
    for (key, rb) in raw {
        let name = rb.name.unwrap_or_else(|| normalize_name(&key));
        let bridge = Bridge {
            name: name.clone(),
            ip: rb.ip,
            prefix: rb.prefix,
        };
        if bridges.insert(name, bridge).is_some() {
            return Err(Error::config(
                ConfigPhase::Decode,
                format!("duplicate bridge name {key} after normalization"),
            ));
        }
    }
    Ok(bridges)
}

fn convert_net(
    raw: Option<RawNetwork>,
    bridges: &BTreeMap<String, Bridge>,
    service: &str,
) -> Result<Network> {
    let raw = match raw {
        None => return Ok(Network::default()),
        Some(raw) => raw,
    };
    if !raw.private {
        if !raw.interfaces.is_empty() {
            return Err(Error::config(
                ConfigPhase::Validate,
                format!("service {service} shares the host network but declares interfaces"),
            ));
        }
        return Ok(Network::default());
    }
    let mut interfaces = BTreeMap::new();
    for (key, ri) in raw.interfaces {
        if let Some(t) = &ri.if_type {
            if t != "bridge" {
                return Err(Error::config(
                    ConfigPhase::Constrain,
                    format!("interface {key} of service {service} has unsupported type {t:?}"),
                ));
            }
        }
        let bridge = bridges.get(&ri.bridge).cloned().ok_or_else(|| {
            Error::config(
                ConfigPhase::Validate,
                format!(
                    "interface {key} of service {service} references unknown bridge {}",
                    ri.bridge
                ),
            )
        })?;
        let name = ri.name.unwrap_or_else(|| key.clone());
        interfaces.insert(
            key,
            Interface {
                name,
                ip: ri.ip.unwrap_or(UNASSIGNED_IP),
                bridge,
            },
        );
    }
    Ok(Network {
        private: true,
        interfaces,
    })
}

fn convert_image(raw: RawImage) -> Image {
    let files = raw
        .files
        .into_iter()
        .map(|(path, rf)| {
            let file = match rf {
                RawFile::Inline(content) => File {
                    content,
                    permissions: DEFAULT_FILE_MODE,
                },
                RawFile::Full {
                    content,
                    permissions,
                } => File {
                    content,
                    permissions,
                },
            };
            (path, file)
        })
        .collect();
    let volumes = raw
        .volumes
        .into_iter()
        .map(|(dest, name)| VolumeMapping { name, dest })
        .collect();
    Image {
        from: raw.from,
        files,
        env: raw.env,
        volumes,
    }
}

pub fn convert_services(
    raw: BTreeMap<String, RawService>,
    bridges: &BTreeMap<String, Bridge>,
) -> Result<BTreeMap<String, Service>> {
    let mut services = BTreeMap::new();
    for (key, rs) in raw {
        let name = rs.name.unwrap_or_else(|| normalize_name(&key));
        check_service_name(&name)?;
        let net = convert_net(rs.net, bridges, &name)?;
        let service = Service {
            name: name.clone(),
            image: convert_image(rs.image),
            exec: Exec {
                start: rs.exec.start,
                reload: rs.exec.reload,
            },
            net,
            service_type: rs.service_type,
            enable: rs.enable,
            capabilities: rs.capabilities,
            wants: rs.wants.into_iter().map(Dependency::parse).collect(),
            requires: rs.requires.into_iter().map(Dependency::parse).collect(),
            after: rs.after.into_iter().map(Dependency::parse).collect(),
        };
        if services.insert(name.clone(), service).is_some() {
            return Err(Error::config(
                ConfigPhase::Decode,
                format!("duplicate service name {name} after normalization"),
            ));
        }
    }
    Ok(services)
}

pub fn convert_timers(raw: BTreeMap<String, RawTimer>) -> Result<BTreeMap<String, Timer>> {
    let mut timers = BTreeMap::new();
    for (key, rt) in raw {
        let name = rt.name.unwrap_or_else(|| normalize_name(&key));
        let timer = Timer {
            name: name.clone(),
            run: rt
                .run
                .into_iter()
                .map(|r| TimerRun {
                    service: r.service,
                    action: r.action,
                })
                .collect(),
            on_calendar: rt.on_calendar,
            on_active_sec: rt.on_active_sec,
            persistent: rt.persistent,
        };
        if timers.insert(name.clone(), timer).is_some() {
            return Err(Error::config(
                ConfigPhase::Decode,
                format!("duplicate timer name {name} after normalization"),
            ));
        }
    }
    Ok(timers)
}
