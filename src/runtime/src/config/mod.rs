//! Configuration loading and resolution.
//!
//! The constraint language itself is evaluated by an external compiler (the
//! `cue` CLI) behind the [`Evaluator`] seam; everything downstream of the
//! evaluated value is handled here: schema decoding, name normalization,
//! cross-object validation, and deterministic IP injection.

mod inject;
mod raw;

use std::path::Path;
use std::process::Command;

use serde_json::Value;

use sloop_core::error::{ConfigPhase, Error, Result};
use sloop_core::model::Config;

pub use inject::inject_ips;

/// Evaluates a configuration root into a single concrete value.
///
/// This is the out-of-scope constraint compiler: it owns the `load` and
/// `build` phases, and nothing else.
pub trait Evaluator: Send + Sync {
    fn evaluate(&self, root: &Path) -> Result<Value>;
}

/// Production evaluator shelling out to the `cue` CLI.
pub struct CueCli;

impl Evaluator for CueCli {
    fn evaluate(&self, root: &Path) -> Result<Value> {
        if !root.is_dir() {
            return Err(Error::config(
                ConfigPhase::Load,
                format!("configuration root {} is not a directory", root.display()),
            ));
        }
        let output = Command::new("cue")
            .args(["export", "--out", "json", "."])
            .current_dir(root)
            .output()
            .map_err(|e| {
                Error::config_with(
                    ConfigPhase::Load,
                    "cannot run the cue evaluator (is cue installed?)",
                    e,
                )
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::config(
                ConfigPhase::Build,
                format!("cue evaluation failed:\n{}", stderr.trim_end()),
            ));
        }
        serde_json::from_slice(&output.stdout).map_err(|e| {
            Error::config_with(ConfigPhase::Build, "cue emitted invalid JSON", e)
        })
    }
}

/// Configuration loader: evaluator plus the resolution pipeline.
pub struct Loader {
    evaluator: Box<dyn Evaluator>,
}

impl Default for Loader {
    fn default() -> Self {
        Self::new()
    }
}

impl Loader {
    pub fn new() -> Self {
        Self {
            evaluator: Box::new(CueCli),
        }
    }

    pub fn with_evaluator(evaluator: Box<dyn Evaluator>) -> Self {
        Self { evaluator }
    }

    /// The evaluated pre-decode value, as used by `sloop print`.
    pub fn raw(&self, root: &Path) -> Result<Value> {
        self.evaluator.evaluate(root)
    }

    /// Full pipeline: evaluate, decode, validate, inject IPs.
    pub fn load(&self, root: &Path) -> Result<Config> {
        let value = self.evaluator.evaluate(root)?;
        resolve(&value)
    }
}

/// Resolve an evaluated value into the typed desired state.
pub fn resolve(value: &Value) -> Result<Config> {
    let raw: raw::RawConfig = serde_json::from_value(value.clone()).map_err(|e| {
        Error::config_with(
            ConfigPhase::Constrain,
            "configuration does not match the schema",
            e,
        )
    })?;
    let volumes = raw::convert_volumes(raw.volumes)?;
    let bridges = raw::convert_bridges(raw.bridges)?;
    let services = raw::convert_services(raw.services, &bridges)?;
    let timers = raw::convert_timers(raw.timers)?;
    let mut config = Config {
        volumes,
        bridges,
        services,
        timers,
    };
    validate(&config)?;
    inject_ips(&mut config)?;
    Ok(config)
}

/// Cross-object invariants that the per-object conversions cannot see.
fn validate(config: &Config) -> Result<()> {
    for (sname, svc) in &config.services {
        for mapping in &svc.image.volumes {
            if mapping.name.starts_with('/') {
                continue;
            }
            if !config.volumes.contains_key(&mapping.name) {
                return Err(Error::config(
                    ConfigPhase::Validate,
                    format!(
                        "service {sname} binds unknown volume {} at {}",
                        mapping.name,
                        mapping.dest.display()
                    ),
                ));
            }
        }
    }
    for (tname, timer) in &config.timers {
        if config.services.contains_key(tname) {
            return Err(Error::config(
                ConfigPhase::Validate,
                format!("timer {tname} collides with a service of the same name"),
            ));
        }
        for run in &timer.run {
            if !config.services.contains_key(&run.service) {
                return Err(Error::config(
                    ConfigPhase::Validate,
                    format!("timer {tname} runs unknown service {}", run.service),
                ));
            }
        }
    }
    Ok(())
}

/// Look up a dotted path (`services.web.image`) in an evaluated value.
///
/// Numeric components index into arrays. An empty path is the whole value.
pub fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    let mut cur = value;
    for part in path.split('.') {
        cur = match cur {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(cur)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sloop_core::model::{Dependency, ServiceType};

    struct Static(Value);

    impl Evaluator for Static {
        fn evaluate(&self, _root: &Path) -> Result<Value> {
            Ok(self.0.clone())
        }
    }

    fn sample() -> Value {
        json!({
            "volumes": {"db_data": {}},
            "bridges": {"br0": {"ip": "10.0.0.1", "prefix": 24}},
            "services": {
                "hello": {
                    "image": {
                        "from": "alpine:3",
                        "volumes": {"/var/lib/db": "db-data"}
                    },
                    "exec": {"start": ["/bin/sh", "-c", "sleep 1"]},
                    "type": "oneshot",
                    "net": {"interfaces": {"eth0": {"bridge": "br0"}}},
                    "after": ["db", "network-online.target"]
                }
            },
            "timers": {
                "tick": {
                    "run": [{"service": "hello", "action": "start"}],
                    "onCalendar": ["daily"]
                }
            }
        })
    }

    #[test]
    fn test_resolve_full_pipeline() {
        let config = resolve(&sample()).unwrap();
        assert!(config.volumes.contains_key("db-data"));
        let svc = &config.services["hello"];
        assert_eq!(svc.service_type, ServiceType::Oneshot);
        assert_eq!(svc.after[0], Dependency::Service("db".into()));
        let iface = &svc.net.interfaces["eth0"];
        assert!(!iface.is_unassigned(), "IP injection ran");
        assert_eq!(config.timers["tick"].run[0].service, "hello");
    }

    #[test]
    fn test_loader_with_static_evaluator() {
        let loader = Loader::with_evaluator(Box::new(Static(sample())));
        let config = loader.load(Path::new("/nonexistent")).unwrap();
        assert!(config.services.contains_key("hello"));
    }

    #[test]
    fn test_unknown_volume_ref_fails_validate() {
        let mut value = sample();
        value["services"]["hello"]["image"]["volumes"] = json!({"/var/lib/db": "nope"});
        let err = resolve(&value).unwrap_err();
        assert!(err.to_string().starts_with("[config.validate]"), "{err}");
    }

    #[test]
    fn test_absolute_volume_ref_needs_no_declaration() {
        let mut value = sample();
        value["services"]["hello"]["image"]["volumes"] = json!({"/var/lib/db": "/srv/db"});
        assert!(resolve(&value).is_ok());
    }

    #[test]
    fn test_unknown_timer_service_fails_validate() {
        let mut value = sample();
        value["timers"]["tick"]["run"] = json!([{"service": "ghost", "action": "start"}]);
        let err = resolve(&value).unwrap_err();
        assert!(err.to_string().starts_with("[config.validate]"), "{err}");
    }

    #[test]
    fn test_timer_service_name_collision_rejected() {
        let mut value = sample();
        value["timers"] = json!({
            "hello": {"run": [{"service": "hello", "action": "reload"}]}
        });
        let err = resolve(&value).unwrap_err();
        assert!(err.to_string().starts_with("[config.validate]"), "{err}");
    }

    #[test]
    fn test_schema_violation_is_constrain_error() {
        let err = resolve(&json!({"services": {"x": {}}})).unwrap_err();
        assert!(err.to_string().starts_with("[config.constrain]"), "{err}");
    }

    #[test]
    fn test_lookup_dotted_path() {
        let value = sample();
        let sub = lookup(&value, "services.hello.image.from").unwrap();
        assert_eq!(sub, &json!("alpine:3"));
        let start = lookup(&value, "services.hello.exec.start.1").unwrap();
        assert_eq!(start, &json!("-c"));
        assert!(lookup(&value, "services.nope").is_none());
        assert_eq!(lookup(&value, ""), Some(&value));
    }

    #[test]
    fn test_missing_root_is_load_error() {
        let err = CueCli
            .evaluate(Path::new("/definitely/not/here"))
            .unwrap_err();
        assert!(err.to_string().starts_with("[config.load]"), "{err}");
    }
}
