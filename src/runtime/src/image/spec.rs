//! Partial OCI runtime spec.
//!
//! Only the fields sloop edits are modeled; everything else is round-tripped
//! untouched through flattened maps. This keeps the `config.json` mutation
//! surgical: `process.env`, `process.capabilities.bounding`,
//! `linux.namespaces`, and `root.path` change, nothing else does.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OciSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process: Option<OciProcess>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<OciRoot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linux: Option<OciLinux>,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OciProcess {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<OciCapabilities>,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OciCapabilities {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounding: Option<Vec<String>>,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OciRoot {
    pub path: PathBuf,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OciLinux {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespaces: Option<Vec<OciNamespace>>,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OciNamespace {
    #[serde(rename = "type")]
    pub ns_type: String,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

impl OciSpec {
    /// The container's default command line.
    pub fn args(&self) -> &[String] {
        self.process
            .as_ref()
            .and_then(|p| p.args.as_deref())
            .unwrap_or(&[])
    }

    pub fn append_env(&mut self, key: &str, value: &str) {
        let process = self.process.get_or_insert_with(Default::default);
        process
            .env
            .get_or_insert_with(Vec::new)
            .push(format!("{key}={value}"));
    }

    pub fn append_bounding_cap(&mut self, cap: &str) {
        let process = self.process.get_or_insert_with(Default::default);
        let caps = process.capabilities.get_or_insert_with(Default::default);
        caps.bounding
            .get_or_insert_with(Vec::new)
            .push(cap.to_string());
    }

    /// Remove every namespace entry of the given type.
    pub fn drop_namespace(&mut self, ns_type: &str) {
        if let Some(linux) = &mut self.linux {
            if let Some(namespaces) = &mut linux.namespaces {
                namespaces.retain(|ns| ns.ns_type != ns_type);
            }
        }
    }

    pub fn set_root_path(&mut self, path: &Path) {
        let root = self.root.get_or_insert_with(Default::default);
        root.path = path.to_path_buf();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "ociVersion": "1.0.2",
            "hostname": "umoci-default",
            "process": {
                "terminal": true,
                "args": ["/bin/sh"],
                "env": ["PATH=/usr/bin"],
                "cwd": "/",
                "capabilities": {
                    "bounding": ["CAP_KILL"],
                    "effective": ["CAP_KILL"]
                }
            },
            "root": {"path": "rootfs", "readonly": false},
            "linux": {
                "namespaces": [
                    {"type": "pid"},
                    {"type": "network"},
                    {"type": "mount"}
                ],
                "maskedPaths": ["/proc/kcore"]
            },
            "mounts": [{"destination": "/proc", "type": "proc", "source": "proc"}]
        })
    }

    #[test]
    fn test_unknown_fields_round_trip() {
        let spec: OciSpec = serde_json::from_value(sample()).unwrap();
        let back = serde_json::to_value(&spec).unwrap();
        assert_eq!(back, sample());
    }

    #[test]
    fn test_mutations_are_surgical() {
        let mut spec: OciSpec = serde_json::from_value(sample()).unwrap();
        spec.append_env("FOO", "bar");
        spec.append_bounding_cap("CAP_CHOWN");
        spec.drop_namespace("network");
        spec.set_root_path(Path::new("/var/lib/sloop/images/alpine-3/rootfs"));

        let back = serde_json::to_value(&spec).unwrap();
        assert_eq!(back["process"]["env"], json!(["PATH=/usr/bin", "FOO=bar"]));
        assert_eq!(
            back["process"]["capabilities"]["bounding"],
            json!(["CAP_KILL", "CAP_CHOWN"])
        );
        // Effective set untouched.
        assert_eq!(
            back["process"]["capabilities"]["effective"],
            json!(["CAP_KILL"])
        );
        assert_eq!(
            back["linux"]["namespaces"],
            json!([{"type": "pid"}, {"type": "mount"}])
        );
        assert_eq!(
            back["root"]["path"],
            json!("/var/lib/sloop/images/alpine-3/rootfs")
        );
        // Everything not targeted by the edit is byte-identical.
        assert_eq!(back["ociVersion"], json!("1.0.2"));
        assert_eq!(back["hostname"], json!("umoci-default"));
        assert_eq!(back["process"]["terminal"], json!(true));
        assert_eq!(back["linux"]["maskedPaths"], json!(["/proc/kcore"]));
        assert_eq!(back["mounts"], sample()["mounts"]);
    }

    #[test]
    fn test_args_default_empty() {
        let spec = OciSpec::default();
        assert!(spec.args().is_empty());
    }
}
