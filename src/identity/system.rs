//! Descriptors of the host machine folded into a new identity.

use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::env;

const ENV_VARS: [&str; 5] = ["PATH", "HOME", "USERPROFILE", "COMPUTERNAME", "HOSTNAME"];

fn hostname() -> String {
    env::var("HOSTNAME")
        .or_else(|_| env::var("COMPUTERNAME"))
        .ok()
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_string())
        })
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Collect descriptors of the current host.
///
/// Keys are sorted so the canonical form is stable across runs.
pub fn collect() -> BTreeMap<String, Value> {
    let mut info = BTreeMap::new();
    info.insert("system".to_string(), json!(env::consts::OS));
    info.insert("family".to_string(), json!(env::consts::FAMILY));
    info.insert("machine".to_string(), json!(env::consts::ARCH));
    info.insert("hostname".to_string(), json!(hostname()));
    info.insert(
        "username".to_string(),
        json!(env::var("USER")
            .or_else(|_| env::var("USERNAME"))
            .unwrap_or_else(|_| "unknown".to_string())),
    );
    info.insert(
        "livestamp_version".to_string(),
        json!(env!("CARGO_PKG_VERSION")),
    );

    if let Ok(cwd) = env::current_dir() {
        info.insert(
            "working_directory".to_string(),
            json!(cwd.display().to_string()),
        );
    }

    let environment: Map<String, Value> = ENV_VARS
        .iter()
        .filter_map(|var| {
            env::var(var)
                .ok()
                .filter(|v| !v.is_empty())
                .map(|v| (var.to_string(), json!(v)))
        })
        .collect();
    info.insert("environment".to_string(), Value::Object(environment));

    info
}
