//! Mesh node identity and capabilities.
//!
//! Base labels are auto-computed from the platform (OS and architecture,
//! normalized), user labels come from `SYKLI_LABELS`. Capabilities carry
//! label set, CPU count, memory, and container-runtime availability.

pub mod coordinator;
pub mod discovery;
pub mod placement;
pub mod rpc;
pub mod verify;

use serde::{Deserialize, Serialize};

use crate::config::Config;

/// What a daemon instance does for the mesh.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    /// Worker and coordinator both.
    #[default]
    Full,
    Worker,
    Coordinator,
}

impl NodeRole {
    pub fn accepts_tasks(&self) -> bool {
        matches!(self, NodeRole::Full | NodeRole::Worker)
    }

    pub fn coordinates(&self) -> bool {
        matches!(self, NodeRole::Full | NodeRole::Coordinator)
    }
}

impl std::str::FromStr for NodeRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(NodeRole::Full),
            "worker" => Ok(NodeRole::Worker),
            "coordinator" => Ok(NodeRole::Coordinator),
            other => Err(format!(
                "unknown role '{}'; expected full, worker, or coordinator",
                other
            )),
        }
    }
}

/// What a node can do.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub labels: Vec<String>,
    pub cpus: usize,
    pub memory_mb: u64,
    /// Container-runtime availability.
    pub docker: bool,
}

/// One node's advertisement on the mesh.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeProfile {
    pub name: String,
    pub role: NodeRole,
    pub host: String,
    pub port: u16,
    pub capabilities: Capabilities,
}

/// OS label: `darwin | linux | windows | unix`.
pub fn os_label() -> &'static str {
    match std::env::consts::OS {
        "macos" => "darwin",
        "linux" => "linux",
        "windows" => "windows",
        _ => "unix",
    }
}

/// Architecture label: `arm64 | amd64 | <raw>`.
pub fn arch_label() -> &'static str {
    match std::env::consts::ARCH {
        "aarch64" => "arm64",
        "x86_64" => "amd64",
        raw => raw,
    }
}

/// Auto-detected base labels plus user labels, deduplicated in order.
pub fn all_labels(user_labels: &[String]) -> Vec<String> {
    let mut labels = vec![os_label().to_string(), arch_label().to_string()];
    for label in user_labels {
        if !labels.contains(label) {
            labels.push(label.clone());
        }
    }
    labels
}

/// Build this machine's profile.
pub fn detect_profile(config: &Config, role: NodeRole) -> NodeProfile {
    let name = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string());

    NodeProfile {
        name,
        role,
        host: "0.0.0.0".to_string(),
        port: config.port,
        capabilities: Capabilities {
            labels: all_labels(&config.labels),
            cpus: num_cpus::get(),
            memory_mb: detect_memory_mb(),
            docker: docker_available(),
        },
    }
}

#[cfg(target_os = "linux")]
fn detect_memory_mb() -> u64 {
    std::fs::read_to_string("/proc/meminfo")
        .ok()
        .and_then(|content| {
            content.lines().find_map(|line| {
                line.strip_prefix("MemTotal:")?
                    .trim()
                    .split_whitespace()
                    .next()?
                    .parse::<u64>()
                    .ok()
            })
        })
        .map(|kb| kb / 1024)
        .unwrap_or(0)
}

#[cfg(not(target_os = "linux"))]
fn detect_memory_mb() -> u64 {
    0
}

fn docker_available() -> bool {
    std::process::Command::new("docker")
        .arg("--version")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_labels_are_normalized() {
        let os = os_label();
        assert!(["darwin", "linux", "windows", "unix"].contains(&os));
        let arch = arch_label();
        assert!(!arch.is_empty());
        assert_ne!(arch, "aarch64");
        assert_ne!(arch, "x86_64");
    }

    #[test]
    fn user_labels_append_without_duplicates() {
        let labels = all_labels(&["gpu".to_string(), os_label().to_string()]);
        assert_eq!(labels.iter().filter(|l| *l == os_label()).count(), 1);
        assert!(labels.contains(&"gpu".to_string()));
        assert_eq!(labels[0], os_label());
    }

    #[test]
    fn roles_parse_and_classify() {
        use std::str::FromStr;
        assert_eq!(NodeRole::from_str("worker").unwrap(), NodeRole::Worker);
        assert!(NodeRole::from_str("boss").is_err());

        assert!(NodeRole::Full.accepts_tasks());
        assert!(NodeRole::Full.coordinates());
        assert!(NodeRole::Worker.accepts_tasks());
        assert!(!NodeRole::Worker.coordinates());
        assert!(!NodeRole::Coordinator.accepts_tasks());
    }

    #[test]
    fn profile_serializes_role_snake_case() {
        let profile = NodeProfile {
            name: "n1".to_string(),
            role: NodeRole::Coordinator,
            ..NodeProfile::default()
        };
        let json = serde_json::to_value(&profile).unwrap();
        assert_eq!(json["role"], "coordinator");
    }
}
