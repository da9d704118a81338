//! Environment-driven configuration.
//!
//! All knobs come from the environment; there is no config file. Directories
//! live under `~/.sykli` (cache, daemon pid) and `<project>/.sykli` (run
//! history, occurrences, logs).

use std::path::PathBuf;

use crate::error::{Result, SykliError};

/// Default discovery/RPC base port.
pub const DEFAULT_PORT: u16 = 4369;

/// Run-level default task timeout (seconds); `0` means no limit.
pub const DEFAULT_TASK_TIMEOUT_SECS: u64 = 300;

/// Environment variables that participate in the cache fingerprint.
/// `PATH` is intentionally excluded.
pub const FINGERPRINT_ENV_VARS: &[&str] =
    &["GOPATH", "GOROOT", "CARGO_HOME", "NODE_ENV", "GOOS", "GOARCH"];

/// User labels appended to auto-detected node labels.
pub const LABELS_VAR: &str = "SYKLI_LABELS";
/// Discovery/RPC base port override.
pub const PORT_VAR: &str = "SYKLI_PORT";
/// Shared authentication token for inter-node RPC.
pub const COOKIE_VAR: &str = "SYKLI_COOKIE";

/// Resolved configuration snapshot, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// User labels from `SYKLI_LABELS` (comma-separated, trimmed).
    pub labels: Vec<String>,
    /// Discovery/RPC base port, validated to [1, 65535].
    pub port: u16,
    /// Shared mesh cookie; generated per daemon instance when unset.
    pub cookie: String,
}

impl Config {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            labels: parse_labels(std::env::var(LABELS_VAR).ok().as_deref()),
            port: parse_port(std::env::var(PORT_VAR).ok().as_deref())?,
            cookie: std::env::var(COOKIE_VAR)
                .ok()
                .filter(|c| !c.trim().is_empty())
                .unwrap_or_else(generate_cookie),
        })
    }
}

/// Parse a comma-separated label list, trimming and dropping empties.
pub fn parse_labels(raw: Option<&str>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

fn parse_port(raw: Option<&str>) -> Result<u16> {
    match raw {
        None => Ok(DEFAULT_PORT),
        Some(s) => {
            let n: u32 = s
                .trim()
                .parse()
                .map_err(|_| SykliError::Internal(format!("invalid {}: {:?}", PORT_VAR, s)))?;
            if n == 0 || n > 65535 {
                return Err(SykliError::Internal(format!(
                    "{} out of range [1, 65535]: {}",
                    PORT_VAR, n
                )));
            }
            Ok(n as u16)
        }
    }
}

/// Random per-daemon cookie: 32 hex chars.
fn generate_cookie() -> String {
    use rand::Rng;
    let bytes: [u8; 16] = rand::thread_rng().gen();
    hex::encode(bytes)
}

/// `~/.sykli` - cache and daemon state.
pub fn home_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".sykli")
}

/// `~/.sykli/cache` - content-addressed cache root.
pub fn cache_dir() -> PathBuf {
    home_dir().join("cache")
}

/// `~/.sykli/daemon.pid` - daemon pid file.
pub fn daemon_pid_path() -> PathBuf {
    home_dir().join("daemon.pid")
}

/// `<project>/.sykli` - run history, occurrences, logs.
pub fn project_state_dir(project_root: &std::path::Path) -> PathBuf {
    project_root.join(".sykli")
}

/// True when running under a CI system (the `CI` variable is present).
pub fn in_ci() -> bool {
    std::env::var_os("CI").is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_are_trimmed_and_filtered() {
        assert_eq!(
            parse_labels(Some(" docker , linux ,, gpu ")),
            vec!["docker", "linux", "gpu"]
        );
        assert!(parse_labels(None).is_empty());
        assert!(parse_labels(Some("")).is_empty());
    }

    #[test]
    fn port_defaults_and_validates() {
        assert_eq!(parse_port(None).unwrap(), DEFAULT_PORT);
        assert_eq!(parse_port(Some("4370")).unwrap(), 4370);
        assert!(parse_port(Some("0")).is_err());
        assert!(parse_port(Some("70000")).is_err());
        assert!(parse_port(Some("not-a-port")).is_err());
    }

    #[test]
    fn cookie_is_generated_when_absent() {
        let a = generate_cookie();
        let b = generate_cookie();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }

    #[test]
    fn dirs_nest_under_sykli() {
        assert!(cache_dir().ends_with(".sykli/cache"));
        assert!(daemon_pid_path().ends_with(".sykli/daemon.pid"));
    }
}
