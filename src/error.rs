//! Error taxonomy for the sykli core.
//!
//! Every failure surfaces as a [`SykliError`] carrying a stable code
//! (`E001`..`E040`) so scripts and the occurrence document can match on it.
//! Hints are generated from the exit code and heuristic output patterns,
//! not hard-coded per call site.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

// ============================================================================
// ERROR TYPE
// ============================================================================

/// Top-level error type for the sykli core.
///
/// Codes are grouped: E00x execution, E01x validation, E02x SDK,
/// E03x runtime environment, E040 internal.
#[derive(Error, Debug)]
pub enum SykliError {
    /// E001: a task command exited non-zero.
    #[error("task '{task}' failed (exit {exit_code}): {command}")]
    TaskFailed {
        task: String,
        command: String,
        exit_code: i32,
        output: String,
        duration_ms: u64,
    },

    /// E002: a task exceeded its timeout.
    #[error("task '{task}' timed out after {timeout_secs}s")]
    TaskTimeout { task: String, timeout_secs: u64 },

    /// E003: required secrets did not resolve on the target.
    #[error("task '{task}' is missing secrets: {}", missing.join(", "))]
    MissingSecrets { task: String, missing: Vec<String> },

    /// E010: the dependency graph contains a cycle.
    #[error("dependency cycle detected: {}", path.join(" -> "))]
    CycleDetected { path: Vec<String> },

    /// E011: a service declaration is malformed.
    #[error("task '{task}' has an invalid service: {reason}")]
    InvalidService { task: String, reason: String },

    /// E012: a mount declaration is malformed.
    #[error("task '{task}' has an invalid mount: {reason}")]
    InvalidMount { task: String, reason: String },

    /// E013: artifact wiring references a missing task/output or an
    /// unreachable producer.
    #[error("task '{task}' has invalid artifact wiring: {reason}")]
    InvalidArtifact { task: String, reason: String },

    /// E020: no SDK file found in the project.
    #[error("no SDK file found in {dir}")]
    SdkNotFound { dir: String },

    /// E021: the SDK emitter exited non-zero.
    #[error("SDK emit failed: {reason}")]
    SdkEmitFailed { reason: String },

    /// E022: the SDK emitter did not produce output in time.
    #[error("SDK emit timed out after {timeout_secs}s")]
    SdkEmitTimeout { timeout_secs: u64 },

    /// E023: the emitted document is not a valid graph.
    #[error("SDK emitted invalid JSON: {reason}")]
    SdkInvalidJson { reason: String },

    /// E024: the language toolchain needed to run the SDK is missing.
    #[error("missing tool '{tool}' required to emit the pipeline")]
    SdkMissingTool { tool: String },

    /// E030: the container daemon is not reachable.
    #[error("container daemon unavailable: {reason}")]
    ContainerUnavailable { reason: String },

    /// E031: a container image could not be found or pulled.
    #[error("container image not found: {image}")]
    ImageMissing { image: String },

    /// E032: the requested target driver is not available.
    #[error("target '{target}' is not available: {reason}")]
    TargetUnavailable { target: String, reason: String },

    /// E033: the target failed to create a resource (volume, network).
    #[error("failed to create {resource}: {reason}")]
    ResourceCreation { resource: String, reason: String },

    /// E034: the working directory is not a git repository.
    #[error("not a git repository: {dir}")]
    NotAGitRepo { dir: String },

    /// E035: the working tree has uncommitted changes and the operation
    /// requires a clean tree.
    #[error("working directory has uncommitted changes")]
    DirtyWorkdir,

    /// E040: anything that escaped the taxonomy.
    #[error("internal error: {0}")]
    Internal(String),

    /// Structured I/O failure (mapped to E040 for reporting).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Graph document parse failure (mapped to E023).
    #[error("json parse error: {0}")]
    JsonParse(#[from] serde_json::Error),
}

impl SykliError {
    /// Stable error code for scripting and occurrence documents.
    pub fn code(&self) -> &'static str {
        match self {
            SykliError::TaskFailed { .. } => "E001",
            SykliError::TaskTimeout { .. } => "E002",
            SykliError::MissingSecrets { .. } => "E003",
            SykliError::CycleDetected { .. } => "E010",
            SykliError::InvalidService { .. } => "E011",
            SykliError::InvalidMount { .. } => "E012",
            SykliError::InvalidArtifact { .. } => "E013",
            SykliError::SdkNotFound { .. } => "E020",
            SykliError::SdkEmitFailed { .. } => "E021",
            SykliError::SdkEmitTimeout { .. } => "E022",
            SykliError::SdkInvalidJson { .. } => "E023",
            SykliError::JsonParse(_) => "E023",
            SykliError::SdkMissingTool { .. } => "E024",
            SykliError::ContainerUnavailable { .. } => "E030",
            SykliError::ImageMissing { .. } => "E031",
            SykliError::TargetUnavailable { .. } => "E032",
            SykliError::ResourceCreation { .. } => "E033",
            SykliError::NotAGitRepo { .. } => "E034",
            SykliError::DirtyWorkdir => "E035",
            SykliError::Internal(_) | SykliError::Io(_) => "E040",
        }
    }

    /// Generate a hint for the user, if the failure shape is recognized.
    pub fn hint(&self) -> Option<String> {
        match self {
            SykliError::TaskFailed {
                exit_code, output, ..
            } => hint_for_failure(*exit_code, output),
            SykliError::TaskTimeout { .. } => Some(
                "Increase the task's timeout or pass --timeout to raise the run default"
                    .to_string(),
            ),
            SykliError::MissingSecrets { missing, .. } => Some(format!(
                "Export {} in the environment the target resolves secrets from",
                missing.join(", ")
            )),
            SykliError::CycleDetected { .. } => {
                Some("Remove one edge of the cycle from depends_on".to_string())
            }
            SykliError::InvalidService { .. } => {
                Some("Each service needs both 'image' and 'name'".to_string())
            }
            SykliError::InvalidMount { .. } => Some(
                "Each mount needs 'resource', 'path', and type 'directory' or 'cache'".to_string(),
            ),
            SykliError::InvalidArtifact { .. } => Some(
                "task_inputs must reference a declared output of a task reachable via depends_on"
                    .to_string(),
            ),
            SykliError::SdkNotFound { .. } => Some(
                "Create an SDK file (sykli.go, sykli.rs, or sykli.exs) in the project root"
                    .to_string(),
            ),
            SykliError::SdkMissingTool { tool } => {
                Some(format!("Install '{}' and make sure it is on PATH", tool))
            }
            SykliError::ContainerUnavailable { .. } => {
                Some("Start the container runtime (e.g. `docker info` should succeed)".to_string())
            }
            SykliError::ImageMissing { image } => {
                Some(format!("Pull the image first: docker pull {}", image))
            }
            SykliError::NotAGitRepo { .. } => {
                Some("Run inside a git repository or skip git-based commands".to_string())
            }
            SykliError::DirtyWorkdir => {
                Some("Commit or stash your changes, or pass --allow-dirty".to_string())
            }
            SykliError::Internal(_) => Some(
                "This is a bug in sykli; please report it at https://github.com/sykli/sykli/issues"
                    .to_string(),
            ),
            _ => None,
        }
    }
}

// ============================================================================
// FAILURE HINT HEURISTICS
// ============================================================================

struct OutputRule {
    pattern: &'static str,
    hint: &'static str,
}

/// Output patterns checked in order; first match wins.
const OUTPUT_RULES: &[OutputRule] = &[
    OutputRule {
        pattern: r"(?i)command not found|No such file or directory \(os error 2\)",
        hint: "The command is not installed or not on PATH",
    },
    OutputRule {
        pattern: r"(?i)permission denied",
        hint: "Check file permissions, or whether the command needs elevated rights",
    },
    OutputRule {
        pattern: r"(?i)connection refused|connection timed out|network is unreachable",
        hint: "A network dependency is unreachable; check that required services are up",
    },
    OutputRule {
        pattern: r"(?i)cannot connect to the docker daemon|docker: not found",
        hint: "Docker is not running; start the container runtime",
    },
    OutputRule {
        pattern: r"error\[E\d{4}\]",
        hint: "Rust compilation failed; see the first error[EXXXX] above",
    },
    OutputRule {
        pattern: r"(?i)npm ERR!|Cannot find module",
        hint: "Node dependencies missing; run `npm install` or check the module path",
    },
    OutputRule {
        pattern: r"(?i)ModuleNotFoundError|No module named",
        hint: "Python dependency missing; install it with pip",
    },
    OutputRule {
        pattern: r"(?i)out of memory|Killed",
        hint: "The task may have been OOM-killed; reduce memory use or raise limits",
    },
];

static COMPILED_RULES: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    OUTPUT_RULES
        .iter()
        .map(|r| (Regex::new(r.pattern).expect("static rule compiles"), r.hint))
        .collect()
});

/// Map exit code and captured output to a hint, if any heuristic fires.
pub fn hint_for_failure(exit_code: i32, output: &str) -> Option<String> {
    for (re, hint) in COMPILED_RULES.iter() {
        if re.is_match(output) {
            return Some((*hint).to_string());
        }
    }

    match exit_code {
        2 => Some("Exit 2 usually means a usage error; check the command's arguments".to_string()),
        126 => Some("The command was found but is not executable (chmod +x?)".to_string()),
        127 => Some("The command was not found; is it installed and on PATH?".to_string()),
        137 => Some("Killed by SIGKILL (137); often an out-of-memory kill".to_string()),
        143 => Some("Terminated by SIGTERM (143); likely a timeout or cancellation".to_string()),
        c if c > 128 => Some(format!(
            "Terminated by signal {}; the process did not exit on its own",
            c - 128
        )),
        _ => None,
    }
}

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, SykliError>;

/// Format an error with its code and hint for terminal display.
pub fn format_error(error: &SykliError) -> String {
    let mut out = format!("[{}] {}", error.code(), error);
    if let Some(hint) = error.hint() {
        out.push_str("\n  hint: ");
        out.push_str(&hint);
    }
    out
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        let err = SykliError::TaskFailed {
            task: "build".into(),
            command: "make".into(),
            exit_code: 1,
            output: String::new(),
            duration_ms: 10,
        };
        assert_eq!(err.code(), "E001");

        assert_eq!(
            SykliError::CycleDetected {
                path: vec!["a".into(), "b".into(), "a".into()]
            }
            .code(),
            "E010"
        );
        assert_eq!(SykliError::DirtyWorkdir.code(), "E035");
        assert_eq!(SykliError::Internal("boom".into()).code(), "E040");
    }

    #[test]
    fn exit_127_hints_missing_command() {
        let hint = hint_for_failure(127, "").unwrap();
        assert!(hint.contains("not found"));
    }

    #[test]
    fn output_rules_take_precedence_over_exit_code() {
        let hint = hint_for_failure(1, "sh: cargo: command not found").unwrap();
        assert!(hint.contains("not installed"));
    }

    #[test]
    fn signal_exits_are_decoded() {
        let hint = hint_for_failure(139, "").unwrap();
        assert!(hint.contains("signal 11"));
    }

    #[test]
    fn docker_output_is_recognized() {
        let hint = hint_for_failure(1, "Cannot connect to the Docker daemon").unwrap();
        assert!(hint.to_lowercase().contains("docker"));
    }

    #[test]
    fn cycle_error_renders_path() {
        let err = SykliError::CycleDetected {
            path: vec!["a".into(), "b".into(), "c".into(), "a".into()],
        };
        assert_eq!(
            err.to_string(),
            "dependency cycle detected: a -> b -> c -> a"
        );
    }

    #[test]
    fn format_error_includes_code_and_hint() {
        let err = SykliError::DirtyWorkdir;
        let rendered = format_error(&err);
        assert!(rendered.starts_with("[E035]"));
        assert!(rendered.contains("hint:"));
    }

    #[test]
    fn clean_exit_without_patterns_has_no_hint() {
        assert!(hint_for_failure(1, "something ordinary").is_none());
    }
}
