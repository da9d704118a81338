//! Execution target boundary.
//!
//! A [`Target`] is the pluggable driver the executor runs tasks through:
//! the local shell/container driver ships in-tree, remote drivers hang off
//! the same trait. Drivers own their own state behind `&self`; the engine
//! keeps only the handle.

pub mod local;
pub mod mesh;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::Result;
use crate::events::EventBus;
use crate::graph::{Service, Task};

/// Options threaded into every `run_task` call.
#[derive(Clone)]
pub struct RunOptions {
    /// Effective timeout in seconds; `0` means no limit.
    pub timeout_secs: u64,
    /// Run-level cancellation latch; flips to `true` exactly once.
    pub cancel: watch::Receiver<bool>,
    /// Bus receiving `task_output` events, one per line.
    pub bus: EventBus,
    pub run_id: String,
    pub node: String,
    /// Secrets resolved before execution, injected into the task env.
    pub secrets: Vec<(String, String)>,
}

/// A successful task execution.
#[derive(Debug, Clone)]
pub struct TaskRun {
    pub output: String,
    pub duration_ms: u64,
}

/// Handle for services started for one task.
#[derive(Debug, Clone, Default)]
pub struct NetworkInfo {
    /// `(service name, container id)` pairs in start order.
    pub services: Vec<(String, String)>,
}

/// Pluggable execution driver.
///
/// `run_task` must honor the timeout and cancellation signal in
/// [`RunOptions`], stream output line-by-line into the event bus, and
/// return a structured [`crate::error::SykliError::TaskFailed`] carrying
/// exit code, truncated output, command, and duration on failure.
#[async_trait]
pub trait Target: Send + Sync + std::fmt::Debug {
    /// Prepare the driver (probe the container runtime, mount volumes).
    async fn setup(&self) -> Result<()>;

    /// Release everything `setup` acquired; runs on every exit path.
    async fn teardown(&self) -> Result<()>;

    /// Resolve a secret by name; `Ok(None)` when the target has no value.
    /// Composite names `<secret>/<key>` select a specific field.
    async fn resolve_secret(&self, name: &str) -> Result<Option<String>>;

    /// Start sidecar services for a task.
    async fn start_services(&self, task_name: &str, services: &[Service]) -> Result<NetworkInfo>;

    /// Stop services started by [`Target::start_services`].
    async fn stop_services(&self, network: NetworkInfo) -> Result<()>;

    /// Run one task to completion, honoring timeout and cancellation.
    async fn run_task(&self, task: &Task, opts: &RunOptions) -> Result<TaskRun>;

    /// Copy an artifact (file or directory) from `src` to `dest`, both
    /// resolved relative to `workdir` when not absolute.
    async fn copy_artifact(&self, src: &Path, dest: &Path, workdir: &Path) -> Result<()>;

    /// Create a named volume, returning its host path.
    async fn create_volume(&self, name: &str) -> Result<PathBuf>;

    /// Where `task`'s declared output `output_name` lands under `workdir`.
    ///
    /// When the output pattern is a glob this takes the first match in
    /// sorted path order.
    fn artifact_path(&self, task: &Task, output_name: &str, workdir: &Path) -> Option<PathBuf>;
}

/// Construct the driver named on the CLI.
pub fn create_target(name: &str, workdir: &Path) -> Result<std::sync::Arc<dyn Target>> {
    match name {
        "local" => Ok(std::sync::Arc::new(local::LocalTarget::new(workdir))),
        other => Err(crate::error::SykliError::TargetUnavailable {
            target: other.to_string(),
            reason: "only the 'local' driver ships with this binary".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn local_target_is_constructible() {
        let dir = TempDir::new().unwrap();
        assert!(create_target("local", dir.path()).is_ok());
    }

    #[test]
    fn unknown_target_is_e032() {
        let dir = TempDir::new().unwrap();
        let err = create_target("k8s", dir.path()).unwrap_err();
        assert_eq!(err.code(), "E032");
    }
}
