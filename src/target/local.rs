//! Local execution driver: shell commands, optionally inside a container.
//!
//! Commands run under `sh -c` with the task's workdir as CWD and its env
//! injected. When `container` is set the command is wrapped in
//! `docker run --rm` with the workdir mounted at `/workspace`. Output is
//! streamed line-by-line into the event bus, attributed by task name.
//! Cancellation sends SIGTERM, waits a grace period, then SIGKILL.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{Result, SykliError};
use crate::events::{Event, EventKind};
use crate::graph::{Service, Task};

use super::{NetworkInfo, RunOptions, Target, TaskRun};

/// Grace period between SIGTERM and SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Lines of output kept in a failure report.
const ERROR_OUTPUT_LINES: usize = 200;

/// Shell/container driver for the machine sykli runs on.
#[derive(Debug)]
pub struct LocalTarget {
    workdir: PathBuf,
}

impl LocalTarget {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    fn task_workdir(&self, task: &Task) -> PathBuf {
        match &task.workdir {
            Some(sub) => self.workdir.join(sub),
            None => self.workdir.clone(),
        }
    }

    fn build_command(&self, task: &Task, opts: &RunOptions) -> Command {
        let workdir = self.task_workdir(task);
        let mut cmd = match &task.container {
            Some(image) => {
                let mut c = Command::new("docker");
                c.arg("run")
                    .arg("--rm")
                    .arg("-w")
                    .arg("/workspace")
                    .arg("-v")
                    .arg(format!("{}:/workspace", workdir.display()));
                for (key, value) in &task.env {
                    c.arg("-e").arg(format!("{}={}", key, value));
                }
                for (key, value) in &opts.secrets {
                    c.arg("-e").arg(format!("{}={}", env_name(key), value));
                }
                for mount in &task.mounts {
                    c.arg("-v")
                        .arg(format!("{}:{}", mount.resource, mount.path));
                }
                c.arg(image).arg("sh").arg("-c").arg(&task.command);
                c
            }
            None => {
                let mut c = Command::new("sh");
                c.arg("-c").arg(&task.command).current_dir(&workdir);
                for (key, value) in &task.env {
                    c.env(key, value);
                }
                for (key, value) in &opts.secrets {
                    c.env(env_name(key), value);
                }
                c
            }
        };
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Target for LocalTarget {
    async fn setup(&self) -> Result<()> {
        if !self.workdir.exists() {
            return Err(SykliError::Internal(format!(
                "workdir does not exist: {}",
                self.workdir.display()
            )));
        }
        Ok(())
    }

    async fn teardown(&self) -> Result<()> {
        Ok(())
    }

    async fn resolve_secret(&self, name: &str) -> Result<Option<String>> {
        Ok(std::env::var(env_name(name)).ok())
    }

    async fn start_services(&self, task_name: &str, services: &[Service]) -> Result<NetworkInfo> {
        let mut network = NetworkInfo::default();
        for service in services {
            let container_name = format!("sykli-{}-{}", sanitize(task_name), service.name);
            let output = Command::new("docker")
                .args(["run", "-d", "--rm", "--name", &container_name])
                .arg(&service.image)
                .output()
                .await
                .map_err(|e| SykliError::ContainerUnavailable {
                    reason: e.to_string(),
                })?;

            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
                // Roll back what already started.
                let _ = self.stop_services(network).await;
                if stderr.to_lowercase().contains("unable to find image")
                    || stderr.to_lowercase().contains("pull access denied")
                {
                    return Err(SykliError::ImageMissing {
                        image: service.image.clone(),
                    });
                }
                return Err(SykliError::ContainerUnavailable { reason: stderr });
            }

            let container_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
            debug!(task = task_name, service = %service.name, %container_id, "service started");
            network.services.push((service.name.clone(), container_id));
        }
        Ok(network)
    }

    async fn stop_services(&self, network: NetworkInfo) -> Result<()> {
        for (name, container_id) in network.services {
            let result = Command::new("docker")
                .args(["rm", "-f", &container_id])
                .output()
                .await;
            if let Err(e) = result {
                warn!(service = %name, "failed to stop service: {}", e);
            }
        }
        Ok(())
    }

    async fn run_task(&self, task: &Task, opts: &RunOptions) -> Result<TaskRun> {
        let started = Instant::now();
        let mut child = self.build_command(task, opts).spawn().map_err(|e| {
            if task.container.is_some() {
                SykliError::ContainerUnavailable {
                    reason: e.to_string(),
                }
            } else {
                SykliError::Io(e)
            }
        })?;

        let lines: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let stdout_reader = stream_lines(child.stdout.take(), task, opts, &lines, "stdout");
        let stderr_reader = stream_lines(child.stderr.take(), task, opts, &lines, "stderr");

        let mut cancel = opts.cancel.clone();
        let status = tokio::select! {
            status = child.wait() => Some(status?),
            _ = sleep_for_timeout(opts.timeout_secs) => None,
            _ = cancel.changed() => {
                if *cancel.borrow() { None } else { Some(child.wait().await?) }
            }
        };

        let status = match status {
            Some(status) => status,
            None => {
                kill_gracefully(&mut child).await;
                let _ = stdout_reader.await;
                let _ = stderr_reader.await;
                let timed_out = !*cancel.borrow();
                if timed_out {
                    return Err(SykliError::TaskTimeout {
                        task: task.name.clone(),
                        timeout_secs: opts.timeout_secs,
                    });
                }
                let output = lines.lock().await.join("\n");
                return Err(SykliError::TaskFailed {
                    task: task.name.clone(),
                    command: task.command.clone(),
                    exit_code: 143,
                    output: truncate_output(&output),
                    duration_ms: started.elapsed().as_millis() as u64,
                });
            }
        };

        let _ = stdout_reader.await;
        let _ = stderr_reader.await;
        let output = lines.lock().await.join("\n");
        let duration_ms = started.elapsed().as_millis() as u64;

        if status.success() {
            Ok(TaskRun {
                output,
                duration_ms,
            })
        } else {
            Err(SykliError::TaskFailed {
                task: task.name.clone(),
                command: task.command.clone(),
                exit_code: exit_code_of(&status),
                output: truncate_output(&output),
                duration_ms,
            })
        }
    }

    async fn copy_artifact(&self, src: &Path, dest: &Path, workdir: &Path) -> Result<()> {
        let src = resolve(workdir, src);
        let dest = resolve(workdir, dest);

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if src.is_dir() {
            copy_dir(&src, &dest)?;
        } else {
            tokio::fs::copy(&src, &dest).await?;
        }
        Ok(())
    }

    async fn create_volume(&self, name: &str) -> Result<PathBuf> {
        let path = self.workdir.join(".sykli").join("volumes").join(sanitize(name));
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| SykliError::ResourceCreation {
                resource: format!("volume '{}'", name),
                reason: e.to_string(),
            })?;
        Ok(path)
    }

    fn artifact_path(&self, task: &Task, output_name: &str, workdir: &Path) -> Option<PathBuf> {
        let pattern = task.outputs.get(output_name)?;
        let candidate = workdir.join(pattern);
        if candidate.exists() {
            return Some(candidate);
        }
        // Glob pattern: first match in sorted path order.
        crate::cache::fingerprint::expand_globs(std::slice::from_ref(pattern), workdir)
            .ok()?
            .into_iter()
            .next()
    }
}

// ============================================================================
// HELPERS
// ============================================================================

/// Map a secret name to its environment variable: uppercase, `/` -> `_`.
fn env_name(secret: &str) -> String {
    secret.replace('/', "_").to_uppercase()
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

fn resolve(workdir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        workdir.join(path)
    }
}

fn copy_dir(src: &Path, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in walkdir::WalkDir::new(src).into_iter().filter_map(|e| e.ok()) {
        let rel = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Pending forever when `timeout_secs` is 0.
async fn sleep_for_timeout(timeout_secs: u64) {
    if timeout_secs == 0 {
        std::future::pending::<()>().await;
    } else {
        tokio::time::sleep(Duration::from_secs(timeout_secs)).await;
    }
}

/// Spawn a reader that forwards each line to the bus and the shared buffer.
fn stream_lines<R>(
    reader: Option<R>,
    task: &Task,
    opts: &RunOptions,
    lines: &Arc<Mutex<Vec<String>>>,
    stream: &'static str,
) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let task_name = task.name.clone();
    let bus = opts.bus.clone();
    let run_id = opts.run_id.clone();
    let node = opts.node.clone();
    let lines = Arc::clone(lines);

    tokio::spawn(async move {
        let Some(reader) = reader else { return };
        let mut reader = BufReader::new(reader).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            bus.publish(Event::new(
                EventKind::TaskOutput,
                &run_id,
                &node,
                serde_json::json!({ "task": task_name, "line": line, "stream": stream }),
            ));
            lines.lock().await.push(line);
        }
    })
}

/// SIGTERM, grace period, then SIGKILL.
async fn kill_gracefully(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
        let graceful =
            tokio::time::timeout(KILL_GRACE, child.wait()).await.is_ok();
        if graceful {
            return;
        }
    }
    let _ = child.start_kill();
    let _ = child.wait().await;
}

fn exit_code_of(status: &std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

fn truncate_output(output: &str) -> String {
    let lines: Vec<&str> = output.lines().collect();
    if lines.len() <= ERROR_OUTPUT_LINES {
        return output.to_string();
    }
    let tail = &lines[lines.len() - ERROR_OUTPUT_LINES..];
    format!(
        "... ({} lines truncated)\n{}",
        lines.len() - ERROR_OUTPUT_LINES,
        tail.join("\n")
    )
}

// ============================================================================
// TESTS
// ============================================================================
