//! Long-running daemon: RPC server, discovery responder, coordinator,
//! and event reporter under one supervisor.
//!
//! The pid file holds a single line with the daemon's OS process id.
//! Children are supervised with a permanent restart policy and exponential
//! backoff; the daemon itself exits on SIGINT/SIGTERM, removing its pid
//! file.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::cache::CacheRepo;
use crate::config::Config;
use crate::error::{Result, SykliError};
use crate::events::reporter::{EventSink, Reporter};
use crate::events::{Event, EventBus, TOPIC_ALL};
use crate::exec::{ExecOptions, Executor, TaskOutcome};
use crate::graph::{Graph, Task};
use crate::mesh::coordinator::Coordinator;
use crate::mesh::rpc::{self, RpcClient, RpcHandler};
use crate::mesh::{self, discovery, NodeProfile, NodeRole};
use crate::target::local::LocalTarget;

/// Restart backoff bounds for supervised children.
const BACKOFF_INITIAL: Duration = Duration::from_millis(500);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// How the daemon was asked to run.
#[derive(Debug, Clone)]
pub struct DaemonOptions {
    pub role: NodeRole,
    pub foreground: bool,
    /// Extra labels beyond `SYKLI_LABELS`.
    pub labels: Vec<String>,
    pub workdir: PathBuf,
}

// ============================================================================
// PID FILE
// ============================================================================

/// Read the daemon pid; `None` when absent or unparseable.
pub fn read_pid(pid_path: &Path) -> Option<u32> {
    std::fs::read_to_string(pid_path)
        .ok()?
        .trim()
        .parse()
        .ok()
}

fn write_pid(pid_path: &Path, pid: u32) -> Result<()> {
    if let Some(parent) = pid_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(pid_path, format!("{}\n", pid))?;
    Ok(())
}

/// Is the recorded process still alive?
pub fn process_alive(pid: u32) -> bool {
    #[cfg(unix)]
    unsafe {
        libc::kill(pid as i32, 0) == 0
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

/// Running daemon pid, if any. Stale pid files are cleaned up.
pub fn status(pid_path: &Path) -> Option<u32> {
    let pid = read_pid(pid_path)?;
    if process_alive(pid) {
        Some(pid)
    } else {
        let _ = std::fs::remove_file(pid_path);
        None
    }
}

/// Terminate a running daemon; `false` when none was running.
pub fn stop(pid_path: &Path) -> Result<bool> {
    let Some(pid) = status(pid_path) else {
        return Ok(false);
    };
    #[cfg(unix)]
    unsafe {
        libc::kill(pid as i32, libc::SIGTERM);
    }
    let _ = std::fs::remove_file(pid_path);
    info!(pid, "daemon stopped");
    Ok(true)
}

// ============================================================================
// START
// ============================================================================

/// Start the daemon. Background mode re-execs this binary detached with
/// `--foreground`; the child owns the pid file.
pub async fn start(options: DaemonOptions, pid_path: &Path) -> Result<()> {
    if let Some(pid) = status(pid_path) {
        return Err(SykliError::Internal(format!(
            "daemon already running (pid {})",
            pid
        )));
    }

    if !options.foreground {
        return spawn_background(&options);
    }

    write_pid(pid_path, std::process::id())?;
    let result = run_supervisor(options).await;
    let _ = std::fs::remove_file(pid_path);
    result
}

fn spawn_background(options: &DaemonOptions) -> Result<()> {
    let exe = std::env::current_exe()?;
    let mut cmd = std::process::Command::new(exe);
    cmd.arg("daemon")
        .arg("start")
        .arg("--foreground")
        .arg("--role")
        .arg(match options.role {
            NodeRole::Full => "full",
            NodeRole::Worker => "worker",
            NodeRole::Coordinator => "coordinator",
        });
    if !options.labels.is_empty() {
        cmd.arg("--labels").arg(options.labels.join(","));
    }
    cmd.stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());

    let child = cmd.spawn()?;
    println!("daemon starting (pid {})", child.id());
    Ok(())
}

async fn run_supervisor(options: DaemonOptions) -> Result<()> {
    let mut config = Config::from_env()?;
    for label in &options.labels {
        if !config.labels.contains(label) {
            config.labels.push(label.clone());
        }
    }

    let profile = mesh::detect_profile(&config, options.role);
    info!(
        node = %profile.name,
        role = ?profile.role,
        labels = ?profile.capabilities.labels,
        port = config.port,
        "daemon starting"
    );

    let bus = EventBus::new();
    let coordinator = options
        .role
        .coordinates()
        .then(|| Coordinator::default());

    let handler: Arc<dyn RpcHandler> = Arc::new(DaemonHandler {
        profile: profile.clone(),
        coordinator: coordinator.clone(),
        bus: bus.clone(),
        workdir: options.workdir.clone(),
    });

    // RPC server: bind before supervising so port conflicts fail fast.
    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    let cookie = config.cookie.clone();
    tokio::spawn(rpc::serve(listener, cookie, Arc::clone(&handler)));

    // Discovery responder answers probes with our profile.
    {
        let profile = profile.clone();
        let port = config.port;
        let cookie = config.cookie.clone();
        supervise("discovery", move || {
            let profile = profile.clone();
            let cookie = cookie.clone();
            async move {
                discovery::responder(profile, port, cookie)
                    .await
                    .map_err(|e| e.to_string())
            }
        });
    }

    match &coordinator {
        // Coordinating roles ingest the local bus directly.
        Some(coordinator) => {
            let coordinator = coordinator.clone();
            let mut rx = bus.subscribe(TOPIC_ALL);
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    coordinator.ingest(&event);
                }
            });
        }
        // Pure workers forward their events to a discovered coordinator.
        None => {
            let rx = bus.subscribe(TOPIC_ALL);
            let sink = CoordinatorSink::new(config.port, config.cookie.clone());
            tokio::spawn(Reporter::new(sink).run(rx));
        }
    }

    wait_for_shutdown().await;
    info!("daemon shutting down");
    Ok(())
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Permanent restart policy with exponential backoff.
fn supervise<F, Fut>(name: &'static str, factory: F)
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = std::result::Result<(), String>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut backoff = BACKOFF_INITIAL;
        loop {
            match factory().await {
                Ok(()) => {
                    warn!(worker = name, "worker exited cleanly; restarting");
                    backoff = BACKOFF_INITIAL;
                }
                Err(e) => {
                    error!(worker = name, "worker failed: {}; restarting in {:?}", e, backoff);
                }
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(BACKOFF_MAX);
        }
    });
}

// ============================================================================
// RPC HANDLER
// ============================================================================

struct DaemonHandler {
    profile: NodeProfile,
    coordinator: Option<Coordinator>,
    bus: EventBus,
    workdir: PathBuf,
}

#[async_trait]
impl RpcHandler for DaemonHandler {
    async fn capabilities(&self) -> NodeProfile {
        self.profile.clone()
    }

    /// Stateless single-task execution for remote dispatch.
    async fn run_task(&self, task: Task) -> std::result::Result<TaskOutcome, String> {
        if !self.profile.role.accepts_tasks() {
            return Err("node is a coordinator; it does not accept tasks".to_string());
        }

        let name = task.name.clone();
        let mut detached = task;
        // A dispatched task runs alone; its edges live on the caller.
        detached.depends_on.clear();
        detached.task_inputs.clear();

        let graph =
            Graph::from_tasks(vec![detached]).map_err(|e| format!("invalid task: {}", e))?;
        let executor = Executor::new(
            graph,
            Arc::new(LocalTarget::new(&self.workdir)),
            CacheRepo::open_default(),
            self.bus.clone(),
            ExecOptions {
                workdir: self.workdir.clone(),
                node: self.profile.name.clone(),
                ..ExecOptions::default()
            },
        );

        let summary = executor.run().await.map_err(|e| e.to_string())?;
        summary
            .outcomes
            .get(&name)
            .cloned()
            .ok_or_else(|| format!("task '{}' produced no outcome", name))
    }

    async fn ingest_event(&self, event: Event) {
        match &self.coordinator {
            Some(coordinator) => coordinator.ingest(&event),
            // Workers republish so their own reporter forwards upstream.
            None => self.bus.publish(event),
        }
    }
}

// ============================================================================
// COORDINATOR SINK
// ============================================================================

/// Sink that lazily discovers the coordinator and forwards over RPC.
struct CoordinatorSink {
    port: u16,
    cookie: String,
    client: tokio::sync::Mutex<Option<RpcClient>>,
}

impl CoordinatorSink {
    fn new(port: u16, cookie: String) -> Self {
        Self {
            port,
            cookie,
            client: tokio::sync::Mutex::new(None),
        }
    }

    async fn connect(&self) -> Option<RpcClient> {
        let profiles = discovery::discover(self.port, &self.cookie, Duration::from_millis(500))
            .await
            .ok()?;
        let coordinator = profiles.into_iter().find(|p| p.role.coordinates())?;
        Some(RpcClient::new(
            &coordinator.name,
            &format!("{}:{}", coordinator.host, coordinator.port),
            &self.cookie,
        ))
    }
}

#[async_trait]
impl EventSink for CoordinatorSink {
    async fn send(&self, event: &Event) -> std::result::Result<(), String> {
        let mut guard = self.client.lock().await;
        if guard.is_none() {
            *guard = self.connect().await;
        }
        let Some(client) = guard.as_ref() else {
            return Err("no coordinator discovered".to_string());
        };
        match client.forward_event(event).await {
            Ok(()) => Ok(()),
            Err(e) => {
                // Stale address; rediscover next time.
                *guard = None;
                Err(e.to_string())
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
