//! Level-parallel pipeline executor.
//!
//! The scheduling loop:
//!
//! 1. validate artifact wiring, abort before any command runs
//! 2. `setup` the target
//! 3. for each topological level, spawn one worker per task; a worker
//!    resolves artifacts, gates on its condition, validates secrets,
//!    consults the cache, then runs with retries
//! 4. first failure cancels the level and marks everything not yet run
//!    as blocked
//! 5. `teardown` runs on every exit path
//!
//! Tasks in the same level may run in parallel; ordering between them is
//! not observable and must not be relied on.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, instrument, warn};

use crate::cache::{CacheOutcome, CacheRepo, MissReason};
use crate::condition;
use crate::config;
use crate::error::{Result, SykliError};
use crate::events::{Event, EventBus, EventKind};
use crate::graph::{validate, Graph, Task};
use crate::target::{RunOptions, Target};

// ============================================================================
// OUTCOMES
// ============================================================================

/// Terminal state of one task in one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Passed,
    Failed,
    Cached,
    Skipped,
    Blocked,
}

/// Per-task result collected by the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub name: String,
    pub status: TaskStatus,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_miss: Option<MissReason>,
    /// Attempts actually made (1 = no retries needed).
    pub attempts: u32,
}

impl TaskOutcome {
    fn new(name: &str, status: TaskStatus) -> Self {
        Self {
            name: name.to_string(),
            status,
            duration_ms: 0,
            output: String::new(),
            error: None,
            error_code: None,
            exit_code: None,
            cache_miss: None,
            attempts: 0,
        }
    }
}

/// Aggregate result of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcomes: BTreeMap<String, TaskOutcome>,
    pub levels: Vec<Vec<String>>,
}

impl RunSummary {
    pub fn count(&self, status: TaskStatus) -> usize {
        self.outcomes.values().filter(|o| o.status == status).count()
    }

    /// A run succeeds when nothing failed and nothing was blocked.
    pub fn success(&self) -> bool {
        self.count(TaskStatus::Failed) == 0 && self.count(TaskStatus::Blocked) == 0
    }

    pub fn failed_tasks(&self) -> impl Iterator<Item = &TaskOutcome> {
        self.outcomes
            .values()
            .filter(|o| o.status == TaskStatus::Failed)
    }
}

// ============================================================================
// EXECUTOR
// ============================================================================

/// Run-level knobs.
#[derive(Debug, Clone)]
pub struct ExecOptions {
    pub workdir: PathBuf,
    /// Run-level default timeout; `0` means no limit.
    pub default_timeout_secs: u64,
    /// Substring filter; kept tasks pull in their transitive dependencies.
    pub filter: Option<String>,
    pub node: String,
    pub use_cache: bool,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            workdir: PathBuf::from("."),
            default_timeout_secs: config::DEFAULT_TASK_TIMEOUT_SECS,
            filter: None,
            node: "local".to_string(),
            use_cache: true,
        }
    }
}

/// Owns the graph and per-run state; everything else is a handle.
pub struct Executor {
    graph: Arc<Graph>,
    target: Arc<dyn Target>,
    cache: CacheRepo,
    bus: EventBus,
    options: ExecOptions,
    condition_ctx: condition::Context,
}

struct WorkerContext {
    graph: Arc<Graph>,
    target: Arc<dyn Target>,
    cache: CacheRepo,
    bus: EventBus,
    options: ExecOptions,
    condition_ctx: condition::Context,
    run_id: String,
    cancel: watch::Receiver<bool>,
}

impl Executor {
    pub fn new(
        graph: Graph,
        target: Arc<dyn Target>,
        cache: CacheRepo,
        bus: EventBus,
        options: ExecOptions,
    ) -> Self {
        Self {
            graph: Arc::new(graph),
            target,
            cache,
            bus,
            options,
            condition_ctx: condition::Context::from_env(),
        }
    }

    /// Replace the CI context conditions are evaluated against.
    pub fn with_condition_context(mut self, ctx: condition::Context) -> Self {
        self.condition_ctx = ctx;
        self
    }

    /// Execute the pipeline and return the per-task outcomes.
    #[instrument(skip(self), fields(tasks = self.graph.len()))]
    pub async fn run(&self) -> Result<RunSummary> {
        let graph = match &self.options.filter {
            Some(substring) => Arc::new(filter_graph(&self.graph, substring)),
            None => Arc::clone(&self.graph),
        };

        validate::validate_artifacts(&graph)?;
        let levels = crate::graph::topo::levels(&graph)?;

        let run_id = crate::events::new_ulid();
        let started_at = Utc::now();
        self.bus.publish(Event::new(
            EventKind::RunStarted,
            &run_id,
            &self.options.node,
            serde_json::json!({ "tasks": graph.len(), "levels": levels.len() }),
        ));

        self.target.setup().await?;
        let result = self.run_levels(&graph, &levels, &run_id).await;
        if let Err(e) = self.target.teardown().await {
            warn!("target teardown failed: {}", e);
        }
        let outcomes = result?;

        let summary = RunSummary {
            run_id: run_id.clone(),
            started_at,
            finished_at: Utc::now(),
            outcomes,
            levels,
        };
        self.bus.publish(Event::new(
            EventKind::RunCompleted,
            &run_id,
            &self.options.node,
            serde_json::json!({
                "success": summary.success(),
                "passed": summary.count(TaskStatus::Passed),
                "failed": summary.count(TaskStatus::Failed),
                "cached": summary.count(TaskStatus::Cached),
                "skipped": summary.count(TaskStatus::Skipped),
                "blocked": summary.count(TaskStatus::Blocked),
            }),
        ));
        Ok(summary)
    }

    async fn run_levels(
        &self,
        graph: &Arc<Graph>,
        levels: &[Vec<String>],
        run_id: &str,
    ) -> Result<BTreeMap<String, TaskOutcome>> {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let mut outcomes: BTreeMap<String, TaskOutcome> = BTreeMap::new();
        let mut aborted = false;

        for level in levels {
            if aborted {
                for name in level {
                    let outcome = TaskOutcome::new(name, TaskStatus::Blocked);
                    self.publish_completed(run_id, &outcome);
                    outcomes.insert(name.clone(), outcome);
                }
                continue;
            }

            let mut workers = JoinSet::new();
            for name in level {
                let ctx = WorkerContext {
                    graph: Arc::clone(graph),
                    target: Arc::clone(&self.target),
                    cache: self.cache.clone(),
                    bus: self.bus.clone(),
                    options: self.options.clone(),
                    condition_ctx: self.condition_ctx.clone(),
                    run_id: run_id.to_string(),
                    cancel: cancel_rx.clone(),
                };
                let task = graph.tasks[name].clone();
                workers.spawn(run_one(task, ctx));
            }

            while let Some(joined) = workers.join_next().await {
                let outcome = joined
                    .map_err(|e| SykliError::Internal(format!("worker panicked: {}", e)))?;
                if outcome.status == TaskStatus::Failed && !aborted {
                    aborted = true;
                    let _ = cancel_tx.send(true);
                }
                outcomes.insert(outcome.name.clone(), outcome);
            }
        }

        Ok(outcomes)
    }

    fn publish_completed(&self, run_id: &str, outcome: &TaskOutcome) {
        self.bus.publish(Event::new(
            EventKind::TaskCompleted,
            run_id,
            &self.options.node,
            serde_json::json!({
                "task": outcome.name,
                "status": outcome.status,
                "duration_ms": outcome.duration_ms,
            }),
        ));
    }
}

// ============================================================================
// WORKER
// ============================================================================

/// Run one task through artifacts, condition, secrets, cache, services,
/// and the retry loop.
async fn run_one(task: Task, ctx: WorkerContext) -> TaskOutcome {
    ctx.bus.publish(Event::new(
        EventKind::TaskStarted,
        &ctx.run_id,
        &ctx.options.node,
        serde_json::json!({ "task": task.name }),
    ));

    let started = Instant::now();
    let mut outcome = execute_task(&task, &ctx).await;
    if outcome.duration_ms == 0 {
        outcome.duration_ms = started.elapsed().as_millis() as u64;
    }

    ctx.bus.publish(Event::new(
        EventKind::TaskCompleted,
        &ctx.run_id,
        &ctx.options.node,
        serde_json::json!({
            "task": outcome.name,
            "status": outcome.status,
            "duration_ms": outcome.duration_ms,
        }),
    ));
    outcome
}

async fn execute_task(task: &Task, ctx: &WorkerContext) -> TaskOutcome {
    // 1. Artifact resolution: copy declared inputs into place.
    if let Err(e) = resolve_artifacts(task, ctx).await {
        let mut outcome = TaskOutcome::new(&task.name, TaskStatus::Failed);
        outcome.error = Some(e.to_string());
        outcome.error_code = Some(e.code().to_string());
        return outcome;
    }

    // 2. Condition gate; evaluation errors skip rather than run.
    if let Some(expr) = &task.condition {
        match condition::evaluate(expr, &ctx.condition_ctx) {
            Ok(true) => {}
            Ok(false) => {
                debug!(task = %task.name, "condition false, skipping");
                return TaskOutcome::new(&task.name, TaskStatus::Skipped);
            }
            Err(e) => {
                warn!(task = %task.name, "condition error, skipping: {}", e);
                let mut outcome = TaskOutcome::new(&task.name, TaskStatus::Skipped);
                outcome.error = Some(e.to_string());
                return outcome;
            }
        }
    }

    // 3. Gates pause before anything else touches the target.
    if let Some(gate) = &task.gate {
        wait_for_gate(task, gate, ctx).await;
    }

    // 4. Secrets must all resolve before anything runs.
    let secrets = match resolve_secrets(task, ctx).await {
        Ok(secrets) => secrets,
        Err(e) => {
            let mut outcome = TaskOutcome::new(&task.name, TaskStatus::Failed);
            outcome.error = Some(e.to_string());
            outcome.error_code = Some(e.code().to_string());
            return outcome;
        }
    };

    // 5. Cache lookup; the cache is advisory, so errors degrade to a run.
    let mut cache_miss = None;
    let mut fingerprint = None;
    if ctx.options.use_cache {
        match ctx.cache.check_detailed(task, &ctx.options.workdir) {
            Ok(decision) => match &decision.outcome {
                CacheOutcome::Hit => {
                    let meta_entry = ctx
                        .cache
                        .entry_for(&decision.fingerprint.digest)
                        .and_then(|entry| {
                            ctx.cache.restore(&entry, &ctx.options.workdir).map(|_| entry)
                        });
                    match meta_entry {
                        Ok(entry) => {
                            let mut outcome = TaskOutcome::new(&task.name, TaskStatus::Cached);
                            outcome.duration_ms = entry.duration_ms;
                            return outcome;
                        }
                        Err(e) => {
                            warn!(task = %task.name, "cache restore failed, re-running: {}", e);
                            cache_miss = Some(MissReason::BlobsMissing);
                            fingerprint = Some(decision.fingerprint);
                        }
                    }
                }
                CacheOutcome::Miss(reason) => {
                    cache_miss = Some(*reason);
                    fingerprint = Some(decision.fingerprint);
                }
            },
            Err(e) => warn!(task = %task.name, "cache check failed: {}", e),
        }
    }

    // 6. Services up, retry loop, services down.
    let network = match ctx.target.start_services(&task.name, &task.services).await {
        Ok(network) => network,
        Err(e) => {
            let mut outcome = TaskOutcome::new(&task.name, TaskStatus::Failed);
            outcome.error = Some(e.to_string());
            outcome.error_code = Some(e.code().to_string());
            return outcome;
        }
    };

    let mut outcome = attempt_loop(task, ctx, secrets, cache_miss).await;

    if outcome.status == TaskStatus::Passed && ctx.options.use_cache {
        if let Some(fp) = &fingerprint {
            if let Err(e) = ctx
                .cache
                .store(task, fp, &ctx.options.workdir, outcome.duration_ms)
            {
                warn!(task = %task.name, "cache store failed: {}", e);
            }
        }
    }

    if let Err(e) = ctx.target.stop_services(network).await {
        warn!(task = %task.name, "stopping services failed: {}", e);
    }
    outcome
}

/// Emit the gate events and pause. Time gates sleep (cancellable); other
/// kinds have no in-core resolver and pass through immediately.
async fn wait_for_gate(task: &Task, gate: &crate::graph::Gate, ctx: &WorkerContext) {
    ctx.bus.publish(Event::new(
        EventKind::GateWaiting,
        &ctx.run_id,
        &ctx.options.node,
        serde_json::json!({ "task": task.name, "gate": gate.kind }),
    ));

    if gate.kind == "time" {
        if let Some(seconds) = gate.wait_seconds {
            let mut cancel = ctx.cancel.clone();
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(seconds)) => {}
                _ = cancel.changed() => {}
            }
        }
    } else {
        warn!(task = %task.name, gate = %gate.kind, "gate kind has no in-core resolver; passing through");
    }

    ctx.bus.publish(Event::new(
        EventKind::GateResolved,
        &ctx.run_id,
        &ctx.options.node,
        serde_json::json!({ "task": task.name, "gate": gate.kind }),
    ));
}

/// Each retry is a fresh invocation, not a continuation.
async fn attempt_loop(
    task: &Task,
    ctx: &WorkerContext,
    secrets: Vec<(String, String)>,
    cache_miss: Option<MissReason>,
) -> TaskOutcome {
    let max_attempts = task.retry + 1;
    let opts = RunOptions {
        timeout_secs: task.effective_timeout(ctx.options.default_timeout_secs),
        cancel: ctx.cancel.clone(),
        bus: ctx.bus.clone(),
        run_id: ctx.run_id.clone(),
        node: ctx.options.node.clone(),
        secrets,
    };

    let mut last_error: Option<SykliError> = None;
    let mut attempts = 0;
    for attempt in 1..=max_attempts {
        if *ctx.cancel.borrow() {
            break;
        }
        attempts = attempt;
        match ctx.target.run_task(task, &opts).await {
            Ok(run) => {
                let mut outcome = TaskOutcome::new(&task.name, TaskStatus::Passed);
                outcome.duration_ms = run.duration_ms;
                outcome.output = run.output;
                outcome.cache_miss = cache_miss;
                outcome.attempts = attempts;
                return outcome;
            }
            Err(e) => {
                if attempt < max_attempts {
                    debug!(task = %task.name, attempt, "attempt failed, retrying: {}", e);
                }
                last_error = Some(e);
            }
        }
    }

    let mut outcome = TaskOutcome::new(&task.name, TaskStatus::Failed);
    outcome.attempts = attempts;
    outcome.cache_miss = cache_miss;
    match last_error {
        Some(SykliError::TaskFailed {
            exit_code,
            output,
            duration_ms,
            ..
        }) => {
            let rendered = SykliError::TaskFailed {
                task: task.name.clone(),
                command: task.command.clone(),
                exit_code,
                output: output.clone(),
                duration_ms,
            };
            outcome.error = Some(rendered.to_string());
            outcome.error_code = Some("E001".to_string());
            outcome.exit_code = Some(exit_code);
            outcome.output = output;
            outcome.duration_ms = duration_ms;
        }
        Some(e) => {
            outcome.error_code = Some(e.code().to_string());
            outcome.error = Some(e.to_string());
        }
        None => {
            outcome.status = TaskStatus::Blocked;
        }
    }
    outcome
}

/// Copy every `task_input` into place; any failure aborts the task.
async fn resolve_artifacts(task: &Task, ctx: &WorkerContext) -> Result<()> {
    for input in &task.task_inputs {
        let source = ctx.graph.get(&input.from_task).ok_or_else(|| {
            SykliError::InvalidArtifact {
                task: task.name.clone(),
                reason: format!("unknown source task '{}'", input.from_task),
            }
        })?;
        let src = ctx
            .target
            .artifact_path(source, &input.output, &ctx.options.workdir)
            .ok_or_else(|| SykliError::InvalidArtifact {
                task: task.name.clone(),
                reason: format!(
                    "output '{}' of task '{}' produced no file",
                    input.output, input.from_task
                ),
            })?;
        ctx.target
            .copy_artifact(&src, std::path::Path::new(&input.dest), &ctx.options.workdir)
            .await?;
    }
    Ok(())
}

/// Resolve every declared secret; missing ones fail the task with E003.
async fn resolve_secrets(task: &Task, ctx: &WorkerContext) -> Result<Vec<(String, String)>> {
    let mut resolved = Vec::with_capacity(task.secrets.len());
    let mut missing = Vec::new();
    for name in &task.secrets {
        match ctx.target.resolve_secret(name).await? {
            Some(value) => resolved.push((name.clone(), value)),
            None => missing.push(name.clone()),
        }
    }
    if !missing.is_empty() {
        return Err(SykliError::MissingSecrets {
            task: task.name.clone(),
            missing,
        });
    }
    Ok(resolved)
}

/// Keep tasks whose name contains `substring`, plus their transitive
/// dependencies.
fn filter_graph(graph: &Graph, substring: &str) -> Graph {
    let mut keep: std::collections::BTreeSet<String> = std::collections::BTreeSet::new();
    let mut stack: Vec<String> = graph
        .tasks
        .keys()
        .filter(|name| name.contains(substring))
        .cloned()
        .collect();

    while let Some(name) = stack.pop() {
        if !keep.insert(name.clone()) {
            continue;
        }
        if let Some(task) = graph.get(&name) {
            stack.extend(task.depends_on.iter().cloned());
        }
    }

    Graph {
        tasks: graph
            .tasks
            .iter()
            .filter(|(name, _)| keep.contains(*name))
            .map(|(name, task)| (name.clone(), task.clone()))
            .collect(),
    }
}

// ============================================================================
// TESTS
// ============================================================================
