//! Sykli CLI - CI/CD pipeline runner.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use colored::Colorize;

use sykli::cache::CacheRepo;
use sykli::config;
use sykli::daemon::{self, DaemonOptions};
use sykli::delta;
use sykli::error::{format_error, Result, SykliError};
use sykli::events::EventBus;
use sykli::exec::{ExecOptions, Executor, RunSummary, TaskStatus};
use sykli::gitctx;
use sykli::graph::{topo, Graph};
use sykli::history::occurrence::OccurrenceStore;
use sykli::history::{occurrence, HistoryStore};
use sykli::mesh::placement::Candidate;
use sykli::mesh::rpc::RpcClient;
use sykli::mesh::{self, discovery, verify, NodeRole};
use sykli::planner;
use sykli::sdk;
use sykli::target::mesh::MeshTarget;
use sykli::target::{create_target, Target};

#[derive(Parser)]
#[command(name = "sykli")]
#[command(about = "Sykli - CI/CD pipeline runner with caching and mesh distribution")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline (the default subcommand)
    Run {
        /// Project directory, or a pre-emitted graph JSON file
        path: Option<String>,

        /// Only run tasks whose name contains this substring (plus deps)
        #[arg(long)]
        filter: Option<String>,

        /// Default per-task timeout: 0 | <n> | <n>{s,m,h,d}
        #[arg(long, default_value = "5m")]
        timeout: String,

        /// Execution driver
        #[arg(long, default_value = "local")]
        target: String,

        /// Distribute label-restricted tasks across discovered daemons
        #[arg(long)]
        mesh: bool,

        /// Allow mesh runs from a dirty working tree
        #[arg(long)]
        allow_dirty: bool,
    },

    /// Show tasks affected by changes since a git revision
    Delta {
        #[arg(long, default_value = "HEAD")]
        from: String,

        #[arg(long)]
        dry_run: bool,

        #[arg(long)]
        json: bool,

        #[arg(long)]
        verbose: bool,
    },

    /// Emit the pipeline as a diagram
    Graph {
        #[arg(long)]
        mermaid: bool,

        #[arg(long)]
        dot: bool,
    },

    /// Validate the pipeline without running it
    Validate {
        #[arg(long)]
        json: bool,
    },

    /// Inspect or clean the content-addressed cache
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },

    /// Manage the long-running mesh daemon
    Daemon {
        #[command(subcommand)]
        command: DaemonCommands,
    },

    /// Show the last run's occurrence report
    Report {
        /// Show the most recent fully-passing run instead
        #[arg(long)]
        last_good: bool,

        #[arg(long)]
        json: bool,
    },

    /// List recent runs
    History {
        #[arg(long, default_value_t = 10)]
        limit: usize,

        #[arg(long)]
        json: bool,
    },

    /// Explain the last failure (error block + causality)
    Explain {
        #[arg(long)]
        json: bool,
    },

    /// Write and print the AI-consumption context file
    Context,

    /// Re-run completed tasks on differing platforms
    Verify {
        /// Run id to verify, or "latest"
        #[arg(long, default_value = "latest")]
        from: String,

        #[arg(long)]
        dry_run: bool,

        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum CacheCommands {
    /// Entry/blob counts and total size
    Stats,
    /// Delete entries (all, or older than a duration)
    Clean {
        #[arg(long)]
        older_than: Option<String>,
    },
    /// Print the cache directory
    Path,
}

#[derive(Subcommand)]
enum DaemonCommands {
    Start {
        #[arg(long)]
        foreground: bool,

        #[arg(long, default_value = "full")]
        role: String,

        /// Extra labels, comma-separated
        #[arg(long)]
        labels: Option<String>,
    },
    Stop,
    Status,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Run {
        path: None,
        filter: None,
        timeout: "5m".to_string(),
        target: "local".to_string(),
        mesh: false,
        allow_dirty: false,
    });

    let result = match command {
        Commands::Run {
            path,
            filter,
            timeout,
            target,
            mesh,
            allow_dirty,
        } => cmd_run(path, filter, &timeout, &target, mesh, allow_dirty).await,
        Commands::Delta {
            from,
            dry_run,
            json,
            verbose,
        } => cmd_delta(&from, dry_run, json, verbose).await,
        Commands::Graph { mermaid, dot } => cmd_graph(mermaid, dot).await,
        Commands::Validate { json } => cmd_validate(json).await,
        Commands::Cache { command } => cmd_cache(command),
        Commands::Daemon { command } => cmd_daemon(command).await,
        Commands::Report { last_good, json } => cmd_report(last_good, json),
        Commands::History { limit, json } => cmd_history(limit, json),
        Commands::Explain { json } => cmd_explain(json),
        Commands::Context => cmd_context().await,
        Commands::Verify {
            from,
            dry_run,
            json,
        } => cmd_verify(&from, dry_run, json).await,
    };

    match result {
        Ok(ok) if ok => {}
        Ok(_) => std::process::exit(1),
        Err(e) => {
            eprintln!("{} {}", "Error:".red().bold(), format_error(&e));
            std::process::exit(1);
        }
    }
}

/// Parse `0 | <n> | <n>{s,m,h,d}` into seconds.
fn parse_timeout(raw: &str) -> Result<u64> {
    let raw = raw.trim();
    let (digits, unit) = match raw.find(|c: char| !c.is_ascii_digit()) {
        None => (raw, ""),
        Some(i) => raw.split_at(i),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| SykliError::Internal(format!("invalid timeout '{}'", raw)))?;
    let seconds = match unit {
        "" | "s" => value,
        "m" => value * 60,
        "h" => value * 3600,
        "d" => value * 86_400,
        other => {
            return Err(SykliError::Internal(format!(
                "invalid timeout unit '{}'; use s, m, h, or d",
                other
            )))
        }
    };
    Ok(seconds)
}

/// Load the graph from a project directory or a pre-emitted JSON file.
async fn load_graph_from(path: &Path) -> Result<Graph> {
    if path.is_file() {
        let json = tokio::fs::read_to_string(path).await?;
        return sykli::graph::load_graph(&json);
    }
    sdk::load_pipeline(path).await
}

fn workdir_of(path: &Option<String>) -> (PathBuf, PathBuf) {
    let given = PathBuf::from(path.as_deref().unwrap_or("."));
    let workdir = if given.is_file() {
        match given.parent() {
            Some(parent) if parent != Path::new("") => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    } else {
        given.clone()
    };
    (given, workdir)
}

// ============================================================================
// RUN
// ============================================================================

async fn cmd_run(
    path: Option<String>,
    filter: Option<String>,
    timeout: &str,
    target_name: &str,
    use_mesh: bool,
    allow_dirty: bool,
) -> Result<bool> {
    let (graph_path, workdir) = workdir_of(&path);
    let timeout_secs = parse_timeout(timeout)?;
    let graph = load_graph_from(&graph_path).await?;
    let node_name = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "local".to_string());

    let target: Arc<dyn Target> = if use_mesh {
        // Remote nodes run against the committed tree, so it must be clean.
        if gitctx::is_git_repo(&workdir).await && !allow_dirty && gitctx::is_dirty(&workdir).await?
        {
            return Err(SykliError::DirtyWorkdir);
        }
        let config = config::Config::from_env()?;
        let peers = discovery::discover(config.port, &config.cookie, Duration::from_secs(1)).await?;
        println!(
            "{} mesh: {} peer(s) discovered",
            "→".cyan(),
            peers.len()
        );
        Arc::new(MeshTarget::new(
            &workdir,
            node_name.clone(),
            mesh::all_labels(&config.labels),
            peers,
            config.cookie.clone(),
        ))
    } else {
        create_target(target_name, &workdir)?
    };

    let bus = EventBus::new();
    let executor = Executor::new(
        graph.clone(),
        target,
        CacheRepo::open_default(),
        bus,
        ExecOptions {
            workdir: workdir.clone(),
            default_timeout_secs: timeout_secs,
            filter,
            node: node_name,
            use_cache: true,
        },
    );

    println!(
        "{} running {} task(s)",
        "→".cyan(),
        graph.len().to_string().bold()
    );
    let summary = executor.run().await?;
    print_summary(&summary);

    persist_run(&summary, &graph, &workdir).await;
    Ok(summary.success())
}

fn print_summary(summary: &RunSummary) {
    println!();
    for level in &summary.levels {
        for name in level {
            let Some(outcome) = summary.outcomes.get(name) else {
                continue;
            };
            let (symbol, label) = match outcome.status {
                TaskStatus::Passed => ("✓".green(), "passed".green()),
                TaskStatus::Failed => ("✗".red(), "failed".red()),
                TaskStatus::Cached => ("≡".cyan(), "cached".cyan()),
                TaskStatus::Skipped => ("○".yellow(), "skipped".yellow()),
                TaskStatus::Blocked => ("◼".red(), "blocked".red()),
            };
            println!(
                "  {} {} {} ({}ms)",
                symbol,
                name.bold(),
                label,
                outcome.duration_ms
            );
            if let Some(error) = &outcome.error {
                println!("      {}", error.red());
            }
        }
    }
    println!(
        "\n{} passed, {} failed, {} cached, {} skipped, {} blocked",
        summary.count(TaskStatus::Passed),
        summary.count(TaskStatus::Failed),
        summary.count(TaskStatus::Cached),
        summary.count(TaskStatus::Skipped),
        summary.count(TaskStatus::Blocked),
    );
}

/// Record history, task logs, and the occurrence document. Never fatal.
async fn persist_run(summary: &RunSummary, graph: &Graph, workdir: &Path) {
    let git = gitctx::collect(workdir).await;
    let history = HistoryStore::at(workdir);
    let occurrences = OccurrenceStore::at(workdir);

    let changed_since_good = match history.last_good().and_then(|r| r.git_sha) {
        Some(sha) => gitctx::diff_names(workdir, &sha).await.unwrap_or_default(),
        None => Vec::new(),
    };

    let record = match history.record_run(summary, &git, graph) {
        Ok(record) => Some(record),
        Err(e) => {
            eprintln!("{} failed to record run history: {}", "!".yellow(), e);
            None
        }
    };
    if let Err(e) = history.write_task_logs(summary) {
        eprintln!("{} failed to write task logs: {}", "!".yellow(), e);
    }

    let priors = occurrences.load_priors(10);
    let occ = occurrence::build(summary, graph, &git, workdir, &changed_since_good, &priors).await;

    // Fold the causality estimate back into the persisted record.
    if let (Some(mut record), Some(reasoning)) = (record, occ.reasoning.as_ref()) {
        for item in &reasoning.tasks {
            if let Some(task_record) = record.tasks.get_mut(&item.task) {
                task_record.likely_cause = item.changed_files.clone();
            }
        }
        if let Err(e) = history.save(&record) {
            eprintln!("{} failed to update run record: {}", "!".yellow(), e);
        }
    }
    if let Err(e) = occurrences.persist(&occ) {
        eprintln!("{} failed to persist occurrence: {}", "!".yellow(), e);
    }
    if let Err(e) = occurrences.write_context(graph, Some(&occ)) {
        eprintln!("{} failed to write context: {}", "!".yellow(), e);
    }
}

// ============================================================================
// DELTA / GRAPH / VALIDATE
// ============================================================================

async fn cmd_delta(from: &str, _dry_run: bool, json: bool, verbose: bool) -> Result<bool> {
    let workdir = PathBuf::from(".");
    let graph = load_graph_from(&workdir).await?;

    if !gitctx::rev_exists(&workdir, from).await {
        return Err(SykliError::Internal(format!(
            "revision '{}' not found in this repository",
            from
        )));
    }

    let delta_result = delta::compute(&graph, &workdir, from).await?;
    let history = HistoryStore::at(&workdir);
    let plan = planner::plan(
        &graph,
        &delta_result,
        &CacheRepo::open_default(),
        &workdir,
        &history.durations(),
    )?;

    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(true);
    }

    println!(
        "{} {} file(s) changed since {}",
        "→".cyan(),
        plan.changed_files.len(),
        from.bold()
    );
    if verbose {
        for file in &plan.changed_files {
            println!("    {}", file.dimmed());
        }
    }
    if plan.affected.is_empty() {
        println!("{} nothing affected", "✓".green());
        return Ok(true);
    }

    for task in &plan.affected {
        match task.reason {
            delta::AffectReason::Direct => {
                println!("  {} {} {}", "●".red(), task.name.bold(), "direct".red());
                if verbose {
                    for file in &task.files {
                        println!("      {}", file.dimmed());
                    }
                }
            }
            delta::AffectReason::Dependent => {
                println!(
                    "  {} {} {}",
                    "○".yellow(),
                    task.name.bold(),
                    "dependent".yellow()
                );
            }
        }
    }
    println!(
        "\n{} level(s), max parallelism {}, estimated {}ms on the critical path",
        plan.levels.len(),
        plan.max_parallelism,
        plan.estimated_total_ms
    );
    Ok(true)
}

async fn cmd_graph(_mermaid: bool, dot: bool) -> Result<bool> {
    let graph = load_graph_from(Path::new(".")).await?;

    if dot {
        println!("digraph pipeline {{");
        for task in graph.tasks.values() {
            if task.depends_on.is_empty() {
                println!("    \"{}\";", task.name);
            }
            for dep in &task.depends_on {
                println!("    \"{}\" -> \"{}\";", dep, task.name);
            }
        }
        println!("}}");
    } else {
        println!("graph TD");
        for task in graph.tasks.values() {
            if task.depends_on.is_empty() {
                println!("    {}", mermaid_id(&task.name));
            }
            for dep in &task.depends_on {
                println!("    {} --> {}", mermaid_id(dep), mermaid_id(&task.name));
            }
        }
    }
    Ok(true)
}

fn mermaid_id(name: &str) -> String {
    name.replace(|c: char| !c.is_ascii_alphanumeric(), "_")
}

async fn cmd_validate(json: bool) -> Result<bool> {
    let result = load_graph_from(Path::new(".")).await;

    if json {
        let body = match &result {
            Ok(graph) => serde_json::json!({
                "valid": true,
                "tasks": graph.len(),
                "levels": topo::levels(graph).map(|l| l.len()).unwrap_or(0),
            }),
            Err(e) => serde_json::json!({
                "valid": false,
                "code": e.code(),
                "error": e.to_string(),
            }),
        };
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(result.is_ok());
    }

    let graph = result?;
    let levels = topo::levels(&graph)?;
    println!(
        "{} pipeline is valid: {} task(s) in {} level(s)",
        "✓".green(),
        graph.len(),
        levels.len()
    );
    Ok(true)
}

// ============================================================================
// CACHE / DAEMON
// ============================================================================

fn cmd_cache(command: CacheCommands) -> Result<bool> {
    let repo = CacheRepo::open_default();
    match command {
        CacheCommands::Stats => {
            let stats = repo.stats();
            println!("entries: {}", stats.entries);
            println!("blobs:   {}", stats.blobs);
            println!("size:    {} bytes", stats.total_bytes);
        }
        CacheCommands::Clean { older_than } => {
            let report = match older_than {
                Some(duration) => repo.clean_older_than(parse_timeout(&duration)?)?,
                None => repo.clean_all()?,
            };
            println!(
                "{} removed {} entr{} and {} blob(s)",
                "✓".green(),
                report.entries_removed,
                if report.entries_removed == 1 { "y" } else { "ies" },
                report.blobs_removed
            );
        }
        CacheCommands::Path => println!("{}", repo.root().display()),
    }
    Ok(true)
}

async fn cmd_daemon(command: DaemonCommands) -> Result<bool> {
    let pid_path = config::daemon_pid_path();
    match command {
        DaemonCommands::Start {
            foreground,
            role,
            labels,
        } => {
            let role: NodeRole = role
                .parse()
                .map_err(SykliError::Internal)?;
            daemon::start(
                DaemonOptions {
                    role,
                    foreground,
                    labels: config::parse_labels(labels.as_deref()),
                    workdir: std::env::current_dir()?,
                },
                &pid_path,
            )
            .await?;
            Ok(true)
        }
        DaemonCommands::Stop => {
            if daemon::stop(&pid_path)? {
                println!("{} daemon stopped", "✓".green());
            } else {
                println!("no daemon running");
            }
            Ok(true)
        }
        DaemonCommands::Status => match daemon::status(&pid_path) {
            Some(pid) => {
                println!("{} daemon running (pid {})", "✓".green(), pid);
                Ok(true)
            }
            None => {
                println!("no daemon running");
                Ok(false)
            }
        },
    }
}

// ============================================================================
// REPORT / HISTORY / EXPLAIN / CONTEXT / VERIFY
// ============================================================================

fn cmd_report(last_good: bool, json: bool) -> Result<bool> {
    let workdir = PathBuf::from(".");

    if last_good {
        let history = HistoryStore::at(&workdir);
        let Some(record) = history.last_good() else {
            println!("no passing run recorded yet");
            return Ok(false);
        };
        if json {
            println!("{}", serde_json::to_string_pretty(&record)?);
        } else {
            println!(
                "{} last good run {} on {} ({} task(s))",
                "✓".green(),
                record.id.bold(),
                record.branch.as_deref().unwrap_or("?"),
                record.tasks.len()
            );
        }
        return Ok(true);
    }

    let Some(occ) = OccurrenceStore::at(&workdir).load_last() else {
        println!("no run recorded yet");
        return Ok(false);
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&occ)?);
        return Ok(true);
    }

    println!("run {} - {}", occ.id.bold(), occ.kind);
    println!(
        "  {} passed, {} failed, {} cached, {} skipped, {} blocked",
        occ.ci.summary.passed,
        occ.ci.summary.failed,
        occ.ci.summary.cached,
        occ.ci.summary.skipped,
        occ.ci.summary.blocked
    );
    if let Some(error) = &occ.error {
        println!("  {} {}", "✗".red(), error.what_failed.red());
        if let Some(fix) = &error.suggested_fix {
            println!("    fix: {}", fix);
        }
    }
    Ok(true)
}

fn cmd_history(limit: usize, json: bool) -> Result<bool> {
    let history = HistoryStore::at(Path::new("."));
    let records = history.load_recent(limit);

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(true);
    }
    if records.is_empty() {
        println!("no runs recorded yet");
        return Ok(true);
    }
    for record in records {
        let outcome = match record.outcome {
            sykli::history::RunOutcome::Passed => "passed".green(),
            sykli::history::RunOutcome::Failed => "failed".red(),
        };
        println!(
            "{}  {}  {}  {} task(s)",
            record.id,
            record.started_at.format("%Y-%m-%d %H:%M:%S"),
            outcome,
            record.tasks.len()
        );
    }
    Ok(true)
}

fn cmd_explain(json: bool) -> Result<bool> {
    let Some(occ) = OccurrenceStore::at(Path::new(".")).load_last() else {
        println!("no run recorded yet");
        return Ok(false);
    };

    if json {
        let body = serde_json::json!({
            "error": occ.error,
            "reasoning": occ.reasoning,
            "regressions": occ.history.regressions,
        });
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(true);
    }

    let Some(error) = &occ.error else {
        println!("{} last run passed; nothing to explain", "✓".green());
        return Ok(true);
    };

    println!("{} {}", "✗".red().bold(), error.what_failed);
    println!("  {}", error.why_it_matters);
    for cause in &error.possible_causes {
        println!("  - {}", cause);
    }
    for location in &error.locations {
        print!("  at {}:{}", location.file, location.line);
        if let Some(blame) = &location.blame {
            print!("  (last touched by {} in {})", blame.author, &blame.sha[..8.min(blame.sha.len())]);
        }
        println!();
    }
    if let Some(reasoning) = &occ.reasoning {
        for task in &reasoning.tasks {
            println!(
                "  {} {} (confidence {:.0}%)",
                "→".cyan(),
                task.summary,
                task.confidence * 100.0
            );
        }
    }
    if !occ.history.regressions.is_empty() {
        println!(
            "  {} regression: {}",
            "!".yellow(),
            occ.history.regressions.join(", ")
        );
    }
    Ok(true)
}

async fn cmd_context() -> Result<bool> {
    let workdir = PathBuf::from(".");
    let graph = load_graph_from(&workdir).await?;
    let store = OccurrenceStore::at(&workdir);
    store.write_context(&graph, store.load_last().as_ref())?;

    let path = config::project_state_dir(&workdir).join("context.json");
    println!("{}", std::fs::read_to_string(path)?);
    Ok(true)
}

async fn cmd_verify(from: &str, dry_run: bool, json: bool) -> Result<bool> {
    let workdir = PathBuf::from(".");
    let graph = load_graph_from(&workdir).await?;
    let history = HistoryStore::at(&workdir);
    let config = config::Config::from_env()?;

    let mut record = if from == "latest" {
        history.last()
    } else {
        history.load(from)
    }
    .ok_or_else(|| SykliError::Internal(format!("no run record for '{}'", from)))?;

    let peers = discovery::discover(config.port, &config.cookie, Duration::from_secs(1)).await?;
    let local_labels = mesh::all_labels(&config.labels);
    let remotes: Vec<Candidate> = peers
        .iter()
        .filter(|p| p.role.accepts_tasks())
        .map(|p| Candidate {
            node: p.name.clone(),
            labels: p.capabilities.labels.clone(),
        })
        .collect();

    let entries = verify::plan(&record, &graph, &local_labels, &remotes);

    if dry_run || json {
        if json {
            println!("{}", serde_json::to_string_pretty(&entries)?);
        } else {
            for entry in &entries {
                match &entry.decision {
                    verify::VerifyDecision::Rerun { node } => {
                        println!("  {} {} → {}", "→".cyan(), entry.task.bold(), node)
                    }
                    verify::VerifyDecision::Skip(reason) => {
                        println!("  {} {} ({:?})", "○".yellow(), entry.task, reason)
                    }
                }
            }
        }
        if dry_run {
            return Ok(true);
        }
    }

    let clients: BTreeMap<String, RpcClient> = peers
        .iter()
        .map(|p| {
            (
                p.name.clone(),
                RpcClient::new(&p.name, &format!("{}:{}", p.host, p.port), &config.cookie),
            )
        })
        .collect();

    let verification = verify::execute(&entries, |task_name, node| {
        let clients = &clients;
        let graph = &graph;
        async move {
            let client = clients
                .get(&node)
                .ok_or_else(|| format!("node '{}' disappeared", node))?;
            let task = graph
                .get(&task_name)
                .ok_or_else(|| format!("task '{}' no longer in the graph", task_name))?;
            let outcome = client.run_task(task).await.map_err(|e| e.to_string())?;
            match outcome.status {
                TaskStatus::Passed | TaskStatus::Cached => Ok(()),
                _ => Err(outcome
                    .error
                    .unwrap_or_else(|| format!("remote status {:?}", outcome.status))),
            }
        }
    })
    .await;

    println!(
        "{} verified {}, failed {}, skipped {}",
        if verification.failed == 0 {
            "✓".green()
        } else {
            "✗".red()
        },
        verification.verified,
        verification.failed,
        verification.skipped
    );

    let ok = verification.failed == 0;
    verify::merge(&mut record, verification);
    history.save(&record)?;
    Ok(ok)
}
