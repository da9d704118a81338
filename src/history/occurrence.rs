//! The post-run occurrence document.
//!
//! An occurrence joins executor results, parsed error locations with git
//! blame, causality (changed files vs task inputs), and cross-run history
//! into one document built for programmatic consumption. The last run is
//! kept as `occurrence.json`; a ring of binary snapshots lives under
//! `occurrences/`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::delta::glob_match;
use crate::error::{hint_for_failure, Result};
use crate::exec::{RunSummary, TaskOutcome, TaskStatus};
use crate::gitctx::GitContext;
use crate::graph::Graph;

use super::locations::{self, ErrorLocation};
use super::RunOutcome;

pub const OCCURRENCE_VERSION: u32 = 1;

/// Binary snapshots kept in the ring.
const OCCURRENCE_RING: usize = 50;

/// Lines of task output embedded in the error block.
const OUTPUT_LINES: usize = 200;

/// Prior occurrences consulted for recent outcomes and regressions.
const HISTORY_WINDOW: usize = 10;

// ============================================================================
// DOCUMENT MODEL
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Occurrence {
    pub version: u32,
    /// The run id.
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub outcome: RunOutcome,
    /// `info` for passing runs, `error` for failing ones.
    pub severity: String,
    /// `ci.run.passed` or `ci.run.failed`.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBlock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<ReasoningBlock>,
    pub history: HistoryBlock,
    pub ci: CiData,
}

/// Present only on failing runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBlock {
    pub what_failed: String,
    pub why_it_matters: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub possible_causes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_fix: Option<String>,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub locations: Vec<ErrorLocation>,
}

/// Causality estimate for one failed task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReasoning {
    pub task: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changed_files: Vec<String>,
    /// 0.8 when changed files intersect the task's inputs, 0.2 otherwise.
    pub confidence: f64,
    pub summary: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningBlock {
    pub tasks: Vec<TaskReasoning>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDescriptor {
    pub name: String,
    pub status: TaskStatus,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryBlock {
    /// Steps in level order.
    pub steps: Vec<StepDescriptor>,
    /// Task -> recent outcomes (`pass`/`fail`/`skip`), newest first.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub recent_outcomes: BTreeMap<String, Vec<String>>,
    /// Tasks failing now that passed in every prior window occurrence.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub regressions: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CiSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub cached: usize,
    pub skipped: usize,
    pub blocked: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDetail {
    pub command: String,
    pub status: TaskStatus,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub covers: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CiData {
    pub git: GitContext,
    pub summary: CiSummary,
    pub tasks: BTreeMap<String, TaskDetail>,
}

// ============================================================================
// BUILDER
// ============================================================================

/// Assemble the occurrence for a finished run.
///
/// `changed_since_good` is the diff against the last-good ref; `priors`
/// are previous occurrences, newest first.
pub async fn build(
    summary: &RunSummary,
    graph: &Graph,
    git: &GitContext,
    workdir: &Path,
    changed_since_good: &[String],
    priors: &[Occurrence],
) -> Occurrence {
    let failed: Vec<&TaskOutcome> = summary.failed_tasks().collect();
    let passed = summary.success();

    let error = if failed.is_empty() {
        None
    } else {
        Some(build_error_block(&failed, workdir).await)
    };

    let reasoning = if failed.is_empty() {
        None
    } else {
        Some(build_reasoning(&failed, graph, changed_since_good))
    };

    Occurrence {
        version: OCCURRENCE_VERSION,
        id: summary.run_id.clone(),
        timestamp: summary.finished_at,
        outcome: if passed {
            RunOutcome::Passed
        } else {
            RunOutcome::Failed
        },
        severity: if passed { "info" } else { "error" }.to_string(),
        kind: if passed {
            "ci.run.passed"
        } else {
            "ci.run.failed"
        }
        .to_string(),
        error,
        reasoning,
        history: build_history(summary, priors),
        ci: build_ci(summary, graph, git),
    }
}

async fn build_error_block(failed: &[&TaskOutcome], workdir: &Path) -> ErrorBlock {
    if failed.len() == 1 {
        let task = failed[0];
        let extracted = locations::extract(&task.output);
        let enriched = locations::enrich(extracted, workdir).await;

        let mut possible_causes = Vec::new();
        if let Some(first) = enriched.first() {
            possible_causes.push(format!("recent change in {}:{}", first.file, first.line));
        }
        if task.attempts > 1 {
            possible_causes.push(format!("failed {} attempts; unlikely to be flaky", task.attempts));
        }

        ErrorBlock {
            what_failed: format!("task '{}' failed", task.name),
            why_it_matters: "downstream tasks were blocked and the pipeline did not complete"
                .to_string(),
            possible_causes,
            suggested_fix: task
                .exit_code
                .and_then(|code| hint_for_failure(code, &task.output)),
            output: truncate_lines(&task.output, OUTPUT_LINES),
            exit_code: task.exit_code,
            locations: enriched,
        }
    } else {
        let names: Vec<&str> = failed.iter().map(|t| t.name.as_str()).collect();
        ErrorBlock {
            what_failed: format!("{} tasks failed: {}", failed.len(), names.join(", ")),
            why_it_matters: "multiple pipeline stages are broken; fix the earliest level first"
                .to_string(),
            possible_causes: failed
                .iter()
                .filter_map(|t| t.error.as_ref().map(|e| format!("{}: {}", t.name, e)))
                .collect(),
            suggested_fix: None,
            output: failed
                .iter()
                .map(|t| format!("=== {} ===\n{}", t.name, truncate_lines(&t.output, 40)))
                .collect::<Vec<_>>()
                .join("\n"),
            exit_code: None,
            locations: Vec::new(),
        }
    }
}

fn build_reasoning(
    failed: &[&TaskOutcome],
    graph: &Graph,
    changed_since_good: &[String],
) -> ReasoningBlock {
    let tasks = failed
        .iter()
        .map(|outcome| {
            let inputs = graph
                .get(&outcome.name)
                .map(|t| t.inputs.clone())
                .unwrap_or_default();
            let changed_files: Vec<String> = changed_since_good
                .iter()
                .filter(|file| inputs.iter().any(|pattern| glob_match(pattern, file)))
                .cloned()
                .collect();

            let (confidence, summary) = if changed_files.is_empty() {
                (
                    0.2,
                    format!(
                        "no changed file matches the inputs of '{}'; the cause may be \
                         environmental",
                        outcome.name
                    ),
                )
            } else {
                (
                    0.8,
                    format!(
                        "'{}' most likely broke because of {}",
                        outcome.name, changed_files[0]
                    ),
                )
            };

            TaskReasoning {
                task: outcome.name.clone(),
                changed_files,
                confidence,
                summary,
            }
        })
        .collect();
    ReasoningBlock { tasks }
}

fn build_history(summary: &RunSummary, priors: &[Occurrence]) -> HistoryBlock {
    let steps = summary
        .levels
        .iter()
        .flatten()
        .filter_map(|name| summary.outcomes.get(name))
        .map(|o| StepDescriptor {
            name: o.name.clone(),
            status: o.status,
            duration_ms: o.duration_ms,
        })
        .collect();

    let window: Vec<&Occurrence> = priors.iter().take(HISTORY_WINDOW).collect();
    let mut recent_outcomes: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for name in summary.outcomes.keys() {
        let trail: Vec<String> = window
            .iter()
            .filter_map(|occ| occ.ci.tasks.get(name))
            .map(|detail| outcome_word(detail.status).to_string())
            .collect();
        if !trail.is_empty() {
            recent_outcomes.insert(name.clone(), trail);
        }
    }

    let regressions = summary
        .failed_tasks()
        .filter(|outcome| {
            let appearances: Vec<TaskStatus> = window
                .iter()
                .filter_map(|occ| occ.ci.tasks.get(&outcome.name))
                .map(|detail| detail.status)
                .filter(|s| matches!(s, TaskStatus::Passed | TaskStatus::Cached | TaskStatus::Failed))
                .collect();
            !appearances.is_empty()
                && appearances
                    .iter()
                    .all(|s| matches!(s, TaskStatus::Passed | TaskStatus::Cached))
        })
        .map(|outcome| outcome.name.clone())
        .collect();

    HistoryBlock {
        steps,
        recent_outcomes,
        regressions,
    }
}

fn build_ci(summary: &RunSummary, graph: &Graph, git: &GitContext) -> CiData {
    let tasks = summary
        .outcomes
        .iter()
        .map(|(name, outcome)| {
            let task = graph.get(name);
            let error = outcome.error.as_ref().map(|message| {
                let mut map = BTreeMap::new();
                map.insert("message".to_string(), serde_json::json!(message));
                if let Some(code) = &outcome.error_code {
                    map.insert("code".to_string(), serde_json::json!(code));
                }
                if let Some(exit) = outcome.exit_code {
                    map.insert("exit_code".to_string(), serde_json::json!(exit));
                }
                map
            });
            (
                name.clone(),
                TaskDetail {
                    command: task.map(|t| t.command.clone()).unwrap_or_default(),
                    status: outcome.status,
                    duration_ms: outcome.duration_ms,
                    error,
                    covers: task
                        .and_then(|t| t.semantic.as_ref())
                        .map(|s| s.covers.clone())
                        .unwrap_or_default(),
                    inputs: task.map(|t| t.inputs.clone()).unwrap_or_default(),
                    outputs: task.map(|t| t.outputs.clone()).unwrap_or_default(),
                },
            )
        })
        .collect();

    CiData {
        git: git.clone(),
        summary: CiSummary {
            total: summary.outcomes.len(),
            passed: summary.count(TaskStatus::Passed),
            failed: summary.count(TaskStatus::Failed),
            cached: summary.count(TaskStatus::Cached),
            skipped: summary.count(TaskStatus::Skipped),
            blocked: summary.count(TaskStatus::Blocked),
        },
        tasks,
    }
}

fn outcome_word(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Passed | TaskStatus::Cached => "pass",
        TaskStatus::Failed => "fail",
        TaskStatus::Skipped | TaskStatus::Blocked => "skip",
    }
}

fn truncate_lines(text: &str, max: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    if lines.len() <= max {
        return text.to_string();
    }
    let tail = &lines[lines.len() - max..];
    format!("... ({} lines truncated)\n{}", lines.len() - max, tail.join("\n"))
}

// ============================================================================
// STORE
// ============================================================================

/// Occurrence persistence under `<project>/.sykli`.
#[derive(Debug, Clone)]
pub struct OccurrenceStore {
    dir: PathBuf,
}

impl OccurrenceStore {
    pub fn at(project_root: &Path) -> Self {
        Self {
            dir: crate::config::project_state_dir(project_root),
        }
    }

    fn ring_dir(&self) -> PathBuf {
        self.dir.join("occurrences")
    }

    fn last_path(&self) -> PathBuf {
        self.dir.join("occurrence.json")
    }

    /// Write `occurrence.json`, add a ring snapshot, enforce the ring cap.
    pub fn persist(&self, occurrence: &Occurrence) -> Result<()> {
        std::fs::create_dir_all(self.ring_dir())?;
        std::fs::write(self.last_path(), serde_json::to_vec_pretty(occurrence)?)?;
        std::fs::write(
            self.ring_dir().join(format!("{}.bin", occurrence.id)),
            serde_json::to_vec(occurrence)?,
        )?;
        self.prune_ring();
        Ok(())
    }

    pub fn load_last(&self) -> Option<Occurrence> {
        let bytes = std::fs::read(self.last_path()).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// Ring snapshots, newest first (ULID filenames sort by age).
    pub fn load_priors(&self, limit: usize) -> Vec<Occurrence> {
        let Ok(dir) = std::fs::read_dir(self.ring_dir()) else {
            return Vec::new();
        };
        let mut names: Vec<String> = dir
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.ends_with(".bin"))
            .collect();
        names.sort();
        names.reverse();
        names
            .into_iter()
            .take(limit)
            .filter_map(|name| {
                let bytes = std::fs::read(self.ring_dir().join(&name)).ok()?;
                serde_json::from_slice(&bytes).ok()
            })
            .collect()
    }

    /// Write the AI-consumption context file.
    pub fn write_context(&self, graph: &Graph, last: Option<&Occurrence>) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let tasks: Vec<serde_json::Value> = graph
            .tasks
            .values()
            .map(|t| {
                serde_json::json!({
                    "name": t.name,
                    "command": t.command,
                    "depends_on": t.depends_on,
                    "covers": t.semantic.as_ref().map(|s| s.covers.clone()).unwrap_or_default(),
                })
            })
            .collect();
        let context = serde_json::json!({
            "tasks": tasks,
            "last_run": last.map(|occ| serde_json::json!({
                "id": occ.id,
                "outcome": occ.outcome,
                "type": occ.kind,
            })),
        });
        std::fs::write(
            self.dir.join("context.json"),
            serde_json::to_vec_pretty(&context)?,
        )?;
        Ok(())
    }

    fn prune_ring(&self) {
        let Ok(dir) = std::fs::read_dir(self.ring_dir()) else {
            return;
        };
        let mut names: Vec<String> = dir
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.ends_with(".bin"))
            .collect();
        if names.len() <= OCCURRENCE_RING {
            return;
        }
        names.sort();
        let excess = names.len() - OCCURRENCE_RING;
        for name in names.into_iter().take(excess) {
            if let Err(e) = std::fs::remove_file(self.ring_dir().join(&name)) {
                warn!("failed to prune occurrence {}: {}", name, e);
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
