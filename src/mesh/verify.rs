//! Cross-platform verification planning.
//!
//! After a run completes, selected tasks are re-executed on nodes whose
//! labels differ from the local set, to confirm the result is not
//! platform-specific. Cached, skipped, and blocked tasks are never
//! re-run; `verify: never` opts a task out; `verify: always` accepts any
//! remote node.

use std::collections::BTreeSet;
use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::exec::TaskStatus;
use crate::graph::{Graph, VerifyMode};
use crate::history::{RunRecord, VerificationRecord};

use super::placement::Candidate;

/// Why a task was not re-run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NotExecuted,
    VerifyNever,
    NoRemoteNodes,
    NoDifferingPlatform,
}

/// Decision for one completed task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyDecision {
    Skip(SkipReason),
    Rerun { node: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyPlanEntry {
    pub task: String,
    pub decision: VerifyDecision,
}

/// Plan which completed tasks to re-run where.
pub fn plan(
    record: &RunRecord,
    graph: &Graph,
    local_labels: &[String],
    remotes: &[Candidate],
) -> Vec<VerifyPlanEntry> {
    let local_set: BTreeSet<&str> = local_labels.iter().map(String::as_str).collect();

    record
        .tasks
        .iter()
        .map(|(name, task_record)| {
            let decision = decide(name, task_record.status, graph, &local_set, remotes);
            VerifyPlanEntry {
                task: name.clone(),
                decision,
            }
        })
        .collect()
}

fn decide(
    name: &str,
    status: TaskStatus,
    graph: &Graph,
    local_labels: &BTreeSet<&str>,
    remotes: &[Candidate],
) -> VerifyDecision {
    // Only work that actually executed is worth re-running.
    if !matches!(status, TaskStatus::Passed | TaskStatus::Failed) {
        return VerifyDecision::Skip(SkipReason::NotExecuted);
    }

    let Some(task) = graph.get(name) else {
        return VerifyDecision::Skip(SkipReason::NotExecuted);
    };
    if task.verify == VerifyMode::Never {
        return VerifyDecision::Skip(SkipReason::VerifyNever);
    }
    if remotes.is_empty() {
        return VerifyDecision::Skip(SkipReason::NoRemoteNodes);
    }

    let qualified = remotes.iter().filter(|candidate| {
        task.requires
            .iter()
            .all(|required| candidate.labels.contains(required))
    });

    let chosen = match task.verify {
        VerifyMode::Always => qualified.into_iter().next(),
        // Default: only a node that is actually a different platform.
        _ => qualified.into_iter().find(|candidate| {
            let labels: BTreeSet<&str> = candidate.labels.iter().map(String::as_str).collect();
            labels != *local_labels
        }),
    };

    match chosen {
        Some(candidate) => VerifyDecision::Rerun {
            node: candidate.node.clone(),
        },
        None => VerifyDecision::Skip(SkipReason::NoDifferingPlatform),
    }
}

/// Dispatch the planned re-runs and fold the outcomes into a record.
///
/// The runner receives `(task name, node)` and reports success or a
/// failure reason; failures do not stop the remaining dispatches.
pub async fn execute<F, Fut>(entries: &[VerifyPlanEntry], runner: F) -> VerificationRecord
where
    F: Fn(String, String) -> Fut,
    Fut: Future<Output = Result<(), String>>,
{
    let mut record = VerificationRecord::default();
    for entry in entries {
        match &entry.decision {
            VerifyDecision::Skip(_) => record.skipped += 1,
            VerifyDecision::Rerun { node } => {
                match runner(entry.task.clone(), node.clone()).await {
                    Ok(()) => {
                        record.verified += 1;
                        record.nodes.insert(entry.task.clone(), node.clone());
                    }
                    Err(_) => record.failed += 1,
                }
            }
        }
    }
    record
}

/// Merge verification results into the persisted run record.
pub fn merge(record: &mut RunRecord, verification: VerificationRecord) {
    record.verification = Some(verification);
}
