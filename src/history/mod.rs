//! Per-run records under `<project>/.sykli`.
//!
//! Each run writes one JSON file named by its ULID, so filename order is
//! chronological. Retention is bounded; the oldest files are deleted past
//! the cap. Streak counters carry across runs (positive = consecutive
//! passes, negative = consecutive failures).

pub mod locations;
pub mod occurrence;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Result;
use crate::exec::{RunSummary, TaskStatus};
use crate::gitctx::GitContext;
use crate::graph::Graph;

/// Run records kept on disk.
const MAX_RUN_RECORDS: usize = 100;

/// Whole-run outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Passed,
    Failed,
}

/// One task's slice of a run record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub status: TaskStatus,
    pub duration_ms: u64,
    /// Input patterns at record time.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<String>,
    /// Positive: consecutive passes. Negative: consecutive failures.
    pub streak: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub likely_cause: Vec<String>,
}

/// Cross-platform verification results merged into a record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerificationRecord {
    pub verified: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Task name -> node it was verified on.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub nodes: BTreeMap<String, String>,
}

/// Persisted manifest of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_sha: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    pub tasks: BTreeMap<String, TaskRecord>,
    pub outcome: RunOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<VerificationRecord>,
}

/// Store rooted at `<project>/.sykli`.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    dir: PathBuf,
}

impl HistoryStore {
    pub fn at(project_root: &Path) -> Self {
        Self {
            dir: crate::config::project_state_dir(project_root),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn runs_dir(&self) -> PathBuf {
        self.dir.join("runs")
    }

    fn logs_dir(&self, run_id: &str) -> PathBuf {
        self.dir.join("logs").join(run_id)
    }

    /// Persist a run record, carrying streaks forward from the previous
    /// run, then enforce retention.
    pub fn record_run(
        &self,
        summary: &RunSummary,
        git: &GitContext,
        graph: &Graph,
    ) -> Result<RunRecord> {
        let previous = self.last();

        let mut tasks = BTreeMap::new();
        for (name, outcome) in &summary.outcomes {
            let prev_streak = previous
                .as_ref()
                .and_then(|p| p.tasks.get(name))
                .map(|t| t.streak)
                .unwrap_or(0);
            tasks.insert(
                name.clone(),
                TaskRecord {
                    status: outcome.status,
                    duration_ms: outcome.duration_ms,
                    inputs: graph.get(name).map(|t| t.inputs.clone()).unwrap_or_default(),
                    streak: next_streak(prev_streak, outcome.status),
                    error: outcome.error.clone(),
                    likely_cause: Vec::new(),
                },
            );
        }

        let record = RunRecord {
            id: summary.run_id.clone(),
            started_at: summary.started_at,
            git_sha: git.sha.clone(),
            branch: git.branch.clone(),
            tasks,
            outcome: if summary.success() {
                RunOutcome::Passed
            } else {
                RunOutcome::Failed
            },
            verification: None,
        };

        self.save(&record)?;
        self.prune();
        Ok(record)
    }

    /// Rewrite a record in place (verification merge).
    pub fn save(&self, record: &RunRecord) -> Result<()> {
        std::fs::create_dir_all(self.runs_dir())?;
        let path = self.runs_dir().join(format!("{}.json", record.id));
        let json = serde_json::to_vec_pretty(record)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Most recent records, newest first. ULID filenames sort by age.
    pub fn load_recent(&self, limit: usize) -> Vec<RunRecord> {
        let Ok(dir) = std::fs::read_dir(self.runs_dir()) else {
            return Vec::new();
        };
        let mut names: Vec<String> = dir
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.ends_with(".json"))
            .collect();
        names.sort();
        names.reverse();

        names
            .into_iter()
            .take(limit)
            .filter_map(|name| {
                let bytes = std::fs::read(self.runs_dir().join(&name)).ok()?;
                serde_json::from_slice(&bytes).ok()
            })
            .collect()
    }

    pub fn load(&self, run_id: &str) -> Option<RunRecord> {
        let bytes = std::fs::read(self.runs_dir().join(format!("{}.json", run_id))).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    pub fn last(&self) -> Option<RunRecord> {
        self.load_recent(1).into_iter().next()
    }

    /// Most recent fully-passing run (its sha is the last-good ref).
    pub fn last_good(&self) -> Option<RunRecord> {
        self.load_recent(MAX_RUN_RECORDS)
            .into_iter()
            .find(|r| r.outcome == RunOutcome::Passed)
    }

    /// Latest known duration per task, for planning estimates.
    pub fn durations(&self) -> BTreeMap<String, u64> {
        let mut durations = BTreeMap::new();
        for record in self.load_recent(MAX_RUN_RECORDS).into_iter().rev() {
            for (name, task) in record.tasks {
                if matches!(task.status, TaskStatus::Passed | TaskStatus::Failed) {
                    durations.insert(name, task.duration_ms);
                }
            }
        }
        durations
    }

    /// Write per-task output under `logs/<run-id>/<safe-name>.log`.
    pub fn write_task_logs(&self, summary: &RunSummary) -> Result<()> {
        let dir = self.logs_dir(&summary.run_id);
        std::fs::create_dir_all(&dir)?;
        for (name, outcome) in &summary.outcomes {
            if outcome.output.is_empty() {
                continue;
            }
            let path = dir.join(format!("{}.log", safe_task_name(name)));
            std::fs::write(path, &outcome.output)?;
        }
        Ok(())
    }

    fn prune(&self) {
        let Ok(dir) = std::fs::read_dir(self.runs_dir()) else {
            return;
        };
        let mut names: Vec<String> = dir
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.ends_with(".json"))
            .collect();
        if names.len() <= MAX_RUN_RECORDS {
            return;
        }
        names.sort();
        let excess = names.len() - MAX_RUN_RECORDS;
        for name in names.into_iter().take(excess) {
            if let Err(e) = std::fs::remove_file(self.runs_dir().join(&name)) {
                warn!("failed to prune run record {}: {}", name, e);
            }
        }
    }
}

fn next_streak(previous: i64, status: TaskStatus) -> i64 {
    match status {
        TaskStatus::Passed | TaskStatus::Cached => {
            if previous >= 0 {
                previous + 1
            } else {
                1
            }
        }
        TaskStatus::Failed => {
            if previous <= 0 {
                previous - 1
            } else {
                -1
            }
        }
        TaskStatus::Skipped | TaskStatus::Blocked => previous,
    }
}

/// Escape `/` and `:` so any task name is a safe filename.
pub fn safe_task_name(name: &str) -> String {
    name.replace(['/', ':'], "_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::TaskOutcome;
    use tempfile::TempDir;

    fn summary_with(run_id: &str, statuses: &[(&str, TaskStatus)]) -> RunSummary {
        let outcomes = statuses
            .iter()
            .map(|(name, status)| {
                let mut outcome = TaskOutcome {
                    name: name.to_string(),
                    status: *status,
                    duration_ms: 100,
                    output: format!("output of {}", name),
                    error: None,
                    error_code: None,
                    exit_code: None,
                    cache_miss: None,
                    attempts: 1,
                };
                if *status == TaskStatus::Failed {
                    outcome.error = Some("boom".to_string());
                }
                (name.to_string(), outcome)
            })
            .collect();
        RunSummary {
            run_id: run_id.to_string(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            outcomes,
            levels: vec![statuses.iter().map(|(n, _)| n.to_string()).collect()],
        }
    }

    fn graph_of(names: &[&str]) -> Graph {
        Graph::from_tasks(
            names
                .iter()
                .map(|n| crate::graph::Task {
                    name: n.to_string(),
                    command: "true".to_string(),
                    ..Default::default()
                })
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn records_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = HistoryStore::at(dir.path());
        let graph = graph_of(&["build"]);

        let summary = summary_with(&crate::events::new_ulid(), &[("build", TaskStatus::Passed)]);
        let record = store.record_run(&summary, &GitContext::default(), &graph).unwrap();

        let loaded = store.load(&record.id).unwrap();
        assert_eq!(loaded.outcome, RunOutcome::Passed);
        assert_eq!(loaded.tasks["build"].streak, 1);
    }

    #[test]
    fn streaks_accumulate_and_flip() {
        let dir = TempDir::new().unwrap();
        let store = HistoryStore::at(dir.path());
        let graph = graph_of(&["t"]);

        for _ in 0..3 {
            let s = summary_with(&crate::events::new_ulid(), &[("t", TaskStatus::Passed)]);
            store.record_run(&s, &GitContext::default(), &graph).unwrap();
        }
        assert_eq!(store.last().unwrap().tasks["t"].streak, 3);

        let s = summary_with(&crate::events::new_ulid(), &[("t", TaskStatus::Failed)]);
        store.record_run(&s, &GitContext::default(), &graph).unwrap();
        assert_eq!(store.last().unwrap().tasks["t"].streak, -1);

        let s = summary_with(&crate::events::new_ulid(), &[("t", TaskStatus::Failed)]);
        store.record_run(&s, &GitContext::default(), &graph).unwrap();
        assert_eq!(store.last().unwrap().tasks["t"].streak, -2);
    }

    #[test]
    fn cached_counts_toward_pass_streak() {
        assert_eq!(next_streak(2, TaskStatus::Cached), 3);
        assert_eq!(next_streak(-3, TaskStatus::Passed), 1);
        assert_eq!(next_streak(5, TaskStatus::Skipped), 5);
    }

    #[test]
    fn last_good_skips_failed_runs() {
        let dir = TempDir::new().unwrap();
        let store = HistoryStore::at(dir.path());
        let graph = graph_of(&["t"]);

        let good_id = crate::events::new_ulid();
        let s = summary_with(&good_id, &[("t", TaskStatus::Passed)]);
        store.record_run(&s, &GitContext::default(), &graph).unwrap();

        let s = summary_with(&crate::events::new_ulid(), &[("t", TaskStatus::Failed)]);
        store.record_run(&s, &GitContext::default(), &graph).unwrap();

        assert_eq!(store.last().unwrap().outcome, RunOutcome::Failed);
        assert_eq!(store.last_good().unwrap().id, good_id);
    }

    #[test]
    fn durations_prefer_latest_run() {
        let dir = TempDir::new().unwrap();
        let store = HistoryStore::at(dir.path());
        let graph = graph_of(&["t"]);

        let mut s = summary_with(&crate::events::new_ulid(), &[("t", TaskStatus::Passed)]);
        s.outcomes.get_mut("t").unwrap().duration_ms = 500;
        store.record_run(&s, &GitContext::default(), &graph).unwrap();

        let mut s = summary_with(&crate::events::new_ulid(), &[("t", TaskStatus::Passed)]);
        s.outcomes.get_mut("t").unwrap().duration_ms = 900;
        store.record_run(&s, &GitContext::default(), &graph).unwrap();

        assert_eq!(store.durations()["t"], 900);
    }

    #[test]
    fn task_logs_escape_names() {
        let dir = TempDir::new().unwrap();
        let store = HistoryStore::at(dir.path());

        let summary = summary_with("01RUN", &[("lint/check:strict", TaskStatus::Passed)]);
        store.write_task_logs(&summary).unwrap();

        let log = dir
            .path()
            .join(".sykli/logs/01RUN/lint_check_strict.log");
        assert!(log.is_file());
        assert_eq!(
            std::fs::read_to_string(log).unwrap(),
            "output of lint/check:strict"
        );
    }

    #[test]
    fn safe_task_name_replaces_slash_and_colon() {
        assert_eq!(safe_task_name("a/b:c"), "a_b_c");
        assert_eq!(safe_task_name("plain"), "plain");
    }
}
