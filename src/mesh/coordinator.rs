//! Cross-node run aggregation.
//!
//! The coordinator ingests events forwarded by reporters on every node and
//! maintains: the active-run map, a bounded history ring, per-node
//! last-seen timestamps, and derived counters. Events may arrive out of
//! order across nodes; the embedded ULID decides staleness.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::events::{Event, EventKind};

/// Default history ring size.
pub const DEFAULT_HISTORY: usize = 1000;

/// Where a run stands from the coordinator's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Active,
    Completed,
    Failed,
}

/// One run as the coordinator sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunView {
    pub run_id: String,
    pub node: String,
    pub started_at: DateTime<Utc>,
    pub status: RunStatus,
    /// Task name -> latest known status string.
    pub tasks: BTreeMap<String, String>,
    /// Highest event ULID applied, for out-of-order tolerance.
    pub last_event_id: String,
}

/// Aggregate counters for `daemon status` style queries.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CoordinatorStats {
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub nodes: usize,
}

/// Single-process aggregate; all mutation goes through `ingest`.
#[derive(Clone)]
pub struct Coordinator {
    active: Arc<DashMap<String, RunView>>,
    history: Arc<Mutex<VecDeque<RunView>>>,
    last_seen: Arc<DashMap<String, DateTime<Utc>>>,
    capacity: usize,
    completed: Arc<std::sync::atomic::AtomicU64>,
    failed: Arc<std::sync::atomic::AtomicU64>,
}

impl Coordinator {
    pub fn new(capacity: usize) -> Self {
        Self {
            active: Arc::new(DashMap::new()),
            history: Arc::new(Mutex::new(VecDeque::new())),
            last_seen: Arc::new(DashMap::new()),
            capacity,
            completed: Arc::new(std::sync::atomic::AtomicU64::new(0)),
            failed: Arc::new(std::sync::atomic::AtomicU64::new(0)),
        }
    }

    /// Apply one event. Tolerates out-of-order and duplicate delivery.
    pub fn ingest(&self, event: &Event) {
        self.last_seen.insert(event.node.clone(), event.timestamp);

        match event.kind {
            EventKind::RunStarted => {
                self.active
                    .entry(event.run_id.clone())
                    .or_insert_with(|| RunView {
                        run_id: event.run_id.clone(),
                        node: event.node.clone(),
                        started_at: event.timestamp,
                        status: RunStatus::Active,
                        tasks: BTreeMap::new(),
                        last_event_id: String::new(),
                    });
                self.touch(&event.run_id, &event.id);
            }
            EventKind::TaskStarted | EventKind::TaskCompleted => {
                // A task event may beat its run_started across the network.
                let mut view = self
                    .active
                    .entry(event.run_id.clone())
                    .or_insert_with(|| RunView {
                        run_id: event.run_id.clone(),
                        node: event.node.clone(),
                        started_at: event.timestamp,
                        status: RunStatus::Active,
                        tasks: BTreeMap::new(),
                        last_event_id: String::new(),
                    });
                if let Some(task) = event.data.get("task").and_then(|v| v.as_str()) {
                    let status = match event.kind {
                        EventKind::TaskStarted => "running".to_string(),
                        _ => event
                            .data
                            .get("status")
                            .and_then(|v| v.as_str())
                            .unwrap_or("unknown")
                            .to_string(),
                    };
                    view.tasks.insert(task.to_string(), status);
                }
                if event.id > view.last_event_id {
                    view.last_event_id = event.id.clone();
                }
            }
            EventKind::RunCompleted => {
                let success = event
                    .data
                    .get("success")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                let mut view = self
                    .active
                    .remove(&event.run_id)
                    .map(|(_, v)| v)
                    .unwrap_or_else(|| RunView {
                        run_id: event.run_id.clone(),
                        node: event.node.clone(),
                        started_at: event.timestamp,
                        status: RunStatus::Active,
                        tasks: BTreeMap::new(),
                        last_event_id: String::new(),
                    });
                view.status = if success {
                    self.completed
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    RunStatus::Completed
                } else {
                    self.failed
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    RunStatus::Failed
                };
                if event.id > view.last_event_id {
                    view.last_event_id = event.id.clone();
                }

                let mut history = self.history.lock().expect("history lock");
                history.push_front(view);
                while history.len() > self.capacity {
                    history.pop_back();
                }
            }
            EventKind::TaskOutput | EventKind::GateWaiting | EventKind::GateResolved => {
                self.touch(&event.run_id, &event.id);
            }
        }
    }

    fn touch(&self, run_id: &str, event_id: &str) {
        if let Some(mut view) = self.active.get_mut(run_id) {
            if event_id > view.last_event_id.as_str() {
                view.last_event_id = event_id.to_string();
            }
        }
    }

    /// Currently active runs, newest first.
    pub fn active_runs(&self) -> Vec<RunView> {
        let mut runs: Vec<RunView> = self.active.iter().map(|e| e.value().clone()).collect();
        runs.sort_by(|a, b| b.run_id.cmp(&a.run_id));
        runs
    }

    /// Finished runs, optionally filtered, newest first.
    pub fn history(
        &self,
        node: Option<&str>,
        status: Option<RunStatus>,
        limit: usize,
    ) -> Vec<RunView> {
        self.history
            .lock()
            .expect("history lock")
            .iter()
            .filter(|r| node.map_or(true, |n| r.node == n))
            .filter(|r| status.map_or(true, |s| r.status == s))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Active or finished run by id.
    pub fn get(&self, run_id: &str) -> Option<RunView> {
        if let Some(view) = self.active.get(run_id) {
            return Some(view.clone());
        }
        self.history
            .lock()
            .expect("history lock")
            .iter()
            .find(|r| r.run_id == run_id)
            .cloned()
    }

    /// Nodes that have reported, with their last-seen timestamps.
    pub fn nodes(&self) -> Vec<(String, DateTime<Utc>)> {
        let mut nodes: Vec<(String, DateTime<Utc>)> = self
            .last_seen
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        nodes.sort();
        nodes
    }

    pub fn stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            active: self.active.len(),
            completed: self.completed.load(std::sync::atomic::Ordering::Relaxed) as usize,
            failed: self.failed.load(std::sync::atomic::Ordering::Relaxed) as usize,
            nodes: self.last_seen.len(),
        }
    }
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(kind: EventKind, run: &str, node: &str, data: serde_json::Value) -> Event {
        Event::new(kind, run, node, data)
    }

    #[test]
    fn run_lifecycle_moves_to_history() {
        let coordinator = Coordinator::new(10);

        coordinator.ingest(&event(EventKind::RunStarted, "r1", "n1", json!({})));
        assert_eq!(coordinator.active_runs().len(), 1);

        coordinator.ingest(&event(
            EventKind::TaskCompleted,
            "r1",
            "n1",
            json!({"task": "build", "status": "passed"}),
        ));
        coordinator.ingest(&event(
            EventKind::RunCompleted,
            "r1",
            "n1",
            json!({"success": true}),
        ));

        assert!(coordinator.active_runs().is_empty());
        let history = coordinator.history(None, None, 10);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, RunStatus::Completed);
        assert_eq!(history[0].tasks["build"], "passed");
    }

    #[test]
    fn failed_runs_count_separately() {
        let coordinator = Coordinator::new(10);
        coordinator.ingest(&event(EventKind::RunStarted, "r1", "n1", json!({})));
        coordinator.ingest(&event(
            EventKind::RunCompleted,
            "r1",
            "n1",
            json!({"success": false}),
        ));

        let stats = coordinator.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.completed, 0);
        assert_eq!(
            coordinator.history(None, Some(RunStatus::Failed), 10).len(),
            1
        );
    }

    #[test]
    fn history_ring_is_bounded() {
        let coordinator = Coordinator::new(3);
        for i in 0..5 {
            let run = format!("r{}", i);
            coordinator.ingest(&event(EventKind::RunStarted, &run, "n1", json!({})));
            coordinator.ingest(&event(
                EventKind::RunCompleted,
                &run,
                "n1",
                json!({"success": true}),
            ));
        }
        assert_eq!(coordinator.history(None, None, 100).len(), 3);
        // Newest kept.
        assert_eq!(coordinator.history(None, None, 100)[0].run_id, "r4");
    }

    #[test]
    fn task_event_before_run_started_is_tolerated() {
        let coordinator = Coordinator::new(10);
        coordinator.ingest(&event(
            EventKind::TaskStarted,
            "r1",
            "n1",
            json!({"task": "build"}),
        ));

        let active = coordinator.active_runs();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].tasks["build"], "running");

        coordinator.ingest(&event(EventKind::RunStarted, "r1", "n1", json!({})));
        assert_eq!(coordinator.active_runs().len(), 1);
    }

    #[test]
    fn node_filter_and_last_seen() {
        let coordinator = Coordinator::new(10);
        coordinator.ingest(&event(EventKind::RunStarted, "r1", "alpha", json!({})));
        coordinator.ingest(&event(
            EventKind::RunCompleted,
            "r1",
            "alpha",
            json!({"success": true}),
        ));
        coordinator.ingest(&event(EventKind::RunStarted, "r2", "beta", json!({})));

        assert_eq!(coordinator.history(Some("alpha"), None, 10).len(), 1);
        assert!(coordinator.history(Some("beta"), None, 10).is_empty());
        assert_eq!(coordinator.nodes().len(), 2);
        assert_eq!(coordinator.stats().nodes, 2);
    }

    #[test]
    fn get_finds_active_and_finished() {
        let coordinator = Coordinator::new(10);
        coordinator.ingest(&event(EventKind::RunStarted, "r1", "n1", json!({})));
        assert_eq!(coordinator.get("r1").unwrap().status, RunStatus::Active);

        coordinator.ingest(&event(
            EventKind::RunCompleted,
            "r1",
            "n1",
            json!({"success": true}),
        ));
        assert_eq!(coordinator.get("r1").unwrap().status, RunStatus::Completed);
        assert!(coordinator.get("nope").is_none());
    }
}
