//! Dry-run planning.
//!
//! Combines delta analysis with cache predictions into a report: affected
//! tasks with their trigger, execution levels, the critical path weighted
//! by historical durations, an estimated total, and maximum parallelism.
//! Nothing is executed.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::cache::{CacheOutcome, CacheRepo, MissReason};
use crate::delta::{AffectReason, DeltaResult};
use crate::error::Result;
use crate::graph::Graph;

/// Weight used when no historical duration is known.
const DEFAULT_TASK_WEIGHT_MS: u64 = 1_000;

/// Cache prediction for one planned task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachePrediction {
    Hit,
    Miss(MissReason),
}

/// One task in the plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedTask {
    pub name: String,
    pub reason: AffectReason,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<CachePrediction>,
    /// Historical duration when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_ms: Option<u64>,
}

/// The dry-run report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub from_ref: String,
    pub changed_files: Vec<String>,
    pub affected: Vec<PlannedTask>,
    /// Tasks the delta left untouched.
    pub skipped: Vec<String>,
    /// Levels restricted to the affected set.
    pub levels: Vec<Vec<String>>,
    /// Longest duration-weighted dependency chain through the affected set.
    pub critical_path: Vec<String>,
    pub estimated_total_ms: u64,
    pub max_parallelism: usize,
}

/// Build a plan from a delta result, cache state, and past durations.
pub fn plan(
    graph: &Graph,
    delta: &DeltaResult,
    cache: &CacheRepo,
    workdir: &Path,
    durations: &BTreeMap<String, u64>,
) -> Result<Plan> {
    let affected_names = delta.affected_names();

    let mut affected = Vec::with_capacity(delta.affected.len());
    for item in &delta.affected {
        let task = &graph.tasks[&item.name];
        let prediction = cache
            .check_detailed(task, workdir)
            .ok()
            .map(|decision| match decision.outcome {
                CacheOutcome::Hit => CachePrediction::Hit,
                CacheOutcome::Miss(reason) => CachePrediction::Miss(reason),
            });
        affected.push(PlannedTask {
            name: item.name.clone(),
            reason: item.reason,
            files: item.files.clone(),
            cache: prediction,
            estimated_ms: durations.get(&item.name).copied(),
        });
    }

    let skipped: Vec<String> = graph
        .tasks
        .keys()
        .filter(|name| !affected_names.contains(name.as_str()))
        .cloned()
        .collect();

    // Levels of the affected subgraph, in whole-graph level order.
    let all_levels = crate::graph::topo::levels(graph)?;
    let levels: Vec<Vec<String>> = all_levels
        .into_iter()
        .map(|level| {
            level
                .into_iter()
                .filter(|name| affected_names.contains(name.as_str()))
                .collect::<Vec<_>>()
        })
        .filter(|level: &Vec<String>| !level.is_empty())
        .collect();

    let (critical_path, estimated_total_ms) =
        critical_path(graph, &affected_names, durations);
    let max_parallelism = levels.iter().map(Vec::len).max().unwrap_or(0);

    Ok(Plan {
        from_ref: delta.from_ref.clone(),
        changed_files: delta.changed_files.clone(),
        affected,
        skipped,
        levels,
        critical_path,
        estimated_total_ms,
        max_parallelism,
    })
}

/// Longest weighted chain through the affected subgraph.
fn critical_path(
    graph: &Graph,
    affected: &std::collections::BTreeSet<&str>,
    durations: &BTreeMap<String, u64>,
) -> (Vec<String>, u64) {
    // cost[t] = weight(t) + max(cost[d]) over affected dependencies
    let mut cost: BTreeMap<&str, u64> = BTreeMap::new();
    let mut best_dep: BTreeMap<&str, &str> = BTreeMap::new();

    fn weight(name: &str, durations: &BTreeMap<String, u64>) -> u64 {
        durations.get(name).copied().unwrap_or(DEFAULT_TASK_WEIGHT_MS)
    }

    fn cost_of<'g>(
        graph: &'g Graph,
        name: &'g str,
        affected: &std::collections::BTreeSet<&str>,
        durations: &BTreeMap<String, u64>,
        cost: &mut BTreeMap<&'g str, u64>,
        best_dep: &mut BTreeMap<&'g str, &'g str>,
    ) -> u64 {
        if let Some(&c) = cost.get(name) {
            return c;
        }
        let mut best = 0;
        for dep in &graph.tasks[name].depends_on {
            if !affected.contains(dep.as_str()) {
                continue;
            }
            let c = cost_of(graph, dep, affected, durations, cost, best_dep);
            if c > best {
                best = c;
                best_dep.insert(name, dep.as_str());
            }
        }
        let total = weight(name, durations) + best;
        cost.insert(name, total);
        total
    }

    let mut end: Option<&str> = None;
    let mut total = 0;
    for &name in affected {
        let c = cost_of(graph, name, affected, durations, &mut cost, &mut best_dep);
        if c > total {
            total = c;
            end = Some(name);
        }
    }

    let mut path = Vec::new();
    let mut cursor = end;
    while let Some(name) = cursor {
        path.push(name.to_string());
        cursor = best_dep.get(name).copied();
    }
    path.reverse();
    (path, total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::affected_tasks;
    use crate::graph::Task;
    use tempfile::TempDir;

    fn task(name: &str, inputs: &[&str], deps: &[&str]) -> Task {
        Task {
            name: name.to_string(),
            command: "true".to_string(),
            inputs: inputs.iter().map(|i| i.to_string()).collect(),
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            ..Task::default()
        }
    }

    fn delta_for(graph: &Graph, changed: &[&str]) -> DeltaResult {
        let changed: Vec<String> = changed.iter().map(|c| c.to_string()).collect();
        DeltaResult {
            from_ref: "HEAD".to_string(),
            affected: affected_tasks(graph, &changed),
            changed_files: changed,
        }
    }

    #[test]
    fn plan_separates_affected_and_skipped() {
        let graph = Graph::from_tasks(vec![
            task("build", &["src/**"], &[]),
            task("test", &[], &["build"]),
            task("docs", &["docs/**"], &[]),
        ])
        .unwrap();
        let cache_dir = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();

        let delta = delta_for(&graph, &["src/main.go"]);
        let plan = plan(
            &graph,
            &delta,
            &CacheRepo::at(cache_dir.path()),
            work.path(),
            &BTreeMap::new(),
        )
        .unwrap();

        let names: Vec<&str> = plan.affected.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["build", "test"]);
        assert_eq!(plan.skipped, vec!["docs"]);
        assert_eq!(plan.max_parallelism, 1);
        assert_eq!(plan.levels, vec![vec!["build"], vec!["test"]]);
    }

    #[test]
    fn critical_path_uses_historical_durations() {
        let graph = Graph::from_tasks(vec![
            task("a", &["src/**"], &[]),
            task("slow", &[], &["a"]),
            task("fast", &[], &["a"]),
        ])
        .unwrap();
        let cache_dir = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();

        let durations =
            BTreeMap::from([("slow".to_string(), 60_000), ("fast".to_string(), 100)]);
        let delta = delta_for(&graph, &["src/x"]);
        let plan = plan(
            &graph,
            &delta,
            &CacheRepo::at(cache_dir.path()),
            work.path(),
            &durations,
        )
        .unwrap();

        assert_eq!(plan.critical_path, vec!["a", "slow"]);
        assert_eq!(plan.estimated_total_ms, DEFAULT_TASK_WEIGHT_MS + 60_000);
    }

    #[test]
    fn unaffected_graph_produces_empty_plan() {
        let graph = Graph::from_tasks(vec![task("build", &["src/**"], &[])]).unwrap();
        let cache_dir = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();

        let delta = delta_for(&graph, &["README.md"]);
        let plan = plan(
            &graph,
            &delta,
            &CacheRepo::at(cache_dir.path()),
            work.path(),
            &BTreeMap::new(),
        )
        .unwrap();

        assert!(plan.affected.is_empty());
        assert!(plan.levels.is_empty());
        assert!(plan.critical_path.is_empty());
        assert_eq!(plan.estimated_total_ms, 0);
        assert_eq!(plan.skipped, vec!["build"]);
    }

    #[test]
    fn cache_prediction_is_attached() {
        let graph = Graph::from_tasks(vec![task("build", &["src/**"], &[])]).unwrap();
        let cache_dir = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();

        let delta = delta_for(&graph, &["src/x"]);
        let plan = plan(
            &graph,
            &delta,
            &CacheRepo::at(cache_dir.path()),
            work.path(),
            &BTreeMap::new(),
        )
        .unwrap();

        assert_eq!(
            plan.affected[0].cache,
            Some(CachePrediction::Miss(MissReason::NoCache))
        );
    }
}
