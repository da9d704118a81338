//! Pipeline graph model and JSON loader.
//!
//! The SDK emits `{"version": ..., "tasks": [...]}`; this module turns that
//! document into a validated [`Graph`]:
//!
//! - `outputs` lists are normalized to named mappings (`output_0`, ...)
//! - `depends_on` is deduplicated, self-edges rejected
//! - embedded `services` and `mounts` are validated (E011/E012)
//! - matrix tasks are expanded into their Cartesian variants

pub mod matrix;
pub mod topo;
pub mod validate;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SykliError};

// ============================================================================
// TASK MODEL
// ============================================================================

/// Sidecar service started before a task and stopped after it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub image: String,
    pub name: String,
}

/// Mount kind: a plain host directory or a named cache volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountKind {
    Directory,
    Cache,
}

/// A resource mounted into the task's execution environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub resource: String,
    pub path: String,
    #[serde(rename = "type")]
    pub kind: MountKind,
}

/// Artifact binding: copy `output` of `from_task` to `dest` before running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInput {
    pub from_task: String,
    pub output: String,
    pub dest: String,
}

/// When the verify phase may re-run this task on another node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyMode {
    /// Re-run only on nodes whose labels differ from the local set.
    #[default]
    CrossPlatform,
    /// Re-run on any remote node.
    Always,
    /// Never re-run.
    Never,
}

/// Optional semantic metadata carried into the occurrence document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Semantic {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub covers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub criticality: Option<String>,
}

/// A pause before the task runs: time-based gates sleep, everything else
/// resolves immediately (approval channels live outside the core).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gate {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_seconds: Option<u64>,
}

/// Declared capability edges (provides/needs), carried for consumers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub provides: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub needs: Vec<String>,
}

/// AI hook metadata (selection mode, on-fail action), carried opaquely.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AiHooks {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_fail: Option<String>,
}

/// A single pipeline task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub name: String,
    #[serde(default)]
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,
    /// Per-task timeout in seconds; `None` falls back to the run default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub task_inputs: Vec<TaskInput>,
    /// Glob patterns whose matched file contents enter the fingerprint.
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Declared outputs: name -> path pattern (normalized from lists).
    #[serde(default, deserialize_with = "deserialize_outputs")]
    pub outputs: BTreeMap<String, String>,
    /// Extra attempts after the first failure (0 = single attempt).
    #[serde(default)]
    pub retry: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<Mount>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<Service>,
    /// Node labels this task requires for placement.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<String>,
    /// Matrix dimensions; mutually exclusive with `matrix_values`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matrix: Option<BTreeMap<String, Vec<String>>>,
    /// The assignment of an expanded matrix variant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matrix_values: Option<BTreeMap<String, String>>,
    /// Boolean expression gating execution (see the condition evaluator).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default)]
    pub verify: VerifyMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semantic: Option<Semantic>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate: Option<Gate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<Capability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai: Option<AiHooks>,
    /// Target-specific options, passed through to the driver untouched.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub target_options: BTreeMap<String, serde_json::Value>,
}

/// Accept either `{"name": "pattern"}` or `["pattern", ...]`.
///
/// Lists get synthetic names `output_0`, `output_1`, ... preserving order.
fn deserialize_outputs<'de, D>(deserializer: D) -> std::result::Result<BTreeMap<String, String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawOutputs {
        Map(BTreeMap<String, String>),
        List(Vec<String>),
    }

    match Option::<RawOutputs>::deserialize(deserializer)? {
        None => Ok(BTreeMap::new()),
        Some(RawOutputs::Map(m)) => Ok(m),
        Some(RawOutputs::List(l)) => Ok(l
            .into_iter()
            .enumerate()
            .map(|(i, p)| (format!("output_{}", i), p))
            .collect()),
    }
}

impl Task {
    /// Effective timeout in seconds given the run default; `0` = no limit.
    pub fn effective_timeout(&self, run_default_secs: u64) -> u64 {
        self.timeout.unwrap_or(run_default_secs)
    }
}

// ============================================================================
// GRAPH
// ============================================================================

/// A validated, matrix-expanded pipeline graph.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Graph {
    pub tasks: BTreeMap<String, Task>,
}

impl Graph {
    /// Build a graph from already-expanded tasks, checking name uniqueness
    /// and dependency existence.
    pub fn from_tasks(tasks: Vec<Task>) -> Result<Self> {
        let mut map = BTreeMap::new();
        for task in tasks {
            if task.name.is_empty() {
                return Err(SykliError::SdkInvalidJson {
                    reason: "task with empty name".to_string(),
                });
            }
            if map.insert(task.name.clone(), task.clone()).is_some() {
                return Err(SykliError::SdkInvalidJson {
                    reason: format!("duplicate task name '{}'", task.name),
                });
            }
        }
        let graph = Graph { tasks: map };
        for task in graph.tasks.values() {
            for dep in &task.depends_on {
                if !graph.tasks.contains_key(dep) {
                    return Err(SykliError::SdkInvalidJson {
                        reason: format!(
                            "task '{}' depends on unknown task '{}'",
                            task.name, dep
                        ),
                    });
                }
            }
        }
        Ok(graph)
    }

    pub fn get(&self, name: &str) -> Option<&Task> {
        self.tasks.get(name)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Task names in deterministic (sorted) order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(String::as_str)
    }

    /// Reverse-dependency map: task -> tasks that depend on it.
    pub fn dependents(&self) -> BTreeMap<&str, Vec<&str>> {
        let mut rev: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for (name, task) in &self.tasks {
            for dep in &task.depends_on {
                rev.entry(dep.as_str()).or_default().push(name.as_str());
            }
        }
        rev
    }
}

// ============================================================================
// LOADER
// ============================================================================

#[derive(Deserialize)]
struct GraphDoc {
    #[serde(default)]
    #[allow(dead_code)]
    version: Option<serde_json::Value>,
    tasks: Vec<Task>,
}

/// Parse an SDK-emitted JSON document into a validated, expanded graph.
pub fn load_graph(json: &str) -> Result<Graph> {
    let doc: GraphDoc = serde_json::from_str(json).map_err(|e| SykliError::SdkInvalidJson {
        reason: e.to_string(),
    })?;

    let mut tasks = doc.tasks;
    for task in &mut tasks {
        normalize_task(task)?;
    }

    let expanded = matrix::expand(tasks)?;
    let graph = Graph::from_tasks(expanded)?;
    topo::levels(&graph)?; // cycle check up front (E010)
    validate::validate_artifacts(&graph)?;
    Ok(graph)
}

/// Per-task normalization and embedded-structure validation.
fn normalize_task(task: &mut Task) -> Result<()> {
    // Collapse duplicate dependencies, preserving first-seen order.
    let mut seen = std::collections::BTreeSet::new();
    task.depends_on.retain(|d| seen.insert(d.clone()));

    if task.depends_on.iter().any(|d| d == &task.name) {
        return Err(SykliError::SdkInvalidJson {
            reason: format!("task '{}' depends on itself", task.name),
        });
    }

    if task.matrix.is_some() && task.matrix_values.is_some() {
        return Err(SykliError::SdkInvalidJson {
            reason: format!(
                "task '{}' sets both matrix and matrix_values",
                task.name
            ),
        });
    }

    validate::validate_services(task)?;
    validate::validate_mounts(task)?;
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn graph_json(tasks: &str) -> String {
        format!(r#"{{"version": 1, "tasks": {}}}"#, tasks)
    }

    #[test]
    fn loads_minimal_graph() {
        let json = graph_json(r#"[{"name": "build", "command": "make"}]"#);
        let graph = load_graph(&json).unwrap();
        assert_eq!(graph.len(), 1);
        assert_eq!(graph.get("build").unwrap().command, "make");
    }

    #[test]
    fn outputs_list_gets_synthetic_names() {
        let json = graph_json(
            r#"[{"name": "build", "command": "make", "outputs": ["out/app", "out/app.sig"]}]"#,
        );
        let graph = load_graph(&json).unwrap();
        let outputs = &graph.get("build").unwrap().outputs;
        assert_eq!(outputs.get("output_0").unwrap(), "out/app");
        assert_eq!(outputs.get("output_1").unwrap(), "out/app.sig");
    }

    #[test]
    fn outputs_map_is_kept() {
        let json = graph_json(
            r#"[{"name": "build", "command": "make", "outputs": {"bin": "out/app"}}]"#,
        );
        let graph = load_graph(&json).unwrap();
        assert_eq!(graph.get("build").unwrap().outputs.get("bin").unwrap(), "out/app");
    }

    #[test]
    fn duplicate_deps_are_collapsed() {
        let json = graph_json(
            r#"[{"name": "a", "command": "true"},
                {"name": "b", "command": "true", "depends_on": ["a", "a"]}]"#,
        );
        let graph = load_graph(&json).unwrap();
        assert_eq!(graph.get("b").unwrap().depends_on, vec!["a"]);
    }

    #[test]
    fn self_dependency_is_rejected() {
        let json = graph_json(r#"[{"name": "a", "command": "true", "depends_on": ["a"]}]"#);
        let err = load_graph(&json).unwrap_err();
        assert_eq!(err.code(), "E023");
        assert!(err.to_string().contains("depends on itself"));
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let json = graph_json(r#"[{"name": "a", "command": "true", "depends_on": ["ghost"]}]"#);
        let err = load_graph(&json).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let json = graph_json(
            r#"[{"name": "a", "command": "true"}, {"name": "a", "command": "false"}]"#,
        );
        assert!(load_graph(&json).is_err());
    }

    #[test]
    fn invalid_json_is_e023() {
        let err = load_graph("not json").unwrap_err();
        assert_eq!(err.code(), "E023");
    }

    #[test]
    fn service_missing_name_is_e011() {
        let json = graph_json(
            r#"[{"name": "t", "command": "true", "services": [{"image": "redis:7", "name": ""}]}]"#,
        );
        let err = load_graph(&json).unwrap_err();
        assert_eq!(err.code(), "E011");
    }

    #[test]
    fn mount_with_bad_type_fails_parse() {
        let json = graph_json(
            r#"[{"name": "t", "command": "true",
                "mounts": [{"resource": "deps", "path": "/deps", "type": "tmpfs"}]}]"#,
        );
        assert!(load_graph(&json).is_err());
    }

    #[test]
    fn matrix_and_matrix_values_are_mutually_exclusive() {
        let json = graph_json(
            r#"[{"name": "t", "command": "true",
                "matrix": {"os": ["linux"]},
                "matrix_values": {"os": "linux"}}]"#,
        );
        assert!(load_graph(&json).is_err());
    }

    #[test]
    fn verify_mode_defaults_to_cross_platform() {
        let json = graph_json(r#"[{"name": "t", "command": "true"}]"#);
        let graph = load_graph(&json).unwrap();
        assert_eq!(graph.get("t").unwrap().verify, VerifyMode::CrossPlatform);
    }

    #[test]
    fn dependents_map_is_reversed() {
        let json = graph_json(
            r#"[{"name": "a", "command": "true"},
                {"name": "b", "command": "true", "depends_on": ["a"]},
                {"name": "c", "command": "true", "depends_on": ["a"]}]"#,
        );
        let graph = load_graph(&json).unwrap();
        let rev = graph.dependents();
        assert_eq!(rev.get("a").unwrap(), &vec!["b", "c"]);
    }
}
