//! Structural validation: services, mounts, and artifact wiring.
//!
//! Artifact validation runs after matrix expansion and before execution.
//! For every `task_inputs` entry of task T referencing source S / output O:
//!
//! 1. S must exist in the expanded graph
//! 2. S must declare O
//! 3. S must be reachable from T through `depends_on` (transitively)

use std::collections::BTreeSet;

use crate::error::{Result, SykliError};

use super::{Graph, Task};

/// Every service needs both `image` and `name` non-empty (E011).
pub fn validate_services(task: &Task) -> Result<()> {
    for service in &task.services {
        if service.image.trim().is_empty() {
            return Err(SykliError::InvalidService {
                task: task.name.clone(),
                reason: "service has an empty image".to_string(),
            });
        }
        if service.name.trim().is_empty() {
            return Err(SykliError::InvalidService {
                task: task.name.clone(),
                reason: format!("service '{}' has an empty name", service.image),
            });
        }
    }
    Ok(())
}

/// Every mount needs `resource` and `path` non-empty (E012). The mount
/// type is enforced by the deserializer.
pub fn validate_mounts(task: &Task) -> Result<()> {
    for mount in &task.mounts {
        if mount.resource.trim().is_empty() {
            return Err(SykliError::InvalidMount {
                task: task.name.clone(),
                reason: "mount has an empty resource".to_string(),
            });
        }
        if mount.path.trim().is_empty() {
            return Err(SykliError::InvalidMount {
                task: task.name.clone(),
                reason: format!("mount '{}' has an empty path", mount.resource),
            });
        }
    }
    Ok(())
}

/// Validate every artifact binding in the graph (E013).
pub fn validate_artifacts(graph: &Graph) -> Result<()> {
    for task in graph.tasks.values() {
        for input in &task.task_inputs {
            let source = graph.get(&input.from_task).ok_or_else(|| {
                SykliError::InvalidArtifact {
                    task: task.name.clone(),
                    reason: format!(
                        "task_input references unknown task '{}'",
                        input.from_task
                    ),
                }
            })?;

            if !source.outputs.contains_key(&input.output) {
                return Err(SykliError::InvalidArtifact {
                    task: task.name.clone(),
                    reason: format!(
                        "task '{}' does not declare output '{}' (declared: {})",
                        input.from_task,
                        input.output,
                        if source.outputs.is_empty() {
                            "none".to_string()
                        } else {
                            source.outputs.keys().cloned().collect::<Vec<_>>().join(", ")
                        }
                    ),
                });
            }

            if !reachable(graph, &task.name, &input.from_task) {
                return Err(SykliError::InvalidArtifact {
                    task: task.name.clone(),
                    reason: format!(
                        "'{}' is not in the dependency closure of '{}'; \
                         add it to depends_on (directly or transitively)",
                        input.from_task, task.name
                    ),
                });
            }
        }
    }
    Ok(())
}

/// Is `target` reachable from `from` by following `depends_on` edges?
fn reachable(graph: &Graph, from: &str, target: &str) -> bool {
    let mut stack: Vec<&str> = match graph.get(from) {
        Some(t) => t.depends_on.iter().map(String::as_str).collect(),
        None => return false,
    };
    let mut seen: BTreeSet<&str> = BTreeSet::new();

    while let Some(name) = stack.pop() {
        if name == target {
            return true;
        }
        if !seen.insert(name) {
            continue;
        }
        if let Some(task) = graph.get(name) {
            stack.extend(task.depends_on.iter().map(String::as_str));
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Task, TaskInput};
    use std::collections::BTreeMap;

    fn task(name: &str, deps: &[&str]) -> Task {
        Task {
            name: name.to_string(),
            command: "true".to_string(),
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            ..Task::default()
        }
    }

    fn with_output(mut t: Task, output: &str, path: &str) -> Task {
        t.outputs = BTreeMap::from([(output.to_string(), path.to_string())]);
        t
    }

    fn with_input(mut t: Task, from: &str, output: &str, dest: &str) -> Task {
        t.task_inputs.push(TaskInput {
            from_task: from.to_string(),
            output: output.to_string(),
            dest: dest.to_string(),
        });
        t
    }

    #[test]
    fn direct_dependency_artifact_is_valid() {
        let build = with_output(task("build", &[]), "bin", "out/app");
        let deploy = with_input(task("deploy", &["build"]), "build", "bin", "./app");
        let graph = Graph::from_tasks(vec![build, deploy]).unwrap();
        assert!(validate_artifacts(&graph).is_ok());
    }

    #[test]
    fn transitive_dependency_artifact_is_valid() {
        let build = with_output(task("build", &[]), "bin", "out/app");
        let test = task("test", &["build"]);
        let deploy = with_input(task("deploy", &["test"]), "build", "bin", "./app");
        let graph = Graph::from_tasks(vec![build, test, deploy]).unwrap();
        assert!(validate_artifacts(&graph).is_ok());
    }

    #[test]
    fn unknown_source_task_is_e013() {
        let deploy = with_input(task("deploy", &[]), "ghost", "bin", "./app");
        let graph = Graph::from_tasks(vec![deploy]).unwrap();
        let err = validate_artifacts(&graph).unwrap_err();
        assert_eq!(err.code(), "E013");
        assert!(err.to_string().contains("unknown task 'ghost'"));
    }

    #[test]
    fn undeclared_output_is_e013() {
        let build = with_output(task("build", &[]), "bin", "out/app");
        let deploy = with_input(task("deploy", &["build"]), "build", "docs", "./docs");
        let graph = Graph::from_tasks(vec![build, deploy]).unwrap();
        let err = validate_artifacts(&graph).unwrap_err();
        assert_eq!(err.code(), "E013");
        assert!(err.to_string().contains("does not declare output 'docs'"));
        assert!(err.to_string().contains("declared: bin"));
    }

    #[test]
    fn unreachable_source_is_e013() {
        // build exists and declares the output, but deploy never depends on it
        let build = with_output(task("build", &[]), "bin", "out/app");
        let deploy = with_input(task("deploy", &[]), "build", "bin", "./app");
        let graph = Graph::from_tasks(vec![build, deploy]).unwrap();
        let err = validate_artifacts(&graph).unwrap_err();
        assert_eq!(err.code(), "E013");
        assert!(err.to_string().contains("dependency closure"));
    }

    #[test]
    fn empty_service_image_is_e011() {
        let mut t = task("t", &[]);
        t.services.push(crate::graph::Service {
            image: "  ".to_string(),
            name: "db".to_string(),
        });
        assert_eq!(validate_services(&t).unwrap_err().code(), "E011");
    }

    #[test]
    fn empty_mount_path_is_e012() {
        let mut t = task("t", &[]);
        t.mounts.push(crate::graph::Mount {
            resource: "deps".to_string(),
            path: String::new(),
            kind: crate::graph::MountKind::Cache,
        });
        assert_eq!(validate_mounts(&t).unwrap_err().code(), "E012");
    }

    #[test]
    fn reachability_handles_diamonds() {
        let a = with_output(task("a", &[]), "o", "f");
        let b = task("b", &["a"]);
        let c = task("c", &["a"]);
        let d = with_input(task("d", &["b", "c"]), "a", "o", "./f");
        let graph = Graph::from_tasks(vec![a, b, c, d]).unwrap();
        assert!(validate_artifacts(&graph).is_ok());
    }
}
