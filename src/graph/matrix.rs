//! Matrix expansion.
//!
//! A task with `matrix: {k1: [v..], k2: [v..]}` expands into the Cartesian
//! product of variants. The expanded name joins the base name and the
//! variant values in sorted-key order with `-`; each variant's assignment
//! map is merged into its `env` and recorded in `matrix_values`.
//! Dependencies naming the pre-expansion task are rewritten to all of its
//! variants; dependencies naming an expanded variant are taken literally.

use std::collections::BTreeMap;

use crate::error::{Result, SykliError};

use super::Task;

/// Expand all matrix tasks in declaration order.
pub fn expand(tasks: Vec<Task>) -> Result<Vec<Task>> {
    // base name -> expanded variant names, for dependency rewriting
    let mut variants_of: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut expanded: Vec<Task> = Vec::with_capacity(tasks.len());

    for task in tasks {
        match &task.matrix {
            None => expanded.push(task),
            Some(matrix) => {
                if matrix.is_empty() || matrix.values().any(|v| v.is_empty()) {
                    return Err(SykliError::SdkInvalidJson {
                        reason: format!(
                            "task '{}' has a matrix dimension with no values",
                            task.name
                        ),
                    });
                }
                let variants = expand_one(&task, matrix);
                variants_of.insert(
                    task.name.clone(),
                    variants.iter().map(|t| t.name.clone()).collect(),
                );
                expanded.extend(variants);
            }
        }
    }

    // Rewrite dependencies pointing at pre-expansion names.
    for task in &mut expanded {
        if task.depends_on.iter().any(|d| variants_of.contains_key(d)) {
            let mut rewritten = Vec::with_capacity(task.depends_on.len());
            for dep in task.depends_on.drain(..) {
                match variants_of.get(&dep) {
                    Some(names) => rewritten.extend(names.iter().cloned()),
                    None => rewritten.push(dep),
                }
            }
            task.depends_on = rewritten;
        }
    }

    Ok(expanded)
}

/// Cartesian product of one task's matrix, sorted-key suffix order.
fn expand_one(task: &Task, matrix: &BTreeMap<String, Vec<String>>) -> Vec<Task> {
    // BTreeMap iteration is already sorted by key.
    let dims: Vec<(&String, &Vec<String>)> = matrix.iter().collect();

    let mut assignments: Vec<BTreeMap<String, String>> = vec![BTreeMap::new()];
    for (key, values) in &dims {
        let mut next = Vec::with_capacity(assignments.len() * values.len());
        for assignment in &assignments {
            for value in *values {
                let mut a = assignment.clone();
                a.insert((*key).clone(), value.clone());
                next.push(a);
            }
        }
        assignments = next;
    }

    assignments
        .into_iter()
        .map(|assignment| {
            let mut variant = task.clone();
            let suffix: Vec<&str> = assignment.values().map(String::as_str).collect();
            variant.name = format!("{}-{}", task.name, suffix.join("-"));
            for (k, v) in &assignment {
                variant.env.insert(k.clone(), v.clone());
            }
            variant.matrix = None;
            variant.matrix_values = Some(assignment);
            variant
        })
        .collect()
}
