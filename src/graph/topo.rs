//! Topological layering and cycle detection.
//!
//! `level(t) = 0` when `depends_on(t)` is empty, otherwise
//! `1 + max(level(d))`. Cycles are found with a three-color DFS; the cycle
//! path is reconstructed through an explicit parent map and reported in
//! adjacency order, closing on the repeated node (E010).

use std::collections::BTreeMap;

use crate::error::{Result, SykliError};

use super::Graph;

#[derive(Clone, Copy, PartialEq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Compute the ordered level sequence for a graph.
///
/// Level 0 is dependency-free; every task appears in exactly one level.
/// Names within a level are sorted for determinism. Returns
/// [`SykliError::CycleDetected`] when the graph is cyclic.
pub fn levels(graph: &Graph) -> Result<Vec<Vec<String>>> {
    detect_cycle(graph)?;

    let mut level_of: BTreeMap<&str, usize> = BTreeMap::new();
    for name in graph.tasks.keys() {
        compute_level(graph, name, &mut level_of);
    }

    let depth = level_of.values().copied().max().map_or(0, |m| m + 1);
    let mut levels: Vec<Vec<String>> = vec![Vec::new(); depth];
    for (name, level) in level_of {
        levels[level].push(name.to_string());
    }
    // BTreeMap iteration already yields sorted names per level.
    Ok(levels)
}

fn compute_level<'g>(graph: &'g Graph, name: &'g str, memo: &mut BTreeMap<&'g str, usize>) -> usize {
    if let Some(&level) = memo.get(name) {
        return level;
    }
    let task = &graph.tasks[name];
    let level = task
        .depends_on
        .iter()
        .map(|d| compute_level(graph, d.as_str(), memo) + 1)
        .max()
        .unwrap_or(0);
    memo.insert(name, level);
    level
}

/// Three-color DFS over `depends_on` edges.
fn detect_cycle(graph: &Graph) -> Result<()> {
    let mut color: BTreeMap<&str, Color> =
        graph.tasks.keys().map(|n| (n.as_str(), Color::White)).collect();
    let mut parent: BTreeMap<&str, &str> = BTreeMap::new();

    for start in graph.tasks.keys() {
        if color[start.as_str()] == Color::White {
            visit(graph, start, &mut color, &mut parent)?;
        }
    }
    Ok(())
}

fn visit<'g>(
    graph: &'g Graph,
    node: &'g str,
    color: &mut BTreeMap<&'g str, Color>,
    parent: &mut BTreeMap<&'g str, &'g str>,
) -> Result<()> {
    color.insert(node, Color::Gray);
    for dep in &graph.tasks[node].depends_on {
        match color[dep.as_str()] {
            Color::Gray => {
                return Err(SykliError::CycleDetected {
                    path: reconstruct_cycle(node, dep, parent),
                });
            }
            Color::White => {
                parent.insert(dep.as_str(), node);
                visit(graph, dep, color, parent)?;
            }
            Color::Black => {}
        }
    }
    color.insert(node, Color::Black);
    Ok(())
}

/// Walk the parent map from `from` back to `back_to`, then close the loop.
///
/// The edge `from -> back_to` closes the cycle, so the user-facing path is
/// `[back_to, ..., from, back_to]` in adjacency order.
fn reconstruct_cycle(from: &str, back_to: &str, parent: &BTreeMap<&str, &str>) -> Vec<String> {
    let mut chain = vec![from.to_string()];
    let mut cursor = from;
    while cursor != back_to {
        match parent.get(cursor) {
            Some(&p) => {
                chain.push(p.to_string());
                cursor = p;
            }
            None => break,
        }
    }
    chain.reverse();
    chain.push(back_to.to_string());
    chain
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Task;

    fn graph(edges: &[(&str, &[&str])]) -> Graph {
        let tasks = edges
            .iter()
            .map(|(name, deps)| Task {
                name: name.to_string(),
                command: "true".to_string(),
                depends_on: deps.iter().map(|d| d.to_string()).collect(),
                ..Task::default()
            })
            .collect();
        Graph::from_tasks(tasks).unwrap()
    }

    #[test]
    fn diamond_layers_correctly() {
        let g = graph(&[
            ("a", &[]),
            ("b", &["a"]),
            ("c", &["a"]),
            ("d", &["b", "c"]),
        ]);
        let levels = levels(&g).unwrap();
        assert_eq!(levels, vec![vec!["a"], vec!["b", "c"], vec!["d"]]);
    }

    #[test]
    fn independent_tasks_share_level_zero() {
        let g = graph(&[("a", &[]), ("b", &[]), ("c", &["a", "b"])]);
        let levels = levels(&g).unwrap();
        assert_eq!(levels[0], vec!["a", "b"]);
        assert_eq!(levels[1], vec!["c"]);
    }

    #[test]
    fn level_is_one_plus_max_of_deps() {
        // b at level 1, c at level 2, d sees both -> level 3
        let g = graph(&[
            ("a", &[]),
            ("b", &["a"]),
            ("c", &["b"]),
            ("d", &["b", "c"]),
        ]);
        let levels = levels(&g).unwrap();
        assert_eq!(levels[3], vec!["d"]);
    }

    #[test]
    fn three_cycle_is_reported_in_adjacency_order() {
        let g = graph(&[("a", &["b"]), ("b", &["c"]), ("c", &["a"])]);
        let err = levels(&g).unwrap_err();
        let SykliError::CycleDetected { path } = err else {
            panic!("expected cycle error");
        };

        // Closing repeat plus each node exactly once.
        assert_eq!(path.len(), 4);
        assert_eq!(path.first(), path.last());
        let mut nodes: Vec<&str> = path[..3].iter().map(String::as_str).collect();
        nodes.sort();
        assert_eq!(nodes, vec!["a", "b", "c"]);

        // Each consecutive pair is an actual depends_on edge.
        for pair in path.windows(2) {
            assert!(g.tasks[&pair[0]].depends_on.contains(&pair[1]));
        }
    }

    #[test]
    fn two_cycle_is_detected() {
        let g = graph(&[("a", &["b"]), ("b", &["a"])]);
        assert!(matches!(
            levels(&g),
            Err(SykliError::CycleDetected { .. })
        ));
    }

    #[test]
    fn cycle_off_the_main_chain_is_found() {
        let g = graph(&[
            ("root", &[]),
            ("x", &["root", "y"]),
            ("y", &["z"]),
            ("z", &["x"]),
        ]);
        let err = levels(&g).unwrap_err();
        let SykliError::CycleDetected { path } = err else {
            panic!("expected cycle error");
        };
        assert!(!path.contains(&"root".to_string()));
    }

    #[test]
    fn empty_graph_has_no_levels() {
        let g = Graph::default();
        assert!(levels(&g).unwrap().is_empty());
    }
}
