//! Label-based task placement.
//!
//! Candidates are filtered to nodes carrying every required label, ordered
//! (local first unless the strategy says otherwise), then tried in order
//! through a caller-supplied runner. All failures are collected into a
//! placement error carrying per-node reasons and synthesized hints.

use std::fmt;
use std::future::Future;

use serde::{Deserialize, Serialize};

/// A node offered for placement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub node: String,
    pub labels: Vec<String>,
}

/// Where the caller wants the task to land.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Strategy {
    /// Local node first, remotes after.
    #[default]
    Any,
    /// Local node only.
    Local,
    /// Remote nodes only.
    Remote,
}

/// Every tried node failed (or none qualified).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacementError {
    pub required: Vec<String>,
    /// Nodes that passed the filter, in try order.
    pub candidates: Vec<String>,
    /// `(node, reason)` in the order tried.
    pub tried: Vec<(String, String)>,
    pub hints: Vec<String>,
}

impl fmt::Display for PlacementError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no node could run the task")?;
        if !self.required.is_empty() {
            write!(f, " (requires: {})", self.required.join(", "))?;
        }
        for (node, reason) in &self.tried {
            write!(f, "\n  {}: {}", node, reason)?;
        }
        for hint in &self.hints {
            write!(f, "\n  hint: {}", hint)?;
        }
        Ok(())
    }
}

impl std::error::Error for PlacementError {}

/// Exactly the candidates whose labels cover `required`.
pub fn filter_by_labels(candidates: &[Candidate], required: &[String]) -> Vec<Candidate> {
    candidates
        .iter()
        .filter(|c| required.iter().all(|r| c.labels.contains(r)))
        .cloned()
        .collect()
}

/// Order filtered candidates for trying.
pub fn order(candidates: Vec<Candidate>, local_node: &str, strategy: Strategy) -> Vec<Candidate> {
    match strategy {
        Strategy::Local => candidates
            .into_iter()
            .filter(|c| c.node == local_node)
            .collect(),
        Strategy::Remote => candidates
            .into_iter()
            .filter(|c| c.node != local_node)
            .collect(),
        Strategy::Any => {
            let (mut local, remote): (Vec<_>, Vec<_>) =
                candidates.into_iter().partition(|c| c.node == local_node);
            local.extend(remote);
            local
        }
    }
}

/// Try candidates in order; first success wins.
///
/// The runner returns `Ok(())` or a reason string; all reasons are kept in
/// try order for the error path.
pub async fn try_nodes<F, Fut>(
    candidates: &[Candidate],
    required: &[String],
    all_nodes: &[Candidate],
    runner: F,
) -> Result<String, PlacementError>
where
    F: Fn(Candidate) -> Fut,
    Fut: Future<Output = Result<(), String>>,
{
    let mut tried = Vec::new();
    for candidate in candidates {
        match runner(candidate.clone()).await {
            Ok(()) => return Ok(candidate.node.clone()),
            Err(reason) => tried.push((candidate.node.clone(), reason)),
        }
    }
    Err(placement_error(required, candidates, all_nodes, tried))
}

/// Assemble the error with hints derived from what went wrong.
pub fn placement_error(
    required: &[String],
    candidates: &[Candidate],
    all_nodes: &[Candidate],
    tried: Vec<(String, String)>,
) -> PlacementError {
    let mut hints = Vec::new();

    if candidates.is_empty() && !required.is_empty() && !all_nodes.is_empty() {
        hints.push(format!(
            "no node carries {}; add labels on a capable node, e.g. {}={}",
            required.join("+"),
            crate::config::LABELS_VAR,
            required.join(",")
        ));
    }
    if tried
        .iter()
        .any(|(_, reason)| reason.to_lowercase().contains("docker"))
    {
        hints.push("a node failed on docker; start the container runtime there".to_string());
    }

    PlacementError {
        required: required.to_vec(),
        candidates: candidates.iter().map(|c| c.node.clone()).collect(),
        tried,
        hints,
    }
}
