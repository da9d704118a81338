//! Git-diff-based change detection.
//!
//! Changed files are the union of `git diff --name-only <from>` and the
//! untracked set. A task is directly affected when a changed file matches
//! one of its input globs (`**` spans path segments, `*` matches within a
//! segment) or sits under one of its directory-type mount paths.
//! Transitive dependents are marked through a reverse-dependency BFS.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::graph::{Graph, MountKind};
use crate::gitctx;

// ============================================================================
// GLOB MATCHER
// ============================================================================

/// Match `path` against `pattern`: `**` matches any sequence of path
/// segments (including none), `*` matches any run of non-slash characters.
pub fn glob_match(pattern: &str, path: &str) -> bool {
    let pattern = pattern.trim_start_matches("./");
    let path = path.trim_start_matches("./");
    let pat: Vec<&str> = pattern.split('/').collect();
    let segs: Vec<&str> = path.split('/').collect();
    match_segments(&pat, &segs)
}

fn match_segments(pat: &[&str], segs: &[&str]) -> bool {
    match pat.first() {
        None => segs.is_empty(),
        Some(&"**") => {
            // Zero segments, or consume one and keep the '**'.
            match_segments(&pat[1..], segs)
                || (!segs.is_empty() && match_segments(pat, &segs[1..]))
        }
        Some(first) => match segs.first() {
            None => false,
            Some(seg) => match_one(first, seg) && match_segments(&pat[1..], &segs[1..]),
        },
    }
}

/// `*` within one segment; no slashes to worry about here.
fn match_one(pat: &str, seg: &str) -> bool {
    let p: Vec<char> = pat.chars().collect();
    let s: Vec<char> = seg.chars().collect();
    match_chars(&p, &s)
}

fn match_chars(p: &[char], s: &[char]) -> bool {
    match p.first() {
        None => s.is_empty(),
        Some('*') => match_chars(&p[1..], s) || (!s.is_empty() && match_chars(p, &s[1..])),
        Some(c) => s.first() == Some(c) && match_chars(&p[1..], &s[1..]),
    }
}

// ============================================================================
// AFFECTED TASKS
// ============================================================================

/// How a task entered the affected set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AffectReason {
    /// A changed file matched the task's inputs or mounts.
    Direct,
    /// An upstream dependency is affected.
    Dependent,
}

/// One affected task with its evidence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AffectedTask {
    pub name: String,
    pub reason: AffectReason,
    /// Changed files that triggered a direct match.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
    /// Affected upstream tasks that pulled a dependent in.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

/// Full delta analysis for one reference point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaResult {
    pub from_ref: String,
    pub changed_files: Vec<String>,
    pub affected: Vec<AffectedTask>,
}

impl DeltaResult {
    pub fn affected_names(&self) -> BTreeSet<&str> {
        self.affected.iter().map(|a| a.name.as_str()).collect()
    }
}

/// Collect changed files since `from` and map them onto the graph.
pub async fn compute(graph: &Graph, workdir: &Path, from: &str) -> Result<DeltaResult> {
    let mut changed = gitctx::diff_names(workdir, from).await?;
    changed.extend(gitctx::untracked(workdir).await);
    changed.sort();
    changed.dedup();

    Ok(DeltaResult {
        from_ref: from.to_string(),
        affected: affected_tasks(graph, &changed),
        changed_files: changed,
    })
}

/// Pure mapping from changed files to the affected set.
pub fn affected_tasks(graph: &Graph, changed: &[String]) -> Vec<AffectedTask> {
    // Direct matches first.
    let mut affected: BTreeMap<String, AffectedTask> = BTreeMap::new();
    for (name, task) in &graph.tasks {
        let mut files: Vec<String> = changed
            .iter()
            .filter(|file| {
                task.inputs.iter().any(|pattern| glob_match(pattern, file))
                    || task
                        .mounts
                        .iter()
                        .filter(|m| m.kind == MountKind::Directory)
                        .any(|m| under_dir(&m.path, file))
            })
            .cloned()
            .collect();
        if !files.is_empty() {
            files.dedup();
            affected.insert(
                name.clone(),
                AffectedTask {
                    name: name.clone(),
                    reason: AffectReason::Direct,
                    files,
                    depends_on: Vec::new(),
                },
            );
        }
    }

    // BFS over reverse dependencies for transitive dependents.
    let reverse = graph.dependents();
    let mut queue: VecDeque<String> = affected.keys().cloned().collect();
    while let Some(name) = queue.pop_front() {
        let Some(dependents) = reverse.get(name.as_str()) else {
            continue;
        };
        for dependent in dependents {
            let entry = affected
                .entry(dependent.to_string())
                .or_insert_with(|| AffectedTask {
                    name: dependent.to_string(),
                    reason: AffectReason::Dependent,
                    files: Vec::new(),
                    depends_on: Vec::new(),
                });
            if entry.reason == AffectReason::Dependent
                && !entry.depends_on.contains(&name)
            {
                entry.depends_on.push(name.clone());
                queue.push_back(dependent.to_string());
            }
        }
    }

    affected.into_values().collect()
}

/// Is `file` under the (project-relative) directory `dir`?
fn under_dir(dir: &str, file: &str) -> bool {
    let dir = dir.trim_start_matches("./").trim_end_matches('/');
    let file = file.trim_start_matches("./");
    file == dir || file.starts_with(&format!("{}/", dir))
}
