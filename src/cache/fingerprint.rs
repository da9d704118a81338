//! Task fingerprinting.
//!
//! The fingerprint is a SHA-256 over a fixed-order, `|`-joined tuple:
//! task name, command, inputs hash, build-env hash, container image,
//! task-env hash, mounts hash, tool version. Each component hash is kept
//! alongside the final digest so a cache miss can be diagnosed down to the
//! component that moved.

use std::path::Path;

use glob::MatchOptions;
use sha2::{Digest, Sha256};

use crate::config::FINGERPRINT_ENV_VARS;
use crate::error::{Result, SykliError};
use crate::graph::Task;

/// Component hashes feeding the fingerprint, kept for miss diagnosis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    /// Final 64-char hex digest; the cache key.
    pub digest: String,
    /// SHA-256 over the sorted, individually hashed input files.
    pub inputs_hash: String,
    /// SHA-256 over the whitelisted build-environment variables.
    pub build_env_hash: String,
    /// SHA-256 over the task's own env bindings.
    pub task_env_hash: String,
    /// SHA-256 over the task's mounts.
    pub mounts_hash: String,
}

/// Compute the fingerprint of `task` with inputs resolved under `workdir`.
pub fn compute(task: &Task, workdir: &Path) -> Result<Fingerprint> {
    let inputs_hash = hash_inputs(&task.inputs, workdir)?;
    let build_env_hash = hash_build_env();
    let task_env_hash = hash_pairs(task.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    let mounts_hash = hash_mounts(task);

    let joined = [
        task.name.as_str(),
        task.command.as_str(),
        inputs_hash.as_str(),
        build_env_hash.as_str(),
        task.container.as_deref().unwrap_or(""),
        task_env_hash.as_str(),
        mounts_hash.as_str(),
        tool_version(),
    ]
    .join("|");

    Ok(Fingerprint {
        digest: sha256_hex(joined.as_bytes()),
        inputs_hash,
        build_env_hash,
        task_env_hash,
        mounts_hash,
    })
}

/// The version string that invalidates all caches on upgrade.
pub fn tool_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Expand the task's input globs under `workdir`, hash each file's content
/// in sorted path order, then hash the concatenation.
///
/// Dotfiles are excluded from wildcard matches.
fn hash_inputs(patterns: &[String], workdir: &Path) -> Result<String> {
    let mut files = expand_globs(patterns, workdir)?;
    files.sort();

    let mut concatenated = String::new();
    for file in &files {
        let bytes = std::fs::read(file)?;
        concatenated.push_str(&sha256_hex(&bytes));
    }
    Ok(sha256_hex(concatenated.as_bytes()))
}

/// Resolve glob patterns to regular files under `workdir`.
pub fn expand_globs(patterns: &[String], workdir: &Path) -> Result<Vec<std::path::PathBuf>> {
    let options = MatchOptions {
        case_sensitive: true,
        require_literal_separator: false,
        require_literal_leading_dot: true,
    };

    let mut files = Vec::new();
    for pattern in patterns {
        let full = workdir.join(pattern);
        let full = full.to_string_lossy();
        let matches = glob::glob_with(&full, options)
            .map_err(|e| SykliError::Internal(format!("bad input pattern '{}': {}", pattern, e)))?;
        for entry in matches {
            let path = entry.map_err(|e| SykliError::Io(e.into_error()))?;
            if path.is_file() {
                files.push(path);
            }
        }
    }
    files.sort();
    files.dedup();
    Ok(files)
}

/// Hash the whitelisted build-environment variables (`PATH` excluded).
fn hash_build_env() -> String {
    let pairs: Vec<(String, String)> = FINGERPRINT_ENV_VARS
        .iter()
        .filter_map(|var| std::env::var(var).ok().map(|v| (var.to_string(), v)))
        .collect();
    hash_pairs(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
}

/// Hash `k=v` pairs in sorted order.
fn hash_pairs<'a>(pairs: impl Iterator<Item = (&'a str, &'a str)>) -> String {
    let mut lines: Vec<String> = pairs.map(|(k, v)| format!("{}={}", k, v)).collect();
    lines.sort();
    sha256_hex(lines.join("\n").as_bytes())
}

fn hash_mounts(task: &Task) -> String {
    let mut lines: Vec<String> = task
        .mounts
        .iter()
        .map(|m| format!("{}:{}:{:?}", m.resource, m.path, m.kind))
        .collect();
    lines.sort();
    sha256_hex(lines.join("\n").as_bytes())
}
