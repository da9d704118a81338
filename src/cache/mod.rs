//! Content-addressed task cache.
//!
//! Layout under the cache root (default `~/.sykli/cache`):
//!
//! ```text
//! meta/<fingerprint>.json    cache entry
//! blobs/<sha256>             raw file contents, stored once
//! ```
//!
//! Blob and metadata writes are atomic (write-temp-then-rename); concurrent
//! writers of the same hash are safe, the loser deletes its temp file. The
//! cache is advisory: any restore failure falls back to re-running the task.

pub mod fingerprint;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config;
use crate::error::{Result, SykliError};
use crate::graph::Task;

pub use fingerprint::Fingerprint;

// ============================================================================
// ENTRY MODEL
// ============================================================================

/// One output file recorded by a cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputFile {
    /// Path relative to the task's working directory.
    pub path: String,
    /// SHA-256 of the file contents; the blob key.
    pub hash: String,
    /// POSIX mode bits.
    pub mode: u32,
    pub size: u64,
}

/// Metadata stored at `meta/<fingerprint>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub task_name: String,
    pub command: String,
    pub outputs: Vec<OutputFile>,
    pub duration_ms: u64,
    pub cached_at: DateTime<Utc>,
    pub inputs_hash: String,
    pub build_env_hash: String,
    #[serde(default)]
    pub container: String,
    pub task_env_hash: String,
    pub mounts_hash: String,
    pub version: String,
}

/// Why a lookup missed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissReason {
    /// No prior entry for this task at all.
    NoCache,
    CommandChanged,
    InputsChanged,
    ContainerChanged,
    EnvChanged,
    MountsChanged,
    /// Build-environment whitelist or tool version moved.
    ConfigChanged,
    /// Metadata existed but a referenced blob was gone.
    BlobsMissing,
    /// Metadata existed but did not parse.
    Corrupted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheOutcome {
    Hit,
    Miss(MissReason),
}

/// Result of [`CacheRepo::check_detailed`].
#[derive(Debug, Clone)]
pub struct CacheDecision {
    pub fingerprint: Fingerprint,
    pub outcome: CacheOutcome,
}

impl CacheDecision {
    pub fn is_hit(&self) -> bool {
        self.outcome == CacheOutcome::Hit
    }
}

/// Counters from a GC pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanReport {
    pub entries_removed: usize,
    pub blobs_removed: usize,
}

/// Aggregate statistics for `cache stats`.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub blobs: usize,
    pub total_bytes: u64,
}

// ============================================================================
// REPOSITORY
// ============================================================================

/// Handle on one cache directory. Cheap to clone paths from; all state is
/// on disk.
#[derive(Debug, Clone)]
pub struct CacheRepo {
    root: PathBuf,
}

impl CacheRepo {
    /// Open the user-wide cache at `~/.sykli/cache`.
    pub fn open_default() -> Self {
        Self::at(config::cache_dir())
    }

    /// Open a cache rooted at an explicit directory (tests use a tempdir).
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn meta_dir(&self) -> PathBuf {
        self.root.join("meta")
    }

    fn blobs_dir(&self) -> PathBuf {
        self.root.join("blobs")
    }

    fn meta_path(&self, digest: &str) -> PathBuf {
        self.meta_dir().join(format!("{}.json", digest))
    }

    fn blob_path(&self, hash: &str) -> PathBuf {
        self.blobs_dir().join(hash)
    }

    /// Fingerprint the task and diagnose hit/miss in detail.
    pub fn check_detailed(&self, task: &Task, workdir: &Path) -> Result<CacheDecision> {
        let fp = fingerprint::compute(task, workdir)?;
        let meta_path = self.meta_path(&fp.digest);

        if meta_path.exists() {
            match read_entry(&meta_path) {
                Ok(entry) => {
                    let all_blobs_present = entry
                        .outputs
                        .iter()
                        .all(|o| self.blob_path(&o.hash).exists());
                    if all_blobs_present {
                        debug!(task = %task.name, fingerprint = %fp.digest, "cache hit");
                        return Ok(CacheDecision {
                            fingerprint: fp,
                            outcome: CacheOutcome::Hit,
                        });
                    }
                    let _ = std::fs::remove_file(&meta_path);
                    return Ok(CacheDecision {
                        fingerprint: fp,
                        outcome: CacheOutcome::Miss(MissReason::BlobsMissing),
                    });
                }
                Err(_) => {
                    let _ = std::fs::remove_file(&meta_path);
                    return Ok(CacheDecision {
                        fingerprint: fp,
                        outcome: CacheOutcome::Miss(MissReason::Corrupted),
                    });
                }
            }
        }

        // No entry under this fingerprint: find the task's most recent entry
        // and compare component hashes to name the thing that moved.
        let reason = match self.latest_entry_for(&task.name) {
            None => MissReason::NoCache,
            Some(prev) => diagnose_miss(task, &fp, &prev),
        };
        Ok(CacheDecision {
            fingerprint: fp,
            outcome: CacheOutcome::Miss(reason),
        })
    }

    /// Load the entry stored under a fingerprint digest.
    pub fn entry_for(&self, digest: &str) -> Result<CacheEntry> {
        read_entry(&self.meta_path(digest))
    }

    fn latest_entry_for(&self, task_name: &str) -> Option<CacheEntry> {
        let dir = std::fs::read_dir(self.meta_dir()).ok()?;
        dir.filter_map(|e| e.ok())
            .filter_map(|e| read_entry(&e.path()).ok())
            .filter(|entry| entry.task_name == task_name)
            .max_by_key(|entry| entry.cached_at)
    }

    /// Resolve the task's output patterns, write blobs, and emit an entry.
    pub fn store(
        &self,
        task: &Task,
        fp: &Fingerprint,
        workdir: &Path,
        duration_ms: u64,
    ) -> Result<CacheEntry> {
        std::fs::create_dir_all(self.blobs_dir())?;
        std::fs::create_dir_all(self.meta_dir())?;

        let mut outputs = Vec::new();
        for pattern in task.outputs.values() {
            for file in resolve_output_pattern(workdir, pattern)? {
                let bytes = std::fs::read(&file)?;
                let hash = fingerprint::sha256_hex(&bytes);
                self.write_blob(&hash, &bytes)?;

                let rel = file
                    .strip_prefix(workdir)
                    .unwrap_or(&file)
                    .to_string_lossy()
                    .into_owned();
                outputs.push(OutputFile {
                    path: rel,
                    hash,
                    mode: file_mode(&file),
                    size: bytes.len() as u64,
                });
            }
        }

        let entry = CacheEntry {
            task_name: task.name.clone(),
            command: task.command.clone(),
            outputs,
            duration_ms,
            cached_at: Utc::now(),
            inputs_hash: fp.inputs_hash.clone(),
            build_env_hash: fp.build_env_hash.clone(),
            container: task.container.clone().unwrap_or_default(),
            task_env_hash: fp.task_env_hash.clone(),
            mounts_hash: fp.mounts_hash.clone(),
            version: fingerprint::tool_version().to_string(),
        };

        let json = serde_json::to_vec_pretty(&entry)?;
        atomic_write(&self.meta_path(&fp.digest), &json)?;
        debug!(task = %task.name, outputs = entry.outputs.len(), "stored cache entry");
        Ok(entry)
    }

    /// Write recorded outputs back into `workdir`, restoring mode bits.
    pub fn restore(&self, entry: &CacheEntry, workdir: &Path) -> Result<()> {
        for output in &entry.outputs {
            let bytes = std::fs::read(self.blob_path(&output.hash))?;
            let dest = workdir.join(&output.path);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&dest, &bytes)?;
            set_file_mode(&dest, output.mode);
        }
        Ok(())
    }

    /// Atomic blob write; no-op when the hash is already stored.
    fn write_blob(&self, hash: &str, bytes: &[u8]) -> Result<()> {
        let path = self.blob_path(hash);
        if path.exists() {
            return Ok(());
        }
        atomic_write(&path, bytes)
    }

    /// Delete entries older than `max_age_secs` (or unparseable), then any
    /// blob no surviving entry references.
    pub fn clean_older_than(&self, max_age_secs: u64) -> Result<CleanReport> {
        let cutoff = Utc::now() - chrono::Duration::seconds(max_age_secs as i64);
        let mut report = CleanReport::default();
        let mut surviving_hashes = std::collections::BTreeSet::new();

        if let Ok(dir) = std::fs::read_dir(self.meta_dir()) {
            for entry in dir.filter_map(|e| e.ok()) {
                let path = entry.path();
                match read_entry(&path) {
                    Ok(meta) if meta.cached_at >= cutoff => {
                        for output in &meta.outputs {
                            surviving_hashes.insert(output.hash.clone());
                        }
                    }
                    _ => {
                        if std::fs::remove_file(&path).is_ok() {
                            report.entries_removed += 1;
                        }
                    }
                }
            }
        }

        if let Ok(dir) = std::fs::read_dir(self.blobs_dir()) {
            for entry in dir.filter_map(|e| e.ok()) {
                let name = entry.file_name().to_string_lossy().into_owned();
                if !surviving_hashes.contains(&name) && std::fs::remove_file(entry.path()).is_ok() {
                    report.blobs_removed += 1;
                }
            }
        }

        Ok(report)
    }

    /// Delete everything.
    pub fn clean_all(&self) -> Result<CleanReport> {
        self.clean_older_than(0)
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats::default();
        if let Ok(dir) = std::fs::read_dir(self.meta_dir()) {
            stats.entries = dir.filter_map(|e| e.ok()).count();
        }
        if let Ok(dir) = std::fs::read_dir(self.blobs_dir()) {
            for entry in dir.filter_map(|e| e.ok()) {
                stats.blobs += 1;
                if let Ok(meta) = entry.metadata() {
                    stats.total_bytes += meta.len();
                }
            }
        }
        stats
    }
}

// ============================================================================
// HELPERS
// ============================================================================

fn read_entry(path: &Path) -> Result<CacheEntry> {
    let bytes = std::fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Compare component hashes against the most recent entry for this task.
fn diagnose_miss(task: &Task, fp: &Fingerprint, prev: &CacheEntry) -> MissReason {
    if prev.command != task.command {
        MissReason::CommandChanged
    } else if prev.inputs_hash != fp.inputs_hash {
        MissReason::InputsChanged
    } else if prev.container != task.container.clone().unwrap_or_default() {
        MissReason::ContainerChanged
    } else if prev.task_env_hash != fp.task_env_hash {
        MissReason::EnvChanged
    } else if prev.mounts_hash != fp.mounts_hash {
        MissReason::MountsChanged
    } else {
        MissReason::ConfigChanged
    }
}

/// Resolve an output pattern: exact file, directory (recursed), or glob.
fn resolve_output_pattern(workdir: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    let candidate = workdir.join(pattern);
    if candidate.is_file() {
        return Ok(vec![candidate]);
    }
    if candidate.is_dir() {
        let mut files: Vec<PathBuf> = WalkDir::new(&candidate)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .collect();
        files.sort();
        return Ok(files);
    }
    fingerprint::expand_globs(&[pattern.to_string()], workdir)
}

/// Write-temp-then-rename. The loser of a same-name race deletes its temp.
fn atomic_write(dest: &Path, bytes: &[u8]) -> Result<()> {
    let dir = dest
        .parent()
        .ok_or_else(|| SykliError::Internal(format!("no parent for {}", dest.display())))?;
    std::fs::create_dir_all(dir)?;

    let temp = dir.join(format!(
        ".tmp-{}-{}",
        std::process::id(),
        rand::random::<u32>()
    ));
    std::fs::write(&temp, bytes)?;
    if let Err(e) = std::fs::rename(&temp, dest) {
        let _ = std::fs::remove_file(&temp);
        if dest.exists() {
            // Another writer won; content-addressed, so identical.
            return Ok(());
        }
        warn!(dest = %dest.display(), "atomic write failed: {}", e);
        return Err(e.into());
    }
    Ok(())
}

#[cfg(unix)]
fn file_mode(path: &Path) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.permissions().mode())
        .unwrap_or(0o644)
}

#[cfg(not(unix))]
fn file_mode(_path: &Path) -> u32 {
    0o644
}

#[cfg(unix)]
fn set_file_mode(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode));
}

#[cfg(not(unix))]
fn set_file_mode(_path: &Path, _mode: u32) {}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn task(name: &str, command: &str) -> Task {
        Task {
            name: name.to_string(),
            command: command.to_string(),
            ..Task::default()
        }
    }

    fn store_once(repo: &CacheRepo, t: &Task, workdir: &Path) -> (Fingerprint, CacheEntry) {
        let decision = repo.check_detailed(t, workdir).unwrap();
        let entry = repo.store(t, &decision.fingerprint, workdir, 42).unwrap();
        (decision.fingerprint, entry)
    }

    #[test]
    fn first_lookup_is_no_cache() {
        let cache = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let repo = CacheRepo::at(cache.path());

        let decision = repo.check_detailed(&task("t", "true"), work.path()).unwrap();
        assert_eq!(decision.outcome, CacheOutcome::Miss(MissReason::NoCache));
    }

    #[test]
    fn store_then_hit() {
        let cache = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let repo = CacheRepo::at(cache.path());

        let mut t = task("build", "make");
        t.outputs = BTreeMap::from([("bin".to_string(), "out/app".to_string())]);
        std::fs::create_dir(work.path().join("out")).unwrap();
        std::fs::write(work.path().join("out/app"), b"binary").unwrap();

        store_once(&repo, &t, work.path());
        let decision = repo.check_detailed(&t, work.path()).unwrap();
        assert!(decision.is_hit());
    }

    #[test]
    fn restore_round_trips_bytes_and_mode() {
        let cache = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let repo = CacheRepo::at(cache.path());

        let mut t = task("build", "make");
        t.outputs = BTreeMap::from([("bin".to_string(), "out/app".to_string())]);
        std::fs::create_dir(work.path().join("out")).unwrap();
        let target = work.path().join("out/app");
        std::fs::write(&target, b"#!/bin/sh\necho hi\n").unwrap();
        set_file_mode(&target, 0o755);

        let (_, entry) = store_once(&repo, &t, work.path());

        std::fs::remove_dir_all(work.path().join("out")).unwrap();
        repo.restore(&entry, work.path()).unwrap();

        let restored = work.path().join("out/app");
        assert_eq!(std::fs::read(&restored).unwrap(), b"#!/bin/sh\necho hi\n");
        assert_eq!(file_mode(&restored) & 0o777, 0o755);
    }

    #[test]
    fn identical_contents_share_one_blob() {
        let cache = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let repo = CacheRepo::at(cache.path());

        std::fs::write(work.path().join("a.txt"), b"same bytes").unwrap();
        std::fs::write(work.path().join("b.txt"), b"same bytes").unwrap();

        let mut t1 = task("one", "true");
        t1.outputs = BTreeMap::from([("o".to_string(), "a.txt".to_string())]);
        let mut t2 = task("two", "true");
        t2.outputs = BTreeMap::from([("o".to_string(), "b.txt".to_string())]);

        store_once(&repo, &t1, work.path());
        store_once(&repo, &t2, work.path());

        assert_eq!(repo.stats().blobs, 1);
        assert_eq!(repo.stats().entries, 2);
    }

    #[test]
    fn missing_blob_is_diagnosed_and_entry_dropped() {
        let cache = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let repo = CacheRepo::at(cache.path());

        let mut t = task("build", "make");
        t.outputs = BTreeMap::from([("o".to_string(), "a.txt".to_string())]);
        std::fs::write(work.path().join("a.txt"), b"x").unwrap();
        let (_, entry) = store_once(&repo, &t, work.path());

        std::fs::remove_file(repo.blob_path(&entry.outputs[0].hash)).unwrap();

        let decision = repo.check_detailed(&t, work.path()).unwrap();
        assert_eq!(decision.outcome, CacheOutcome::Miss(MissReason::BlobsMissing));
        // Entry was deleted; next lookup has no prior with matching hashes.
        assert_eq!(repo.stats().entries, 0);
    }

    #[test]
    fn corrupt_metadata_is_diagnosed_and_dropped() {
        let cache = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let repo = CacheRepo::at(cache.path());

        let t = task("t", "true");
        let decision = repo.check_detailed(&t, work.path()).unwrap();
        std::fs::create_dir_all(repo.meta_dir()).unwrap();
        std::fs::write(repo.meta_path(&decision.fingerprint.digest), b"{not json").unwrap();

        let decision = repo.check_detailed(&t, work.path()).unwrap();
        assert_eq!(decision.outcome, CacheOutcome::Miss(MissReason::Corrupted));
        assert_eq!(repo.stats().entries, 0);
    }

    #[test]
    fn command_change_is_named() {
        let cache = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let repo = CacheRepo::at(cache.path());

        let t = task("build", "make");
        store_once(&repo, &t, work.path());

        let changed = task("build", "make -j8");
        let decision = repo.check_detailed(&changed, work.path()).unwrap();
        assert_eq!(
            decision.outcome,
            CacheOutcome::Miss(MissReason::CommandChanged)
        );
    }

    #[test]
    fn inputs_change_is_named() {
        let cache = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let repo = CacheRepo::at(cache.path());

        std::fs::write(work.path().join("main.go"), "v1").unwrap();
        let mut t = task("build", "go build");
        t.inputs = vec!["*.go".to_string()];
        store_once(&repo, &t, work.path());

        std::fs::write(work.path().join("main.go"), "v2").unwrap();
        let decision = repo.check_detailed(&t, work.path()).unwrap();
        assert_eq!(
            decision.outcome,
            CacheOutcome::Miss(MissReason::InputsChanged)
        );
    }

    #[test]
    fn env_change_is_named() {
        let cache = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let repo = CacheRepo::at(cache.path());

        let mut t = task("build", "make");
        t.env.insert("MODE".into(), "debug".into());
        store_once(&repo, &t, work.path());

        t.env.insert("MODE".into(), "release".into());
        let decision = repo.check_detailed(&t, work.path()).unwrap();
        assert_eq!(decision.outcome, CacheOutcome::Miss(MissReason::EnvChanged));
    }

    #[test]
    fn gc_drops_old_entries_and_orphaned_blobs() {
        let cache = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let repo = CacheRepo::at(cache.path());

        let mut t = task("build", "make");
        t.outputs = BTreeMap::from([("o".to_string(), "a.txt".to_string())]);
        std::fs::write(work.path().join("a.txt"), b"x").unwrap();
        store_once(&repo, &t, work.path());

        // Nothing is old yet.
        let report = repo.clean_older_than(3600).unwrap();
        assert_eq!(report, CleanReport::default());
        assert_eq!(repo.stats().entries, 1);

        // Everything is older than zero seconds.
        let report = repo.clean_all().unwrap();
        assert_eq!(report.entries_removed, 1);
        assert_eq!(report.blobs_removed, 1);
        assert_eq!(repo.stats().entries, 0);
        assert_eq!(repo.stats().blobs, 0);
    }

    #[test]
    fn directory_output_recurses_files() {
        let cache = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let repo = CacheRepo::at(cache.path());

        std::fs::create_dir_all(work.path().join("dist/assets")).unwrap();
        std::fs::write(work.path().join("dist/index.html"), b"<html>").unwrap();
        std::fs::write(work.path().join("dist/assets/app.js"), b"js").unwrap();

        let mut t = task("bundle", "webpack");
        t.outputs = BTreeMap::from([("dist".to_string(), "dist".to_string())]);
        let (_, entry) = store_once(&repo, &t, work.path());

        assert_eq!(entry.outputs.len(), 2);
        let paths: Vec<&str> = entry.outputs.iter().map(|o| o.path.as_str()).collect();
        assert!(paths.contains(&"dist/index.html"));
        assert!(paths.contains(&"dist/assets/app.js"));
    }

    #[test]
    fn unparseable_metadata_is_gcd() {
        let cache = TempDir::new().unwrap();
        let repo = CacheRepo::at(cache.path());
        std::fs::create_dir_all(repo.meta_dir()).unwrap();
        std::fs::write(repo.meta_dir().join("garbage.json"), b"???").unwrap();

        let report = repo.clean_older_than(3600).unwrap();
        assert_eq!(report.entries_removed, 1);
    }
}
