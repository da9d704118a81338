//! Git context collection.
//!
//! All queries shell out to `git` with a per-call timeout and are
//! non-fatal: a missing binary, a non-repo directory, or a slow command
//! degrades to `None` rather than failing the run.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

use crate::error::{Result, SykliError};

/// Per-call timeout for git subprocesses.
const GIT_TIMEOUT: Duration = Duration::from_secs(2);

/// Snapshot of the repository state at run time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GitContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_url: Option<String>,
}

/// Collect sha, branch, and remote url; absent pieces stay `None`.
pub async fn collect(workdir: &Path) -> GitContext {
    let (sha, branch, remote_url) = tokio::join!(
        git(workdir, &["rev-parse", "HEAD"]),
        git(workdir, &["rev-parse", "--abbrev-ref", "HEAD"]),
        git(workdir, &["remote", "get-url", "origin"]),
    );
    GitContext {
        sha,
        branch,
        remote_url,
    }
}

/// Is `workdir` inside a git work tree?
pub async fn is_git_repo(workdir: &Path) -> bool {
    git(workdir, &["rev-parse", "--is-inside-work-tree"])
        .await
        .as_deref()
        == Some("true")
}

/// Does the working tree carry uncommitted changes? (E034 when not a repo)
pub async fn is_dirty(workdir: &Path) -> Result<bool> {
    if !is_git_repo(workdir).await {
        return Err(SykliError::NotAGitRepo {
            dir: workdir.display().to_string(),
        });
    }
    let status = git(workdir, &["status", "--porcelain"])
        .await
        .unwrap_or_default();
    Ok(!status.is_empty())
}

/// Does a revision exist? (used to validate `--from` arguments)
pub async fn rev_exists(workdir: &Path, rev: &str) -> bool {
    run_git(workdir, &["rev-parse", "--verify", "--quiet", rev], GIT_TIMEOUT)
        .await
        .map(|(ok, _)| ok)
        .unwrap_or(false)
}

/// `git diff --name-only <from>`: paths changed since a revision.
pub async fn diff_names(workdir: &Path, from: &str) -> Result<Vec<String>> {
    let (ok, out) = run_git(workdir, &["diff", "--name-only", from], GIT_TIMEOUT)
        .await
        .ok_or_else(|| SykliError::NotAGitRepo {
            dir: workdir.display().to_string(),
        })?;
    if !ok {
        return Err(SykliError::Internal(format!(
            "git diff --name-only {} failed; does the revision exist?",
            from
        )));
    }
    Ok(lines(&out))
}

/// `git ls-files --others --exclude-standard`: untracked paths.
pub async fn untracked(workdir: &Path) -> Vec<String> {
    git(workdir, &["ls-files", "--others", "--exclude-standard"])
        .await
        .map(|out| lines(&out))
        .unwrap_or_default()
}

/// Run a read-only git query; `None` on any failure or timeout.
pub async fn git(workdir: &Path, args: &[&str]) -> Option<String> {
    match run_git(workdir, args, GIT_TIMEOUT).await {
        Some((true, out)) => {
            let trimmed = out.trim().to_string();
            (!trimmed.is_empty()).then_some(trimmed)
        }
        _ => None,
    }
}

async fn run_git(workdir: &Path, args: &[&str], timeout: Duration) -> Option<(bool, String)> {
    let result = tokio::time::timeout(
        timeout,
        Command::new("git")
            .args(args)
            .current_dir(workdir)
            .output(),
    )
    .await;

    match result {
        Ok(Ok(output)) => Some((
            output.status.success(),
            String::from_utf8_lossy(&output.stdout).into_owned(),
        )),
        Ok(Err(e)) => {
            debug!("git {:?} failed to start: {}", args, e);
            None
        }
        Err(_) => {
            debug!("git {:?} timed out", args);
            None
        }
    }
}

fn lines(out: &str) -> Vec<String> {
    out.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn init_repo(dir: &Path) {
        for args in [
            vec!["init", "-q"],
            vec!["config", "user.email", "test@example.com"],
            vec!["config", "user.name", "Test"],
        ] {
            Command::new("git")
                .args(&args)
                .current_dir(dir)
                .output()
                .await
                .unwrap();
        }
    }

    async fn commit_all(dir: &Path, message: &str) {
        Command::new("git")
            .args(["add", "-A"])
            .current_dir(dir)
            .output()
            .await
            .unwrap();
        Command::new("git")
            .args(["commit", "-q", "-m", message])
            .current_dir(dir)
            .output()
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn non_repo_yields_empty_context() {
        let dir = TempDir::new().unwrap();
        let ctx = collect(dir.path()).await;
        assert!(ctx.sha.is_none());
        assert!(!is_git_repo(dir.path()).await);
    }

    #[tokio::test]
    async fn repo_context_has_sha_and_branch() {
        let dir = TempDir::new().unwrap();
        init_repo(dir.path()).await;
        std::fs::write(dir.path().join("file.txt"), "x").unwrap();
        commit_all(dir.path(), "initial").await;

        let ctx = collect(dir.path()).await;
        assert_eq!(ctx.sha.as_ref().unwrap().len(), 40);
        assert!(ctx.branch.is_some());
        assert!(ctx.remote_url.is_none());
    }

    #[tokio::test]
    async fn dirty_detection() {
        let dir = TempDir::new().unwrap();
        init_repo(dir.path()).await;
        std::fs::write(dir.path().join("file.txt"), "x").unwrap();
        commit_all(dir.path(), "initial").await;

        assert!(!is_dirty(dir.path()).await.unwrap());
        std::fs::write(dir.path().join("file.txt"), "changed").unwrap();
        assert!(is_dirty(dir.path()).await.unwrap());
    }

    #[tokio::test]
    async fn dirty_outside_repo_is_e034() {
        let dir = TempDir::new().unwrap();
        let err = is_dirty(dir.path()).await.unwrap_err();
        assert_eq!(err.code(), "E034");
    }

    #[tokio::test]
    async fn diff_and_untracked_are_unioned_by_callers() {
        let dir = TempDir::new().unwrap();
        init_repo(dir.path()).await;
        std::fs::write(dir.path().join("tracked.txt"), "v1").unwrap();
        commit_all(dir.path(), "initial").await;

        std::fs::write(dir.path().join("tracked.txt"), "v2").unwrap();
        std::fs::write(dir.path().join("new.txt"), "untracked").unwrap();

        let changed = diff_names(dir.path(), "HEAD").await.unwrap();
        assert_eq!(changed, vec!["tracked.txt"]);

        let extra = untracked(dir.path()).await;
        assert_eq!(extra, vec!["new.txt"]);
    }

    #[tokio::test]
    async fn rev_exists_checks_revisions() {
        let dir = TempDir::new().unwrap();
        init_repo(dir.path()).await;
        std::fs::write(dir.path().join("f"), "x").unwrap();
        commit_all(dir.path(), "initial").await;

        assert!(rev_exists(dir.path(), "HEAD").await);
        assert!(!rev_exists(dir.path(), "no-such-ref").await);
    }
}
