//! Error location extraction and git-blame enrichment.
//!
//! A fixed rule set pulls `file:line` references out of task output:
//! Rust (`--> file:line:col`), Python (`File "f", line N`), TypeScript
//! (`f(line,col):`), Elixir (`f:line: (module)`), and a generic
//! `file:line[:col]: message` form. Each location is enriched with blame
//! (author, date, sha, subject) and a recent-commit count; enrichment is
//! optional and its absence is non-fatal. Locations outside the workdir or
//! for files that no longer exist are filtered out.

use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::gitctx;

/// Upper bound on locations kept from one output.
const MAX_LOCATIONS: usize = 10;

/// Commits counted when ranking how hot a file is.
const RECENT_COMMIT_WINDOW: &str = "20";

/// Blame data for one location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlameInfo {
    pub author: String,
    pub date: String,
    pub sha: String,
    pub subject: String,
}

/// A `file:line` reference found in task output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorLocation {
    pub file: String,
    pub line: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blame: Option<BlameInfo>,
    /// Commits touching this file in the recent window.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recent_commits: Option<u32>,
}

struct Rule {
    regex: &'static Lazy<Regex>,
    file: usize,
    line: usize,
    column: Option<usize>,
}

static RUST_ARROW: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"-->\s+([^\s:]+):(\d+):(\d+)").expect("static regex"));
static PYTHON_FILE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"File "([^"]+)", line (\d+)"#).expect("static regex"));
static TS_PARENS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([^\s():]+)\((\d+),(\d+)\):").expect("static regex"));
static ELIXIR_PARENS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([^\s:]+\.exs?):(\d+):\s+\(").expect("static regex"));
static GENERIC: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"([^\s:]+\.[A-Za-z0-9_]+):(\d+)(?::(\d+))?:\s").expect("static regex")
});

/// Rules are tried in order; earlier, more specific forms win dedup.
fn rules() -> [Rule; 5] {
    [
        Rule { regex: &RUST_ARROW, file: 1, line: 2, column: Some(3) },
        Rule { regex: &PYTHON_FILE, file: 1, line: 2, column: None },
        Rule { regex: &TS_PARENS, file: 1, line: 2, column: Some(3) },
        Rule { regex: &ELIXIR_PARENS, file: 1, line: 2, column: None },
        Rule { regex: &GENERIC, file: 1, line: 2, column: Some(3) },
    ]
}

/// Extract unique locations from task output, in discovery order.
pub fn extract(output: &str) -> Vec<ErrorLocation> {
    let mut found = Vec::new();
    let mut seen = std::collections::BTreeSet::new();

    for rule in rules() {
        for captures in rule.regex.captures_iter(output) {
            let Some(file) = captures.get(rule.file).map(|m| m.as_str().to_string()) else {
                continue;
            };
            let Some(line) = captures
                .get(rule.line)
                .and_then(|m| m.as_str().parse::<u32>().ok())
            else {
                continue;
            };
            let column = rule
                .column
                .and_then(|i| captures.get(i))
                .and_then(|m| m.as_str().parse::<u32>().ok());

            if seen.insert((file.clone(), line)) {
                found.push(ErrorLocation {
                    file,
                    line,
                    column,
                    blame: None,
                    recent_commits: None,
                });
                if found.len() >= MAX_LOCATIONS {
                    return found;
                }
            }
        }
    }
    found
}

/// Drop locations pointing outside the workdir or at deleted files, then
/// enrich the survivors with blame and recent-commit counts in parallel.
pub async fn enrich(locations: Vec<ErrorLocation>, workdir: &Path) -> Vec<ErrorLocation> {
    let kept: Vec<ErrorLocation> = locations
        .into_iter()
        .filter(|loc| {
            !loc.file.starts_with("..")
                && !Path::new(&loc.file).is_absolute()
                && workdir.join(&loc.file).is_file()
        })
        .collect();

    let enriched = kept.into_iter().map(|mut loc| async move {
        let (blame, count) = tokio::join!(
            blame_line(workdir, &loc.file, loc.line),
            recent_commit_count(workdir, &loc.file),
        );
        loc.blame = blame;
        loc.recent_commits = count;
        loc
    });
    futures::future::join_all(enriched).await
}

/// `git blame -L n,n --porcelain` for one line; `None` on any failure.
async fn blame_line(workdir: &Path, file: &str, line: u32) -> Option<BlameInfo> {
    let range = format!("{},{}", line, line);
    let out = gitctx::git(workdir, &["blame", "-L", &range, "--porcelain", "--", file]).await?;

    let mut sha = None;
    let mut author = None;
    let mut date = None;
    let mut subject = None;
    for (i, l) in out.lines().enumerate() {
        if i == 0 {
            sha = l.split_whitespace().next().map(str::to_string);
        } else if let Some(rest) = l.strip_prefix("author ") {
            author = Some(rest.to_string());
        } else if let Some(rest) = l.strip_prefix("author-time ") {
            date = rest
                .parse::<i64>()
                .ok()
                .and_then(|t| chrono::DateTime::from_timestamp(t, 0))
                .map(|d| d.format("%Y-%m-%d").to_string());
        } else if let Some(rest) = l.strip_prefix("summary ") {
            subject = Some(rest.to_string());
        }
    }

    Some(BlameInfo {
        author: author?,
        date: date.unwrap_or_default(),
        sha: sha?,
        subject: subject.unwrap_or_default(),
    })
}

async fn recent_commit_count(workdir: &Path, file: &str) -> Option<u32> {
    let out = gitctx::git(
        workdir,
        &["log", "--oneline", "-n", RECENT_COMMIT_WINDOW, "--", file],
    )
    .await?;
    Some(out.lines().count() as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rust_arrow_form() {
        let out = "error[E0308]: mismatched types\n  --> src/main.rs:14:9\n";
        let locs = extract(out);
        assert_eq!(locs.len(), 1);
        assert_eq!(locs[0].file, "src/main.rs");
        assert_eq!(locs[0].line, 14);
        assert_eq!(locs[0].column, Some(9));
    }

    #[test]
    fn python_traceback_form() {
        let out = r#"Traceback (most recent call last):
  File "app/main.py", line 42, in <module>
    run()
"#;
        let locs = extract(out);
        assert_eq!(locs[0].file, "app/main.py");
        assert_eq!(locs[0].line, 42);
        assert_eq!(locs[0].column, None);
    }

    #[test]
    fn typescript_parens_form() {
        let out = "src/index.ts(7,23): error TS2345: Argument of type 'string'";
        let locs = extract(out);
        assert_eq!(locs[0].file, "src/index.ts");
        assert_eq!(locs[0].line, 7);
        assert_eq!(locs[0].column, Some(23));
    }

    #[test]
    fn generic_colon_form() {
        let out = "lib/parser.go:88:4: undefined: tokenize";
        let locs = extract(out);
        assert_eq!(locs[0].file, "lib/parser.go");
        assert_eq!(locs[0].line, 88);
        assert_eq!(locs[0].column, Some(4));
    }

    #[test]
    fn elixir_parens_form() {
        let out = "lib/worker.ex:31: (module)";
        let locs = extract(out);
        assert_eq!(locs[0].file, "lib/worker.ex");
        assert_eq!(locs[0].line, 31);
    }

    #[test]
    fn duplicates_collapse() {
        let out = "--> src/main.rs:5:1\nsrc/main.rs:5:1: also here\n";
        assert_eq!(extract(out).len(), 1);
    }

    #[test]
    fn no_locations_in_plain_output() {
        assert!(extract("tests passed\nall green\n").is_empty());
    }

    #[test]
    fn extraction_is_capped() {
        let out: String = (1..=50)
            .map(|i| format!("--> src/file{}.rs:{}:1\n", i, i))
            .collect();
        assert_eq!(extract(&out).len(), MAX_LOCATIONS);
    }

    #[tokio::test]
    async fn enrich_filters_missing_and_escaping_paths() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("real.rs"), "fn main() {}\n").unwrap();

        let locations = vec![
            ErrorLocation {
                file: "real.rs".into(),
                line: 1,
                column: None,
                blame: None,
                recent_commits: None,
            },
            ErrorLocation {
                file: "gone.rs".into(),
                line: 1,
                column: None,
                blame: None,
                recent_commits: None,
            },
            ErrorLocation {
                file: "../outside.rs".into(),
                line: 1,
                column: None,
                blame: None,
                recent_commits: None,
            },
        ];

        let enriched = enrich(locations, dir.path()).await;
        assert_eq!(enriched.len(), 1);
        assert_eq!(enriched[0].file, "real.rs");
        // Not a git repo: enrichment absent but not fatal.
        assert!(enriched[0].blame.is_none());
    }
}
