//! SDK detection and the `--emit` protocol.
//!
//! Pipelines are declared in a per-language SDK file at the project root
//! (`sykli.go`, `sykli.rs`, `sykli.exs`). Invoking the emitter with
//! `--emit` yields a JSON graph on stdout; the extractor tolerates
//! compiler preamble (e.g. Cargo build messages) by taking the first line
//! whose trimmed form starts with `{` and contains `"version"`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use crate::error::{Result, SykliError};
use crate::graph::{self, Graph};

/// Emitters get a minute; SDK toolchains can be slow on cold caches.
const EMIT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdkLanguage {
    Go,
    Rust,
    Elixir,
}

impl SdkLanguage {
    /// The SDK filename for this language.
    pub fn file_name(&self) -> &'static str {
        match self {
            SdkLanguage::Go => "sykli.go",
            SdkLanguage::Rust => "sykli.rs",
            SdkLanguage::Elixir => "sykli.exs",
        }
    }

    /// Project marker that identifies the toolchain.
    pub fn marker(&self) -> &'static str {
        match self {
            SdkLanguage::Go => "go.mod",
            SdkLanguage::Rust => "Cargo.toml",
            SdkLanguage::Elixir => "mix.exs",
        }
    }

    /// The tool invoked to run the emitter.
    pub fn tool(&self) -> &'static str {
        match self {
            SdkLanguage::Go => "go",
            SdkLanguage::Rust => "cargo",
            SdkLanguage::Elixir => "elixir",
        }
    }

    fn emit_args(&self) -> Vec<&'static str> {
        match self {
            SdkLanguage::Go => vec!["run", "sykli.go", "--emit"],
            // The SDK file is a bin target named `sykli` in the project.
            SdkLanguage::Rust => vec!["run", "--quiet", "--bin", "sykli", "--", "--emit"],
            SdkLanguage::Elixir => vec!["sykli.exs", "--emit"],
        }
    }
}

#[derive(Debug, Clone)]
pub struct SdkFile {
    pub path: PathBuf,
    pub language: SdkLanguage,
}

/// Find the project's SDK file (E020 when absent).
pub fn detect(dir: &Path) -> Result<SdkFile> {
    for language in [SdkLanguage::Go, SdkLanguage::Rust, SdkLanguage::Elixir] {
        let path = dir.join(language.file_name());
        if path.is_file() {
            debug!(path = %path.display(), "SDK file detected");
            return Ok(SdkFile { path, language });
        }
    }
    Err(SykliError::SdkNotFound {
        dir: dir.display().to_string(),
    })
}

/// Run the emitter and return raw stdout (E021/E022/E024).
pub async fn emit(sdk: &SdkFile, dir: &Path) -> Result<String> {
    let tool = sdk.language.tool();
    let spawned = Command::new(tool)
        .args(sdk.language.emit_args())
        .current_dir(dir)
        .output();

    let output = match tokio::time::timeout(EMIT_TIMEOUT, spawned).await {
        Err(_) => {
            return Err(SykliError::SdkEmitTimeout {
                timeout_secs: EMIT_TIMEOUT.as_secs(),
            })
        }
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(SykliError::SdkMissingTool {
                tool: tool.to_string(),
            })
        }
        Ok(Err(e)) => return Err(e.into()),
        Ok(Ok(output)) => output,
    };

    if !output.status.success() {
        return Err(SykliError::SdkEmitFailed {
            reason: String::from_utf8_lossy(&output.stderr)
                .lines()
                .take(10)
                .collect::<Vec<_>>()
                .join("\n"),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Pull the graph document out of emitter stdout (E023 when absent).
pub fn extract_graph_json(stdout: &str) -> Result<&str> {
    stdout
        .lines()
        .find(|line| {
            let trimmed = line.trim();
            trimmed.starts_with('{') && trimmed.contains("\"version\"")
        })
        .map(str::trim)
        .ok_or_else(|| SykliError::SdkInvalidJson {
            reason: "no graph document found in emitter output".to_string(),
        })
}

/// Detect, emit, extract, and load in one step.
pub async fn load_pipeline(dir: &Path) -> Result<Graph> {
    let sdk = detect(dir)?;
    let stdout = emit(&sdk, dir).await?;
    let json = extract_graph_json(&stdout)?;
    graph::load_graph(json)
}
