//! Filesystem tool primitives: read, edit, grep, list.
//!
//! Each is a bounded wrapper over the shared contract: typed params,
//! timeout/cancel via [`run_bounded`], runtime failures in the outcome.

use async_trait::async_trait;
use log::debug;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use walkdir::WalkDir;

use super::encoding::{contains_unexpected_nul, decode_lossy};
use super::{parse_params, run_bounded, ExecContext, Tool, ToolError, ToolOutcome};

/// Line cap for a single read without explicit bounds.
const DEFAULT_READ_LIMIT: usize = 2_000;
/// Match cap for one grep run.
const DEFAULT_GREP_LIMIT: usize = 100;
/// Entry cap for one directory listing.
const DEFAULT_LIST_LIMIT: usize = 500;

// ============================================================================
// read_file
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ReadFileParams {
    path: String,
    #[serde(default)]
    offset: Option<usize>,
    #[serde(default)]
    limit: Option<usize>,
}

/// Read a text file, decoded leniently, bounded by line offset/limit.
pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &'static str {
        "read_file"
    }

    async fn run(&self, params: Value, ctx: &ExecContext) -> Result<ToolOutcome, ToolError> {
        let params: ReadFileParams = parse_params(self.name(), params)?;
        Ok(run_bounded(ctx, async move {
            let bytes = match tokio::fs::read(&params.path).await {
                Ok(bytes) => bytes,
                Err(e) => return ToolOutcome::failure(format!("read '{}': {e}", params.path)),
            };
            let (text, encoding) = decode_lossy(&bytes);
            debug!("read {} ({} bytes, {encoding})", params.path, bytes.len());

            let offset = params.offset.unwrap_or(0);
            let limit = params.limit.unwrap_or(DEFAULT_READ_LIMIT);
            let window: Vec<&str> = text.lines().skip(offset).take(limit).collect();

            ToolOutcome {
                raw_output: bytes,
                ..ToolOutcome::success(window.join("\n"))
            }
        })
        .await)
    }
}

// ============================================================================
// edit_file
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct EditFileParams {
    path: String,
    old_string: String,
    new_string: String,
}

/// Replace the first occurrence of `old_string` in a file. An absent or
/// ambiguous target is a runtime failure, not a partial write.
pub struct EditFileTool;

#[async_trait]
impl Tool for EditFileTool {
    fn name(&self) -> &'static str {
        "edit_file"
    }

    async fn run(&self, params: Value, ctx: &ExecContext) -> Result<ToolOutcome, ToolError> {
        let params: EditFileParams = parse_params(self.name(), params)?;
        Ok(run_bounded(ctx, async move {
            let bytes = match tokio::fs::read(&params.path).await {
                Ok(bytes) => bytes,
                Err(e) => return ToolOutcome::failure(format!("read '{}': {e}", params.path)),
            };
            let (text, _) = decode_lossy(&bytes);

            if params.old_string.is_empty() {
                return ToolOutcome::failure("old_string must not be empty");
            }
            let occurrences = text.matches(&params.old_string).count();
            if occurrences == 0 {
                return ToolOutcome::failure(format!(
                    "old_string not found in '{}'",
                    params.path
                ));
            }
            if occurrences > 1 {
                return ToolOutcome::failure(format!(
                    "old_string matches {occurrences} locations in '{}'; provide more context",
                    params.path
                ));
            }

            let updated = text.replacen(&params.old_string, &params.new_string, 1);
            if let Err(e) = tokio::fs::write(&params.path, &updated).await {
                return ToolOutcome::failure(format!("write '{}': {e}", params.path));
            }
            ToolOutcome::success(format!("edited {}", params.path))
        })
        .await)
    }
}

// ============================================================================
// grep
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct GrepParams {
    pattern: String,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    max_results: Option<usize>,
}

/// Regex search across a directory tree, skipping binary files.
pub struct GrepTool;

#[async_trait]
impl Tool for GrepTool {
    fn name(&self) -> &'static str {
        "grep"
    }

    async fn run(&self, params: Value, ctx: &ExecContext) -> Result<ToolOutcome, ToolError> {
        let params: GrepParams = parse_params(self.name(), params)?;
        let cancel = ctx.cancel.clone();
        Ok(run_bounded(ctx, async move {
            let regex = match Regex::new(&params.pattern) {
                Ok(regex) => regex,
                Err(e) => return ToolOutcome::failure(format!("invalid pattern: {e}")),
            };
            let root = params.path.unwrap_or_else(|| ".".to_string());
            let cap = params.max_results.unwrap_or(DEFAULT_GREP_LIMIT);

            // Directory walking is blocking work; keep it off the runtime.
            let matches = tokio::task::spawn_blocking(move || {
                let mut matches = Vec::new();
                for entry in WalkDir::new(&root).into_iter().filter_map(Result::ok) {
                    if matches.len() >= cap || cancel.is_cancelled() {
                        break;
                    }
                    if !entry.file_type().is_file() {
                        continue;
                    }
                    let Ok(bytes) = std::fs::read(entry.path()) else {
                        continue;
                    };
                    if contains_unexpected_nul(&bytes) {
                        continue;
                    }
                    let (text, _) = decode_lossy(&bytes);
                    for (lineno, line) in text.lines().enumerate() {
                        if regex.is_match(line) {
                            matches.push(format!(
                                "{}:{}:{}",
                                entry.path().display(),
                                lineno + 1,
                                line
                            ));
                            if matches.len() >= cap {
                                break;
                            }
                        }
                    }
                }
                matches
            })
            .await;

            match matches {
                Ok(matches) => ToolOutcome::success(matches.join("\n")),
                Err(e) => ToolOutcome::failure(format!("search task failed: {e}")),
            }
        })
        .await)
    }
}

// ============================================================================
// list_dir
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ListDirParams {
    path: String,
    #[serde(default)]
    max_entries: Option<usize>,
}

/// Sorted shallow listing; directories carry a trailing slash.
pub struct ListDirTool;

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &'static str {
        "list_dir"
    }

    async fn run(&self, params: Value, ctx: &ExecContext) -> Result<ToolOutcome, ToolError> {
        let params: ListDirParams = parse_params(self.name(), params)?;
        Ok(run_bounded(ctx, async move {
            let mut reader = match tokio::fs::read_dir(&params.path).await {
                Ok(reader) => reader,
                Err(e) => return ToolOutcome::failure(format!("list '{}': {e}", params.path)),
            };
            let cap = params.max_entries.unwrap_or(DEFAULT_LIST_LIMIT);

            let mut names = Vec::new();
            loop {
                match reader.next_entry().await {
                    Ok(Some(entry)) => {
                        let mut name = entry.file_name().to_string_lossy().into_owned();
                        if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                            name.push('/');
                        }
                        names.push(name);
                        if names.len() >= cap {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        return ToolOutcome::failure(format!("list '{}': {e}", params.path))
                    }
                }
            }
            names.sort_unstable();
            ToolOutcome::success(names.join("\n"))
        })
        .await)
    }
}
