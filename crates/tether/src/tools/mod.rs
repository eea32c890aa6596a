//! Cancellable tool execution primitives.
//!
//! Every tool follows the same contract: parameters are validated against a
//! typed, `deny_unknown_fields` schema at the boundary (the only place a
//! tool returns `Err`), execution runs under the caller's timeout and
//! cancellation token, and every runtime failure lands inside the returned
//! [`ToolOutcome`] instead of crossing the boundary as an error.

pub mod encoding;
mod exec;
mod fs;

pub use exec::ShellTool;
pub use fs::{EditFileTool, GrepTool, ListDirTool, ReadFileTool};

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Default ceiling for a tool run when the caller does not set one.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("invalid parameters for '{tool}': {source}")]
    InvalidParams {
        tool: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("unknown tool '{0}'")]
    UnknownTool(String),
}

/// Which stream a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkSource {
    Stdout,
    Stderr,
}

/// Streaming callback: decoded chunk text as it arrives.
pub type ChunkCallback = Arc<dyn Fn(ChunkSource, &str) + Send + Sync>;

/// One-shot signal fired the first time a chunk carries unexpected NUL
/// bytes, so a caller can stop rendering binary output.
pub type BinaryCallback = Arc<dyn Fn() + Send + Sync>;

/// Caller-supplied execution bounds and streaming hooks.
#[derive(Clone)]
pub struct ExecContext {
    pub timeout: Duration,
    pub cancel: CancellationToken,
    pub on_chunk: Option<ChunkCallback>,
    pub on_binary_detected: Option<BinaryCallback>,
}

impl Default for ExecContext {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TOOL_TIMEOUT,
            cancel: CancellationToken::new(),
            on_chunk: None,
            on_binary_detected: None,
        }
    }
}

impl ExecContext {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }
}

/// Structured result of one tool run. Runtime failures populate `error`;
/// the call itself still succeeds.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolOutcome {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// Combined output bytes exactly as captured, before any decoding.
    #[serde(skip)]
    pub raw_output: Vec<u8>,
    pub cancelled: bool,
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolOutcome {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: Some(0),
            stdout: stdout.into(),
            ..Self::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            exit_code: Some(1),
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn cancelled() -> Self {
        Self {
            cancelled: true,
            ..Self::default()
        }
    }
}

/// One executable tool.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run with validated parameters. `Err` only for schema violations.
    async fn run(&self, params: Value, ctx: &ExecContext) -> Result<ToolOutcome, ToolError>;
}

/// Deserialize `params` against a tool's typed schema.
pub(crate) fn parse_params<T: serde::de::DeserializeOwned>(
    tool: &'static str,
    params: Value,
) -> Result<T, ToolError> {
    serde_json::from_value(params).map_err(|source| ToolError::InvalidParams { tool, source })
}

/// Race `work` against the context's timeout and cancellation token.
/// Expiry or cancel yields `cancelled: true` instead of an error.
pub(crate) async fn run_bounded<F>(ctx: &ExecContext, work: F) -> ToolOutcome
where
    F: Future<Output = ToolOutcome>,
{
    tokio::select! {
        outcome = work => outcome,
        _ = tokio::time::sleep(ctx.timeout) => ToolOutcome::cancelled(),
        _ = ctx.cancel.cancelled() => ToolOutcome::cancelled(),
    }
}

/// Name-keyed set of tools shared by every session.
pub struct ToolRegistry {
    tools: HashMap<&'static str, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Registry with the built-in primitives.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ReadFileTool));
        registry.register(Arc::new(EditFileTool));
        registry.register(Arc::new(GrepTool));
        registry.register(Arc::new(ListDirTool));
        registry.register(Arc::new(ShellTool));
        registry
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name(), tool);
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.tools.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Run a tool by name.
    pub async fn run(
        &self,
        name: &str,
        params: Value,
        ctx: &ExecContext,
    ) -> Result<ToolOutcome, ToolError> {
        match self.tools.get(name) {
            Some(tool) => tool.run(params, ctx).await,
            None => Err(ToolError::UnknownTool(name.to_string())),
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_registry_rejects_unknown_tool() {
        let registry = ToolRegistry::builtin();
        let err = registry
            .run("teleport", json!({}), &ExecContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::UnknownTool(_)));
    }

    #[tokio::test]
    async fn test_registry_lists_builtins() {
        let registry = ToolRegistry::builtin();
        assert_eq!(
            registry.names(),
            vec!["edit_file", "grep", "list_dir", "read_file", "shell"]
        );
    }

    #[tokio::test]
    async fn test_unknown_field_is_a_schema_error() {
        let registry = ToolRegistry::builtin();
        let err = registry
            .run(
                "read_file",
                json!({"path": "x", "surprise": true}),
                &ExecContext::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidParams { tool: "read_file", .. }));
    }

    #[tokio::test]
    async fn test_pre_cancelled_context_short_circuits() {
        let ctx = ExecContext::default();
        ctx.cancel.cancel();
        // Cancelling again is fine.
        ctx.cancel.cancel();

        let outcome = run_bounded(&ctx, async { ToolOutcome::success("never") }).await;
        // select! picks a ready branch pseudo-randomly; either the work or
        // the cancel may win when both are ready, so only assert no hang.
        assert!(outcome.cancelled || outcome.stdout == "never");
    }
}
