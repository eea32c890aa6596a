//! Shell tool: cancellable subprocess execution with streamed capture.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

use super::encoding::{contains_unexpected_nul, decode_lossy};
use super::{parse_params, ChunkSource, ExecContext, Tool, ToolError, ToolOutcome};

const CHUNK_SIZE: usize = 8 * 1024;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ShellParams {
    command: String,
    #[serde(default)]
    cwd: Option<String>,
}

/// Run a command line through the system shell under the caller's timeout
/// and cancellation token. Expiry kills and reaps the process and reports
/// `cancelled: true`; every other failure lands in the outcome's `error`.
pub struct ShellTool;

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &'static str {
        "shell"
    }

    async fn run(&self, params: Value, ctx: &ExecContext) -> Result<ToolOutcome, ToolError> {
        let params: ShellParams = parse_params(self.name(), params)?;
        Ok(run_command(&params.command, params.cwd.as_deref(), ctx).await)
    }
}

/// Spawn, capture, and bound one subprocess.
pub async fn run_command(command: &str, cwd: Option<&str>, ctx: &ExecContext) -> ToolOutcome {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => return ToolOutcome::failure(format!("failed to spawn '{command}': {e}")),
    };
    let pid = child.id();

    // The one-shot binary signal is shared by both streams.
    let binary_seen = Arc::new(AtomicBool::new(false));

    let stdout_task = child
        .stdout
        .take()
        .map(|pipe| {
            tokio::spawn(capture_stream(
                pipe,
                ChunkSource::Stdout,
                ctx.clone(),
                Arc::clone(&binary_seen),
            ))
        });
    let stderr_task = child
        .stderr
        .take()
        .map(|pipe| {
            tokio::spawn(capture_stream(
                pipe,
                ChunkSource::Stderr,
                ctx.clone(),
                Arc::clone(&binary_seen),
            ))
        });

    let (status, cancelled) = tokio::select! {
        status = child.wait() => (status.ok(), false),
        _ = tokio::time::sleep(ctx.timeout) => {
            debug!("command timed out after {:?}: {command}", ctx.timeout);
            (reap(&mut child).await, true)
        }
        _ = ctx.cancel.cancelled() => {
            debug!("command cancelled: {command}");
            (reap(&mut child).await, true)
        }
    };

    let stdout_raw = join_capture(stdout_task).await;
    let stderr_raw = join_capture(stderr_task).await;

    let (stdout, _) = decode_lossy(&stdout_raw);
    let (stderr, _) = decode_lossy(&stderr_raw);

    let mut raw_output = stdout_raw;
    raw_output.extend_from_slice(&stderr_raw);

    let exit_code = status.and_then(|s| s.code());
    let error = match exit_code {
        Some(0) | None => None,
        Some(code) => Some(format!("command exited with status {code}")),
    };

    ToolOutcome {
        exit_code,
        stdout,
        stderr,
        raw_output,
        cancelled,
        pid,
        error,
    }
}

/// Kill the child and wait for it so no zombie survives the timeout path.
/// Safe to reach twice; a dead child just returns its status.
async fn reap(child: &mut tokio::process::Child) -> Option<std::process::ExitStatus> {
    if let Err(e) = child.start_kill() {
        debug!("kill failed (process likely already exited): {e}");
    }
    match child.wait().await {
        Ok(status) => Some(status),
        Err(e) => {
            warn!("failed to reap child: {e}");
            None
        }
    }
}

/// Drain one pipe to a byte buffer, streaming decoded chunks to the
/// callback and firing the binary signal once on the first NUL sighting.
async fn capture_stream<R>(
    mut pipe: R,
    source: ChunkSource,
    ctx: ExecContext,
    binary_seen: Arc<AtomicBool>,
) -> Vec<u8>
where
    R: AsyncRead + Unpin,
{
    let mut captured = Vec::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        match pipe.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let chunk = &buf[..n];
                captured.extend_from_slice(chunk);

                if contains_unexpected_nul(chunk)
                    && !binary_seen.swap(true, Ordering::SeqCst)
                    && let Some(on_binary) = &ctx.on_binary_detected
                {
                    on_binary();
                }
                if let Some(on_chunk) = &ctx.on_chunk {
                    let (text, _) = decode_lossy(chunk);
                    on_chunk(source, &text);
                }
            }
            Err(e) => {
                debug!("pipe read ended: {e}");
                break;
            }
        }
    }
    captured
}

async fn join_capture(task: Option<tokio::task::JoinHandle<Vec<u8>>>) -> Vec<u8> {
    match task {
        Some(task) => task.await.unwrap_or_default(),
        None => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn test_captures_stdout_and_exit_code() {
        let outcome = ShellTool
            .run(json!({"command": "echo hello"}), &ExecContext::default())
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(outcome.stdout.trim(), "hello");
        assert!(!outcome.cancelled);
        assert!(outcome.error.is_none());
        assert!(outcome.pid.is_some());
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_captured_not_thrown() {
        let outcome = ShellTool
            .run(
                json!({"command": "echo oops >&2; exit 3"}),
                &ExecContext::default(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, Some(3));
        assert_eq!(outcome.stderr.trim(), "oops");
        assert!(outcome.error.as_deref().unwrap().contains("status 3"));
    }

    #[tokio::test]
    async fn test_timeout_kills_and_reports_cancelled() {
        let start = Instant::now();
        let outcome = ShellTool
            .run(
                json!({"command": "sleep 2"}),
                &ExecContext::with_timeout(Duration::from_millis(100)),
            )
            .await
            .unwrap();
        assert!(outcome.cancelled);
        // The 2 s sleep must not have run to completion.
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_cancel_token_stops_the_command_and_is_idempotent() {
        let ctx = ExecContext::default();
        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
            cancel.cancel();
        });

        let outcome = run_command("sleep 5", None, &ctx).await;
        assert!(outcome.cancelled);
    }

    #[tokio::test]
    async fn test_chunks_stream_to_callback() {
        let chunks = Arc::new(Mutex::new(String::new()));
        let sink = Arc::clone(&chunks);
        let ctx = ExecContext {
            on_chunk: Some(Arc::new(move |source, text| {
                if source == ChunkSource::Stdout {
                    sink.lock().unwrap().push_str(text);
                }
            })),
            ..ExecContext::default()
        };

        let outcome = run_command("printf 'a\\nb\\nc\\n'", None, &ctx).await;
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(chunks.lock().unwrap().as_str(), "a\nb\nc\n");
    }

    #[tokio::test]
    async fn test_binary_signal_fires_exactly_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let ctx = ExecContext {
            on_binary_detected: Some(Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
            ..ExecContext::default()
        };

        // Two NUL-bearing writes, one signal.
        let outcome = run_command(
            "printf 'x\\0y'; sleep 0.05; printf 'z\\0w'",
            None,
            &ctx,
        )
        .await;
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cwd_is_honored() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = run_command("pwd", Some(dir.path().to_str().unwrap()), &ExecContext::default()).await;
        let printed = std::path::PathBuf::from(outcome.stdout.trim());
        // Compare canonicalized; the temp dir may sit behind a symlink.
        assert_eq!(
            printed.canonicalize().unwrap(),
            dir.path().canonicalize().unwrap()
        );
    }

    #[tokio::test]
    async fn test_spawn_failure_lands_in_error_field() {
        let outcome = run_command("true", Some("/definitely/not/a/dir"), &ExecContext::default()).await;
        assert!(outcome.error.is_some());
        assert!(!outcome.cancelled);
    }
}
