//! Agent handle: the session's view of the long-lived model process.
//!
//! A bridge talks to whatever produces annotations through this trait. The
//! built-in [`EchoAgent`] streams the prompt straight back as text deltas,
//! which keeps the server runnable end to end without a model provider.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use tether_protocol::Annotation;

use crate::approval::ApprovalOption;

/// One prompt from a client, as carried by `session.send`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptRequest {
    pub message: String,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub plan_mode: bool,
}

/// Size of an agent's annotation channel.
const ANNOTATION_BUFFER: usize = 64;

#[async_trait]
pub trait Agent: Send + Sync {
    /// Start one turn. Annotations stream on the returned channel until the
    /// turn completes; the channel closing marks the end of the stream.
    async fn send(&self, prompt: PromptRequest) -> anyhow::Result<mpsc::Receiver<Annotation>>;

    /// Abort the in-flight turn. Idempotent; a no-op when nothing runs.
    async fn abort(&self);

    /// Deliver a human decision on a tool call this agent requested.
    async fn resolve_approval(
        &self,
        _call_id: &str,
        _approved: bool,
        _option: ApprovalOption,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Creates one agent per connection.
pub type AgentFactory = Arc<dyn Fn() -> Arc<dyn Agent> + Send + Sync>;

/// Streams the prompt back word by word as text deltas.
pub struct EchoAgent {
    current: Mutex<Option<CancellationToken>>,
}

impl EchoAgent {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(None),
        }
    }

    /// Factory producing one echo agent per connection.
    pub fn factory() -> AgentFactory {
        Arc::new(|| Arc::new(EchoAgent::new()))
    }
}

impl Default for EchoAgent {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Agent for EchoAgent {
    async fn send(&self, prompt: PromptRequest) -> anyhow::Result<mpsc::Receiver<Annotation>> {
        let cancel = CancellationToken::new();
        {
            let mut current = self.current.lock().await;
            // A new turn supersedes a running one.
            if let Some(previous) = current.replace(cancel.clone()) {
                previous.cancel();
            }
        }

        let (tx, rx) = mpsc::channel(ANNOTATION_BUFFER);
        tokio::spawn(async move {
            for word in prompt.message.split_inclusive(' ') {
                if cancel.is_cancelled() {
                    return;
                }
                let delta = Annotation::TextDelta {
                    text: word.to_string(),
                };
                if tx.send(delta).await.is_err() {
                    return;
                }
            }
            // Closing the channel ends the turn.
        });

        Ok(rx)
    }

    async fn abort(&self) {
        if let Some(cancel) = self.current.lock().await.take() {
            cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prompt(message: &str) -> PromptRequest {
        PromptRequest {
            message: message.to_string(),
            cwd: None,
            session_id: None,
            plan_mode: false,
        }
    }

    #[tokio::test]
    async fn test_echo_streams_the_prompt_back() {
        let agent = EchoAgent::new();
        let mut rx = agent.send(prompt("hello echo world")).await.unwrap();

        let mut text = String::new();
        while let Some(annotation) = rx.recv().await {
            match annotation {
                Annotation::TextDelta { text: t } => text.push_str(&t),
                other => panic!("unexpected annotation: {other:?}"),
            }
        }
        assert_eq!(text, "hello echo world");
    }

    #[tokio::test]
    async fn test_abort_is_idempotent() {
        let agent = EchoAgent::new();
        let _rx = agent.send(prompt("long running")).await.unwrap();
        agent.abort().await;
        agent.abort().await;
    }

    #[tokio::test]
    async fn test_prompt_request_accepts_minimal_params() {
        let prompt: PromptRequest =
            serde_json::from_value(serde_json::json!({"message": "hi"})).unwrap();
        assert_eq!(prompt.message, "hi");
        assert!(!prompt.plan_mode);
    }
}
