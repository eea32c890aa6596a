//! Per-connection session bridge.
//!
//! One bridge per accepted connection: its own bus, agent handle, timeline,
//! approval gate, and file-edit store. Nothing here is shared across
//! connections. The bridge registers the client-facing request methods and
//! translates the agent's annotation stream into client events.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use tether_protocol::{finalize, merge, Annotation, TimelineEntry};

use crate::agent::{Agent, PromptRequest};
use crate::approval::{ApprovalGate, ApprovalOption, DecisionSink, FileEditStore};
use crate::bus::MessageBus;
use crate::tools::{ExecContext, ToolRegistry, DEFAULT_TOOL_TIMEOUT};
use crate::transport::Transport;

/// Routes decided approvals to the session's agent.
struct AgentDecisionSink {
    agent: Arc<dyn Agent>,
}

#[async_trait]
impl DecisionSink for AgentDecisionSink {
    async fn submit(
        &self,
        call_id: &str,
        approved: bool,
        option: ApprovalOption,
    ) -> anyhow::Result<()> {
        self.agent.resolve_approval(call_id, approved, option).await
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DecisionParams {
    #[serde(default)]
    call_id: Option<String>,
    #[serde(default)]
    approved: bool,
    #[serde(default = "default_option")]
    option: ApprovalOption,
    /// Replay a decision whose submission failed.
    #[serde(default)]
    retry: bool,
}

fn default_option() -> ApprovalOption {
    ApprovalOption::Once
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ToolRunParams {
    tool: String,
    #[serde(default)]
    params: Value,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

/// All session state for one connection.
pub struct SessionBridge {
    id: String,
    transport: Arc<dyn Transport>,
    bus: Arc<MessageBus>,
    agent: Arc<dyn Agent>,
    timeline: Mutex<Vec<TimelineEntry>>,
    gate: ApprovalGate,
    edits: Arc<FileEditStore>,
    tools: Arc<ToolRegistry>,
    closed: AtomicBool,
}

impl SessionBridge {
    /// Build the bridge and register its request handlers on the bus.
    pub fn new(
        id: impl Into<String>,
        transport: Arc<dyn Transport>,
        bus: Arc<MessageBus>,
        agent: Arc<dyn Agent>,
        tools: Arc<ToolRegistry>,
    ) -> Arc<Self> {
        let edits = Arc::new(FileEditStore::new());
        let sink = Arc::new(AgentDecisionSink {
            agent: Arc::clone(&agent),
        });
        let bridge = Arc::new(Self {
            id: id.into(),
            transport,
            bus,
            agent,
            timeline: Mutex::new(Vec::new()),
            gate: ApprovalGate::new(sink, Arc::clone(&edits)),
            edits,
            tools,
            closed: AtomicBool::new(false),
        });
        bridge.register_handlers();
        bridge
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn edits(&self) -> &FileEditStore {
        &self.edits
    }

    pub fn gate(&self) -> &ApprovalGate {
        &self.gate
    }

    /// Current timeline snapshot.
    pub async fn timeline(&self) -> Vec<TimelineEntry> {
        self.timeline.lock().await.clone()
    }

    fn register_handlers(self: &Arc<Self>) {
        {
            let bridge = Arc::clone(self);
            self.bus.register_handler("session.send", move |params| {
                let bridge = Arc::clone(&bridge);
                async move { bridge.handle_send(params).await }
            });
        }
        {
            let bridge = Arc::clone(self);
            self.bus.register_handler("session.timeline", move |_params| {
                let bridge = Arc::clone(&bridge);
                async move {
                    let timeline = bridge.timeline().await;
                    Ok(serde_json::to_value(timeline)?)
                }
            });
        }
        {
            let bridge = Arc::clone(self);
            self.bus.register_handler("session.abort", move |_params| {
                let bridge = Arc::clone(&bridge);
                async move {
                    bridge.agent.abort().await;
                    bridge.gate.clear_current_approval().await;
                    Ok(json!({"aborted": true}))
                }
            });
        }
        {
            let bridge = Arc::clone(self);
            self.bus.register_handler("tool.run", move |params| {
                let bridge = Arc::clone(&bridge);
                async move { bridge.handle_tool_run(params).await }
            });
        }
        {
            let bridge = Arc::clone(self);
            self.bus
                .register_handler("approval.decision", move |params| {
                    let bridge = Arc::clone(&bridge);
                    async move { bridge.handle_decision(params).await }
                });
        }
    }

    async fn handle_send(self: &Arc<Self>, params: Value) -> anyhow::Result<Value> {
        let prompt: PromptRequest = serde_json::from_value(params)?;
        debug!("[{}] prompt: {} chars", self.id, prompt.message.len());

        let mut annotations = self.agent.send(prompt).await?;
        let bridge = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(annotation) = annotations.recv().await {
                if let Annotation::TextDelta { text } = &annotation {
                    let _ = bridge
                        .bus
                        .emit_event("textDelta", json!({"text": text}))
                        .await;
                }
                let mut timeline = bridge.timeline.lock().await;
                let merged = merge(std::mem::take(&mut *timeline), &[annotation]);
                *timeline = merged;
            }

            // Stream end: freeze any open delta and publish the result.
            let snapshot = {
                let mut timeline = bridge.timeline.lock().await;
                let done = finalize(std::mem::take(&mut *timeline));
                *timeline = done;
                timeline.clone()
            };
            match serde_json::to_value(&snapshot) {
                Ok(entries) => {
                    let _ = bridge
                        .bus
                        .emit_event("timeline", json!({"entries": entries}))
                        .await;
                }
                Err(e) => warn!("[{}] timeline serialization failed: {e}", bridge.id),
            }
        });

        Ok(json!({"accepted": true}))
    }

    async fn handle_tool_run(&self, params: Value) -> anyhow::Result<Value> {
        let params: ToolRunParams = serde_json::from_value(params)?;
        let timeout = params
            .timeout_ms
            .map_or(DEFAULT_TOOL_TIMEOUT, Duration::from_millis);
        let ctx = ExecContext::with_timeout(timeout);

        let outcome = self.tools.run(&params.tool, params.params, &ctx).await?;
        Ok(serde_json::to_value(outcome)?)
    }

    async fn handle_decision(&self, params: Value) -> anyhow::Result<Value> {
        let params: DecisionParams = serde_json::from_value(params)?;

        // A retry replays the retained decision; announce what was actually
        // sent, not what this request happened to carry.
        let (call_id, approved) = if params.retry {
            let decision = self.gate.retry_submit().await?;
            (Some(decision.call_id), decision.approved)
        } else {
            self.gate
                .approve_tool_use(params.approved, params.option)
                .await?;
            (params.call_id, params.approved)
        };

        // The decision reached the agent; confirm and free the gate.
        let call_id = match call_id {
            Some(id) => Some(id),
            None => self.gate.current().await.map(|c| c.call_id),
        };
        if let Some(call_id) = call_id {
            self.gate.on_result(&call_id).await;
            let _ = self
                .bus
                .emit_event(
                    "approvalResult",
                    json!({"callId": call_id, "approved": approved}),
                )
                .await;
        }
        Ok(json!({"ok": true}))
    }

    /// Ask the client to approve a tool call the agent wants to make.
    /// Surfaces the derived edit preview for file-mutating tools.
    pub async fn request_tool_approval(
        &self,
        tool_name: &str,
        call_id: &str,
        args: Value,
    ) -> anyhow::Result<()> {
        let pending = self
            .gate
            .handle_approval_request(tool_name, call_id, args)
            .await?;
        self.bus
            .emit_event(
                "toolApprovalRequest",
                json!({
                    "callId": pending.call_id,
                    "toolName": pending.tool_name,
                    "args": pending.args,
                    "editPayload": pending.edit_payload,
                }),
            )
            .await?;
        Ok(())
    }

    /// Tear the session down. Safe to call twice; the second call is a
    /// no-op.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("[{}] session closed", self.id);
        self.agent.abort().await;
        self.gate.clear_current_approval().await;
        self.edits.clear();
        self.bus.shutdown();
        // The connection itself goes down with the session.
        self.transport.close().await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
