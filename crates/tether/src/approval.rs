//! Human-in-the-loop gate for side-effecting tool calls.
//!
//! One gate per session. The gate holds at most one approval at a time and
//! moves through `Idle -> Pending -> Submitting -> (Idle | Error)`. A second
//! request while one is pending is rejected, not queued. For file-mutating
//! tools the gate derives an [`EditPayload`] so the client can preview the
//! change; an approved one-off edit lands in the session's [`FileEditStore`]
//! before the decision goes out, so local reads observe the write without
//! waiting for the backend to confirm.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::bus::MessageBus;

/// Where decided approvals go. The gate does not care whether the decider
/// sits across a wire (a bus peer) or in-process (an agent handle).
#[async_trait]
pub trait DecisionSink: Send + Sync {
    async fn submit(
        &self,
        call_id: &str,
        approved: bool,
        option: ApprovalOption,
    ) -> anyhow::Result<()>;
}

/// Submits decisions as `approval.decision` requests over a bus.
pub struct BusDecisionSink {
    bus: Arc<MessageBus>,
}

impl BusDecisionSink {
    pub fn new(bus: Arc<MessageBus>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl DecisionSink for BusDecisionSink {
    async fn submit(
        &self,
        call_id: &str,
        approved: bool,
        option: ApprovalOption,
    ) -> anyhow::Result<()> {
        self.bus
            .request(
                "approval.decision",
                json!({
                    "callId": call_id,
                    "approved": approved,
                    "option": option,
                }),
            )
            .await?;
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("an approval for '{tool_name}' (call {call_id}) is already pending")]
    AlreadyPending { tool_name: String, call_id: String },

    #[error("no approval is pending")]
    NothingPending,

    #[error("no failed submission to retry")]
    NothingToRetry,

    #[error("failed to submit decision: {0}")]
    Submit(String),
}

/// How broadly an approval applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalOption {
    /// This one call only.
    Once,
    /// Everything from this session.
    Always,
    /// Every future call of this tool.
    AlwaysTool,
}

/// Gate lifecycle. Transitions happen in place on one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalPhase {
    Idle,
    Pending,
    Submitting,
    /// Submission failed; the decision is retained for [`ApprovalGate::retry_submit`].
    Error,
}

/// Preview of a file mutation derived from an edit/write tool's arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditPayload {
    pub path: String,
    pub old_string: String,
    pub new_string: String,
}

impl EditPayload {
    /// Derive a payload from a tool call's arguments. Only file-mutating
    /// tools produce one; anything else approves without a preview.
    pub fn from_args(tool_name: &str, args: &Value) -> Option<Self> {
        let path = args
            .get("path")
            .or_else(|| args.get("file_path"))?
            .as_str()?
            .to_string();

        match tool_name {
            "edit_file" | "edit" => Some(Self {
                path,
                old_string: args.get("old_string")?.as_str()?.to_string(),
                new_string: args.get("new_string")?.as_str()?.to_string(),
            }),
            // A write replaces the whole file.
            "write_file" | "write" => Some(Self {
                path,
                old_string: String::new(),
                new_string: args.get("content")?.as_str()?.to_string(),
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditStatus {
    Accepted,
    Rejected,
}

/// One recorded mutation against a path.
#[derive(Debug, Clone, Serialize)]
pub struct FileEdit {
    pub tool_call_id: String,
    pub old_string: String,
    pub new_string: String,
    pub status: Option<EditStatus>,
}

/// Per-session record of file mutations, keyed by path. Edits against the
/// same path apply in arrival order. Owned by exactly one session.
#[derive(Default)]
pub struct FileEditStore {
    edits: StdMutex<HashMap<String, Vec<FileEdit>>>,
}

impl FileEditStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an edit with the given status.
    pub fn record(&self, call_id: &str, payload: &EditPayload, status: EditStatus) {
        let mut edits = self.edits.lock().expect("edit store lock poisoned");
        edits.entry(payload.path.clone()).or_default().push(FileEdit {
            tool_call_id: call_id.to_string(),
            old_string: payload.old_string.clone(),
            new_string: payload.new_string.clone(),
            status: Some(status),
        });
    }

    /// Apply every accepted edit for `path` to `base`, in arrival order.
    /// An edit with an empty `old_string` replaces the whole content.
    pub fn local_view(&self, path: &str, base: &str) -> String {
        let edits = self.edits.lock().expect("edit store lock poisoned");
        let mut text = base.to_string();
        if let Some(list) = edits.get(path) {
            for edit in list {
                if edit.status != Some(EditStatus::Accepted) {
                    continue;
                }
                if edit.old_string.is_empty() {
                    text = edit.new_string.clone();
                } else {
                    text = text.replacen(&edit.old_string, &edit.new_string, 1);
                }
            }
        }
        text
    }

    /// All recorded edits for `path`, most recent last.
    pub fn edits_for(&self, path: &str) -> Vec<FileEdit> {
        self.edits
            .lock()
            .expect("edit store lock poisoned")
            .get(path)
            .cloned()
            .unwrap_or_default()
    }

    pub fn clear(&self) {
        self.edits.lock().expect("edit store lock poisoned").clear();
    }
}

/// The approval request currently occupying the gate.
#[derive(Debug, Clone)]
pub struct PendingApproval {
    pub call_id: String,
    pub tool_name: String,
    pub args: Value,
    pub edit_payload: Option<EditPayload>,
}

/// A decided approval, retained across a failed submission so
/// [`ApprovalGate::retry_submit`] can replay it unchanged.
#[derive(Debug, Clone)]
pub struct Decision {
    pub call_id: String,
    pub approved: bool,
    pub option: ApprovalOption,
}

struct GateState {
    phase: ApprovalPhase,
    current: Option<PendingApproval>,
    retained: Option<Decision>,
}

/// Single-occupancy approval state machine for one session.
pub struct ApprovalGate {
    sink: Arc<dyn DecisionSink>,
    edits: Arc<FileEditStore>,
    state: Mutex<GateState>,
}

impl ApprovalGate {
    pub fn new(sink: Arc<dyn DecisionSink>, edits: Arc<FileEditStore>) -> Self {
        Self {
            sink,
            edits,
            state: Mutex::new(GateState {
                phase: ApprovalPhase::Idle,
                current: None,
                retained: None,
            }),
        }
    }

    pub async fn phase(&self) -> ApprovalPhase {
        self.state.lock().await.phase
    }

    pub async fn current(&self) -> Option<PendingApproval> {
        self.state.lock().await.current.clone()
    }

    /// Admit a new approval request. Rejects if one is already occupying the
    /// gate. Returns the pending record (with any derived edit preview) for
    /// the caller to surface to the client.
    pub async fn handle_approval_request(
        &self,
        tool_name: &str,
        call_id: &str,
        args: Value,
    ) -> Result<PendingApproval, ApprovalError> {
        let mut state = self.state.lock().await;
        if let Some(current) = &state.current {
            warn!(
                "approval request for '{tool_name}' rejected; '{}' still {:?}",
                current.tool_name, state.phase
            );
            return Err(ApprovalError::AlreadyPending {
                tool_name: current.tool_name.clone(),
                call_id: current.call_id.clone(),
            });
        }

        let pending = PendingApproval {
            call_id: call_id.to_string(),
            tool_name: tool_name.to_string(),
            edit_payload: EditPayload::from_args(tool_name, &args),
            args,
        };
        debug!("approval pending for '{tool_name}' (call {call_id})");
        state.phase = ApprovalPhase::Pending;
        state.current = Some(pending.clone());
        state.retained = None;
        Ok(pending)
    }

    /// Decide the pending approval. An accepted `once` decision on a
    /// file-mutating tool records the edit locally before the decision is
    /// submitted. Submission failure keeps the call id and decision for
    /// [`ApprovalGate::retry_submit`].
    pub async fn approve_tool_use(
        &self,
        approved: bool,
        option: ApprovalOption,
    ) -> Result<(), ApprovalError> {
        let decision = {
            let mut state = self.state.lock().await;
            if state.phase != ApprovalPhase::Pending {
                return Err(ApprovalError::NothingPending);
            }
            let current = state.current.as_ref().ok_or(ApprovalError::NothingPending)?;

            if let Some(payload) = &current.edit_payload {
                let status = if approved {
                    EditStatus::Accepted
                } else {
                    EditStatus::Rejected
                };
                // Local state reflects the decision before the backend does.
                if (approved && option == ApprovalOption::Once) || !approved {
                    self.edits.record(&current.call_id, payload, status);
                }
            }

            let decision = Decision {
                call_id: current.call_id.clone(),
                approved,
                option,
            };
            state.phase = ApprovalPhase::Submitting;
            state.retained = Some(decision.clone());
            decision
        };

        self.submit(decision).await
    }

    /// Replay the exact decision that failed to submit. Returns the
    /// replayed decision so the caller can report what was actually sent.
    pub async fn retry_submit(&self) -> Result<Decision, ApprovalError> {
        let decision = {
            let mut state = self.state.lock().await;
            if state.phase != ApprovalPhase::Error {
                return Err(ApprovalError::NothingToRetry);
            }
            let decision = state.retained.clone().ok_or(ApprovalError::NothingToRetry)?;
            state.phase = ApprovalPhase::Submitting;
            decision
        };

        self.submit(decision.clone()).await?;
        Ok(decision)
    }

    /// Hard reset to `Idle`, dropping the current approval and any retained
    /// decision regardless of an in-flight submission.
    pub async fn clear_current_approval(&self) {
        let mut state = self.state.lock().await;
        state.phase = ApprovalPhase::Idle;
        state.current = None;
        state.retained = None;
    }

    /// A matching result event arrived: the backend acted on the decision,
    /// the gate frees up.
    pub async fn on_result(&self, call_id: &str) {
        let mut state = self.state.lock().await;
        let matches = state
            .current
            .as_ref()
            .is_some_and(|c| c.call_id == call_id);
        if state.phase == ApprovalPhase::Submitting && matches {
            debug!("approval for call {call_id} confirmed");
            state.phase = ApprovalPhase::Idle;
            state.current = None;
            state.retained = None;
        }
    }

    async fn submit(&self, decision: Decision) -> Result<(), ApprovalError> {
        let result = self
            .sink
            .submit(&decision.call_id, decision.approved, decision.option)
            .await;

        let mut state = self.state.lock().await;
        // A clear during the round trip wins; don't resurrect the approval.
        let still_ours = state
            .current
            .as_ref()
            .is_some_and(|c| c.call_id == decision.call_id);

        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                if still_ours && state.phase == ApprovalPhase::Submitting {
                    state.phase = ApprovalPhase::Error;
                }
                Err(ApprovalError::Submit(e.to_string()))
            }
        }
    }
}
