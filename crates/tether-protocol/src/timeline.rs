//! Streaming timeline merge engine.
//!
//! An agent turn arrives as an ordered stream of low-level annotations:
//! text deltas, terminal text, tool calls/results, reasoning. [`merge`]
//! folds a batch of annotations into the compact timeline a client renders.
//!
//! ## Merge rules
//!
//! 1. Consecutive text deltas accumulate into one growing `Text` entry in
//!    the `Delta` state. Any non-delta annotation finalizes it to
//!    `Complete`, freezing the text. Call [`finalize`] at end of stream to
//!    close a trailing delta.
//! 2. Terminal text closes an open delta by overwriting it in place;
//!    otherwise it appends a new complete entry.
//! 3. A tool call always appends a new entry at step 0.
//! 4. A tool result upgrades the nearest unmatched call with the same id
//!    (backward scan) to step 1. An orphan result — e.g. a replayed stream
//!    that skipped the call — is synthesized as a standalone result entry,
//!    never dropped.
//! 5. Reasoning passes through one entry per annotation, never merged.
//! 6. Unrecognized annotations are appended unchanged with a warning.
//!
//! The fold is pure and order-preserving: the same annotation sequence
//! always produces the same timeline.

use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Annotations (input)
// ============================================================================

/// One low-level protocol annotation from the agent stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Annotation {
    /// Incremental text fragment.
    TextDelta { text: String },

    /// Terminal (non-incremental) text for the current message.
    Text { text: String },

    /// Tool invocation with its arguments.
    ToolCall {
        tool_call_id: String,
        tool_name: String,
        args: Value,
    },

    /// Result for a previously announced tool call.
    ToolResult {
        tool_call_id: String,
        result: Value,
    },

    /// Reasoning fragment. Never merged with neighbors.
    Reasoning { text: String },

    /// Forward-compatibility escape hatch for annotation kinds this build
    /// does not know about. The wire field is renamed because `kind` is
    /// taken by the enum tag.
    Unknown {
        #[serde(rename = "original_kind")]
        kind: String,
        data: Value,
    },
}

impl Annotation {
    /// Parse an annotation from a raw JSON value, downgrading unrecognized
    /// kinds to [`Annotation::Unknown`] instead of failing.
    pub fn from_value(value: Value) -> Self {
        match serde_json::from_value::<Self>(value.clone()) {
            Ok(ann) => ann,
            Err(_) => {
                let kind = value
                    .get("kind")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string();
                Self::Unknown { kind, data: value }
            }
        }
    }
}

// ============================================================================
// Timeline entries (output)
// ============================================================================

/// Lifecycle state of a text entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryState {
    /// Still accumulating deltas.
    Delta,
    /// Frozen; no further text will be appended.
    Complete,
}

/// Lifecycle state of a tool entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStep {
    /// Call announced, result pending (step 0).
    Call,
    /// Result attached (step 1).
    Result,
}

impl ToolStep {
    /// Numeric step used by clients for progress rendering.
    pub fn step(self) -> u8 {
        match self {
            Self::Call => 0,
            Self::Result => 1,
        }
    }
}

/// One entry in the merged, client-facing timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entry", rename_all = "snake_case")]
pub enum TimelineEntry {
    Text {
        text: String,
        state: EntryState,
    },

    Tool {
        tool_call_id: String,
        tool_name: String,
        state: ToolStep,
        step: u8,
        args: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
    },

    Reasoning {
        text: String,
    },

    Unknown {
        kind: String,
        data: Value,
    },
}

// ============================================================================
// Merge
// ============================================================================

/// Tool name carried by a synthesized orphan-result entry, whose real name
/// never reached this side of the stream.
pub const ORPHAN_TOOL_NAME: &str = "unknown";

/// Fold a batch of annotations into the timeline.
///
/// Consumes and returns the timeline so callers can keep it in a fold.
/// A trailing text delta is left open so the next batch can continue it;
/// call [`finalize`] when the stream ends.
pub fn merge(mut timeline: Vec<TimelineEntry>, annotations: &[Annotation]) -> Vec<TimelineEntry> {
    for ann in annotations {
        match ann {
            Annotation::TextDelta { text } => {
                if let Some(TimelineEntry::Text {
                    text: existing,
                    state: EntryState::Delta,
                }) = timeline.last_mut()
                {
                    existing.push_str(text);
                } else {
                    timeline.push(TimelineEntry::Text {
                        text: text.clone(),
                        state: EntryState::Delta,
                    });
                }
            }

            Annotation::Text { text } => {
                // Terminal text owns the open delta entry: the delta was a
                // streamed preview of this same message.
                if let Some(TimelineEntry::Text {
                    text: existing,
                    state,
                }) = timeline.last_mut()
                    && *state == EntryState::Delta
                {
                    *existing = text.clone();
                    *state = EntryState::Complete;
                } else {
                    timeline.push(TimelineEntry::Text {
                        text: text.clone(),
                        state: EntryState::Complete,
                    });
                }
            }

            Annotation::ToolCall {
                tool_call_id,
                tool_name,
                args,
            } => {
                close_open_delta(&mut timeline);
                timeline.push(TimelineEntry::Tool {
                    tool_call_id: tool_call_id.clone(),
                    tool_name: tool_name.clone(),
                    state: ToolStep::Call,
                    step: ToolStep::Call.step(),
                    args: args.clone(),
                    result: None,
                });
            }

            Annotation::ToolResult {
                tool_call_id,
                result,
            } => {
                close_open_delta(&mut timeline);
                attach_tool_result(&mut timeline, tool_call_id, result);
            }

            Annotation::Reasoning { text } => {
                close_open_delta(&mut timeline);
                timeline.push(TimelineEntry::Reasoning { text: text.clone() });
            }

            Annotation::Unknown { kind, data } => {
                close_open_delta(&mut timeline);
                warn!("passing through unrecognized annotation kind '{kind}'");
                timeline.push(TimelineEntry::Unknown {
                    kind: kind.clone(),
                    data: data.clone(),
                });
            }
        }
    }

    timeline
}

/// Close a trailing open delta entry. Call when the annotation stream ends.
pub fn finalize(mut timeline: Vec<TimelineEntry>) -> Vec<TimelineEntry> {
    close_open_delta(&mut timeline);
    timeline
}

fn close_open_delta(timeline: &mut [TimelineEntry]) {
    if let Some(TimelineEntry::Text { state, .. }) = timeline.last_mut()
        && *state == EntryState::Delta
    {
        *state = EntryState::Complete;
    }
}

/// Upgrade the nearest unmatched call with this id, or synthesize a
/// standalone result entry when the call is missing from the timeline.
fn attach_tool_result(timeline: &mut Vec<TimelineEntry>, tool_call_id: &str, result: &Value) {
    for entry in timeline.iter_mut().rev() {
        if let TimelineEntry::Tool {
            tool_call_id: id,
            state,
            step,
            result: slot,
            ..
        } = entry
            && id == tool_call_id
            && *state == ToolStep::Call
        {
            *state = ToolStep::Result;
            *step = ToolStep::Result.step();
            *slot = Some(result.clone());
            return;
        }
    }

    warn!("tool result for '{tool_call_id}' has no matching call; synthesizing entry");
    timeline.push(TimelineEntry::Tool {
        tool_call_id: tool_call_id.to_string(),
        tool_name: ORPHAN_TOOL_NAME.to_string(),
        state: ToolStep::Result,
        step: ToolStep::Result.step(),
        args: Value::Null,
        result: Some(result.clone()),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn delta(s: &str) -> Annotation {
        Annotation::TextDelta { text: s.into() }
    }

    fn call(id: &str, name: &str, args: Value) -> Annotation {
        Annotation::ToolCall {
            tool_call_id: id.into(),
            tool_name: name.into(),
            args,
        }
    }

    fn result(id: &str, value: Value) -> Annotation {
        Annotation::ToolResult {
            tool_call_id: id.into(),
            result: value,
        }
    }

    #[test]
    fn test_deltas_accumulate_then_tool_finalizes() {
        let timeline = merge(
            Vec::new(),
            &[
                delta("a"),
                delta("b"),
                call("t1", "grep", json!({"p": "x"})),
                result("t1", json!({"files": []})),
            ],
        );

        assert_eq!(timeline.len(), 2);
        assert_eq!(
            timeline[0],
            TimelineEntry::Text {
                text: "ab".into(),
                state: EntryState::Complete,
            }
        );
        match &timeline[1] {
            TimelineEntry::Tool {
                tool_call_id,
                state,
                step,
                args,
                result,
                ..
            } => {
                assert_eq!(tool_call_id, "t1");
                assert_eq!(*state, ToolStep::Result);
                assert_eq!(*step, 1);
                assert_eq!(args, &json!({"p": "x"}));
                assert_eq!(result, &Some(json!({"files": []})));
            }
            other => panic!("expected tool entry, got {other:?}"),
        }
    }

    #[test]
    fn test_delta_stays_open_across_batches() {
        let timeline = merge(Vec::new(), &[delta("he")]);
        let timeline = merge(timeline, &[delta("llo")]);

        assert_eq!(
            timeline,
            vec![TimelineEntry::Text {
                text: "hello".into(),
                state: EntryState::Delta,
            }]
        );

        let timeline = finalize(timeline);
        assert_eq!(
            timeline,
            vec![TimelineEntry::Text {
                text: "hello".into(),
                state: EntryState::Complete,
            }]
        );
    }

    #[test]
    fn test_terminal_text_overwrites_open_delta() {
        let timeline = merge(
            Vec::new(),
            &[
                delta("par"),
                delta("tial"),
                Annotation::Text {
                    text: "full message".into(),
                },
            ],
        );

        assert_eq!(
            timeline,
            vec![TimelineEntry::Text {
                text: "full message".into(),
                state: EntryState::Complete,
            }]
        );
    }

    #[test]
    fn test_terminal_text_appends_when_no_delta_open() {
        let timeline = merge(
            Vec::new(),
            &[
                Annotation::Text { text: "one".into() },
                Annotation::Text { text: "two".into() },
            ],
        );
        assert_eq!(timeline.len(), 2);
    }

    #[test]
    fn test_orphan_result_is_synthesized_not_dropped() {
        let timeline = merge(Vec::new(), &[result("ghost", json!({"ok": true}))]);

        assert_eq!(timeline.len(), 1);
        match &timeline[0] {
            TimelineEntry::Tool {
                tool_call_id,
                tool_name,
                state,
                result,
                ..
            } => {
                assert_eq!(tool_call_id, "ghost");
                assert_eq!(tool_name, ORPHAN_TOOL_NAME);
                assert_eq!(*state, ToolStep::Result);
                assert_eq!(result, &Some(json!({"ok": true})));
            }
            other => panic!("expected synthesized tool entry, got {other:?}"),
        }
    }

    #[test]
    fn test_result_matches_nearest_unmatched_call() {
        let timeline = merge(
            Vec::new(),
            &[
                call("t1", "read", json!({"path": "a"})),
                call("t1", "read", json!({"path": "b"})),
                result("t1", json!("second")),
            ],
        );

        // The later call wins; the earlier one stays pending.
        match (&timeline[0], &timeline[1]) {
            (
                TimelineEntry::Tool {
                    state: ToolStep::Call,
                    result: None,
                    ..
                },
                TimelineEntry::Tool {
                    state: ToolStep::Result,
                    result: Some(r),
                    ..
                },
            ) => assert_eq!(r, &json!("second")),
            other => panic!("unexpected pairing: {other:?}"),
        }
    }

    #[test]
    fn test_reasoning_never_merges() {
        let timeline = merge(
            Vec::new(),
            &[
                Annotation::Reasoning { text: "a".into() },
                Annotation::Reasoning { text: "b".into() },
            ],
        );
        assert_eq!(timeline.len(), 2);
    }

    #[test]
    fn test_unknown_annotation_serde_roundtrip() {
        let ann = Annotation::Unknown {
            kind: "citation".into(),
            data: json!({"url": "x"}),
        };
        let encoded = serde_json::to_value(&ann).unwrap();
        assert_eq!(encoded["kind"], "unknown");
        assert_eq!(encoded["original_kind"], "citation");

        let decoded: Annotation = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, ann);
    }

    #[test]
    fn test_unknown_annotation_passes_through() {
        let ann = Annotation::from_value(json!({"kind": "citation", "url": "x"}));
        assert!(matches!(&ann, Annotation::Unknown { kind, .. } if kind == "citation"));

        let timeline = merge(Vec::new(), &[ann]);
        assert_eq!(timeline.len(), 1);
        assert!(matches!(&timeline[0], TimelineEntry::Unknown { kind, .. } if kind == "citation"));
    }

    #[test]
    fn test_merge_is_deterministic() {
        let anns = vec![
            delta("x"),
            call("t1", "ls", json!({})),
            result("t1", json!([])),
            Annotation::Reasoning { text: "r".into() },
        ];
        let a = merge(Vec::new(), &anns);
        let b = merge(Vec::new(), &anns);
        assert_eq!(a, b);
    }
}
