//! Canonical protocol types for Tether agent communication.
//!
//! This crate is pure data + pure algorithms: the wire message envelope
//! exchanged over persistent connections, the streamed annotation types
//! emitted by an agent turn, and the merge engine that folds annotations
//! into a client-facing timeline. No I/O lives here.

pub mod timeline;
pub mod wire;

pub use timeline::{finalize, merge, Annotation, EntryState, TimelineEntry, ToolStep, ORPHAN_TOOL_NAME};
pub use wire::{ErrorBody, Message, new_message_id, now_ms};
