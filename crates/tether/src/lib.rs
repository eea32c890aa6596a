//! Tether — communication core for an AI coding-agent product.
//!
//! Moves structured messages between long-lived agent sessions and remote
//! clients (browser UI, desktop shell), gates side-effecting tool calls
//! behind human approval, and reassembles streamed protocol fragments into
//! a coherent timeline.

pub mod agent;
pub mod approval;
pub mod bus;
pub mod config;
pub mod server;
pub mod tools;
pub mod transport;
