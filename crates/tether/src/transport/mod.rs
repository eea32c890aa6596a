//! Reliable-delivery transports over one raw duplex connection.
//!
//! Two roles:
//! - [`DialTransport`]: actively dials the peer and owns the reconnect loop
//!   (exponential backoff, bounded outbound buffering while disconnected).
//! - [`AcceptedTransport`]: wraps an already-accepted connection on the
//!   server side; no reconnect, it simply closes on remote hangup.
//!
//! Frames are newline-delimited JSON [`Message`]s. Consumers subscribe to a
//! broadcast of [`TransportEvent`]s: decoded messages, transport errors, and
//! connection closure.

mod client;
mod server;

pub use client::{DialOptions, DialTransport};
pub use server::AcceptedTransport;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

use tether_protocol::Message;

/// Size of the transport event broadcast channel.
pub(crate) const EVENT_BUFFER_SIZE: usize = 256;

/// Size of the per-connection writer queue.
pub(crate) const WRITER_QUEUE_SIZE: usize = 64;

/// Connection lifecycle, owned by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
    Closed,
}

impl ConnectionState {
    /// Terminal states: the transport will make no further attempts.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting => write!(f, "reconnecting"),
            Self::Failed => write!(f, "failed"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Events fanned out to transport consumers.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A decoded inbound frame.
    Message(Message),
    /// A non-fatal transport-level error (connect failure, bad frame,
    /// buffer overflow). The transport owns its own recovery.
    Error(String),
    /// The underlying connection closed. A dialing transport may still
    /// reconnect afterwards; check [`Transport::state`].
    Closed,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("send failed: {0}")]
    Send(String),

    #[error("outbound buffer overflow (cap {cap}); buffer cleared")]
    BufferOverflow { cap: usize },

    #[error("transport closed")]
    Closed,

    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
}

/// One reliable duplex message channel.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a frame. While a dialing transport is disconnected the frame is
    /// buffered; an accepted transport fails immediately.
    async fn send(&self, message: Message) -> Result<(), TransportError>;

    /// Subscribe to decoded messages, errors, and closure.
    fn events(&self) -> broadcast::Receiver<TransportEvent>;

    /// Current connection state.
    fn state(&self) -> ConnectionState;

    /// Close the transport. Idempotent.
    async fn close(&self);
}

/// Doubling reconnect backoff with a cap, reset on success.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            current: base,
        }
    }

    /// Delay to wait before the next attempt. Doubles the following delay,
    /// capped at the maximum.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.cap);
        delay
    }

    /// Reset to the base interval after a successful connect.
    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

/// Two connected accepted transports over an in-memory duplex pipe.
/// Test plumbing for bus/bridge/approval tests.
#[cfg(test)]
pub(crate) fn duplex_pair() -> (AcceptedTransport, AcceptedTransport) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    (AcceptedTransport::new(a), AcceptedTransport::new(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_to_cap_and_resets() {
        let mut backoff = Backoff::new(Duration::from_millis(1000), Duration::from_millis(30000));

        let delays: Vec<u64> = (0..5).map(|_| backoff.next_delay().as_millis() as u64).collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000]);

        // Next failures hit the cap.
        assert_eq!(backoff.next_delay().as_millis(), 30000);
        assert_eq!(backoff.next_delay().as_millis(), 30000);

        // One successful connect resets to base.
        backoff.reset();
        assert_eq!(backoff.next_delay().as_millis(), 1000);
    }

    #[test]
    fn test_terminal_states() {
        assert!(ConnectionState::Closed.is_terminal());
        assert!(ConnectionState::Failed.is_terminal());
        assert!(!ConnectionState::Reconnecting.is_terminal());
        assert!(!ConnectionState::Connected.is_terminal());
    }
}
