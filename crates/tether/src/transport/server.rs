//! Server-role transport wrapping an already-accepted connection.

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;

use tether_protocol::Message;

use super::{
    ConnectionState, Transport, TransportError, TransportEvent, EVENT_BUFFER_SIZE,
    WRITER_QUEUE_SIZE,
};

struct Inner {
    state_tx: watch::Sender<ConnectionState>,
    events: broadcast::Sender<TransportEvent>,
    writer: Mutex<Option<mpsc::Sender<String>>>,
    shutdown: CancellationToken,
}

/// Passively-accepted transport: no reconnect. On remote hangup it
/// transitions to `Closed` and emits a `Closed` event; sends after that
/// fail immediately.
pub struct AcceptedTransport {
    inner: Arc<Inner>,
}

impl AcceptedTransport {
    /// Wrap an open duplex stream (a freshly accepted TCP connection, or an
    /// in-memory duplex in tests).
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (state_tx, _) = watch::channel(ConnectionState::Connected);
        let (events, _) = broadcast::channel(EVENT_BUFFER_SIZE);
        let (tx, mut rx) = mpsc::channel::<String>(WRITER_QUEUE_SIZE);

        let inner = Arc::new(Inner {
            state_tx,
            events,
            writer: Mutex::new(Some(tx)),
            shutdown: CancellationToken::new(),
        });

        let (read_half, mut write_half) = tokio::io::split(stream);

        tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                if write_half.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
            }
            let _ = write_half.shutdown().await;
        });

        let reader_inner = Arc::clone(&inner);
        tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            loop {
                let next = tokio::select! {
                    _ = reader_inner.shutdown.cancelled() => break,
                    line = lines.next_line() => line,
                };
                match next {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match Message::from_line(&line) {
                            Ok(message) => {
                                let _ = reader_inner
                                    .events
                                    .send(TransportEvent::Message(message));
                            }
                            Err(e) => {
                                warn!("malformed frame from client: {e}");
                                let _ = reader_inner
                                    .events
                                    .send(TransportEvent::Error(format!("malformed frame: {e}")));
                            }
                        }
                    }
                    Ok(None) => {
                        debug!("client disconnected");
                        break;
                    }
                    Err(e) => {
                        warn!("read error from client: {e}");
                        let _ = reader_inner
                            .events
                            .send(TransportEvent::Error(format!("read error: {e}")));
                        break;
                    }
                }
            }

            reader_inner.writer.lock().await.take();
            reader_inner.state_tx.send_replace(ConnectionState::Closed);
            let _ = reader_inner.events.send(TransportEvent::Closed);
        });

        Self { inner }
    }

    /// Watch connection state transitions.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }
}

#[async_trait]
impl Transport for AcceptedTransport {
    async fn send(&self, message: Message) -> Result<(), TransportError> {
        let writer = self.inner.writer.lock().await;
        match writer.as_ref() {
            Some(tx) => {
                let line = message.to_line()?;
                tx.send(line)
                    .await
                    .map_err(|_| TransportError::Send("connection writer gone".into()))
            }
            None => Err(TransportError::Closed),
        }
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.inner.events.subscribe()
    }

    fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    async fn close(&self) {
        if self.inner.state_tx.borrow().is_terminal() {
            return;
        }
        self.inner.shutdown.cancel();
        self.inner.writer.lock().await.take();
        self.inner.state_tx.send_replace(ConnectionState::Closed);
        let _ = self.inner.events.send(TransportEvent::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::transport::duplex_pair as pair;

    #[tokio::test]
    async fn test_messages_arrive_in_send_order() {
        let (left, right) = pair();
        let mut events = right.events();

        for i in 0..10 {
            left.send(Message::event("tick", json!({ "n": i })))
                .await
                .unwrap();
        }

        for i in 0..10 {
            loop {
                match events.recv().await.unwrap() {
                    TransportEvent::Message(Message::Event { data, .. }) => {
                        assert_eq!(data["n"], i as u64);
                        break;
                    }
                    TransportEvent::Message(other) => panic!("unexpected frame: {other:?}"),
                    _ => continue,
                }
            }
        }
    }

    #[tokio::test]
    async fn test_remote_hangup_closes() {
        let (left, right) = pair();
        let mut events = right.events();

        left.close().await;

        loop {
            match events.recv().await {
                Ok(TransportEvent::Closed) | Err(_) => break,
                _ => continue,
            }
        }
        assert_eq!(right.state(), ConnectionState::Closed);

        let err = right
            .send(Message::event("x", json!(null)))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Closed | TransportError::Send(_)));
    }

    #[tokio::test]
    async fn test_malformed_frame_is_error_not_fatal() {
        let (raw_a, b) = tokio::io::duplex(1024);
        let right = AcceptedTransport::new(b);
        let mut events = right.events();

        let (_, mut write_half) = tokio::io::split(raw_a);
        write_half.write_all(b"this is not json\n").await.unwrap();
        write_half
            .write_all(Message::event("ok", json!(1)).to_line().unwrap().as_bytes())
            .await
            .unwrap();

        // First the protocol error, then the valid frame still flows.
        let mut saw_error = false;
        loop {
            match events.recv().await.unwrap() {
                TransportEvent::Error(e) => {
                    assert!(e.contains("malformed"));
                    saw_error = true;
                }
                TransportEvent::Message(Message::Event { event, .. }) => {
                    assert_eq!(event, "ok");
                    break;
                }
                _ => continue,
            }
        }
        assert!(saw_error);
    }
}
