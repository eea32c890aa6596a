//! Actively-dialing transport with reconnect and outbound buffering.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;

use tether_protocol::Message;

use super::{
    Backoff, ConnectionState, Transport, TransportError, TransportEvent, EVENT_BUFFER_SIZE,
    WRITER_QUEUE_SIZE,
};

/// Reconnect and buffering policy for a dialing transport.
#[derive(Debug, Clone)]
pub struct DialOptions {
    /// Reconnect after a drop. When false the transport ends in
    /// `Disconnected` after the first loss.
    pub reconnect: bool,
    /// Initial backoff interval.
    pub backoff_base: Duration,
    /// Backoff ceiling.
    pub backoff_cap: Duration,
    /// Maximum frames buffered while disconnected. Exceeding the cap clears
    /// the buffer and fails the send: explicit backpressure over unbounded
    /// growth.
    pub buffer_cap: usize,
}

impl Default for DialOptions {
    fn default() -> Self {
        Self {
            reconnect: true,
            backoff_base: Duration::from_millis(1_000),
            backoff_cap: Duration::from_millis(30_000),
            buffer_cap: 1_000,
        }
    }
}

struct Inner {
    addr: String,
    opts: DialOptions,
    state_tx: watch::Sender<ConnectionState>,
    events: broadcast::Sender<TransportEvent>,
    /// Writer queue for the live connection. `None` while disconnected.
    writer: Mutex<Option<mpsc::Sender<String>>>,
    /// FIFO of frames accepted while disconnected. Flushed in original
    /// order on reconnect. Delivery is at-most-once per flush attempt: a
    /// drop mid-flush may lose the unflushed tail.
    buffer: Mutex<VecDeque<Message>>,
    shutdown: CancellationToken,
}

/// Client-role transport: dials the address, owns the reconnect loop.
pub struct DialTransport {
    inner: Arc<Inner>,
}

impl DialTransport {
    /// Start dialing `addr`. Returns immediately; connection progress is
    /// observable via [`DialTransport::state_changes`] and the event stream.
    pub fn connect(addr: impl Into<String>, opts: DialOptions) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_BUFFER_SIZE);

        let inner = Arc::new(Inner {
            addr: addr.into(),
            opts,
            state_tx,
            events,
            writer: Mutex::new(None),
            buffer: Mutex::new(VecDeque::new()),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(run_loop(Arc::clone(&inner)));

        Self { inner }
    }

    /// Watch connection state transitions.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Wait until the transport reports `Connected` (or a terminal state).
    pub async fn wait_connected(&self) -> ConnectionState {
        let mut rx = self.inner.state_tx.subscribe();
        loop {
            let state = *rx.borrow();
            if state == ConnectionState::Connected || state.is_terminal() {
                return state;
            }
            if rx.changed().await.is_err() {
                return *self.inner.state_tx.borrow();
            }
        }
    }

    /// Number of frames currently buffered for the next flush.
    pub fn buffered_len(&self) -> usize {
        // blocking_lock is unavailable inside the runtime; try_lock is fine
        // for a diagnostic counter.
        self.inner.buffer.try_lock().map(|b| b.len()).unwrap_or(0)
    }
}

#[async_trait]
impl Transport for DialTransport {
    async fn send(&self, message: Message) -> Result<(), TransportError> {
        let inner = &self.inner;
        if inner.state_tx.borrow().is_terminal() {
            return Err(TransportError::Closed);
        }

        let writer = inner.writer.lock().await;
        if let Some(tx) = writer.as_ref() {
            let line = message.to_line()?;
            return tx
                .send(line)
                .await
                .map_err(|_| TransportError::Send("connection writer gone".into()));
        }
        drop(writer);

        // Not connected: queue for the reconnect flush.
        let mut buffer = inner.buffer.lock().await;
        if buffer.len() >= inner.opts.buffer_cap {
            buffer.clear();
            let cap = inner.opts.buffer_cap;
            warn!("outbound buffer exceeded cap {cap}; clearing");
            let _ = inner.events.send(TransportEvent::Error(format!(
                "outbound buffer overflow (cap {cap}); buffer cleared"
            )));
            return Err(TransportError::BufferOverflow { cap });
        }
        buffer.push_back(message);
        Ok(())
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
        // send_replace: the state must stick even when nobody is watching.
        self.inner.state_tx.send_replace(ConnectionState::Closed);
        let _ = self.inner.events.send(TransportEvent::Closed);
    }
}

/// Connect/reconnect loop. Runs until close or, with reconnect disabled,
/// the first connection loss.
async fn run_loop(inner: Arc<Inner>) {
    let mut backoff = Backoff::new(inner.opts.backoff_base, inner.opts.backoff_cap);
    let mut first_attempt = true;

    loop {
        if inner.shutdown.is_cancelled() {
            return;
        }

        inner.state_tx.send_replace(if first_attempt {
            ConnectionState::Connecting
        } else {
            ConnectionState::Reconnecting
        });

        let stream = tokio::select! {
            _ = inner.shutdown.cancelled() => return,
            result = TcpStream::connect(&inner.addr) => result,
        };

        match stream {
            Ok(stream) => {
                backoff.reset();
                first_attempt = false;
                info!("connected to {}", inner.addr);
                inner.state_tx.send_replace(ConnectionState::Connected);

                serve_connection(&inner, stream).await;

                inner.state_tx.send_replace(ConnectionState::Disconnected);
                let _ = inner.events.send(TransportEvent::Closed);

                if inner.shutdown.is_cancelled() {
                    inner.state_tx.send_replace(ConnectionState::Closed);
                    return;
                }
                if !inner.opts.reconnect {
                    return;
                }
            }
            Err(e) => {
                debug!("connect to {} failed: {e}", inner.addr);
                let _ = inner
                    .events
                    .send(TransportEvent::Error(format!("connect failed: {e}")));
                if !inner.opts.reconnect {
                    inner.state_tx.send_replace(ConnectionState::Failed);
                    return;
                }
            }
        }

        let delay = backoff.next_delay();
        debug!("reconnecting to {} in {:?}", inner.addr, delay);
        tokio::select! {
            _ = inner.shutdown.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Drive one live connection: flush the buffer, then pump reads until EOF.
async fn serve_connection(inner: &Arc<Inner>, stream: TcpStream) {
    let (read_half, mut write_half) = stream.into_split();
    let (tx, mut rx) = mpsc::channel::<String>(WRITER_QUEUE_SIZE);

    let writer_task = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if write_half.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    // Flush buffered frames in original order before exposing the writer,
    // holding the writer slot so concurrent sends queue behind the flush.
    {
        let mut writer_slot = inner.writer.lock().await;
        let mut buffer = inner.buffer.lock().await;
        let buffered = buffer.len();
        for message in buffer.drain(..) {
            match message.to_line() {
                Ok(line) => {
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!("dropping unencodable buffered frame: {e}"),
            }
        }
        if buffered > 0 {
            debug!("flushed {buffered} buffered frames");
        }
        *writer_slot = Some(tx);
    }

    let mut lines = BufReader::new(read_half).lines();
    loop {
        let next = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            line = lines.next_line() => line,
        };
        match next {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match Message::from_line(&line) {
                    Ok(message) => {
                        let _ = inner.events.send(TransportEvent::Message(message));
                    }
                    Err(e) => {
                        warn!("malformed frame from {}: {e}", inner.addr);
                        let _ = inner
                            .events
                            .send(TransportEvent::Error(format!("malformed frame: {e}")));
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("read error from {}: {e}", inner.addr);
                let _ = inner
                    .events
                    .send(TransportEvent::Error(format!("read error: {e}")));
                break;
            }
        }
    }

    inner.writer.lock().await.take();
    writer_task.abort();
}
