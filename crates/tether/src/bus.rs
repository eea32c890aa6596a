//! Message bus: request/response correlation and named event fan-out.
//!
//! One bus sits on top of one [`Transport`]. Outbound requests are
//! registered in a pending map keyed by id and resolved by the matching
//! inbound response, a timeout, a send failure, or a bulk cancel — exactly
//! one of those, exactly once. Inbound requests dispatch to registered
//! method handlers; a handler error becomes a `Response.error` and never
//! crosses back through the bus. Inbound events fan out to every handler
//! registered for that name, in registration order; events nobody listens
//! for are dropped silently.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use log::{debug, warn};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;

use tether_protocol::{new_message_id, now_ms, Message};

use crate::transport::{Transport, TransportError, TransportEvent};

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(30_000);

#[derive(Debug, Error)]
pub enum BusError {
    #[error("request '{method}' timed out after {timeout_ms} ms")]
    Timeout { method: String, timeout_ms: u64 },

    #[error("request cancelled")]
    Cancelled,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("remote error: {0}")]
    Remote(String),
}

/// Async handler for one inbound request method.
pub type RequestHandler =
    Arc<dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// Handler for one named inbound event.
pub type EventHandler = Arc<dyn Fn(&Value) + Send + Sync>;

struct PendingRequest {
    method: String,
    resolve: oneshot::Sender<Result<Value, BusError>>,
}

/// Correlating message bus over one transport.
pub struct MessageBus {
    transport: Arc<dyn Transport>,
    default_timeout: Duration,
    pending: DashMap<String, PendingRequest>,
    request_handlers: RwLock<HashMap<String, RequestHandler>>,
    event_handlers: RwLock<HashMap<String, Vec<EventHandler>>>,
    shutdown: CancellationToken,
}

impl MessageBus {
    /// Create a bus over the transport and start its dispatch loop.
    pub fn new(transport: Arc<dyn Transport>, default_timeout: Duration) -> Arc<Self> {
        // Subscribe before spawning so no frame that arrives between
        // construction and the loop's first poll is lost.
        let events = transport.events();
        let bus = Arc::new(Self {
            transport,
            default_timeout,
            pending: DashMap::new(),
            request_handlers: RwLock::new(HashMap::new()),
            event_handlers: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(dispatch_loop(Arc::clone(&bus), events));
        bus
    }

    /// Send a request and await its response within the default timeout.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, BusError> {
        self.request_with_timeout(method, params, self.default_timeout)
            .await
    }

    /// Send a request and await its response within `timeout`.
    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, BusError> {
        let id = new_message_id();
        let (resolve, response) = oneshot::channel();

        self.pending.insert(
            id.clone(),
            PendingRequest {
                method: method.to_string(),
                resolve,
            },
        );

        let frame = Message::Request {
            id: id.clone(),
            method: method.to_string(),
            params,
            timestamp: now_ms(),
        };

        // A send failure settles the request immediately; the timer never
        // comes into play.
        if let Err(e) = self.transport.send(frame).await {
            self.pending.remove(&id);
            return Err(BusError::Transport(e));
        }

        match tokio::time::timeout(timeout, response).await {
            Ok(Ok(result)) => result,
            // Resolver dropped without answering: bulk-cancelled.
            Ok(Err(_)) => Err(BusError::Cancelled),
            Err(_) => {
                self.pending.remove(&id);
                Err(BusError::Timeout {
                    method: method.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Register the handler for an inbound request method. Replaces any
    /// previous handler for the same method.
    pub fn register_handler<F, Fut>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let handler: RequestHandler = Arc::new(move |params| Box::pin(handler(params)));
        self.request_handlers
            .write()
            .expect("request handler lock poisoned")
            .insert(method.into(), handler);
    }

    /// Register an additional handler for a named inbound event. Handlers
    /// run in registration order; one handler cannot stop the others.
    pub fn on_event<F>(&self, event: impl Into<String>, handler: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.event_handlers
            .write()
            .expect("event handler lock poisoned")
            .entry(event.into())
            .or_default()
            .push(Arc::new(handler));
    }

    /// Emit a named event to the peer.
    pub async fn emit_event(&self, event: &str, data: Value) -> Result<(), BusError> {
        self.transport
            .send(Message::event(event, data))
            .await
            .map_err(BusError::Transport)
    }

    /// Bulk-reject every outstanding request with [`BusError::Cancelled`].
    /// Each pending entry settles exactly once; the pending set ends empty.
    pub fn cancel_pending_requests(&self) {
        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, entry)) = self.pending.remove(&id) {
                debug!("cancelling pending request '{}' ({id})", entry.method);
                let _ = entry.resolve.send(Err(BusError::Cancelled));
            }
        }
    }

    /// Number of requests currently awaiting a response. Diagnostics only.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Stop the dispatch loop and fail everything outstanding.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.cancel_pending_requests();
    }

    fn resolve_response(&self, id: &str, result: Option<Value>, error: Option<String>) {
        match self.pending.remove(id) {
            Some((_, entry)) => {
                let outcome = match error {
                    Some(message) => Err(BusError::Remote(message)),
                    None => Ok(result.unwrap_or(Value::Null)),
                };
                let _ = entry.resolve.send(outcome);
            }
            // Late or duplicate response: the entry was already settled.
            None => debug!("dropping response for unknown request id {id}"),
        }
    }

    fn dispatch_inbound(self: &Arc<Self>, message: Message) {
        match message {
            Message::Request {
                id, method, params, ..
            } => {
                let handler = self
                    .request_handlers
                    .read()
                    .expect("request handler lock poisoned")
                    .get(&method)
                    .cloned();

                match handler {
                    Some(handler) => {
                        let bus = Arc::clone(self);
                        tokio::spawn(async move {
                            let response = match handler(params).await {
                                Ok(result) => Message::ok_response(&id, result),
                                Err(e) => {
                                    // Handler failure is the caller's error,
                                    // never the bus's.
                                    debug!("handler for '{method}' failed: {e:#}");
                                    Message::err_response(&id, e.to_string())
                                }
                            };
                            if let Err(e) = bus.transport.send(response).await {
                                warn!("failed to send response for '{method}': {e}");
                            }
                        });
                    }
                    None => {
                        warn!("no handler registered for method '{method}'");
                        let bus = Arc::clone(self);
                        tokio::spawn(async move {
                            let response =
                                Message::err_response(&id, format!("unknown method '{method}'"));
                            let _ = bus.transport.send(response).await;
                        });
                    }
                }
            }

            Message::Response {
                id, result, error, ..
            } => {
                self.resolve_response(&id, result, error.map(|e| e.message));
            }

            Message::Event { event, data, .. } => {
                let handlers = self
                    .event_handlers
                    .read()
                    .expect("event handler lock poisoned")
                    .get(&event)
                    .cloned()
                    .unwrap_or_default();
                // No handlers is fine: unsubscribed events are dropped. A
                // panicking handler must not take down the others or the
                // dispatch loop.
                for handler in handlers {
                    let call = std::panic::AssertUnwindSafe(|| handler(&data));
                    if std::panic::catch_unwind(call).is_err() {
                        warn!("event handler for '{event}' panicked");
                    }
                }
            }
        }
    }
}

/// Pump transport events into the bus until the transport terminates.
async fn dispatch_loop(bus: Arc<MessageBus>, mut events: broadcast::Receiver<TransportEvent>) {
    loop {
        let event = tokio::select! {
            _ = bus.shutdown.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(TransportEvent::Message(message)) => bus.dispatch_inbound(message),
            Ok(TransportEvent::Error(e)) => {
                // Transport owns its recovery; we only surface it.
                debug!("transport error: {e}");
            }
            Ok(TransportEvent::Closed) => {
                // Connection lost: settle everything in flight. A dialing
                // transport may reconnect, so only terminal states end the
                // loop.
                bus.cancel_pending_requests();
                if bus.transport.state().is_terminal() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("bus lagged behind transport by {n} events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    bus.cancel_pending_requests();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::duplex_pair;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn bus_pair() -> (Arc<MessageBus>, Arc<MessageBus>) {
        let (a, b) = duplex_pair();
        (
            MessageBus::new(Arc::new(a), DEFAULT_REQUEST_TIMEOUT),
            MessageBus::new(Arc::new(b), DEFAULT_REQUEST_TIMEOUT),
        )
    }

    /// Poll until `cond` holds, failing the test after two seconds.
    async fn wait_until(cond: impl Fn() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within two seconds");
    }

    #[tokio::test]
    async fn test_ping_round_trip() {
        let (client, server) = bus_pair();
        server.register_handler("ping", |_params| async move { Ok(json!({"pong": true})) });

        let result = client.request("ping", json!({})).await.unwrap();
        assert_eq!(result, json!({"pong": true}));
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_requests_resolve_to_their_own_ids() {
        let (client, server) = bus_pair();
        server.register_handler("echo", |params| async move {
            // Answer out of submission order to exercise correlation.
            let n = params["n"].as_u64().unwrap();
            tokio::time::sleep(Duration::from_millis(50 - n * 5)).await;
            Ok(json!({ "n": n }))
        });

        let mut handles = Vec::new();
        for n in 0..8u64 {
            let client = Arc::clone(&client);
            handles.push(tokio::spawn(async move {
                let result = client.request("echo", json!({ "n": n })).await.unwrap();
                assert_eq!(result["n"], n);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_removes_pending_and_late_response_is_noop() {
        let (client, server) = bus_pair();
        server.register_handler("slow", |_params| async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(json!("late"))
        });

        let err = client
            .request_with_timeout("slow", json!({}), Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Timeout { .. }));
        assert_eq!(client.pending_count(), 0);

        // The late response arrives eventually and must be ignored.
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_handler_error_becomes_response_error() {
        let (client, server) = bus_pair();
        server.register_handler("explode", |_params| async move {
            anyhow::bail!("kaboom")
        });

        let err = client.request("explode", json!({})).await.unwrap_err();
        match err {
            BusError::Remote(message) => assert!(message.contains("kaboom")),
            other => panic!("expected remote error, got {other:?}"),
        }

        // The bus survives: a follow-up request still works.
        server.register_handler("ok", |_params| async move { Ok(json!(1)) });
        assert_eq!(client.request("ok", json!({})).await.unwrap(), json!(1));
    }

    #[tokio::test]
    async fn test_unknown_method_is_remote_error() {
        let (client, _server) = bus_pair();
        let err = client.request("nope", json!({})).await.unwrap_err();
        match err {
            BusError::Remote(message) => assert!(message.contains("unknown method")),
            other => panic!("expected remote error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_event_fanout_in_registration_order() {
        let (client, server) = bus_pair();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            server.on_event("tick", move |_data| {
                order.lock().unwrap().push(tag);
            });
        }

        client.emit_event("tick", json!({})).await.unwrap();
        // Unregistered events are silently dropped.
        client.emit_event("nobody-listens", json!({})).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_cancel_pending_rejects_each_exactly_once() {
        let (client, server) = bus_pair();
        // Handler never answers.
        server.register_handler("hang", |_params| async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Value::Null)
        });

        let cancelled = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..5 {
            let client = Arc::clone(&client);
            let cancelled = Arc::clone(&cancelled);
            handles.push(tokio::spawn(async move {
                match client.request("hang", json!({})).await {
                    Err(BusError::Cancelled) => {
                        cancelled.fetch_add(1, Ordering::SeqCst);
                    }
                    other => panic!("expected cancellation, got {other:?}"),
                }
            }));
        }

        // Let the requests register before cancelling.
        wait_until(|| client.pending_count() == 5).await;
        client.cancel_pending_requests();

        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(cancelled.load(Ordering::SeqCst), 5);
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_transport_close_cancels_in_flight() {
        let (a, b) = duplex_pair();
        let server_transport = Arc::new(b);
        let client = MessageBus::new(Arc::new(a), DEFAULT_REQUEST_TIMEOUT);
        let server = MessageBus::new(
            Arc::clone(&server_transport) as Arc<dyn crate::transport::Transport>,
            DEFAULT_REQUEST_TIMEOUT,
        );
        // The peer never answers, so only the close can settle the request.
        server.register_handler("void", |_params| async move {
            std::future::pending::<()>().await;
            Ok(Value::Null)
        });

        let request = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.request("void", json!({})).await })
        };

        wait_until(|| client.pending_count() == 1).await;
        server_transport.close().await;

        let result = request.await.unwrap();
        assert!(matches!(result, Err(BusError::Cancelled)));
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_panicking_event_handler_does_not_stop_the_bus() {
        let (client, server) = bus_pair();
        let delivered = Arc::new(AtomicUsize::new(0));

        server.on_event("tick", |_data| panic!("handler bug"));
        {
            let delivered = Arc::clone(&delivered);
            server.on_event("tick", move |_data| {
                delivered.fetch_add(1, Ordering::SeqCst);
            });
        }

        client.emit_event("tick", json!({})).await.unwrap();
        wait_until(|| delivered.load(Ordering::SeqCst) == 1).await;

        // The dispatch loop is still alive and answering requests.
        server.register_handler("ping", |_params| async move { Ok(json!({"pong": true})) });
        let result = client.request("ping", json!({})).await.unwrap();
        assert_eq!(result["pong"], true);
    }
}
