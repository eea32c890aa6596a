//! TCP session server.
//!
//! Accepts connections on a non-blocking loop and gives each one a fully
//! isolated stack: fresh connection id, its own transport, bus, agent, and
//! bridge. The registry of live bridges is the only cross-connection
//! structure and is written only on connect and disconnect.

mod bridge;

pub use bridge::SessionBridge;

use std::sync::Arc;

use anyhow::{Context, Result};
use dashmap::DashMap;
use log::{info, warn};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use tether_protocol::now_ms;

use crate::agent::AgentFactory;
use crate::bus::{MessageBus, DEFAULT_REQUEST_TIMEOUT};
use crate::tools::ToolRegistry;
use crate::transport::{AcceptedTransport, Transport, TransportEvent};

fn new_connection_id() -> String {
    format!("conn_{}_{}", now_ms(), nanoid::nanoid!(6))
}

pub struct SessionServer {
    listener: TcpListener,
    agents: AgentFactory,
    tools: Arc<ToolRegistry>,
    connections: Arc<DashMap<String, Arc<SessionBridge>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl SessionServer {
    /// Bind the listener. The accept loop starts with [`SessionServer::run`].
    pub async fn bind(addr: &str, agents: AgentFactory) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            listener,
            agents,
            tools: Arc::new(ToolRegistry::builtin()),
            connections: Arc::new(DashMap::new()),
            shutdown_tx,
        })
    }

    /// The bound address, useful when binding port 0.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        self.listener
            .local_addr()
            .context("listener has no local address")
    }

    /// Handle for stopping the accept loop from another task.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn connection_ids(&self) -> Vec<String> {
        self.connections.iter().map(|e| e.key().clone()).collect()
    }

    /// Accept connections until shutdown, then close every live session.
    pub async fn run(&self) -> Result<()> {
        let addr = self.local_addr()?;
        info!("session server listening on {addr}");
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            if let Err(e) = stream.set_nodelay(true) {
                                warn!("set_nodelay failed for {peer}: {e}");
                            }
                            self.accept_connection(stream).await;
                        }
                        Err(e) => warn!("accept failed: {e}"),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("session server shutting down");
                    break;
                }
            }
        }

        let ids = self.connection_ids();
        for id in ids {
            if let Some((_, bridge)) = self.connections.remove(&id) {
                bridge.close().await;
            }
        }
        Ok(())
    }

    async fn accept_connection(&self, stream: tokio::net::TcpStream) {
        let id = new_connection_id();
        info!("[{id}] connected");

        let transport: Arc<dyn Transport> = Arc::new(AcceptedTransport::new(stream));
        let mut transport_events = transport.events();
        let bus = MessageBus::new(Arc::clone(&transport), DEFAULT_REQUEST_TIMEOUT);
        let agent = (self.agents)();
        let bridge = SessionBridge::new(
            &id,
            Arc::clone(&transport),
            Arc::clone(&bus),
            agent,
            Arc::clone(&self.tools),
        );

        if let Err(e) = bus
            .emit_event(
                "connected",
                json!({
                    "clientId": id,
                    "timestamp": now_ms(),
                    "message": "tether session established",
                }),
            )
            .await
        {
            warn!("[{id}] failed to send welcome: {e}");
        }

        self.connections.insert(id.clone(), Arc::clone(&bridge));

        // Watch for the transport closing and reap the session.
        let connections = Arc::clone(&self.connections);
        tokio::spawn(async move {
            loop {
                match transport_events.recv().await {
                    Ok(TransportEvent::Closed) | Err(broadcast::error::RecvError::Closed) => {
                        break;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                }
            }
            if let Some((_, bridge)) = connections.remove(&id) {
                bridge.close().await;
            }
            info!("[{id}] disconnected");
        });
    }
}
