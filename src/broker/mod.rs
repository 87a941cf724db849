//! Registry and lifecycle of long-lived agent connections.
//!
//! A connection is registered by [`ConnectionBroker::connect`] in state
//! `connecting`, moves to `connected` when its socket is attached, and ends
//! `disconnected`.  An attached connection runs exactly two tasks: a reader
//! that parses frames and spawns tool calls, and a writer that drains the
//! bounded outbound queue and pings the peer.

use axum::extract::ws::WebSocket;
use futures_util::StreamExt;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::auth::Identity;
use crate::error::GatewayError;
use crate::pipeline::RequestPipeline;

pub mod connection;
pub mod message;
mod session;

pub use connection::{
    AgentConnection, ConnectRequest, ConnectResponse, ConnectionSnapshot, ConnectionState,
    RateLimitInfo, SendStatus, ServerInfo, Transport,
};
pub use message::{ContentBlock, ErrorInfo, ProgressPayload, RawEnvelope, ToolCall, ToolResult, ToolStatus, WsMessage};

#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub queue_capacity: usize,
    pub max_in_flight: usize,
    pub max_message_bytes: usize,
    pub read_deadline: Duration,
    pub write_deadline: Duration,
    pub ping_interval: Duration,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            max_in_flight: 32,
            max_message_bytes: 512 * 1024,
            read_deadline: Duration::from_secs(60),
            write_deadline: Duration::from_secs(10),
            ping_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct BrokerStats {
    pub total: u64,
    pub active: u64,
    pub messages: u64,
    pub dropped: u64,
    pub by_platform: HashMap<String, u64>,
}

#[derive(Default)]
struct Registry {
    connections: HashMap<Uuid, Arc<AgentConnection>>,
    total: u64,
    by_platform: HashMap<String, u64>,
}

#[derive(Clone)]
pub struct ConnectionBroker {
    registry: Arc<RwLock<Registry>>,
    messages: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
    pipeline: Arc<RequestPipeline>,
    settings: BrokerSettings,
}

impl ConnectionBroker {
    pub fn new(pipeline: Arc<RequestPipeline>, settings: BrokerSettings) -> Self {
        Self {
            registry: Arc::new(RwLock::new(Registry::default())),
            messages: Arc::new(AtomicU64::new(0)),
            dropped: Arc::new(AtomicU64::new(0)),
            pipeline,
            settings,
        }
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    pub(crate) fn pipeline(&self) -> &Arc<RequestPipeline> {
        &self.pipeline
    }

    pub(crate) fn count_message(&self) {
        self.messages.fetch_add(1, Ordering::Relaxed);
    }

    pub async fn connect(&self, req: ConnectRequest, identity: Arc<Identity>) -> Arc<AgentConnection> {
        let conn = Arc::new(AgentConnection::new(
            req,
            identity,
            self.settings.queue_capacity,
            self.settings.max_in_flight,
            self.dropped.clone(),
        ));
        {
            let mut reg = self.registry.write().await;
            reg.connections.insert(conn.id, conn.clone());
            reg.total += 1;
            *reg.by_platform.entry(conn.platform.clone()).or_default() += 1;
        }
        tracing::info!(
            connection_id = %conn.id,
            platform = %conn.platform,
            agent_id = %conn.agent_id,
            org_id = %conn.org_id(),
            "agent connection created"
        );
        conn
    }

    pub async fn get(&self, id: Uuid) -> Option<Arc<AgentConnection>> {
        self.registry.read().await.connections.get(&id).cloned()
    }

    /// Hand an upgraded socket to a registered connection and start its
    /// reader and writer.  A connection accepts exactly one socket.
    pub async fn attach(&self, id: Uuid, socket: WebSocket) -> Result<(), GatewayError> {
        let conn = self
            .get(id)
            .await
            .ok_or_else(|| GatewayError::ConnectionNotFound(id.to_string()))?;
        let outbound = conn.take_outbound().ok_or_else(|| {
            GatewayError::InvalidRequest("connection already has a socket attached".into())
        })?;
        if conn.advance(ConnectionState::Connected) == ConnectionState::Disconnected {
            return Err(GatewayError::ConnectionNotFound(id.to_string()));
        }

        let (sink, stream) = socket.split();
        tokio::spawn(session::run_writer(self.clone(), conn.clone(), sink, outbound));
        tokio::spawn(session::run_reader(self.clone(), conn.clone(), stream));
        tracing::info!(connection_id = %id, "websocket connection established");
        Ok(())
    }

    /// Remove and shut down a connection.  Safe to call repeatedly; returns
    /// whether this call did the removal.
    pub async fn disconnect(&self, id: Uuid) -> bool {
        let conn = {
            let mut reg = self.registry.write().await;
            let Some(conn) = reg.connections.remove(&id) else {
                return false;
            };
            if let Some(n) = reg.by_platform.get_mut(&conn.platform) {
                *n = n.saturating_sub(1);
                if *n == 0 {
                    reg.by_platform.remove(&conn.platform);
                }
            }
            conn
        };
        conn.close();
        tracing::info!(connection_id = %id, "agent connection closed");
        true
    }

    /// Enqueue a message for a connection without waiting.
    pub async fn send(&self, id: Uuid, msg: WsMessage) -> SendStatus {
        match self.get(id).await {
            Some(conn) => conn.enqueue(msg),
            None => SendStatus::NotFound,
        }
    }

    pub async fn stats(&self) -> BrokerStats {
        let reg = self.registry.read().await;
        BrokerStats {
            total: reg.total,
            active: reg.connections.len() as u64,
            messages: self.messages.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            by_platform: reg.by_platform.clone(),
        }
    }

    /// Disconnect everything; used on shutdown.
    pub async fn close_all(&self) {
        let ids: Vec<Uuid> = self.registry.read().await.connections.keys().copied().collect();
        for id in ids {
            self.disconnect(id).await;
        }
    }
}
