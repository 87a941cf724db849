use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::message::WsMessage;
use crate::auth::Identity;
use crate::trace::TraceContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting = 0,
    Connected = 1,
    Disconnected = 2,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Http,
    #[serde(rename = "websocket")]
    WebSocket,
    Sse,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectRequest {
    #[serde(default)]
    pub agent_id: String,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub transport: Transport,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerInfo {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RateLimitInfo {
    pub requests_per_minute: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectResponse {
    pub connection_id: Uuid,
    pub gateway_url: String,
    pub available_servers: Vec<ServerInfo>,
    pub rate_limits: RateLimitInfo,
}

/// Point-in-time view of a connection, safe to serialize.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSnapshot {
    pub id: Uuid,
    pub agent_id: String,
    pub platform: String,
    pub org_id: String,
    pub user_id: String,
    pub transport: Transport,
    pub state: ConnectionState,
    pub capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub in_flight: usize,
}

/// Result of a non-blocking enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Queued,
    /// Queue full; the newest message was discarded.
    Dropped,
    /// No such connection, or it has shut down.
    NotFound,
}

pub struct AgentConnection {
    pub id: Uuid,
    pub agent_id: String,
    pub platform: String,
    pub transport: Transport,
    pub capabilities: Vec<String>,
    pub callback_url: Option<String>,
    pub metadata: Option<Map<String, Value>>,
    pub created_at: DateTime<Utc>,
    identity: Arc<Identity>,
    trace: TraceContext,
    state: AtomicU8,
    last_active_ms: AtomicI64,
    outbound: mpsc::Sender<WsMessage>,
    outbound_rx: Mutex<Option<mpsc::Receiver<WsMessage>>>,
    dropped: Arc<AtomicU64>,
    shutdown: CancellationToken,
    in_flight: Arc<Semaphore>,
    max_in_flight: usize,
    calls: DashMap<String, (u64, CancellationToken)>,
    call_generation: AtomicU64,
}

/// Handle on a registered call.  `generation` distinguishes it from a later
/// call that reuses the same id.
#[derive(Debug, Clone)]
pub(crate) struct CallTicket {
    pub generation: u64,
    pub token: CancellationToken,
}

impl AgentConnection {
    pub(crate) fn new(
        req: ConnectRequest,
        identity: Arc<Identity>,
        queue_capacity: usize,
        max_in_flight: usize,
        dropped: Arc<AtomicU64>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            agent_id: req.agent_id,
            platform: req.platform,
            transport: req.transport,
            capabilities: req.capabilities,
            callback_url: req.callback_url,
            metadata: req.metadata,
            created_at: now,
            identity,
            trace: TraceContext::new(),
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            last_active_ms: AtomicI64::new(now.timestamp_millis()),
            outbound: tx,
            outbound_rx: Mutex::new(Some(rx)),
            dropped,
            shutdown: CancellationToken::new(),
            in_flight: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
            calls: DashMap::new(),
            call_generation: AtomicU64::new(0),
        }
    }

    pub fn identity(&self) -> &Arc<Identity> {
        &self.identity
    }

    /// Session-level trace; each tool call runs in a child span of it.
    pub fn trace(&self) -> &TraceContext {
        &self.trace
    }

    pub fn org_id(&self) -> &str {
        &self.identity.org_id
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move forward to `next`; never backwards.  Returns the previous state.
    pub(crate) fn advance(&self, next: ConnectionState) -> ConnectionState {
        ConnectionState::from_u8(self.state.fetch_max(next as u8, Ordering::AcqRel))
    }

    pub fn touch(&self) {
        self.last_active_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_active_at(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(self.last_active_ms.load(Ordering::Relaxed))
            .unwrap_or(self.created_at)
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn in_flight(&self) -> usize {
        self.max_in_flight
            .saturating_sub(self.in_flight.available_permits())
    }

    pub(crate) fn in_flight_limiter(&self) -> &Arc<Semaphore> {
        &self.in_flight
    }

    /// The writer takes the receiving half exactly once.
    pub(crate) fn take_outbound(&self) -> Option<mpsc::Receiver<WsMessage>> {
        self.outbound_rx.lock().ok().and_then(|mut rx| rx.take())
    }

    pub fn enqueue(&self, msg: WsMessage) -> SendStatus {
        match self.outbound.try_send(msg) {
            Ok(()) => SendStatus::Queued,
            Err(mpsc::error::TrySendError::Full(msg)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    connection_id = %self.id,
                    message_type = msg.kind(),
                    "outbound queue full; dropping message"
                );
                SendStatus::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(_)) => SendStatus::NotFound,
        }
    }

    /// Register an in-flight call under `id`.  `None` when that id is
    /// already in flight.
    pub(crate) fn begin_call(&self, id: &str) -> Option<CallTicket> {
        match self.calls.entry(id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => None,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let generation = self.call_generation.fetch_add(1, Ordering::Relaxed);
                let token = self.shutdown.child_token();
                slot.insert((generation, token.clone()));
                Some(CallTicket { generation, token })
            }
        }
    }

    /// Drop the registration for `ticket`, leaving any newer call under the
    /// same id in place.
    pub(crate) fn end_call(&self, id: &str, ticket: &CallTicket) {
        self.calls
            .remove_if(id, |_, (generation, _)| *generation == ticket.generation);
    }

    /// Cancel the in-flight call with `id`, if any.
    pub fn cancel_call(&self, id: &str) -> bool {
        match self.calls.remove(id) {
            Some((_, (_, token))) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub(crate) fn close(&self) {
        self.advance(ConnectionState::Disconnected);
        self.shutdown.cancel();
        self.calls.clear();
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            id: self.id,
            agent_id: self.agent_id.clone(),
            platform: self.platform.clone(),
            org_id: self.identity.org_id.clone(),
            user_id: self.identity.user_id.clone(),
            transport: self.transport,
            state: self.state(),
            capabilities: self.capabilities.clone(),
            callback_url: self.callback_url.clone(),
            metadata: self.metadata.clone(),
            created_at: self.created_at,
            last_active_at: self.last_active_at(),
            in_flight: self.in_flight(),
        }
    }
}

impl std::fmt::Debug for AgentConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentConnection")
            .field("id", &self.id)
            .field("platform", &self.platform)
            .field("state", &self.state())
            .finish()
    }
}
