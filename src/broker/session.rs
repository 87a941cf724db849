//! The reader/writer task pair behind an upgraded agent connection.

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::time::timeout;

use super::connection::AgentConnection;
use super::message::{ContentBlock, ErrorInfo, ProgressPayload, ToolCall, ToolResult, ToolStatus, WsMessage};
use super::ConnectionBroker;
use crate::dispatch::McpOperation;
use crate::pipeline::{Caller, InboundCall};

pub(crate) async fn run_writer(
    broker: ConnectionBroker,
    conn: Arc<AgentConnection>,
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<WsMessage>,
) {
    let settings = broker.settings().clone();
    let shutdown = conn.shutdown_token().clone();
    let mut ticker = tokio::time::interval_at(
        tokio::time::Instant::now() + settings.ping_interval,
        settings.ping_interval,
    );

    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            msg = outbound.recv() => match msg {
                Some(msg) => match serde_json::to_string(&msg) {
                    Ok(text) => Message::Text(text),
                    Err(e) => {
                        tracing::error!(connection_id = %conn.id, error = %e, "failed to encode outbound message");
                        continue;
                    }
                },
                None => break,
            },
            _ = ticker.tick() => Message::Ping(Vec::new()),
        };
        match timeout(settings.write_deadline, sink.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(connection_id = %conn.id, error = %e, "websocket write error");
                break;
            }
            Err(_) => {
                tracing::warn!(connection_id = %conn.id, "websocket write deadline exceeded");
                break;
            }
        }
    }

    let _ = timeout(settings.write_deadline, sink.send(Message::Close(None))).await;
    broker.disconnect(conn.id).await;
}

pub(crate) async fn run_reader(
    broker: ConnectionBroker,
    conn: Arc<AgentConnection>,
    mut stream: SplitStream<WebSocket>,
) {
    let settings = broker.settings().clone();
    let shutdown = conn.shutdown_token().clone();

    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = timeout(settings.read_deadline, stream.next()) => next,
        };
        let frame = match next {
            Err(_) => {
                tracing::info!(connection_id = %conn.id, "read deadline exceeded; closing connection");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                tracing::debug!(connection_id = %conn.id, error = %e, "websocket read error");
                break;
            }
            Ok(Some(Ok(frame))) => frame,
        };
        conn.touch();

        let text = match frame {
            Message::Text(text) => text,
            Message::Binary(bytes) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    broker.count_message();
                    conn.enqueue(WsMessage::error(
                        None,
                        ErrorInfo::new("invalid_message", "binary frames must be UTF-8 JSON"),
                    ));
                    continue;
                }
            },
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => break,
        };
        broker.count_message();
        if text.len() > settings.max_message_bytes {
            conn.enqueue(WsMessage::error(
                None,
                ErrorInfo::new("invalid_message", "message exceeds the maximum size"),
            ));
            continue;
        }
        handle_frame(&broker, &conn, &text);
    }

    broker.disconnect(conn.id).await;
}

fn handle_frame(broker: &ConnectionBroker, conn: &Arc<AgentConnection>, text: &str) {
    let msg = match WsMessage::parse(text) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::debug!(connection_id = %conn.id, error = ?e, "rejected inbound frame");
            conn.enqueue(e.into_message());
            return;
        }
    };
    match msg {
        WsMessage::Ping { id } => {
            conn.enqueue(WsMessage::Pong { id });
        }
        WsMessage::ToolCall { id, call } => spawn_tool_call(broker, conn, id, call),
        WsMessage::Cancel { id } => {
            let found = conn.cancel_call(&id);
            tracing::info!(connection_id = %conn.id, call_id = %id, found, "cancel requested");
        }
        other => {
            let id = match &other {
                WsMessage::Pong { id } => id.clone(),
                WsMessage::Progress { id, .. } => Some(id.clone()),
                WsMessage::ToolResult(r) => Some(r.id.clone()),
                _ => None,
            };
            conn.enqueue(WsMessage::error(
                id,
                ErrorInfo::new(
                    "unknown_message_type",
                    format!("unexpected message type: {}", other.kind()),
                ),
            ));
        }
    }
}

fn spawn_tool_call(broker: &ConnectionBroker, conn: &Arc<AgentConnection>, id: String, call: ToolCall) {
    let permit = match conn.in_flight_limiter().clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            conn.enqueue(WsMessage::error(
                Some(id),
                ErrorInfo::new("too_many_in_flight", "too many tool calls in flight on this connection"),
            ));
            return;
        }
    };
    let Some(ticket) = conn.begin_call(&id) else {
        conn.enqueue(WsMessage::error(
            Some(id),
            ErrorInfo::new("invalid_tool_call", "a call with this id is already in flight"),
        ));
        return;
    };

    let pipeline = broker.pipeline().clone();
    let conn = conn.clone();
    tokio::spawn(async move {
        let _permit = permit;
        let started = Instant::now();
        conn.enqueue(WsMessage::Progress {
            id: id.clone(),
            payload: ProgressPayload {
                progress: 0.0,
                message: Some("dispatched".to_string()),
            },
        });

        let inbound = InboundCall {
            server: call.server,
            operation: McpOperation::ToolsCall,
            body: json!({ "tool": call.tool, "arguments": call.arguments }),
            caller: Caller::Session(conn.identity().clone()),
            trace: conn.trace().child(),
            client_ip: None,
            transport: "websocket",
        };
        let outcome = tokio::select! {
            biased;
            _ = ticket.token.cancelled() => None,
            r = pipeline.handle(inbound) => Some(r),
        };
        conn.end_call(&id, &ticket);

        let result = match outcome {
            None => {
                tracing::info!(connection_id = %conn.id, call_id = %id, "tool call cancelled");
                ToolResult::cancelled(id, started.elapsed().as_millis() as u64)
            }
            Some(out) => match out.result {
                Ok(resp) => ToolResult {
                    id,
                    status: ToolStatus::Success,
                    content: ContentBlock::from_backend_body(&resp.body),
                    error: None,
                    duration_ms: resp.duration_ms,
                    cost: resp.cost,
                },
                Err(err) => ToolResult::failed(id, &err, started.elapsed().as_millis() as u64),
            },
        };
        conn.enqueue(WsMessage::ToolResult(result));
    });
}

