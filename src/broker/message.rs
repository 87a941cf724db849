//! Agent wire protocol.
//!
//! Every frame is a JSON envelope `{"type", "id"?, "payload"?}`.  Inbound
//! text is parsed into a [`RawEnvelope`] and then narrowed into the
//! exhaustive [`WsMessage`]; outbound messages serialize back through the
//! same envelope shape.

use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::GatewayError;

/// Envelope as it appears on the wire, before the payload is typed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub server: String,
    pub tool: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Success,
    Error,
    Timeout,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: "text".to_string(),
            text: Some(text.into()),
            data: None,
            uri: None,
        }
    }

    /// Backend responses that already carry MCP `content` blocks are passed
    /// through; anything else becomes a single text block.
    pub fn from_backend_body(body: &Value) -> Vec<ContentBlock> {
        if let Some(blocks) = body
            .get("content")
            .cloned()
            .and_then(|c| serde_json::from_value::<Vec<ContentBlock>>(c).ok())
        {
            return blocks;
        }
        match body {
            Value::Null => Vec::new(),
            Value::String(s) => vec![ContentBlock::text(s.clone())],
            other => vec![ContentBlock::text(other.to_string())],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }
}

impl From<&GatewayError> for ErrorInfo {
    fn from(err: &GatewayError) -> Self {
        let body = err.body();
        Self {
            code: body.code,
            message: body.message,
            details: body.details,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolResult {
    pub id: String,
    pub status: ToolStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content: Vec<ContentBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    pub duration_ms: u64,
    pub cost: f64,
}

impl ToolResult {
    pub fn failed(id: String, err: &GatewayError, duration_ms: u64) -> Self {
        let status = match err {
            GatewayError::BackendTimeout(_) => ToolStatus::Timeout,
            _ => ToolStatus::Error,
        };
        Self {
            id,
            status,
            content: Vec::new(),
            error: Some(ErrorInfo::from(err)),
            duration_ms,
            cost: 0.0,
        }
    }

    pub fn cancelled(id: String, duration_ms: u64) -> Self {
        Self {
            id,
            status: ToolStatus::Error,
            content: Vec::new(),
            error: Some(ErrorInfo::new("cancelled", "call was cancelled")),
            duration_ms,
            cost: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressPayload {
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WsMessage {
    Ping { id: Option<String> },
    Pong { id: Option<String> },
    ToolCall { id: String, call: ToolCall },
    ToolResult(ToolResult),
    Progress { id: String, payload: ProgressPayload },
    Cancel { id: String },
    Error { id: Option<String>, error: ErrorInfo },
}

/// Why an inbound frame could not become a [`WsMessage`].  Each maps onto
/// an `error` envelope; none of them closes the connection.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameError {
    Malformed(String),
    InvalidToolCall { id: Option<String>, reason: String },
    UnknownType { id: Option<String>, kind: String },
}

impl FrameError {
    pub fn into_message(self) -> WsMessage {
        match self {
            FrameError::Malformed(reason) => WsMessage::error(
                None,
                ErrorInfo::new("invalid_message", format!("failed to parse message: {reason}")),
            ),
            FrameError::InvalidToolCall { id, reason } => {
                WsMessage::error(id, ErrorInfo::new("invalid_tool_call", reason))
            }
            FrameError::UnknownType { id, kind } => WsMessage::error(
                id,
                ErrorInfo::new("unknown_message_type", format!("unknown message type: {kind}")),
            ),
        }
    }
}

impl WsMessage {
    pub fn error(id: Option<String>, error: ErrorInfo) -> Self {
        WsMessage::Error { id, error }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WsMessage::Ping { .. } => "ping",
            WsMessage::Pong { .. } => "pong",
            WsMessage::ToolCall { .. } => "tool_call",
            WsMessage::ToolResult(_) => "tool_result",
            WsMessage::Progress { .. } => "progress",
            WsMessage::Cancel { .. } => "cancel",
            WsMessage::Error { .. } => "error",
        }
    }

    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let raw: RawEnvelope =
            serde_json::from_str(text).map_err(|e| FrameError::Malformed(e.to_string()))?;
        WsMessage::try_from(raw)
    }

    pub fn to_envelope(&self) -> RawEnvelope {
        let (id, payload) = match self {
            WsMessage::Ping { id } | WsMessage::Pong { id } => (id.clone(), None),
            WsMessage::ToolCall { id, call } => (Some(id.clone()), serde_json::to_value(call).ok()),
            WsMessage::ToolResult(r) => (Some(r.id.clone()), serde_json::to_value(r).ok()),
            WsMessage::Progress { id, payload } => {
                (Some(id.clone()), serde_json::to_value(payload).ok())
            }
            WsMessage::Cancel { id } => (Some(id.clone()), None),
            WsMessage::Error { id, error } => (id.clone(), serde_json::to_value(error).ok()),
        };
        RawEnvelope {
            kind: self.kind().to_string(),
            id,
            payload,
        }
    }
}

impl Serialize for WsMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_envelope().serialize(serializer)
    }
}

impl TryFrom<RawEnvelope> for WsMessage {
    type Error = FrameError;

    fn try_from(raw: RawEnvelope) -> Result<Self, FrameError> {
        let id = raw.id.filter(|s| !s.is_empty());
        match raw.kind.as_str() {
            "ping" => Ok(WsMessage::Ping { id }),
            "pong" => Ok(WsMessage::Pong { id }),
            "cancel" => id
                .map(|id| WsMessage::Cancel { id })
                .ok_or_else(|| FrameError::Malformed("cancel requires an id".into())),
            "tool_call" => {
                let Some(id) = id else {
                    return Err(FrameError::InvalidToolCall {
                        id: None,
                        reason: "tool_call requires an id".into(),
                    });
                };
                let call = raw
                    .payload
                    .ok_or_else(|| "missing payload".to_string())
                    .and_then(|p| serde_json::from_value::<ToolCall>(p).map_err(|e| e.to_string()))
                    .and_then(|c| {
                        if c.server.is_empty() || c.tool.is_empty() {
                            Err("server and tool are required".to_string())
                        } else {
                            Ok(c)
                        }
                    });
                match call {
                    Ok(call) => Ok(WsMessage::ToolCall { id, call }),
                    Err(reason) => Err(FrameError::InvalidToolCall {
                        id: Some(id),
                        reason: format!("invalid tool call: {reason}"),
                    }),
                }
            }
            other => Err(FrameError::UnknownType {
                id,
                kind: other.to_string(),
            }),
        }
    }
}
