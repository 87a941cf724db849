//! Forwarding admitted calls to backend tool servers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::error::GatewayError;
use crate::trace::{TraceContext, SPAN_HEADER, TRACE_HEADER};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum McpOperation {
    ToolsCall,
    ToolsList,
    ResourcesRead,
    ResourcesList,
    PromptsGet,
    PromptsList,
}

impl McpOperation {
    pub const ALL: [McpOperation; 6] = [
        McpOperation::ToolsCall,
        McpOperation::ToolsList,
        McpOperation::ResourcesRead,
        McpOperation::ResourcesList,
        McpOperation::PromptsGet,
        McpOperation::PromptsList,
    ];

    /// Path suffix on both the gateway route and the backend.
    pub fn endpoint(&self) -> &'static str {
        match self {
            McpOperation::ToolsCall => "/tools/call",
            McpOperation::ToolsList => "/tools/list",
            McpOperation::ResourcesRead => "/resources/read",
            McpOperation::ResourcesList => "/resources/list",
            McpOperation::PromptsGet => "/prompts/get",
            McpOperation::PromptsList => "/prompts/list",
        }
    }

    pub fn audit_action(&self) -> &'static str {
        match self {
            McpOperation::ToolsCall => "mcp.tool.call",
            McpOperation::ToolsList => "mcp.tool.list",
            McpOperation::ResourcesRead => "mcp.resource.read",
            McpOperation::ResourcesList => "mcp.resource.list",
            McpOperation::PromptsGet => "mcp.prompt.get",
            McpOperation::PromptsList => "mcp.prompt.list",
        }
    }

    /// The field naming what is being called, read or fetched.
    fn target_field(&self) -> Option<&'static str> {
        match self {
            McpOperation::ToolsCall => Some("tool"),
            McpOperation::ResourcesRead => Some("uri"),
            McpOperation::PromptsGet => Some("name"),
            _ => None,
        }
    }

    pub fn target<'a>(&self, body: &'a Value) -> Option<&'a str> {
        self.target_field()
            .and_then(|f| body.get(f))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    pub fn validate(&self, body: &Value) -> Result<(), GatewayError> {
        if !body.is_object() && !body.is_null() {
            return Err(GatewayError::InvalidRequest(
                "request body must be a JSON object".into(),
            ));
        }
        if let Some(field) = self.target_field() {
            if self.target(body).is_none() {
                return Err(GatewayError::InvalidRequest(format!("'{}' is required", field)));
            }
        }
        if let Some(args) = body.get("arguments") {
            if !args.is_object() && !args.is_null() {
                return Err(GatewayError::InvalidRequest(
                    "'arguments' must be an object".into(),
                ));
            }
        }
        Ok(())
    }
}

fn default_timeout_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Pricing {
    #[serde(default)]
    pub per_call: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub name: String,
    pub url: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub pricing: Pricing,
}

#[derive(Debug, Clone)]
pub struct BackendRequest {
    pub server: String,
    pub operation: McpOperation,
    pub body: Value,
    pub trace: TraceContext,
    pub client_ip: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BackendResponse {
    pub status: u16,
    pub body: Value,
    pub cost: f64,
    pub duration_ms: u64,
}

#[async_trait]
pub trait BackendDispatcher: Send + Sync {
    fn has_server(&self, name: &str) -> bool;
    fn server_names(&self) -> Vec<String>;
    async fn dispatch(&self, req: BackendRequest) -> Result<BackendResponse, GatewayError>;
}

/// POSTs the call body to `{server.url}{endpoint}`.
pub struct HttpDispatcher {
    servers: HashMap<String, ServerConfig>,
    client: reqwest::Client,
}

impl HttpDispatcher {
    pub fn new(servers: Vec<ServerConfig>) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| GatewayError::InternalError(format!("http client: {e}")))?;
        let servers = servers
            .into_iter()
            .map(|s| {
                let mut s = s;
                s.url = s.url.trim_end_matches('/').to_string();
                (s.name.clone(), s)
            })
            .collect();
        Ok(Self { servers, client })
    }
}

#[async_trait]
impl BackendDispatcher for HttpDispatcher {
    fn has_server(&self, name: &str) -> bool {
        self.servers.contains_key(name)
    }

    fn server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.servers.keys().cloned().collect();
        names.sort();
        names
    }

    async fn dispatch(&self, req: BackendRequest) -> Result<BackendResponse, GatewayError> {
        let server = self
            .servers
            .get(&req.server)
            .ok_or_else(|| GatewayError::ServerNotFound(req.server.clone()))?;
        let url = format!("{}{}", server.url, req.operation.endpoint());
        let start = Instant::now();

        let mut builder = self
            .client
            .post(&url)
            .timeout(Duration::from_millis(server.timeout_ms))
            .header(TRACE_HEADER, &req.trace.trace_id)
            .header(SPAN_HEADER, &req.trace.span_id)
            .json(&req.body);
        if let Some(ip) = req.client_ip.as_deref() {
            builder = builder.header("x-forwarded-for", ip);
        }

        let resp = builder.send().await.map_err(|e| {
            tracing::warn!(server = %req.server, url = %url, error = %e, trace_id = %req.trace.trace_id, "backend request failed");
            if e.is_timeout() {
                GatewayError::BackendTimeout(server.timeout_ms)
            } else {
                GatewayError::BackendUnavailable(format!("failed to reach server '{}'", req.server))
            }
        })?;
        let status = resp.status().as_u16();
        let bytes = resp.bytes().await.map_err(|e| {
            if e.is_timeout() {
                GatewayError::BackendTimeout(server.timeout_ms)
            } else {
                GatewayError::BackendUnavailable(format!("failed to read response from '{}'", req.server))
            }
        })?;
        let duration_ms = start.elapsed().as_millis() as u64;
        let body = serde_json::from_slice::<Value>(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));

        tracing::info!(
            server = %req.server,
            endpoint = req.operation.endpoint(),
            status,
            response_size = bytes.len(),
            duration_ms,
            trace_id = %req.trace.trace_id,
            "backend request completed"
        );

        if status >= 400 {
            let message = body
                .get("message")
                .or_else(|| body.get("error"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("server '{}' returned an error", req.server));
            return Err(GatewayError::BackendError { status, message });
        }

        Ok(BackendResponse {
            status,
            body,
            cost: server.pricing.per_call,
            duration_ms,
        })
    }
}
