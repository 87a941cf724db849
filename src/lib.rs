//! Core library for the GatewayOps gateway.  This module wires the request
//! pipeline, the agent connection broker and the HTTP handlers together.

pub mod audit;
pub mod auth;
pub mod broker;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod metrics;
pub mod notify;
pub mod pipeline;
pub mod quota;
pub mod safety;
pub mod trace;
pub mod util;

pub use config::AppConfig;

use anyhow::Context;
use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, MethodRouter};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::audit::{JsonlAuditSink, RotatingWriter};
use crate::auth::{AuthResolver, Identity, MemoryCredentialStore};
use crate::broker::{
    AgentConnection, BrokerSettings, ConnectRequest, ConnectResponse, ConnectionBroker,
    ConnectionState, RateLimitInfo, ServerInfo,
};
use crate::dispatch::{BackendDispatcher, HttpDispatcher, McpOperation};
use crate::error::{rate_limit_headers, GatewayError};
use crate::metrics::{metrics_handler, GatewayMetrics};
use crate::notify::{LogNotifier, NotificationSink, WebhookNotifier};
use crate::pipeline::{Caller, InboundCall, PipelineDeps, RequestPipeline};
use crate::quota::{MemoryWindowStore, QuotaTracker, RedisWindowStore, WindowStore};
use crate::safety::{
    DetectionFilter, DetectionLog, DetectionSink, MemoryPolicyStore, SafetyScreen, ScreenContext,
    TracingDetectionSink,
};
use crate::trace::{TraceContext, SPAN_HEADER, TRACE_HEADER};
use crate::util::bearer_token;

pub const WARNING_HEADER: &str = "x-gatewayops-warning";

/// Shared application state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub pipeline: Arc<RequestPipeline>,
    pub broker: ConnectionBroker,
    pub auth: Arc<AuthResolver>,
    pub credentials: Arc<MemoryCredentialStore>,
    pub policies: Arc<MemoryPolicyStore>,
    pub safety: Arc<SafetyScreen>,
    pub audit: JsonlAuditSink,
    pub metrics: Arc<GatewayMetrics>,
}

/// Replacements for the collaborators `build_state` would otherwise derive
/// from configuration.
#[derive(Default)]
pub struct Backends {
    pub window_store: Option<Arc<dyn WindowStore>>,
    pub dispatcher: Option<Arc<dyn BackendDispatcher>>,
    pub detection_sink: Option<Arc<dyn DetectionSink>>,
    pub notifier: Option<Arc<dyn NotificationSink>>,
    /// Socket deadlines and queue bounds; `max_inflight_calls` from the
    /// config is used when absent.
    pub broker: Option<BrokerSettings>,
}

/// Build state from environment variables; see [`AppConfig::from_env`].
pub async fn build_state_from_env() -> anyhow::Result<AppState> {
    let config = AppConfig::from_env()?;
    build_state(config, Backends::default()).await
}

pub async fn build_state(config: AppConfig, backends: Backends) -> anyhow::Result<AppState> {
    let credentials = Arc::new(MemoryCredentialStore::new());
    for cred in config.file.credentials.iter().cloned() {
        credentials.insert(cred);
    }
    let auth = Arc::new(AuthResolver::new(
        credentials.clone(),
        config.identity_cache_ttl,
        config.default_rate_limit,
    ));

    let window_store: Arc<dyn WindowStore> = match (backends.window_store, config.redis_url.as_deref()) {
        (Some(store), _) => store,
        (None, Some(url)) => Arc::new(
            RedisWindowStore::connect(url)
                .await
                .with_context(|| "Failed to connect GATEWAY_REDIS_URL quota store")?,
        ),
        (None, None) => Arc::new(MemoryWindowStore::new()),
    };
    let quota = Arc::new(QuotaTracker::new(
        window_store,
        config.quota_strategy,
        config.quota_window,
        config.quota_fail_mode,
    ));

    let policies = Arc::new(MemoryPolicyStore::new(config.file.policies.clone()));
    let detection_sink = backends
        .detection_sink
        .unwrap_or_else(|| Arc::new(TracingDetectionSink));
    let safety = Arc::new(SafetyScreen::new(
        policies.clone(),
        Arc::new(DetectionLog::new(config.detection_buffer)),
        detection_sink,
    ));

    let dispatcher: Arc<dyn BackendDispatcher> = match backends.dispatcher {
        Some(d) => d,
        None => Arc::new(
            HttpDispatcher::new(config.file.servers.clone())
                .map_err(|e| anyhow::anyhow!("Failed to build backend client: {e}"))?,
        ),
    };

    let notifier: Arc<dyn NotificationSink> = match (backends.notifier, config.notify_webhook.as_deref()) {
        (Some(n), _) => n,
        (None, Some(url)) => Arc::new(
            WebhookNotifier::new(url.to_string(), Duration::from_secs(5))
                .with_context(|| "Failed to build GATEWAY_NOTIFY_WEBHOOK client")?,
        ),
        (None, None) => Arc::new(LogNotifier),
    };

    let writer = match config.audit_log_file.as_deref() {
        Some(path) => {
            let r = &config.rotation;
            match RotatingWriter::open(path, r.max_bytes, r.keep, r.compress) {
                Ok(w) => Some(w),
                Err(e) => {
                    tracing::warn!(path = %path, error = %e, "Failed to open AUDIT_LOG_FILE; audit events go to the log");
                    None
                }
            }
        }
        None => None,
    };
    let audit = JsonlAuditSink::new(writer, config.log_stdout);
    let metrics = Arc::new(GatewayMetrics::new());

    let pipeline = Arc::new(RequestPipeline::new(PipelineDeps {
        auth: auth.clone(),
        quota,
        safety: safety.clone(),
        dispatcher,
        audit: Arc::new(audit.clone()),
        notifier,
        metrics: metrics.clone(),
        safety_fail_mode: config.safety_fail_mode,
    }));
    let broker_settings = backends.broker.unwrap_or_else(|| BrokerSettings {
        max_in_flight: config.max_inflight_calls,
        ..BrokerSettings::default()
    });
    let broker = ConnectionBroker::new(pipeline.clone(), broker_settings);

    tracing::info!(
        servers = config.file.servers.len(),
        credentials = config.file.credentials.len(),
        policies = policies.len(),
        quota_strategy = ?config.quota_strategy,
        "gateway state initialised"
    );

    Ok(AppState {
        config: Arc::new(config),
        pipeline,
        broker,
        auth,
        credentials,
        policies,
        safety,
        audit,
        metrics,
    })
}

/// Build the Axum router and attach handlers.
pub fn app(state: AppState) -> Router {
    let max_request_bytes = state.config.max_request_bytes;

    let mut router = Router::new();
    for op in McpOperation::ALL {
        router = router.route(&format!("/v1/mcp/:server{}", op.endpoint()), mcp_route(op));
    }
    let router = router
        .route("/v1/safety/test", post(safety_test_handler))
        .route("/v1/safety/detections", get(detections_handler))
        .route("/v1/safety/summary", get(detection_summary_handler))
        .route("/v1/agents/connect", post(agent_connect_handler))
        .route("/v1/agents/stats", get(agent_stats_handler))
        .route(
            "/v1/agents/:id",
            get(agent_get_handler).delete(agent_disconnect_handler),
        )
        .route("/v1/agents/:id/ws", get(agent_ws_handler))
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/metrics", get(metrics_handler));

    let router = if let Some(limit) = max_request_bytes {
        router.layer(DefaultBodyLimit::max(limit))
    } else {
        router
    };

    router.with_state(state)
}

fn caller_from(headers: &HeaderMap) -> Caller {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token)
        .map(|t| Caller::Credential(t.to_string()))
        .unwrap_or(Caller::Anonymous)
}

async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Arc<Identity>, GatewayError> {
    let raw = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token)
        .ok_or(GatewayError::MissingCredential)?;
    Ok(state.auth.resolve(raw).await?)
}

/// First hop from `X-Forwarded-For`, else `X-Real-IP`.
fn client_ip(headers: &HeaderMap) -> Option<String> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };
    header("x-forwarded-for")
        .and_then(|xff| xff.split(',').next())
        .map(|ip| ip.trim().to_string())
        .or_else(|| header("x-real-ip").map(str::to_string))
}

fn set_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(v) = HeaderValue::from_str(value) {
        headers.insert(name, v);
    }
}

fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, Response> {
    match body {
        Ok(Json(v)) => Ok(v),
        Err(rejection) if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE => {
            tracing::warn!("request body exceeded configured limit");
            Err(rejection.into_response())
        }
        Err(rejection) => Err(GatewayError::InvalidRequest(rejection.body_text()).into_response()),
    }
}

fn mcp_route(op: McpOperation) -> MethodRouter<AppState> {
    post(
        move |State(state): State<AppState>,
              Path(server): Path<String>,
              headers: HeaderMap,
              body: Bytes| async move { mcp_handler(state, op, server, headers, body).await },
    )
}

async fn mcp_handler(
    state: AppState,
    operation: McpOperation,
    server: String,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    // Unparseable bodies still flow through the pipeline so the call is
    // authenticated and audited; validation rejects the non-object body.
    let body = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice::<Value>(&body)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&body).into_owned()))
    };
    let call = InboundCall {
        server: server.clone(),
        operation,
        body,
        caller: caller_from(&headers),
        trace: TraceContext::from_headers(&headers),
        client_ip: client_ip(&headers),
        transport: "http",
    };

    let out = state.pipeline.handle(call).await;
    let mut response = match out.result {
        Ok(resp) => {
            let status = StatusCode::from_u16(resp.status).unwrap_or(StatusCode::OK);
            let mut r = (status, Json(resp.body)).into_response();
            let h = r.headers_mut();
            set_header(h, "x-mcp-server", &server);
            h.insert("x-mcp-duration-ms", HeaderValue::from(resp.duration_ms));
            set_header(h, "x-mcp-cost", &format!("{:.6}", resp.cost));
            r
        }
        Err(err) => {
            tracing::debug!(server = %server, code = err.code(), trace_id = %out.trace.trace_id, "call rejected");
            err.into_response()
        }
    };

    let h = response.headers_mut();
    set_header(h, TRACE_HEADER, &out.trace.trace_id);
    set_header(h, SPAN_HEADER, &out.trace.span_id);
    if let Some(q) = out.quota {
        rate_limit_headers(h, q.limit, q.remaining, q.reset_seconds);
    }
    if let Some(warning) = out.warning.as_deref() {
        set_header(h, WARNING_HEADER, warning);
    }
    response
}

#[derive(Debug, Deserialize)]
struct SafetyTestRequest {
    input: String,
    #[serde(default)]
    policy_id: Option<String>,
    #[serde(default)]
    server: Option<String>,
}

async fn safety_test_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<SafetyTestRequest>, JsonRejection>,
) -> Result<Response, Response> {
    let identity = authenticate(&state, &headers)
        .await
        .map_err(IntoResponse::into_response)?;
    let req = json_body(body)?;
    let ctx = ScreenContext {
        org_id: identity.org_id.clone(),
        key_id: identity.key_id.clone(),
        server: req.server.unwrap_or_default(),
        ..Default::default()
    };
    let verdict = state
        .safety
        .test(&req.input, req.policy_id.as_deref(), &ctx)
        .await
        .map_err(|e| GatewayError::InternalError(e.to_string()).into_response())?;
    Ok(Json(verdict).into_response())
}

async fn detections_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(mut filter): Query<DetectionFilter>,
) -> Result<Response, GatewayError> {
    let identity = authenticate(&state, &headers).await?;
    filter.org_id = Some(identity.org_id.clone());
    Ok(Json(state.safety.detections().list(&filter)).into_response())
}

async fn detection_summary_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, GatewayError> {
    let identity = authenticate(&state, &headers).await?;
    Ok(Json(state.safety.detections().summary(Some(&identity.org_id))).into_response())
}

async fn agent_connect_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<ConnectRequest>, JsonRejection>,
) -> Result<Response, Response> {
    let identity = authenticate(&state, &headers)
        .await
        .map_err(IntoResponse::into_response)?;
    let req = json_body(body)?;
    if req.platform.trim().is_empty() {
        return Err(GatewayError::InvalidRequest("platform is required".into()).into_response());
    }

    let conn = state.broker.connect(req, identity.clone()).await;
    let available_servers = state
        .pipeline
        .dispatcher()
        .server_names()
        .into_iter()
        .filter(|name| identity.permits(name))
        .map(|name| ServerInfo { name })
        .collect();
    let window_secs = state.config.quota_window.as_secs().max(1);
    let resp = ConnectResponse {
        connection_id: conn.id,
        gateway_url: format!("wss://{}/v1/agents/{}/ws", state.config.public_host, conn.id),
        available_servers,
        rate_limits: RateLimitInfo {
            requests_per_minute: identity.rate_limit.saturating_mul(60) / window_secs,
        },
    };
    Ok(Json(resp).into_response())
}

/// Look up a connection owned by the caller's organization.  Connections of
/// other organizations are reported as absent.
async fn owned_connection(
    state: &AppState,
    identity: &Identity,
    id: &str,
) -> Result<Arc<AgentConnection>, GatewayError> {
    let id = Uuid::parse_str(id)
        .map_err(|_| GatewayError::InvalidRequest("invalid connection id".into()))?;
    match state.broker.get(id).await {
        Some(conn) if conn.org_id() == identity.org_id => Ok(conn),
        _ => Err(GatewayError::ConnectionNotFound(id.to_string())),
    }
}

async fn agent_get_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, GatewayError> {
    let identity = authenticate(&state, &headers).await?;
    let conn = owned_connection(&state, &identity, &id).await?;
    Ok(Json(conn.snapshot()).into_response())
}

async fn agent_disconnect_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, GatewayError> {
    let identity = authenticate(&state, &headers).await?;
    let conn = owned_connection(&state, &identity, &id).await?;
    state.broker.disconnect(conn.id).await;
    Ok(Json(serde_json::json!({ "status": "disconnected" })).into_response())
}

async fn agent_stats_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, GatewayError> {
    authenticate(&state, &headers).await?;
    Ok(Json(state.broker.stats().await).into_response())
}

async fn agent_ws_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, GatewayError> {
    let identity = authenticate(&state, &headers).await?;
    let conn = owned_connection(&state, &identity, &id).await?;
    if conn.state() != ConnectionState::Connecting {
        return Err(GatewayError::InvalidRequest(
            "connection already has a socket attached".into(),
        ));
    }

    let broker = state.broker.clone();
    let max = broker.settings().max_message_bytes;
    let conn_id = conn.id;
    Ok(ws
        .max_message_size(max)
        .max_frame_size(max)
        .on_upgrade(move |socket| async move {
            if let Err(e) = broker.attach(conn_id, socket).await {
                tracing::warn!(connection_id = %conn_id, error = %e, "websocket attach failed");
            }
        }))
}

async fn health_handler(State(state): State<AppState>) -> Response {
    let json = serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        "uptime_seconds": state.metrics.uptime().as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
    });
    (StatusCode::OK, Json(json)).into_response()
}

/// Ready once at least one backend server is configured.
async fn ready_handler(State(state): State<AppState>) -> Response {
    let servers = state.pipeline.dispatcher().server_names().len();
    let backends = if servers > 0 { "ready" } else { "not_ready" };
    let status = if servers > 0 {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let json = serde_json::json!({
        "status": backends,
        "checks": {
            "backends": backends,
            "policies": if state.policies.is_empty() { "not_ready" } else { "ready" },
        },
        "servers": servers,
    });
    (status, Json(json)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_ip_prefers_first_forwarded_hop() {
        let mut h = HeaderMap::new();
        h.insert("x-real-ip", HeaderValue::from_static("10.0.0.9"));
        assert_eq!(client_ip(&h).as_deref(), Some("10.0.0.9"));
        h.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.7, 10.0.0.1"));
        assert_eq!(client_ip(&h).as_deref(), Some("203.0.113.7"));
        assert!(client_ip(&HeaderMap::new()).is_none());
    }

    #[test]
    fn caller_requires_bearer_scheme() {
        let mut h = HeaderMap::new();
        assert!(matches!(caller_from(&h), Caller::Anonymous));
        h.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert!(matches!(caller_from(&h), Caller::Anonymous));
        h.insert(AUTHORIZATION, HeaderValue::from_static("Bearer gwo_test_x"));
        assert!(matches!(caller_from(&h), Caller::Credential(ref c) if c == "gwo_test_x"));
    }
}
