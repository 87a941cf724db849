#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::Path;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use gatewayops::audit::{AuditEvent, AuditSink};
use gatewayops::auth::{generate_credential, StoredCredential};
use gatewayops::dispatch::{Pricing, ServerConfig};
use gatewayops::{app, build_state, AppConfig, AppState, Backends};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Tracks environment variable mutations and restores originals on drop.
pub struct EnvGuard {
    originals: HashMap<String, Option<String>>,
}

impl EnvGuard {
    pub fn new() -> Self {
        Self {
            originals: HashMap::new(),
        }
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.capture(key);
        std::env::set_var(key, value);
    }

    pub fn set_many(&mut self, entries: &[(&str, &str)]) {
        for (key, value) in entries {
            self.set(key, value);
        }
    }

    pub fn remove(&mut self, key: &str) {
        self.capture(key);
        std::env::remove_var(key);
    }

    fn capture(&mut self, key: &str) {
        if self.originals.contains_key(key) {
            return;
        }
        let original = std::env::var(key).ok();
        self.originals.insert(key.to_string(), original);
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, original) in self.originals.drain() {
            match original {
                Some(value) => std::env::set_var(&key, value),
                None => std::env::remove_var(&key),
            }
        }
    }
}

/// Argon2 parameters cheap enough for tests.
pub fn cheap_params() -> argon2::Params {
    argon2::Params::new(256, 1, 1, None).unwrap()
}

/// Mint a credential for `org_id` with the given quota.
pub fn seed_credential(org_id: &str, rate_limit: u64) -> (String, StoredCredential) {
    let mut generated = generate_credential("test", org_id, "user-1", cheap_params()).unwrap();
    generated.stored.rate_limit = rate_limit;
    (generated.raw, generated.stored)
}

/// A backend tool server.  `tools/call` echoes the tool name; tool `slow`
/// sleeps, tool `fail` returns a 500, tool `panic` is never answered.
pub async fn start_mock_backend() -> (String, JoinHandle<()>) {
    async fn call(headers: HeaderMap, Json(v): Json<Value>) -> axum::response::Response {
        let tool = v.get("tool").and_then(Value::as_str).unwrap_or("").to_string();
        match tool.as_str() {
            "slow" => {
                tokio::time::sleep(Duration::from_millis(1500)).await;
            }
            "fail" => {
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({"message": "tool exploded"})),
                )
                    .into_response();
            }
            _ => {}
        }
        let trace = headers
            .get("x-trace-id")
            .and_then(|h| h.to_str().ok())
            .unwrap_or("")
            .to_string();
        Json(json!({
            "content": [{"type": "text", "text": format!("called {tool}")}],
            "trace": trace,
        }))
        .into_response()
    }
    async fn other(Path(op): Path<(String, String)>) -> Json<Value> {
        Json(json!({"ok": true, "kind": op.0, "op": op.1}))
    }

    let app = Router::new()
        .route("/tools/call", post(call))
        .route("/:kind/:op", post(other));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), handle)
}

pub fn server(name: &str, url: &str) -> ServerConfig {
    ServerConfig {
        name: name.to_string(),
        url: url.to_string(),
        timeout_ms: 1000,
        pricing: Pricing { per_call: 0.0025 },
    }
}

pub fn config_with(servers: Vec<ServerConfig>, credentials: Vec<StoredCredential>) -> AppConfig {
    let mut config = AppConfig::default();
    config.file.servers = servers;
    config.file.credentials = credentials;
    config
}

pub struct TestGateway {
    pub base: String,
    pub addr: std::net::SocketAddr,
    pub state: AppState,
    pub handle: JoinHandle<()>,
}

pub async fn spawn_gateway(config: AppConfig, backends: Backends) -> TestGateway {
    let state = build_state(config, backends).await.unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = app(state.clone());
    let handle = tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    TestGateway {
        base: format!("http://{}", addr),
        addr,
        state,
        handle,
    }
}

/// Audit sink that keeps every event for inspection.
#[derive(Default, Clone)]
pub struct RecordingAudit {
    pub events: Arc<Mutex<Vec<AuditEvent>>>,
}

impl RecordingAudit {
    pub fn snapshot(&self) -> Vec<AuditEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl AuditSink for RecordingAudit {
    fn emit(&self, event: AuditEvent) {
        self.events.lock().unwrap().push(event);
    }
}
