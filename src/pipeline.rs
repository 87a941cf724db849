//! Request admission pipeline.
//!
//! Every call, whether it arrives over HTTP or as a `tool_call` frame on an
//! agent connection, runs the same stages in the same order:
//!
//! ```text
//! trace -> panic isolation -> auth -> quota -> safety -> dispatch -> audit
//! ```
//!
//! Any stage may short-circuit.  The audit event is emitted exactly once
//! whatever the exit path, including when the caller drops the future.

use futures_util::FutureExt;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use crate::audit::{AuditEvent, AuditOutcome, AuditSink};
use crate::auth::{AuthResolver, Identity};
use crate::config::FailMode;
use crate::dispatch::{BackendDispatcher, BackendRequest, BackendResponse, McpOperation};
use crate::error::GatewayError;
use crate::metrics::GatewayMetrics;
use crate::notify::{Notification, NotificationSink};
use crate::quota::{QuotaDecision, QuotaTracker};
use crate::safety::{Mode, SafetyScreen, ScreenContext, Severity, Verdict};
use crate::trace::TraceContext;
use crate::util::collect_strings;

/// Who is making the call.
#[derive(Debug, Clone)]
pub enum Caller {
    /// Raw credential from an `Authorization` header.
    Credential(String),
    /// Identity resolved when an agent session was opened.
    Session(Arc<Identity>),
    Anonymous,
}

#[derive(Debug, Clone)]
pub struct InboundCall {
    pub server: String,
    pub operation: McpOperation,
    pub body: Value,
    pub caller: Caller,
    pub trace: TraceContext,
    pub client_ip: Option<String>,
    pub transport: &'static str,
}

#[derive(Debug)]
pub struct PipelineResult {
    pub trace: TraceContext,
    pub quota: Option<QuotaDecision>,
    /// Set when a warn-mode policy flagged the payload.
    pub warning: Option<String>,
    pub result: Result<BackendResponse, GatewayError>,
}

/// Shared collaborators, assembled once at startup.
pub struct PipelineDeps {
    pub auth: Arc<AuthResolver>,
    pub quota: Arc<QuotaTracker>,
    pub safety: Arc<SafetyScreen>,
    pub dispatcher: Arc<dyn BackendDispatcher>,
    pub audit: Arc<dyn AuditSink>,
    pub notifier: Arc<dyn NotificationSink>,
    pub metrics: Arc<GatewayMetrics>,
    pub safety_fail_mode: FailMode,
}

pub struct RequestPipeline {
    deps: PipelineDeps,
}

/// Emits the audit event for one call.  `finish` emits with the final
/// outcome; if the call is dropped first, `Drop` emits a failure.
struct AuditGuard {
    sink: Arc<dyn AuditSink>,
    metrics: Arc<GatewayMetrics>,
    event: Option<AuditEvent>,
    started: Instant,
}

impl AuditGuard {
    fn new(sink: Arc<dyn AuditSink>, metrics: Arc<GatewayMetrics>, call: &InboundCall) -> Self {
        let event = AuditEvent {
            id: uuid::Uuid::new_v4().to_string(),
            schema_version: 1,
            created_at: chrono::Utc::now(),
            action: call.operation.audit_action().to_string(),
            resource: format!("mcp:{}", call.server),
            outcome: AuditOutcome::Failure,
            trace_id: call.trace.trace_id.clone(),
            span_id: call.trace.span_id.clone(),
            server: call.server.clone(),
            tool: call.operation.target(&call.body).map(str::to_string),
            org_id: None,
            key_id: None,
            user_id: None,
            duration_ms: 0,
            error_code: None,
            client_ip: call.client_ip.clone(),
            transport: call.transport.to_string(),
        };
        Self {
            sink,
            metrics,
            event: Some(event),
            started: Instant::now(),
        }
    }

    fn identify(&mut self, identity: &Identity) {
        if let Some(ev) = self.event.as_mut() {
            ev.org_id = Some(identity.org_id.clone());
            ev.key_id = Some(identity.key_id.clone());
            ev.user_id = Some(identity.user_id.clone());
        }
    }

    fn finish(&mut self, outcome: AuditOutcome, error_code: Option<&str>) {
        if let Some(mut ev) = self.event.take() {
            ev.outcome = outcome;
            ev.error_code = error_code.map(str::to_string);
            ev.duration_ms = self.started.elapsed().as_millis() as u64;
            self.metrics.observe(outcome, ev.duration_ms);
            self.sink.emit(ev);
        }
    }
}

impl Drop for AuditGuard {
    fn drop(&mut self) {
        if self.event.is_some() {
            tracing::debug!("call dropped before completion; auditing as cancelled");
            self.finish(AuditOutcome::Failure, Some("cancelled"));
        }
    }
}

#[derive(Default)]
struct StageState {
    quota: Option<QuotaDecision>,
    warning: Option<String>,
}

impl RequestPipeline {
    pub fn new(deps: PipelineDeps) -> Self {
        Self { deps }
    }

    pub fn dispatcher(&self) -> &Arc<dyn BackendDispatcher> {
        &self.deps.dispatcher
    }

    pub fn quota(&self) -> &Arc<QuotaTracker> {
        &self.deps.quota
    }

    pub async fn handle(&self, call: InboundCall) -> PipelineResult {
        let mut audit = AuditGuard::new(
            self.deps.audit.clone(),
            self.deps.metrics.clone(),
            &call,
        );
        let mut state = StageState::default();

        let staged = AssertUnwindSafe(self.run_stages(&call, &mut audit, &mut state))
            .catch_unwind()
            .await;
        let result = match staged {
            Ok(r) => r,
            Err(panic) => {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                self.deps
                    .metrics
                    .panics_total
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                tracing::error!(
                    trace_id = %call.trace.trace_id,
                    server = %call.server,
                    panic = %msg,
                    "pipeline stage panicked"
                );
                Err(GatewayError::InternalError(msg))
            }
        };

        match &result {
            Ok(_) => audit.finish(AuditOutcome::Success, None),
            Err(e) if e.is_block() => audit.finish(AuditOutcome::Blocked, Some(e.code())),
            Err(e) => audit.finish(AuditOutcome::Failure, Some(e.code())),
        }

        PipelineResult {
            trace: call.trace,
            quota: state.quota,
            warning: state.warning,
            result,
        }
    }

    async fn run_stages(
        &self,
        call: &InboundCall,
        audit: &mut AuditGuard,
        state: &mut StageState,
    ) -> Result<BackendResponse, GatewayError> {
        let identity = self.authenticate(&call.caller).await?;
        audit.identify(&identity);
        if !identity.permits(&call.server) {
            return Err(GatewayError::PermissionDenied(format!("mcp:{}", call.server)));
        }

        let decision = self
            .deps
            .quota
            .admit(&identity.quota_key(), identity.rate_limit)
            .await;
        state.quota = Some(decision);
        if !decision.allowed {
            tracing::info!(key_prefix = %identity.key_prefix, limit = decision.limit, "rate limit exceeded");
            return Err(GatewayError::QuotaExceeded {
                limit: decision.limit,
                remaining: decision.remaining,
                reset_seconds: decision.reset_seconds,
            });
        }

        if call.operation == McpOperation::ToolsCall {
            state.warning = self.screen(call, &identity).await?;
        }

        call.operation.validate(&call.body)?;
        if !self.deps.dispatcher.has_server(&call.server) {
            return Err(GatewayError::ServerNotFound(call.server.clone()));
        }
        self.deps
            .dispatcher
            .dispatch(BackendRequest {
                server: call.server.clone(),
                operation: call.operation,
                body: call.body.clone(),
                trace: call.trace.clone(),
                client_ip: call.client_ip.clone(),
            })
            .await
    }

    async fn authenticate(&self, caller: &Caller) -> Result<Arc<Identity>, GatewayError> {
        match caller {
            Caller::Credential(raw) => Ok(self.deps.auth.resolve(raw).await?),
            Caller::Session(identity) if identity.is_expired() => {
                Err(GatewayError::ExpiredCredential)
            }
            Caller::Session(identity) => Ok(identity.clone()),
            Caller::Anonymous => Err(GatewayError::MissingCredential),
        }
    }

    /// Returns a warning for warn-mode detections; errors for block-mode.
    async fn screen(
        &self,
        call: &InboundCall,
        identity: &Identity,
    ) -> Result<Option<String>, GatewayError> {
        let text = call
            .body
            .get("arguments")
            .map(collect_strings)
            .unwrap_or_default();
        if text.is_empty() {
            return Ok(None);
        }
        let ctx = ScreenContext {
            org_id: identity.org_id.clone(),
            key_id: identity.key_id.clone(),
            trace_id: call.trace.trace_id.clone(),
            span_id: call.trace.span_id.clone(),
            server: call.server.clone(),
            tool: call.operation.target(&call.body).unwrap_or_default().to_string(),
            client_ip: call.client_ip.clone(),
        };
        let verdict = match self.deps.safety.screen(&text, None, &ctx).await {
            Ok(v) => v,
            Err(err) => {
                return match self.deps.safety_fail_mode {
                    FailMode::Open => {
                        tracing::error!(error = %err, trace_id = %ctx.trace_id, "safety screen failed; continuing (fail open)");
                        Ok(None)
                    }
                    FailMode::Closed => {
                        tracing::error!(error = %err, trace_id = %ctx.trace_id, "safety screen failed; rejecting (fail closed)");
                        Err(GatewayError::InternalError(format!("safety screen: {err}")))
                    }
                };
            }
        };
        if !verdict.detected {
            return Ok(None);
        }
        match verdict.action {
            Mode::Log => Ok(None),
            Mode::Warn => Ok(Some(verdict.message)),
            Mode::Block => {
                self.notify_block(&verdict, &ctx);
                Err(GatewayError::PolicyViolation {
                    severity: verdict.severity.unwrap_or(Severity::Medium),
                    pattern: verdict.pattern.unwrap_or_default(),
                    message: verdict.message,
                })
            }
        }
    }

    fn notify_block(&self, verdict: &Verdict, ctx: &ScreenContext) {
        let Some(severity) = verdict.severity.filter(|s| *s >= Severity::High) else {
            return;
        };
        let notification = Notification {
            kind: "safety.prompt_injection".into(),
            severity,
            title: format!("Blocked prompt injection on {}", ctx.server),
            message: verdict.message.clone(),
            org_id: ctx.org_id.clone(),
            trace_id: ctx.trace_id.clone(),
            details: serde_json::json!({
                "pattern": verdict.pattern,
                "policy_id": verdict.policy_id,
                "detection_id": verdict.detection_id,
                "tool": ctx.tool,
                "key_id": ctx.key_id,
            }),
            created_at: chrono::Utc::now(),
        };
        let notifier = self.deps.notifier.clone();
        tokio::spawn(async move {
            if let Err(err) = notifier.notify(notification).await {
                tracing::warn!(error = %err, "failed to deliver notification");
            }
        });
    }
}
