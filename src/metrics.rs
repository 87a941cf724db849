//! In-process counters and Prometheus text exposition.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::audit::AuditOutcome;
use crate::AppState;

/// Latency bucket upper bounds in milliseconds.
const BUCKETS_MS: [u64; 12] = [1, 2, 5, 10, 20, 50, 100, 200, 500, 1000, 2000, 5000];

pub struct GatewayMetrics {
    pub requests_total: AtomicU64,
    pub success_total: AtomicU64,
    pub failure_total: AtomicU64,
    pub blocked_total: AtomicU64,
    pub panics_total: AtomicU64,
    hist_counts: Vec<AtomicU64>,
    hist_sum_ms: AtomicU64,
    hist_count: AtomicU64,
    process_start_epoch: f64,
    process_start_instant: Instant,
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl GatewayMetrics {
    pub fn new() -> Self {
        let start = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            requests_total: AtomicU64::new(0),
            success_total: AtomicU64::new(0),
            failure_total: AtomicU64::new(0),
            blocked_total: AtomicU64::new(0),
            panics_total: AtomicU64::new(0),
            hist_counts: BUCKETS_MS.iter().map(|_| AtomicU64::new(0)).collect(),
            hist_sum_ms: AtomicU64::new(0),
            hist_count: AtomicU64::new(0),
            process_start_epoch: start.as_secs_f64(),
            process_start_instant: Instant::now(),
        }
    }

    pub fn observe(&self, outcome: AuditOutcome, latency_ms: u64) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        match outcome {
            AuditOutcome::Success => &self.success_total,
            AuditOutcome::Failure => &self.failure_total,
            AuditOutcome::Blocked => &self.blocked_total,
        }
        .fetch_add(1, Ordering::Relaxed);
        self.hist_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.hist_count.fetch_add(1, Ordering::Relaxed);
        if let Some(idx) = BUCKETS_MS.iter().position(|ub| latency_ms <= *ub) {
            self.hist_counts[idx].fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn requests(&self) -> u64 {
        self.requests_total.load(Ordering::Relaxed)
    }

    pub fn uptime(&self) -> std::time::Duration {
        self.process_start_instant.elapsed()
    }
}

fn counter(buf: &mut String, name: &str, help: &str, value: u64) {
    writeln!(buf, "# HELP {name} {help}").ok();
    writeln!(buf, "# TYPE {name} counter").ok();
    writeln!(buf, "{name} {value}").ok();
}

fn gauge(buf: &mut String, name: &str, help: &str, value: impl std::fmt::Display) {
    writeln!(buf, "# HELP {name} {help}").ok();
    writeln!(buf, "# TYPE {name} gauge").ok();
    writeln!(buf, "{name} {value}").ok();
}

/// Prometheus-style metrics exposition.
pub async fn metrics_handler(State(state): State<AppState>) -> axum::response::Response {
    let m = &state.metrics;
    let mut buf = String::new();
    let load = |a: &AtomicU64| a.load(Ordering::Relaxed);

    counter(&mut buf, "gatewayops_requests_total", "Calls that entered the pipeline", load(&m.requests_total));
    counter(&mut buf, "gatewayops_success_total", "Calls dispatched successfully", load(&m.success_total));
    counter(&mut buf, "gatewayops_failure_total", "Calls that failed", load(&m.failure_total));
    counter(&mut buf, "gatewayops_blocked_total", "Calls blocked by quota, permission or safety policy", load(&m.blocked_total));
    counter(&mut buf, "gatewayops_panics_total", "Panics caught by the pipeline", load(&m.panics_total));

    writeln!(&mut buf, "# HELP gatewayops_request_latency_ms Pipeline latency histogram milliseconds").ok();
    writeln!(&mut buf, "# TYPE gatewayops_request_latency_ms histogram").ok();
    let mut cumulative: u64 = 0;
    for (i, ub) in BUCKETS_MS.iter().enumerate() {
        cumulative += load(&m.hist_counts[i]);
        writeln!(&mut buf, "gatewayops_request_latency_ms_bucket{{le=\"{}\"}} {}", ub, cumulative).ok();
    }
    let count = load(&m.hist_count);
    writeln!(&mut buf, "gatewayops_request_latency_ms_bucket{{le=\"+Inf\"}} {}", count).ok();
    writeln!(&mut buf, "gatewayops_request_latency_ms_sum {}", load(&m.hist_sum_ms)).ok();
    writeln!(&mut buf, "gatewayops_request_latency_ms_count {}", count).ok();

    let cache = state.auth.cache();
    counter(&mut buf, "gatewayops_identity_cache_hits_total", "Identity cache hits", cache.hits());
    counter(&mut buf, "gatewayops_identity_cache_misses_total", "Identity cache misses", cache.misses());

    counter(&mut buf, "gatewayops_audit_events_total", "Audit events emitted", state.audit.events_total());
    counter(&mut buf, "gatewayops_audit_write_errors_total", "Audit line write failures", state.audit.write_errors_total());
    gauge(&mut buf, "gatewayops_audit_file_size_bytes", "Current audit file size (0 if disabled)", state.audit.file_size_bytes());
    gauge(&mut buf, "gatewayops_detections_buffered", "Detections held in memory", state.safety.detections().len());

    let stats = state.broker.stats().await;
    counter(&mut buf, "gatewayops_connections_total", "Agent connections ever registered", stats.total);
    gauge(&mut buf, "gatewayops_connections_active", "Agent connections currently registered", stats.active);
    counter(&mut buf, "gatewayops_ws_messages_total", "Inbound agent frames processed", stats.messages);
    counter(&mut buf, "gatewayops_ws_outbound_dropped_total", "Outbound agent frames dropped on a full queue", stats.dropped);

    writeln!(&mut buf, "# HELP gatewayops_build_info Build information\n# TYPE gatewayops_build_info gauge").ok();
    writeln!(&mut buf, "gatewayops_build_info{{version=\"{}\"}} 1", env!("CARGO_PKG_VERSION")).ok();
    gauge(&mut buf, "gatewayops_process_start_time_seconds", "Process start time (Unix epoch seconds)", m.process_start_epoch);
    gauge(&mut buf, "gatewayops_process_uptime_seconds", "Process uptime seconds", m.process_start_instant.elapsed().as_secs_f64());

    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        buf,
    )
        .into_response()
}
