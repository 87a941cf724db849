//! Audit trail.
//!
//! Every call that enters the pipeline produces exactly one [`AuditEvent`].
//! Sinks are fire-and-forget: `emit` never fails the caller and never blocks
//! on anything slower than a local file append.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

mod writer;

pub use writer::RotatingWriter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Success,
    Failure,
    Blocked,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOutcome::Success => "success",
            AuditOutcome::Failure => "failure",
            AuditOutcome::Blocked => "blocked",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEvent {
    pub id: String,
    pub schema_version: u32,
    pub created_at: DateTime<Utc>,
    pub action: String,
    pub resource: String,
    pub outcome: AuditOutcome,
    pub trace_id: String,
    pub span_id: String,
    pub server: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,
    pub transport: String,
}

pub trait AuditSink: Send + Sync {
    fn emit(&self, event: AuditEvent);
}

/// Appends events as JSON lines to a rotating file, or to the tracing log
/// when no file is configured.
#[derive(Clone)]
pub struct JsonlAuditSink {
    writer: Option<Arc<Mutex<RotatingWriter>>>,
    log_stdout: bool,
    events_total: Arc<AtomicU64>,
    lines_total: Arc<AtomicU64>,
    write_errors_total: Arc<AtomicU64>,
    file_size_bytes: Arc<AtomicU64>,
}

impl JsonlAuditSink {
    pub fn new(writer: Option<RotatingWriter>, log_stdout: bool) -> Self {
        Self {
            writer: writer.map(|w| Arc::new(Mutex::new(w))),
            log_stdout,
            events_total: Arc::new(AtomicU64::new(0)),
            lines_total: Arc::new(AtomicU64::new(0)),
            write_errors_total: Arc::new(AtomicU64::new(0)),
            file_size_bytes: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn events_total(&self) -> u64 {
        self.events_total.load(Ordering::Relaxed)
    }

    pub fn lines_total(&self) -> u64 {
        self.lines_total.load(Ordering::Relaxed)
    }

    pub fn write_errors_total(&self) -> u64 {
        self.write_errors_total.load(Ordering::Relaxed)
    }

    pub fn file_size_bytes(&self) -> u64 {
        self.file_size_bytes.load(Ordering::Relaxed)
    }

    fn write_line(&self, line: &str) -> bool {
        let Some(target) = self.writer.as_ref() else {
            return false;
        };
        let Ok(mut guard) = target.lock() else {
            self.write_errors_total.fetch_add(1, Ordering::Relaxed);
            return false;
        };
        match guard.write_line(line) {
            Ok(()) => {
                self.lines_total.fetch_add(1, Ordering::Relaxed);
                if let Some(sz) = guard.current_size() {
                    self.file_size_bytes.store(sz, Ordering::Relaxed);
                }
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, path = %guard.path().display(), "failed to write audit line");
                self.write_errors_total.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }
}

impl AuditSink for JsonlAuditSink {
    fn emit(&self, event: AuditEvent) {
        self.events_total.fetch_add(1, Ordering::Relaxed);
        let wrote = match serde_json::to_string(&event) {
            Ok(line) => self.write_line(&line),
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize audit event");
                self.write_errors_total.fetch_add(1, Ordering::Relaxed);
                false
            }
        };
        if self.writer.is_none() || (wrote && self.log_stdout) {
            tracing::info!(
                target = "audit",
                audit_id = %event.id,
                action = %event.action,
                outcome = event.outcome.as_str(),
                server = %event.server,
                trace_id = %event.trace_id,
                duration_ms = event.duration_ms,
                error_code = ?event.error_code,
                "audit"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(outcome: AuditOutcome) -> AuditEvent {
        AuditEvent {
            id: "a1".into(),
            schema_version: 1,
            created_at: Utc::now(),
            action: "mcp.tool.call".into(),
            resource: "mcp:fs".into(),
            outcome,
            trace_id: "tr".into(),
            span_id: "sp".into(),
            server: "fs".into(),
            tool: Some("read_file".into()),
            org_id: Some("org".into()),
            key_id: Some("key".into()),
            user_id: None,
            duration_ms: 3,
            error_code: None,
            client_ip: None,
            transport: "http".into(),
        }
    }

    #[test]
    fn writes_one_json_line_per_event() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let writer = RotatingWriter::open(&path, None, 1, false).unwrap();
        let sink = JsonlAuditSink::new(Some(writer), false);
        sink.emit(sample(AuditOutcome::Success));
        sink.emit(sample(AuditOutcome::Blocked));
        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let v: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(v["outcome"], "blocked");
        assert_eq!(v["schema_version"], 1);
        assert_eq!(sink.lines_total(), 2);
        assert!(sink.file_size_bytes() > 0);
    }

    #[test]
    fn without_writer_events_are_counted_not_written() {
        let sink = JsonlAuditSink::new(None, false);
        sink.emit(sample(AuditOutcome::Failure));
        assert_eq!(sink.events_total(), 1);
        assert_eq!(sink.lines_total(), 0);
        assert_eq!(sink.write_errors_total(), 0);
    }
}
