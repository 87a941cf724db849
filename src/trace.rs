//! Trace and span identifiers attached to every call.

use axum::http::HeaderMap;
use serde::Serialize;

pub const TRACE_HEADER: &str = "x-trace-id";
pub const SPAN_HEADER: &str = "x-span-id";

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TraceContext {
    pub trace_id: String,
    pub span_id: String,
}

impl TraceContext {
    /// Fresh trace with a fresh span.
    pub fn new() -> Self {
        Self {
            trace_id: new_trace_id(),
            span_id: new_span_id(),
        }
    }

    /// Continue an inbound trace when the caller supplied one; the span is
    /// always local.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let inbound = headers
            .get(TRACE_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty() && v.len() <= 128);
        match inbound {
            Some(trace_id) => Self {
                trace_id: trace_id.to_string(),
                span_id: new_span_id(),
            },
            None => Self::new(),
        }
    }

    /// Child span within the same trace, used for tool calls arriving over a
    /// long-lived connection.
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            span_id: new_span_id(),
        }
    }
}

impl Default for TraceContext {
    fn default() -> Self {
        Self::new()
    }
}

fn new_trace_id() -> String {
    let millis = chrono::Utc::now().timestamp_millis() as u64 & 0xffff_ffff_ffff;
    let random: [u8; 8] = rand::random();
    format!("tr_{:012x}_{}", millis, hex::encode(random))
}

fn new_span_id() -> String {
    let random: [u8; 8] = rand::random();
    format!("sp_{}", hex::encode(random))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn generated_ids_have_expected_shape() {
        let ctx = TraceContext::new();
        let parts: Vec<&str> = ctx.trace_id.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "tr");
        assert_eq!(parts[1].len(), 12);
        assert_eq!(parts[2].len(), 16);
        assert!(ctx.span_id.starts_with("sp_"));
        assert_eq!(ctx.span_id.len(), 19);
    }

    #[test]
    fn inbound_trace_is_reused() {
        let mut headers = HeaderMap::new();
        headers.insert(TRACE_HEADER, HeaderValue::from_static("tr_upstream"));
        let ctx = TraceContext::from_headers(&headers);
        assert_eq!(ctx.trace_id, "tr_upstream");
        let child = ctx.child();
        assert_eq!(child.trace_id, "tr_upstream");
        assert_ne!(child.span_id, ctx.span_id);
    }
}
