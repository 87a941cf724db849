use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use super::policy::Mode;
use super::{DetectionKind, SafetyError, Severity};

/// Stored copy of the input is cut to this many characters plus `...`.
pub const MAX_STORED_INPUT_CHARS: usize = 500;
pub const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 1000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Detection {
    pub id: String,
    pub org_id: String,
    pub policy_id: String,
    #[serde(rename = "type")]
    pub kind: DetectionKind,
    pub severity: Severity,
    pub pattern: String,
    pub confidence: f32,
    pub input: String,
    pub action: Mode,
    pub trace_id: String,
    pub span_id: String,
    pub mcp_server: String,
    pub tool_name: String,
    pub key_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Durable destination for detections.  Called off the request path.
#[async_trait]
pub trait DetectionSink: Send + Sync {
    async fn append(&self, detection: Detection) -> Result<(), SafetyError>;
}

/// Writes detections to the structured log.
pub struct TracingDetectionSink;

#[async_trait]
impl DetectionSink for TracingDetectionSink {
    async fn append(&self, d: Detection) -> Result<(), SafetyError> {
        tracing::warn!(
            target = "detections",
            detection_id = %d.id,
            org_id = %d.org_id,
            policy_id = %d.policy_id,
            severity = d.severity.as_str(),
            action = d.action.as_str(),
            pattern = %d.pattern,
            server = %d.mcp_server,
            tool = %d.tool_name,
            trace_id = %d.trace_id,
            "prompt injection detected"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DetectionFilter {
    #[serde(default, rename = "type")]
    pub kind: Option<DetectionKind>,
    #[serde(default)]
    pub severity: Option<Severity>,
    #[serde(default)]
    pub action: Option<Mode>,
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
    /// Set by the caller's identity, never from the query string.
    #[serde(skip)]
    pub org_id: Option<String>,
}

impl DetectionFilter {
    fn matches(&self, d: &Detection) -> bool {
        self.org_id.as_deref().map_or(true, |o| d.org_id == o)
            && self.kind.map_or(true, |k| d.kind == k)
            && self.severity.map_or(true, |s| d.severity == s)
            && self.action.map_or(true, |a| d.action == a)
            && self.server.as_deref().map_or(true, |s| d.mcp_server == s)
            && self.since.map_or(true, |t| d.created_at >= t)
            && self.until.map_or(true, |t| d.created_at <= t)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DetectionPage {
    pub detections: Vec<Detection>,
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PatternCount {
    pub pattern: String,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, Default, PartialEq)]
pub struct DetectionSummary {
    pub total: u64,
    pub by_type: BTreeMap<String, u64>,
    pub by_severity: BTreeMap<String, u64>,
    pub by_action: BTreeMap<String, u64>,
    pub top_patterns: Vec<PatternCount>,
}

/// Bounded in-memory history; the oldest entry is evicted when full.
pub struct DetectionLog {
    entries: Mutex<VecDeque<Detection>>,
    capacity: usize,
}

impl DetectionLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, detection: Detection) {
        if let Ok(mut entries) = self.entries.lock() {
            while entries.len() >= self.capacity {
                entries.pop_front();
            }
            entries.push_back(detection);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Most recent first.
    pub fn list(&self, filter: &DetectionFilter) -> DetectionPage {
        let limit = filter
            .limit
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .clamp(1, MAX_LIST_LIMIT);
        let offset = filter.offset.unwrap_or(0);
        let Ok(entries) = self.entries.lock() else {
            return DetectionPage {
                detections: Vec::new(),
                total: 0,
                limit,
                offset,
            };
        };
        let matching: Vec<&Detection> = entries.iter().rev().filter(|d| filter.matches(d)).collect();
        let total = matching.len();
        let detections = matching
            .into_iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect();
        DetectionPage {
            detections,
            total,
            limit,
            offset,
        }
    }

    /// Aggregate counts, optionally restricted to one organization.
    pub fn summary(&self, org_id: Option<&str>) -> DetectionSummary {
        let Ok(entries) = self.entries.lock() else {
            return DetectionSummary::default();
        };
        let mut summary = DetectionSummary::default();
        let mut patterns: HashMap<&str, u64> = HashMap::new();
        for d in entries
            .iter()
            .filter(|d| org_id.map_or(true, |o| d.org_id == o))
        {
            summary.total += 1;
            *summary.by_type.entry(d.kind.as_str().to_string()).or_default() += 1;
            *summary
                .by_severity
                .entry(d.severity.as_str().to_string())
                .or_default() += 1;
            *summary.by_action.entry(d.action.as_str().to_string()).or_default() += 1;
            *patterns.entry(d.pattern.as_str()).or_default() += 1;
        }
        let mut top: Vec<PatternCount> = patterns
            .into_iter()
            .map(|(pattern, count)| PatternCount {
                pattern: pattern.to_string(),
                count,
            })
            .collect();
        top.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.pattern.cmp(&b.pattern)));
        top.truncate(10);
        summary.top_patterns = top;
        summary
    }
}
