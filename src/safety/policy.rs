use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};

use super::{SafetyError, Severity};

/// Sentinel id of the built-in policy.  It can be reconfigured but never
/// removed.
pub const DEFAULT_POLICY_ID: &str = "00000000-0000-0000-0000-000000000001";

const MAX_PATTERNS: usize = 500;
const MAX_PATTERN_LEN: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Sensitivity {
    Permissive,
    #[default]
    Moderate,
    Strict,
}

/// What the pipeline does with a positive verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Log,
    Warn,
    #[default]
    Block,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Log => "log",
            Mode::Warn => "warn",
            Mode::Block => "block",
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyPolicy {
    pub id: String,
    #[serde(default)]
    pub org_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub sensitivity: Sensitivity,
    #[serde(default)]
    pub mode: Mode,
    /// Substrings that flag a payload, evaluated in list order.
    #[serde(default)]
    pub block_patterns: Vec<String>,
    /// Substrings that clear a payload before any block check.
    #[serde(default)]
    pub allow_patterns: Vec<String>,
    /// Backend servers this policy applies to; empty means all.
    #[serde(default)]
    pub servers: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl SafetyPolicy {
    pub fn default_policy() -> Self {
        Self {
            id: DEFAULT_POLICY_ID.to_string(),
            org_id: String::new(),
            name: "Default Policy".to_string(),
            sensitivity: Sensitivity::Moderate,
            mode: Mode::Block,
            block_patterns: DEFAULT_BLOCK_PATTERNS.iter().map(|s| s.to_string()).collect(),
            allow_patterns: DEFAULT_ALLOW_PATTERNS.iter().map(|s| s.to_string()).collect(),
            servers: Vec::new(),
            enabled: true,
        }
    }

    pub fn applies_to(&self, server: &str) -> bool {
        self.servers.is_empty() || self.servers.iter().any(|s| s == server)
    }

    /// Lower-case patterns, drop blanks and oversized entries, cap list
    /// length.  Order is preserved.
    pub fn normalized(mut self) -> Self {
        fn clean(list: &mut Vec<String>, policy_id: &str) {
            let mut out: Vec<String> = Vec::with_capacity(list.len());
            for p in list.drain(..) {
                let p = p.trim().to_lowercase();
                if p.is_empty() {
                    continue;
                }
                if p.len() > MAX_PATTERN_LEN {
                    tracing::warn!(policy_id, len = p.len(), limit = MAX_PATTERN_LEN, "dropping oversized safety pattern");
                    continue;
                }
                out.push(p);
            }
            if out.len() > MAX_PATTERNS {
                tracing::warn!(policy_id, count = out.len(), limit = MAX_PATTERNS, "safety pattern list truncated");
                out.truncate(MAX_PATTERNS);
            }
            *list = out;
        }
        clean(&mut self.block_patterns, &self.id);
        clean(&mut self.allow_patterns, &self.id);
        self
    }
}

/// Severity attached to a block-list match.  Known high-risk families
/// override the sensitivity-derived default.
pub fn severity_for_pattern(pattern: &str, sensitivity: Sensitivity) -> Severity {
    let lower = pattern.to_lowercase();
    if HIGH_FAMILY.iter().any(|f| lower.contains(f)) {
        return Severity::High;
    }
    if CRITICAL_FAMILY.iter().any(|f| lower.contains(f)) {
        return Severity::Critical;
    }
    match sensitivity {
        Sensitivity::Strict => Severity::Medium,
        Sensitivity::Permissive => Severity::Low,
        Sensitivity::Moderate => Severity::Medium,
    }
}

const HIGH_FAMILY: &[&str] = &[
    "jailbreak",
    "dan mode",
    "developer mode",
    "system prompt",
    "bypass",
];

const CRITICAL_FAMILY: &[&str] = &["ignore your programming", "override your"];

pub const DEFAULT_BLOCK_PATTERNS: &[&str] = &[
    "ignore previous instructions",
    "ignore all previous",
    "disregard all prior",
    "disregard previous instructions",
    "forget all previous",
    "forget your instructions",
    "you are now",
    "pretend you are",
    "act as if you",
    "new persona",
    "new role",
    "jailbreak",
    "dan mode",
    "developer mode",
    "ignore your programming",
    "bypass your",
    "override your",
    "system prompt",
    "initial prompt",
    "reveal your prompt",
    "show your instructions",
    "what are your instructions",
];

pub const DEFAULT_ALLOW_PATTERNS: &[&str] = &[
    "summarize the following",
    "please help me",
    "can you explain",
    "what is the",
    "how do i",
];

/// Read-only policy source consumed by the safety screen.
#[async_trait]
pub trait PolicyLookup: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<Arc<SafetyPolicy>>, SafetyError>;

    /// The organization's enabled policy covering `server`, if any.
    async fn for_org(
        &self,
        org_id: &str,
        server: &str,
    ) -> Result<Option<Arc<SafetyPolicy>>, SafetyError>;

    async fn default_policy(&self) -> Result<Option<Arc<SafetyPolicy>>, SafetyError> {
        self.get(DEFAULT_POLICY_ID).await
    }
}

/// Policies loaded at startup.  Organization policies keep config order so
/// the first matching one wins deterministically.
pub struct MemoryPolicyStore {
    by_id: DashMap<String, Arc<SafetyPolicy>>,
    order: RwLock<Vec<String>>,
}

impl MemoryPolicyStore {
    pub fn new(policies: Vec<SafetyPolicy>) -> Self {
        let store = Self {
            by_id: DashMap::new(),
            order: RwLock::new(Vec::new()),
        };
        store.upsert(SafetyPolicy::default_policy());
        for p in policies {
            store.upsert(p);
        }
        store
    }

    pub fn upsert(&self, policy: SafetyPolicy) {
        let policy = policy.normalized();
        let id = policy.id.clone();
        if self.by_id.insert(id.clone(), Arc::new(policy)).is_none() {
            if let Ok(mut order) = self.order.write() {
                order.push(id);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[async_trait]
impl PolicyLookup for MemoryPolicyStore {
    async fn get(&self, id: &str) -> Result<Option<Arc<SafetyPolicy>>, SafetyError> {
        Ok(self.by_id.get(id).map(|p| p.value().clone()))
    }

    async fn for_org(
        &self,
        org_id: &str,
        server: &str,
    ) -> Result<Option<Arc<SafetyPolicy>>, SafetyError> {
        let order = self
            .order
            .read()
            .map_err(|_| SafetyError::Lookup("policy order lock poisoned".into()))?;
        for id in order.iter() {
            if id == DEFAULT_POLICY_ID {
                continue;
            }
            if let Some(p) = self.by_id.get(id) {
                if p.org_id == org_id && p.enabled && p.applies_to(server) {
                    return Ok(Some(p.value().clone()));
                }
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_families() {
        assert_eq!(severity_for_pattern("jailbreak", Sensitivity::Permissive), Severity::High);
        assert_eq!(severity_for_pattern("bypass your", Sensitivity::Moderate), Severity::High);
        assert_eq!(severity_for_pattern("override your", Sensitivity::Moderate), Severity::Critical);
        assert_eq!(severity_for_pattern("new role", Sensitivity::Strict), Severity::Medium);
        assert_eq!(severity_for_pattern("new role", Sensitivity::Permissive), Severity::Low);
        assert_eq!(severity_for_pattern("new role", Sensitivity::Moderate), Severity::Medium);
    }

    #[test]
    fn normalization_keeps_order_and_drops_blanks() {
        let p = SafetyPolicy {
            block_patterns: vec!["  Foo ".into(), "".into(), "BAR".into()],
            ..SafetyPolicy::default_policy()
        }
        .normalized();
        assert_eq!(p.block_patterns, vec!["foo", "bar"]);
    }

    #[tokio::test]
    async fn org_policy_resolution() {
        let scoped = SafetyPolicy {
            id: "p-scoped".into(),
            org_id: "org-a".into(),
            servers: vec!["github".into()],
            ..SafetyPolicy::default_policy()
        };
        let disabled = SafetyPolicy {
            id: "p-off".into(),
            org_id: "org-a".into(),
            enabled: false,
            ..SafetyPolicy::default_policy()
        };
        let store = MemoryPolicyStore::new(vec![disabled, scoped]);
        assert_eq!(store.len(), 3);
        let hit = store.for_org("org-a", "github").await.unwrap().unwrap();
        assert_eq!(hit.id, "p-scoped");
        assert!(store.for_org("org-a", "filesystem").await.unwrap().is_none());
        assert!(store.for_org("org-b", "github").await.unwrap().is_none());
        assert_eq!(
            store.default_policy().await.unwrap().unwrap().id,
            DEFAULT_POLICY_ID
        );
    }
}
