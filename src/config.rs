use std::env;
use std::fs;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use crate::auth::StoredCredential;
use crate::dispatch::ServerConfig;
use crate::quota::QuotaStrategy;
use crate::safety::SafetyPolicy;

/// What to do when a dependency (quota store, safety screen) errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailMode {
    #[default]
    Open,
    Closed,
}

impl std::str::FromStr for FailMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open" => Ok(FailMode::Open),
            "closed" => Ok(FailMode::Closed),
            other => Err(format!("unknown fail mode '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RotationConfig {
    pub max_bytes: Option<u64>,
    pub keep: usize,
    pub compress: bool,
}

/// Contents of the `GATEWAY_CONFIG` file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatewayFile {
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
    #[serde(default)]
    pub credentials: Vec<StoredCredential>,
    #[serde(default)]
    pub policies: Vec<SafetyPolicy>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub file: GatewayFile,
    pub public_host: String,
    pub default_rate_limit: u64,
    pub quota_window: Duration,
    pub quota_strategy: QuotaStrategy,
    pub quota_fail_mode: FailMode,
    pub safety_fail_mode: FailMode,
    pub redis_url: Option<String>,
    pub identity_cache_ttl: Duration,
    pub max_request_bytes: Option<usize>,
    pub max_inflight_calls: usize,
    pub detection_buffer: usize,
    pub notify_webhook: Option<String>,
    pub audit_log_file: Option<String>,
    pub rotation: RotationConfig,
    pub log_stdout: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            file: GatewayFile::default(),
            public_host: "localhost:8080".to_string(),
            default_rate_limit: 1000,
            quota_window: Duration::from_secs(60),
            quota_strategy: QuotaStrategy::Sliding,
            quota_fail_mode: FailMode::Open,
            safety_fail_mode: FailMode::Open,
            redis_url: None,
            identity_cache_ttl: Duration::from_secs(300),
            max_request_bytes: None,
            max_inflight_calls: 32,
            detection_buffer: 1000,
            notify_webhook: None,
            audit_log_file: None,
            rotation: RotationConfig {
                max_bytes: None,
                keep: 1,
                compress: false,
            },
            log_stdout: false,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let file = if let Ok(path) = env::var("GATEWAY_CONFIG") {
            let content = fs::read_to_string(&path).with_context(|| {
                format!("Failed to read GATEWAY_CONFIG '{}': file unreadable", path)
            })?;
            serde_json::from_str::<GatewayFile>(&content).with_context(|| {
                format!(
                    "Failed to parse GATEWAY_CONFIG '{}': invalid JSON configuration",
                    path
                )
            })?
        } else {
            GatewayFile::default()
        };

        let public_host = non_empty_var("GATEWAY_PUBLIC_HOST")
            .unwrap_or_else(|| "localhost:8080".to_string());
        let default_rate_limit = parse_optional_u64("GATEWAY_DEFAULT_RATE_LIMIT")?
            .filter(|n| *n > 0)
            .unwrap_or(1000);
        let quota_window_secs = parse_optional_u64("GATEWAY_QUOTA_WINDOW_SECS")?.unwrap_or(60);
        if quota_window_secs == 0 {
            return Err(anyhow!("GATEWAY_QUOTA_WINDOW_SECS must be greater than zero"));
        }
        let quota_strategy = parse_enum_env::<QuotaStrategy>("GATEWAY_QUOTA_STRATEGY")?
            .unwrap_or_default();
        let quota_fail_mode = parse_enum_env::<FailMode>("GATEWAY_QUOTA_FAIL_MODE")?
            .unwrap_or_default();
        let safety_fail_mode = parse_enum_env::<FailMode>("GATEWAY_SAFETY_FAIL_MODE")?
            .unwrap_or_default();
        let identity_cache_ttl =
            parse_optional_u64("GATEWAY_IDENTITY_CACHE_TTL_SECS")?.unwrap_or(300);
        let max_request_bytes =
            parse_optional_u64("GATEWAY_MAX_REQUEST_BYTES")?.map(|v| v as usize);
        let max_inflight_calls = parse_optional_u64("GATEWAY_MAX_INFLIGHT_CALLS")?
            .filter(|n| *n > 0)
            .unwrap_or(32) as usize;
        let detection_buffer = parse_optional_u64("GATEWAY_DETECTION_BUFFER")?
            .filter(|n| *n > 0)
            .unwrap_or(1000) as usize;

        let rotation = RotationConfig {
            max_bytes: parse_optional_u64("LOG_MAX_BYTES")?,
            keep: parse_optional_u64("LOG_ROTATE_KEEP")?.unwrap_or(1) as usize,
            compress: parse_bool_env("LOG_ROTATE_COMPRESS")?.unwrap_or(false),
        };

        Ok(Self {
            file,
            public_host,
            default_rate_limit,
            quota_window: Duration::from_secs(quota_window_secs),
            quota_strategy,
            quota_fail_mode,
            safety_fail_mode,
            redis_url: non_empty_var("GATEWAY_REDIS_URL"),
            identity_cache_ttl: Duration::from_secs(identity_cache_ttl),
            max_request_bytes,
            max_inflight_calls,
            detection_buffer,
            notify_webhook: non_empty_var("GATEWAY_NOTIFY_WEBHOOK"),
            audit_log_file: non_empty_var("AUDIT_LOG_FILE"),
            rotation,
            log_stdout: parse_bool_env("GATEWAY_LOG_STDOUT")?.unwrap_or(false),
        })
    }
}

fn non_empty_var(var: &str) -> Option<String> {
    env::var(var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_optional_u64(var: &str) -> Result<Option<u64>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a positive integer", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_bool_env(var: &str) -> Result<Option<bool>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value)
            .map(Some)
            .ok_or_else(|| anyhow!("{} must be a boolean (true/false/1/0)", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_enum_env<T>(var: &str) -> Result<Option<T>>
where
    T: std::str::FromStr<Err = String>,
{
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => value
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow!("{}: {}", var, e)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use once_cell::sync::Lazy;
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    static ENV_MUTEX: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

    const VARS: &[&str] = &[
        "GATEWAY_CONFIG",
        "GATEWAY_PUBLIC_HOST",
        "GATEWAY_DEFAULT_RATE_LIMIT",
        "GATEWAY_QUOTA_WINDOW_SECS",
        "GATEWAY_QUOTA_STRATEGY",
        "GATEWAY_QUOTA_FAIL_MODE",
        "GATEWAY_SAFETY_FAIL_MODE",
        "GATEWAY_REDIS_URL",
        "GATEWAY_IDENTITY_CACHE_TTL_SECS",
        "GATEWAY_MAX_REQUEST_BYTES",
        "GATEWAY_MAX_INFLIGHT_CALLS",
        "GATEWAY_DETECTION_BUFFER",
        "GATEWAY_NOTIFY_WEBHOOK",
        "AUDIT_LOG_FILE",
        "LOG_MAX_BYTES",
        "LOG_ROTATE_KEEP",
        "LOG_ROTATE_COMPRESS",
        "GATEWAY_LOG_STDOUT",
    ];

    fn clear() {
        for v in VARS {
            std::env::remove_var(v);
        }
    }

    #[test]
    fn parses_environment_defaults() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear();

        let cfg = AppConfig::from_env().unwrap();
        assert!(cfg.file.servers.is_empty());
        assert_eq!(cfg.public_host, "localhost:8080");
        assert_eq!(cfg.default_rate_limit, 1000);
        assert_eq!(cfg.quota_window, Duration::from_secs(60));
        assert_eq!(cfg.quota_strategy, QuotaStrategy::Sliding);
        assert_eq!(cfg.quota_fail_mode, FailMode::Open);
        assert_eq!(cfg.safety_fail_mode, FailMode::Open);
        assert_eq!(cfg.identity_cache_ttl, Duration::from_secs(300));
        assert_eq!(cfg.max_inflight_calls, 32);
        assert_eq!(cfg.detection_buffer, 1000);
        assert_eq!(cfg.rotation.keep, 1);
        assert!(cfg.redis_url.is_none());
        assert!(!cfg.log_stdout);
    }

    #[test]
    fn parses_full_configuration() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear();

        let mut temp = NamedTempFile::new().unwrap();
        let config = serde_json::json!({
            "servers": [{"name": "filesystem", "url": "http://127.0.0.1:9000/", "pricing": {"per_call": 0.002}}],
            "credentials": [],
            "policies": [{"id": "p1", "org_id": "org", "mode": "warn", "block_patterns": ["Secret Word"]}]
        });
        use std::io::Write;
        write!(temp, "{}", config).unwrap();

        std::env::set_var("GATEWAY_CONFIG", temp.path());
        std::env::set_var("GATEWAY_PUBLIC_HOST", "gw.example.com");
        std::env::set_var("GATEWAY_DEFAULT_RATE_LIMIT", "50");
        std::env::set_var("GATEWAY_QUOTA_WINDOW_SECS", "10");
        std::env::set_var("GATEWAY_QUOTA_STRATEGY", "fixed");
        std::env::set_var("GATEWAY_QUOTA_FAIL_MODE", "closed");
        std::env::set_var("GATEWAY_SAFETY_FAIL_MODE", "CLOSED");
        std::env::set_var("GATEWAY_MAX_REQUEST_BYTES", "2048");
        std::env::set_var("GATEWAY_MAX_INFLIGHT_CALLS", "4");
        std::env::set_var("AUDIT_LOG_FILE", "/tmp/audit.jsonl");
        std::env::set_var("LOG_MAX_BYTES", "1024");
        std::env::set_var("LOG_ROTATE_KEEP", "5");
        std::env::set_var("LOG_ROTATE_COMPRESS", "true");
        std::env::set_var("GATEWAY_LOG_STDOUT", "1");

        let cfg = AppConfig::from_env().unwrap();
        assert_eq!(cfg.file.servers.len(), 1);
        assert_eq!(cfg.file.servers[0].timeout_ms, 30_000);
        assert_eq!(cfg.file.policies[0].block_patterns, vec!["Secret Word"]);
        assert_eq!(cfg.public_host, "gw.example.com");
        assert_eq!(cfg.default_rate_limit, 50);
        assert_eq!(cfg.quota_window, Duration::from_secs(10));
        assert_eq!(cfg.quota_strategy, QuotaStrategy::Fixed);
        assert_eq!(cfg.quota_fail_mode, FailMode::Closed);
        assert_eq!(cfg.safety_fail_mode, FailMode::Closed);
        assert_eq!(cfg.max_request_bytes, Some(2048));
        assert_eq!(cfg.max_inflight_calls, 4);
        assert_eq!(cfg.audit_log_file.as_deref(), Some("/tmp/audit.jsonl"));
        assert_eq!(cfg.rotation.max_bytes, Some(1024));
        assert_eq!(cfg.rotation.keep, 5);
        assert!(cfg.rotation.compress);
        assert!(cfg.log_stdout);

        clear();
    }

    #[test]
    fn invalid_values_name_the_variable() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear();

        std::env::set_var("GATEWAY_QUOTA_STRATEGY", "leaky");
        let err = AppConfig::from_env().unwrap_err().to_string();
        assert!(err.contains("GATEWAY_QUOTA_STRATEGY"), "{err}");
        clear();

        std::env::set_var("GATEWAY_QUOTA_WINDOW_SECS", "0");
        assert!(AppConfig::from_env().is_err());
        clear();

        std::env::set_var("GATEWAY_LOG_STDOUT", "maybe");
        let err = AppConfig::from_env().unwrap_err().to_string();
        assert!(err.contains("GATEWAY_LOG_STDOUT"), "{err}");
        clear();
    }
}
