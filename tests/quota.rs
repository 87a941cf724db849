use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gatewayops::config::FailMode;
use gatewayops::quota::{
    MemoryWindowStore, QuotaStoreError, QuotaStrategy, QuotaTracker, WindowCount, WindowStore,
};
use gatewayops::Backends;
use serde_json::{json, Value};

mod common;
use common::{config_with, seed_credential, server, spawn_gateway, start_mock_backend};

struct UnreachableStore;

#[async_trait]
impl WindowStore for UnreachableStore {
    async fn admit_sliding(
        &self,
        _key: &str,
        _limit: u64,
        _window: Duration,
        _now_ms: u64,
    ) -> Result<WindowCount, QuotaStoreError> {
        Err(QuotaStoreError::Unavailable("connection refused".into()))
    }

    async fn admit_fixed(
        &self,
        _key: &str,
        _limit: u64,
        _window: Duration,
    ) -> Result<WindowCount, QuotaStoreError> {
        Err(QuotaStoreError::Unavailable("connection refused".into()))
    }
}

fn header(resp: &reqwest::Response, name: &str) -> Option<String> {
    resp.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

async fn call(client: &reqwest::Client, base: &str, raw: &str) -> reqwest::Response {
    client
        .post(format!("{base}/v1/mcp/files/tools/call"))
        .bearer_auth(raw)
        .json(&json!({"tool": "read_file", "arguments": {"path": "/tmp/a"}}))
        .send()
        .await
        .unwrap()
}

#[tokio::test]
async fn second_call_over_limit_is_rejected_with_reset() {
    let (backend, _h) = start_mock_backend().await;
    let (raw, stored) = seed_credential("org-q", 1);
    let gw = spawn_gateway(
        config_with(vec![server("files", &backend)], vec![stored]),
        Backends::default(),
    )
    .await;
    let client = reqwest::Client::new();

    let first = call(&client, &gw.base, &raw).await;
    assert_eq!(first.status(), 200);
    assert_eq!(header(&first, "x-ratelimit-limit").as_deref(), Some("1"));
    assert_eq!(header(&first, "x-ratelimit-remaining").as_deref(), Some("0"));

    let second = call(&client, &gw.base, &raw).await;
    assert_eq!(second.status(), 429);
    let reset: u64 = header(&second, "x-ratelimit-reset").unwrap().parse().unwrap();
    assert!(reset > 0 && reset <= 60);
    assert_eq!(header(&second, "retry-after"), Some(reset.to_string()));
    let body: Value = second.json().await.unwrap();
    assert_eq!(body["code"], "rate_limit_exceeded");
    assert_eq!(body["details"]["remaining"], 0);
}

#[tokio::test]
async fn fixed_window_counts_per_credential() {
    let (backend, _h) = start_mock_backend().await;
    let (raw_a, a) = seed_credential("org-q", 2);
    let (raw_b, b) = seed_credential("org-q", 2);
    let mut config = config_with(vec![server("files", &backend)], vec![a, b]);
    config.quota_strategy = QuotaStrategy::Fixed;
    let gw = spawn_gateway(config, Backends::default()).await;
    let client = reqwest::Client::new();

    assert_eq!(call(&client, &gw.base, &raw_a).await.status(), 200);
    assert_eq!(call(&client, &gw.base, &raw_a).await.status(), 200);
    assert_eq!(call(&client, &gw.base, &raw_a).await.status(), 429);
    assert_eq!(call(&client, &gw.base, &raw_b).await.status(), 200);
}

#[tokio::test]
async fn broken_store_fails_open_by_default() {
    let (backend, _h) = start_mock_backend().await;
    let (raw, stored) = seed_credential("org-q", 1);
    let gw = spawn_gateway(
        config_with(vec![server("files", &backend)], vec![stored]),
        Backends {
            window_store: Some(Arc::new(UnreachableStore)),
            ..Default::default()
        },
    )
    .await;
    let client = reqwest::Client::new();

    for _ in 0..3 {
        assert_eq!(call(&client, &gw.base, &raw).await.status(), 200);
    }
}

#[tokio::test]
async fn broken_store_fails_closed_when_configured() {
    let (backend, _h) = start_mock_backend().await;
    let (raw, stored) = seed_credential("org-q", 5);
    let mut config = config_with(vec![server("files", &backend)], vec![stored]);
    config.quota_fail_mode = FailMode::Closed;
    let gw = spawn_gateway(
        config,
        Backends {
            window_store: Some(Arc::new(UnreachableStore)),
            ..Default::default()
        },
    )
    .await;
    let client = reqwest::Client::new();

    let resp = call(&client, &gw.base, &raw).await;
    assert_eq!(resp.status(), 429);
    assert!(header(&resp, "retry-after").is_some());
}

async fn admit_concurrently(strategy: QuotaStrategy, limit: u64, callers: usize) {
    let tracker = Arc::new(QuotaTracker::new(
        Arc::new(MemoryWindowStore::new()),
        strategy,
        Duration::from_secs(60),
        FailMode::Open,
    ));
    let tasks = (0..callers).map(|_| {
        let tracker = tracker.clone();
        tokio::spawn(async move { tracker.admit("org-c:key-1", limit).await })
    });
    let decisions: Vec<_> = futures_util::future::join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    let mut admitted_remaining: Vec<u64> = decisions
        .iter()
        .filter(|d| d.allowed)
        .map(|d| d.remaining)
        .collect();
    assert_eq!(admitted_remaining.len() as u64, limit, "{strategy:?}");
    admitted_remaining.sort_unstable();
    // Every admission saw a distinct slot.
    assert_eq!(admitted_remaining, (0..limit).collect::<Vec<_>>(), "{strategy:?}");
    for d in decisions.iter().filter(|d| !d.allowed) {
        assert_eq!(d.remaining, 0);
        assert!(d.reset_seconds >= 1);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_sliding_admissions_never_exceed_limit() {
    admit_concurrently(QuotaStrategy::Sliding, 10, 200).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_fixed_admissions_never_exceed_limit() {
    admit_concurrently(QuotaStrategy::Fixed, 10, 200).await;
}
