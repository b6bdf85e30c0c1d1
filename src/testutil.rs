//! Shared helpers for in-crate tests.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::Config;
use crate::edge::EdgeClient;
use crate::runner::RunnerHost;

/// Config pointed at a mock control plane, with fast timers and all state
/// under a temp directory.
pub(crate) fn test_config(edge_url: &str, base: &Path, overrides: &[(&str, &str)]) -> Config {
    let defaults: Vec<(&str, String)> = vec![
        ("EDGE_BASE_URL", edge_url.to_string()),
        ("WORKER_SECRET", "test-secret".to_string()),
        ("AUTH_BASE", base.join("auth").display().to_string()),
        ("MEDIA_BASE", base.join("media").display().to_string()),
        ("QUEUE_POLL_MS", "50".to_string()),
        ("DISCOVERY_POLL_MS", "100".to_string()),
        ("HTTP_TIMEOUT_MS", "5000".to_string()),
    ];
    Config::from_lookup(|name| {
        overrides
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.to_string())
            .or_else(|| {
                defaults
                    .iter()
                    .find(|(k, _)| *k == name)
                    .map(|(_, v)| v.clone())
            })
    })
    .expect("test config must parse")
}

pub(crate) fn test_edge(edge_url: &str) -> Arc<EdgeClient> {
    Arc::new(EdgeClient::new(
        reqwest::Client::new(),
        edge_url.to_string(),
        "test-secret".into(),
    ))
}

/// Host that always wants the session and never resets anything.
pub(crate) struct StaticHost;

#[async_trait]
impl RunnerHost for StaticHost {
    fn is_desired(&self, _session_id: &str) -> bool {
        true
    }

    async fn reset_runtime(&self, _session_id: &str) {}

    async fn ensure_running(&self, _session_id: &str) {}
}

pub(crate) fn static_host() -> Arc<dyn RunnerHost> {
    Arc::new(StaticHost)
}

/// Poll until `probe` returns true or the timeout elapses.
pub(crate) async fn wait_for<F>(timeout: std::time::Duration, mut probe: F) -> bool
where
    F: AsyncFnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if probe().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
}
