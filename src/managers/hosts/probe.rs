use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResult {
    pub success: bool,
    pub host_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub message: String,
}

impl StatusResult {
    pub fn reachable(host_id: &str, latency_ms: u64) -> Self {
        Self {
            success: true,
            host_id: host_id.to_string(),
            latency_ms: Some(latency_ms),
            error: None,
            message: format!("Connected to {} in {}ms", host_id, latency_ms),
        }
    }

    pub fn unreachable(host_id: &str, error: impl Into<String>) -> Self {
        Self {
            success: false,
            host_id: host_id.to_string(),
            latency_ms: None,
            error: Some(error.into()),
            message: format!("Connection to {} failed", host_id),
        }
    }
}

type SharedProbe = Shared<BoxFuture<'static, StatusResult>>;

/// Collapses concurrent probes of one host into a single in-flight future.
///
/// The probe runs as its own task, so it completes and leaves the in-flight
/// map even when every caller stops waiting.
#[derive(Clone, Default)]
pub struct ProbeDeduplicator {
    in_flight: Arc<Mutex<HashMap<String, SharedProbe>>>,
}

impl ProbeDeduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Joins the probe already running for `host_id`, or starts `probe`.
    pub fn run<F, Fut>(&self, host_id: &str, probe: F) -> SharedProbe
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = StatusResult> + Send + 'static,
    {
        let mut in_flight = self.lock();
        if let Some(existing) = in_flight.get(host_id) {
            return existing.clone();
        }

        let map = self.in_flight.clone();
        let key = host_id.to_string();
        let task = tokio::spawn({
            let key = key.clone();
            let fut = probe();
            async move {
                let result = fut.await;
                map.lock()
                    .unwrap_or_else(|err| err.into_inner())
                    .remove(&key);
                result
            }
        });
        let shared = async move {
            task.await.unwrap_or_else(|err| {
                StatusResult::unreachable(&key, format!("probe task failed: {}", err))
            })
        }
        .boxed()
        .shared();
        in_flight.insert(host_id.to_string(), shared.clone());
        shared
    }

    pub fn in_flight(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, SharedProbe>> {
        self.in_flight.lock().unwrap_or_else(|err| err.into_inner())
    }
}
