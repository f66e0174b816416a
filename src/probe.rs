//! Connectivity probe: one bounded health check per backend.

use serde::Serialize;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::backends::BackendAdapter;
use crate::model::BackendKind;

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(5000);

/// Error reported when the deadline fires before the health check resolves.
pub const TIMEOUT_ERROR: &str = "timeout";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectivityResult {
    pub backend: BackendKind,
    pub reachable: bool,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ConnectivityResult {
    pub fn unreachable(backend: BackendKind, error: impl Into<String>) -> Self {
        Self {
            backend,
            reachable: false,
            latency_ms: 0,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Elapsed;

/// Race `fut` against a deadline. The future is dropped on timeout; any
/// request it had in flight is abandoned, not cancelled at the transport.
pub async fn with_timeout<F: Future>(fut: F, limit: Duration) -> Result<F::Output, Elapsed> {
    tokio::time::timeout(limit, fut).await.map_err(|_| Elapsed)
}

/// Probe one backend. Never fails: every error becomes `reachable = false`.
pub async fn probe_backend(adapter: &dyn BackendAdapter, limit: Duration) -> ConnectivityResult {
    let backend = adapter.kind();
    let start = Instant::now();
    let outcome = with_timeout(adapter.health_check(), limit).await;
    let latency_ms = start.elapsed().as_millis() as u64;

    let result = match outcome {
        Ok(Ok(())) => ConnectivityResult {
            backend,
            reachable: true,
            latency_ms,
            error: None,
        },
        Ok(Err(e)) => ConnectivityResult {
            backend,
            reachable: false,
            latency_ms,
            error: Some(e.to_string()),
        },
        Err(Elapsed) => ConnectivityResult {
            backend,
            reachable: false,
            latency_ms,
            error: Some(TIMEOUT_ERROR.to_string()),
        },
    };
    debug!(
        backend = %backend,
        reachable = result.reachable,
        latency_ms,
        error = result.error.as_deref().unwrap_or(""),
        "Probe finished"
    );
    result
}
