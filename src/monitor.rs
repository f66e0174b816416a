//! Background network monitor.
//!
//! Polls a reachability check on a fixed interval and hands every result to
//! a [`NetworkListener`]; transitions are logged here. Stops through a
//! [`CancellationToken`].

use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::backends::http;
use crate::error::StoreResult;
use crate::model::BackendKind;

const CHECK_TIMEOUT: Duration = Duration::from_secs(5);

#[async_trait]
pub trait NetworkCheck: Send + Sync {
    async fn is_online(&self) -> bool;
}

/// HEAD request against a known URL. Any HTTP response means the network
/// path is up; only transport failures count as offline.
pub struct HttpNetworkCheck {
    url: String,
    client: Client,
}

impl HttpNetworkCheck {
    pub fn new(url: &str) -> StoreResult<Self> {
        Ok(Self {
            url: http::normalize_base_url(url),
            client: http::build_client(BackendKind::Local, CHECK_TIMEOUT)?,
        })
    }
}

#[async_trait]
impl NetworkCheck for HttpNetworkCheck {
    async fn is_online(&self) -> bool {
        match self.client.head(&self.url).send().await {
            Ok(_) => true,
            Err(e) => {
                debug!(url = %self.url, error = %e, "Network check failed");
                false
            }
        }
    }
}

/// Receives every network check result.
#[async_trait]
pub trait NetworkListener: Send + Sync {
    async fn on_network_check(&self, online: bool);
}

pub struct MonitorHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl MonitorHandle {
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Stop the monitor and wait for the task to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.join.await;
    }
}

/// Spawn the monitor loop. `initially_online` is the state transitions are
/// measured against on the first check.
pub fn start_network_monitor(
    listener: Arc<dyn NetworkListener>,
    check: Arc<dyn NetworkCheck>,
    interval: Duration,
    initially_online: bool,
) -> MonitorHandle {
    let cancel = CancellationToken::new();
    let token = cancel.clone();

    let join = tokio::spawn(async move {
        info!("Network monitor started (interval: {}s)", interval.as_secs());
        let mut previous_online = initially_online;

        loop {
            let online = tokio::select! {
                _ = token.cancelled() => break,
                online = check.is_online() => online,
            };

            if online != previous_online {
                if online {
                    info!("Network restored");
                } else {
                    info!("Network offline; writes will be kept locally");
                }
            }
            previous_online = online;

            listener.on_network_check(online).await;

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        info!("Network monitor stopped");
    });

    MonitorHandle { cancel, join }
}
