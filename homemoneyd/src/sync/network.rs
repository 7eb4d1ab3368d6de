use std::time::Duration;

use homemoney_core::ExpenseClient;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStatus {
    Available,
    Unavailable,
}

impl NetworkStatus {
    pub fn is_available(self) -> bool {
        self == NetworkStatus::Available
    }
}

/// Polls the service health endpoint and publishes reachability changes.
pub struct NetworkMonitor {
    client: ExpenseClient,
    interval: Duration,
}

impl NetworkMonitor {
    pub fn new(client: ExpenseClient, interval: Duration) -> Self {
        Self { client, interval }
    }

    pub async fn probe(&self) -> NetworkStatus {
        match self.client.check_health().await {
            Ok(()) => NetworkStatus::Available,
            Err(err) => {
                debug!(error = %err, "health probe failed");
                NetworkStatus::Unavailable
            }
        }
    }

    /// Starts polling. The channel starts `Unavailable` and the first probe
    /// runs immediately; receivers only see actual transitions.
    pub fn spawn(
        self,
        cancel: CancellationToken,
    ) -> (watch::Receiver<NetworkStatus>, JoinHandle<()>) {
        let (tx, rx) = watch::channel(NetworkStatus::Unavailable);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let status = tokio::select! {
                    _ = cancel.cancelled() => break,
                    status = self.probe() => status,
                };
                let changed = tx.send_if_modified(|known| {
                    if *known == status {
                        false
                    } else {
                        *known = status;
                        true
                    }
                });
                if changed {
                    info!(available = status.is_available(), base_url = %self.client.base_url(), "network status changed");
                }
            }
        });
        (rx, handle)
    }
}
