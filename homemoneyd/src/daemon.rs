use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use homemoney_core::ExpenseClient;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::sync::backoff::Backoff;
use crate::sync::engine::{EngineConfig, SyncEngine, SyncReport};
use crate::sync::index::{IndexStore, default_db_path};
use crate::sync::network::NetworkMonitor;
use crate::sync::scheduler::{DEFAULT_SYNC_INTERVAL, ScheduleConstraints, SyncScheduler};

const DEFAULT_API_URL: &str = "http://127.0.0.1:3010";
const DEFAULT_NETWORK_PROBE_SECS: u64 = 5;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_UPLOAD_CONCURRENCY: u64 = 4;

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub api_url: String,
    pub token: Option<String>,
    pub db_path: PathBuf,
    pub sync_interval: Duration,
    pub network_probe_interval: Duration,
    pub request_timeout: Duration,
    pub upload_concurrency: usize,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        let api_url = std::env::var("HOMEMONEY_API_URL")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());
        let token = std::env::var("HOMEMONEY_TOKEN")
            .ok()
            .filter(|value| !value.trim().is_empty());
        let db_path = match std::env::var("HOMEMONEY_DB_PATH") {
            Ok(value) => expand_with_home(&value, &home),
            Err(_) => default_db_path().context("no data directory for the sync database")?,
        };
        let sync_interval = Duration::from_secs(read_u64_env(
            "HOMEMONEY_SYNC_INTERVAL_SECS",
            DEFAULT_SYNC_INTERVAL.as_secs(),
        ));
        let network_probe_interval = Duration::from_secs(read_u64_env(
            "HOMEMONEY_NETWORK_PROBE_SECS",
            DEFAULT_NETWORK_PROBE_SECS,
        ));
        let request_timeout = Duration::from_secs(read_u64_env(
            "HOMEMONEY_REQUEST_TIMEOUT_SECS",
            DEFAULT_REQUEST_TIMEOUT_SECS,
        ));
        let upload_concurrency =
            read_u64_env("HOMEMONEY_UPLOAD_CONCURRENCY", DEFAULT_UPLOAD_CONCURRENCY) as usize;

        Ok(Self {
            api_url,
            token,
            db_path,
            sync_interval,
            network_probe_interval,
            request_timeout,
            upload_concurrency,
        })
    }

    fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            upload_concurrency: self.upload_concurrency,
            ..EngineConfig::default()
        }
    }
}

/// Snapshot printed by `--status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusSummary {
    pub pending: i64,
    pub last_sync_millis: Option<i64>,
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    client: ExpenseClient,
    engine: Arc<SyncEngine>,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        let client = ExpenseClient::with_timeout(
            &config.api_url,
            config.token.clone(),
            config.request_timeout,
        )
        .with_context(|| format!("invalid api url {:?}", config.api_url))?;
        let index = IndexStore::open(&config.db_path)
            .await
            .with_context(|| format!("failed to open sync database at {:?}", config.db_path))?;
        let engine = Arc::new(
            SyncEngine::new(client.clone(), index).with_config(config.engine_config()),
        );

        Ok(Self {
            config,
            client,
            engine,
        })
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    /// Runs one upload + download pass in the foreground.
    pub async fn sync_once(&self) -> anyhow::Result<SyncReport> {
        self.engine
            .perform_full_sync()
            .await
            .context("sync run failed")
    }

    pub async fn status_summary(&self) -> anyhow::Result<StatusSummary> {
        let pending = self
            .engine
            .pending_count()
            .await
            .context("failed to count pending changes")?;
        let last_sync_millis = self
            .engine
            .last_sync_time()
            .await
            .context("failed to read last sync time")?;
        Ok(StatusSummary {
            pending,
            last_sync_millis,
        })
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!(
            api_url = %self.config.api_url,
            db_path = %self.config.db_path.display(),
            sync_interval_secs = self.config.sync_interval.as_secs(),
            authenticated = self.config.token.is_some(),
            "homemoneyd started"
        );

        let shutdown = CancellationToken::new();
        let (network, monitor_handle) =
            NetworkMonitor::new(self.client.clone(), self.config.network_probe_interval)
                .spawn(shutdown.child_token());
        let scheduler = SyncScheduler::start(
            Arc::clone(&self.engine),
            network,
            Backoff::for_sync_runs(),
        );
        scheduler.schedule_periodic(self.config.sync_interval, ScheduleConstraints::default());

        let engine_for_status = Arc::clone(&self.engine);
        let mut status_rx = self.engine.observe_status();
        let status_handle = tokio::spawn(async move {
            while status_rx.changed().await.is_ok() {
                let status = *status_rx.borrow_and_update();
                if !status.is_terminal() {
                    continue;
                }
                match engine_for_status.pending_count().await {
                    Ok(pending) => info!(status = status.as_str(), pending, "sync status"),
                    Err(err) => warn!(status = status.as_str(), error = %err, "sync status"),
                }
            }
        });

        let signal = tokio::signal::ctrl_c().await;
        info!("shutting down");
        scheduler.cancel_all().await;
        shutdown.cancel();
        if let Err(err) = monitor_handle.await {
            warn!(error = %err, "network monitor ended abnormally");
        }
        status_handle.abort();
        signal.context("failed waiting for shutdown signal")?;

        Ok(())
    }
}

include!("daemon_helpers.rs");

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
