use std::future::Future;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use homemoney_core::{ApiError, ApiErrorClass, ExpenseClient};
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::conflict::{ConflictResolution, SyncConflict};
use super::index::{IndexError, IndexStore};
use super::queue::{MAX_RETRY_COUNT, SyncOperation};
use super::status::{SyncStatus, SyncStatusHandle};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("index error: {0}")]
    Index(#[from] IndexError),
    #[error("api error: {0}")]
    Api(#[from] ApiError),
    #[error("remote service is unreachable: {0}")]
    Unreachable(#[source] ApiError),
    #[error("remote service rejected the credentials: {0}")]
    Unauthorized(#[source] ApiError),
    #[error("sync run was cancelled")]
    Cancelled,
}

impl EngineError {
    /// Maps an API failure that aborts a whole phase.
    pub fn from_api(err: ApiError) -> Self {
        match err.classification() {
            ApiErrorClass::Unreachable => EngineError::Unreachable(err),
            ApiErrorClass::Auth => EngineError::Unauthorized(err),
            _ => EngineError::Api(err),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub upload_batch_size: i64,
    pub download_page_size: u32,
    pub max_retry_count: u32,
    pub upload_concurrency: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            upload_batch_size: 100,
            download_page_size: 100,
            max_retry_count: MAX_RETRY_COUNT,
            upload_concurrency: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FailedSyncItem {
    pub entry_id: i64,
    pub local_id: String,
    pub operation: SyncOperation,
    pub error: String,
    /// The entry was dropped and will not be retried.
    pub permanent: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UploadReport {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Entries left queued behind an earlier failure of the same record.
    pub deferred: usize,
    pub failed_items: Vec<FailedSyncItem>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DownloadReport {
    pub total: u64,
    pub fetched: usize,
    pub new: usize,
    pub updated: usize,
    pub deleted: usize,
    pub requeued: usize,
    pub skipped: usize,
    pub conflicts: Vec<SyncConflict>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncReport {
    pub upload: UploadReport,
    pub download: DownloadReport,
    pub duration: Duration,
}

impl SyncReport {
    pub fn has_conflicts(&self) -> bool {
        !self.download.conflicts.is_empty()
    }
}

pub struct SyncEngine {
    pub(super) client: ExpenseClient,
    pub(super) index: IndexStore,
    pub(super) config: EngineConfig,
    status: SyncStatusHandle,
}

impl SyncEngine {
    pub fn new(client: ExpenseClient, index: IndexStore) -> Self {
        Self {
            client,
            index,
            config: EngineConfig::default(),
            status: SyncStatusHandle::new(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_status(mut self, status: SyncStatusHandle) -> Self {
        self.status = status;
        self
    }

    pub fn index(&self) -> &IndexStore {
        &self.index
    }

    pub async fn perform_full_sync(&self) -> Result<SyncReport, EngineError> {
        self.perform_full_sync_with(&CancellationToken::new()).await
    }

    /// Runs upload then download. Callers must not start overlapping runs;
    /// `SyncScheduler` guarantees that for background work.
    pub async fn perform_full_sync_with(
        &self,
        cancel: &CancellationToken,
    ) -> Result<SyncReport, EngineError> {
        let started = Instant::now();
        self.status.set(SyncStatus::Syncing);

        let result = self.run_phases(cancel, started).await;
        match &result {
            Ok(report) => {
                info!(
                    uploaded = report.upload.succeeded,
                    upload_failed = report.upload.failed,
                    downloaded_new = report.download.new,
                    downloaded_updated = report.download.updated,
                    deleted_locally = report.download.deleted,
                    conflicts = report.download.conflicts.len(),
                    elapsed_ms = report.duration.as_millis() as u64,
                    "sync run finished"
                );
                self.status.set(if report.has_conflicts() {
                    SyncStatus::Conflict
                } else {
                    SyncStatus::Success
                });
            }
            Err(err) => {
                error!(error = %err, "sync run failed");
                self.status.set(SyncStatus::Failed);
            }
        }
        result
    }

    async fn run_phases(
        &self,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<SyncReport, EngineError> {
        let upload = self.upload(cancel).await?;
        let download = self.download(cancel).await?;
        self.index.set_last_sync_millis(now_millis()).await?;
        Ok(SyncReport {
            upload,
            download,
            duration: started.elapsed(),
        })
    }

    pub async fn pending_count(&self) -> Result<i64, EngineError> {
        Ok(self.index.pending_count().await?)
    }

    pub fn observe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    pub fn status(&self) -> SyncStatus {
        self.status.current()
    }

    /// Unix millis of the last fully successful run.
    pub async fn last_sync_time(&self) -> Result<Option<i64>, EngineError> {
        Ok(self.index.last_sync_millis().await?)
    }

    /// Applies user decisions to conflicts reported by a download. Returns
    /// how many were resolved.
    pub async fn resolve_conflicts(&self, conflicts: &[SyncConflict]) -> Result<usize, EngineError> {
        let mut resolved = 0;
        for conflict in conflicts {
            match conflict.resolution {
                ConflictResolution::UseLocal => {
                    let Some(local) = self.index.get_expense(&conflict.local_id).await? else {
                        warn!(local_id = %conflict.local_id, "conflicting record no longer exists");
                        continue;
                    };
                    let payload = local.snapshot().to_json().map_err(IndexError::from)?;
                    self.index
                        .enqueue(
                            conflict.entity_type,
                            &local.local_id,
                            SyncOperation::Update,
                            &payload,
                        )
                        .await?;
                    resolved += 1;
                }
                ConflictResolution::UseServer => {
                    if self
                        .index
                        .accept_server_copy(&conflict.local_id, &conflict.remote_id, &conflict.server)
                        .await?
                    {
                        resolved += 1;
                    } else {
                        warn!(local_id = %conflict.local_id, "conflicting record no longer exists");
                    }
                }
                ConflictResolution::Merge => {
                    warn!(local_id = %conflict.local_id, "merge resolution is not supported, skipping");
                }
            }
        }
        Ok(resolved)
    }

    /// Awaits a remote call unless the run is cancelled first.
    pub(super) async fn remote<T, F>(
        &self,
        cancel: &CancellationToken,
        call: F,
    ) -> Result<Result<T, ApiError>, EngineError>
    where
        F: Future<Output = Result<T, ApiError>>,
    {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(EngineError::Cancelled),
            result = call => Ok(result),
        }
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
#[path = "engine_tests/support.rs"]
mod test_support;

#[cfg(test)]
#[path = "engine_tests/upload.rs"]
mod upload_tests;

#[cfg(test)]
#[path = "engine_tests/download.rs"]
mod download_tests;

#[cfg(test)]
#[path = "engine_tests/full_sync.rs"]
mod full_sync_tests;
