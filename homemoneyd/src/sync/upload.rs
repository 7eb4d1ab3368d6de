use std::collections::HashMap;

use futures_util::future::join_all;
use homemoney_core::{ApiError, ApiErrorClass};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::engine::{EngineError, FailedSyncItem, SyncEngine, UploadReport};
use super::queue::{EntityType, ExpenseSnapshot, OutboxEntry, SyncOperation};

enum EntryOutcome {
    Uploaded,
    Skipped,
    /// Removed from the outbox without reaching the server.
    Dropped(FailedSyncItem),
    /// Still queued; later entries of the same record must wait.
    Retained(FailedSyncItem),
}

#[derive(Default)]
struct GroupOutcome {
    succeeded: usize,
    skipped: usize,
    deferred: usize,
    failed_items: Vec<FailedSyncItem>,
}

impl SyncEngine {
    /// Pushes one batch of queued local changes to the server.
    pub async fn upload(&self, cancel: &CancellationToken) -> Result<UploadReport, EngineError> {
        let batch = self.index.next_batch(self.config.upload_batch_size).await?;
        let mut report = UploadReport {
            total: batch.len(),
            ..UploadReport::default()
        };
        if batch.is_empty() {
            debug!("outbox is empty");
            return Ok(report);
        }

        let phase = cancel.child_token();
        let limit = Semaphore::new(self.config.upload_concurrency.max(1));
        let results = join_all(group_by_record(batch).into_iter().map(|group| {
            let limit = &limit;
            let phase = &phase;
            async move {
                let _permit = limit.acquire().await.map_err(|_| EngineError::Cancelled)?;
                let result = self.upload_group(group, phase).await;
                if result.is_err() {
                    phase.cancel();
                }
                result
            }
        }))
        .await;

        let mut fatal: Option<EngineError> = None;
        for result in results {
            match result {
                Ok(outcome) => {
                    report.succeeded += outcome.succeeded;
                    report.skipped += outcome.skipped;
                    report.deferred += outcome.deferred;
                    report.failed += outcome.failed_items.len();
                    report.failed_items.extend(outcome.failed_items);
                }
                Err(err) => {
                    let replace = match &fatal {
                        None => true,
                        Some(EngineError::Cancelled) => !matches!(err, EngineError::Cancelled),
                        Some(_) => false,
                    };
                    if replace {
                        fatal = Some(err);
                    }
                }
            }
        }
        if let Some(err) = fatal {
            return Err(err);
        }

        info!(
            total = report.total,
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            deferred = report.deferred,
            "upload phase finished"
        );
        Ok(report)
    }

    async fn upload_group(
        &self,
        group: Vec<OutboxEntry>,
        cancel: &CancellationToken,
    ) -> Result<GroupOutcome, EngineError> {
        let mut outcome = GroupOutcome::default();
        let mut entries = group.into_iter();
        while let Some(entry) = entries.next() {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            match self.upload_entry(&entry, cancel).await? {
                EntryOutcome::Uploaded => outcome.succeeded += 1,
                EntryOutcome::Skipped => outcome.skipped += 1,
                EntryOutcome::Dropped(item) => outcome.failed_items.push(item),
                EntryOutcome::Retained(item) => {
                    outcome.failed_items.push(item);
                    outcome.deferred += entries.len();
                    break;
                }
            }
        }
        Ok(outcome)
    }

    async fn upload_entry(
        &self,
        entry: &OutboxEntry,
        cancel: &CancellationToken,
    ) -> Result<EntryOutcome, EngineError> {
        let snapshot = match ExpenseSnapshot::from_json(&entry.payload) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                return self
                    .drop_entry(entry, format!("unreadable payload: {err}"))
                    .await;
            }
        };
        match entry.operation {
            SyncOperation::Create | SyncOperation::Update => {
                self.push_expense(entry, &snapshot, cancel).await
            }
            SyncOperation::Delete => self.push_delete(entry, &snapshot, cancel).await,
        }
    }

    async fn push_expense(
        &self,
        entry: &OutboxEntry,
        snapshot: &ExpenseSnapshot,
        cancel: &CancellationToken,
    ) -> Result<EntryOutcome, EngineError> {
        let Some(local) = self.index.get_expense(&entry.local_id).await? else {
            debug!(entry_id = entry.id, local_id = %entry.local_id, "record is gone, dropping obsolete entry");
            self.index.remove(entry.id).await?;
            return Ok(EntryOutcome::Skipped);
        };

        let dto = snapshot.to_dto();
        let result = match local.remote_id.as_deref() {
            Some(remote_id) => self
                .remote(cancel, self.client.update_expense(remote_id, &dto))
                .await?
                .map(|()| None),
            None => self
                .remote(cancel, self.client.create_expense(&dto))
                .await?
                .map(Some),
        };

        match result {
            Ok(remote_id) => {
                let synced = self
                    .index
                    .complete_upload(entry, remote_id.as_deref())
                    .await?;
                debug!(
                    entry_id = entry.id,
                    local_id = %entry.local_id,
                    operation = entry.operation.as_str(),
                    synced,
                    "uploaded"
                );
                Ok(EntryOutcome::Uploaded)
            }
            Err(err) => self.handle_failure(entry, err).await,
        }
    }

    async fn push_delete(
        &self,
        entry: &OutboxEntry,
        snapshot: &ExpenseSnapshot,
        cancel: &CancellationToken,
    ) -> Result<EntryOutcome, EngineError> {
        let remote_id = self
            .index
            .get_expense(&entry.local_id)
            .await?
            .and_then(|local| local.remote_id)
            .or_else(|| snapshot.remote_id.clone());
        let Some(remote_id) = remote_id else {
            debug!(entry_id = entry.id, local_id = %entry.local_id, "record never reached the server");
            self.index.remove(entry.id).await?;
            return Ok(EntryOutcome::Skipped);
        };

        match self
            .remote(cancel, self.client.delete_expense(&remote_id))
            .await?
        {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {
                debug!(remote_id = %remote_id, "already deleted on server");
            }
            Err(err) => return self.handle_failure(entry, err).await,
        }
        self.index.remove(entry.id).await?;
        debug!(entry_id = entry.id, remote_id = %remote_id, "deleted remotely");
        Ok(EntryOutcome::Uploaded)
    }

    async fn handle_failure(
        &self,
        entry: &OutboxEntry,
        err: ApiError,
    ) -> Result<EntryOutcome, EngineError> {
        match err.classification() {
            ApiErrorClass::Unreachable | ApiErrorClass::Auth => Err(EngineError::from_api(err)),
            ApiErrorClass::Transient | ApiErrorClass::RateLimit => {
                match self.index.increment_retry(entry.id).await? {
                    Some(attempts) if attempts > self.config.max_retry_count => {
                        warn!(
                            entry_id = entry.id,
                            local_id = %entry.local_id,
                            attempts,
                            error = %err,
                            "giving up on entry"
                        );
                        self.index.remove(entry.id).await?;
                        Ok(EntryOutcome::Dropped(failed_item(entry, err.to_string(), true)))
                    }
                    attempts => {
                        debug!(
                            entry_id = entry.id,
                            attempts = attempts.unwrap_or_default(),
                            error = %err,
                            "upload failed, will retry"
                        );
                        Ok(EntryOutcome::Retained(failed_item(entry, err.to_string(), false)))
                    }
                }
            }
            ApiErrorClass::Permanent => self.drop_entry(entry, err.to_string()).await,
        }
    }

    async fn drop_entry(
        &self,
        entry: &OutboxEntry,
        reason: String,
    ) -> Result<EntryOutcome, EngineError> {
        warn!(
            entry_id = entry.id,
            local_id = %entry.local_id,
            operation = entry.operation.as_str(),
            reason = %reason,
            "dropping entry"
        );
        self.index.remove(entry.id).await?;
        Ok(EntryOutcome::Dropped(failed_item(entry, reason, true)))
    }
}

fn failed_item(entry: &OutboxEntry, error: String, permanent: bool) -> FailedSyncItem {
    FailedSyncItem {
        entry_id: entry.id,
        local_id: entry.local_id.clone(),
        operation: entry.operation,
        error,
        permanent,
    }
}

/// Splits a batch per record, keeping queue order inside and across groups.
pub(super) fn group_by_record(batch: Vec<OutboxEntry>) -> Vec<Vec<OutboxEntry>> {
    let mut positions: HashMap<(EntityType, String), usize> = HashMap::new();
    let mut groups: Vec<Vec<OutboxEntry>> = Vec::new();
    for entry in batch {
        let key = (entry.entity_type, entry.local_id.clone());
        match positions.get(&key) {
            Some(&index) => groups[index].push(entry),
            None => {
                positions.insert(key, groups.len());
                groups.push(vec![entry]);
            }
        }
    }
    groups
}
