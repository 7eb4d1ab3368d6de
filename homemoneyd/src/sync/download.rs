use std::collections::HashSet;

use homemoney_core::{ExpenseDto, remote_id_of};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::conflict::{ConflictResolution, RemoteDecision, SyncConflict, decide_remote};
use super::engine::{DownloadReport, EngineError, SyncEngine};
use super::index::Expense;
use super::queue::EntityType;

impl SyncEngine {
    /// Pulls the full server listing, merges it into the local store and
    /// removes synced records the server no longer has.
    pub async fn download(&self, cancel: &CancellationToken) -> Result<DownloadReport, EngineError> {
        let page_size = self.config.download_page_size.max(1);
        let mut report = DownloadReport::default();
        let mut seen: HashSet<String> = HashSet::new();
        let mut page = 1u32;

        loop {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            let listing = self
                .remote(cancel, self.client.list_expenses(page, page_size))
                .await?
                .map_err(EngineError::from_api)?;
            report.total = listing.total;
            let count = listing.data.len();
            if count == 0 {
                break;
            }
            for item in listing.data {
                self.merge_remote_item(item, &mut seen, &mut report).await?;
            }
            report.fetched += count;
            debug!(page, count, total = listing.total, "fetched page");
            if count < page_size as usize || report.fetched as u64 >= listing.total {
                break;
            }
            page += 1;
        }

        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        report.deleted = self.reconcile_deletions(&seen).await?;

        info!(
            total = report.total,
            fetched = report.fetched,
            new = report.new,
            updated = report.updated,
            deleted = report.deleted,
            requeued = report.requeued,
            skipped = report.skipped,
            conflicts = report.conflicts.len(),
            "download phase finished"
        );
        Ok(report)
    }

    async fn merge_remote_item(
        &self,
        item: Value,
        seen: &mut HashSet<String>,
        report: &mut DownloadReport,
    ) -> Result<(), EngineError> {
        let Some(remote_id) = remote_id_of(&item) else {
            warn!("skipping server record without an id");
            report.skipped += 1;
            return Ok(());
        };
        // Recorded before parsing so a malformed record never deletes its
        // local copy.
        seen.insert(remote_id.clone());

        let remote = match ExpenseDto::from_value(item) {
            Ok(remote) => remote,
            Err(err) => {
                warn!(remote_id = %remote_id, error = %err, "skipping malformed server record");
                report.skipped += 1;
                return Ok(());
            }
        };

        let local = self.index.get_expense_by_remote_id(&remote_id).await?;
        match (decide_remote(local.as_ref(), &remote), local) {
            (RemoteDecision::Insert, _) => {
                self.index
                    .insert_expense(&Expense::from_remote(remote_id, &remote))
                    .await?;
                report.new += 1;
            }
            (RemoteDecision::Overwrite, Some(local)) => {
                if self
                    .index
                    .overwrite_synced_expense(&local.local_id, &remote)
                    .await?
                {
                    report.updated += 1;
                } else {
                    debug!(local_id = %local.local_id, "record edited during download, keeping local copy");
                }
            }
            (RemoteDecision::Requeue { .. }, Some(local)) => {
                let Some(current) = self.index.requeue_unsynced(&local.local_id).await? else {
                    debug!(local_id = %local.local_id, "record changed during download, not requeued");
                    return Ok(());
                };
                report.requeued += 1;
                let snapshot = current.snapshot();
                if !snapshot.same_payload_as(&remote) {
                    debug!(local_id = %current.local_id, remote_id = %remote_id, "local edit conflicts with server copy");
                    report.conflicts.push(SyncConflict {
                        entity_type: EntityType::Expense,
                        local_id: current.local_id,
                        remote_id,
                        local: snapshot,
                        server: remote,
                        resolution: ConflictResolution::UseLocal,
                    });
                }
            }
            (RemoteDecision::Unchanged, _)
            | (RemoteDecision::Overwrite, None)
            | (RemoteDecision::Requeue { .. }, None) => {}
        }
        Ok(())
    }

    async fn reconcile_deletions(&self, seen: &HashSet<String>) -> Result<usize, EngineError> {
        let mut deleted = 0;
        for local in self.index.list_synced_expenses().await? {
            let Some(remote_id) = local.remote_id.as_deref() else {
                continue;
            };
            if seen.contains(remote_id) {
                continue;
            }
            if self.index.delete_synced_expense(&local.local_id).await? {
                debug!(local_id = %local.local_id, remote_id, "removed record deleted on server");
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}
