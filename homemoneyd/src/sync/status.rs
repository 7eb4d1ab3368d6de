use std::sync::Arc;

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Idle,
    Syncing,
    Success,
    Failed,
    Conflict,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Idle => "idle",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Success => "success",
            SyncStatus::Failed => "failed",
            SyncStatus::Conflict => "conflict",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SyncStatus::Success | SyncStatus::Failed | SyncStatus::Conflict
        )
    }
}

/// Shared, observable sync status. Clones publish to the same channel.
#[derive(Clone)]
pub struct SyncStatusHandle {
    tx: Arc<watch::Sender<SyncStatus>>,
}

impl SyncStatusHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SyncStatus::Idle);
        Self { tx: Arc::new(tx) }
    }

    pub fn set(&self, status: SyncStatus) {
        self.tx.send_replace(status);
    }

    pub fn current(&self) -> SyncStatus {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.tx.subscribe()
    }
}

impl Default for SyncStatusHandle {
    fn default() -> Self {
        Self::new()
    }
}
