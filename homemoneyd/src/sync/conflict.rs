use homemoney_core::ExpenseDto;

use super::index::Expense;
use super::queue::{EntityType, ExpenseSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictResolution {
    #[default]
    UseLocal,
    UseServer,
    Merge,
}

/// An unsynced local edit met a different server copy during download.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConflict {
    pub entity_type: EntityType,
    pub local_id: String,
    pub remote_id: String,
    pub local: ExpenseSnapshot,
    pub server: ExpenseDto,
    pub resolution: ConflictResolution,
}

impl SyncConflict {
    pub fn with_resolution(mut self, resolution: ConflictResolution) -> Self {
        self.resolution = resolution;
        self
    }
}

/// What the download phase does with one server record.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteDecision {
    Insert,
    Overwrite,
    Unchanged,
    /// Local copy wins and is pushed again; `conflict` is set when the
    /// payloads actually differ.
    Requeue { conflict: bool },
}

pub fn decide_remote(local: Option<&Expense>, remote: &ExpenseDto) -> RemoteDecision {
    let Some(local) = local else {
        return RemoteDecision::Insert;
    };
    let same = local.snapshot().same_payload_as(remote);
    match (local.synced, same) {
        (true, true) => RemoteDecision::Unchanged,
        (true, false) => RemoteDecision::Overwrite,
        (false, same) => RemoteDecision::Requeue { conflict: !same },
    }
}
