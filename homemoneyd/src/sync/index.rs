use std::{
    fs,
    path::{Path, PathBuf},
};

use homemoney_core::ExpenseDto;
use sqlx::{
    Row, SqliteConnection, SqlitePool,
    migrate::Migrator,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteRow},
};
use thiserror::Error;

use super::queue::{EntityType, ExpenseSnapshot, OutboxEntry, SyncOperation};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const EXPENSE_COLUMNS: &str = "id, server_id, is_synced, type, remark, amount, date";

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("XDG data directory is unavailable")]
    MissingDataDir,
    #[error("invalid entity type: {0}")]
    InvalidEntityType(String),
    #[error("invalid sync operation: {0}")]
    InvalidOperation(String),
    #[error("snapshot encoding failed: {0}")]
    Snapshot(#[from] serde_json::Error),
    #[error("expense {0} cannot be marked synced without a remote id")]
    SyncedWithoutRemoteId(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expense {
    pub local_id: String,
    pub remote_id: Option<String>,
    pub synced: bool,
    pub expense_type: String,
    pub remark: Option<String>,
    pub amount: f64,
    pub date: String,
}

impl Expense {
    /// Builds a synced local copy of a record first seen on the server.
    pub fn from_remote(remote_id: String, remote: &ExpenseDto) -> Self {
        Self {
            local_id: uuid::Uuid::new_v4().to_string(),
            remote_id: Some(remote_id),
            synced: true,
            expense_type: remote.expense_type.clone(),
            remark: remote.remark.clone(),
            amount: remote.amount,
            date: remote.date.clone(),
        }
    }

    pub fn snapshot(&self) -> ExpenseSnapshot {
        ExpenseSnapshot {
            local_id: self.local_id.clone(),
            remote_id: self.remote_id.clone(),
            expense_type: self.expense_type.clone(),
            remark: self.remark.clone(),
            amount: self.amount,
            date: self.date.clone(),
        }
    }

    fn check_invariant(&self) -> Result<(), IndexError> {
        if self.synced && self.remote_id.is_none() {
            return Err(IndexError::SyncedWithoutRemoteId(self.local_id.clone()));
        }
        Ok(())
    }
}

/// User-entered fields of an expense.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpenseDraft {
    pub expense_type: String,
    pub remark: Option<String>,
    pub amount: f64,
    pub date: String,
}

#[derive(Clone)]
pub struct IndexStore {
    pool: SqlitePool,
}

impl IndexStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn open(db_path: &Path) -> Result<Self, IndexError> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn init(&self) -> Result<(), IndexError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub async fn insert_expense(&self, expense: &Expense) -> Result<(), IndexError> {
        expense.check_invariant()?;
        let mut conn = self.pool.acquire().await?;
        insert_expense_on(&mut conn, expense).await
    }

    /// Overwrites every column of an existing record. Returns `false` when
    /// no record has that local id.
    pub async fn update_expense(&self, expense: &Expense) -> Result<bool, IndexError> {
        expense.check_invariant()?;
        let result = sqlx::query(
            "UPDATE expenses
             SET server_id = ?2, is_synced = ?3, type = ?4, remark = ?5, amount = ?6, date = ?7
             WHERE id = ?1",
        )
        .bind(&expense.local_id)
        .bind(&expense.remote_id)
        .bind(expense.synced)
        .bind(&expense.expense_type)
        .bind(&expense.remark)
        .bind(expense.amount)
        .bind(&expense.date)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_expense(&self, local_id: &str) -> Result<bool, IndexError> {
        let result = sqlx::query("DELETE FROM expenses WHERE id = ?1")
            .bind(local_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Replaces the payload of a record with the server copy, only while the
    /// record is still synced. Returns `false` if it was edited meanwhile.
    pub async fn overwrite_synced_expense(
        &self,
        local_id: &str,
        remote: &ExpenseDto,
    ) -> Result<bool, IndexError> {
        let result = sqlx::query(
            "UPDATE expenses
             SET type = ?2, remark = ?3, amount = ?4, date = ?5
             WHERE id = ?1 AND is_synced = 1",
        )
        .bind(local_id)
        .bind(&remote.expense_type)
        .bind(&remote.remark)
        .bind(remote.amount)
        .bind(&remote.date)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Queues an update carrying the record's current payload, only while
    /// the record is still unsynced. Returns the record as queued.
    pub async fn requeue_unsynced(&self, local_id: &str) -> Result<Option<Expense>, IndexError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(&format!(
            "UPDATE expenses SET is_synced = 0
             WHERE id = ?1 AND is_synced = 0
             RETURNING {EXPENSE_COLUMNS}"
        ))
        .bind(local_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let expense = expense_from_row(&row)?;
        let payload = expense.snapshot().to_json()?;
        enqueue_on(
            &mut tx,
            EntityType::Expense,
            local_id,
            SyncOperation::Update,
            &payload,
        )
        .await?;
        tx.commit().await?;
        Ok(Some(expense))
    }

    /// Deletes a record only while it is still synced.
    pub async fn delete_synced_expense(&self, local_id: &str) -> Result<bool, IndexError> {
        let result = sqlx::query("DELETE FROM expenses WHERE id = ?1 AND is_synced = 1")
            .bind(local_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_expense(&self, local_id: &str) -> Result<Option<Expense>, IndexError> {
        let row = sqlx::query(&format!(
            "SELECT {EXPENSE_COLUMNS} FROM expenses WHERE id = ?1"
        ))
        .bind(local_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(expense_from_row).transpose()
    }

    pub async fn get_expense_by_remote_id(
        &self,
        remote_id: &str,
    ) -> Result<Option<Expense>, IndexError> {
        let row = sqlx::query(&format!(
            "SELECT {EXPENSE_COLUMNS} FROM expenses WHERE server_id = ?1"
        ))
        .bind(remote_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(expense_from_row).transpose()
    }

    pub async fn list_expenses(&self) -> Result<Vec<Expense>, IndexError> {
        let rows = sqlx::query(&format!(
            "SELECT {EXPENSE_COLUMNS} FROM expenses ORDER BY date DESC, id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(expense_from_row).collect()
    }

    pub async fn list_synced_expenses(&self) -> Result<Vec<Expense>, IndexError> {
        let rows = sqlx::query(&format!(
            "SELECT {EXPENSE_COLUMNS} FROM expenses
             WHERE is_synced = 1 AND server_id IS NOT NULL
             ORDER BY id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(expense_from_row).collect()
    }

    /// Stores a new local expense and queues its creation in one transaction.
    pub async fn create_local(&self, draft: &ExpenseDraft) -> Result<Expense, IndexError> {
        let expense = Expense {
            local_id: uuid::Uuid::new_v4().to_string(),
            remote_id: None,
            synced: false,
            expense_type: draft.expense_type.clone(),
            remark: draft.remark.clone(),
            amount: draft.amount,
            date: draft.date.clone(),
        };
        let payload = expense.snapshot().to_json()?;

        let mut tx = self.pool.begin().await?;
        insert_expense_on(&mut tx, &expense).await?;
        enqueue_on(
            &mut tx,
            EntityType::Expense,
            &expense.local_id,
            SyncOperation::Create,
            &payload,
        )
        .await?;
        tx.commit().await?;
        Ok(expense)
    }

    /// Applies an edit, marks the record unsynced and queues an update.
    /// Returns `None` when the record does not exist.
    pub async fn update_local(
        &self,
        local_id: &str,
        draft: &ExpenseDraft,
    ) -> Result<Option<Expense>, IndexError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "UPDATE expenses
             SET type = ?2, remark = ?3, amount = ?4, date = ?5, is_synced = 0
             WHERE id = ?1
             RETURNING server_id",
        )
        .bind(local_id)
        .bind(&draft.expense_type)
        .bind(&draft.remark)
        .bind(draft.amount)
        .bind(&draft.date)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        let expense = Expense {
            local_id: local_id.to_string(),
            remote_id: row.try_get("server_id")?,
            synced: false,
            expense_type: draft.expense_type.clone(),
            remark: draft.remark.clone(),
            amount: draft.amount,
            date: draft.date.clone(),
        };
        let payload = expense.snapshot().to_json()?;
        enqueue_on(
            &mut tx,
            EntityType::Expense,
            local_id,
            SyncOperation::Update,
            &payload,
        )
        .await?;
        tx.commit().await?;
        Ok(Some(expense))
    }

    /// Removes a record locally. Pending changes for it are discarded and a
    /// remote delete is queued only if the server already knows the record.
    pub async fn delete_local(&self, local_id: &str) -> Result<bool, IndexError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(&format!(
            "DELETE FROM expenses WHERE id = ?1 RETURNING {EXPENSE_COLUMNS}"
        ))
        .bind(local_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Ok(false);
        };
        let expense = expense_from_row(&row)?;

        purge_pending_on(&mut tx, EntityType::Expense, local_id).await?;
        if expense.remote_id.is_some() {
            let payload = expense.snapshot().to_json()?;
            enqueue_on(
                &mut tx,
                EntityType::Expense,
                local_id,
                SyncOperation::Delete,
                &payload,
            )
            .await?;
        }
        tx.commit().await?;
        Ok(true)
    }

    /// Queues a change. An update for a record whose newest pending entry is
    /// a create or update replaces that entry's payload in place.
    pub async fn enqueue(
        &self,
        entity_type: EntityType,
        local_id: &str,
        operation: SyncOperation,
        payload: &str,
    ) -> Result<i64, IndexError> {
        let mut tx = self.pool.begin().await?;
        let id = enqueue_on(&mut tx, entity_type, local_id, operation, payload).await?;
        tx.commit().await?;
        Ok(id)
    }

    pub async fn next_batch(&self, limit: i64) -> Result<Vec<OutboxEntry>, IndexError> {
        let rows = sqlx::query(
            "SELECT id, entity_type, entity_id, operation, data, retry_count, created_at
             FROM sync_queue
             ORDER BY id ASC
             LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(entry_from_row).collect()
    }

    pub async fn remove(&self, entry_id: i64) -> Result<bool, IndexError> {
        let result = sqlx::query("DELETE FROM sync_queue WHERE id = ?1")
            .bind(entry_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Returns the new retry count, or `None` if the entry is gone.
    pub async fn increment_retry(&self, entry_id: i64) -> Result<Option<u32>, IndexError> {
        let row = sqlx::query(
            "UPDATE sync_queue SET retry_count = retry_count + 1 WHERE id = ?1 RETURNING retry_count",
        )
        .bind(entry_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| row.try_get("retry_count"))
            .transpose()
            .map_err(IndexError::from)
    }

    pub async fn pending_count(&self) -> Result<i64, IndexError> {
        let row = sqlx::query("SELECT COUNT(*) AS pending FROM sync_queue")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("pending")?)
    }

    /// Records the remote effect of a create or update.
    ///
    /// The entry is removed only if its payload is still the one that was
    /// sent; an entry edited in the meantime stays queued (as an update once
    /// the server knows the record). The record is marked synced only when
    /// nothing else is pending for it. If the record was deleted while its
    /// create was in flight, a delete for the new remote id is queued.
    /// Returns whether the record is now synced.
    pub async fn complete_upload(
        &self,
        entry: &OutboxEntry,
        remote_id: Option<&str>,
    ) -> Result<bool, IndexError> {
        let mut tx = self.pool.begin().await?;
        let removed = sqlx::query("DELETE FROM sync_queue WHERE id = ?1 AND data = ?2")
            .bind(entry.id)
            .bind(&entry.payload)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if removed == 0 {
            sqlx::query("UPDATE sync_queue SET operation = ?2 WHERE id = ?1 AND operation = ?3")
                .bind(entry.id)
                .bind(SyncOperation::Update.as_str())
                .bind(SyncOperation::Create.as_str())
                .execute(&mut *tx)
                .await?;
        }

        if let Some(remote_id) = remote_id {
            let attached = sqlx::query("UPDATE expenses SET server_id = ?2 WHERE id = ?1")
                .bind(&entry.local_id)
                .bind(remote_id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
            if attached == 0 {
                let mut snapshot = ExpenseSnapshot::from_json(&entry.payload)?;
                snapshot.remote_id = Some(remote_id.to_string());
                enqueue_on(
                    &mut tx,
                    entry.entity_type,
                    &entry.local_id,
                    SyncOperation::Delete,
                    &snapshot.to_json()?,
                )
                .await?;
                tx.commit().await?;
                return Ok(false);
            }
        }

        let row = sqlx::query(
            "SELECT COUNT(*) AS pending FROM sync_queue WHERE entity_type = ?1 AND entity_id = ?2",
        )
        .bind(entry.entity_type.as_str())
        .bind(&entry.local_id)
        .fetch_one(&mut *tx)
        .await?;
        let pending: i64 = row.try_get("pending")?;
        let synced = if pending == 0 {
            sqlx::query(
                "UPDATE expenses SET is_synced = 1 WHERE id = ?1 AND server_id IS NOT NULL",
            )
            .bind(&entry.local_id)
            .execute(&mut *tx)
            .await?
            .rows_affected()
                > 0
        } else {
            false
        };
        tx.commit().await?;
        Ok(synced)
    }

    /// Replaces a local record with the server copy, dropping pending local
    /// changes for it.
    pub async fn accept_server_copy(
        &self,
        local_id: &str,
        remote_id: &str,
        remote: &ExpenseDto,
    ) -> Result<bool, IndexError> {
        let mut tx = self.pool.begin().await?;
        purge_pending_on(&mut tx, EntityType::Expense, local_id).await?;
        let updated = sqlx::query(
            "UPDATE expenses
             SET server_id = ?2, is_synced = 1, type = ?3, remark = ?4, amount = ?5, date = ?6
             WHERE id = ?1",
        )
        .bind(local_id)
        .bind(remote_id)
        .bind(&remote.expense_type)
        .bind(&remote.remark)
        .bind(remote.amount)
        .bind(&remote.date)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        tx.commit().await?;
        Ok(updated > 0)
    }

    pub async fn last_sync_millis(&self) -> Result<Option<i64>, IndexError> {
        let row = sqlx::query("SELECT last_sync FROM sync_state WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(row.try_get("last_sync")?),
            None => Ok(None),
        }
    }

    pub async fn set_last_sync_millis(&self, millis: i64) -> Result<(), IndexError> {
        sqlx::query(
            "INSERT INTO sync_state (id, last_sync) VALUES (1, ?1)
             ON CONFLICT(id) DO UPDATE SET last_sync = excluded.last_sync",
        )
        .bind(millis)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

async fn insert_expense_on(
    conn: &mut SqliteConnection,
    expense: &Expense,
) -> Result<(), IndexError> {
    sqlx::query(
        "INSERT INTO expenses (id, server_id, is_synced, type, remark, amount, date)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )
    .bind(&expense.local_id)
    .bind(&expense.remote_id)
    .bind(expense.synced)
    .bind(&expense.expense_type)
    .bind(&expense.remark)
    .bind(expense.amount)
    .bind(&expense.date)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

// Every statement sequence here starts with a write so that concurrent
// transactions never need to upgrade a read lock.
async fn enqueue_on(
    conn: &mut SqliteConnection,
    entity_type: EntityType,
    local_id: &str,
    operation: SyncOperation,
    payload: &str,
) -> Result<i64, IndexError> {
    if operation == SyncOperation::Update {
        let coalesced = sqlx::query(
            "UPDATE sync_queue SET data = ?3
             WHERE id = (
                 SELECT id FROM sync_queue
                 WHERE entity_type = ?1 AND entity_id = ?2
                 ORDER BY id DESC
                 LIMIT 1
             )
             AND operation IN ('CREATE', 'UPDATE')
             RETURNING id",
        )
        .bind(entity_type.as_str())
        .bind(local_id)
        .bind(payload)
        .fetch_optional(&mut *conn)
        .await?;
        if let Some(row) = coalesced {
            return Ok(row.try_get("id")?);
        }
    }

    let result = sqlx::query(
        "INSERT INTO sync_queue (entity_type, entity_id, operation, data, retry_count, created_at)
         VALUES (?1, ?2, ?3, ?4, 0, CAST(strftime('%s','now') AS INTEGER))",
    )
    .bind(entity_type.as_str())
    .bind(local_id)
    .bind(operation.as_str())
    .bind(payload)
    .execute(&mut *conn)
    .await?;
    Ok(result.last_insert_rowid())
}

async fn purge_pending_on(
    conn: &mut SqliteConnection,
    entity_type: EntityType,
    local_id: &str,
) -> Result<u64, IndexError> {
    let result = sqlx::query("DELETE FROM sync_queue WHERE entity_type = ?1 AND entity_id = ?2")
        .bind(entity_type.as_str())
        .bind(local_id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}

fn expense_from_row(row: &SqliteRow) -> Result<Expense, IndexError> {
    Ok(Expense {
        local_id: row.try_get("id")?,
        remote_id: row.try_get("server_id")?,
        synced: row.try_get("is_synced")?,
        expense_type: row.try_get("type")?,
        remark: row.try_get("remark")?,
        amount: row.try_get("amount")?,
        date: row.try_get("date")?,
    })
}

fn entry_from_row(row: &SqliteRow) -> Result<OutboxEntry, IndexError> {
    let entity_type: String = row.try_get("entity_type")?;
    let operation: String = row.try_get("operation")?;
    Ok(OutboxEntry {
        id: row.try_get("id")?,
        entity_type: EntityType::parse(&entity_type)
            .ok_or(IndexError::InvalidEntityType(entity_type))?,
        local_id: row.try_get("entity_id")?,
        operation: SyncOperation::parse(&operation)
            .ok_or(IndexError::InvalidOperation(operation))?,
        payload: row.try_get("data")?,
        retry_count: row.try_get("retry_count")?,
        created_at: row.try_get("created_at")?,
    })
}

pub fn default_db_path() -> Result<PathBuf, IndexError> {
    let mut path = dirs::data_dir().ok_or(IndexError::MissingDataDir)?;
    path.push("homemoney");
    path.push("sync.db");
    Ok(path)
}

#[cfg(test)]
#[path = "index_tests.rs"]
mod tests;
