//! redb-backed durable store for the offline verification queue.
//!
//! One table, keyed by `(token_value, sub_order_id)` so enqueue dedup is a
//! key-existence check. Values are JSON-serialized queue items. redb commits
//! are durable as soon as `commit()` returns, so the backlog survives process
//! restarts on the device.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

const PENDING_TABLE: TableDefinition<(&str, &str), &[u8]> =
    TableDefinition::new("pending_verifications");

/// A verification attempt captured without connectivity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineQueueItem {
    pub token_value: String,
    pub sub_order_id: Uuid,
    pub captured_at: DateTime<Utc>,
    pub retry_count: u32,
    /// Items are skipped until due; pushed out by capped exponential backoff.
    pub next_attempt_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Clone)]
pub struct OfflineStore {
    db: Arc<Database>,
}

impl OfflineStore {
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let db = Database::create(path)?;
        Self::init(db)
    }

    /// In-memory backend, used by tests.
    pub fn open_in_memory() -> StoreResult<Self> {
        let db = Database::builder().create_with_backend(redb::backends::InMemoryBackend::new())?;
        Self::init(db)
    }

    fn init(db: Database) -> StoreResult<Self> {
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(PENDING_TABLE)?;
        }
        write_txn.commit()?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Inserts unless an entry with the same `(token, sub_order)` key exists.
    /// Returns whether the item was actually added.
    pub fn enqueue(&self, item: &OfflineQueueItem) -> StoreResult<bool> {
        let sub_order = item.sub_order_id.to_string();
        let write_txn = self.db.begin_write()?;
        let added = {
            let mut table = write_txn.open_table(PENDING_TABLE)?;
            let key = (item.token_value.as_str(), sub_order.as_str());
            if table.get(key)?.is_some() {
                false
            } else {
                let bytes = serde_json::to_vec(item)?;
                table.insert(key, bytes.as_slice())?;
                true
            }
        };
        write_txn.commit()?;
        Ok(added)
    }

    /// The whole backlog, oldest capture first.
    pub fn list(&self) -> StoreResult<Vec<OfflineQueueItem>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(PENDING_TABLE)?;
        let mut items = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            items.push(serde_json::from_slice::<OfflineQueueItem>(value.value())?);
        }
        items.sort_by_key(|item| item.captured_at);
        Ok(items)
    }

    pub fn len(&self) -> StoreResult<usize> {
        Ok(self.list()?.len())
    }

    pub fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Terminal outcome: the server accepted or permanently rejected it.
    pub fn remove(&self, token_value: &str, sub_order_id: Uuid) -> StoreResult<()> {
        let sub_order = sub_order_id.to_string();
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(PENDING_TABLE)?;
            table.remove((token_value, sub_order.as_str()))?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Transient failure: bump the retry counter and reschedule.
    pub fn reschedule(
        &self,
        token_value: &str,
        sub_order_id: Uuid,
        next_attempt_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let sub_order = sub_order_id.to_string();
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(PENDING_TABLE)?;
            let key = (token_value, sub_order.as_str());
            let updated = match table.get(key)? {
                Some(existing) => {
                    let mut item: OfflineQueueItem = serde_json::from_slice(existing.value())?;
                    item.retry_count += 1;
                    item.next_attempt_at = next_attempt_at;
                    Some(serde_json::to_vec(&item)?)
                }
                None => None,
            };
            if let Some(bytes) = updated {
                table.insert(key, bytes.as_slice())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }
}
