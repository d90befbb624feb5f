//! ScaleStore: redb-backed active request counters.
//!
//! Values are JSON-serialized `ActiveRequestRecord`s in a single table.
//! Each mutation runs in its own write transaction, so an increment is
//! atomic; a drain and a concurrent increment are not ordered with respect
//! to each other, which only shifts a few requests into the next window.

use std::path::Path;
use std::sync::{Arc, RwLock, RwLockReadGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use launchpad_core::ServiceKey;

use crate::error::{StateError, StateResult};
use crate::tables::ACTIVE_REQUESTS;
use crate::types::ActiveRequestRecord;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe autoscale store backed by redb.
///
/// Regular operations share the inner lock; compaction needs exclusive
/// access to the database handle and takes it for writing.
#[derive(Clone)]
pub struct ScaleStore {
    db: Arc<RwLock<Database>>,
}

impl ScaleStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self {
            db: Arc::new(RwLock::new(db)),
        };
        store.ensure_tables()?;
        debug!(?path, "autoscale store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self {
            db: Arc::new(RwLock::new(db)),
        };
        store.ensure_tables()?;
        debug!("in-memory autoscale store opened");
        Ok(store)
    }

    fn db(&self) -> StateResult<RwLockReadGuard<'_, Database>> {
        self.db.read().map_err(|_| StateError::Poisoned)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let db = self.db()?;
        let txn = db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(ACTIVE_REQUESTS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Add `delta` active requests to a service's current window.
    pub fn record_active_requests(&self, key: &ServiceKey, delta: u64) -> StateResult<()> {
        self.record_active_requests_at(key, delta, epoch_secs())
    }

    pub fn record_active_requests_at(
        &self,
        key: &ServiceKey,
        delta: u64,
        now: u64,
    ) -> StateResult<()> {
        let table_key = key.unique_name();
        let db = self.db()?;
        let txn = db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(ACTIVE_REQUESTS).map_err(map_err!(Table))?;
            let existing = table
                .get(table_key.as_str())
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_vec());

            let mut record = match existing {
                Some(bytes) => serde_json::from_slice::<ActiveRequestRecord>(&bytes)
                    .map_err(map_err!(Deserialize))?,
                None => ActiveRequestRecord {
                    key: key.clone(),
                    active_requests: 0,
                    last_active: now,
                    updated_at: now,
                },
            };
            record.active_requests = record.active_requests.saturating_add(delta);
            if delta > 0 {
                record.last_active = now;
            }
            record.updated_at = now;

            let value = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
            table
                .insert(table_key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get the record for a single service.
    pub fn get_active_requests(&self, key: &ServiceKey) -> StateResult<Option<ActiveRequestRecord>> {
        let table_key = key.unique_name();
        let db = self.db()?;
        let txn = db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ACTIVE_REQUESTS).map_err(map_err!(Table))?;
        match table.get(table_key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: ActiveRequestRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// List every tracked record without modifying it.
    pub fn list_active_requests(&self) -> StateResult<Vec<ActiveRequestRecord>> {
        let db = self.db()?;
        let txn = db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ACTIVE_REQUESTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: ActiveRequestRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(record);
        }
        Ok(results)
    }

    /// Close the current window.
    ///
    /// Returns every live record with the count it had accumulated, then
    /// resets the counts to zero. Records that stayed at zero for at least
    /// `idle_ttl_secs` are removed and not returned.
    pub fn drain_active_requests(&self, idle_ttl_secs: u64) -> StateResult<Vec<ActiveRequestRecord>> {
        self.drain_active_requests_at(epoch_secs(), idle_ttl_secs)
    }

    pub fn drain_active_requests_at(
        &self,
        now: u64,
        idle_ttl_secs: u64,
    ) -> StateResult<Vec<ActiveRequestRecord>> {
        let db = self.db()?;
        let txn = db.begin_write().map_err(map_err!(Transaction))?;
        let mut drained = Vec::new();
        let mut expired = 0usize;
        {
            let mut table = txn.open_table(ACTIVE_REQUESTS).map_err(map_err!(Table))?;

            let mut records = Vec::new();
            for entry in table.iter().map_err(map_err!(Read))? {
                let (key, value) = entry.map_err(map_err!(Read))?;
                let record: ActiveRequestRecord =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                records.push((key.value().to_string(), record));
            }

            for (table_key, record) in records {
                let idle_for = now.saturating_sub(record.last_active);
                if record.active_requests == 0 && idle_for >= idle_ttl_secs {
                    table
                        .remove(table_key.as_str())
                        .map_err(map_err!(Write))?;
                    expired += 1;
                    continue;
                }

                let mut reset = record.clone();
                reset.active_requests = 0;
                reset.updated_at = now;
                let value = serde_json::to_vec(&reset).map_err(map_err!(Serialize))?;
                table
                    .insert(table_key.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;

                drained.push(record);
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(records = drained.len(), expired, "active request window drained");
        Ok(drained)
    }

    /// Run one compaction pass. Returns `true` if space was reclaimed and
    /// another pass may reclaim more.
    pub fn compact(&self) -> StateResult<bool> {
        let mut db = self.db.write().map_err(|_| StateError::Poisoned)?;
        db.compact().map_err(map_err!(Compaction))
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
