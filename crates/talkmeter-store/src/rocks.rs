//! `RocksDB` storage implementation.
//!
//! This module provides the `RocksStore` implementation of the `Store` trait.
//!
//! `RocksDB` holds an exclusive file lock on its directory, so a single process
//! owns the database. Ledger lock transitions are read-check-write sequences
//! serialised by `ledger_guard`, which makes each of them atomic.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, Direction, IteratorMode,
    MultiThreaded, Options, WriteBatch,
};
use rust_decimal::Decimal;

use talkmeter_core::{Ledger, SessionId, SessionRecord, SessionStatus, UserId};

use crate::error::{Result, StoreError};
use crate::keys;
use crate::schema::{all_column_families, cf};
use crate::Store;

/// RocksDB-backed storage implementation.
pub struct RocksStore {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
    ledger_guard: Mutex<()>,
}

impl RocksStore {
    /// Open or create a `RocksDB` database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or created.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<_> = all_column_families()
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect();

        let db = DBWithThreadMode::open_cf_descriptors(&opts, path, cf_descriptors)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(Self {
            db: Arc::new(db),
            ledger_guard: Mutex::new(()),
        })
    }

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family not found: {name}")))
    }

    fn guard(&self) -> Result<MutexGuard<'_, ()>> {
        self.ledger_guard
            .lock()
            .map_err(|_| StoreError::Database("ledger guard poisoned".into()))
    }

    /// Serialize a value using CBOR.
    fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(value, &mut buf)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(buf)
    }

    /// Deserialize a value from CBOR.
    fn deserialize<T: serde::de::DeserializeOwned>(data: &[u8]) -> Result<T> {
        ciborium::from_reader(data).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn write_ledger(&self, ledger: &Ledger) -> Result<()> {
        let cf = self.cf(cf::LEDGERS)?;
        let key = keys::ledger_key(&ledger.payer_id);
        let value = Self::serialize(ledger)?;
        self.db
            .put_cf(&cf, key, value)
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    fn require_ledger(&self, payer_id: &UserId) -> Result<Ledger> {
        self.get_ledger(payer_id)?.ok_or_else(|| StoreError::NotFound {
            entity: "ledger",
            id: payer_id.to_string(),
        })
    }

    /// Collect the session IDs under `prefix` in an index column family.
    fn scan_index(&self, cf_name: &str, prefix: &[u8]) -> Result<Vec<SessionId>> {
        let cf = self.cf(cf_name)?;
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(prefix, Direction::Forward));

        let mut ids = Vec::new();
        for item in iter {
            let (key, _) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if !key.starts_with(prefix) {
                break;
            }
            if let Some(id) = keys::extract_session_id(&key) {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    fn load_sessions(&self, ids: Vec<SessionId>) -> Result<Vec<SessionRecord>> {
        let mut sessions = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.get_session(&id)? {
                sessions.push(record);
            }
        }
        Ok(sessions)
    }
}

impl Store for RocksStore {
    // =========================================================================
    // Ledger Operations
    // =========================================================================

    fn create_ledger(&self, ledger: &Ledger) -> Result<()> {
        let _guard = self.guard()?;
        if self.get_ledger(&ledger.payer_id)?.is_some() {
            return Err(StoreError::AlreadyExists {
                entity: "ledger",
                id: ledger.payer_id.to_string(),
            });
        }
        self.write_ledger(ledger)
    }

    fn get_ledger(&self, payer_id: &UserId) -> Result<Option<Ledger>> {
        let cf = self.cf(cf::LEDGERS)?;
        let key = keys::ledger_key(payer_id);

        self.db
            .get_cf(&cf, key)
            .map_err(|e| StoreError::Database(e.to_string()))?
            .map(|data| Self::deserialize(&data))
            .transpose()
    }

    fn acquire_ledger_lock(&self, payer_id: &UserId, at: DateTime<Utc>) -> Result<Ledger> {
        let _guard = self.guard()?;
        let mut ledger = self.require_ledger(payer_id)?;

        if ledger.locked {
            return Err(StoreError::Locked {
                payer_id: payer_id.to_string(),
            });
        }

        ledger.locked = true;
        ledger.lock_acquired_at = Some(at);
        self.write_ledger(&ledger)?;
        Ok(ledger)
    }

    fn release_ledger_lock(
        &self,
        payer_id: &UserId,
        lease: DateTime<Utc>,
        new_balance: Decimal,
        at: DateTime<Utc>,
    ) -> Result<Ledger> {
        let _guard = self.guard()?;
        let mut ledger = self.require_ledger(payer_id)?;

        if !ledger.locked || ledger.lock_acquired_at != Some(lease) {
            return Err(StoreError::LeaseLost {
                payer_id: payer_id.to_string(),
            });
        }

        ledger.balance = new_balance;
        ledger.locked = false;
        ledger.lock_acquired_at = None;
        ledger.updated_at = at;
        self.write_ledger(&ledger)?;
        Ok(ledger)
    }

    fn force_release_ledger_lock(&self, payer_id: &UserId, lease: DateTime<Utc>) -> Result<bool> {
        let _guard = self.guard()?;
        let Some(mut ledger) = self.get_ledger(payer_id)? else {
            return Ok(false);
        };
        if !ledger.locked || ledger.lock_acquired_at != Some(lease) {
            return Ok(false);
        }

        ledger.locked = false;
        ledger.lock_acquired_at = None;
        self.write_ledger(&ledger)?;
        Ok(true)
    }

    fn list_locked_ledgers(&self) -> Result<Vec<Ledger>> {
        let cf = self.cf(cf::LEDGERS)?;
        let mut locked = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            let ledger: Ledger = Self::deserialize(&value)?;
            if ledger.locked {
                locked.push(ledger);
            }
        }
        Ok(locked)
    }

    // =========================================================================
    // Session Operations
    // =========================================================================

    fn put_session(&self, record: &SessionRecord) -> Result<()> {
        let cf_sessions = self.cf(cf::SESSIONS)?;
        let cf_by_status = self.cf(cf::SESSIONS_BY_STATUS)?;
        let cf_by_user = self.cf(cf::SESSIONS_BY_USER)?;

        let previous_status = self.get_session(&record.id)?.map(|s| s.status);
        let value = Self::serialize(record)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_sessions, keys::session_key(&record.id), &value);
        if let Some(previous) = previous_status.filter(|s| *s != record.status) {
            batch.delete_cf(&cf_by_status, keys::status_session_key(previous, &record.id));
        }
        batch.put_cf(
            &cf_by_status,
            keys::status_session_key(record.status, &record.id),
            [],
        );
        if previous_status.is_none() {
            batch.put_cf(&cf_by_user, keys::user_session_key(&record.payer_id, &record.id), []);
            batch.put_cf(
                &cf_by_user,
                keys::user_session_key(&record.provider_id, &record.id),
                [],
            );
        }

        self.db
            .write(batch)
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    fn get_session(&self, session_id: &SessionId) -> Result<Option<SessionRecord>> {
        let cf = self.cf(cf::SESSIONS)?;
        let key = keys::session_key(session_id);

        self.db
            .get_cf(&cf, key)
            .map_err(|e| StoreError::Database(e.to_string()))?
            .map(|data| Self::deserialize(&data))
            .transpose()
    }

    fn list_sessions_by_status(&self, status: SessionStatus) -> Result<Vec<SessionRecord>> {
        let ids = self.scan_index(cf::SESSIONS_BY_STATUS, &keys::status_prefix(status))?;
        let sessions = self.load_sessions(ids)?;
        // The index can briefly lag a concurrent status change.
        Ok(sessions.into_iter().filter(|s| s.status == status).collect())
    }

    fn list_sessions_for_user(&self, user_id: &UserId) -> Result<Vec<SessionRecord>> {
        let mut ids = self.scan_index(cf::SESSIONS_BY_USER, &keys::user_sessions_prefix(user_id))?;
        ids.reverse();
        self.load_sessions(ids)
    }
}
