//! Storage layer for talkmeter.
//!
//! This crate persists ledgers and session records behind the [`Store`]
//! trait. Two backends are provided:
//!
//! - [`MemoryStore`]: dashmap-backed, used by tests and ephemeral deployments
//! - `RocksStore`: `RocksDB` with column families and CBOR values
//!   (feature `rocksdb-backend`)
//!
//! # Ledger locking
//!
//! The ledger's `locked` flag is acquired with a single conditional write
//! ([`Store::acquire_ledger_lock`]): two callers can never both observe
//! `locked = false` and proceed. The acquire returns a lease (the
//! `lock_acquired_at` stamp) which must be presented to release the lock and
//! persist the new balance in one write.
//!
//! # Example
//!
//! ```
//! use chrono::Utc;
//! use talkmeter_core::{Ledger, UserId};
//! use talkmeter_store::{MemoryStore, Store};
//!
//! let store = MemoryStore::new();
//! let payer = UserId::generate();
//! store.create_ledger(&Ledger::new(payer, Utc::now())).unwrap();
//!
//! let held = store.acquire_ledger_lock(&payer, Utc::now()).unwrap();
//! assert!(store.acquire_ledger_lock(&payer, Utc::now()).is_err());
//!
//! let lease = held.lock_acquired_at.unwrap();
//! store.release_ledger_lock(&payer, lease, held.balance, Utc::now()).unwrap();
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod keys;
pub mod memory;
#[cfg(feature = "rocksdb-backend")]
pub mod rocks;
pub mod schema;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
#[cfg(feature = "rocksdb-backend")]
pub use rocks::RocksStore;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use talkmeter_core::{Ledger, SessionId, SessionRecord, SessionStatus, UserId};

/// The storage trait defining all database operations.
///
/// This trait abstracts the storage layer, allowing for different implementations
/// (e.g., `RocksDB`, in-memory for testing).
pub trait Store: Send + Sync {
    // =========================================================================
    // Ledger Operations
    // =========================================================================

    /// Insert a new ledger.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::AlreadyExists` if the payer already has one.
    fn create_ledger(&self, ledger: &Ledger) -> Result<()>;

    /// Get a ledger by payer ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_ledger(&self, payer_id: &UserId) -> Result<Option<Ledger>>;

    /// Atomically set `locked = true` if it is currently false.
    ///
    /// Returns the ledger as it is after acquisition; its `lock_acquired_at`
    /// is the lease needed to release.
    ///
    /// # Errors
    ///
    /// - `StoreError::NotFound` if the ledger doesn't exist.
    /// - `StoreError::Locked` if the lock is already held.
    fn acquire_ledger_lock(&self, payer_id: &UserId, at: DateTime<Utc>) -> Result<Ledger>;

    /// Persist `new_balance` and release the lock in one write.
    ///
    /// # Errors
    ///
    /// - `StoreError::NotFound` if the ledger doesn't exist.
    /// - `StoreError::LeaseLost` if the lock is no longer held under `lease`;
    ///   nothing is written in that case.
    fn release_ledger_lock(
        &self,
        payer_id: &UserId,
        lease: DateTime<Utc>,
        new_balance: Decimal,
        at: DateTime<Utc>,
    ) -> Result<Ledger>;

    /// Clear a lock still held under `lease`, leaving the balance untouched.
    ///
    /// Returns `false` when the ledger is unlocked or locked under a
    /// different lease, so repeated calls are harmless.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn force_release_ledger_lock(&self, payer_id: &UserId, lease: DateTime<Utc>) -> Result<bool>;

    /// List every ledger whose lock flag is set.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_locked_ledgers(&self) -> Result<Vec<Ledger>>;

    // =========================================================================
    // Session Operations
    // =========================================================================

    /// Insert or update a session record, maintaining the indexes.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn put_session(&self, record: &SessionRecord) -> Result<()>;

    /// Get a session by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_session(&self, session_id: &SessionId) -> Result<Option<SessionRecord>>;

    /// List sessions currently in `status`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_sessions_by_status(&self, status: SessionStatus) -> Result<Vec<SessionRecord>>;

    /// List sessions where `user_id` is payer or provider, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_sessions_for_user(&self, user_id: &UserId) -> Result<Vec<SessionRecord>>;

    // =========================================================================
    // Compound Operations
    // =========================================================================

    /// Find a pending, accepted or active session between this payer and provider.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn find_open_session(
        &self,
        payer_id: &UserId,
        provider_id: &UserId,
    ) -> Result<Option<SessionRecord>> {
        Ok(self
            .list_sessions_for_user(payer_id)?
            .into_iter()
            .find(|s| s.payer_id == *payer_id && s.provider_id == *provider_id && s.status.is_open()))
    }
}
