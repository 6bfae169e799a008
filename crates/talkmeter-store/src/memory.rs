//! In-memory storage implementation.
//!
//! Ledger lock acquisition runs under the dashmap shard write lock for that
//! key, which makes the check-and-set a single atomic step.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rust_decimal::Decimal;

use talkmeter_core::{Ledger, SessionId, SessionRecord, SessionStatus, UserId};

use crate::error::{Result, StoreError};
use crate::Store;

/// Dashmap-backed storage. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    ledgers: DashMap<UserId, Ledger>,
    sessions: DashMap<SessionId, SessionRecord>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn ledger_not_found(payer_id: &UserId) -> StoreError {
    StoreError::NotFound {
        entity: "ledger",
        id: payer_id.to_string(),
    }
}

impl Store for MemoryStore {
    fn create_ledger(&self, ledger: &Ledger) -> Result<()> {
        match self.ledgers.entry(ledger.payer_id) {
            Entry::Occupied(_) => Err(StoreError::AlreadyExists {
                entity: "ledger",
                id: ledger.payer_id.to_string(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(ledger.clone());
                Ok(())
            }
        }
    }

    fn get_ledger(&self, payer_id: &UserId) -> Result<Option<Ledger>> {
        Ok(self.ledgers.get(payer_id).map(|l| l.clone()))
    }

    fn acquire_ledger_lock(&self, payer_id: &UserId, at: DateTime<Utc>) -> Result<Ledger> {
        let mut ledger = self
            .ledgers
            .get_mut(payer_id)
            .ok_or_else(|| ledger_not_found(payer_id))?;

        if ledger.locked {
            return Err(StoreError::Locked {
                payer_id: payer_id.to_string(),
            });
        }

        ledger.locked = true;
        ledger.lock_acquired_at = Some(at);
        Ok(ledger.clone())
    }

    fn release_ledger_lock(
        &self,
        payer_id: &UserId,
        lease: DateTime<Utc>,
        new_balance: Decimal,
        at: DateTime<Utc>,
    ) -> Result<Ledger> {
        let mut ledger = self
            .ledgers
            .get_mut(payer_id)
            .ok_or_else(|| ledger_not_found(payer_id))?;

        if !ledger.locked || ledger.lock_acquired_at != Some(lease) {
            return Err(StoreError::LeaseLost {
                payer_id: payer_id.to_string(),
            });
        }

        ledger.balance = new_balance;
        ledger.locked = false;
        ledger.lock_acquired_at = None;
        ledger.updated_at = at;
        Ok(ledger.clone())
    }

    fn force_release_ledger_lock(&self, payer_id: &UserId, lease: DateTime<Utc>) -> Result<bool> {
        let Some(mut ledger) = self.ledgers.get_mut(payer_id) else {
            return Ok(false);
        };
        if !ledger.locked || ledger.lock_acquired_at != Some(lease) {
            return Ok(false);
        }
        ledger.locked = false;
        ledger.lock_acquired_at = None;
        Ok(true)
    }

    fn list_locked_ledgers(&self) -> Result<Vec<Ledger>> {
        Ok(self
            .ledgers
            .iter()
            .filter(|l| l.locked)
            .map(|l| l.clone())
            .collect())
    }

    fn put_session(&self, record: &SessionRecord) -> Result<()> {
        self.sessions.insert(record.id, record.clone());
        Ok(())
    }

    fn get_session(&self, session_id: &SessionId) -> Result<Option<SessionRecord>> {
        Ok(self.sessions.get(session_id).map(|s| s.clone()))
    }

    fn list_sessions_by_status(&self, status: SessionStatus) -> Result<Vec<SessionRecord>> {
        let mut sessions: Vec<SessionRecord> = self
            .sessions
            .iter()
            .filter(|s| s.status == status)
            .map(|s| s.clone())
            .collect();
        sessions.sort_by_key(|s| s.id);
        Ok(sessions)
    }

    fn list_sessions_for_user(&self, user_id: &UserId) -> Result<Vec<SessionRecord>> {
        let mut sessions: Vec<SessionRecord> = self
            .sessions
            .iter()
            .filter(|s| s.payer_id == *user_id || s.provider_id == *user_id)
            .map(|s| s.clone())
            .collect();
        sessions.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(sessions)
    }
}
