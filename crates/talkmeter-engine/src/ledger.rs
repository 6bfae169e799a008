//! Ledger debits and credits under the ledger lock.
//!
//! Every balance mutation acquires the ledger lock, computes the new balance
//! and releases the lock with that balance in one conditional write. A
//! `Locked` ledger is retried a few times with jittered exponential backoff
//! before the error is returned to the caller.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use talkmeter_core::{
    apply_credit, apply_debit, ensure_positive, CreditOutcome, DebitOutcome, Ledger, MeterError,
    Result, UserId,
};
use talkmeter_store::{Store, StoreError};

use crate::clock::Clock;

const MAX_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Balance operations against the persisted ledgers.
#[derive(Clone)]
pub struct LedgerService {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    retry_attempts: usize,
    retry_base_ms: u64,
}

impl LedgerService {
    /// Create a service retrying `Locked` ledgers `retry_attempts` times.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        retry_attempts: usize,
        retry_base_ms: u64,
    ) -> Self {
        Self {
            store,
            clock,
            retry_attempts,
            retry_base_ms,
        }
    }

    /// Open a zero-balance ledger for `payer_id`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the payer already has a ledger.
    pub fn open(&self, payer_id: UserId) -> Result<Ledger> {
        let ledger = Ledger::new(payer_id, self.clock.now());
        self.store.create_ledger(&ledger)?;
        tracing::info!(payer_id = %payer_id, "Ledger opened");
        Ok(ledger)
    }

    /// Fetch the ledger of `payer_id`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the payer has no ledger.
    pub fn get(&self, payer_id: &UserId) -> Result<Ledger> {
        self.store
            .get_ledger(payer_id)?
            .ok_or_else(|| MeterError::ledger_not_found(payer_id))
    }

    /// Debit up to `amount`, capped at the available balance.
    ///
    /// A debit never drives the balance negative: when the balance cannot
    /// cover `amount` the outcome is partial.
    ///
    /// # Errors
    ///
    /// Returns `InvalidAmount` for a non-positive amount, `NotFound` for a
    /// missing ledger and `Locked` if the lock stayed held through every
    /// retry.
    pub async fn debit(&self, payer_id: &UserId, amount: Decimal) -> Result<DebitOutcome> {
        ensure_positive(amount)?;
        let outcome = self
            .with_retry(|| self.debit_once(payer_id, amount))
            .await
            .map_err(|e| {
                if e.is_retryable() {
                    tracing::warn!(payer_id = %payer_id, amount = %amount, "Debit abandoned, ledger locked");
                }
                e
            })?;

        tracing::debug!(
            payer_id = %payer_id,
            requested = %outcome.requested,
            debited = %outcome.debited,
            new_balance = %outcome.new_balance,
            "Ledger debited"
        );
        Ok(outcome)
    }

    /// Add `amount` to the balance.
    ///
    /// # Errors
    ///
    /// Returns `InvalidAmount` for a non-positive amount, `NotFound` for a
    /// missing ledger and `Locked` if the lock stayed held through every
    /// retry.
    pub async fn credit(&self, payer_id: &UserId, amount: Decimal) -> Result<CreditOutcome> {
        ensure_positive(amount)?;
        let outcome = self.with_retry(|| self.credit_once(payer_id, amount)).await?;

        tracing::info!(
            payer_id = %payer_id,
            credited = %outcome.credited,
            new_balance = %outcome.new_balance,
            "Ledger credited"
        );
        Ok(outcome)
    }

    fn debit_once(&self, payer_id: &UserId, amount: Decimal) -> Result<DebitOutcome> {
        let (held, lease) = self.acquire(payer_id)?;
        let outcome = apply_debit(held.balance, amount);
        self.store
            .release_ledger_lock(payer_id, lease, outcome.new_balance, self.clock.now())?;
        Ok(outcome)
    }

    fn credit_once(&self, payer_id: &UserId, amount: Decimal) -> Result<CreditOutcome> {
        let (held, lease) = self.acquire(payer_id)?;
        let outcome = apply_credit(held.balance, amount);
        self.store
            .release_ledger_lock(payer_id, lease, outcome.new_balance, self.clock.now())?;
        Ok(outcome)
    }

    fn acquire(&self, payer_id: &UserId) -> Result<(Ledger, chrono::DateTime<chrono::Utc>)> {
        let held = self.store.acquire_ledger_lock(payer_id, self.clock.now())?;
        let lease = held.lock_acquired_at.ok_or_else(|| {
            MeterError::from(StoreError::Database(format!(
                "ledger {payer_id} locked without a lease"
            )))
        })?;
        Ok((held, lease))
    }

    async fn with_retry<T, F>(&self, mut attempt: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let strategy = ExponentialBackoff::from_millis(2)
            .factor(self.retry_base_ms)
            .max_delay(MAX_RETRY_DELAY)
            .map(jitter)
            .take(self.retry_attempts);

        RetryIf::spawn(
            strategy,
            || std::future::ready(attempt()),
            MeterError::is_retryable,
        )
        .await
    }
}

impl std::fmt::Debug for LedgerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerService")
            .field("retry_attempts", &self.retry_attempts)
            .field("retry_base_ms", &self.retry_base_ms)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MonotonicClock;
    use rust_decimal_macros::dec;
    use talkmeter_store::MemoryStore;

    fn service() -> (LedgerService, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let service = LedgerService::new(store.clone(), Arc::new(MonotonicClock::new()), 2, 1);
        (service, store)
    }

    #[tokio::test]
    async fn credit_then_debit() {
        let (ledgers, _) = service();
        let payer = UserId::generate();
        ledgers.open(payer).unwrap();

        let credited = ledgers.credit(&payer, dec!(10)).await.unwrap();
        assert_eq!(credited.new_balance, dec!(10));

        let debited = ledgers.debit(&payer, dec!(1)).await.unwrap();
        assert_eq!(debited.debited, dec!(1));
        assert_eq!(ledgers.get(&payer).unwrap().balance, dec!(9));
        assert!(!ledgers.get(&payer).unwrap().locked);
    }

    #[tokio::test]
    async fn debit_is_capped_at_balance() {
        let (ledgers, _) = service();
        let payer = UserId::generate();
        ledgers.open(payer).unwrap();
        ledgers.credit(&payer, dec!(0.5)).await.unwrap();

        let outcome = ledgers.debit(&payer, dec!(1)).await.unwrap();
        assert!(outcome.is_partial());
        assert_eq!(outcome.debited, dec!(0.5));
        assert_eq!(ledgers.get(&payer).unwrap().balance, dec!(0));
    }

    #[tokio::test]
    async fn held_lock_surfaces_as_locked_after_retries() {
        let (ledgers, store) = service();
        let payer = UserId::generate();
        ledgers.open(payer).unwrap();
        store.acquire_ledger_lock(&payer, chrono::Utc::now()).unwrap();

        let result = ledgers.debit(&payer, dec!(1)).await;
        assert!(matches!(result, Err(MeterError::Locked { .. })));
    }

    #[tokio::test]
    async fn rejects_non_positive_amounts() {
        let (ledgers, _) = service();
        let payer = UserId::generate();
        ledgers.open(payer).unwrap();

        assert!(matches!(
            ledgers.credit(&payer, dec!(0)).await,
            Err(MeterError::InvalidAmount(_))
        ));
        assert!(matches!(
            ledgers.debit(&payer, dec!(-1)).await,
            Err(MeterError::InvalidAmount(_))
        ));
    }

    #[tokio::test]
    async fn missing_ledger_is_not_retried() {
        let (ledgers, _) = service();
        let result = ledgers.debit(&UserId::generate(), dec!(1)).await;
        assert!(matches!(result, Err(MeterError::NotFound { .. })));
    }
}
