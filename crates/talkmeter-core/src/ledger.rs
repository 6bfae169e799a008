//! Ledger types for talkmeter.
//!
//! A ledger is a payer's prepaid credit balance together with the persisted
//! mutual-exclusion flag guarding it. The balance arithmetic lives here as
//! pure functions; acquiring and releasing the flag is the store's job.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{MeterError, Result};
use crate::UserId;

/// A payer's credit balance record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ledger {
    /// The payer owning this balance.
    pub payer_id: UserId,

    /// Current balance in credit units. Never negative.
    pub balance: Decimal,

    /// Whether a debit/credit currently holds the ledger.
    pub locked: bool,

    /// When the current holder acquired the lock.
    ///
    /// Doubles as the lease token: the holder must present it to release.
    pub lock_acquired_at: Option<DateTime<Utc>>,

    /// When the ledger was opened.
    pub created_at: DateTime<Utc>,

    /// When the ledger was last written.
    pub updated_at: DateTime<Utc>,
}

impl Ledger {
    /// Open a new, unlocked ledger with zero balance.
    #[must_use]
    pub fn new(payer_id: UserId, now: DateTime<Utc>) -> Self {
        Self {
            payer_id,
            balance: Decimal::ZERO,
            locked: false,
            lock_acquired_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Check whether the balance covers `amount`.
    #[must_use]
    pub fn covers(&self, amount: Decimal) -> bool {
        self.balance >= amount
    }

    /// Whether the lock has been held since before `cutoff`.
    #[must_use]
    pub fn lock_held_since_before(&self, cutoff: DateTime<Utc>) -> bool {
        self.locked && self.lock_acquired_at.is_some_and(|at| at < cutoff)
    }
}

/// Result of applying a debit to a balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebitOutcome {
    /// Amount the caller asked for.
    pub requested: Decimal,
    /// Amount actually taken, capped at the available balance.
    pub debited: Decimal,
    /// Balance after the debit.
    pub new_balance: Decimal,
}

impl DebitOutcome {
    /// Whether the balance could not cover the full request.
    #[must_use]
    pub fn is_partial(&self) -> bool {
        self.debited < self.requested
    }
}

/// Result of applying a credit to a balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditOutcome {
    /// Amount added.
    pub credited: Decimal,
    /// Balance after the credit.
    pub new_balance: Decimal,
}

/// Reject zero, negative amounts.
///
/// # Errors
///
/// Returns `MeterError::InvalidAmount` unless `amount > 0`.
pub fn ensure_positive(amount: Decimal) -> Result<()> {
    if amount > Decimal::ZERO {
        Ok(())
    } else {
        Err(MeterError::InvalidAmount(format!(
            "amount must be positive, got {amount}"
        )))
    }
}

/// Take up to `amount` from `balance`, never going below zero.
#[must_use]
pub fn apply_debit(balance: Decimal, amount: Decimal) -> DebitOutcome {
    let debited = amount.min(balance).max(Decimal::ZERO);
    DebitOutcome {
        requested: amount,
        debited,
        new_balance: balance - debited,
    }
}

/// Add `amount` to `balance`.
#[must_use]
pub fn apply_credit(balance: Decimal, amount: Decimal) -> CreditOutcome {
    CreditOutcome {
        credited: amount,
        new_balance: balance + amount,
    }
}
