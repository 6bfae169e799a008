//! Core types and utilities for talkmeter.
//!
//! This crate provides the foundational types of the per-minute billing engine:
//!
//! - **Identifiers**: `UserId`, `SessionId`
//! - **Ledgers**: `Ledger` and the capped debit/credit arithmetic
//! - **Sessions**: `SessionRecord`, `SessionStatus`, `Deduction`
//! - **Events**: `SessionEvent`, `EventEnvelope`
//! - **Errors**: `MeterError` and its `ErrorKind` taxonomy
//!
//! # Credit units
//!
//! Balances and rates are `rust_decimal::Decimal` credit units. A ledger
//! balance never goes below zero: debits are capped at the available balance
//! and pro-rated charges are truncated, never rounded up.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod events;
pub mod ids;
pub mod ledger;
pub mod session;

pub use error::{ErrorKind, MeterError, Result};
pub use events::{EventEnvelope, SessionEvent};
pub use ids::{IdError, SessionId, UserId};
pub use ledger::{apply_credit, apply_debit, ensure_positive, CreditOutcome, DebitOutcome, Ledger};
pub use session::{
    allotted_seconds, amount_for_seconds, Deduction, DeductionKind, EndReason, LiveState, Role,
    SessionRecord, SessionStatus, SessionStatusView, CREDIT_SCALE, SECONDS_PER_MINUTE,
};
