//! Session records for talkmeter.
//!
//! A [`SessionRecord`] is the persisted state of one metered conversation,
//! from the payer's request through to completion. The methods here are pure
//! state updates; the engine decides when to call them and persists the
//! result.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::{SessionId, UserId};

/// Decimal places kept when pro-rating a partial minute.
///
/// Pro-rated amounts are truncated, never rounded up.
pub const CREDIT_SCALE: u32 = 8;

/// Seconds in one billable unit.
pub const SECONDS_PER_MINUTE: u64 = 60;

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Requested by the payer, awaiting the provider.
    Pending,
    /// Accepted by the provider, awaiting the payer's start.
    Accepted,
    /// Declined by the provider.
    Rejected,
    /// Live and being metered (possibly paused).
    Active,
    /// Ended normally: stopped, ran out of time, or ran out of funds.
    Completed,
    /// Withdrawn by the payer before acceptance.
    Cancelled,
    /// Abandoned and closed by the recovery sweeper.
    Expired,
}

impl SessionStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [Self; 7] = [
        Self::Pending,
        Self::Accepted,
        Self::Rejected,
        Self::Active,
        Self::Completed,
        Self::Cancelled,
        Self::Expired,
    ];

    /// Stable snake-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }

    /// Single-byte tag used in storage index keys.
    #[must_use]
    pub const fn tag(self) -> u8 {
        match self {
            Self::Pending => 1,
            Self::Accepted => 2,
            Self::Rejected => 3,
            Self::Active => 4,
            Self::Completed => 5,
            Self::Cancelled => 6,
            Self::Expired => 7,
        }
    }

    /// Whether no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Rejected | Self::Completed | Self::Cancelled | Self::Expired
        )
    }

    /// Whether the session blocks a new request between the same pair.
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Pending | Self::Accepted | Self::Active)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// A participant stopped it.
    Manual,
    /// The allotted time ran out.
    TimeExpired,
    /// The ledger could not cover a minute boundary.
    InsufficientFunds,
    /// Its driver died and the sweeper closed it.
    Orphaned,
    /// It was never accepted or started in time.
    RequestTimeout,
}

/// The live-metering sub-state of an active session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveState {
    /// Set once the payer starts the session, cleared when it ends.
    pub is_active: bool,
    /// Whether metering is currently suspended.
    pub is_paused: bool,
    /// When the payer started the session.
    pub started_at: Option<DateTime<Utc>>,
    /// When the current pause began.
    pub paused_at: Option<DateTime<Utc>>,
    /// Total wall-clock seconds spent paused.
    pub accumulated_pause_seconds: u64,
    /// Point up to which elapsed time has been applied.
    pub last_tick_at: Option<DateTime<Utc>>,
}

/// Whether a deduction was a minute-boundary charge or the closing charge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeductionKind {
    /// Charged when cumulative active time crossed a multiple of 60 seconds.
    Minute,
    /// Charged at stop/expiry for seconds since the last boundary.
    Closing,
}

/// One debit posted against the payer's ledger for this session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deduction {
    /// When the debit was posted.
    pub timestamp: DateTime<Utc>,
    /// Active seconds this debit pays for.
    pub seconds_covered: u64,
    /// Credits actually taken.
    pub amount: Decimal,
    /// Ledger balance reported right after the debit.
    pub balance_after: Decimal,
    /// Minute boundary or closing charge.
    pub kind: DeductionKind,
}

/// The persisted state of one metered conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Session identifier.
    pub id: SessionId,
    /// The paying party.
    pub payer_id: UserId,
    /// The service provider.
    pub provider_id: UserId,
    /// Current lifecycle status.
    pub status: SessionStatus,
    /// Credits charged per active minute. Always positive.
    pub rate_per_minute: Decimal,
    /// Ledger balance captured when the session was accepted/started.
    pub initial_balance: Decimal,
    /// `initial_balance - total_amount_paid`.
    pub remaining_balance: Decimal,
    /// Active seconds the captured balance pays for.
    pub allotted_seconds: u64,
    /// Active seconds still available.
    pub remaining_seconds: u64,
    /// Live-metering sub-state.
    pub live: LiveState,
    /// Append-only debit history, in posting order.
    pub deductions: Vec<Deduction>,
    /// Sum of `deductions[].amount`.
    pub total_amount_paid: Decimal,
    /// Why the session ended, once it has.
    pub end_reason: Option<EndReason>,
    /// When the session was requested.
    pub created_at: DateTime<Utc>,
    /// When the record was last written.
    pub updated_at: DateTime<Utc>,
    /// When the session reached a terminal status.
    pub ended_at: Option<DateTime<Utc>>,
}

/// A participant's role on a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The paying party.
    Payer,
    /// The service provider.
    Provider,
}

impl SessionRecord {
    /// Create a pending request.
    #[must_use]
    pub fn request(
        payer_id: UserId,
        provider_id: UserId,
        rate_per_minute: Decimal,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: SessionId::generate(),
            payer_id,
            provider_id,
            status: SessionStatus::Pending,
            rate_per_minute,
            initial_balance: Decimal::ZERO,
            remaining_balance: Decimal::ZERO,
            allotted_seconds: 0,
            remaining_seconds: 0,
            live: LiveState::default(),
            deductions: Vec::new(),
            total_amount_paid: Decimal::ZERO,
            end_reason: None,
            created_at: now,
            updated_at: now,
            ended_at: None,
        }
    }

    /// The role `actor` plays on this session, if any.
    #[must_use]
    pub fn role_of(&self, actor: &UserId) -> Option<Role> {
        if *actor == self.payer_id {
            Some(Role::Payer)
        } else if *actor == self.provider_id {
            Some(Role::Provider)
        } else {
            None
        }
    }

    /// Whether metering is running: active and not paused.
    #[must_use]
    pub fn is_metering(&self) -> bool {
        self.status == SessionStatus::Active && self.live.is_active && !self.live.is_paused
    }

    /// Capture `balance` as the funds backing this session.
    pub fn snapshot_balance(&mut self, balance: Decimal) {
        let allotted = allotted_seconds(balance, self.rate_per_minute);
        self.initial_balance = balance;
        self.remaining_balance = balance;
        self.allotted_seconds = allotted;
        self.remaining_seconds = allotted;
        self.total_amount_paid = Decimal::ZERO;
    }

    /// Flip to `active` with metering starting at `now`.
    pub fn begin(&mut self, now: DateTime<Utc>) {
        self.status = SessionStatus::Active;
        self.live = LiveState {
            is_active: true,
            is_paused: false,
            started_at: Some(now),
            paused_at: None,
            accumulated_pause_seconds: 0,
            last_tick_at: Some(now),
        };
        self.updated_at = now;
    }

    /// Apply the whole seconds elapsed since `last_tick_at`.
    ///
    /// Returns the number of seconds taken off `remaining_seconds`. Any
    /// sub-second remainder stays pending for the next call.
    pub fn advance(&mut self, now: DateTime<Utc>) -> u64 {
        let Some(last) = self.live.last_tick_at else {
            return 0;
        };
        let whole = (now - last).num_seconds();
        if whole <= 0 {
            return 0;
        }
        let applied = u64::try_from(whole)
            .unwrap_or(0)
            .min(self.remaining_seconds);
        self.remaining_seconds -= applied;
        self.live.last_tick_at = Some(last + Duration::seconds(whole));
        self.updated_at = now;
        applied
    }

    /// Suspend metering at `now`.
    pub fn pause(&mut self, now: DateTime<Utc>) {
        self.live.is_paused = true;
        self.live.paused_at = Some(now);
        self.updated_at = now;
    }

    /// Resume metering at `now`; the paused interval is never billed.
    ///
    /// `last_tick_at` moves forward by exactly the paused interval, so a
    /// sub-second remainder pending at the pause is still billed.
    pub fn resume(&mut self, now: DateTime<Utc>) {
        let paused = self
            .live
            .paused_at
            .take()
            .map_or_else(Duration::zero, |paused_at| (now - paused_at).max(Duration::zero()));
        self.live.accumulated_pause_seconds += u64::try_from(paused.num_seconds()).unwrap_or(0);
        self.live.is_paused = false;
        self.live.last_tick_at = Some(self.live.last_tick_at.map_or(now, |last| last + paused));
        self.updated_at = now;
    }

    /// Active seconds consumed so far.
    #[must_use]
    pub fn seconds_used(&self) -> u64 {
        self.allotted_seconds.saturating_sub(self.remaining_seconds)
    }

    /// Minute boundaries crossed by the active time so far.
    #[must_use]
    pub fn minutes_due(&self) -> u64 {
        self.seconds_used() / SECONDS_PER_MINUTE
    }

    /// Minute-boundary debits already posted.
    #[must_use]
    pub fn minutes_billed(&self) -> u64 {
        self.deductions
            .iter()
            .filter(|d| d.kind == DeductionKind::Minute)
            .count() as u64
    }

    /// Active seconds already paid for by posted minute debits.
    #[must_use]
    pub fn seconds_billed(&self) -> u64 {
        self.minutes_billed() * SECONDS_PER_MINUTE
    }

    /// What the time used so far costs, pro-rated to the second.
    #[must_use]
    pub fn amount_owed(&self) -> Decimal {
        amount_for_seconds(self.seconds_used(), self.rate_per_minute)
    }

    /// What is owed but not yet captured by a deduction.
    #[must_use]
    pub fn uncaptured_amount(&self) -> Decimal {
        (self.amount_owed() - self.total_amount_paid).max(Decimal::ZERO)
    }

    /// Append a deduction and keep the running totals consistent.
    pub fn record_deduction(&mut self, deduction: Deduction) {
        self.total_amount_paid += deduction.amount;
        self.remaining_balance = (self.initial_balance - self.total_amount_paid).max(Decimal::ZERO);
        self.updated_at = deduction.timestamp;
        self.deductions.push(deduction);
    }

    /// Move to a terminal status.
    pub fn finish(&mut self, status: SessionStatus, reason: EndReason, now: DateTime<Utc>) {
        self.status = status;
        self.end_reason = Some(reason);
        self.live.is_active = false;
        self.live.is_paused = false;
        self.ended_at = Some(now);
        self.updated_at = now;
        if matches!(reason, EndReason::TimeExpired | EndReason::InsufficientFunds) {
            self.remaining_seconds = 0;
        }
    }

    /// A caller-facing summary of the session.
    #[must_use]
    pub fn status_view(&self) -> SessionStatusView {
        SessionStatusView {
            id: self.id,
            payer_id: self.payer_id,
            provider_id: self.provider_id,
            status: self.status,
            rate_per_minute: self.rate_per_minute,
            allotted_seconds: self.allotted_seconds,
            remaining_seconds: self.remaining_seconds,
            remaining_balance: self.remaining_balance,
            total_amount_paid: self.total_amount_paid,
            is_paused: self.live.is_paused,
            end_reason: self.end_reason,
        }
    }
}

/// Current remaining time and balance of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatusView {
    /// Session identifier.
    pub id: SessionId,
    /// The paying party.
    pub payer_id: UserId,
    /// The service provider.
    pub provider_id: UserId,
    /// Lifecycle status.
    pub status: SessionStatus,
    /// Credits per active minute.
    pub rate_per_minute: Decimal,
    /// Active seconds the captured balance paid for.
    pub allotted_seconds: u64,
    /// Active seconds left.
    pub remaining_seconds: u64,
    /// Captured balance not yet charged.
    pub remaining_balance: Decimal,
    /// Charged so far.
    pub total_amount_paid: Decimal,
    /// Whether metering is suspended.
    pub is_paused: bool,
    /// Why it ended, if it has.
    pub end_reason: Option<EndReason>,
}

/// Active seconds that `balance` pays for at `rate_per_minute`.
#[must_use]
pub fn allotted_seconds(balance: Decimal, rate_per_minute: Decimal) -> u64 {
    if rate_per_minute <= Decimal::ZERO || balance <= Decimal::ZERO {
        return 0;
    }
    (balance * Decimal::from(SECONDS_PER_MINUTE) / rate_per_minute)
        .floor()
        .to_u64()
        .unwrap_or(0)
}

/// Cost of `seconds` of active time at `rate_per_minute`, truncated.
#[must_use]
pub fn amount_for_seconds(seconds: u64, rate_per_minute: Decimal) -> Decimal {
    (Decimal::from(seconds) * rate_per_minute / Decimal::from(SECONDS_PER_MINUTE))
        .round_dp_with_strategy(CREDIT_SCALE, RoundingStrategy::ToZero)
}
