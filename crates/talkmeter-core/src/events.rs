//! Outbound session events.
//!
//! Every event is wrapped in an [`EventEnvelope`] addressed to both
//! participants. Delivery is best-effort; nothing in the engine waits on it.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::session::{EndReason, SessionRecord};
use crate::{SessionId, UserId};

/// Something that happened to a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// The payer asked a provider for a session.
    RequestCreated {
        /// Quoted rate.
        rate_per_minute: Decimal,
    },
    /// The provider accepted.
    RequestAccepted {
        /// Seconds the payer's balance covers at acceptance.
        allotted_seconds: u64,
    },
    /// The provider declined.
    RequestRejected,
    /// The payer withdrew the request.
    RequestCancelled,
    /// Metering began.
    SessionStarted {
        /// Seconds the captured balance covers.
        allotted_seconds: u64,
        /// Captured balance.
        initial_balance: Decimal,
    },
    /// Periodic progress.
    Tick {
        /// Active seconds left.
        remaining_seconds: u64,
        /// Captured balance not yet charged.
        remaining_balance: Decimal,
    },
    /// Fewer than the warning threshold of seconds remain.
    BalanceLow {
        /// Active seconds left.
        remaining_seconds: u64,
        /// Captured balance not yet charged.
        remaining_balance: Decimal,
    },
    /// A debit was posted.
    BalanceDeducted {
        /// Credits taken.
        amount: Decimal,
        /// Ledger balance after the debit.
        balance_after: Decimal,
        /// Active seconds the debit pays for.
        seconds_covered: u64,
    },
    /// Metering was suspended.
    SessionPaused {
        /// Active seconds left.
        remaining_seconds: u64,
    },
    /// Metering resumed.
    SessionResumed {
        /// Active seconds left.
        remaining_seconds: u64,
    },
    /// The session reached a terminal status.
    SessionEnded {
        /// Why it ended.
        reason: EndReason,
        /// Total charged over the session.
        total_amount_paid: Decimal,
    },
}

impl SessionEvent {
    /// Stable snake-case name of the event type.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::RequestCreated { .. } => "request_created",
            Self::RequestAccepted { .. } => "request_accepted",
            Self::RequestRejected => "request_rejected",
            Self::RequestCancelled => "request_cancelled",
            Self::SessionStarted { .. } => "session_started",
            Self::Tick { .. } => "tick",
            Self::BalanceLow { .. } => "balance_low",
            Self::BalanceDeducted { .. } => "balance_deducted",
            Self::SessionPaused { .. } => "session_paused",
            Self::SessionResumed { .. } => "session_resumed",
            Self::SessionEnded { .. } => "session_ended",
        }
    }
}

/// An event addressed to a session's participants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// The session the event belongs to.
    pub session_id: SessionId,
    /// Channels the event is addressed to (payer and provider).
    pub recipients: [UserId; 2],
    /// When the event was produced.
    pub at: DateTime<Utc>,
    /// The event itself.
    #[serde(flatten)]
    pub event: SessionEvent,
}

impl EventEnvelope {
    /// Address `event` to both participants of `record`.
    #[must_use]
    pub fn for_session(record: &SessionRecord, event: SessionEvent, at: DateTime<Utc>) -> Self {
        Self {
            session_id: record.id,
            recipients: [record.payer_id, record.provider_id],
            at,
            event,
        }
    }

    /// Whether `user` is one of the recipients.
    #[must_use]
    pub fn is_addressed_to(&self, user: &UserId) -> bool {
        self.recipients.contains(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn envelope_is_addressed_to_both_participants() {
        let record = SessionRecord::request(
            UserId::generate(),
            UserId::generate(),
            dec!(1),
            Utc::now(),
        );
        let envelope = EventEnvelope::for_session(&record, SessionEvent::RequestRejected, Utc::now());
        assert!(envelope.is_addressed_to(&record.payer_id));
        assert!(envelope.is_addressed_to(&record.provider_id));
        assert!(!envelope.is_addressed_to(&UserId::generate()));
    }

    #[test]
    fn envelope_json_is_flat_and_tagged() {
        let record = SessionRecord::request(
            UserId::generate(),
            UserId::generate(),
            dec!(1),
            Utc::now(),
        );
        let envelope = EventEnvelope::for_session(
            &record,
            SessionEvent::SessionEnded {
                reason: EndReason::InsufficientFunds,
                total_amount_paid: dec!(3),
            },
            Utc::now(),
        );
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["type"], "session_ended");
        assert_eq!(json["reason"], "insufficient_funds");
        assert_eq!(json["session_id"], record.id.to_string());
        assert_eq!(envelope.event.name(), "session_ended");
    }
}
