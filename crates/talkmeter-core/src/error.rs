//! Error types for talkmeter.

use rust_decimal::Decimal;
use serde::Serialize;

use crate::ids::IdError;
use crate::session::SessionStatus;

/// Result type for talkmeter operations.
pub type Result<T> = std::result::Result<T, MeterError>;

/// Errors that can occur in metering and billing operations.
#[derive(Debug, thiserror::Error)]
pub enum MeterError {
    /// A referenced session or ledger does not exist.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// The kind of record (`session`, `ledger`).
        entity: &'static str,
        /// The identifier that was looked up.
        id: String,
    },

    /// The actor is not allowed to perform the operation on this session.
    #[error("unauthorized: {reason}")]
    Unauthorized {
        /// Why the actor was refused.
        reason: String,
    },

    /// The transition is not legal from the current state.
    #[error("invalid state: {reason}")]
    InvalidState {
        /// Human readable description of the refused transition.
        reason: String,
    },

    /// The balance cannot cover the next billable unit.
    #[error("insufficient funds: balance={balance}, required={required}")]
    InsufficientFunds {
        /// Ledger balance at the time of the check.
        balance: Decimal,
        /// Amount that was required.
        required: Decimal,
    },

    /// The ledger mutex is held by a concurrent operation.
    #[error("ledger locked: {payer_id}")]
    Locked {
        /// The payer whose ledger is locked.
        payer_id: String,
    },

    /// A session lost its driver and was repaired by the sweeper.
    #[error("orphaned session: {session_id}")]
    Orphaned {
        /// The repaired session.
        session_id: String,
    },

    /// Invalid monetary amount.
    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    /// Invalid identifier.
    #[error("invalid identifier: {0}")]
    InvalidId(#[from] IdError),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl MeterError {
    /// Shorthand for a session that does not exist.
    pub fn session_not_found(id: impl ToString) -> Self {
        Self::NotFound {
            entity: "session",
            id: id.to_string(),
        }
    }

    /// Shorthand for a ledger that does not exist.
    pub fn ledger_not_found(id: impl ToString) -> Self {
        Self::NotFound {
            entity: "ledger",
            id: id.to_string(),
        }
    }

    /// Shorthand for a transition refused from `status`.
    #[must_use]
    pub fn invalid_transition(action: &str, status: SessionStatus) -> Self {
        Self::InvalidState {
            reason: format!("cannot {action} a session that is {status}"),
        }
    }

    /// The taxonomy kind of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Unauthorized { .. } => ErrorKind::Unauthorized,
            Self::InvalidState { .. } => ErrorKind::InvalidState,
            Self::InsufficientFunds { .. } => ErrorKind::InsufficientFunds,
            Self::Locked { .. } => ErrorKind::Locked,
            Self::Orphaned { .. } => ErrorKind::Orphaned,
            Self::InvalidAmount(_) | Self::InvalidId(_) => ErrorKind::InvalidInput,
            Self::Storage(_) | Self::Serialization(_) | Self::Configuration(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Whether the operation may succeed if simply retried.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Locked { .. })
    }
}

/// Error taxonomy reported to callers alongside the human-readable reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Referenced record does not exist.
    NotFound,
    /// Actor is not a participant, or has the wrong role.
    Unauthorized,
    /// Transition not legal from the current state.
    InvalidState,
    /// Balance cannot cover the next billable unit.
    InsufficientFunds,
    /// Ledger mutex contention outlasted the retry budget.
    Locked,
    /// Detected and repaired by the recovery sweeper.
    Orphaned,
    /// Malformed amount or identifier.
    InvalidInput,
    /// Storage, serialization or configuration failure.
    Internal,
}

impl ErrorKind {
    /// Stable snake-case code for this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Unauthorized => "unauthorized",
            Self::InvalidState => "invalid_state",
            Self::InsufficientFunds => "insufficient_funds",
            Self::Locked => "locked",
            Self::Orphaned => "orphaned",
            Self::InvalidInput => "invalid_input",
            Self::Internal => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_locked_is_retryable() {
        let locked = MeterError::Locked {
            payer_id: "p".into(),
        };
        assert!(locked.is_retryable());
        assert_eq!(locked.kind(), ErrorKind::Locked);

        let missing = MeterError::session_not_found("abc");
        assert!(!missing.is_retryable());
        assert_eq!(missing.kind(), ErrorKind::NotFound);
        assert_eq!(missing.to_string(), "session not found: abc");
    }

    #[test]
    fn invalid_transition_names_the_status() {
        let err = MeterError::invalid_transition("pause", SessionStatus::Pending);
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert_eq!(
            err.to_string(),
            "invalid state: cannot pause a session that is pending"
        );
    }
}
