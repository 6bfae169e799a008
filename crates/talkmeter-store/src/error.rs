//! Error types for talkmeter storage.

use talkmeter_core::MeterError;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur in storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(String),

    /// Serialization/deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Record not found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// The kind of record.
        entity: &'static str,
        /// The identifier that was looked up.
        id: String,
    },

    /// Record already exists.
    #[error("{entity} already exists: {id}")]
    AlreadyExists {
        /// The kind of record.
        entity: &'static str,
        /// The conflicting identifier.
        id: String,
    },

    /// The ledger lock is held by someone else.
    #[error("ledger locked: {payer_id}")]
    Locked {
        /// The payer whose ledger is locked.
        payer_id: String,
    },

    /// The caller's lease no longer matches the ledger's lock.
    ///
    /// Happens when the lock was force-released while the caller held it.
    #[error("ledger lease lost: {payer_id}")]
    LeaseLost {
        /// The payer whose ledger lease was lost.
        payer_id: String,
    },
}

impl From<StoreError> for MeterError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity, id } => Self::NotFound { entity, id },
            StoreError::AlreadyExists { entity, id } => Self::InvalidState {
                reason: format!("{entity} already exists: {id}"),
            },
            StoreError::Locked { payer_id } | StoreError::LeaseLost { payer_id } => {
                Self::Locked { payer_id }
            }
            StoreError::Database(msg) => Self::Storage(msg),
            StoreError::Serialization(msg) => Self::Serialization(msg),
        }
    }
}
