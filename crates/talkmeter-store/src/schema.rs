//! Database schema definitions and column families.
//!
//! This module defines the column families used in `RocksDB` storage.

/// Column family names for the `RocksDB` database.
pub mod cf {
    /// Ledger records, keyed by `payer_id`.
    pub const LEDGERS: &str = "ledgers";

    /// Session records, keyed by `session_id` (ULID).
    pub const SESSIONS: &str = "sessions";

    /// Index: sessions by status, keyed by `status_tag || session_id`.
    /// Value is empty (index only).
    pub const SESSIONS_BY_STATUS: &str = "sessions_by_status";

    /// Index: sessions by participant, keyed by `user_id || session_id`.
    /// Each session appears under both its payer and its provider.
    /// Value is empty (index only).
    pub const SESSIONS_BY_USER: &str = "sessions_by_user";
}

/// Returns all column family names for database initialization.
#[must_use]
pub fn all_column_families() -> Vec<&'static str> {
    vec![
        cf::LEDGERS,
        cf::SESSIONS,
        cf::SESSIONS_BY_STATUS,
        cf::SESSIONS_BY_USER,
    ]
}
