//! Key encoding utilities for `RocksDB`.
//!
//! This module provides functions for encoding and decoding keys used in column families.

use talkmeter_core::{SessionId, SessionStatus, UserId};

/// Create a ledger key from a payer ID.
#[must_use]
pub fn ledger_key(payer_id: &UserId) -> Vec<u8> {
    payer_id.as_bytes().to_vec()
}

/// Create a session key from a session ID.
#[must_use]
pub fn session_key(session_id: &SessionId) -> Vec<u8> {
    session_id.to_bytes().to_vec()
}

/// Create a status index key.
///
/// Format: `status_tag (1 byte) || session_id (16 bytes)`
///
/// Since ULIDs are time-ordered, sessions within a status sort oldest first.
#[must_use]
pub fn status_session_key(status: SessionStatus, session_id: &SessionId) -> Vec<u8> {
    let mut key = Vec::with_capacity(17);
    key.push(status.tag());
    key.extend_from_slice(&session_id.to_bytes());
    key
}

/// Create a prefix for iterating all sessions in a status.
#[must_use]
pub fn status_prefix(status: SessionStatus) -> Vec<u8> {
    vec![status.tag()]
}

/// Create a participant index key.
///
/// Format: `user_id (16 bytes) || session_id (16 bytes)`
#[must_use]
pub fn user_session_key(user_id: &UserId, session_id: &SessionId) -> Vec<u8> {
    let mut key = Vec::with_capacity(32);
    key.extend_from_slice(user_id.as_bytes());
    key.extend_from_slice(&session_id.to_bytes());
    key
}

/// Create a prefix for iterating all sessions of a participant.
#[must_use]
pub fn user_sessions_prefix(user_id: &UserId) -> Vec<u8> {
    user_id.as_bytes().to_vec()
}

/// Extract the trailing session ID from an index key.
///
/// Returns `None` if the key is shorter than 16 bytes.
#[must_use]
pub fn extract_session_id(key: &[u8]) -> Option<SessionId> {
    let start = key.len().checked_sub(16)?;
    let bytes: [u8; 16] = key[start..].try_into().ok()?;
    Some(SessionId::from_bytes(bytes))
}
