//! HTTP request handlers.

pub mod admin;
pub mod events;
pub mod health;
pub mod ledgers;
pub mod sessions;
