//! Talkmeter HTTP API Service.
//!
//! This crate exposes the metering engine over HTTP:
//!
//! - Ledger management and admin credits
//! - The session lifecycle (request, accept, start, pause, resume, stop)
//! - A WebSocket stream of live session events
//! - Manual recovery sweeps
//!
//! # Authentication
//!
//! 1. **HS256 JWT tokens** - For participants; the `sub` claim is the user ID
//! 2. **Admin API key** - The `X-Admin-Key` header, for privileged endpoints

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
// Allow some pedantic lints that are noisy for Axum handler functions
#![allow(clippy::missing_errors_doc)] // Axum handlers all return Result
#![allow(clippy::unused_async)] // Axum handlers must be async

pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod routes;
pub mod state;

pub use config::ServiceConfig;
pub use error::ApiError;
pub use routes::create_router;
pub use state::AppState;
