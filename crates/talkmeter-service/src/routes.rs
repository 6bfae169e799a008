//! Router configuration.
//!
//! This module sets up the Axum router with all routes and middleware.

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::{admin, events, health, ledgers, sessions};
use crate::state::AppState;

// ============================================================================
// Concurrency Limiting Constants
// ============================================================================

/// Maximum concurrent requests for session lifecycle endpoints.
const SESSION_MAX_CONCURRENT_REQUESTS: usize = 100;

/// Maximum concurrent requests for general API endpoints.
const API_MAX_CONCURRENT_REQUESTS: usize = 50;

/// Create the service router with all routes and middleware.
///
/// # Routes
///
/// ## Public
/// - `GET /health` - Health check
///
/// ## Ledgers (JWT auth)
/// - `POST /v1/ledgers` - Open a ledger for the caller
/// - `GET /v1/ledgers/me` - Get the caller's ledger
/// - `POST /v1/ledgers/credit` - Add credits (admin key)
///
/// ## Sessions (JWT auth, rate-limited)
/// - `POST /v1/sessions` - Request a session as payer
/// - `GET /v1/sessions` - List the caller's sessions
/// - `GET /v1/sessions/:id` - Full session record
/// - `GET /v1/sessions/:id/status` - Remaining time and balance
/// - `POST /v1/sessions/:id/{accept,reject,cancel,start,pause,resume,stop}`
///
/// ## Admin (admin key)
/// - `POST /v1/admin/sweep` - Run a recovery sweep now
///
/// ## Events (JWT via header or `?token=`)
/// - `GET /v1/events` - WebSocket stream of the caller's session events
pub fn create_router(state: AppState) -> Router {
    // Extract config values before moving state
    let cors_origins = state.config.cors_origins.clone();
    let max_body_bytes = state.config.max_body_bytes;
    let request_timeout_seconds = state.config.request_timeout_seconds;

    let cors = build_cors_layer(&cors_origins);

    let state = Arc::new(state);

    let session_routes = Router::new()
        .route(
            "/",
            post(sessions::request_session).get(sessions::list_sessions),
        )
        .route("/:id", get(sessions::get_session))
        .route("/:id/status", get(sessions::session_status))
        .route("/:id/accept", post(sessions::accept))
        .route("/:id/reject", post(sessions::reject))
        .route("/:id/cancel", post(sessions::cancel))
        .route("/:id/start", post(sessions::start))
        .route("/:id/pause", post(sessions::pause))
        .route("/:id/resume", post(sessions::resume))
        .route("/:id/stop", post(sessions::stop))
        .layer(ConcurrencyLimitLayer::new(SESSION_MAX_CONCURRENT_REQUESTS));

    let api_routes = Router::new()
        // Ledgers
        .route("/ledgers", post(ledgers::open_ledger))
        .route("/ledgers/me", get(ledgers::get_ledger))
        .route("/ledgers/credit", post(ledgers::credit_ledger))
        // Admin
        .route("/admin/sweep", post(admin::sweep))
        .nest("/sessions", session_routes)
        .layer(ConcurrencyLimitLayer::new(API_MAX_CONCURRENT_REQUESTS));

    // Long-lived streams stay outside the limits and the request timeout.
    let stream_routes = Router::new().route("/v1/events", get(events::events));

    Router::new()
        // Health (public, no rate limit)
        .route("/health", get(health::health))
        .nest("/v1", api_routes)
        // Global middleware
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .layer(TimeoutLayer::new(Duration::from_secs(
            request_timeout_seconds,
        )))
        .merge(stream_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Build the CORS layer from configured origins.
fn build_cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}
