//! Session handlers.
//!
//! Every route acts as the authenticated caller; the engine decides whether
//! that caller is the payer or the provider and refuses everything else.

use std::sync::Arc;

use axum::async_trait;
use axum::extract::{FromRequestParts, Path, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::Json;
use rust_decimal::Decimal;
use serde::Deserialize;

use talkmeter_core::{SessionId, SessionRecord, SessionStatusView, UserId};

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::state::AppState;

/// A session id taken from the request path.
///
/// Anything that is not a ULID is refused as invalid input.
pub struct SessionPath(pub SessionId);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for SessionPath {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Path(raw) = Path::<String>::from_request_parts(parts, state)
            .await
            .map_err(|e| ApiError::BadRequest(e.body_text()))?;
        raw.parse()
            .map(Self)
            .map_err(|e| ApiError::BadRequest(format!("invalid session id {raw:?}: {e}")))
    }
}

/// Session request body.
#[derive(Debug, Deserialize)]
pub struct RequestSessionBody {
    /// Who the caller wants to talk to.
    pub provider_id: UserId,
    /// Quoted rate; the configured default when omitted.
    #[serde(default)]
    pub rate_per_minute: Option<Decimal>,
}

/// Ask a provider for a session, paying as the caller.
pub async fn request_session(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Json(body): Json<RequestSessionBody>,
) -> Result<(StatusCode, Json<SessionStatusView>), ApiError> {
    let view = state
        .engine
        .request_session(auth.user_id, body.provider_id, body.rate_per_minute)
        .await?;
    Ok((StatusCode::CREATED, Json(view)))
}

/// List the caller's sessions, newest first.
pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
) -> Result<Json<Vec<SessionStatusView>>, ApiError> {
    Ok(Json(state.engine.list_sessions(auth.user_id)?))
}

/// Full session record including deductions.
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    SessionPath(id): SessionPath,
) -> Result<Json<SessionRecord>, ApiError> {
    Ok(Json(state.engine.session(id, auth.user_id)?))
}

/// Live status of a session.
pub async fn session_status(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    SessionPath(id): SessionPath,
) -> Result<Json<SessionStatusView>, ApiError> {
    Ok(Json(state.engine.status(id, auth.user_id)?))
}

/// Provider accepts a pending request.
pub async fn accept(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    SessionPath(id): SessionPath,
) -> Result<Json<SessionStatusView>, ApiError> {
    Ok(Json(state.engine.accept(id, auth.user_id).await?))
}

/// Provider declines a pending request.
pub async fn reject(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    SessionPath(id): SessionPath,
) -> Result<Json<SessionStatusView>, ApiError> {
    Ok(Json(state.engine.reject(id, auth.user_id).await?))
}

/// Payer withdraws a pending request.
pub async fn cancel(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    SessionPath(id): SessionPath,
) -> Result<Json<SessionStatusView>, ApiError> {
    Ok(Json(state.engine.cancel(id, auth.user_id).await?))
}

/// Payer starts metering an accepted session.
pub async fn start(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    SessionPath(id): SessionPath,
) -> Result<Json<SessionStatusView>, ApiError> {
    Ok(Json(state.engine.start(id, auth.user_id).await?))
}

/// Either participant suspends metering.
pub async fn pause(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    SessionPath(id): SessionPath,
) -> Result<Json<SessionStatusView>, ApiError> {
    Ok(Json(state.engine.pause(id, auth.user_id).await?))
}

/// Either participant resumes metering.
pub async fn resume(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    SessionPath(id): SessionPath,
) -> Result<Json<SessionStatusView>, ApiError> {
    Ok(Json(state.engine.resume(id, auth.user_id).await?))
}

/// Either participant ends the session.
pub async fn stop(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    SessionPath(id): SessionPath,
) -> Result<Json<SessionStatusView>, ApiError> {
    let view = state.engine.stop(id, auth.user_id).await?;

    tracing::info!(
        session_id = %id,
        actor = %auth.user_id,
        total_amount_paid = %view.total_amount_paid,
        "Session stopped"
    );

    Ok(Json(view))
}
