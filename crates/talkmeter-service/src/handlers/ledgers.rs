//! Ledger handlers.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use talkmeter_core::{Ledger, UserId};

use crate::auth::{AdminAuth, AuthUser};
use crate::error::ApiError;
use crate::state::AppState;

/// Ledger response.
#[derive(Debug, Serialize)]
pub struct LedgerResponse {
    /// Payer ID.
    pub payer_id: UserId,
    /// Current balance in credits.
    pub balance: Decimal,
    /// Whether an operation currently holds the ledger lock.
    pub locked: bool,
    /// Created timestamp.
    pub created_at: String,
    /// Last update timestamp.
    pub updated_at: String,
}

impl From<&Ledger> for LedgerResponse {
    fn from(ledger: &Ledger) -> Self {
        Self {
            payer_id: ledger.payer_id,
            balance: ledger.balance,
            locked: ledger.locked,
            created_at: ledger.created_at.to_rfc3339(),
            updated_at: ledger.updated_at.to_rfc3339(),
        }
    }
}

/// Open a ledger for the caller.
pub async fn open_ledger(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
) -> Result<(StatusCode, Json<LedgerResponse>), ApiError> {
    let ledger = state.engine.ledgers().open(auth.user_id)?;

    Ok((StatusCode::CREATED, Json(LedgerResponse::from(&ledger))))
}

/// Get the caller's ledger.
pub async fn get_ledger(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
) -> Result<Json<LedgerResponse>, ApiError> {
    let ledger = state.engine.ledgers().get(&auth.user_id)?;
    Ok(Json(LedgerResponse::from(&ledger)))
}

/// Admin credit request.
#[derive(Debug, Deserialize)]
pub struct CreditRequest {
    /// Ledger to credit.
    pub payer_id: UserId,
    /// Credits to add.
    pub amount: Decimal,
    /// Free-form reason recorded in the audit log.
    #[serde(default)]
    pub reason: Option<String>,
}

/// Credit response.
#[derive(Debug, Serialize)]
pub struct CreditResponse {
    /// Credits added.
    pub credited: Decimal,
    /// Balance after the credit.
    pub new_balance: Decimal,
}

/// Add credits to a ledger (admin only).
pub async fn credit_ledger(
    State(state): State<Arc<AppState>>,
    admin: AdminAuth,
    Json(body): Json<CreditRequest>,
) -> Result<Json<CreditResponse>, ApiError> {
    let outcome = state
        .engine
        .ledgers()
        .credit(&body.payer_id, body.amount)
        .await?;

    tracing::info!(
        admin_id = %admin.admin_id,
        payer_id = %body.payer_id,
        amount = %outcome.credited,
        new_balance = %outcome.new_balance,
        reason = body.reason.as_deref().unwrap_or("-"),
        "Ledger credited"
    );

    Ok(Json(CreditResponse {
        credited: outcome.credited,
        new_balance: outcome.new_balance,
    }))
}
