//! Admin handlers.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;

use talkmeter_engine::{RecoverySweeper, SweepReport};

use crate::auth::AdminAuth;
use crate::state::AppState;

/// Run one recovery sweep now instead of waiting for the next interval.
pub async fn sweep(State(state): State<Arc<AppState>>, admin: AdminAuth) -> Json<SweepReport> {
    let report = RecoverySweeper::new(state.engine.clone()).sweep().await;

    tracing::info!(
        admin_id = %admin.admin_id,
        expired = report.expired_sessions,
        orphaned = report.orphaned_sessions,
        timed_out = report.timed_out_requests,
        released_locks = report.released_locks,
        "Manual sweep completed"
    );

    Json(report)
}
