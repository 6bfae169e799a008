//! Live session events over WebSocket.
//!
//! Each connection sees the events addressed to its user, serialized as
//! JSON text frames. A connection that falls behind skips the events it
//! missed rather than slowing down the engine.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::Receiver;

use talkmeter_core::{EventEnvelope, UserId};

use crate::auth::authenticate;
use crate::error::ApiError;
use crate::state::AppState;

/// Query parameters for the events endpoint.
#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    /// Bearer token, for clients that cannot set headers on the upgrade.
    pub token: Option<String>,
}

/// Upgrade to a WebSocket streaming the caller's session events.
pub async fn events(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventsQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .or(query.token.as_deref())
        .ok_or(ApiError::Unauthorized)?;
    let user = authenticate(token, &state)?;

    // Subscribe before the upgrade so nothing published in between is lost.
    let events = state.events.subscribe();

    tracing::info!(user_id = %user.user_id, "Event stream connected");

    Ok(ws.on_upgrade(move |socket| stream_events(socket, events, user.user_id)))
}

async fn stream_events(socket: WebSocket, mut events: Receiver<EventEnvelope>, user: UserId) {
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            received = events.recv() => match received {
                Ok(envelope) => {
                    if !envelope.is_addressed_to(&user) {
                        continue;
                    }
                    let json = match serde_json::to_string(&envelope) {
                        Ok(json) => json,
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to serialize session event");
                            continue;
                        }
                    };
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(user_id = %user, skipped, "Event stream lagged");
                }
                Err(RecvError::Closed) => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                // Axum answers pings; clients have nothing else to say.
                Some(Ok(_)) => {}
            },
        }
    }

    tracing::info!(user_id = %user, "Event stream closed");
}
