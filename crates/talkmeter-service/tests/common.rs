//! Common test utilities for talkmeter integration tests.

#![allow(dead_code)] // Some utilities are used by different test files

use std::sync::Arc;

use axum::Router;
use axum_test::TestServer;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::json;

use talkmeter_core::UserId;
use talkmeter_service::auth::JwtClaims;
use talkmeter_service::{create_router, AppState, ServiceConfig};
use talkmeter_store::MemoryStore;

pub const JWT_SECRET: &str = "test-jwt-secret";
pub const AUDIENCE: &str = "talkmeter";
pub const ADMIN_KEY: &str = "test-admin-key";

/// Test harness containing everything needed for integration tests.
pub struct TestHarness {
    /// The test server for making HTTP requests.
    pub server: TestServer,
    /// Shared state, for inspecting the engine directly.
    pub state: AppState,
}

impl TestHarness {
    /// Create a new test harness with a fresh in-memory store.
    pub fn new() -> Self {
        let config = ServiceConfig {
            listen_addr: "127.0.0.1:0".into(),
            auth_jwt_secret: Some(JWT_SECRET.into()),
            auth_audience: AUDIENCE.into(),
            admin_api_key: Some(ADMIN_KEY.into()),
            ..ServiceConfig::default()
        };

        let state = AppState::new(Arc::new(MemoryStore::new()), config)
            .expect("Failed to build app state");
        let router: Router = create_router(state.clone());

        let server = TestServer::new(router).expect("Failed to create test server");

        Self { server, state }
    }

    /// Bearer header carrying a valid token for `user`.
    pub fn auth_header(user: UserId) -> String {
        format!("Bearer {}", token_for(user, AUDIENCE, JWT_SECRET))
    }

    /// Open a ledger for a fresh user and credit it with `balance`.
    pub async fn funded_user(&self, balance: &str) -> UserId {
        let user = UserId::generate();

        self.server
            .post("/v1/ledgers")
            .add_header("authorization", Self::auth_header(user))
            .await
            .assert_status(axum::http::StatusCode::CREATED);

        self.server
            .post("/v1/ledgers/credit")
            .add_header("x-admin-key", ADMIN_KEY)
            .json(&json!({
                "payer_id": user.to_string(),
                "amount": balance,
                "reason": "Test funding"
            }))
            .await
            .assert_status_ok();

        user
    }

    /// Request a session and return its id.
    pub async fn request(&self, payer: UserId, provider: UserId) -> String {
        let response = self
            .server
            .post("/v1/sessions")
            .add_header("authorization", Self::auth_header(payer))
            .json(&json!({
                "provider_id": provider.to_string(),
                "rate_per_minute": "1"
            }))
            .await;
        response.assert_status(axum::http::StatusCode::CREATED);

        let body: serde_json::Value = response.json();
        body["id"].as_str().expect("session id").to_string()
    }

    /// POST a lifecycle action as `actor`.
    pub async fn act(
        &self,
        session_id: &str,
        action: &str,
        actor: UserId,
    ) -> axum_test::TestResponse {
        self.server
            .post(&format!("/v1/sessions/{session_id}/{action}"))
            .add_header("authorization", Self::auth_header(actor))
            .await
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Sign a one-hour token for `user`.
pub fn token_for(user: UserId, audience: &str, secret: &str) -> String {
    let now = jsonwebtoken::get_current_timestamp();
    let claims = JwtClaims {
        sub: user.to_string(),
        aud: audience.into(),
        exp: i64::try_from(now + 3600).expect("timestamp fits"),
        iat: i64::try_from(now).expect("timestamp fits"),
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .expect("Failed to sign token")
}
