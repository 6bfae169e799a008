//! Service configuration.

use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;
use talkmeter_core::MeterError;
use talkmeter_engine::EngineConfig;

/// Service configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Address to listen on (default: "0.0.0.0:8080").
    pub listen_addr: String,

    /// Path to `RocksDB` data directory (default: "/data/talkmeter").
    pub data_dir: String,

    /// HS256 secret that signs participant tokens.
    pub auth_jwt_secret: Option<String>,

    /// Expected JWT audience (default: "talkmeter").
    pub auth_audience: String,

    /// Key for admin endpoints (crediting ledgers, manual sweeps).
    pub admin_api_key: Option<String>,

    /// CORS allowed origins.
    pub cors_origins: Vec<String>,

    /// Maximum request body size in bytes.
    pub max_body_bytes: usize,

    /// Request timeout in seconds.
    pub request_timeout_seconds: u64,

    /// Events buffered per live subscriber before it starts dropping.
    pub event_buffer: usize,

    /// Metering engine settings.
    pub engine: EngineConfig,
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.into())
}

fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl ServiceConfig {
    /// Load configuration from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = EngineConfig::default();
        let engine = EngineConfig {
            tick_interval: Duration::from_millis(env_parse("TICK_INTERVAL_MS", 1000)),
            sweep_interval: Duration::from_secs(env_parse("SWEEP_INTERVAL_SECONDS", 120)),
            stale_after: Duration::from_secs(env_parse("STALE_AFTER_SECONDS", 30)),
            lock_timeout: Duration::from_secs(env_parse("LOCK_TIMEOUT_SECONDS", 30)),
            request_ttl: Duration::from_secs(env_parse("REQUEST_TTL_SECONDS", 600)),
            low_balance_warning_seconds: env_parse(
                "LOW_BALANCE_WARNING_SECONDS",
                defaults.low_balance_warning_seconds,
            ),
            ledger_retry_attempts: env_parse(
                "LEDGER_RETRY_ATTEMPTS",
                defaults.ledger_retry_attempts,
            ),
            ledger_retry_base_ms: env_parse("LEDGER_RETRY_BASE_MS", defaults.ledger_retry_base_ms),
            default_rate_per_minute: env_parse::<Decimal>(
                "DEFAULT_RATE_PER_MINUTE",
                defaults.default_rate_per_minute,
            ),
        };

        Self {
            listen_addr: env_or("LISTEN_ADDR", "0.0.0.0:8080"),
            data_dir: env_or("DATA_DIR", "/data/talkmeter"),
            auth_jwt_secret: std::env::var("AUTH_JWT_SECRET").ok(),
            auth_audience: env_or("AUTH_AUDIENCE", "talkmeter"),
            admin_api_key: std::env::var("ADMIN_API_KEY").ok(),
            cors_origins: env_or("CORS_ORIGINS", "*")
                .split(',')
                .map(|s| s.trim().to_string())
                .collect(),
            max_body_bytes: env_parse("MAX_BODY_BYTES", 64 * 1024),
            request_timeout_seconds: env_parse("REQUEST_TIMEOUT_SECONDS", 30),
            event_buffer: env_parse("EVENT_BUFFER", 1024),
            engine,
        }
    }

    /// Check the configuration can run the service.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if no JWT secret is set or the engine
    /// settings are inconsistent.
    pub fn validate(&self) -> Result<(), MeterError> {
        if self.auth_jwt_secret.as_deref().map_or(true, str::is_empty) {
            return Err(MeterError::Configuration(
                "AUTH_JWT_SECRET must be set".into(),
            ));
        }
        self.engine.validate()
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".into(),
            data_dir: "/data/talkmeter".into(),
            auth_jwt_secret: None,
            auth_audience: "talkmeter".into(),
            admin_api_key: None,
            cors_origins: vec!["*".into()],
            max_body_bytes: 64 * 1024,
            request_timeout_seconds: 30,
            event_buffer: 1024,
            engine: EngineConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_requires_a_secret() {
        let config = ServiceConfig::default();
        assert!(matches!(
            config.validate(),
            Err(MeterError::Configuration(_))
        ));

        let config = ServiceConfig {
            auth_jwt_secret: Some("secret".into()),
            ..ServiceConfig::default()
        };
        assert!(config.validate().is_ok());
    }
}
