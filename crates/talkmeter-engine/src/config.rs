//! Engine configuration.

use std::time::Duration;

use rust_decimal::Decimal;
use talkmeter_core::{MeterError, Result};

/// Timing and retry settings for the metering engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How often a deduction driver advances its session (default: 1s).
    pub tick_interval: Duration,

    /// How often the recovery sweeper runs (default: 120s).
    pub sweep_interval: Duration,

    /// An unpaused active session whose last tick is older than this is
    /// considered orphaned (default: 30s).
    pub stale_after: Duration,

    /// A ledger lock held longer than this is force-released (default: 30s).
    pub lock_timeout: Duration,

    /// Pending or accepted requests older than this expire (default: 600s).
    pub request_ttl: Duration,

    /// Publish a balance-low warning when remaining time drops to this many
    /// seconds (default: 60).
    pub low_balance_warning_seconds: u64,

    /// Retries after a `Locked` ledger before giving up (default: 3).
    pub ledger_retry_attempts: usize,

    /// Base delay for the exponential ledger retry backoff (default: 10ms).
    pub ledger_retry_base_ms: u64,

    /// Rate applied when a request does not quote one (default: 1).
    pub default_rate_per_minute: Decimal,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            sweep_interval: Duration::from_secs(120),
            stale_after: Duration::from_secs(30),
            lock_timeout: Duration::from_secs(30),
            request_ttl: Duration::from_secs(600),
            low_balance_warning_seconds: 60,
            ledger_retry_attempts: 3,
            ledger_retry_base_ms: 10,
            default_rate_per_minute: Decimal::ONE,
        }
    }
}

impl EngineConfig {
    /// Check the settings are mutually consistent.
    ///
    /// # Errors
    ///
    /// Returns `MeterError::Configuration` describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.tick_interval.is_zero() {
            return Err(MeterError::Configuration(
                "tick interval must be non-zero".into(),
            ));
        }
        if self.sweep_interval.is_zero() {
            return Err(MeterError::Configuration(
                "sweep interval must be non-zero".into(),
            ));
        }
        if self.stale_after <= self.tick_interval {
            return Err(MeterError::Configuration(format!(
                "stale threshold ({:?}) must exceed the tick interval ({:?})",
                self.stale_after, self.tick_interval
            )));
        }
        if self.default_rate_per_minute <= Decimal::ZERO {
            return Err(MeterError::Configuration(
                "default rate per minute must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.tick_interval, Duration::from_secs(1));
    }

    #[test]
    fn stale_threshold_must_exceed_tick() {
        let config = EngineConfig {
            stale_after: Duration::from_secs(1),
            ..EngineConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(MeterError::Configuration(_))
        ));
    }
}
