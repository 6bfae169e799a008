//! Time source for metering.

use chrono::{DateTime, Duration, Utc};
use tokio::time::Instant;

/// Supplies the current time to the engine.
pub trait Clock: Send + Sync {
    /// The current instant as a UTC timestamp.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time anchored once, then advanced by tokio's monotonic clock.
///
/// Elapsed-time billing is immune to wall-clock jumps, and under a paused
/// tokio runtime the clock follows virtual time.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    anchor_wall: DateTime<Utc>,
    anchor: Instant,
}

impl MonotonicClock {
    /// Anchor at the current wall-clock time.
    #[must_use]
    pub fn new() -> Self {
        Self::anchored_at(Utc::now())
    }

    /// Anchor at `wall`, treating the present monotonic instant as that time.
    #[must_use]
    pub fn anchored_at(wall: DateTime<Utc>) -> Self {
        Self {
            anchor_wall: wall,
            anchor: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = Duration::from_std(self.anchor.elapsed()).unwrap_or_else(|_| Duration::zero());
        self.anchor_wall + elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn follows_virtual_time() {
        let anchor = Utc::now();
        let clock = MonotonicClock::anchored_at(anchor);
        assert_eq!(clock.now(), anchor);

        tokio::time::advance(std::time::Duration::from_secs(90)).await;
        assert_eq!(clock.now(), anchor + Duration::seconds(90));
    }
}
