//! Startup recovery and the periodic recovery sweeper.
//!
//! Drivers live in process memory, so a crash or restart leaves active
//! sessions without one and can leave a ledger locked mid-debit. Startup
//! recovery puts every active session back under a driver; the sweeper then
//! closes whatever falls through the cracks while the process runs.

use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use talkmeter_core::{EndReason, MeterError, Result, SessionId, SessionRecord, SessionStatus};

use crate::driver::DriverState;
use crate::engine::SessionEngine;

/// What a sweep pass repaired.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Active sessions with no time left that were completed.
    pub expired_sessions: usize,
    /// Active sessions whose driver stopped ticking, closed as orphaned.
    pub orphaned_sessions: usize,
    /// Pending or accepted requests that were never started in time.
    pub timed_out_requests: usize,
    /// Ledger locks held past the lock timeout that were released.
    pub released_locks: usize,
    /// Repairs that failed and will be retried on the next pass.
    pub errors: usize,
}

impl SweepReport {
    /// Whether the pass changed nothing.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        *self == Self::default()
    }
}

/// What startup recovery did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Ledger locks released.
    pub released_locks: usize,
    /// Sessions handed back to a driver.
    pub resumed_sessions: usize,
    /// Sessions left paused.
    pub paused_sessions: usize,
    /// Sessions that ran out while the process was down and were closed.
    pub finalized_sessions: usize,
    /// Sessions that could not be recovered; the sweeper picks them up.
    pub errors: usize,
}

/// What recovery did with one session.
enum Recovered {
    Paused,
    Resumed,
    Finalized,
    Gone,
}

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero())
}

impl SessionEngine {
    /// Re-establish invariants after a restart.
    ///
    /// No debit can be in flight before the engine has started, so every
    /// locked ledger is released. Each unpaused active session is settled
    /// from its last tick to now: it is closed if it ran out while the
    /// process was down and handed to a fresh driver otherwise.
    ///
    /// # Errors
    ///
    /// Returns a storage error if ledgers or sessions cannot be listed.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let inner = &self.inner;
        let mut report = RecoveryReport::default();

        for ledger in inner.store.list_locked_ledgers()? {
            let Some(lease) = ledger.lock_acquired_at else {
                continue;
            };
            if inner.store.force_release_ledger_lock(&ledger.payer_id, lease)? {
                tracing::warn!(payer_id = %ledger.payer_id, lease = %lease, "Released ledger lock left by previous run");
                report.released_locks += 1;
            }
        }

        for candidate in inner.store.list_sessions_by_status(SessionStatus::Active)? {
            let guard = inner.locks.lock(candidate.id).await;
            match self.recover_session(&candidate.id).await {
                Ok(Recovered::Paused) => report.paused_sessions += 1,
                Ok(Recovered::Resumed) => report.resumed_sessions += 1,
                Ok(Recovered::Finalized) => report.finalized_sessions += 1,
                Ok(Recovered::Gone) => {}
                Err(e) if self.is_driving(&candidate.id) => {
                    tracing::warn!(session_id = %candidate.id, error = %e, "Could not close session during recovery");
                    report.resumed_sessions += 1;
                }
                Err(e) => {
                    tracing::error!(session_id = %candidate.id, error = %e, "Failed to recover session");
                    report.errors += 1;
                }
            }
            drop(guard);
            inner.locks.prune(&candidate.id);
        }

        tracing::info!(
            released_locks = report.released_locks,
            resumed_sessions = report.resumed_sessions,
            paused_sessions = report.paused_sessions,
            finalized_sessions = report.finalized_sessions,
            errors = report.errors,
            "Startup recovery complete"
        );
        Ok(report)
    }

    /// Settle one active session after a restart. The caller holds its lock.
    async fn recover_session(&self, session_id: &SessionId) -> Result<Recovered> {
        let inner = &self.inner;
        let mut record = inner.load(session_id)?;
        if record.status != SessionStatus::Active {
            return Ok(Recovered::Gone);
        }
        if record.live.is_paused {
            return Ok(Recovered::Paused);
        }

        let ending = if record.remaining_seconds == 0 {
            Some(EndReason::TimeExpired)
        } else {
            inner.settle(&mut record, &mut DriverState::default()).await
        };

        match ending {
            Some(reason) => {
                self.close_or_resume_driving(&mut record, reason).await?;
                Ok(Recovered::Finalized)
            }
            None => {
                inner.persist(&record)?;
                self.spawn_driver(record.id);
                Ok(Recovered::Resumed)
            }
        }
    }
}

/// Background task that periodically repairs abandoned state.
///
/// Each pass:
/// - completes active sessions with no time left
/// - expires unpaused active sessions whose last tick is stale (orphaned)
/// - releases ledger locks held past the lock timeout
/// - expires requests not started within the request TTL
///
/// Passes are idempotent; a repair that fails is retried on the next one.
#[derive(Debug, Clone)]
pub struct RecoverySweeper {
    engine: SessionEngine,
}

impl RecoverySweeper {
    /// Create a sweeper for `engine`.
    #[must_use]
    pub fn new(engine: SessionEngine) -> Self {
        Self { engine }
    }

    /// Start the background sweep loop; the first pass runs one interval
    /// from now. Returns a handle that resolves once `cancel_token` fires.
    pub fn start(self, cancel_token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = self.engine.inner.config.sweep_interval;
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            tracing::info!(interval_secs = period.as_secs(), "Recovery sweeper started");

            loop {
                tokio::select! {
                    () = cancel_token.cancelled() => {
                        tracing::info!("Recovery sweeper shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        self.sweep().await;
                    }
                }
            }
        })
    }

    /// Run one pass.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        self.release_stale_locks(&mut report);
        self.repair_active_sessions(&mut report).await;
        self.expire_requests(&mut report).await;

        if report.is_clean() {
            tracing::debug!("Sweep found nothing to repair");
        } else {
            tracing::info!(
                expired_sessions = report.expired_sessions,
                orphaned_sessions = report.orphaned_sessions,
                timed_out_requests = report.timed_out_requests,
                released_locks = report.released_locks,
                errors = report.errors,
                "Sweep complete"
            );
        }
        report
    }

    fn release_stale_locks(&self, report: &mut SweepReport) {
        let inner = &self.engine.inner;
        let cutoff = inner.clock.now() - chrono_duration(inner.config.lock_timeout);

        let locked = match inner.store.list_locked_ledgers() {
            Ok(locked) => locked,
            Err(e) => {
                tracing::error!(error = %e, "Failed to list locked ledgers");
                report.errors += 1;
                return;
            }
        };

        for ledger in locked.iter().filter(|l| l.lock_held_since_before(cutoff)) {
            let Some(lease) = ledger.lock_acquired_at else {
                continue;
            };
            match inner.store.force_release_ledger_lock(&ledger.payer_id, lease) {
                Ok(true) => {
                    tracing::warn!(
                        payer_id = %ledger.payer_id,
                        lock_acquired_at = %lease,
                        "Force-released stale ledger lock"
                    );
                    report.released_locks += 1;
                }
                // Released or re-acquired since the listing.
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(payer_id = %ledger.payer_id, error = %e, "Failed to release ledger lock");
                    report.errors += 1;
                }
            }
        }
    }

    async fn repair_active_sessions(&self, report: &mut SweepReport) {
        let inner = &self.engine.inner;
        let active = match inner.store.list_sessions_by_status(SessionStatus::Active) {
            Ok(active) => active,
            Err(e) => {
                tracing::error!(error = %e, "Failed to list active sessions");
                report.errors += 1;
                return;
            }
        };
        let stale_cutoff = inner.clock.now() - chrono_duration(inner.config.stale_after);

        for candidate in active {
            let guard = inner.locks.lock(candidate.id).await;
            let mut record = match inner.load(&candidate.id) {
                Ok(record) if record.status == SessionStatus::Active => record,
                Ok(_) => continue,
                Err(e) => {
                    tracing::error!(session_id = %candidate.id, error = %e, "Failed to load session");
                    report.errors += 1;
                    continue;
                }
            };

            let repair = if record.remaining_seconds == 0 {
                Some((SessionStatus::Completed, EndReason::TimeExpired))
            } else if is_orphaned(&record, stale_cutoff) {
                tracing::warn!(
                    error = %MeterError::Orphaned { session_id: record.id.to_string() },
                    last_tick_at = ?record.live.last_tick_at,
                    "Closing session whose driver stopped ticking"
                );
                Some((SessionStatus::Expired, EndReason::Orphaned))
            } else {
                None
            };
            let Some((status, reason)) = repair else {
                continue;
            };

            match inner.finalize(&mut record, status, reason).await {
                Ok(()) if reason == EndReason::Orphaned => report.orphaned_sessions += 1,
                Ok(()) => report.expired_sessions += 1,
                Err(e) => {
                    tracing::error!(session_id = %record.id, error = %e, "Failed to close session");
                    report.errors += 1;
                    continue;
                }
            }
            drop(guard);
            inner.locks.prune(&record.id);
        }
    }

    async fn expire_requests(&self, report: &mut SweepReport) {
        let inner = &self.engine.inner;
        let cutoff = inner.clock.now() - chrono_duration(inner.config.request_ttl);

        for status in [SessionStatus::Pending, SessionStatus::Accepted] {
            let waiting = match inner.store.list_sessions_by_status(status) {
                Ok(waiting) => waiting,
                Err(e) => {
                    tracing::error!(status = %status, error = %e, "Failed to list requests");
                    report.errors += 1;
                    continue;
                }
            };

            for candidate in waiting.iter().filter(|r| r.updated_at < cutoff) {
                let guard = inner.locks.lock(candidate.id).await;
                let mut record = match inner.load(&candidate.id) {
                    Ok(record) if record.status == status && record.updated_at < cutoff => record,
                    Ok(_) => continue,
                    Err(e) => {
                        tracing::error!(session_id = %candidate.id, error = %e, "Failed to load session");
                        report.errors += 1;
                        continue;
                    }
                };

                match inner
                    .finalize(&mut record, SessionStatus::Expired, EndReason::RequestTimeout)
                    .await
                {
                    Ok(()) => report.timed_out_requests += 1,
                    Err(e) => {
                        tracing::error!(session_id = %record.id, error = %e, "Failed to expire request");
                        report.errors += 1;
                    }
                }
                drop(guard);
                inner.locks.prune(&record.id);
            }
        }
    }
}

/// An unpaused session whose driver has not ticked since `cutoff`.
fn is_orphaned(record: &SessionRecord, cutoff: chrono::DateTime<chrono::Utc>) -> bool {
    !record.live.is_paused && record.live.last_tick_at.map_or(true, |last| last < cutoff)
}
