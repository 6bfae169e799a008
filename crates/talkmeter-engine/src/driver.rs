//! The per-session deduction driver.
//!
//! While a session is active and unpaused, one driver task ticks it every
//! `tick_interval`: elapsed whole seconds come off the remaining time, each
//! crossed minute boundary posts a debit of one minute's rate, and the
//! session is closed when time or funds run out.

use std::sync::Arc;

use rust_decimal::Decimal;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use talkmeter_core::{
    allotted_seconds, Deduction, DeductionKind, EndReason, SessionEvent, SessionId, SessionRecord,
    SessionStatus, SECONDS_PER_MINUTE,
};

use crate::engine::{EngineInner, SessionEngine};

pub(crate) enum TickOutcome {
    Continue,
    Finished,
}

/// Per-driver bookkeeping carried between ticks.
#[derive(Debug, Default)]
pub(crate) struct DriverState {
    /// Consecutive minute debits deferred because the ledger was locked.
    lock_deferrals: u32,
}

impl SessionEngine {
    /// Start the deduction driver for `session_id` unless one is running.
    pub(crate) fn spawn_driver(&self, session_id: SessionId) -> bool {
        let inner = Arc::clone(&self.inner);
        let spawned = self
            .inner
            .registry
            .spawn_if_absent(session_id, move |generation, cancel| {
                drive(inner, session_id, generation, cancel)
            });
        if !spawned {
            tracing::debug!(session_id = %session_id, "Driver already running");
        }
        spawned
    }
}

async fn drive(
    inner: Arc<EngineInner>,
    session_id: SessionId,
    generation: u64,
    cancel: CancellationToken,
) {
    let period = inner.config.tick_interval;
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut state = DriverState::default();

    tracing::debug!(session_id = %session_id, generation, "Deduction driver started");

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = interval.tick() => {
                if let TickOutcome::Finished = inner.tick(session_id, &cancel, &mut state).await {
                    break;
                }
            }
        }
    }

    inner.registry.release(&session_id, generation);
    inner.locks.prune(&session_id);
    tracing::debug!(session_id = %session_id, generation, "Deduction driver stopped");
}

impl EngineInner {
    /// One driver tick, under the session lock.
    pub(crate) async fn tick(
        &self,
        session_id: SessionId,
        cancel: &CancellationToken,
        state: &mut DriverState,
    ) -> TickOutcome {
        let _guard = self.locks.lock(session_id).await;
        if cancel.is_cancelled() {
            return TickOutcome::Finished;
        }

        let mut record = match self.store.get_session(&session_id) {
            Ok(Some(record)) => record,
            Ok(None) => {
                tracing::warn!(session_id = %session_id, "Driven session no longer exists");
                return TickOutcome::Finished;
            }
            Err(e) => {
                tracing::error!(session_id = %session_id, error = %e, "Failed to load session");
                return TickOutcome::Continue;
            }
        };
        if !record.is_metering() {
            return TickOutcome::Finished;
        }

        let ending = self.settle(&mut record, state).await;
        self.emit(
            &record,
            SessionEvent::Tick {
                remaining_seconds: record.remaining_seconds,
                remaining_balance: record.remaining_balance,
            },
        );

        if let Some(reason) = ending {
            match self
                .finalize(&mut record, SessionStatus::Completed, reason)
                .await
            {
                Ok(()) => return TickOutcome::Finished,
                Err(e) => {
                    tracing::warn!(
                        session_id = %session_id,
                        error = %e,
                        "Could not close session, retrying next tick"
                    );
                }
            }
        }

        if let Err(e) = self.persist(&record) {
            tracing::error!(session_id = %session_id, error = %e, "Failed to persist session");
        }
        TickOutcome::Continue
    }

    /// Apply the active time elapsed since the last tick and post every
    /// minute debit that falls due.
    ///
    /// Returns the reason the session has to end, if it does. A debit that
    /// finds the ledger locked is deferred to the next call; the seconds keep
    /// counting meanwhile.
    pub(crate) async fn settle(
        &self,
        record: &mut SessionRecord,
        state: &mut DriverState,
    ) -> Option<EndReason> {
        let before = record.remaining_seconds;
        record.advance(self.clock.now());

        while record.minutes_billed() < record.minutes_due() {
            match self
                .ledger
                .debit(&record.payer_id, record.rate_per_minute)
                .await
            {
                Ok(outcome) => {
                    state.lock_deferrals = 0;
                    if outcome.debited > Decimal::ZERO {
                        let seconds_covered = if outcome.is_partial() {
                            allotted_seconds(outcome.debited, record.rate_per_minute)
                        } else {
                            SECONDS_PER_MINUTE
                        };
                        record.record_deduction(Deduction {
                            timestamp: self.clock.now(),
                            seconds_covered,
                            amount: outcome.debited,
                            balance_after: outcome.new_balance,
                            kind: DeductionKind::Minute,
                        });
                        self.emit(
                            record,
                            SessionEvent::BalanceDeducted {
                                amount: outcome.debited,
                                balance_after: outcome.new_balance,
                                seconds_covered,
                            },
                        );
                    }
                    if outcome.is_partial() {
                        tracing::info!(
                            session_id = %record.id,
                            payer_id = %record.payer_id,
                            debited = %outcome.debited,
                            "Ledger exhausted at minute boundary"
                        );
                        return Some(EndReason::InsufficientFunds);
                    }
                }
                Err(e) if e.is_retryable() => {
                    state.lock_deferrals += 1;
                    if state.lock_deferrals == 1 {
                        tracing::warn!(
                            session_id = %record.id,
                            error = %e,
                            "Minute debit deferred, ledger locked"
                        );
                    } else {
                        tracing::error!(
                            session_id = %record.id,
                            deferrals = state.lock_deferrals,
                            error = %e,
                            "Minute debit deferred again, ledger still locked"
                        );
                    }
                    break;
                }
                Err(e) => {
                    tracing::error!(session_id = %record.id, error = %e, "Minute debit failed");
                    break;
                }
            }
        }

        let threshold = self.config.low_balance_warning_seconds;
        if before > threshold && record.remaining_seconds <= threshold && record.remaining_seconds > 0
        {
            self.emit(
                record,
                SessionEvent::BalanceLow {
                    remaining_seconds: record.remaining_seconds,
                    remaining_balance: record.remaining_balance,
                },
            );
        }

        (record.remaining_seconds == 0).then_some(EndReason::TimeExpired)
    }
}
