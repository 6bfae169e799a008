//! The session engine and its shared state.

use std::sync::Arc;

use rust_decimal::Decimal;
use talkmeter_core::{
    Deduction, DeductionKind, EndReason, EventEnvelope, MeterError, Result, SessionEvent,
    SessionId, SessionRecord, SessionStatus,
};
use talkmeter_store::Store;
use tokio::sync::OwnedMutexGuard;

use crate::clock::{Clock, MonotonicClock};
use crate::config::EngineConfig;
use crate::ledger::LedgerService;
use crate::ports::{
    notification_recipients, BroadcastPort, NotificationPort, NullBroadcaster, TracingNotifier,
};
use crate::registry::{DriverRegistry, SessionLocks};

/// Metered session engine.
///
/// Cheap to clone; clones share the same store, drivers and locks.
#[derive(Clone)]
pub struct SessionEngine {
    pub(crate) inner: Arc<EngineInner>,
}

pub(crate) struct EngineInner {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) ledger: LedgerService,
    pub(crate) registry: DriverRegistry,
    pub(crate) locks: SessionLocks,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) broadcast: Arc<dyn BroadcastPort>,
    pub(crate) notifier: Arc<dyn NotificationPort>,
    pub(crate) config: EngineConfig,
    /// Serializes request creation so two requests for the same pair cannot
    /// both pass the open-session check.
    pub(crate) request_gate: tokio::sync::Mutex<()>,
}

/// Builder for [`SessionEngine`].
pub struct EngineBuilder {
    store: Arc<dyn Store>,
    clock: Option<Arc<dyn Clock>>,
    broadcast: Arc<dyn BroadcastPort>,
    notifier: Arc<dyn NotificationPort>,
    config: EngineConfig,
}

impl EngineBuilder {
    /// Use `clock` instead of the monotonic wall clock.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Publish live events to `broadcast`.
    #[must_use]
    pub fn broadcast(mut self, broadcast: Arc<dyn BroadcastPort>) -> Self {
        self.broadcast = broadcast;
        self
    }

    /// Send participant notifications to `notifier`.
    #[must_use]
    pub fn notifier(mut self, notifier: Arc<dyn NotificationPort>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Replace the default configuration.
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the engine.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if the configuration is inconsistent.
    pub fn build(self) -> Result<SessionEngine> {
        self.config.validate()?;
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(MonotonicClock::new()) as Arc<dyn Clock>);
        let ledger = LedgerService::new(
            Arc::clone(&self.store),
            Arc::clone(&clock),
            self.config.ledger_retry_attempts,
            self.config.ledger_retry_base_ms,
        );

        Ok(SessionEngine {
            inner: Arc::new(EngineInner {
                store: self.store,
                ledger,
                registry: DriverRegistry::new(),
                locks: SessionLocks::new(),
                clock,
                broadcast: self.broadcast,
                notifier: self.notifier,
                config: self.config,
                request_gate: tokio::sync::Mutex::new(()),
            }),
        })
    }
}

impl SessionEngine {
    /// Start building an engine over `store`.
    #[must_use]
    pub fn builder(store: Arc<dyn Store>) -> EngineBuilder {
        EngineBuilder {
            store,
            clock: None,
            broadcast: Arc::new(NullBroadcaster),
            notifier: Arc::new(TracingNotifier),
            config: EngineConfig::default(),
        }
    }

    /// The ledger service sharing this engine's store and clock.
    #[must_use]
    pub fn ledgers(&self) -> &LedgerService {
        &self.inner.ledger
    }

    /// The engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Number of deduction drivers currently registered.
    #[must_use]
    pub fn active_drivers(&self) -> usize {
        self.inner.registry.len()
    }

    /// Whether a deduction driver is running for `session_id`.
    #[must_use]
    pub fn is_driving(&self, session_id: &SessionId) -> bool {
        self.inner.registry.is_running(session_id)
    }

    /// Stop every deduction driver without finalizing its session.
    ///
    /// Active sessions stay active in the store and are picked up again by
    /// [`SessionEngine::recover`] on the next start.
    pub fn shutdown(&self) {
        let drivers = self.inner.registry.len();
        self.inner.registry.cancel_all();
        tracing::info!(drivers, "Session engine shut down");
    }
}

impl std::fmt::Debug for SessionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEngine")
            .field("config", &self.inner.config)
            .field("registry", &self.inner.registry)
            .finish_non_exhaustive()
    }
}

impl EngineInner {
    pub(crate) fn load(&self, session_id: &SessionId) -> Result<SessionRecord> {
        self.store
            .get_session(session_id)?
            .ok_or_else(|| MeterError::session_not_found(session_id))
    }

    /// Take the session lock and read the record under it.
    ///
    /// A failed read drops the lock again so unknown ids leave no entry.
    pub(crate) async fn lock_and_load(
        &self,
        session_id: SessionId,
    ) -> Result<(OwnedMutexGuard<()>, SessionRecord)> {
        let guard = self.locks.lock(session_id).await;
        match self.load(&session_id) {
            Ok(record) => Ok((guard, record)),
            Err(e) => {
                drop(guard);
                self.locks.prune(&session_id);
                Err(e)
            }
        }
    }

    pub(crate) fn persist(&self, record: &SessionRecord) -> Result<()> {
        self.store.put_session(record)?;
        Ok(())
    }

    /// Publish `event` and fire notifications for it in the background.
    pub(crate) fn emit(&self, record: &SessionRecord, event: SessionEvent) {
        let recipients = notification_recipients(record, &event);
        let envelope = EventEnvelope::for_session(record, event, self.clock.now());

        for recipient in recipients {
            let notifier = Arc::clone(&self.notifier);
            let envelope = envelope.clone();
            tokio::spawn(async move { notifier.notify(recipient, envelope).await });
        }
        self.broadcast.publish(envelope);
    }

    /// Close a session: capture what is still owed, mark it terminal,
    /// persist, stop its driver and announce the end.
    ///
    /// Manual, time-expired and orphaned endings charge the uncaptured
    /// remainder of the time used as a closing debit. An insufficient-funds
    /// ending has nothing left to take.
    ///
    /// If the closing debit fails (ledger locked) the record is left
    /// unchanged and the error returned; the caller decides whether to
    /// persist and retry.
    pub(crate) async fn finalize(
        &self,
        record: &mut SessionRecord,
        status: SessionStatus,
        reason: EndReason,
    ) -> Result<()> {
        if !matches!(reason, EndReason::InsufficientFunds | EndReason::RequestTimeout) {
            self.capture_closing(record).await?;
        }

        let now = self.clock.now();
        record.finish(status, reason, now);
        self.persist(record)?;
        self.registry.cancel(&record.id);

        tracing::info!(
            session_id = %record.id,
            status = %record.status,
            reason = ?reason,
            total_amount_paid = %record.total_amount_paid,
            "Session ended"
        );
        self.emit(
            record,
            SessionEvent::SessionEnded {
                reason,
                total_amount_paid: record.total_amount_paid,
            },
        );
        Ok(())
    }

    async fn capture_closing(&self, record: &mut SessionRecord) -> Result<()> {
        let due = record.uncaptured_amount();
        if due <= Decimal::ZERO {
            return Ok(());
        }

        let outcome = self.ledger.debit(&record.payer_id, due).await?;
        if outcome.debited > Decimal::ZERO {
            let seconds_covered = record.seconds_used().saturating_sub(record.seconds_billed());
            record.record_deduction(Deduction {
                timestamp: self.clock.now(),
                seconds_covered,
                amount: outcome.debited,
                balance_after: outcome.new_balance,
                kind: DeductionKind::Closing,
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
            tracing::warn!(
                session_id = %record.id,
                requested = %outcome.requested,
                debited = %outcome.debited,
                "Closing debit only partially covered"
            );
        }
        Ok(())
    }
}
