//! Common test utilities for engine integration tests.

#![allow(dead_code)] // Some utilities are used by different test files

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use talkmeter_core::{EventEnvelope, Ledger, SessionId, SessionRecord, SessionStatus, UserId};
use talkmeter_engine::{BroadcastPort, Clock, EngineConfig, MonotonicClock, SessionEngine};
use talkmeter_store::{MemoryStore, Store, StoreError};

/// Captures every published event.
#[derive(Debug, Default)]
pub struct RecordingBroadcaster {
    events: Mutex<Vec<EventEnvelope>>,
}

impl RecordingBroadcaster {
    /// Names of the events published for `session_id`, in order.
    pub fn names_for(&self, session_id: SessionId) -> Vec<&'static str> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.session_id == session_id)
            .map(|e| e.event.name())
            .collect()
    }

    /// How many `name` events were published for `session_id`.
    pub fn count(&self, session_id: SessionId, name: &str) -> usize {
        self.names_for(session_id)
            .into_iter()
            .filter(|n| *n == name)
            .count()
    }
}

impl BroadcastPort for RecordingBroadcaster {
    fn publish(&self, envelope: EventEnvelope) {
        self.events.lock().unwrap().push(envelope);
    }
}

/// Delegates to a shared in-memory store but refuses writes to one session.
pub struct FailingStore {
    inner: Arc<MemoryStore>,
    broken: SessionId,
}

impl FailingStore {
    pub fn new(inner: Arc<MemoryStore>, broken: SessionId) -> Self {
        Self { inner, broken }
    }
}

impl Store for FailingStore {
    fn create_ledger(&self, ledger: &Ledger) -> talkmeter_store::Result<()> {
        self.inner.create_ledger(ledger)
    }

    fn get_ledger(&self, payer_id: &UserId) -> talkmeter_store::Result<Option<Ledger>> {
        self.inner.get_ledger(payer_id)
    }

    fn acquire_ledger_lock(
        &self,
        payer_id: &UserId,
        at: DateTime<Utc>,
    ) -> talkmeter_store::Result<Ledger> {
        self.inner.acquire_ledger_lock(payer_id, at)
    }

    fn release_ledger_lock(
        &self,
        payer_id: &UserId,
        lease: DateTime<Utc>,
        new_balance: Decimal,
        at: DateTime<Utc>,
    ) -> talkmeter_store::Result<Ledger> {
        self.inner.release_ledger_lock(payer_id, lease, new_balance, at)
    }

    fn force_release_ledger_lock(
        &self,
        payer_id: &UserId,
        lease: DateTime<Utc>,
    ) -> talkmeter_store::Result<bool> {
        self.inner.force_release_ledger_lock(payer_id, lease)
    }

    fn list_locked_ledgers(&self) -> talkmeter_store::Result<Vec<Ledger>> {
        self.inner.list_locked_ledgers()
    }

    fn put_session(&self, record: &SessionRecord) -> talkmeter_store::Result<()> {
        if record.id == self.broken {
            return Err(StoreError::Database("disk full".into()));
        }
        self.inner.put_session(record)
    }

    fn get_session(&self, session_id: &SessionId) -> talkmeter_store::Result<Option<SessionRecord>> {
        self.inner.get_session(session_id)
    }

    fn list_sessions_by_status(
        &self,
        status: SessionStatus,
    ) -> talkmeter_store::Result<Vec<SessionRecord>> {
        self.inner.list_sessions_by_status(status)
    }

    fn list_sessions_for_user(&self, user_id: &UserId) -> talkmeter_store::Result<Vec<SessionRecord>> {
        self.inner.list_sessions_for_user(user_id)
    }
}

/// An engine over a fresh in-memory store.
pub struct TestHarness {
    pub engine: SessionEngine,
    pub store: Arc<MemoryStore>,
    pub events: Arc<RecordingBroadcaster>,
    pub clock: Arc<MonotonicClock>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self::build(
            Arc::new(MemoryStore::new()),
            Arc::new(MonotonicClock::new()),
            config,
        )
    }

    /// A fresh engine over the same store and wall clock, as after a
    /// process restart.
    pub fn restarted(&self) -> Self {
        Self::build(
            self.store.clone(),
            self.clock.clone(),
            self.engine.config().clone(),
        )
    }

    /// A fresh engine over `store` sharing this harness's wall clock.
    pub fn engine_over(&self, store: Arc<dyn Store>) -> SessionEngine {
        SessionEngine::builder(store)
            .clock(self.clock.clone())
            .config(self.engine.config().clone())
            .build()
            .expect("Failed to build engine")
    }

    fn build(store: Arc<MemoryStore>, clock: Arc<MonotonicClock>, config: EngineConfig) -> Self {
        let events = Arc::new(RecordingBroadcaster::default());
        let engine = SessionEngine::builder(store.clone())
            .clock(clock.clone())
            .broadcast(events.clone())
            .config(config)
            .build()
            .expect("Failed to build engine");
        Self {
            engine,
            store,
            events,
            clock,
        }
    }

    pub fn clock_now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// A payer with `balance` credits and a provider with no ledger.
    pub async fn funded_pair(&self, balance: Decimal) -> (UserId, UserId) {
        let payer = UserId::generate();
        let provider = UserId::generate();
        self.engine.ledgers().open(payer).unwrap();
        if balance > Decimal::ZERO {
            self.engine.ledgers().credit(&payer, balance).await.unwrap();
        }
        (payer, provider)
    }

    /// Request, accept and start a session at `rate` per minute.
    pub async fn start_session(
        &self,
        payer: UserId,
        provider: UserId,
        rate: Decimal,
    ) -> SessionId {
        let session = self
            .engine
            .request_session(payer, provider, Some(rate))
            .await
            .unwrap();
        self.engine.accept(session.id, provider).await.unwrap();
        self.engine.start(session.id, payer).await.unwrap();
        session.id
    }

    /// An active session persisted directly, with no driver behind it.
    ///
    /// Metering started `started_secs_ago` seconds ago and `balance` was
    /// captured at one credit per minute.
    pub fn persist_active(
        &self,
        payer: UserId,
        provider: UserId,
        balance: Decimal,
        started_secs_ago: i64,
    ) -> SessionRecord {
        let now = self.clock.now();
        let mut record = SessionRecord::request(payer, provider, Decimal::ONE, now);
        record.snapshot_balance(balance);
        record.begin(now - chrono::Duration::seconds(started_secs_ago));
        self.store.put_session(&record).unwrap();
        record
    }

    pub fn record(&self, session_id: SessionId) -> SessionRecord {
        self.store.get_session(&session_id).unwrap().unwrap()
    }

    pub fn balance(&self, payer: &UserId) -> Decimal {
        self.engine.ledgers().get(payer).unwrap().balance
    }
}

/// Let virtual time run for `millis` milliseconds.
pub async fn run_for(millis: u64) {
    tokio::time::sleep(Duration::from_millis(millis)).await;
}
