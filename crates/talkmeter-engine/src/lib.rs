//! Metering engine for talkmeter.
//!
//! This crate runs metered sessions on top of a [`talkmeter_store::Store`]:
//!
//! - [`SessionEngine`]: the lifecycle operations (request, accept, start,
//!   pause, resume, stop, ...) and the per-session deduction drivers
//! - [`LedgerService`]: debits and credits under the ledger lock
//! - [`RecoverySweeper`]: periodic repair of abandoned sessions and stuck
//!   ledger locks, plus [`SessionEngine::recover`] for startup
//! - [`BroadcastPort`] / [`NotificationPort`]: best-effort outbound events
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use rust_decimal::Decimal;
//! use talkmeter_core::UserId;
//! use talkmeter_engine::SessionEngine;
//! use talkmeter_store::MemoryStore;
//!
//! # async fn run() -> talkmeter_core::Result<()> {
//! let engine = SessionEngine::builder(Arc::new(MemoryStore::new())).build()?;
//! let (payer, provider) = (UserId::generate(), UserId::generate());
//!
//! engine.ledgers().open(payer)?;
//! engine.ledgers().credit(&payer, Decimal::TEN).await?;
//!
//! let session = engine.request_session(payer, provider, None).await?;
//! engine.accept(session.id, provider).await?;
//! engine.start(session.id, payer).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod clock;
pub mod config;
mod driver;
mod engine;
pub mod ledger;
mod lifecycle;
pub mod ports;
pub mod registry;
pub mod sweeper;

pub use clock::{Clock, MonotonicClock};
pub use config::EngineConfig;
pub use engine::{EngineBuilder, SessionEngine};
pub use ledger::LedgerService;
pub use ports::{
    BroadcastPort, ChannelBroadcaster, NotificationPort, NullBroadcaster, TracingNotifier,
};
pub use sweeper::{RecoveryReport, RecoverySweeper, SweepReport};
