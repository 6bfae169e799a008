//! Application state.

use std::sync::Arc;

use talkmeter_core::Result;
use talkmeter_engine::{ChannelBroadcaster, SessionEngine};
use talkmeter_store::Store;

use crate::config::ServiceConfig;

/// Application state shared across handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    /// The metering engine.
    pub engine: SessionEngine,

    /// Live event fan-out feeding the WebSocket endpoint.
    pub events: ChannelBroadcaster,

    /// Service configuration.
    pub config: ServiceConfig,
}

impl AppState {
    /// Create a new application state backed by `store`.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if the engine settings are inconsistent.
    pub fn new(store: Arc<dyn Store>, config: ServiceConfig) -> Result<Self> {
        let events = ChannelBroadcaster::new(config.event_buffer);
        let engine = SessionEngine::builder(store)
            .broadcast(Arc::new(events.clone()))
            .config(config.engine.clone())
            .build()?;

        Ok(Self {
            engine,
            events,
            config,
        })
    }
}
