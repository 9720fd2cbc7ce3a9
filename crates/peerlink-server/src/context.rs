//! Process-scoped relay state.
//!
//! Everything that used to be shared globally (the control slot, the peer
//! registry) lives here and is handed to the gateway and router explicitly,
//! so tests can run independent relays side by side.

use crate::config::RelayConfig;
use crate::engine::{EngineEvent, EngineFactory};
use crate::notifier::OutboundNotifier;
use crate::relay::{PeerConnectionRegistry, SessionCoordinator};
use std::sync::Arc;
use tokio::sync::mpsc;

pub struct RelayContext {
    pub config: RelayConfig,
    pub registry: Arc<PeerConnectionRegistry>,
    pub notifier: Arc<OutboundNotifier>,
    pub coordinator: Arc<SessionCoordinator>,
}

impl RelayContext {
    /// Wire the components together. The caller must drive the returned
    /// receiver with [`SessionCoordinator::run`].
    pub fn new(
        config: RelayConfig,
        engine: Arc<dyn EngineFactory>,
    ) -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(PeerConnectionRegistry::new(engine, events_tx.clone()));
        let notifier = Arc::new(OutboundNotifier::new());
        let coordinator = Arc::new(SessionCoordinator::new(
            registry.clone(),
            notifier.clone(),
            events_tx,
            config.gathering_timeout,
            config.data_channel_label.clone(),
        ));

        let ctx = Self {
            config,
            registry,
            notifier,
            coordinator,
        };
        (ctx, events_rx)
    }

    /// Build the context and spawn its engine event dispatcher.
    pub fn start(config: RelayConfig, engine: Arc<dyn EngineFactory>) -> Arc<Self> {
        let (ctx, events) = Self::new(config, engine);
        tokio::spawn(ctx.coordinator.clone().run(events));
        Arc::new(ctx)
    }
}
