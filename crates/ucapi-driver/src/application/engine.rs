//! The integration engine: shared state behind every connection.
//!
//! One [`IntegrationEngine`] exists per driver process.  Connection tasks call
//! into it to open and close sessions and to dispatch frames (see
//! `dispatcher.rs`); driver code holds the [`EntityRegistry`] it hands out
//! and receives [`DriverEvent`]s on the channel returned by
//! [`EngineBuilder::build`].

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info};

use ucapi_core::protocol::messages::names;
use ucapi_core::{DeviceState, EntityType, EventCategory, OutboundMessage, StatusCode};

use super::callbacks::{CommandHandler, CommandRouter, SetupHandler, VoiceHandler};
use super::hub::{Audience, ConnectionHub};
use super::registry::EntityRegistry;
use super::session::{ConnectionSession, Frame};
use super::setup_flow::{SetupFlow, SetupPhase};
use super::voice::VoiceMultiplexer;
use crate::domain::{DriverEvent, DriverMetadata, EngineSettings, SetupAbortReason};

// ── Builder ───────────────────────────────────────────────────────────────────

/// Collects driver callbacks before the engine starts.
///
/// The registry exists from the moment the builder does, so handlers can be
/// given a clone of it before they are installed.
pub struct EngineBuilder {
    metadata: DriverMetadata,
    settings: EngineSettings,
    hub: Arc<ConnectionHub>,
    registry: Arc<EntityRegistry>,
    commands: CommandRouter,
    setup_handler: Option<Arc<dyn SetupHandler>>,
    voice_handler: Option<Arc<dyn VoiceHandler>>,
}

impl EngineBuilder {
    pub fn new(metadata: DriverMetadata) -> Self {
        let hub = Arc::new(ConnectionHub::new());
        let registry = Arc::new(EntityRegistry::new(hub.clone()));
        Self {
            metadata,
            settings: EngineSettings::default(),
            hub,
            registry,
            commands: CommandRouter::default(),
            setup_handler: None,
            voice_handler: None,
        }
    }

    pub fn settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn registry(&self) -> Arc<EntityRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn command_handler_for_type(
        mut self,
        entity_type: EntityType,
        handler: Arc<dyn CommandHandler>,
    ) -> Self {
        self.commands.insert_for_type(entity_type, handler);
        self
    }

    pub fn command_handler_for_entity(
        mut self,
        entity_id: impl Into<String>,
        handler: Arc<dyn CommandHandler>,
    ) -> Self {
        self.commands.insert_for_entity(entity_id, handler);
        self
    }

    pub fn setup_handler(mut self, handler: Arc<dyn SetupHandler>) -> Self {
        self.setup_handler = Some(handler);
        self
    }

    pub fn voice_handler(mut self, handler: Arc<dyn VoiceHandler>) -> Self {
        self.voice_handler = Some(handler);
        self
    }

    /// Finishes construction.
    ///
    /// Returns the engine and the receiver for driver events.  Events are
    /// buffered without bound, so a driver that never drains the receiver
    /// only costs memory, never stalls a connection.
    #[must_use]
    pub fn build(self) -> (Arc<IntegrationEngine>, mpsc::UnboundedReceiver<DriverEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let engine = IntegrationEngine {
            metadata: self.metadata,
            settings: self.settings,
            hub: self.hub,
            registry: self.registry,
            commands: self.commands,
            setup_handler: self.setup_handler,
            voice_handler: self.voice_handler,
            setup: SetupFlow::new(),
            device_state: Mutex::new(DeviceState::default()),
            events,
        };
        (Arc::new(engine), events_rx)
    }
}

// ── Engine ────────────────────────────────────────────────────────────────────

pub struct IntegrationEngine {
    pub(super) metadata: DriverMetadata,
    pub(super) settings: EngineSettings,
    pub(super) hub: Arc<ConnectionHub>,
    pub(super) registry: Arc<EntityRegistry>,
    pub(super) commands: CommandRouter,
    pub(super) setup_handler: Option<Arc<dyn SetupHandler>>,
    pub(super) voice_handler: Option<Arc<dyn VoiceHandler>>,
    pub(super) setup: SetupFlow,
    device_state: Mutex<DeviceState>,
    events: mpsc::UnboundedSender<DriverEvent>,
}

impl IntegrationEngine {
    pub fn builder(metadata: DriverMetadata) -> EngineBuilder {
        EngineBuilder::new(metadata)
    }

    pub fn metadata(&self) -> &DriverMetadata {
        &self.metadata
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<EntityRegistry> {
        &self.registry
    }

    pub fn connection_count(&self) -> usize {
        self.hub.len()
    }

    pub fn setup_phase(&self) -> SetupPhase {
        self.setup.phase()
    }

    pub fn device_state(&self) -> DeviceState {
        *self.device_state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores the device state and broadcasts a `device_state` event to every
    /// connection.  Returns how many connections it was queued on.
    pub fn set_device_state(&self, state: DeviceState) -> usize {
        *self.device_state.lock().unwrap_or_else(PoisonError::into_inner) = state;
        info!("device state is now {state:?}");
        let event = OutboundMessage::event(
            names::DEVICE_STATE,
            EventCategory::Device,
            json!({ "state": state }),
        );
        self.hub.broadcast(&event, Audience::All)
    }

    // ── Connection lifecycle ──────────────────────────────────────────────────

    /// Registers a new connection, greets it with the `authentication`
    /// response, and reports [`DriverEvent::ClientConnected`].
    ///
    /// Returns the session and the frame receiver its writer task drains.
    pub async fn open_session(
        &self,
        peer: SocketAddr,
    ) -> (Arc<ConnectionSession>, mpsc::Receiver<Frame>) {
        let (session, rx) = ConnectionSession::new(peer, self.settings.outbound_queue_capacity);
        self.hub.add(Arc::clone(&session));

        let greeting =
            OutboundMessage::response(0, StatusCode::Ok, names::AUTHENTICATION, json!({}));
        if let Err(e) = session.send(&greeting).await {
            debug!("connection {}: greeting not sent: {e}", session.id());
        }

        info!(
            "connection {} from {peer} opened ({} active)",
            session.id(),
            self.hub.len()
        );
        self.emit(DriverEvent::ClientConnected {
            connection: session.id(),
            peer,
        });
        (session, rx)
    }

    /// A voice multiplexer bound to `session`, using the installed handler.
    pub fn voice_multiplexer(&self, session: &Arc<ConnectionSession>) -> VoiceMultiplexer {
        VoiceMultiplexer::new(
            Arc::clone(session),
            self.voice_handler.clone(),
            self.settings.voice_queue_capacity,
        )
    }

    /// Tears down a connection: removes it from broadcasts, aborts a setup
    /// flow it owned, and reports [`DriverEvent::ClientDisconnected`].
    pub fn close_session(&self, session: &ConnectionSession) {
        session.close();
        self.hub.remove(session.id());

        if self.setup.connection_lost(session.id()) {
            self.emit(DriverEvent::SetupAborted {
                reason: SetupAbortReason::ConnectionLost,
            });
        }

        info!(
            "connection {} closed ({} frame(s) sent, {} active)",
            session.id(),
            session.frames_sent(),
            self.hub.len()
        );
        self.emit(DriverEvent::ClientDisconnected {
            connection: session.id(),
        });
    }

    pub(super) fn emit(&self, event: DriverEvent) {
        if self.events.send(event).is_err() {
            debug!("driver event dropped: receiver is gone");
        }
    }
}
