//! Traits driver code implements to plug behaviour into the engine.
//!
//! All three are installed once on the [`EngineBuilder`](super::EngineBuilder)
//! and called from connection tasks, hence `Send + Sync`.  The engine holds no
//! lock while any of them runs.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use ucapi_core::{Entity, EntityType, SetupAction, SetupRequest, StatusCode};

use super::session::ConnectionSession;
use super::voice::VoiceSession;

/// Executes `entity_command` requests.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Runs `cmd_id` on `entity` (a snapshot taken when the request arrived).
    /// The returned status becomes the response code.
    ///
    /// `connection` is the requesting connection.  Keep a clone of it to send
    /// directed events later, for example an assistant `ready` event after
    /// `voice_start`.
    async fn handle_command(
        &self,
        entity: &Entity,
        cmd_id: &str,
        params: Option<&Map<String, Value>>,
        connection: &Arc<ConnectionSession>,
    ) -> StatusCode;
}

/// Drives the driver setup dialogue.  Called once per round.
#[async_trait]
pub trait SetupHandler: Send + Sync {
    async fn handle_setup(&self, request: SetupRequest) -> SetupAction;
}

/// Consumes one voice session.  Spawned on its own task per session; the
/// session's audio stream ends when the controller ends the session or the
/// connection drops.
#[async_trait]
pub trait VoiceHandler: Send + Sync {
    async fn handle_voice(&self, session: VoiceSession);
}

/// Command handlers keyed by entity id, with per-type fallbacks.
#[derive(Default, Clone)]
pub struct CommandRouter {
    by_id: HashMap<String, Arc<dyn CommandHandler>>,
    by_type: HashMap<EntityType, Arc<dyn CommandHandler>>,
}

impl CommandRouter {
    pub fn insert_for_entity(&mut self, entity_id: impl Into<String>, handler: Arc<dyn CommandHandler>) {
        self.by_id.insert(entity_id.into(), handler);
    }

    pub fn insert_for_type(&mut self, entity_type: EntityType, handler: Arc<dyn CommandHandler>) {
        self.by_type.insert(entity_type, handler);
    }

    /// The handler for `entity`: an id-specific one wins over the type's.
    pub fn resolve(&self, entity: &Entity) -> Option<Arc<dyn CommandHandler>> {
        self.by_id
            .get(entity.id())
            .or_else(|| self.by_type.get(&entity.entity_type()))
            .cloned()
    }
}
