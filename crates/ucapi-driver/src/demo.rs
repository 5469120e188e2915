//! The demo driver behind the `ucapi-demo-driver` binary.
//!
//! - Setup asks how many buttons to create, asks for confirmation, then
//!   registers `button_1` .. `button_N`.
//! - Pressing a button re-publishes its state.
//! - A voice assistant entity answers `voice_start` with a `ready` event,
//!   counts the audio bytes it receives and reports the count back to the
//!   speaking connection.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use ucapi_core::protocol::messages::VOICE_START_COMMAND;
use ucapi_core::{
    AssistantEvent, DeviceState, Entity, EntityType, LanguageText, SetupAction, SetupErrorCode,
    SetupRequest, SetupStep, StatusCode,
};
use ucapi_driver::application::{
    CommandHandler, ConnectionSession, EntityRegistry, IntegrationEngine, RegistryError,
    SetupHandler, VoiceEndReason, VoiceHandler, VoiceSession,
};
use ucapi_driver::domain::DriverEvent;

pub const BUTTON_PREFIX: &str = "button_";
pub const VOICE_ENTITY_ID: &str = "voice";
const MAX_BUTTONS: u64 = 20;
const DEFAULT_BUTTONS: u64 = 2;

// ── Setup ─────────────────────────────────────────────────────────────────────

pub struct DemoSetup {
    registry: Arc<EntityRegistry>,
}

impl DemoSetup {
    pub fn new(registry: Arc<EntityRegistry>) -> Self {
        Self { registry }
    }

    /// Replaces all demo buttons with `count` fresh ones.
    async fn create_buttons(&self, count: u64) -> Result<(), RegistryError> {
        for entity in self.registry.list().await {
            if entity.id().starts_with(BUTTON_PREFIX) {
                self.registry.unregister(entity.id()).await;
            }
        }
        for n in 1..=count {
            let button = Entity::builder(
                format!("{BUTTON_PREFIX}{n}"),
                EntityType::Button,
                LanguageText::from(format!("Button {n}")).with("de", format!("Taste {n}")),
            )
            .features(["press"])
            .attribute("state", json!("AVAILABLE"))
            .build()?;
            self.registry.register(button).await?;
        }
        info!("{count} demo button(s) registered");
        Ok(())
    }
}

/// The `count` form value as a number in `1..=MAX_BUTTONS`.
fn button_count(request: &SetupRequest) -> Option<u64> {
    let value = request.values.get("count")?;
    let count = match value {
        Value::Number(n) => n.as_u64()?,
        Value::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };
    (1..=MAX_BUTTONS).contains(&count).then_some(count)
}

#[async_trait]
impl SetupHandler for DemoSetup {
    async fn handle_setup(&self, request: SetupRequest) -> SetupAction {
        match request.step {
            SetupStep::Start => SetupAction::RequestUserInput {
                title: LanguageText::from("Demo setup").with("de", "Demo-Einrichtung"),
                settings: vec![json!({
                    "id": "count",
                    "label": { "en": "Number of buttons", "de": "Anzahl Tasten" },
                    "field": { "number": { "value": DEFAULT_BUTTONS, "min": 1, "max": MAX_BUTTONS } }
                })],
            },
            SetupStep::UserInput { .. } => match button_count(&request) {
                Some(count) => SetupAction::RequestUserConfirmation {
                    title: LanguageText::from(format!("Create {count} button(s)?")),
                    header: Some(LanguageText::from("Existing demo buttons are replaced.")),
                    image: None,
                    footer: None,
                },
                None => {
                    warn!("setup: invalid button count {:?}", request.values.get("count"));
                    SetupAction::Error(SetupErrorCode::Other)
                }
            },
            SetupStep::UserConfirmation { confirm: true } => {
                let count = button_count(&request).unwrap_or(DEFAULT_BUTTONS);
                match self.create_buttons(count).await {
                    Ok(()) => SetupAction::Complete,
                    Err(e) => {
                        warn!("setup: creating buttons failed: {e}");
                        SetupAction::Error(SetupErrorCode::Other)
                    }
                }
            }
            SetupStep::UserConfirmation { confirm: false } => {
                info!("setup: user declined");
                SetupAction::Error(SetupErrorCode::Other)
            }
        }
    }
}

// ── Commands ──────────────────────────────────────────────────────────────────

pub struct ButtonHandler {
    registry: Arc<EntityRegistry>,
}

impl ButtonHandler {
    pub fn new(registry: Arc<EntityRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl CommandHandler for ButtonHandler {
    async fn handle_command(
        &self,
        entity: &Entity,
        cmd_id: &str,
        _params: Option<&Map<String, Value>>,
        _connection: &Arc<ConnectionSession>,
    ) -> StatusCode {
        if cmd_id != "push" {
            return StatusCode::BadRequest;
        }
        info!("button '{}' pressed", entity.id());

        let mut state = Map::new();
        state.insert("state".into(), json!("AVAILABLE"));
        match self.registry.update_attributes(entity.id(), state).await {
            Ok(()) => StatusCode::Ok,
            Err(RegistryError::NotFound(_)) => StatusCode::NotFound,
            Err(e) => {
                warn!("button '{}': {e}", entity.id());
                StatusCode::ServerError
            }
        }
    }
}

// ── Voice ─────────────────────────────────────────────────────────────────────

/// Accepts `voice_start` and tells the controller to start streaming.
pub struct VoiceStartHandler;

#[async_trait]
impl CommandHandler for VoiceStartHandler {
    async fn handle_command(
        &self,
        entity: &Entity,
        cmd_id: &str,
        params: Option<&Map<String, Value>>,
        connection: &Arc<ConnectionSession>,
    ) -> StatusCode {
        if cmd_id != VOICE_START_COMMAND {
            return StatusCode::NotImplemented;
        }
        let Some(session_id) = params
            .and_then(|p| p.get("session_id"))
            .and_then(Value::as_u64)
            .and_then(|id| u32::try_from(id).ok())
            .filter(|id| *id > 0)
        else {
            return StatusCode::BadRequest;
        };

        match connection
            .send_assistant_event(&AssistantEvent::ready(entity.id(), session_id))
            .await
        {
            Ok(()) => StatusCode::Ok,
            Err(e) => {
                warn!("voice session {session_id}: ready event not sent: {e}");
                StatusCode::ServiceUnavailable
            }
        }
    }
}

pub struct VoiceCounter;

#[async_trait]
impl VoiceHandler for VoiceCounter {
    async fn handle_voice(&self, mut session: VoiceSession) {
        info!(
            "voice session {} started: {} ch, {} Hz, {:?}",
            session.session_id,
            session.config.channels,
            session.config.sample_rate,
            session.config.sample_format
        );
        let mut bytes = 0usize;
        while let Some(chunk) = session.audio.next().await {
            bytes += chunk.len();
        }
        let reason = session.audio.end_reason();
        info!(
            "voice session {} ended ({reason:?}): {bytes} byte(s) received",
            session.session_id
        );
        if reason == Some(VoiceEndReason::Remote) {
            return;
        }

        let entity_id = session
            .entity_id
            .clone()
            .unwrap_or_else(|| VOICE_ENTITY_ID.to_string());
        let events = [
            AssistantEvent::stt_response(
                entity_id.as_str(),
                session.session_id,
                "I'm just a demo and I don't know what you said.",
            ),
            AssistantEvent::text_response(
                entity_id.as_str(),
                session.session_id,
                true,
                format!("You have sent {bytes} bytes of audio data"),
            ),
            AssistantEvent::finished(entity_id.as_str(), session.session_id),
        ];
        for event in &events {
            if let Err(e) = session.send_event(event).await {
                debug!("voice session {}: {e}", session.session_id);
                return;
            }
        }
    }
}

pub fn voice_entity() -> Result<Entity, ucapi_core::EntityError> {
    Entity::builder(
        VOICE_ENTITY_ID,
        EntityType::VoiceAssistant,
        LanguageText::from("Demo voice").with("de", "Demo-Sprache"),
    )
    .features(["transcription", "response_text"])
    .attribute("state", json!("ON"))
    .build()
}

// ── Driver events ─────────────────────────────────────────────────────────────

/// Reacts to controller lifecycle events until the engine is dropped.
pub async fn run_events(engine: Arc<IntegrationEngine>, mut events: mpsc::UnboundedReceiver<DriverEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            DriverEvent::Connect | DriverEvent::ExitStandby => {
                engine.set_device_state(DeviceState::Connected);
            }
            DriverEvent::Disconnect => {
                engine.set_device_state(DeviceState::Disconnected);
            }
            DriverEvent::SetupAborted { reason } => info!("setup aborted: {reason:?}"),
            other => debug!("driver event: {other:?}"),
        }
    }
}
