//! JSON control-channel messages.
//!
//! Every text frame is one JSON object with a `kind` discriminator:
//!
//! ```text
//! controller → driver   {"kind":"req","id":12,"msg":"get_driver_version","msg_data":{}}
//! controller → driver   {"kind":"event","msg":"enter_standby","msg_data":{}}
//! driver → controller   {"kind":"resp","req_id":12,"code":200,"msg":"driver_version","msg_data":{...}}
//! driver → controller   {"kind":"event","msg":"entity_change","cat":"ENTITY","msg_data":{...}}
//! ```
//!
//! The `msg` field names the operation; the payload structs below describe
//! the `msg_data` shapes this crate produces or consumes.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::entity::EntityType;
use crate::domain::setup::{SetupAction, SetupErrorCode};
use crate::domain::text::LanguageText;

// ── Message names ─────────────────────────────────────────────────────────────

/// Wire names used in the `msg` field.
pub mod names {
    // Responses
    pub const AUTHENTICATION: &str = "authentication";
    pub const DRIVER_VERSION: &str = "driver_version";
    pub const DEVICE_STATE: &str = "device_state";
    pub const AVAILABLE_ENTITIES: &str = "available_entities";
    pub const ENTITY_STATES: &str = "entity_states";
    pub const DRIVER_METADATA: &str = "driver_metadata";
    pub const RESULT: &str = "result";

    // Events emitted by the driver
    pub const ENTITY_CHANGE: &str = "entity_change";
    pub const DRIVER_SETUP_CHANGE: &str = "driver_setup_change";
    pub const ASSISTANT_EVENT: &str = "assistant_event";
}

/// Requests the controller can send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    GetDriverVersion,
    GetDeviceState,
    GetAvailableEntities,
    GetEntityStates,
    GetDriverMetadata,
    SubscribeEvents,
    UnsubscribeEvents,
    EntityCommand,
    SetupDriver,
    SetDriverUserData,
}

impl RequestKind {
    pub fn parse(msg: &str) -> Option<Self> {
        Some(match msg {
            "get_driver_version" => RequestKind::GetDriverVersion,
            "get_device_state" => RequestKind::GetDeviceState,
            "get_available_entities" => RequestKind::GetAvailableEntities,
            "get_entity_states" => RequestKind::GetEntityStates,
            "get_driver_metadata" => RequestKind::GetDriverMetadata,
            "subscribe_events" => RequestKind::SubscribeEvents,
            "unsubscribe_events" => RequestKind::UnsubscribeEvents,
            "entity_command" => RequestKind::EntityCommand,
            "setup_driver" => RequestKind::SetupDriver,
            "set_driver_user_data" => RequestKind::SetDriverUserData,
            _ => return None,
        })
    }
}

/// Events the controller can send.  They never get a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundEventKind {
    Connect,
    Disconnect,
    EnterStandby,
    ExitStandby,
    AbortDriverSetup,
}

impl InboundEventKind {
    pub fn parse(msg: &str) -> Option<Self> {
        Some(match msg {
            "connect" => InboundEventKind::Connect,
            "disconnect" => InboundEventKind::Disconnect,
            "enter_standby" => InboundEventKind::EnterStandby,
            "exit_standby" => InboundEventKind::ExitStandby,
            "abort_driver_setup" => InboundEventKind::AbortDriverSetup,
            _ => return None,
        })
    }
}

// ── Status codes & enums ──────────────────────────────────────────────────────

/// HTTP-like status codes carried in the `code` field of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum StatusCode {
    Ok = 200,
    BadRequest = 400,
    Unauthorized = 401,
    NotFound = 404,
    Conflict = 409,
    ServerError = 500,
    NotImplemented = 501,
    ServiceUnavailable = 503,
}

impl StatusCode {
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    pub fn is_success(self) -> bool {
        self == StatusCode::Ok
    }
}

/// Connection state of the device(s) behind the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceState {
    Connected,
    Connecting,
    #[default]
    Disconnected,
    Error,
}

/// Category of a driver-emitted event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventCategory {
    Device,
    Entity,
}

// ── Envelopes ─────────────────────────────────────────────────────────────────

/// A frame sent by the controller.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind")]
pub enum InboundMessage {
    #[serde(rename = "req")]
    Request {
        id: u32,
        msg: String,
        #[serde(default)]
        msg_data: Value,
    },
    #[serde(rename = "event")]
    Event {
        msg: String,
        #[serde(default)]
        msg_data: Value,
    },
}

impl InboundMessage {
    /// Parses one text frame.
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error for malformed JSON, a missing or
    /// unknown `kind`, or a request without an integer `id`.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Best-effort recovery of the request id from a frame that failed to parse,
/// so the error response can still be correlated.  Returns 0 when the frame
/// is not even a JSON object with an integer `id`.
pub fn request_id_hint(text: &str) -> u32 {
    serde_json::from_str::<Value>(text)
        .ok()
        .and_then(|value| value.get("id").and_then(Value::as_u64))
        .and_then(|id| u32::try_from(id).ok())
        .unwrap_or(0)
}

/// A frame sent by the driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum OutboundMessage {
    #[serde(rename = "resp")]
    Response {
        req_id: u32,
        code: u16,
        msg: String,
        msg_data: Value,
    },
    #[serde(rename = "event")]
    Event {
        msg: String,
        msg_data: Value,
        cat: EventCategory,
    },
}

impl OutboundMessage {
    pub fn response(req_id: u32, code: StatusCode, msg: &str, msg_data: Value) -> Self {
        OutboundMessage::Response {
            req_id,
            code: code.as_u16(),
            msg: msg.to_string(),
            msg_data,
        }
    }

    pub fn event(msg: &str, cat: EventCategory, msg_data: Value) -> Self {
        OutboundMessage::Event {
            msg: msg.to_string(),
            msg_data,
            cat,
        }
    }

    pub fn msg(&self) -> &str {
        match self {
            OutboundMessage::Response { msg, .. } | OutboundMessage::Event { msg, .. } => msg,
        }
    }

    /// Serializes the frame for the wire.
    ///
    /// # Errors
    ///
    /// Only fails if a payload contains a non-string map key, which the
    /// payload types in this module never produce.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// A copy of the frame that is safe to write to logs.  See [`redact_msg_data`].
    pub fn redacted(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Some(msg_data) = value.get_mut("msg_data") {
            *msg_data = redact_msg_data(msg_data);
        }
        value
    }
}

// ── Payloads ──────────────────────────────────────────────────────────────────

/// `msg_data` of an error response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

/// `msg_data` of a `driver_version` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverVersion {
    pub name: String,
    pub version: VersionInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api: Option<String>,
    pub driver: String,
}

/// One entry of `available_entities`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvailableEntity {
    pub entity_id: String,
    pub entity_type: EntityType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    pub features: Vec<String>,
    pub name: LanguageText,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub area: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Map<String, Value>>,
}

/// One entry of `entity_states`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityState {
    pub entity_id: String,
    pub entity_type: EntityType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    pub attributes: Map<String, Value>,
}

/// `msg_data` of an `entity_change` event: the attributes of one update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityChange {
    pub entity_id: String,
    pub entity_type: EntityType,
    pub attributes: Map<String, Value>,
}

/// `msg_data` of an `entity_command` request.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EntityCommandRequest {
    pub entity_id: String,
    #[serde(default)]
    pub entity_type: Option<String>,
    pub cmd_id: String,
    #[serde(default)]
    pub params: Option<Map<String, Value>>,
}

/// Voice assistant command announcing a voice session.
pub const VOICE_START_COMMAND: &str = "voice_start";

impl EntityCommandRequest {
    /// The `session_id` parameter of a `voice_start` command.
    pub fn voice_session_id(&self) -> Option<u32> {
        if self.cmd_id != VOICE_START_COMMAND {
            return None;
        }
        let id = self.params.as_ref()?.get("session_id")?.as_u64()?;
        u32::try_from(id).ok().filter(|id| *id > 0)
    }
}

/// `msg_data` of `subscribe_events` / `unsubscribe_events`.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct SubscriptionRequest {
    #[serde(default)]
    pub entity_ids: Vec<String>,
}

/// `msg_data` of a `setup_driver` request.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct SetupDriverRequest {
    #[serde(default)]
    pub reconfigure: bool,
    #[serde(default)]
    pub setup_data: Map<String, Value>,
}

/// `msg_data` of a `set_driver_user_data` request.  Exactly one of the two
/// fields is expected.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct DriverUserDataRequest {
    #[serde(default)]
    pub input_values: Option<Map<String, Value>>,
    #[serde(default)]
    pub confirm: Option<bool>,
}

// ── Setup change events ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SetupEventType {
    Setup,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SetupChangeState {
    Setup,
    WaitUserAction,
    Ok,
    Error,
}

/// `msg_data` of a `driver_setup_change` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetupChange {
    pub event_type: SetupEventType,
    pub state: SetupChangeState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub require_user_action: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SetupErrorCode>,
}

impl From<&SetupAction> for SetupChange {
    fn from(action: &SetupAction) -> Self {
        match action {
            SetupAction::RequestUserInput { title, settings } => SetupChange {
                event_type: SetupEventType::Setup,
                state: SetupChangeState::WaitUserAction,
                require_user_action: Some(serde_json::json!({
                    "input": { "title": title, "settings": settings }
                })),
                error: None,
            },
            SetupAction::RequestUserConfirmation {
                title,
                header,
                image,
                footer,
            } => {
                let mut confirmation = Map::new();
                confirmation.insert("title".into(), serde_json::json!(title));
                if let Some(header) = header {
                    confirmation.insert("message1".into(), serde_json::json!(header));
                }
                if let Some(image) = image {
                    confirmation.insert("image".into(), Value::from(image.as_str()));
                }
                if let Some(footer) = footer {
                    confirmation.insert("message2".into(), serde_json::json!(footer));
                }
                SetupChange {
                    event_type: SetupEventType::Setup,
                    state: SetupChangeState::WaitUserAction,
                    require_user_action: Some(serde_json::json!({ "confirmation": confirmation })),
                    error: None,
                }
            }
            SetupAction::Complete => SetupChange {
                event_type: SetupEventType::Stop,
                state: SetupChangeState::Ok,
                require_user_action: None,
                error: None,
            },
            SetupAction::Error(code) => SetupChange {
                event_type: SetupEventType::Stop,
                state: SetupChangeState::Error,
                require_user_action: None,
                error: Some(*code),
            },
        }
    }
}

// ── Assistant events ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssistantEventType {
    /// The driver is ready to receive the audio stream.
    Ready,
    SttResponse,
    TextResponse,
    SpeechResponse,
    /// Last event of a voice session.
    Finished,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssistantErrorCode {
    ServiceUnavailable,
    InvalidAudio,
    NoTextRecognized,
    IntentFailed,
    TtsFailed,
    Timeout,
    UnexpectedError,
}

/// The `data` member of an assistant event.  Its shape follows the event type.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AssistantEventData {
    SttResponse {
        text: String,
    },
    TextResponse {
        success: bool,
        text: String,
    },
    SpeechResponse {
        url: String,
        mime_type: String,
    },
    Error {
        code: AssistantErrorCode,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

/// `msg_data` of an `assistant_event`, sent only to the connection that
/// started the voice session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssistantEvent {
    #[serde(rename = "type")]
    pub event_type: AssistantEventType,
    pub entity_id: String,
    pub session_id: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<AssistantEventData>,
}

impl AssistantEvent {
    fn new(
        event_type: AssistantEventType,
        entity_id: impl Into<String>,
        session_id: u32,
        data: Option<AssistantEventData>,
    ) -> Self {
        Self {
            event_type,
            entity_id: entity_id.into(),
            session_id,
            data,
        }
    }

    pub fn ready(entity_id: impl Into<String>, session_id: u32) -> Self {
        Self::new(AssistantEventType::Ready, entity_id, session_id, None)
    }

    pub fn stt_response(entity_id: impl Into<String>, session_id: u32, text: impl Into<String>) -> Self {
        let data = AssistantEventData::SttResponse { text: text.into() };
        Self::new(AssistantEventType::SttResponse, entity_id, session_id, Some(data))
    }

    pub fn text_response(
        entity_id: impl Into<String>,
        session_id: u32,
        success: bool,
        text: impl Into<String>,
    ) -> Self {
        let data = AssistantEventData::TextResponse {
            success,
            text: text.into(),
        };
        Self::new(AssistantEventType::TextResponse, entity_id, session_id, Some(data))
    }

    pub fn speech_response(
        entity_id: impl Into<String>,
        session_id: u32,
        url: impl Into<String>,
        mime_type: impl Into<String>,
    ) -> Self {
        let data = AssistantEventData::SpeechResponse {
            url: url.into(),
            mime_type: mime_type.into(),
        };
        Self::new(AssistantEventType::SpeechResponse, entity_id, session_id, Some(data))
    }

    pub fn error(
        entity_id: impl Into<String>,
        session_id: u32,
        code: AssistantErrorCode,
        message: Option<String>,
    ) -> Self {
        let data = AssistantEventData::Error { code, message };
        Self::new(AssistantEventType::Error, entity_id, session_id, Some(data))
    }

    pub fn finished(entity_id: impl Into<String>, session_id: u32) -> Self {
        Self::new(AssistantEventType::Finished, entity_id, session_id, None)
    }

    /// Wraps the event in its `assistant_event` envelope.
    pub fn to_message(&self) -> OutboundMessage {
        OutboundMessage::event(
            names::ASSISTANT_EVENT,
            EventCategory::Entity,
            serde_json::to_value(self).unwrap_or(Value::Null),
        )
    }
}

// ── Log redaction ─────────────────────────────────────────────────────────────

const REDACTED_ATTRIBUTES: &[&str] = &["media_image_url"];

/// Returns a copy of `msg_data` with inline image data replaced by `data:***`.
///
/// Covers both shapes that carry attributes: a single object with an
/// `attributes` map (entity change) and a list of such objects (entity
/// states).  The input is left untouched.
pub fn redact_msg_data(msg_data: &Value) -> Value {
    let mut copy = msg_data.clone();
    match &mut copy {
        Value::Object(_) => redact_attributes(&mut copy),
        Value::Array(items) => items.iter_mut().for_each(redact_attributes),
        _ => {}
    }
    copy
}

fn redact_attributes(item: &mut Value) {
    let Some(attributes) = item.get_mut("attributes").and_then(Value::as_object_mut) else {
        return;
    };
    for key in REDACTED_ATTRIBUTES {
        if let Some(Value::String(url)) = attributes.get_mut(*key) {
            if url.starts_with("data:") {
                *url = "data:***".to_string();
            }
        }
    }
}
