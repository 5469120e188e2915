//! Turns inbound text frames into engine actions and responses.
//!
//! Every request gets exactly one response with the request's id.  Setup
//! requests additionally produce a `driver_setup_change` event once the
//! driver's handler has decided the round; the response always goes out
//! first.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use ucapi_core::protocol::messages::{
    names, request_id_hint, DriverUserDataRequest, EntityCommandRequest, InboundEventKind,
    RequestKind, SetupChange, SetupDriverRequest, SubscriptionRequest,
};
use ucapi_core::{
    EntityType, EventCategory, InboundMessage, OutboundMessage, SetupRequest, SetupStep,
    StatusCode,
};

use super::callbacks::SetupHandler;
use super::engine::IntegrationEngine;
use super::error::EngineError;
use super::session::ConnectionSession;
use crate::domain::{DriverEvent, SetupAbortReason};

/// A successful request outcome, before it is addressed to a request id.
struct Reply {
    code: StatusCode,
    msg: &'static str,
    data: Value,
}

impl Reply {
    fn ok(msg: &'static str, data: Value) -> Self {
        Self {
            code: StatusCode::Ok,
            msg,
            data,
        }
    }

    fn into_response(self, req_id: u32) -> OutboundMessage {
        OutboundMessage::response(req_id, self.code, self.msg, self.data)
    }
}

/// Deserializes a request payload; a missing `msg_data` counts as `{}`.
fn payload<T: DeserializeOwned>(msg: &str, msg_data: Value) -> Result<T, EngineError> {
    let msg_data = match msg_data {
        Value::Null => Value::Object(Map::new()),
        other => other,
    };
    serde_json::from_value(msg_data)
        .map_err(|e| EngineError::Protocol(format!("invalid msg_data for '{msg}': {e}")))
}

impl IntegrationEngine {
    /// Handles one text frame received on `session`.
    pub async fn dispatch_text(&self, session: &Arc<ConnectionSession>, text: &str) {
        match InboundMessage::from_json(text) {
            Ok(InboundMessage::Request { id, msg, msg_data }) => {
                debug!("connection {}: request #{id} '{msg}'", session.id());
                self.handle_request(session, id, &msg, msg_data).await;
            }
            Ok(InboundMessage::Event { msg, msg_data }) => {
                debug!("connection {}: event '{msg}'", session.id());
                self.handle_event(session, &msg, msg_data);
            }
            Err(e) => {
                let req_id = request_id_hint(text);
                warn!("connection {}: unparseable frame: {e}", session.id());
                let error = EngineError::Protocol(format!("malformed message: {e}"));
                self.respond(session, error.to_response(req_id)).await;
            }
        }
    }

    // ── Requests ──────────────────────────────────────────────────────────────

    async fn handle_request(
        &self,
        session: &Arc<ConnectionSession>,
        id: u32,
        msg: &str,
        msg_data: Value,
    ) {
        let Some(kind) = RequestKind::parse(msg) else {
            warn!("connection {}: unknown request '{msg}'", session.id());
            let error = EngineError::Protocol(format!("unknown request '{msg}'"));
            self.respond(session, error.to_response(id)).await;
            return;
        };

        let result = match kind {
            RequestKind::SetupDriver => return self.setup_driver(session, id, msg_data).await,
            RequestKind::SetDriverUserData => {
                return self.set_driver_user_data(session, id, msg_data).await
            }
            RequestKind::GetDriverVersion => Ok(Reply::ok(
                names::DRIVER_VERSION,
                json!(self.metadata.driver_version()),
            )),
            RequestKind::GetDeviceState => Ok(Reply::ok(
                names::DEVICE_STATE,
                json!({ "state": self.device_state() }),
            )),
            RequestKind::GetAvailableEntities => {
                let entities: Vec<_> = self
                    .registry
                    .list()
                    .await
                    .iter()
                    .map(|entity| entity.to_available())
                    .collect();
                Ok(Reply::ok(
                    names::AVAILABLE_ENTITIES,
                    json!({ "available_entities": entities }),
                ))
            }
            RequestKind::GetEntityStates => Ok(Reply::ok(
                names::ENTITY_STATES,
                json!(self.registry.states().await),
            )),
            RequestKind::GetDriverMetadata => {
                Ok(Reply::ok(names::DRIVER_METADATA, self.metadata.to_value()))
            }
            RequestKind::SubscribeEvents => self.subscription(session, msg, msg_data, true),
            RequestKind::UnsubscribeEvents => self.subscription(session, msg, msg_data, false),
            RequestKind::EntityCommand => self.entity_command(session, msg, msg_data).await,
        };

        let response = match result {
            Ok(reply) => reply.into_response(id),
            Err(e) => {
                info!("connection {}: request #{id} '{msg}' failed: {e}", session.id());
                e.to_response(id)
            }
        };
        self.respond(session, response).await;
    }

    fn subscription(
        &self,
        session: &ConnectionSession,
        msg: &str,
        msg_data: Value,
        subscribe: bool,
    ) -> Result<Reply, EngineError> {
        let request: SubscriptionRequest = payload(msg, msg_data)?;
        session.set_subscribed(subscribe);
        let connection = session.id();
        let entity_ids = request.entity_ids;
        self.emit(if subscribe {
            DriverEvent::SubscribeEntities {
                connection,
                entity_ids,
            }
        } else {
            DriverEvent::UnsubscribeEntities {
                connection,
                entity_ids,
            }
        });
        Ok(Reply::ok(names::RESULT, json!({})))
    }

    async fn entity_command(
        &self,
        session: &Arc<ConnectionSession>,
        msg: &str,
        msg_data: Value,
    ) -> Result<Reply, EngineError> {
        let command: EntityCommandRequest = payload(msg, msg_data)?;
        let entity = self
            .registry
            .get(&command.entity_id)
            .await
            .ok_or_else(|| EngineError::NotFound(command.entity_id.clone()))?;

        if let Some(declared) = command.entity_type.as_deref() {
            if declared != entity.entity_type().as_str() {
                return Err(EngineError::Protocol(format!(
                    "entity '{}' is a {}, not a {declared}",
                    entity.id(),
                    entity.entity_type()
                )));
            }
        }

        let handler = self.commands.resolve(&entity).ok_or_else(|| {
            EngineError::NotImplemented(format!(
                "no command handler for {} '{}'",
                entity.entity_type(),
                entity.id()
            ))
        })?;

        // Bind before the handler runs: it may tell the controller to start
        // streaming before it returns.
        let voice_session = match entity.entity_type() {
            EntityType::VoiceAssistant => command.voice_session_id(),
            _ => None,
        };
        if let Some(voice_id) = voice_session {
            session.bind_voice_entity(voice_id, entity.id());
        }

        let code = handler
            .handle_command(&entity, &command.cmd_id, command.params.as_ref(), session)
            .await;
        if let Some(voice_id) = voice_session.filter(|_| !code.is_success()) {
            session.unbind_voice_entity(voice_id);
        }
        debug!("entity '{}': command '{}' -> {}", entity.id(), command.cmd_id, code.as_u16());
        Ok(Reply {
            code,
            msg: names::RESULT,
            data: json!({}),
        })
    }

    // ── Driver setup ──────────────────────────────────────────────────────────

    async fn setup_driver(&self, session: &ConnectionSession, id: u32, msg_data: Value) {
        let Some(handler) = self.setup_handler.clone() else {
            let error = EngineError::NotImplemented("driver setup".into());
            self.respond(session, error.to_response(id)).await;
            return;
        };

        let started = payload::<SetupDriverRequest>("setup_driver", msg_data).and_then(|request| {
            self.setup
                .start(session.id(), id, request)
                .map_err(EngineError::from)
        });
        match started {
            Ok(request) => {
                self.respond_ok(session, id).await;
                self.run_setup_round(session, handler, request).await;
            }
            Err(e) => self.respond(session, e.to_response(id)).await,
        }
    }

    async fn set_driver_user_data(&self, session: &ConnectionSession, id: u32, msg_data: Value) {
        let Some(handler) = self.setup_handler.clone() else {
            let error = EngineError::NotImplemented("driver setup".into());
            self.respond(session, error.to_response(id)).await;
            return;
        };

        let continued = payload::<DriverUserDataRequest>("set_driver_user_data", msg_data)
            .and_then(|data| match (data.input_values, data.confirm) {
                (Some(input), _) => Ok(SetupStep::UserInput { input }),
                (None, Some(confirm)) => Ok(SetupStep::UserConfirmation { confirm }),
                (None, None) => Err(EngineError::Protocol(
                    "set_driver_user_data needs input_values or confirm".into(),
                )),
            })
            .and_then(|step| {
                self.setup
                    .continue_with(session.id(), id, step)
                    .map_err(EngineError::from)
            });
        match continued {
            Ok(request) => {
                self.respond_ok(session, id).await;
                self.run_setup_round(session, handler, request).await;
            }
            Err(e) => {
                info!("connection {}: set_driver_user_data rejected: {e}", session.id());
                self.respond(session, e.to_response(id)).await;
            }
        }
    }

    /// Calls the setup handler and reports its decision to the owning
    /// connection.  No engine lock is held while the handler runs.
    async fn run_setup_round(
        &self,
        session: &ConnectionSession,
        handler: Arc<dyn SetupHandler>,
        request: SetupRequest,
    ) {
        let round = request.round;
        let action = handler.handle_setup(request).await;

        let Some(phase) = self.setup.finish_round(session.id(), &action) else {
            info!("setup round {round} finished after the flow was aborted; result discarded");
            return;
        };

        let change = SetupChange::from(&action);
        let event = OutboundMessage::event(
            names::DRIVER_SETUP_CHANGE,
            EventCategory::Device,
            json!(change),
        );
        self.respond(session, event).await;

        // Keep the connection on its final page for a moment before more
        // frames are read.
        if phase.is_terminal() {
            let hold = self.settings.setup_terminal_hold();
            if !hold.is_zero() {
                tokio::time::sleep(hold).await;
            }
        }
    }

    // ── Events ────────────────────────────────────────────────────────────────

    fn handle_event(&self, session: &ConnectionSession, msg: &str, _msg_data: Value) {
        let Some(kind) = InboundEventKind::parse(msg) else {
            warn!("connection {}: ignoring unknown event '{msg}'", session.id());
            return;
        };

        match kind {
            InboundEventKind::Connect => self.emit(DriverEvent::Connect),
            InboundEventKind::Disconnect => self.emit(DriverEvent::Disconnect),
            InboundEventKind::EnterStandby => self.emit(DriverEvent::EnterStandby),
            InboundEventKind::ExitStandby => self.emit(DriverEvent::ExitStandby),
            InboundEventKind::AbortDriverSetup => match self.setup.abort(session.id()) {
                Ok(true) => self.emit(DriverEvent::SetupAborted {
                    reason: SetupAbortReason::Controller,
                }),
                Ok(false) => debug!("abort_driver_setup without an active setup flow"),
                Err(e) => warn!("connection {}: abort_driver_setup ignored: {e}", session.id()),
            },
        }
    }

    async fn respond_ok(&self, session: &ConnectionSession, id: u32) {
        let ack = OutboundMessage::response(id, StatusCode::Ok, names::RESULT, json!({}));
        self.respond(session, ack).await;
    }

    async fn respond(&self, session: &ConnectionSession, message: OutboundMessage) {
        if let Err(e) = session.send(&message).await {
            debug!("connection {}: '{}' not sent: {e}", session.id(), message.msg());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use ucapi_core::{Entity, EntityType, SetupAction, SetupErrorCode};

    use crate::application::callbacks::CommandHandler;
    use crate::application::session::Frame;
    use crate::application::setup_flow::SetupPhase;
    use crate::domain::{DriverMetadata, EngineSettings};

    // ── Fixtures ──────────────────────────────────────────────────────────────

    struct CountingCommands {
        calls: AtomicUsize,
        reply: StatusCode,
    }

    #[async_trait]
    impl CommandHandler for CountingCommands {
        async fn handle_command(
            &self,
            _entity: &Entity,
            _cmd_id: &str,
            _params: Option<&Map<String, Value>>,
            _connection: &Arc<ConnectionSession>,
        ) -> StatusCode {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.reply
        }
    }

    /// Asks for input, then confirmation, then completes or fails.
    struct TwoPageSetup;

    #[async_trait]
    impl SetupHandler for TwoPageSetup {
        async fn handle_setup(&self, request: SetupRequest) -> SetupAction {
            match request.step {
                SetupStep::Start => SetupAction::RequestUserInput {
                    title: "Address".into(),
                    settings: vec![json!({ "id": "address" })],
                },
                SetupStep::UserInput { .. } => SetupAction::RequestUserConfirmation {
                    title: "Confirm".into(),
                    header: None,
                    image: None,
                    footer: None,
                },
                SetupStep::UserConfirmation { confirm: true } => SetupAction::Complete,
                SetupStep::UserConfirmation { confirm: false } => {
                    SetupAction::Error(SetupErrorCode::AuthorizationError)
                }
            }
        }
    }

    fn settings() -> EngineSettings {
        EngineSettings {
            setup_terminal_hold_ms: 0,
            ..EngineSettings::default()
        }
    }

    fn metadata() -> DriverMetadata {
        DriverMetadata::new("test_driver", "Test", "1.2.3")
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:5000".parse().unwrap()
    }

    async fn connect(
        engine: &IntegrationEngine,
    ) -> (Arc<ConnectionSession>, mpsc::Receiver<Frame>) {
        let (session, mut rx) = engine.open_session(peer()).await;
        let _greeting = rx.recv().await;
        (session, rx)
    }

    fn next_json(rx: &mut mpsc::Receiver<Frame>) -> Value {
        let frame = rx.try_recv().expect("a queued frame");
        serde_json::from_str(&frame).unwrap()
    }

    fn request(id: u32, msg: &str, msg_data: Value) -> String {
        json!({ "kind": "req", "id": id, "msg": msg, "msg_data": msg_data }).to_string()
    }

    // ── Requests ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_get_driver_version_answers_with_request_id() {
        // Arrange
        let (engine, _events) = IntegrationEngine::builder(metadata()).build();
        let (session, mut rx) = connect(&engine).await;

        // Act
        engine
            .dispatch_text(&session, &request(7, "get_driver_version", Value::Null))
            .await;

        // Assert
        let response = next_json(&mut rx);
        assert_eq!(response["kind"], "resp");
        assert_eq!(response["req_id"], 7);
        assert_eq!(response["code"], 200);
        assert_eq!(response["msg"], "driver_version");
        assert_eq!(response["msg_data"]["version"]["driver"], "1.2.3");
    }

    #[tokio::test]
    async fn test_unknown_request_is_protocol_error() {
        let (engine, _events) = IntegrationEngine::builder(metadata()).build();
        let (session, mut rx) = connect(&engine).await;

        engine
            .dispatch_text(&session, &request(3, "make_coffee", json!({})))
            .await;

        let response = next_json(&mut rx);
        assert_eq!(response["req_id"], 3);
        assert_eq!(response["code"], 400);
        assert_eq!(response["msg_data"]["code"], "PROTOCOL_ERROR");
    }

    #[tokio::test]
    async fn test_malformed_frame_keeps_recoverable_request_id() {
        let (engine, _events) = IntegrationEngine::builder(metadata()).build();
        let (session, mut rx) = connect(&engine).await;

        engine
            .dispatch_text(&session, r#"{"kind":"req","id":12,"msg":42}"#)
            .await;

        let response = next_json(&mut rx);
        assert_eq!(response["req_id"], 12);
        assert_eq!(response["code"], 400);
    }

    #[tokio::test]
    async fn test_available_entities_lists_registered_entities() {
        // Arrange
        let builder = IntegrationEngine::builder(metadata());
        let registry = builder.registry();
        let (engine, _events) = builder.build();
        registry
            .register(Entity::builder("b1", EntityType::Button, "Button").build().unwrap())
            .await
            .unwrap();
        let (session, mut rx) = connect(&engine).await;

        // Act
        engine
            .dispatch_text(&session, &request(1, "get_available_entities", json!({})))
            .await;

        // Assert
        let response = next_json(&mut rx);
        assert_eq!(response["msg"], "available_entities");
        assert_eq!(response["msg_data"]["available_entities"][0]["entity_id"], "b1");
    }

    #[tokio::test]
    async fn test_subscribe_marks_session_and_reports_entities() {
        let (engine, mut events) = IntegrationEngine::builder(metadata()).build();
        let (session, mut rx) = connect(&engine).await;
        let _connected = events.recv().await;

        engine
            .dispatch_text(
                &session,
                &request(2, "subscribe_events", json!({ "entity_ids": ["b1"] })),
            )
            .await;

        assert!(session.is_subscribed());
        assert_eq!(next_json(&mut rx)["code"], 200);
        assert_eq!(
            events.recv().await.unwrap(),
            DriverEvent::SubscribeEntities {
                connection: session.id(),
                entity_ids: vec!["b1".into()],
            }
        );
    }

    #[tokio::test]
    async fn test_entity_command_returns_handler_status() {
        // Arrange
        let commands = Arc::new(CountingCommands {
            calls: AtomicUsize::new(0),
            reply: StatusCode::ServiceUnavailable,
        });
        let builder = IntegrationEngine::builder(metadata())
            .command_handler_for_type(EntityType::Button, commands.clone());
        let registry = builder.registry();
        let (engine, _events) = builder.build();
        registry
            .register(Entity::builder("b1", EntityType::Button, "Button").build().unwrap())
            .await
            .unwrap();
        let (session, mut rx) = connect(&engine).await;

        // Act
        engine
            .dispatch_text(
                &session,
                &request(
                    9,
                    "entity_command",
                    json!({ "entity_id": "b1", "entity_type": "button", "cmd_id": "push" }),
                ),
            )
            .await;

        // Assert
        let response = next_json(&mut rx);
        assert_eq!(response["req_id"], 9);
        assert_eq!(response["code"], 503);
        assert_eq!(commands.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_entity_command_for_unknown_entity_is_not_found() {
        let (engine, _events) = IntegrationEngine::builder(metadata()).build();
        let (session, mut rx) = connect(&engine).await;

        engine
            .dispatch_text(
                &session,
                &request(4, "entity_command", json!({ "entity_id": "ghost", "cmd_id": "push" })),
            )
            .await;

        let response = next_json(&mut rx);
        assert_eq!(response["code"], 404);
        assert_eq!(response["msg_data"]["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_entity_command_without_handler_is_not_implemented() {
        let builder = IntegrationEngine::builder(metadata());
        let registry = builder.registry();
        let (engine, _events) = builder.build();
        registry
            .register(Entity::builder("b1", EntityType::Button, "Button").build().unwrap())
            .await
            .unwrap();
        let (session, mut rx) = connect(&engine).await;

        engine
            .dispatch_text(
                &session,
                &request(5, "entity_command", json!({ "entity_id": "b1", "cmd_id": "push" })),
            )
            .await;

        assert_eq!(next_json(&mut rx)["code"], 501);
    }

    // ── Setup ─────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_setup_flow_acknowledges_before_each_change_event() {
        // Arrange
        let (engine, _events) = IntegrationEngine::builder(metadata())
            .settings(settings())
            .setup_handler(Arc::new(TwoPageSetup))
            .build();
        let (session, mut rx) = connect(&engine).await;

        // Act + Assert: start
        engine
            .dispatch_text(&session, &request(1, "setup_driver", json!({ "setup_data": {} })))
            .await;
        assert_eq!(next_json(&mut rx)["req_id"], 1);
        let first = next_json(&mut rx);
        assert_eq!(first["msg"], "driver_setup_change");
        assert_eq!(first["msg_data"]["state"], "WAIT_USER_ACTION");
        assert!(first["msg_data"]["require_user_action"]["input"].is_object());

        // Act + Assert: user input
        engine
            .dispatch_text(
                &session,
                &request(
                    2,
                    "set_driver_user_data",
                    json!({ "input_values": { "address": "10.0.0.2" } }),
                ),
            )
            .await;
        assert_eq!(next_json(&mut rx)["req_id"], 2);
        let second = next_json(&mut rx);
        assert_eq!(second["msg_data"]["state"], "WAIT_USER_ACTION");
        assert!(second["msg_data"]["require_user_action"]["confirmation"].is_object());

        // Act + Assert: confirmation
        engine
            .dispatch_text(
                &session,
                &request(3, "set_driver_user_data", json!({ "confirm": true })),
            )
            .await;
        assert_eq!(next_json(&mut rx)["req_id"], 3);
        let last = next_json(&mut rx);
        assert_eq!(last["msg_data"]["event_type"], "STOP");
        assert_eq!(last["msg_data"]["state"], "OK");
        assert_eq!(engine.setup_phase(), SetupPhase::SetupComplete);
    }

    #[tokio::test]
    async fn test_setup_error_code_reaches_controller() {
        let (engine, _events) = IntegrationEngine::builder(metadata())
            .settings(settings())
            .setup_handler(Arc::new(TwoPageSetup))
            .build();
        let (session, mut rx) = connect(&engine).await;
        engine
            .dispatch_text(&session, &request(1, "setup_driver", json!({})))
            .await;
        engine
            .dispatch_text(
                &session,
                &request(2, "set_driver_user_data", json!({ "input_values": {} })),
            )
            .await;
        while rx.try_recv().is_ok() {}

        engine
            .dispatch_text(
                &session,
                &request(3, "set_driver_user_data", json!({ "confirm": false })),
            )
            .await;

        assert_eq!(next_json(&mut rx)["code"], 200);
        let last = next_json(&mut rx);
        assert_eq!(last["msg_data"]["state"], "ERROR");
        assert_eq!(last["msg_data"]["error"], "AUTHORIZATION_ERROR");
    }

    #[tokio::test]
    async fn test_second_setup_driver_is_busy() {
        // Arrange: a flow waiting for user input
        let (engine, _events) = IntegrationEngine::builder(metadata())
            .settings(settings())
            .setup_handler(Arc::new(TwoPageSetup))
            .build();
        let (owner, mut owner_rx) = connect(&engine).await;
        let (other, mut other_rx) = connect(&engine).await;
        engine
            .dispatch_text(&owner, &request(1, "setup_driver", json!({})))
            .await;
        while owner_rx.try_recv().is_ok() {}

        // Act
        engine
            .dispatch_text(&other, &request(1, "setup_driver", json!({})))
            .await;

        // Assert
        let response = next_json(&mut other_rx);
        assert_eq!(response["code"], 409);
        assert_eq!(response["msg_data"]["code"], "BUSY");
        assert!(other_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_user_data_without_flow_is_invalid_state() {
        let (engine, _events) = IntegrationEngine::builder(metadata())
            .setup_handler(Arc::new(TwoPageSetup))
            .build();
        let (session, mut rx) = connect(&engine).await;

        engine
            .dispatch_text(
                &session,
                &request(8, "set_driver_user_data", json!({ "confirm": true })),
            )
            .await;

        let response = next_json(&mut rx);
        assert_eq!(response["code"], 409);
        assert_eq!(response["msg_data"]["code"], "INVALID_STATE");
    }

    #[tokio::test]
    async fn test_setup_without_handler_is_not_implemented() {
        let (engine, _events) = IntegrationEngine::builder(metadata()).build();
        let (session, mut rx) = connect(&engine).await;

        engine
            .dispatch_text(&session, &request(1, "setup_driver", json!({})))
            .await;

        assert_eq!(next_json(&mut rx)["code"], 501);
    }

    // ── Events ────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_abort_driver_setup_reports_controller_abort() {
        // Arrange
        let (engine, mut events) = IntegrationEngine::builder(metadata())
            .settings(settings())
            .setup_handler(Arc::new(TwoPageSetup))
            .build();
        let (session, _rx) = connect(&engine).await;
        let _connected = events.recv().await;
        engine
            .dispatch_text(&session, &request(1, "setup_driver", json!({})))
            .await;

        // Act
        engine
            .dispatch_text(&session, r#"{"kind":"event","msg":"abort_driver_setup"}"#)
            .await;

        // Assert
        assert_eq!(
            events.recv().await.unwrap(),
            DriverEvent::SetupAborted {
                reason: SetupAbortReason::Controller
            }
        );
        assert!(engine.setup.owner().is_none());
    }

    #[tokio::test]
    async fn test_abort_from_other_connection_keeps_owner_flow() {
        // Arrange
        let (engine, mut events) = IntegrationEngine::builder(metadata())
            .settings(settings())
            .setup_handler(Arc::new(TwoPageSetup))
            .build();
        let (owner, _owner_rx) = connect(&engine).await;
        let (other, _other_rx) = connect(&engine).await;
        engine
            .dispatch_text(&owner, &request(1, "setup_driver", json!({})))
            .await;

        // Act
        engine
            .dispatch_text(&other, r#"{"kind":"event","msg":"abort_driver_setup"}"#)
            .await;

        // Assert
        assert_eq!(engine.setup.owner(), Some(owner.id()));
        assert_eq!(engine.setup_phase(), SetupPhase::WaitingForUserAction);
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, DriverEvent::SetupAborted { .. }));
        }
    }

    #[tokio::test]
    async fn test_connect_event_is_forwarded_without_response() {
        let (engine, mut events) = IntegrationEngine::builder(metadata()).build();
        let (session, mut rx) = connect(&engine).await;
        let _connected = events.recv().await;

        engine
            .dispatch_text(&session, r#"{"kind":"event","msg":"connect","msg_data":{}}"#)
            .await;

        assert_eq!(events.recv().await.unwrap(), DriverEvent::Connect);
        assert!(rx.try_recv().is_err());
    }

    /// Checks the voice binding while the command runs.
    struct BindingCheck;

    #[async_trait]
    impl CommandHandler for BindingCheck {
        async fn handle_command(
            &self,
            entity: &Entity,
            _cmd_id: &str,
            params: Option<&Map<String, Value>>,
            connection: &Arc<ConnectionSession>,
        ) -> StatusCode {
            let voice_id = params
                .and_then(|p| p.get("session_id"))
                .and_then(Value::as_u64)
                .unwrap_or_default() as u32;
            if voice_id == 99 {
                return StatusCode::ServiceUnavailable;
            }
            // Put the binding back so the test can observe it.
            match connection.take_voice_entity(voice_id) {
                Some(bound) if bound == entity.id() => {
                    connection.bind_voice_entity(voice_id, &bound);
                    StatusCode::Ok
                }
                _ => StatusCode::ServerError,
            }
        }
    }

    #[tokio::test]
    async fn test_voice_start_binds_session_to_entity() {
        // Arrange
        let builder = IntegrationEngine::builder(metadata())
            .command_handler_for_type(EntityType::VoiceAssistant, Arc::new(BindingCheck));
        let registry = builder.registry();
        let (engine, _events) = builder.build();
        registry
            .register(
                Entity::builder("va", EntityType::VoiceAssistant, "Voice")
                    .build()
                    .unwrap(),
            )
            .await
            .unwrap();
        let (session, mut rx) = connect(&engine).await;

        // Act
        engine
            .dispatch_text(
                &session,
                &request(
                    1,
                    "entity_command",
                    json!({ "entity_id": "va", "cmd_id": "voice_start", "params": { "session_id": 3 } }),
                ),
            )
            .await;
        engine
            .dispatch_text(
                &session,
                &request(
                    2,
                    "entity_command",
                    json!({ "entity_id": "va", "cmd_id": "voice_start", "params": { "session_id": 99 } }),
                ),
            )
            .await;

        // Assert: a refused voice_start leaves no binding behind
        assert_eq!(next_json(&mut rx)["code"], 200);
        assert_eq!(next_json(&mut rx)["code"], 503);
        assert_eq!(session.take_voice_entity(3).as_deref(), Some("va"));
        assert_eq!(session.take_voice_entity(99), None);
    }
}
