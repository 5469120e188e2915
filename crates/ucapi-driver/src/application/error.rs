//! Request-level errors and their mapping to error responses.
//!
//! Every error a request handler can hit ends up as an [`EngineError`].  The
//! dispatcher turns it into exactly one response frame with an HTTP-like
//! status and a stable machine-readable code.

use serde_json::json;
use thiserror::Error;

use ucapi_core::protocol::messages::{names, ErrorPayload};
use ucapi_core::{EntityError, OutboundMessage, StatusCode};

use super::registry::RegistryError;
use super::setup_flow::SetupError;

#[derive(Debug, Error, PartialEq)]
pub enum EngineError {
    /// Malformed frame, unknown message, or a payload that does not fit.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("entity not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    InvalidAttribute(EntityError),

    /// A setup flow is already running.
    #[error("driver setup already in progress")]
    Busy,

    /// The request is valid but not in the current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn status(&self) -> StatusCode {
        match self {
            EngineError::Protocol(_) | EngineError::InvalidAttribute(_) => StatusCode::BadRequest,
            EngineError::NotFound(_) => StatusCode::NotFound,
            EngineError::Busy => StatusCode::Conflict,
            EngineError::InvalidState(_) => StatusCode::Conflict,
            EngineError::NotImplemented(_) => StatusCode::NotImplemented,
            EngineError::Internal(_) => StatusCode::ServerError,
        }
    }

    /// Stable code placed in `msg_data.code`.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Protocol(_) => "PROTOCOL_ERROR",
            EngineError::NotFound(_) => "NOT_FOUND",
            EngineError::InvalidAttribute(_) => "INVALID_ATTRIBUTE",
            EngineError::Busy => "BUSY",
            EngineError::InvalidState(_) => "INVALID_STATE",
            EngineError::NotImplemented(_) => "NOT_IMPLEMENTED",
            EngineError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// The error response answering request `req_id`.
    pub fn to_response(&self, req_id: u32) -> OutboundMessage {
        let payload = ErrorPayload {
            code: self.code().to_string(),
            message: self.to_string(),
        };
        OutboundMessage::response(req_id, self.status(), names::RESULT, json!(payload))
    }
}

impl From<RegistryError> for EngineError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(id) => EngineError::NotFound(id),
            RegistryError::InvalidAttribute(e) => EngineError::InvalidAttribute(e),
            RegistryError::DuplicateIdentity(id) => {
                EngineError::Internal(format!("duplicate entity id '{id}'"))
            }
        }
    }
}

impl From<SetupError> for EngineError {
    fn from(err: SetupError) -> Self {
        match err {
            SetupError::Busy => EngineError::Busy,
            SetupError::InvalidState(phase) => {
                EngineError::InvalidState(format!("setup flow is {phase}"))
            }
            SetupError::NotOwner => {
                EngineError::InvalidState("setup flow belongs to another connection".to_string())
            }
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Protocol(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_maps_to_conflict() {
        let err = EngineError::Busy;
        assert_eq!(err.status(), StatusCode::Conflict);
        assert_eq!(err.code(), "BUSY");
    }

    #[test]
    fn test_error_response_shape() {
        // Arrange
        let err = EngineError::NotFound("lamp".into());

        // Act
        let value = serde_json::to_value(err.to_response(5)).unwrap();

        // Assert
        assert_eq!(value["kind"], "resp");
        assert_eq!(value["req_id"], 5);
        assert_eq!(value["code"], 404);
        assert_eq!(value["msg"], "result");
        assert_eq!(value["msg_data"]["code"], "NOT_FOUND");
        assert_eq!(value["msg_data"]["message"], "entity not found: lamp");
    }

    #[test]
    fn test_registry_not_found_converts() {
        let err: EngineError = RegistryError::NotFound("x".into()).into();
        assert_eq!(err, EngineError::NotFound("x".into()));
    }

    #[test]
    fn test_json_error_is_protocol_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: EngineError = json_err.into();
        assert_eq!(err.status(), StatusCode::BadRequest);
        assert_eq!(err.code(), "PROTOCOL_ERROR");
    }
}
