//! Types exchanged between the setup state machine and a driver's setup
//! handler.
//!
//! The engine calls the handler with a [`SetupRequest`] once per round and
//! the handler answers with a [`SetupAction`] that decides the next state.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::text::LanguageText;

/// Machine-readable reason a setup ended in the error state.
///
/// The code chosen by the driver is forwarded to the controller unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SetupErrorCode {
    None,
    NotFound,
    ConnectionRefused,
    AuthorizationError,
    Timeout,
    Other,
}

/// What triggered the current setup round.
#[derive(Debug, Clone, PartialEq)]
pub enum SetupStep {
    /// `setup_driver` from the controller.
    Start,
    /// `set_driver_user_data` carrying form values.
    UserInput { input: Map<String, Value> },
    /// `set_driver_user_data` answering a confirmation page.
    UserConfirmation { confirm: bool },
}

/// Input to one invocation of the driver's setup handler.
#[derive(Debug, Clone, PartialEq)]
pub struct SetupRequest {
    pub step: SetupStep,
    /// 0 for the start round, incremented on every user response.
    pub round: u32,
    /// True when the controller is reconfiguring an already set-up driver.
    pub reconfigure: bool,
    /// Every value collected so far: the start round's setup data plus all
    /// input values from later rounds.  Later rounds overwrite earlier keys.
    pub values: Map<String, Value>,
}

impl SetupRequest {
    /// Convenience accessor for a collected string value.
    pub fn value_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }
}

/// The driver's decision at the end of a setup round.
#[derive(Debug, Clone, PartialEq)]
pub enum SetupAction {
    /// Show a form; `settings` is the list of field descriptors.
    RequestUserInput {
        title: LanguageText,
        settings: Vec<Value>,
    },
    /// Ask the user to confirm something.
    RequestUserConfirmation {
        title: LanguageText,
        header: Option<LanguageText>,
        image: Option<String>,
        footer: Option<LanguageText>,
    },
    Complete,
    Error(SetupErrorCode),
}

impl SetupAction {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SetupAction::Complete | SetupAction::Error(_))
    }
}
