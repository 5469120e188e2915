//! Driver setup state machine.
//!
//! ```text
//!                  start                     user data (any number of rounds)
//!   NotStarted ──────────▶ WaitingForUserAction ◀──────┐
//!        │                      │   │   └──────────────┘
//!        │ Complete/Error       │   │ Complete / Error(code)
//!        ▼                      │   ▼
//!   SetupComplete / Error ◀─────┘  SetupComplete / Error
//!
//!   any non-terminal state ── abort / owner disconnects ──▶ Aborted
//! ```
//!
//! One flow may be active per driver.  The state lock is only held to check
//! and record transitions; the driver's handler runs between
//! [`SetupFlow::start`]/[`SetupFlow::continue_with`] and
//! [`SetupFlow::finish_round`] with no lock held.  If the flow is aborted while
//! the handler runs, `finish_round` reports that and the handler's result is
//! discarded.

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use ucapi_core::protocol::messages::SetupDriverRequest;
use ucapi_core::{SetupAction, SetupErrorCode, SetupRequest, SetupStep};

use crate::domain::ConnectionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupPhase {
    NotStarted,
    WaitingForUserAction,
    SetupComplete,
    Error(SetupErrorCode),
    Aborted,
}

impl SetupPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SetupPhase::SetupComplete | SetupPhase::Error(_) | SetupPhase::Aborted
        )
    }
}

impl fmt::Display for SetupPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SetupPhase::NotStarted => f.write_str("not started"),
            SetupPhase::WaitingForUserAction => f.write_str("waiting for user action"),
            SetupPhase::SetupComplete => f.write_str("complete"),
            SetupPhase::Error(code) => write!(f, "failed ({code:?})"),
            SetupPhase::Aborted => f.write_str("aborted"),
        }
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SetupError {
    /// Another flow is active, or its handler is still running.
    #[error("a driver setup is already in progress")]
    Busy,

    /// User data arrived while the flow was not waiting for it.
    #[error("setup flow is {0}")]
    InvalidState(SetupPhase),

    /// User data arrived on a connection that does not own the flow.
    #[error("setup flow belongs to another connection")]
    NotOwner,
}

#[derive(Debug)]
struct ActiveSetup {
    owner: ConnectionId,
    request_id: u32,
    reconfigure: bool,
    round: u32,
    values: Map<String, Value>,
    handler_running: bool,
}

#[derive(Debug)]
struct FlowState {
    phase: SetupPhase,
    active: Option<ActiveSetup>,
}

#[derive(Debug)]
pub struct SetupFlow {
    state: Mutex<FlowState>,
}

impl Default for SetupFlow {
    fn default() -> Self {
        Self::new()
    }
}

impl SetupFlow {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FlowState {
                phase: SetupPhase::NotStarted,
                active: None,
            }),
        }
    }

    pub fn phase(&self) -> SetupPhase {
        self.lock().phase
    }

    /// Connection that owns the active flow, if any.
    pub fn owner(&self) -> Option<ConnectionId> {
        self.lock().active.as_ref().map(|a| a.owner)
    }

    /// Starts a flow for `owner` and returns the handler input for round 0.
    ///
    /// # Errors
    ///
    /// [`SetupError::Busy`] if a flow is already active; it is left untouched.
    pub fn start(
        &self,
        owner: ConnectionId,
        request_id: u32,
        request: SetupDriverRequest,
    ) -> Result<SetupRequest, SetupError> {
        let mut state = self.lock();
        if let Some(active) = &state.active {
            warn!(
                "setup_driver from connection {owner} rejected: flow owned by {} (request {})",
                active.owner, active.request_id
            );
            return Err(SetupError::Busy);
        }

        info!("connection {owner}: driver setup started (reconfigure={})", request.reconfigure);
        state.phase = SetupPhase::NotStarted;
        state.active = Some(ActiveSetup {
            owner,
            request_id,
            reconfigure: request.reconfigure,
            round: 0,
            values: request.setup_data.clone(),
            handler_running: true,
        });

        Ok(SetupRequest {
            step: SetupStep::Start,
            round: 0,
            reconfigure: request.reconfigure,
            values: request.setup_data,
        })
    }

    /// Records a user response and returns the handler input for the next round.
    ///
    /// Input values are merged into everything collected so far; a
    /// confirmation adds nothing to the collected values.
    ///
    /// # Errors
    ///
    /// - [`SetupError::InvalidState`] if the flow is not waiting for the user.
    /// - [`SetupError::NotOwner`] if `owner` did not start the flow.
    /// - [`SetupError::Busy`] if the previous round's handler is still running.
    pub fn continue_with(
        &self,
        owner: ConnectionId,
        request_id: u32,
        step: SetupStep,
    ) -> Result<SetupRequest, SetupError> {
        let mut state = self.lock();
        let phase = state.phase;
        let Some(active) = state.active.as_mut() else {
            return Err(SetupError::InvalidState(phase));
        };
        if active.owner != owner {
            return Err(SetupError::NotOwner);
        }
        if active.handler_running {
            return Err(SetupError::Busy);
        }
        if phase != SetupPhase::WaitingForUserAction {
            return Err(SetupError::InvalidState(phase));
        }

        if let SetupStep::UserInput { input } = &step {
            for (key, value) in input {
                active.values.insert(key.clone(), value.clone());
            }
        }
        active.round += 1;
        active.request_id = request_id;
        active.handler_running = true;
        debug!("connection {owner}: setup round {} started", active.round);

        Ok(SetupRequest {
            step,
            round: active.round,
            reconfigure: active.reconfigure,
            values: active.values.clone(),
        })
    }

    /// Applies the handler's decision for the round `owner` started.
    ///
    /// Returns the new phase, or `None` if the flow was aborted (or replaced)
    /// while the handler ran; the caller must then emit nothing.
    pub fn finish_round(&self, owner: ConnectionId, action: &SetupAction) -> Option<SetupPhase> {
        let mut state = self.lock();
        let active = state.active.as_mut().filter(|a| a.owner == owner)?;
        active.handler_running = false;

        let next = match action {
            SetupAction::RequestUserInput { .. } | SetupAction::RequestUserConfirmation { .. } => {
                SetupPhase::WaitingForUserAction
            }
            SetupAction::Complete => SetupPhase::SetupComplete,
            SetupAction::Error(code) => SetupPhase::Error(*code),
        };

        state.phase = next;
        if next.is_terminal() {
            state.active = None;
            info!("connection {owner}: driver setup finished: {next}");
        }
        Some(next)
    }

    /// Aborts the active flow on request of `requester`.  Returns whether
    /// there was one to abort.
    ///
    /// # Errors
    ///
    /// [`SetupError::NotOwner`] if another connection owns the flow; it keeps
    /// running.
    pub fn abort(&self, requester: ConnectionId) -> Result<bool, SetupError> {
        let mut state = self.lock();
        let foreign = state
            .active
            .as_ref()
            .is_some_and(|active| active.owner != requester);
        if foreign {
            return Err(SetupError::NotOwner);
        }
        Ok(Self::abort_locked(&mut state))
    }

    /// Aborts the active flow if `connection` owns it.
    pub fn connection_lost(&self, connection: ConnectionId) -> bool {
        let mut state = self.lock();
        let owned = state
            .active
            .as_ref()
            .is_some_and(|active| active.owner == connection);
        owned && Self::abort_locked(&mut state)
    }

    fn abort_locked(state: &mut FlowState) -> bool {
        match state.active.take() {
            Some(active) => {
                info!(
                    "driver setup owned by connection {} aborted in round {}",
                    active.owner, active.round
                );
                state.phase = SetupPhase::Aborted;
                true
            }
            None => false,
        }
    }

    fn lock(&self) -> MutexGuard<'_, FlowState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
