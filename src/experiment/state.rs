//! Run state machine of the acquisition loop.
//!
//! # State Machine
//!
//! ```text
//!            start            setup ok
//! Idle ─────────────> Arming ──────────> Running ──pause──> Paused
//!  ▲                    │  │               │  ▲               │
//!  │          setup err │  │ stop     stop │  └───continue────┘
//!  │                    ▼  ▼               ▼                  │ stop
//!  │ clear error     Error  Stopping <─────┴──────────────────┘
//!  └──────────────────┘        │
//!  ▲        teardown complete  │
//!  └───────────────────────────┘
//! ```
//!
//! Any active state may also fall into `Error` on a fatal hardware failure; the
//! coordinator tears the instruments down before that transition is taken.

use crate::error::{OdmrError, OdmrResult};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a pulsed-ODMR run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    /// No run, instruments off
    Idle,
    /// Coordinator is configuring the instruments
    Arming,
    /// Lines are being acquired
    Running,
    /// Instruments configured, no lines acquired
    Paused,
    /// Teardown in progress
    Stopping,
    /// A fatal failure ended the run; requires an explicit clear
    Error,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunState::Idle => "idle",
            RunState::Arming => "arming",
            RunState::Running => "running",
            RunState::Paused => "paused",
            RunState::Stopping => "stopping",
            RunState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Events that drive [`RunState`] transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEvent {
    StartRequested,
    SetupSucceeded,
    SetupFailed,
    StopRequested,
    PauseRequested,
    ContinueRequested,
    TeardownComplete,
    FatalFailure,
    ClearError,
}

impl RunState {
    /// Applies `event`, returning the next state or `Busy` if the transition is not allowed.
    pub fn apply(self, event: RunEvent) -> OdmrResult<RunState> {
        use RunEvent::*;
        use RunState::*;

        let next = match (self, event) {
            (Idle, StartRequested) => Arming,
            (Arming, SetupSucceeded) => Running,
            (Arming, SetupFailed) => Error,
            (Arming | Running | Paused, StopRequested) => Stopping,
            (Running, PauseRequested) => Paused,
            (Paused, ContinueRequested) => Running,
            (Stopping, TeardownComplete) => Idle,
            (Arming | Running | Paused | Stopping, FatalFailure) => Error,
            (Error, ClearError) => Idle,
            (state, event) => {
                return Err(OdmrError::busy(state, event.request_name()));
            }
        };
        Ok(next)
    }

    /// Whether the instruments are (being) driven by a run.
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            RunState::Arming | RunState::Running | RunState::Paused | RunState::Stopping
        )
    }

    /// Sweep and pulse parameters may only change while no run holds the instruments.
    pub fn accepts_parameter_updates(&self) -> bool {
        matches!(self, RunState::Idle | RunState::Error)
    }
}

impl RunEvent {
    fn request_name(&self) -> &'static str {
        match self {
            RunEvent::StartRequested => "start",
            RunEvent::SetupSucceeded | RunEvent::SetupFailed => "finish setup",
            RunEvent::StopRequested => "stop",
            RunEvent::PauseRequested => "pause",
            RunEvent::ContinueRequested => "continue",
            RunEvent::TeardownComplete => "finish teardown",
            RunEvent::FatalFailure => "fail",
            RunEvent::ClearError => "clear error",
        }
    }
}

/// State as published to observers, with the reason for the last error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStatus {
    pub state: RunState,
    pub reason: Option<String>,
}

impl RunStatus {
    pub fn new(state: RunState) -> Self {
        Self {
            state,
            reason: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }
}

impl Default for RunStatus {
    fn default() -> Self {
        Self::new(RunState::Idle)
    }
}
