//! Run lifecycle types shared by the controller, the API and event consumers

use serde::{Deserialize, Serialize};
use std::fmt;

/// Simulation controller state
///
/// `IDLE → RUNNING → STOPPING → STOPPED`; `STOPPED` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SimulationState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

impl SimulationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SimulationState::Idle => "IDLE",
            SimulationState::Running => "RUNNING",
            SimulationState::Stopping => "STOPPING",
            SimulationState::Stopped => "STOPPED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SimulationState::Stopped)
    }

    /// Whether `next` is a legal successor of this state
    pub fn can_transition_to(&self, next: SimulationState) -> bool {
        use SimulationState::*;
        matches!(
            (self, next),
            (Idle, Running) | (Running, Stopping) | (Stopping, Stopped)
        )
    }
}

impl fmt::Display for SimulationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a run ended; the first condition observed wins
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    DurationElapsed,
    WaferCapReached,
    StopRequested,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::DurationElapsed => "duration_elapsed",
            StopReason::WaferCapReached => "wafer_cap_reached",
            StopReason::StopRequested => "stop_requested",
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
