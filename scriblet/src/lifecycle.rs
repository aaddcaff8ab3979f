//! Worker lifecycle states and the transition table.

use serde::{Deserialize, Serialize};

/// Lifecycle state of the supervised worker process.
///
/// Exactly one state is active per bridge at any time. All mutation goes
/// through the supervisor's transition function; the table in
/// [`WorkerState::can_transition_to`] is the single source of truth for
/// which edges exist.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerState {
    /// No process; initial state
    #[default]
    Stopped,
    /// Spawned, handshake not yet observed
    Starting,
    /// Handshake complete, idle
    Ready,
    /// Request in flight
    Running,
    /// Graceful shutdown requested, waiting for exit
    Stopping,
    /// Unexpected exit, spawn failure, or forced kill
    Crashed,
}

impl WorkerState {
    /// Whether the caller may dispatch application-level requests.
    pub fn can_accept_requests(&self) -> bool {
        matches!(self, Self::Ready | Self::Running)
    }

    /// Whether `to` is a legal next state.
    ///
    /// `Crashed` is additionally reachable from `Stopped` through the
    /// force-kill emergency path, which bypasses this table on purpose.
    pub fn can_transition_to(self, to: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, to),
            (Stopped | Crashed, Starting)
                | (Starting, Ready)
                | (Ready, Running)
                | (Running, Ready)
                | (Starting | Ready | Running, Stopping)
                | (Stopping, Stopped)
                | (Starting | Ready | Running | Stopping, Crashed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "STOPPED",
            Self::Starting => "STARTING",
            Self::Ready => "READY",
            Self::Running => "RUNNING",
            Self::Stopping => "STOPPING",
            Self::Crashed => "CRASHED",
        }
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
