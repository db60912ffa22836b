//! Lifecycle state types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a session is in its turn cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// No turn has been started yet
    #[default]
    Idle,
    /// Send/continue issued, waiting for the assistant's `session_start`
    Starting,
    /// Assistant output is arriving
    Streaming,
    /// User cancelled mid-stream
    Interrupted,
    /// Turn ended normally
    Completed,
    /// Turn ended with an assistant or transport error
    Errored,
}

impl LifecycleState {
    /// A turn is in flight
    pub fn is_busy(self) -> bool {
        matches!(self, LifecycleState::Starting | LifecycleState::Streaming)
    }

    /// The last turn has ended one way or another
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            LifecycleState::Interrupted | LifecycleState::Completed | LifecycleState::Errored
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Idle => "idle",
            LifecycleState::Starting => "starting",
            LifecycleState::Streaming => "streaming",
            LifecycleState::Interrupted => "interrupted",
            LifecycleState::Completed => "completed",
            LifecycleState::Errored => "errored",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One assistant conversation as the lifecycle tracker sees it
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Session {
    pub lifecycle: LifecycleState,
    /// Assigned by the assistant; absent until the first session event
    pub session_id: Option<String>,
    /// Incremented on every transition into `starting`. Transport outcomes
    /// carry the turn they belong to so late results can be recognised.
    pub turn: u64,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Session state after loading a recovery snapshot
    pub fn restored(session_id: Option<String>) -> Self {
        let lifecycle = if session_id.is_some() {
            LifecycleState::Completed
        } else {
            LifecycleState::Idle
        };
        Self {
            lifecycle,
            session_id,
            turn: 0,
        }
    }

    pub(crate) fn begin_turn(&self) -> Self {
        Self {
            lifecycle: LifecycleState::Starting,
            session_id: self.session_id.clone(),
            turn: self.turn + 1,
        }
    }

    pub(crate) fn with_lifecycle(&self, lifecycle: LifecycleState) -> Self {
        Self {
            lifecycle,
            ..self.clone()
        }
    }
}
