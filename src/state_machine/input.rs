//! Inputs that drive the lifecycle

use crate::protocol::Event;

/// Everything the lifecycle tracker reacts to: user commands, outcomes of
/// transport calls, and decoded protocol events.
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    // User commands
    Send {
        content: String,
    },
    Continue,
    Interrupt,

    // Transport call outcomes
    TransportAccepted {
        turn: u64,
        session_id: String,
    },
    TransportFailed {
        turn: u64,
        message: String,
    },

    // Assistant stream
    Protocol(Event),
}

impl Input {
    /// Short name for logging
    pub fn name(&self) -> &str {
        match self {
            Input::Send { .. } => "send",
            Input::Continue => "continue",
            Input::Interrupt => "interrupt",
            Input::TransportAccepted { .. } => "transport_accepted",
            Input::TransportFailed { .. } => "transport_failed",
            Input::Protocol(event) => event.kind(),
        }
    }
}

impl From<Event> for Input {
    fn from(event: Event) -> Self {
        Input::Protocol(event)
    }
}
