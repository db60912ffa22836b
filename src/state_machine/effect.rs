//! Effects produced by lifecycle transitions

use crate::model::PermissionDenial;
use crate::transport::TransportCommand;
use serde_json::Value;

/// Work the conversation store performs after a transition, in order
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Clear the stream buffer and tool ledger for a new turn
    ResetTurn,

    /// Optimistically record what the user sent
    AppendUserMessage { content: String },

    /// Extend the in-progress assistant text
    AppendText { text: String },

    /// Open a tool call in the ledger
    OpenTool {
        name: String,
        input: Value,
        call_id: Option<String>,
    },

    /// Close the matching tool call
    CloseTool {
        name: String,
        output: Option<String>,
        call_id: Option<String>,
    },

    /// Turn the buffers into a finalized message. `fallback_text` is used
    /// only when no delta text arrived.
    FinalizeTurn { fallback_text: Option<String> },

    /// Surface a permission request to the user
    RaisePermission {
        session_id: String,
        denials: Vec<PermissionDenial>,
    },

    /// Replace the sticky error
    RaiseError { message: String },

    /// Ask the transport to do something (runs in the background)
    Transport(TransportCommand),
}

impl Effect {
    pub fn finalize() -> Self {
        Effect::FinalizeTurn {
            fallback_text: None,
        }
    }

    pub fn raise_error(message: impl Into<String>) -> Self {
        Effect::RaiseError {
            message: message.into(),
        }
    }

    /// Whether this effect writes the stream buffer or ledger
    pub fn touches_buffers(&self) -> bool {
        matches!(
            self,
            Effect::AppendText { .. } | Effect::OpenTool { .. } | Effect::CloseTool { .. }
        )
    }
}
