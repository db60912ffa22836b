//! Assistant stream protocol
//!
//! Decodes the line-delimited JSON events the transport emits into typed
//! [`Event`]s. Malformed payloads become a [`DecodeError`]; unknown kinds
//! decode to [`Event::Unrecognized`] so newer assistants don't break older
//! clients.

mod lines;
mod wire;

pub use lines::LineDecoder;

use crate::model::PermissionDenial;
use serde_json::Value;
use thiserror::Error;
use wire::WireEvent;

/// A decoded protocol event
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    SessionStart {
        session_id: String,
    },
    TextDelta {
        text: String,
    },
    ToolStart {
        tool_name: String,
        input: Value,
        /// Present only when the assistant tags its tool calls
        call_id: Option<String>,
    },
    ToolEnd {
        tool_name: String,
        output: Option<String>,
        call_id: Option<String>,
    },
    PermissionRequest {
        session_id: String,
        denials: Vec<PermissionDenial>,
    },
    Result {
        subtype: ResultSubtype,
        content: Option<String>,
    },
    Error {
        error: String,
    },
    SessionEnd,
    /// A kind this client doesn't know; ignored downstream
    Unrecognized {
        kind: String,
    },
}

impl Event {
    /// Wire name of the event kind, for logging
    pub fn kind(&self) -> &str {
        match self {
            Event::SessionStart { .. } => "session_start",
            Event::TextDelta { .. } => "text_delta",
            Event::ToolStart { .. } => "tool_start",
            Event::ToolEnd { .. } => "tool_end",
            Event::PermissionRequest { .. } => "permission_request",
            Event::Result { .. } => "result",
            Event::Error { .. } => "error",
            Event::SessionEnd => "session_end",
            Event::Unrecognized { kind } => kind,
        }
    }
}

/// How the assistant says a turn ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultSubtype {
    Success,
    /// `error_*` subtypes, e.g. `error_max_turns`
    Error(String),
    Other(String),
}

impl ResultSubtype {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "success" => ResultSubtype::Success,
            s if s.starts_with("error") => ResultSubtype::Error(s.to_string()),
            s => ResultSubtype::Other(s.to_string()),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ResultSubtype::Error(_))
    }
}

/// A payload that could not be decoded
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("empty event line")]
    Empty,
    #[error("malformed event payload: {message}")]
    Malformed { raw: String, message: String },
}

impl DecodeError {
    fn malformed(raw: &str, message: impl Into<String>) -> Self {
        DecodeError::Malformed {
            raw: raw.to_string(),
            message: message.into(),
        }
    }

    /// The offending input, if any
    pub fn raw(&self) -> Option<&str> {
        match self {
            DecodeError::Empty => None,
            DecodeError::Malformed { raw, .. } => Some(raw),
        }
    }
}

/// Decode one transport message.
///
/// Never panics; every failure is returned as a [`DecodeError`].
pub fn decode(raw: &str) -> Result<Event, DecodeError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(DecodeError::Empty);
    }

    let value: Value =
        serde_json::from_str(trimmed).map_err(|e| DecodeError::malformed(trimmed, e.to_string()))?;

    let Some(kind) = value.get("type").and_then(Value::as_str).map(str::to_string) else {
        return Err(DecodeError::malformed(trimmed, "missing string field `type`"));
    };

    if !WireEvent::is_known_kind(&kind) {
        return Ok(Event::Unrecognized { kind });
    }

    let wire: WireEvent = serde_json::from_value(value)
        .map_err(|e| DecodeError::malformed(trimmed, format!("invalid `{kind}` event: {e}")))?;

    Ok(wire.into_event(kind))
}
