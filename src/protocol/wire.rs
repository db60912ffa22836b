//! Serde shapes of the wire events

use super::{Event, ResultSubtype};
use crate::model::PermissionDenial;
use serde::Deserialize;
use serde_json::{Map, Value};

const KNOWN_KINDS: &[&str] = &[
    "session_start",
    "text_delta",
    "tool_start",
    "tool_end",
    "permission_request",
    "result",
    "error",
    "session_end",
    "assistant",
    "system",
];

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(super) enum WireEvent {
    SessionStart {
        #[serde(rename = "sessionId", alias = "session_id")]
        session_id: String,
    },
    TextDelta {
        text: String,
    },
    ToolStart {
        #[serde(rename = "toolName", alias = "tool_name")]
        tool_name: String,
        #[serde(default)]
        input: Option<Value>,
        #[serde(default, rename = "callId", alias = "call_id", alias = "tool_use_id")]
        call_id: Option<String>,
    },
    ToolEnd {
        #[serde(rename = "toolName", alias = "tool_name")]
        tool_name: String,
        #[serde(default)]
        output: Option<Value>,
        #[serde(default, rename = "callId", alias = "call_id", alias = "tool_use_id")]
        call_id: Option<String>,
    },
    PermissionRequest {
        #[serde(rename = "sessionId", alias = "session_id")]
        session_id: String,
        #[serde(default)]
        denials: Vec<WireDenial>,
    },
    Result {
        subtype: String,
        #[serde(default)]
        content: Option<String>,
        /// CLI spelling of the final text
        #[serde(default)]
        result: Option<String>,
    },
    Error {
        error: Value,
    },
    SessionEnd,
    Assistant {
        #[serde(default)]
        message: Option<WireAssistantMessage>,
        #[serde(default)]
        content: Option<Vec<WirePart>>,
    },
    System {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default, alias = "sessionId")]
        session_id: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
pub(super) struct WireAssistantMessage {
    #[serde(default)]
    content: Vec<WirePart>,
}

#[derive(Debug, Deserialize)]
pub(super) struct WirePart {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(super) struct WireDenial {
    #[serde(rename = "toolName", alias = "tool_name")]
    tool_name: String,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    details: Value,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl WireDenial {
    fn into_denial(self) -> PermissionDenial {
        let details = match self.details {
            Value::Null if self.extra.is_empty() => Value::Null,
            Value::Null => Value::Object(self.extra),
            Value::Object(mut map) => {
                map.extend(self.extra);
                Value::Object(map)
            }
            other => other,
        };
        PermissionDenial {
            tool_name: self.tool_name,
            reason: self.reason,
            details,
        }
    }
}

impl WireEvent {
    pub(super) fn is_known_kind(kind: &str) -> bool {
        KNOWN_KINDS.contains(&kind)
    }

    pub(super) fn into_event(self, kind: String) -> Event {
        match self {
            WireEvent::SessionStart { session_id } => Event::SessionStart { session_id },
            WireEvent::TextDelta { text } => Event::TextDelta { text },
            WireEvent::ToolStart {
                tool_name,
                input,
                call_id,
            } => Event::ToolStart {
                tool_name,
                input: input
                    .filter(|v| !v.is_null())
                    .unwrap_or_else(|| Value::Object(Map::new())),
                call_id,
            },
            WireEvent::ToolEnd {
                tool_name,
                output,
                call_id,
            } => Event::ToolEnd {
                tool_name,
                output: output.and_then(value_to_text),
                call_id,
            },
            WireEvent::PermissionRequest {
                session_id,
                denials,
            } => Event::PermissionRequest {
                session_id,
                denials: denials.into_iter().map(WireDenial::into_denial).collect(),
            },
            WireEvent::Result {
                subtype,
                content,
                result,
            } => Event::Result {
                subtype: ResultSubtype::parse(&subtype),
                content: content.or(result),
            },
            WireEvent::Error { error } => Event::Error {
                error: value_to_text(error).unwrap_or_else(|| "unknown error".to_string()),
            },
            WireEvent::SessionEnd => Event::SessionEnd,
            WireEvent::Assistant { message, content } => {
                let parts = message.map(|m| m.content).or(content).unwrap_or_default();
                let text: String = parts
                    .into_iter()
                    .filter(|p| p.kind == "text")
                    .filter_map(|p| p.text)
                    .collect();
                if text.is_empty() {
                    Event::Unrecognized { kind }
                } else {
                    Event::TextDelta { text }
                }
            }
            WireEvent::System {
                subtype,
                session_id,
            } => match (subtype.as_deref(), session_id) {
                (Some("init"), Some(session_id)) => Event::SessionStart { session_id },
                _ => Event::Unrecognized { kind },
            },
        }
    }
}

/// Strings pass through; other JSON is rendered compactly; null is absent
fn value_to_text(value: Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s),
        Value::Object(ref map) => match map.get("message").and_then(Value::as_str) {
            Some(message) => Some(message.to_string()),
            None => Some(value.to_string()),
        },
        other => Some(other.to_string()),
    }
}
