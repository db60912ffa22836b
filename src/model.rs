//! Conversation record types
//!
//! Finalized messages, tool-call records and permission requests. These are
//! the values the store publishes to the renderer and writes into recovery
//! snapshots, so their serde shape is the persisted shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Author of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

/// Tool invocation status. Only forward edges are legal:
/// `pending -> running -> completed | failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ToolStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ToolStatus::Completed | ToolStatus::Failed)
    }

    /// Whether `self -> next` is one of the three legal edges
    pub fn can_advance_to(self, next: ToolStatus) -> bool {
        matches!(
            (self, next),
            (ToolStatus::Pending, ToolStatus::Running)
                | (ToolStatus::Running, ToolStatus::Completed | ToolStatus::Failed)
        )
    }
}

impl fmt::Display for ToolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ToolStatus::Pending => "pending",
            ToolStatus::Running => "running",
            ToolStatus::Completed => "completed",
            ToolStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Attempted a status edge that would regress or skip
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal tool status transition {from} -> {to}")]
pub struct IllegalToolTransition {
    pub from: ToolStatus,
    pub to: ToolStatus,
}

/// One tool invocation within a turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub status: ToolStatus,
    #[serde(default)]
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// Why the call failed, when `status` is `failed`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ToolCall {
    /// A fresh `pending` record
    pub fn pending(name: impl Into<String>, input: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            status: ToolStatus::Pending,
            input,
            output: None,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    fn advance(&mut self, next: ToolStatus) -> Result<(), IllegalToolTransition> {
        if !self.status.can_advance_to(next) {
            return Err(IllegalToolTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    pub fn start(&mut self) -> Result<(), IllegalToolTransition> {
        self.advance(ToolStatus::Running)?;
        self.started_at = Utc::now();
        Ok(())
    }

    pub fn complete(&mut self, output: Option<String>) -> Result<(), IllegalToolTransition> {
        self.advance(ToolStatus::Completed)?;
        self.output = output;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), IllegalToolTransition> {
        self.advance(ToolStatus::Failed)?;
        self.error = Some(reason.into());
        self.completed_at = Some(Utc::now());
        Ok(())
    }
}

/// Compact description of a message's tool activity for list rendering
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSummary {
    pub count: usize,
    pub names: Vec<String>,
}

impl ToolSummary {
    fn from_calls(calls: &[ToolCall]) -> Option<Self> {
        if calls.is_empty() {
            return None;
        }
        let mut names: Vec<String> = Vec::new();
        for call in calls {
            if !names.contains(&call.name) {
                names.push(call.name.clone());
            }
        }
        Some(Self {
            count: calls.len(),
            names,
        })
    }
}

/// A finalized conversation turn. Never mutated once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_summary: Option<ToolSummary>,
}

impl Message {
    fn new(role: MessageRole, content: String, tool_calls: Vec<ToolCall>) -> Self {
        let tool_summary = ToolSummary::from_calls(&tool_calls);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            content,
            timestamp: Utc::now(),
            tool_calls,
            tool_summary,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content.into(), Vec::new())
    }

    /// Assistant message; every attached tool call must already be terminal
    pub fn assistant(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        debug_assert!(tool_calls.iter().all(|c| c.status.is_terminal()));
        Self::new(MessageRole::Assistant, content.into(), tool_calls)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content.into(), Vec::new())
    }
}

/// One tool use the assistant was not allowed to perform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionDenial {
    pub tool_name: String,
    pub reason: String,
    #[serde(default)]
    pub details: Value,
}

/// Pending request for user approval. At most one per session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRequest {
    pub id: String,
    pub session_id: String,
    pub denials: Vec<PermissionDenial>,
    pub created_at: DateTime<Utc>,
}

impl PermissionRequest {
    pub fn new(session_id: impl Into<String>, denials: Vec<PermissionDenial>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            denials,
            created_at: Utc::now(),
        }
    }
}
