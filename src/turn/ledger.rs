//! Tool-call ledger for the active turn

use crate::model::{ToolCall, ToolStatus};
use serde_json::Value;
use thiserror::Error;

/// Failure reason stamped on calls still running when their turn ends
pub const TURN_ENDED_REASON: &str = "turn ended while tool was running";

/// A `tool_end` with no running call to close
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("tool_end for `{tool_name}` has no matching running call")]
pub struct UnmatchedToolEnd {
    pub tool_name: String,
    pub call_id: Option<String>,
}

/// Tool invocations of the current turn, in start order.
///
/// Ends are correlated by call id when the assistant provides one this
/// ledger has seen, and otherwise by tool name against the oldest
/// call of that name still running, so concurrent same-named calls close
/// first-in first-out.
#[derive(Debug, Default, Clone)]
pub struct ToolCallLedger {
    calls: Vec<ToolCall>,
}

impl ToolCallLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new `running` call
    pub fn on_start(&mut self, name: &str, input: Value, call_id: Option<String>) -> &ToolCall {
        let mut call = ToolCall::pending(name, input);
        if let Some(id) = call_id {
            call.id = id;
        }
        // pending -> running is always legal for a fresh record
        let _ = call.start();
        tracing::debug!(tool = %call.name, id = %call.id, "Tool started");
        self.calls.push(call);
        &self.calls[self.calls.len() - 1]
    }

    /// Complete the matching running call
    pub fn on_end(
        &mut self,
        name: &str,
        output: Option<String>,
        call_id: Option<&str>,
    ) -> Result<&ToolCall, UnmatchedToolEnd> {
        // An id this ledger never saw came with an untagged start, so that
        // end still closes by name
        let known_id = call_id.filter(|id| self.calls.iter().any(|c| c.id == *id));
        let found = self
            .calls
            .iter_mut()
            .filter(|c| c.status == ToolStatus::Running)
            .find(|c| match known_id {
                Some(id) => c.id == id,
                None => c.name == name,
            });

        let Some(call) = found else {
            return Err(UnmatchedToolEnd {
                tool_name: name.to_string(),
                call_id: call_id.map(str::to_string),
            });
        };

        // Only running calls are selected, so completing cannot regress
        let _ = call.complete(output);
        tracing::debug!(tool = %call.name, id = %call.id, "Tool completed");
        Ok(&*call)
    }

    /// All calls of the turn, open and closed
    pub fn calls(&self) -> &[ToolCall] {
        &self.calls
    }

    pub fn open_calls(&self) -> impl Iterator<Item = &ToolCall> {
        self.calls
            .iter()
            .filter(|c| !c.status.is_terminal())
    }

    pub fn has_open_calls(&self) -> bool {
        self.open_calls().next().is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Close out the turn: fail anything still open and hand over every
    /// call, leaving the ledger empty.
    pub fn close_turn(&mut self) -> Vec<ToolCall> {
        for call in &mut self.calls {
            if call.status.is_terminal() {
                continue;
            }
            if call.status == ToolStatus::Pending {
                let _ = call.start();
            }
            tracing::warn!(tool = %call.name, id = %call.id, "Tool still running at end of turn");
            let _ = call.fail(TURN_ENDED_REASON);
        }
        std::mem::take(&mut self.calls)
    }

    pub fn reset(&mut self) {
        self.calls.clear();
    }
}
