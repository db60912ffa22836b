//! Assembles text deltas into the in-progress assistant message

use super::ToolCallLedger;
use crate::model::Message;

/// Text of the assistant message currently being streamed.
///
/// Deltas are concatenated in arrival order with no reordering or
/// deduplication; the transport guarantees per-session ordering.
#[derive(Debug, Default, Clone)]
pub struct MessageAccumulator {
    text: String,
}

impl MessageAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, delta: &str) {
        self.text.push_str(delta);
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Seed the buffer from restored or fallback content
    pub fn replace(&mut self, text: impl Into<String>) {
        self.text = text.into();
    }

    /// Snapshot the buffer and the ledger into an immutable assistant
    /// message, then clear both.
    ///
    /// Returns `None` when there is no text and no tool activity, so empty
    /// messages are never emitted.
    pub fn finalize(&mut self, ledger: &mut ToolCallLedger) -> Option<Message> {
        if self.text.is_empty() && ledger.is_empty() {
            return None;
        }
        let content = std::mem::take(&mut self.text);
        let tool_calls = ledger.close_turn();
        Some(Message::assistant(content, tool_calls))
    }

    pub fn clear(&mut self) {
        self.text.clear();
    }
}
