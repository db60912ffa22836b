//! Conversation state store
//!
//! Single owner of everything the renderer sees: finalized messages, the
//! in-progress turn buffers, the sticky error and the pending permission
//! request. Every mutation goes through the lifecycle state machine first;
//! its effects are then applied here in order. Nothing in this module does
//! I/O; transport work comes back out as [`TransportCommand`]s.

#[cfg(test)]
mod proptests;

use crate::model::{Message, PermissionRequest, ToolCall};
use crate::protocol::Event;
use crate::recovery::{analyze, RecoverySnapshot, RestoreOutcome};
use crate::state_machine::{
    transition, Disposition, Effect, IgnoreReason, Input, LifecycleState, Session,
    TransitionError,
};
use crate::transport::TransportCommand;
use crate::turn::{MessageAccumulator, ToolCallLedger};
use chrono::Utc;
use serde::Serialize;
use thiserror::Error;

/// Default number of messages kept in the live list
pub const DEFAULT_ARCHIVE_THRESHOLD: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("message is empty")]
    EmptyMessage,
    #[error("cannot {0} while a turn is in progress")]
    TurnActive(&'static str),
}

/// Read model published to the renderer
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationView {
    pub messages: Vec<Message>,
    pub archived_count: usize,
    pub is_streaming: bool,
    pub lifecycle: LifecycleState,
    pub partial_text: String,
    /// Tool calls of the active turn, open and closed
    pub turn_tools: Vec<ToolCall>,
    pub error: Option<String>,
    pub pending_permission: Option<PermissionRequest>,
    pub session_id: Option<String>,
}

/// The conversation and its active turn
#[derive(Debug)]
pub struct ConversationStore {
    session: Session,
    messages: Vec<Message>,
    archive: Vec<Message>,
    accumulator: MessageAccumulator,
    ledger: ToolCallLedger,
    error: Option<String>,
    pending_permission: Option<PermissionRequest>,
    archive_threshold: usize,
    restored: bool,
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new(DEFAULT_ARCHIVE_THRESHOLD)
    }
}

impl ConversationStore {
    pub fn new(archive_threshold: usize) -> Self {
        Self {
            session: Session::new(),
            messages: Vec::new(),
            archive: Vec::new(),
            accumulator: MessageAccumulator::new(),
            ledger: ToolCallLedger::new(),
            error: None,
            pending_permission: None,
            archive_threshold: archive_threshold.max(1),
            restored: false,
        }
    }

    // ==================== Commands ====================

    /// Start a new turn with user content.
    ///
    /// The user message is appended before the transport is involved. The
    /// returned command must be handed to the transport.
    pub fn send(&mut self, content: impl Into<String>) -> Result<Vec<TransportCommand>, StoreError> {
        let content = content.into();
        if content.trim().is_empty() {
            return Err(StoreError::EmptyMessage);
        }
        tracing::info!(chars = content.len(), "Send");
        self.command(Input::Send { content })
    }

    /// Resume the current session without new user content
    pub fn continue_session(&mut self) -> Result<Vec<TransportCommand>, StoreError> {
        tracing::info!(session_id = ?self.session.session_id, "Continue");
        self.command(Input::Continue)
    }

    /// Cancel the streaming turn, keeping whatever arrived so far
    pub fn interrupt(&mut self) -> Result<Vec<TransportCommand>, StoreError> {
        tracing::info!(session_id = ?self.session.session_id, "Interrupt");
        self.command(Input::Interrupt)
    }

    fn command(&mut self, input: Input) -> Result<Vec<TransportCommand>, StoreError> {
        let name = input.name().to_string();
        let result = transition(&self.session, input).inspect_err(|e| {
            tracing::warn!(command = %name, lifecycle = %self.session.lifecycle, error = %e, "Command rejected");
        })?;
        let (_, outbound) = self.commit(&name, result.next, result.effects, &result.disposition);
        Ok(outbound)
    }

    // ==================== Inbound ====================

    /// Apply one decoded protocol event. Invoked once per event in arrival
    /// order; never fails.
    pub fn handle_event(&mut self, event: Event) -> Disposition {
        if let Event::Result { subtype, .. } = &event {
            if subtype.is_error() {
                tracing::warn!(subtype = ?subtype, "Assistant reported an unsuccessful result");
            }
        }
        self.feed(Input::Protocol(event))
    }

    /// The transport began the turn and reported its session id
    pub fn transport_accepted(&mut self, turn: u64, session_id: impl Into<String>) -> Disposition {
        self.feed(Input::TransportAccepted {
            turn,
            session_id: session_id.into(),
        })
    }

    /// A transport call for `turn` failed
    pub fn transport_failed(&mut self, turn: u64, message: impl Into<String>) -> Disposition {
        self.feed(Input::TransportFailed {
            turn,
            message: message.into(),
        })
    }

    fn feed(&mut self, input: Input) -> Disposition {
        let name = input.name().to_string();
        match transition(&self.session, input) {
            Ok(result) => {
                let (disposition, outbound) =
                    self.commit(&name, result.next, result.effects, &result.disposition);
                debug_assert!(outbound.is_empty(), "inbound input produced transport work");
                disposition
            }
            Err(e) => {
                // Only commands can be rejected
                tracing::error!(input = %name, error = %e, "Inbound input rejected");
                Disposition::Ignored(IgnoreReason::NotLegalInState {
                    event: name,
                    state: self.session.lifecycle,
                })
            }
        }
    }

    fn commit(
        &mut self,
        input: &str,
        next: Session,
        effects: Vec<Effect>,
        disposition: &Disposition,
    ) -> (Disposition, Vec<TransportCommand>) {
        if let Disposition::Ignored(reason) = disposition {
            match reason {
                IgnoreReason::Unrecognized { .. } => {
                    tracing::debug!(%reason, "Ignoring event");
                }
                _ => tracing::warn!(%reason, lifecycle = %self.session.lifecycle, "Ignoring input"),
            }
            return (disposition.clone(), Vec::new());
        }

        if next.lifecycle != self.session.lifecycle {
            tracing::debug!(
                input,
                from = %self.session.lifecycle,
                to = %next.lifecycle,
                turn = next.turn,
                "Lifecycle transition"
            );
        }
        self.session = next;

        let mut outbound = Vec::new();
        for effect in effects {
            if let Some(command) = self.apply_effect(effect) {
                outbound.push(command);
            }
        }
        (Disposition::Applied, outbound)
    }

    fn apply_effect(&mut self, effect: Effect) -> Option<TransportCommand> {
        match effect {
            Effect::ResetTurn => {
                self.accumulator.clear();
                self.ledger.reset();
                self.pending_permission = None;
            }
            Effect::AppendUserMessage { content } => {
                self.push_message(Message::user(content));
            }
            Effect::AppendText { text } => {
                self.accumulator.append(&text);
            }
            Effect::OpenTool {
                name,
                input,
                call_id,
            } => {
                self.ledger.on_start(&name, input, call_id);
            }
            Effect::CloseTool {
                name,
                output,
                call_id,
            } => {
                if let Err(e) = self.ledger.on_end(&name, output, call_id.as_deref()) {
                    tracing::warn!(tool = %e.tool_name, call_id = ?e.call_id, "Unmatched tool_end ignored");
                }
            }
            Effect::FinalizeTurn { fallback_text } => {
                if self.accumulator.is_empty() {
                    if let Some(text) = fallback_text.filter(|t| !t.is_empty()) {
                        self.accumulator.replace(text);
                    }
                }
                if let Some(message) = self.accumulator.finalize(&mut self.ledger) {
                    tracing::debug!(
                        id = %message.id,
                        chars = message.content.len(),
                        tools = message.tool_calls.len(),
                        "Finalized assistant message"
                    );
                    self.push_message(message);
                }
            }
            Effect::RaisePermission {
                session_id,
                denials,
            } => {
                if let Some(pending) = &self.pending_permission {
                    tracing::warn!(
                        pending = %pending.id,
                        session_id = %session_id,
                        "Permission request while one is pending, ignored"
                    );
                } else {
                    tracing::info!(session_id = %session_id, denials = denials.len(), "Permission requested");
                    self.pending_permission = Some(PermissionRequest::new(session_id, denials));
                }
            }
            Effect::RaiseError { message } => {
                tracing::warn!(error = %message, "Conversation error");
                self.error = Some(message);
            }
            Effect::Transport(command) => return Some(command),
        }
        None
    }

    fn push_message(&mut self, message: Message) {
        self.messages.push(message);
        self.rebalance_archive();
    }

    /// Move the oldest messages out of the live list so it holds exactly
    /// `archive_threshold` entries
    fn rebalance_archive(&mut self) {
        if self.messages.len() <= self.archive_threshold {
            return;
        }
        let overflow = self.messages.len() - self.archive_threshold;
        self.archive.extend(self.messages.drain(..overflow));
        tracing::debug!(archived = overflow, total_archived = self.archive.len(), "Archived messages");
    }

    // ==================== User actions ====================

    pub fn clear_error(&mut self) {
        self.error = None;
    }

    /// The user answered the pending permission request
    pub fn resolve_permission(&mut self) -> Option<PermissionRequest> {
        self.pending_permission.take()
    }

    /// Start over with an empty conversation
    pub fn clear_messages(&mut self) -> Result<(), StoreError> {
        if self.session.lifecycle.is_busy() {
            return Err(StoreError::TurnActive("clear messages"));
        }
        self.messages.clear();
        self.archive.clear();
        self.accumulator.clear();
        self.ledger.reset();
        self.pending_permission = None;
        self.session = Session {
            turn: self.session.turn,
            ..Session::new()
        };
        tracing::info!("Conversation cleared");
        Ok(())
    }

    // ==================== Queries ====================

    /// Live (non-archived) messages, oldest first
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn archived_messages(&self) -> &[Message] {
        &self.archive
    }

    pub fn is_streaming(&self) -> bool {
        self.session.lifecycle.is_busy()
    }

    pub fn lifecycle(&self) -> LifecycleState {
        self.session.lifecycle
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session.session_id.as_deref()
    }

    pub fn partial_text(&self) -> &str {
        self.accumulator.text()
    }

    pub fn turn_tools(&self) -> &[ToolCall] {
        self.ledger.calls()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn pending_permission(&self) -> Option<&PermissionRequest> {
        self.pending_permission.as_ref()
    }

    pub fn was_restored(&self) -> bool {
        self.restored
    }

    pub fn view(&self) -> ConversationView {
        ConversationView {
            messages: self.messages.clone(),
            archived_count: self.archive.len(),
            is_streaming: self.is_streaming(),
            lifecycle: self.session.lifecycle,
            partial_text: self.accumulator.text().to_string(),
            turn_tools: self.ledger.calls().to_vec(),
            error: self.error.clone(),
            pending_permission: self.pending_permission.clone(),
            session_id: self.session.session_id.clone(),
        }
    }

    // ==================== Recovery ====================

    /// Everything needed to rebuild the conversation after a crash
    pub fn snapshot(&self) -> RecoverySnapshot {
        let mut messages = Vec::with_capacity(self.archive.len() + self.messages.len());
        messages.extend(self.archive.iter().cloned());
        messages.extend(self.messages.iter().cloned());
        RecoverySnapshot {
            messages,
            current_partial_text: self.accumulator.text().to_string(),
            session_id: self.session.session_id.clone(),
            saved_at: Utc::now(),
        }
    }

    /// Replace all state with a snapshot. One-shot: once a restore has
    /// succeeded, later calls change nothing.
    pub fn restore(&mut self, snapshot: RecoverySnapshot) -> Result<RestoreOutcome, StoreError> {
        if self.restored {
            return Ok(RestoreOutcome::AlreadyRestored);
        }
        if self.session.lifecycle.is_busy() {
            return Err(StoreError::TurnActive("restore"));
        }

        let decision = analyze(&snapshot);
        tracing::info!(
            reason = ?decision.reason,
            lifecycle = %decision.session.lifecycle,
            messages = snapshot.messages.len(),
            "Restoring conversation"
        );

        self.messages = snapshot.messages;
        self.archive.clear();
        self.accumulator.clear();
        self.ledger.reset();
        self.error = None;
        self.pending_permission = None;
        // Turn numbers keep counting so outcomes of earlier turns stay stale
        self.session = Session {
            turn: self.session.turn,
            ..decision.session
        };

        // Partial text is only meaningful while streaming, so keep it as
        // a finished message
        if !snapshot.current_partial_text.is_empty() {
            self.messages
                .push(Message::assistant(snapshot.current_partial_text, Vec::new()));
        }
        self.rebalance_archive();
        self.restored = true;

        Ok(RestoreOutcome::Restored {
            messages: self.archive.len() + self.messages.len(),
        })
    }
}
