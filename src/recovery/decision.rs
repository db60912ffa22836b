//! How a restored conversation should resume

use super::RecoverySnapshot;
use crate::model::MessageRole;
use crate::state_machine::Session;

/// Result of analyzing a snapshot before restoring it
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryDecision {
    /// Session state to restore with
    pub session: Session,
    /// Whether the user should be offered `continue`
    pub suggest_continue: bool,
    /// Reason for the decision (for logging)
    pub reason: RecoveryReason,
}

/// Why we made a particular recovery decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryReason {
    /// No messages and no partial text
    EmptySnapshot,
    /// The assistant never assigned a session id
    NoSession,
    /// Last turn ended with an assistant message
    TurnFinished,
    /// Saved while the assistant was still answering
    InterruptedMidTurn,
}

/// Decide what lifecycle a snapshot restores into.
///
/// Without a session id there is nothing to resume, so the conversation is
/// `idle`. With one it is `completed`, and `continue` is suggested when the
/// snapshot was taken mid-turn: partial text was streaming, or the last
/// message is still the user's.
pub fn analyze(snapshot: &RecoverySnapshot) -> RecoveryDecision {
    let session = Session::restored(snapshot.session_id.clone());

    if snapshot.messages.is_empty() && snapshot.current_partial_text.is_empty() {
        return RecoveryDecision {
            session,
            suggest_continue: false,
            reason: RecoveryReason::EmptySnapshot,
        };
    }

    if snapshot.session_id.is_none() {
        return RecoveryDecision {
            session,
            suggest_continue: false,
            reason: RecoveryReason::NoSession,
        };
    }

    let last_is_user = snapshot
        .messages
        .last()
        .is_some_and(|m| m.role == MessageRole::User);

    if !snapshot.current_partial_text.is_empty() || last_is_user {
        return RecoveryDecision {
            session,
            suggest_continue: true,
            reason: RecoveryReason::InterruptedMidTurn,
        };
    }

    RecoveryDecision {
        session,
        suggest_continue: false,
        reason: RecoveryReason::TurnFinished,
    }
}
