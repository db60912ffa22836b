//! Pure lifecycle transition function

use super::{Effect, Input, LifecycleState, Session};
use crate::protocol::Event;
use crate::transport::TransportCommand;
use std::fmt;
use thiserror::Error;

/// Result of a lifecycle transition
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub next: Session,
    pub effects: Vec<Effect>,
    pub disposition: Disposition,
}

impl Transition {
    pub fn applied(next: Session) -> Self {
        Self {
            next,
            effects: vec![],
            disposition: Disposition::Applied,
        }
    }

    /// Leave the session untouched
    pub fn ignored(current: &Session, reason: IgnoreReason) -> Self {
        Self {
            next: current.clone(),
            effects: vec![],
            disposition: Disposition::Ignored(reason),
        }
    }

    pub fn with_effect(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }

    pub fn with_effects(mut self, effects: impl IntoIterator<Item = Effect>) -> Self {
        self.effects.extend(effects);
        self
    }

    pub fn is_applied(&self) -> bool {
        self.disposition == Disposition::Applied
    }
}

/// Whether an input changed anything
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Applied,
    Ignored(IgnoreReason),
}

/// Why an input was dropped without effect
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Event kind this client doesn't know
    Unrecognized { kind: String },
    /// Known event, wrong moment
    NotLegalInState {
        event: String,
        state: LifecycleState,
    },
    /// A second `session_start` while already streaming
    DuplicateSessionStart { session_id: String },
    /// Outcome of a transport call for a turn that is no longer current
    StaleTransportOutcome { turn: u64 },
}

impl fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IgnoreReason::Unrecognized { kind } => write!(f, "unrecognized event kind `{kind}`"),
            IgnoreReason::NotLegalInState { event, state } => {
                write!(f, "`{event}` not legal while {state}")
            }
            IgnoreReason::DuplicateSessionStart { session_id } => {
                write!(f, "duplicate session_start for {session_id}")
            }
            IgnoreReason::StaleTransportOutcome { turn } => {
                write!(f, "transport outcome for stale turn {turn}")
            }
        }
    }
}

/// Commands the lifecycle refuses outright
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("a turn is already in progress")]
    SessionBusy,
    #[error("no session to continue")]
    NoActiveSession,
    #[error("nothing is streaming")]
    NotStreaming,
}

/// Pure transition function.
///
/// Given the same session and input it always returns the same result.
/// Commands that are not allowed return an error; protocol events that
/// don't fit the current state are reported as [`Disposition::Ignored`].
pub fn transition(session: &Session, input: Input) -> Result<Transition, TransitionError> {
    use LifecycleState as L;

    match (session.lifecycle, input) {
        // ------------------------------------------------------------
        // User commands
        // ------------------------------------------------------------
        (L::Starting | L::Streaming, Input::Send { .. } | Input::Continue) => {
            Err(TransitionError::SessionBusy)
        }

        (_, Input::Send { content }) => {
            let next = session.begin_turn();
            let start = TransportCommand::Start {
                turn: next.turn,
                content: content.clone(),
                resume: session.session_id.clone(),
            };
            Ok(Transition::applied(next).with_effects([
                Effect::ResetTurn,
                Effect::AppendUserMessage { content },
                Effect::Transport(start),
            ]))
        }

        (_, Input::Continue) => {
            let Some(session_id) = session.session_id.clone() else {
                return Err(TransitionError::NoActiveSession);
            };
            let next = session.begin_turn();
            let cont = TransportCommand::Continue {
                turn: next.turn,
                session_id,
            };
            Ok(Transition::applied(next)
                .with_effects([Effect::ResetTurn, Effect::Transport(cont)]))
        }

        (L::Streaming, Input::Interrupt) => {
            let mut result = Transition::applied(session.with_lifecycle(L::Interrupted))
                .with_effect(Effect::finalize());
            if let Some(session_id) = &session.session_id {
                result = result.with_effect(Effect::Transport(TransportCommand::Interrupt {
                    turn: session.turn,
                    session_id: session_id.clone(),
                }));
            }
            Ok(result)
        }

        (_, Input::Interrupt) => Err(TransitionError::NotStreaming),

        // ------------------------------------------------------------
        // Transport outcomes
        // ------------------------------------------------------------
        (_, Input::TransportAccepted { turn, .. } | Input::TransportFailed { turn, .. })
            if turn != session.turn =>
        {
            Ok(Transition::ignored(
                session,
                IgnoreReason::StaleTransportOutcome { turn },
            ))
        }

        (L::Starting, Input::TransportAccepted { session_id, .. }) => {
            let mut next = session.clone();
            next.session_id = Some(session_id);
            Ok(Transition::applied(next))
        }

        // The stream already identified the session
        (_, Input::TransportAccepted { .. }) => Ok(Transition::applied(session.clone())),

        (L::Starting | L::Streaming, Input::TransportFailed { message, .. }) => {
            Ok(Transition::applied(session.with_lifecycle(L::Errored))
                .with_effects([Effect::finalize(), Effect::raise_error(message)]))
        }

        // Late failure (e.g. an interrupt that could not reach the process):
        // the turn is already over, so only surface the error
        (_, Input::TransportFailed { message, .. }) => {
            Ok(Transition::applied(session.clone()).with_effect(Effect::raise_error(message)))
        }

        // ------------------------------------------------------------
        // Assistant stream
        // ------------------------------------------------------------
        (_, Input::Protocol(Event::Unrecognized { kind })) => {
            Ok(Transition::ignored(session, IgnoreReason::Unrecognized { kind }))
        }

        (L::Starting, Input::Protocol(Event::SessionStart { session_id })) => {
            let next = Session {
                lifecycle: L::Streaming,
                session_id: Some(session_id),
                turn: session.turn,
            };
            Ok(Transition::applied(next))
        }

        (L::Streaming, Input::Protocol(Event::SessionStart { session_id })) => Ok(
            Transition::ignored(session, IgnoreReason::DuplicateSessionStart { session_id }),
        ),

        (L::Streaming, Input::Protocol(Event::TextDelta { text })) => {
            Ok(Transition::applied(session.clone()).with_effect(Effect::AppendText { text }))
        }

        (
            L::Streaming,
            Input::Protocol(Event::ToolStart {
                tool_name,
                input,
                call_id,
            }),
        ) => Ok(Transition::applied(session.clone()).with_effect(Effect::OpenTool {
            name: tool_name,
            input,
            call_id,
        })),

        (
            L::Streaming,
            Input::Protocol(Event::ToolEnd {
                tool_name,
                output,
                call_id,
            }),
        ) => Ok(Transition::applied(session.clone()).with_effect(Effect::CloseTool {
            name: tool_name,
            output,
            call_id,
        })),

        (L::Streaming, Input::Protocol(Event::Result { content, .. })) => Ok(
            Transition::applied(session.with_lifecycle(L::Completed)).with_effect(
                Effect::FinalizeTurn {
                    fallback_text: content,
                },
            ),
        ),

        (L::Streaming, Input::Protocol(Event::SessionEnd)) => Ok(Transition::applied(
            session.with_lifecycle(L::Completed),
        )
        .with_effect(Effect::finalize())),

        (
            L::Starting | L::Streaming,
            Input::Protocol(Event::PermissionRequest {
                session_id,
                denials,
            }),
        ) => Ok(
            Transition::applied(session.clone()).with_effect(Effect::RaisePermission {
                session_id,
                denials,
            }),
        ),

        (state @ (L::Idle | L::Starting | L::Streaming), Input::Protocol(Event::Error { error })) => {
            let mut result = Transition::applied(session.with_lifecycle(L::Errored));
            if state.is_busy() {
                result = result.with_effect(Effect::finalize());
            }
            Ok(result.with_effect(Effect::raise_error(error)))
        }

        (state, Input::Protocol(event)) => Ok(Transition::ignored(
            session,
            IgnoreReason::NotLegalInState {
                event: event.kind().to_string(),
                state,
            },
        )),
    }
}
