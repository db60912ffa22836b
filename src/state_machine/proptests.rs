//! Property-based tests for the lifecycle state machine

use super::*;
use crate::protocol::{Event, ResultSubtype};
use proptest::prelude::*;
use serde_json::json;

// ============================================================================
// Arbitrary Generators
// ============================================================================

fn arb_state() -> impl Strategy<Value = LifecycleState> {
    prop_oneof![
        Just(LifecycleState::Idle),
        Just(LifecycleState::Starting),
        Just(LifecycleState::Streaming),
        Just(LifecycleState::Interrupted),
        Just(LifecycleState::Completed),
        Just(LifecycleState::Errored),
    ]
}

fn arb_session() -> impl Strategy<Value = Session> {
    (arb_state(), proptest::option::of("[a-z]{4}"), 0u64..4).prop_map(
        |(lifecycle, session_id, turn)| Session {
            lifecycle,
            session_id,
            turn,
        },
    )
}

fn arb_tool_name() -> impl Strategy<Value = String> {
    prop_oneof![Just("bash".to_string()), Just("grep".to_string())]
}

fn arb_event() -> impl Strategy<Value = Event> {
    prop_oneof![
        "[a-z]{4}".prop_map(|session_id| Event::SessionStart { session_id }),
        "[a-z ]{0,8}".prop_map(|text| Event::TextDelta { text }),
        arb_tool_name().prop_map(|tool_name| Event::ToolStart {
            tool_name,
            input: json!({}),
            call_id: None,
        }),
        arb_tool_name().prop_map(|tool_name| Event::ToolEnd {
            tool_name,
            output: None,
            call_id: None,
        }),
        "[a-z]{4}".prop_map(|session_id| Event::PermissionRequest {
            session_id,
            denials: vec![],
        }),
        proptest::option::of("[a-z]{1,8}").prop_map(|content| Event::Result {
            subtype: ResultSubtype::Success,
            content,
        }),
        "[a-z]{1,8}".prop_map(|error| Event::Error { error }),
        Just(Event::SessionEnd),
        "x_[a-z]{3}".prop_map(|kind| Event::Unrecognized { kind }),
    ]
}

fn arb_input() -> impl Strategy<Value = Input> {
    prop_oneof![
        3 => arb_event().prop_map(Input::Protocol),
        1 => "[a-z]{1,6}".prop_map(|content| Input::Send { content }),
        1 => Just(Input::Continue),
        1 => Just(Input::Interrupt),
        1 => (0u64..6, "[a-z]{4}").prop_map(|(turn, session_id)| Input::TransportAccepted {
            turn,
            session_id,
        }),
        1 => (0u64..6).prop_map(|turn| Input::TransportFailed {
            turn,
            message: "failed".to_string(),
        }),
    ]
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    /// Buffer writes only happen while streaming and keep the session streaming
    #[test]
    fn prop_buffer_effects_only_while_streaming(session in arb_session(), input in arb_input()) {
        if let Ok(result) = transition(&session, input) {
            if result.effects.iter().any(Effect::touches_buffers) {
                prop_assert_eq!(session.lifecycle, LifecycleState::Streaming);
                prop_assert_eq!(result.next.lifecycle, LifecycleState::Streaming);
            }
        }
    }

    /// Leaving an active turn always flushes the buffers
    #[test]
    fn prop_leaving_active_turn_finalizes(session in arb_session(), input in arb_input()) {
        if let Ok(result) = transition(&session, input) {
            if session.lifecycle.is_busy() && result.next.lifecycle.is_terminal() {
                prop_assert!(
                    result.effects.iter().any(|e| matches!(e, Effect::FinalizeTurn { .. })),
                    "no finalize: {:?} -> {:?}", session.lifecycle, result.next.lifecycle
                );
            }
        }
    }

    /// Ignored inputs and rejected commands leave the session untouched
    #[test]
    fn prop_ignored_is_a_noop(session in arb_session(), input in arb_input()) {
        if let Ok(result) = transition(&session, input) {
            if !result.is_applied() {
                prop_assert_eq!(&result.next, &session);
                prop_assert!(result.effects.is_empty());
            }
        }
    }

    /// A busy session never accepts another turn
    #[test]
    fn prop_busy_rejects_new_turns(
        lifecycle in prop_oneof![Just(LifecycleState::Starting), Just(LifecycleState::Streaming)],
        content in "[a-z]{1,6}",
    ) {
        let session = Session { lifecycle, session_id: Some("s".to_string()), turn: 1 };
        prop_assert_eq!(
            transition(&session, Input::Send { content }),
            Err(TransitionError::SessionBusy)
        );
        prop_assert_eq!(
            transition(&session, Input::Continue),
            Err(TransitionError::SessionBusy)
        );
    }

    /// Turn numbers never go backwards and grow only on a new turn
    #[test]
    fn prop_turn_is_monotonic(inputs in proptest::collection::vec(arb_input(), 0..40)) {
        let mut session = Session::new();
        for input in inputs {
            let Ok(result) = transition(&session, input) else { continue };
            if result.next.lifecycle == LifecycleState::Starting
                && session.lifecycle != LifecycleState::Starting
            {
                prop_assert_eq!(result.next.turn, session.turn + 1);
            } else {
                prop_assert_eq!(result.next.turn, session.turn);
            }
            session = result.next;
        }
    }

    /// Once a session id is known it is never lost
    #[test]
    fn prop_session_id_is_sticky(inputs in proptest::collection::vec(arb_input(), 0..40)) {
        let mut session = Session::new();
        for input in inputs {
            let Ok(result) = transition(&session, input) else { continue };
            if session.session_id.is_some() {
                prop_assert!(result.next.session_id.is_some());
            }
            session = result.next;
        }
    }
}
