//! Property-based tests for the conversation store

use super::*;
use crate::model::{MessageRole, ToolStatus};
use crate::protocol::ResultSubtype;
use proptest::prelude::*;
use serde_json::json;

/// Something that can happen to a store
#[derive(Debug, Clone)]
enum Step {
    Send(String),
    Continue,
    Interrupt,
    Event(Event),
    TransportFailed,
}

fn arb_tool_name() -> impl Strategy<Value = String> {
    prop_oneof![Just("bash".to_string()), Just("grep".to_string()), Just("read".to_string())]
}

fn arb_event() -> impl Strategy<Value = Event> {
    prop_oneof![
        2 => Just(Event::SessionStart { session_id: "s1".to_string() }),
        6 => "[a-z ]{0,6}".prop_map(|text| Event::TextDelta { text }),
        3 => arb_tool_name().prop_map(|tool_name| Event::ToolStart {
            tool_name,
            input: json!({}),
            call_id: None,
        }),
        3 => arb_tool_name().prop_map(|tool_name| Event::ToolEnd {
            tool_name,
            output: Some("ok".to_string()),
            call_id: None,
        }),
        1 => Just(Event::Result { subtype: ResultSubtype::Success, content: None }),
        1 => Just(Event::Error { error: "boom".to_string() }),
        1 => Just(Event::SessionEnd),
        1 => Just(Event::PermissionRequest { session_id: "s1".to_string(), denials: vec![] }),
    ]
}

fn arb_step() -> impl Strategy<Value = Step> {
    prop_oneof![
        8 => arb_event().prop_map(Step::Event),
        1 => "[a-z]{1,5}".prop_map(Step::Send),
        1 => Just(Step::Continue),
        1 => Just(Step::Interrupt),
        1 => Just(Step::TransportFailed),
    ]
}

fn run(store: &mut ConversationStore, step: Step) {
    match step {
        Step::Send(content) => {
            let _ = store.send(content);
        }
        Step::Continue => {
            let _ = store.continue_session();
        }
        Step::Interrupt => {
            let _ = store.interrupt();
        }
        Step::Event(event) => {
            store.handle_event(event);
        }
        Step::TransportFailed => {
            let turn = store.session().turn;
            store.transport_failed(turn, "transport failed");
        }
    }
}

fn streaming_store() -> ConversationStore {
    let mut store = ConversationStore::default();
    store.send("q").unwrap();
    store.handle_event(Event::SessionStart {
        session_id: "s1".to_string(),
    });
    store
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(300))]

    /// Finalized content is the exact concatenation of the deltas
    #[test]
    fn prop_deltas_concatenate_in_order(deltas in proptest::collection::vec("[a-zA-Z ]{0,5}", 1..20)) {
        let mut store = streaming_store();
        for text in &deltas {
            store.handle_event(Event::TextDelta { text: text.clone() });
        }
        store.handle_event(Event::Result { subtype: ResultSubtype::Success, content: None });

        let expected: String = deltas.concat();
        if expected.is_empty() {
            prop_assert_eq!(store.messages().len(), 1);
        } else {
            let last = store.messages().last().unwrap();
            prop_assert_eq!(last.role, MessageRole::Assistant);
            prop_assert_eq!(&last.content, &expected);
        }
    }

    /// Interrupting mid-stream yields exactly one message with everything so far
    #[test]
    fn prop_interrupt_loses_nothing(deltas in proptest::collection::vec("[a-z]{1,5}", 1..10)) {
        let mut store = streaming_store();
        for text in &deltas {
            store.handle_event(Event::TextDelta { text: text.clone() });
        }
        let before = store.messages().len();
        store.interrupt().unwrap();

        prop_assert_eq!(store.messages().len(), before + 1);
        prop_assert_eq!(&store.messages().last().unwrap().content, &deltas.concat());
    }

    /// No finalized message ever carries a non-terminal tool call, and the
    /// live buffers are empty whenever no turn is active
    #[test]
    fn prop_terminal_states_leave_no_running_tools(steps in proptest::collection::vec(arb_step(), 0..60)) {
        let mut store = ConversationStore::default();
        for step in steps {
            run(&mut store, step);

            for message in store.messages() {
                for call in &message.tool_calls {
                    prop_assert!(call.status.is_terminal(), "{:?}", call);
                    prop_assert!(call.status != ToolStatus::Pending);
                }
            }
            if store.lifecycle() != LifecycleState::Streaming {
                prop_assert!(store.partial_text().is_empty());
                prop_assert!(store.turn_tools().is_empty());
            }
        }
    }

    /// Tool statuses only ever move forward across any event sequence
    #[test]
    fn prop_tool_status_is_monotonic(steps in proptest::collection::vec(arb_step(), 0..60)) {
        let mut store = ConversationStore::default();
        let mut seen: std::collections::HashMap<String, ToolStatus> = std::collections::HashMap::new();
        for step in steps {
            run(&mut store, step);
            let live = store.turn_tools().iter();
            let finalized = store.messages().iter().flat_map(|m| m.tool_calls.iter());
            for call in live.chain(finalized) {
                if let Some(previous) = seen.insert(call.id.clone(), call.status) {
                    prop_assert!(
                        previous == call.status || previous.can_advance_to(call.status),
                        "{} went {} -> {}", call.id, previous, call.status
                    );
                }
            }
        }
    }

    /// Send while a turn is active fails and changes nothing
    #[test]
    fn prop_single_in_flight_turn(steps in proptest::collection::vec(arb_step(), 0..30), content in "[a-z]{1,5}") {
        let mut store = ConversationStore::default();
        for step in steps {
            run(&mut store, step);
        }
        if store.is_streaming() {
            let before = store.view();
            prop_assert_eq!(
                store.send(content),
                Err(StoreError::Transition(TransitionError::SessionBusy))
            );
            prop_assert_eq!(store.view(), before);
        }
    }

    /// Restoring the same snapshot twice equals restoring it once
    #[test]
    fn prop_restore_is_idempotent(steps in proptest::collection::vec(arb_step(), 0..30)) {
        let mut source = ConversationStore::default();
        for step in steps {
            run(&mut source, step);
        }
        let snapshot = source.snapshot();

        let mut once = ConversationStore::default();
        once.restore(snapshot.clone()).unwrap();
        let after_once = once.view();

        prop_assert_eq!(once.restore(snapshot).unwrap(), RestoreOutcome::AlreadyRestored);
        prop_assert_eq!(once.view(), after_once);
    }
}
