//! Conversation runtime loop

use super::watchdog::{Heartbeat, CHECK_INTERVAL};
use super::{ChatHandle, Command, StoreUpdate, UPDATE_CAPACITY};
use crate::protocol::{DecodeError, Event, LineDecoder};
use crate::recovery::{CrashSignal, RecoveryBridge, RecoveryError, RecoverySnapshot, SnapshotStore};
use crate::state_machine::Disposition;
use crate::store::ConversationStore;
use crate::transport::{Inbound, InboundBody, Transport, TransportCommand, TransportError};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Result of a background transport call
#[derive(Debug)]
enum TransportOutcome {
    Accepted { turn: u64, session_id: String },
    Failed { turn: u64, message: String },
    Interrupted { turn: u64 },
}

/// Single consumer of everything that can change the conversation
pub struct ChatRuntime<T, S>
where
    T: Transport + 'static,
    S: SnapshotStore + 'static,
{
    store: ConversationStore,
    transport: Arc<T>,
    recovery: RecoveryBridge<S>,
    commands: mpsc::Receiver<Command>,
    inbound: mpsc::Receiver<Inbound>,
    outcome_tx: mpsc::Sender<TransportOutcome>,
    outcome_rx: mpsc::Receiver<TransportOutcome>,
    updates: broadcast::Sender<StoreUpdate>,
    snapshots: watch::Sender<RecoverySnapshot>,
    decoder: LineDecoder,
    /// Turn whose output the decoder is buffering
    decoder_turn: u64,
    heartbeat: Option<Heartbeat>,
    cancel: CancellationToken,
}

impl<T, S> ChatRuntime<T, S>
where
    T: Transport + 'static,
    S: SnapshotStore + 'static,
{
    pub fn new(
        store: ConversationStore,
        transport: T,
        recovery: RecoveryBridge<S>,
        inbound: mpsc::Receiver<Inbound>,
    ) -> (Self, ChatHandle) {
        let (command_tx, commands) = mpsc::channel(32);
        let (outcome_tx, outcome_rx) = mpsc::channel(32);
        let (updates, _) = broadcast::channel(UPDATE_CAPACITY);
        let (snapshots, snapshot_rx) = watch::channel(store.snapshot());
        let cancel = CancellationToken::new();

        let handle = ChatHandle {
            commands: command_tx,
            updates: updates.clone(),
            snapshots: snapshot_rx,
            cancel: cancel.clone(),
        };
        let runtime = Self {
            store,
            transport: Arc::new(transport),
            recovery,
            commands,
            inbound,
            outcome_tx,
            outcome_rx,
            updates,
            snapshots,
            decoder: LineDecoder::new(),
            decoder_turn: 0,
            heartbeat: None,
            cancel,
        };
        (runtime, handle)
    }

    /// Beat this heartbeat while the loop is responsive
    pub fn with_heartbeat(mut self, heartbeat: Heartbeat) -> Self {
        self.heartbeat = Some(heartbeat);
        self
    }

    pub async fn run(mut self) {
        tracing::info!(
            lifecycle = %self.store.lifecycle(),
            messages = self.store.messages().len(),
            "Starting conversation runtime"
        );
        let mut ticker = tokio::time::interval(CHECK_INTERVAL);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Some(heartbeat) = &self.heartbeat {
                        heartbeat.beat();
                    }
                }
                Some(command) = self.commands.recv() => {
                    self.process_command(command).await;
                }
                Some(inbound) = self.inbound.recv() => {
                    self.process_inbound(inbound);
                }
                Some(outcome) = self.outcome_rx.recv() => {
                    self.process_outcome(outcome);
                }
            }
        }

        tracing::info!("Conversation runtime stopped");
    }

    async fn process_command(&mut self, command: Command) {
        match command {
            Command::Send { content, reply } => {
                let result = self.store.send(content).map(|outbound| self.dispatch(outbound));
                if result.is_ok() {
                    self.publish_view();
                }
                let _ = reply.send(result);
            }
            Command::Continue { reply } => {
                let result = self
                    .store
                    .continue_session()
                    .map(|outbound| self.dispatch(outbound));
                if result.is_ok() {
                    self.publish_view();
                }
                let _ = reply.send(result);
            }
            Command::Interrupt { reply } => {
                let result = self.store.interrupt().map(|outbound| self.dispatch(outbound));
                if result.is_ok() {
                    self.publish_view();
                }
                let _ = reply.send(result);
            }
            Command::ClearError { reply } => {
                self.store.clear_error();
                self.publish_view();
                let _ = reply.send(());
            }
            Command::ClearMessages { reply } => {
                let result = self.store.clear_messages();
                if result.is_ok() {
                    self.publish_view();
                }
                let _ = reply.send(result);
            }
            Command::ResolvePermission { reply } => {
                let resolved = self.store.resolve_permission();
                if resolved.is_some() {
                    self.publish_view();
                }
                let _ = reply.send(resolved);
            }
            Command::View { reply } => {
                let _ = reply.send(self.store.view());
            }
            Command::Archived { reply } => {
                let _ = reply.send(self.store.archived_messages().to_vec());
            }
            Command::SaveSnapshot { signal, reply } => {
                let result = self.save_snapshot(signal).await;
                let _ = reply.send(result);
            }
        }
    }

    async fn save_snapshot(&self, signal: CrashSignal) -> Result<(), RecoveryError> {
        self.recovery
            .save_on_abnormal_exit(&self.store, signal)
            .await
            .inspect_err(|e| tracing::error!(%signal, error = %e, "Failed to save recovery snapshot"))?;
        let _ = self.updates.send(StoreUpdate::SnapshotSaved { signal });
        Ok(())
    }

    // ==================== Transport ====================

    /// Run transport commands in the background; outcomes come back
    /// through the outcome channel so the loop never waits on them
    fn dispatch(&self, outbound: Vec<TransportCommand>) {
        for command in outbound {
            let transport = self.transport.clone();
            let outcome_tx = self.outcome_tx.clone();
            tracing::debug!(command = command.name(), turn = command.turn(), "Dispatching transport command");

            tokio::spawn(async move {
                let turn = command.turn();
                let result = match &command {
                    TransportCommand::Start {
                        turn,
                        content,
                        resume,
                    } => transport
                        .start_turn(*turn, content, resume.as_deref())
                        .await
                        .map(Some),
                    TransportCommand::Continue { turn, session_id } => transport
                        .continue_turn(*turn, session_id)
                        .await
                        .map(Some),
                    TransportCommand::Interrupt { session_id, .. } => {
                        transport.interrupt_turn(session_id).await.map(|()| None)
                    }
                };

                let outcome = match result {
                    Ok(Some(session_id)) => TransportOutcome::Accepted { turn, session_id },
                    Ok(None) => TransportOutcome::Interrupted { turn },
                    // The process finished on its own before the kill landed
                    Err(TransportError::NotRunning(session_id)) => {
                        tracing::debug!(turn, %session_id, "Nothing to interrupt");
                        TransportOutcome::Interrupted { turn }
                    }
                    Err(e) => {
                        tracing::error!(command = command.name(), turn, error = %e, "Transport command failed");
                        TransportOutcome::Failed {
                            turn,
                            message: e.to_string(),
                        }
                    }
                };
                let _ = outcome_tx.send(outcome).await;
            });
        }
    }

    fn process_outcome(&mut self, outcome: TransportOutcome) {
        let disposition = match outcome {
            TransportOutcome::Accepted { turn, session_id } => {
                self.store.transport_accepted(turn, session_id)
            }
            TransportOutcome::Failed { turn, message } => self.store.transport_failed(turn, message),
            TransportOutcome::Interrupted { turn } => {
                tracing::debug!(turn, "Interrupt delivered");
                return;
            }
        };
        if disposition == Disposition::Applied {
            self.publish_view();
        }
    }

    fn process_inbound(&mut self, inbound: Inbound) {
        let current = self.store.session().turn;
        if inbound.turn != current {
            tracing::debug!(turn = inbound.turn, current, "Dropping output of a previous turn");
            return;
        }
        if inbound.turn != self.decoder_turn {
            self.decoder = LineDecoder::new();
            self.decoder_turn = inbound.turn;
        }

        match inbound.body {
            InboundBody::Data(chunk) => {
                for decoded in self.decoder.push(&chunk) {
                    self.apply_decoded(decoded);
                }
            }
            InboundBody::Closed { exit_code } => {
                if let Some(decoded) = self.decoder.finish() {
                    self.apply_decoded(decoded);
                }
                if self.store.is_streaming() {
                    let status = exit_code.map_or_else(|| "a signal".to_string(), |c| format!("status {c}"));
                    let message = format!("assistant exited with {status} before finishing the turn");
                    if self.store.transport_failed(inbound.turn, message) == Disposition::Applied {
                        self.publish_view();
                    }
                }
            }
        }
    }

    fn apply_decoded(&mut self, decoded: Result<Event, DecodeError>) {
        let event = match decoded {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, raw = ?e.raw(), "Dropping malformed event");
                return;
            }
        };

        let delta = match &event {
            Event::TextDelta { text } => Some(text.clone()),
            _ => None,
        };
        if self.store.handle_event(event) != Disposition::Applied {
            return;
        }
        match delta {
            Some(text) => {
                let _ = self.updates.send(StoreUpdate::TextDelta(text));
                self.publish_snapshot();
            }
            None => self.publish_view(),
        }
    }

    fn publish_view(&self) {
        // No subscribers is fine
        let _ = self
            .updates
            .send(StoreUpdate::View(Arc::new(self.store.view())));
        self.publish_snapshot();
    }

    fn publish_snapshot(&self) {
        self.snapshots.send_replace(self.store.snapshot());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MessageRole, ToolStatus};
    use crate::runtime::testing::{InMemorySnapshotStore, MockTransport, TransportCall};
    use crate::runtime::watchdog::save_on_stall;
    use crate::runtime::RuntimeError;
    use crate::state_machine::{LifecycleState, TransitionError};
    use crate::store::{ConversationView, StoreError};
    use std::time::Duration;

    struct Harness {
        handle: ChatHandle,
        transport: Arc<MockTransport>,
        snapshots: Arc<InMemorySnapshotStore>,
        updates: broadcast::Receiver<StoreUpdate>,
    }

    fn start() -> Harness {
        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        let transport = Arc::new(MockTransport::new(inbound_tx));
        let snapshots = Arc::new(InMemorySnapshotStore::new());
        let (runtime, handle) = ChatRuntime::new(
            ConversationStore::default(),
            transport.clone(),
            RecoveryBridge::new(snapshots.clone()),
            inbound_rx,
        );
        let updates = handle.subscribe();
        tokio::spawn(runtime.run());
        Harness {
            handle,
            transport,
            snapshots,
            updates,
        }
    }

    /// Wait for a published view matching the predicate
    async fn wait_for_view(
        updates: &mut broadcast::Receiver<StoreUpdate>,
        predicate: impl Fn(&ConversationView) -> bool,
    ) -> Arc<ConversationView> {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match updates.recv().await {
                    Ok(StoreUpdate::View(view)) if predicate(&view) => return view,
                    Ok(_) => {}
                    Err(e) => panic!("update stream ended: {e}"),
                }
            }
        })
        .await
        .expect("timed out waiting for view")
    }

    #[tokio::test]
    async fn test_full_turn_through_transport() {
        let mut h = start();
        h.handle.send("hi").await.unwrap();

        let call = h.transport.wait_for_call(0).await;
        assert_eq!(
            call,
            TransportCall::Start {
                turn: 1,
                content: "hi".to_string(),
                resume: None,
            }
        );

        h.transport
            .emit(
                1,
                concat!(
                    r#"{"type":"session_start","sessionId":"s1"}"#,
                    "\n",
                    r#"{"type":"text_delta","text":"Hel"}"#,
                    "\n",
                    r#"{"type":"text_delta","te"#
                ),
            )
            .await;
        h.transport
            .emit(1, "xt\":\"lo\"}\n{\"type\":\"result\",\"subtype\":\"success\"}\n")
            .await;

        let view = wait_for_view(&mut h.updates, |v| v.lifecycle == LifecycleState::Completed).await;
        assert_eq!(view.messages.len(), 2);
        assert_eq!(view.messages[1].role, MessageRole::Assistant);
        assert_eq!(view.messages[1].content, "Hello");
        assert_eq!(view.session_id.as_deref(), Some("s1"));
        assert!(!view.is_streaming);
    }

    #[tokio::test]
    async fn test_text_deltas_stream_to_subscribers() {
        let mut h = start();
        h.handle.send("hi").await.unwrap();
        h.transport.wait_for_call(0).await;
        h.transport
            .emit(1, "{\"type\":\"session_start\",\"sessionId\":\"s1\"}\n{\"type\":\"text_delta\",\"text\":\"abc\"}\n")
            .await;

        let delta = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(StoreUpdate::TextDelta(text)) = h.updates.recv().await {
                    return text;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(delta, "abc");
    }

    #[tokio::test]
    async fn test_send_while_busy_is_rejected() {
        let h = start();
        h.handle.send("one").await.unwrap();
        let err = h.handle.send("two").await.unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::Store(StoreError::Transition(TransitionError::SessionBusy))
        ));
        assert_eq!(h.handle.view().await.unwrap().messages.len(), 1);
    }

    #[tokio::test]
    async fn test_transport_failure_becomes_sticky_error() {
        let mut h = start();
        h.transport.fail_next("spawn failed");
        h.handle.send("hi").await.unwrap();

        let view = wait_for_view(&mut h.updates, |v| v.lifecycle == LifecycleState::Errored).await;
        assert!(view.error.as_deref().unwrap().contains("spawn failed"));
        assert_eq!(view.messages.len(), 1);
    }

    #[tokio::test]
    async fn test_interrupt_kills_turn_and_drops_late_output() {
        let mut h = start();
        h.handle.send("hi").await.unwrap();
        h.transport.wait_for_call(0).await;
        h.transport
            .emit(
                1,
                concat!(
                    r#"{"type":"session_start","sessionId":"s1"}"#,
                    "\n",
                    r#"{"type":"tool_start","toolName":"bash","input":{}}"#,
                    "\n",
                    r#"{"type":"text_delta","text":"part"}"#,
                    "\n"
                ),
            )
            .await;
        wait_for_view(&mut h.updates, |v| !v.turn_tools.is_empty()).await;

        // Output may still be in flight; interrupt once the delta landed
        tokio::time::timeout(Duration::from_secs(5), async {
            while h.handle.view().await.unwrap().partial_text != "part" {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        h.handle.interrupt().await.unwrap();

        let call = h.transport.wait_for_call(1).await;
        assert_eq!(
            call,
            TransportCall::Interrupt {
                session_id: "s1".to_string()
            }
        );

        h.transport
            .emit(1, "{\"type\":\"text_delta\",\"text\":\" late\"}\n")
            .await;
        h.transport.close(1, None).await;

        let view = h.handle.view().await.unwrap();
        assert_eq!(view.lifecycle, LifecycleState::Interrupted);
        let reply = view.messages.last().unwrap();
        assert_eq!(reply.content, "part");
        assert_eq!(reply.tool_calls[0].status, ToolStatus::Failed);
        assert!(view.error.is_none());
    }

    #[tokio::test]
    async fn test_early_exit_errors_the_turn() {
        let mut h = start();
        h.handle.send("hi").await.unwrap();
        h.transport.wait_for_call(0).await;
        h.transport
            .emit(1, "{\"type\":\"session_start\",\"sessionId\":\"s1\"}\n{\"type\":\"text_delta\",\"text\":\"cut\"}")
            .await;
        h.transport.close(1, Some(1)).await;

        let view = wait_for_view(&mut h.updates, |v| v.lifecycle == LifecycleState::Errored).await;
        // The unterminated last line is still decoded
        assert_eq!(view.messages.last().unwrap().content, "cut");
        assert!(view.error.as_deref().unwrap().contains("status 1"));
    }

    #[tokio::test]
    async fn test_malformed_lines_are_skipped() {
        let mut h = start();
        h.handle.send("hi").await.unwrap();
        h.transport.wait_for_call(0).await;
        h.transport
            .emit(
                1,
                "{\"type\":\"session_start\",\"sessionId\":\"s1\"}\nnot json\n\n{\"type\":\"text_delta\",\"text\":\"ok\"}\n{\"type\":\"session_end\"}\n",
            )
            .await;

        let view = wait_for_view(&mut h.updates, |v| v.lifecycle == LifecycleState::Completed).await;
        assert_eq!(view.messages.last().unwrap().content, "ok");
        assert!(view.error.is_none());
    }

    #[tokio::test]
    async fn test_output_of_previous_turn_is_dropped() {
        let mut h = start();
        h.handle.send("one").await.unwrap();
        h.transport.wait_for_call(0).await;
        h.transport
            .emit(1, "{\"type\":\"session_start\",\"sessionId\":\"s1\"}\n{\"type\":\"result\",\"subtype\":\"success\",\"result\":\"first\"}\n")
            .await;
        wait_for_view(&mut h.updates, |v| v.lifecycle == LifecycleState::Completed).await;

        h.handle.send("two").await.unwrap();
        h.transport.wait_for_call(1).await;
        // Late lines from turn 1 must not leak into turn 2
        h.transport
            .emit(1, "{\"type\":\"session_start\",\"sessionId\":\"s1\"}\n")
            .await;
        h.transport
            .emit(2, "{\"type\":\"session_start\",\"sessionId\":\"s1\"}\n{\"type\":\"text_delta\",\"text\":\"second\"}\n{\"type\":\"session_end\"}\n")
            .await;

        let view = wait_for_view(&mut h.updates, |v| {
            v.lifecycle == LifecycleState::Completed && v.messages.len() == 4
        })
        .await;
        assert_eq!(view.messages[1].content, "first");
        assert_eq!(view.messages[3].content, "second");
    }

    #[tokio::test]
    async fn test_save_snapshot_on_signal() {
        let h = start();
        h.handle.send("remember me").await.unwrap();
        h.handle.save_snapshot(CrashSignal::Terminating).await.unwrap();

        let saved = h.snapshots.load().await.unwrap().unwrap();
        assert_eq!(saved.messages.len(), 1);
        assert_eq!(saved.messages[0].content, "remember me");
        assert_eq!(h.snapshots.save_count(), 1);
    }

    #[tokio::test]
    async fn test_handle_errors_after_shutdown() {
        let h = start();
        h.handle.shutdown();
        tokio::time::timeout(Duration::from_secs(5), async {
            while h.handle.view().await.is_ok() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert!(matches!(h.handle.view().await, Err(RuntimeError::Stopped)));
    }

    /// Snapshot store whose writes hang until released
    #[derive(Default)]
    struct HangingSnapshotStore {
        entered: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    #[async_trait::async_trait]
    impl SnapshotStore for HangingSnapshotStore {
        async fn save(&self, _snapshot: &RecoverySnapshot) -> Result<(), RecoveryError> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(())
        }

        async fn load(&self) -> Result<Option<RecoverySnapshot>, RecoveryError> {
            Ok(None)
        }

        async fn clear(&self) -> Result<(), RecoveryError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_stall_save_bypasses_stuck_loop() {
        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        let transport = Arc::new(MockTransport::new(inbound_tx));
        let hanging = Arc::new(HangingSnapshotStore::default());
        let (runtime, handle) = ChatRuntime::new(
            ConversationStore::default(),
            transport.clone(),
            RecoveryBridge::new(hanging.clone()),
            inbound_rx,
        );
        let mut updates = handle.subscribe();
        tokio::spawn(runtime.run());

        handle.send("hello").await.unwrap();
        transport.wait_for_call(0).await;
        transport
            .emit(1, "{\"type\":\"session_start\",\"sessionId\":\"s1\"}\n{\"type\":\"text_delta\",\"text\":\"partial\"}\n")
            .await;
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(StoreUpdate::TextDelta(_)) = updates.recv().await {
                    return;
                }
            }
        })
        .await
        .unwrap();

        // Park the loop inside a write that never finishes
        let parked = handle.clone();
        tokio::spawn(async move {
            let _ = parked.save_snapshot(CrashSignal::Terminating).await;
        });
        hanging.entered.notified().await;
        assert!(tokio::time::timeout(Duration::from_millis(100), handle.view())
            .await
            .is_err());

        let stall_store = Arc::new(InMemorySnapshotStore::new());
        let (signal_tx, signal_rx) = mpsc::channel(1);
        let saver = tokio::spawn(save_on_stall(
            signal_rx,
            handle.snapshots(),
            RecoveryBridge::new(stall_store.clone()),
        ));
        signal_tx.send(CrashSignal::Stalled).await.unwrap();
        drop(signal_tx);
        tokio::time::timeout(Duration::from_secs(5), saver)
            .await
            .unwrap()
            .unwrap();

        let saved = stall_store.load().await.unwrap().unwrap();
        assert_eq!(saved.messages.len(), 1);
        assert_eq!(saved.messages[0].content, "hello");
        assert_eq!(saved.current_partial_text, "partial");
        assert_eq!(saved.session_id.as_deref(), Some("s1"));

        hanging.release.notify_one();
    }
}
