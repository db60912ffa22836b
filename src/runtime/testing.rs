//! Mock implementations for testing
//!
//! These mocks let the runtime and recovery bridge run without spawning
//! processes or touching disk.

use crate::recovery::{RecoveryError, RecoverySnapshot, SnapshotStore};
use crate::transport::{Inbound, Transport, TransportError};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

// ============================================================================
// Mock Transport
// ============================================================================

/// A call the runtime made on the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    Start {
        turn: u64,
        content: String,
        resume: Option<String>,
    },
    Continue {
        turn: u64,
        session_id: String,
    },
    Interrupt {
        session_id: String,
    },
}

/// Records calls and lets tests play assistant output back
pub struct MockTransport {
    inbound: mpsc::Sender<Inbound>,
    calls: Mutex<Vec<TransportCall>>,
    failures: Mutex<VecDeque<String>>,
    /// Notified on every recorded call
    pub call_made: Arc<Notify>,
}

#[allow(dead_code)]
impl MockTransport {
    pub fn new(inbound: mpsc::Sender<Inbound>) -> Self {
        Self {
            inbound,
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(VecDeque::new()),
            call_made: Arc::new(Notify::new()),
        }
    }

    /// Make the next call fail with this message
    pub fn fail_next(&self, message: impl Into<String>) {
        self.failures.lock().unwrap().push_back(message.into());
    }

    pub fn recorded_calls(&self) -> Vec<TransportCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Wait until call number `index` (zero-based) has been made
    pub async fn wait_for_call(&self, index: usize) -> TransportCall {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let notified = self.call_made.notified();
                if let Some(call) = self.calls.lock().unwrap().get(index).cloned() {
                    return call;
                }
                notified.await;
            }
        })
        .await
        .expect("timed out waiting for transport call")
    }

    /// Deliver raw assistant output for a turn
    pub async fn emit(&self, turn: u64, data: &str) {
        self.inbound
            .send(Inbound::data(turn, data))
            .await
            .expect("runtime dropped inbound channel");
    }

    /// Signal that the assistant's output ended
    pub async fn close(&self, turn: u64, exit_code: Option<i32>) {
        self.inbound
            .send(Inbound::closed(turn, exit_code))
            .await
            .expect("runtime dropped inbound channel");
    }

    fn record(&self, call: TransportCall) -> Result<(), TransportError> {
        self.calls.lock().unwrap().push(call);
        self.call_made.notify_waiters();
        match self.failures.lock().unwrap().pop_front() {
            Some(message) => Err(TransportError::Rejected(message)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn start_turn(
        &self,
        turn: u64,
        content: &str,
        resume: Option<&str>,
    ) -> Result<String, TransportError> {
        self.record(TransportCall::Start {
            turn,
            content: content.to_string(),
            resume: resume.map(str::to_string),
        })?;
        Ok(resume.unwrap_or("mock-session").to_string())
    }

    async fn continue_turn(&self, turn: u64, session_id: &str) -> Result<String, TransportError> {
        self.record(TransportCall::Continue {
            turn,
            session_id: session_id.to_string(),
        })?;
        Ok(session_id.to_string())
    }

    async fn interrupt_turn(&self, session_id: &str) -> Result<(), TransportError> {
        self.record(TransportCall::Interrupt {
            session_id: session_id.to_string(),
        })
    }
}

// ============================================================================
// In-Memory Snapshot Store
// ============================================================================

/// Snapshot store that keeps the record in memory
#[derive(Default)]
pub struct InMemorySnapshotStore {
    snapshot: Mutex<Option<RecoverySnapshot>>,
    saves: AtomicUsize,
}

#[allow(dead_code)]
impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate as if a previous run had crashed
    pub fn with_snapshot(snapshot: RecoverySnapshot) -> Self {
        Self {
            snapshot: Mutex::new(Some(snapshot)),
            saves: AtomicUsize::new(0),
        }
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn save(&self, snapshot: &RecoverySnapshot) -> Result<(), RecoveryError> {
        *self.snapshot.lock().unwrap() = Some(snapshot.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn load(&self) -> Result<Option<RecoverySnapshot>, RecoveryError> {
        Ok(self.snapshot.lock().unwrap().clone())
    }

    async fn clear(&self) -> Result<(), RecoveryError> {
        *self.snapshot.lock().unwrap() = None;
        Ok(())
    }
}
