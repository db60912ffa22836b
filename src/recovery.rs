//! Crash recovery bridge
//!
//! On an abnormal-exit notice the conversation is serialized to a durable
//! key-bounded store. On the next start the snapshot is offered back to the
//! conversation store, which replaces its state wholesale, and the record
//! is cleared. Restoring is one-shot.

mod decision;
mod sqlite;

pub use decision::{analyze, RecoveryDecision, RecoveryReason};
pub use sqlite::SqliteSnapshotStore;

use crate::model::Message;
use crate::store::{ConversationStore, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Fixed key of the single recovery record
pub const SNAPSHOT_KEY: &str = "conversation_recovery";

/// Persisted conversation state. The JSON shape is the on-disk format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoverySnapshot {
    /// Archived then live messages, in conversation order
    pub messages: Vec<Message>,
    #[serde(default)]
    pub current_partial_text: String,
    #[serde(default)]
    pub session_id: Option<String>,
    pub saved_at: DateTime<Utc>,
}

impl RecoverySnapshot {
    /// Nothing worth restoring
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.current_partial_text.is_empty() && self.session_id.is_none()
    }
}

/// What a restore attempt did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreOutcome {
    Restored { messages: usize },
    AlreadyRestored,
    NothingToRestore,
}

/// Why the process is being asked to save
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashSignal {
    /// Heartbeat went stale
    Stalled,
    /// Process is being terminated (Ctrl-C, SIGTERM)
    Terminating,
}

impl fmt::Display for CrashSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CrashSignal::Stalled => f.write_str("stalled"),
            CrashSignal::Terminating => f.write_str("terminating"),
        }
    }
}

#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Snapshot encoding error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Failed to prepare snapshot location: {0}")]
    Io(#[from] std::io::Error),
    #[error("Snapshot of {bytes} bytes exceeds the {max} byte limit")]
    TooLarge { bytes: usize, max: usize },
    #[error("Snapshot store lock poisoned")]
    Poisoned,
    #[error("Snapshot task failed: {0}")]
    Task(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Durable home of the recovery record
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Replace the stored snapshot
    async fn save(&self, snapshot: &RecoverySnapshot) -> Result<(), RecoveryError>;

    async fn load(&self) -> Result<Option<RecoverySnapshot>, RecoveryError>;

    async fn clear(&self) -> Result<(), RecoveryError>;
}

#[async_trait]
impl<T: SnapshotStore + ?Sized> SnapshotStore for Arc<T> {
    async fn save(&self, snapshot: &RecoverySnapshot) -> Result<(), RecoveryError> {
        (**self).save(snapshot).await
    }

    async fn load(&self) -> Result<Option<RecoverySnapshot>, RecoveryError> {
        (**self).load().await
    }

    async fn clear(&self) -> Result<(), RecoveryError> {
        (**self).clear().await
    }
}

/// Save/restore plumbing between a [`ConversationStore`] and a
/// [`SnapshotStore`]
pub struct RecoveryBridge<S> {
    store: S,
}

impl<S: SnapshotStore> RecoveryBridge<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Persist the conversation after an abnormal-exit notice
    pub async fn save_on_abnormal_exit(
        &self,
        conversation: &ConversationStore,
        signal: CrashSignal,
    ) -> Result<(), RecoveryError> {
        self.save(&conversation.snapshot(), signal).await
    }

    /// Persist a snapshot taken earlier, e.g. by a watcher that cannot
    /// reach the conversation
    pub async fn save(&self, snapshot: &RecoverySnapshot, signal: CrashSignal) -> Result<(), RecoveryError> {
        if snapshot.is_empty() {
            tracing::debug!(%signal, "Nothing to save for recovery");
            return Ok(());
        }
        self.store.save(snapshot).await?;
        tracing::info!(
            %signal,
            messages = snapshot.messages.len(),
            partial_chars = snapshot.current_partial_text.len(),
            "Saved recovery snapshot"
        );
        Ok(())
    }

    /// Snapshot left behind by a previous run, if any
    pub async fn take_pending(&self) -> Result<Option<RecoverySnapshot>, RecoveryError> {
        self.store.load().await
    }

    /// Drop the pending snapshot without restoring it
    pub async fn discard(&self) -> Result<(), RecoveryError> {
        self.store.clear().await
    }

    /// Overwrite the conversation with the pending snapshot, then clear it
    pub async fn restore_into(
        &self,
        conversation: &mut ConversationStore,
    ) -> Result<RestoreOutcome, RecoveryError> {
        if conversation.was_restored() {
            return Ok(RestoreOutcome::AlreadyRestored);
        }
        let Some(snapshot) = self.store.load().await? else {
            return Ok(RestoreOutcome::NothingToRestore);
        };

        let outcome = conversation.restore(snapshot)?;
        self.store.clear().await?;
        tracing::info!(?outcome, "Recovery snapshot restored");
        Ok(outcome)
    }
}
