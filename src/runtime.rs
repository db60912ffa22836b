//! Async driver for the conversation
//!
//! [`ChatRuntime`] owns the [`ConversationStore`](crate::store::ConversationStore)
//! and is its only consumer:
//! commands from [`ChatHandle`]s, raw transport output and the outcomes of
//! background transport calls are all processed one at a time on a single
//! task. Renderers follow along through [`StoreUpdate`] broadcasts.

mod executor;
pub mod watchdog;

#[cfg(test)]
pub mod testing;

pub use executor::ChatRuntime;
pub use watchdog::{Heartbeat, Watchdog};

use crate::model::{Message, PermissionRequest};
use crate::recovery::{CrashSignal, RecoveryError, RecoverySnapshot};
use crate::store::{ConversationView, StoreError};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

/// Capacity of the renderer broadcast channel
const UPDATE_CAPACITY: usize = 256;

/// Pushed to renderers as the conversation changes
#[derive(Debug, Clone)]
pub enum StoreUpdate {
    /// Full read model after a change
    View(Arc<ConversationView>),
    /// Text appended to the in-progress assistant message
    TextDelta(String),
    /// A recovery snapshot was written
    SnapshotSaved { signal: CrashSignal },
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Recovery(#[from] RecoveryError),
    #[error("conversation runtime has stopped")]
    Stopped,
}

type Reply<T> = oneshot::Sender<T>;

/// Requests from handles to the runtime loop
pub(crate) enum Command {
    Send {
        content: String,
        reply: Reply<Result<(), StoreError>>,
    },
    Continue {
        reply: Reply<Result<(), StoreError>>,
    },
    Interrupt {
        reply: Reply<Result<(), StoreError>>,
    },
    ClearError {
        reply: Reply<()>,
    },
    ClearMessages {
        reply: Reply<Result<(), StoreError>>,
    },
    ResolvePermission {
        reply: Reply<Option<PermissionRequest>>,
    },
    View {
        reply: Reply<ConversationView>,
    },
    Archived {
        reply: Reply<Vec<Message>>,
    },
    SaveSnapshot {
        signal: CrashSignal,
        reply: Reply<Result<(), RecoveryError>>,
    },
}

/// Cloneable front door to a running conversation
#[derive(Clone)]
pub struct ChatHandle {
    commands: mpsc::Sender<Command>,
    updates: broadcast::Sender<StoreUpdate>,
    snapshots: watch::Receiver<RecoverySnapshot>,
    cancel: CancellationToken,
}

impl ChatHandle {
    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T, RuntimeError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| RuntimeError::Stopped)?;
        rx.await.map_err(|_| RuntimeError::Stopped)
    }

    /// Send a user message and start a turn
    pub async fn send(&self, content: impl Into<String>) -> Result<(), RuntimeError> {
        let content = content.into();
        Ok(self
            .request(|reply| Command::Send { content, reply })
            .await??)
    }

    pub async fn continue_session(&self) -> Result<(), RuntimeError> {
        Ok(self.request(|reply| Command::Continue { reply }).await??)
    }

    pub async fn interrupt(&self) -> Result<(), RuntimeError> {
        Ok(self.request(|reply| Command::Interrupt { reply }).await??)
    }

    pub async fn clear_error(&self) -> Result<(), RuntimeError> {
        self.request(|reply| Command::ClearError { reply }).await
    }

    pub async fn clear_messages(&self) -> Result<(), RuntimeError> {
        Ok(self
            .request(|reply| Command::ClearMessages { reply })
            .await??)
    }

    /// Dismiss the pending permission request, returning it
    pub async fn resolve_permission(&self) -> Result<Option<PermissionRequest>, RuntimeError> {
        self.request(|reply| Command::ResolvePermission { reply })
            .await
    }

    pub async fn view(&self) -> Result<ConversationView, RuntimeError> {
        self.request(|reply| Command::View { reply }).await
    }

    pub async fn archived(&self) -> Result<Vec<Message>, RuntimeError> {
        self.request(|reply| Command::Archived { reply }).await
    }

    /// Write a recovery snapshot now
    pub async fn save_snapshot(&self, signal: CrashSignal) -> Result<(), RuntimeError> {
        Ok(self
            .request(|reply| Command::SaveSnapshot { signal, reply })
            .await??)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreUpdate> {
        self.updates.subscribe()
    }

    /// Latest conversation snapshot, readable even while the runtime loop
    /// is stuck
    pub fn snapshots(&self) -> watch::Receiver<RecoverySnapshot> {
        self.snapshots.clone()
    }

    /// Stop the runtime loop
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}
