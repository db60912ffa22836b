//! Outbound commands to the assistant
//!
//! The [`Transport`] trait is the seam between the conversation core and
//! whatever runs the assistant. Calls may suspend (spawning a process)
//! and may fail; the runtime executes them off the event loop and feeds
//! the outcome back as lifecycle inputs. Raw output flows the other way as
//! [`Inbound`] messages tagged with the turn that produced them.

mod process;

pub use process::ProcessTransport;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// A transport call requested by a lifecycle transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCommand {
    Start {
        turn: u64,
        content: String,
        /// Session to resume, when the conversation already has one
        resume: Option<String>,
    },
    Continue {
        turn: u64,
        session_id: String,
    },
    Interrupt {
        turn: u64,
        session_id: String,
    },
}

impl TransportCommand {
    pub fn turn(&self) -> u64 {
        match self {
            TransportCommand::Start { turn, .. }
            | TransportCommand::Continue { turn, .. }
            | TransportCommand::Interrupt { turn, .. } => *turn,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TransportCommand::Start { .. } => "start",
            TransportCommand::Continue { .. } => "continue",
            TransportCommand::Interrupt { .. } => "interrupt",
        }
    }
}

/// Raw output of the assistant for one turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    pub turn: u64,
    pub body: InboundBody,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundBody {
    /// Bytes of line-delimited JSON, not necessarily whole lines
    Data(String),
    /// The assistant's output ended
    Closed { exit_code: Option<i32> },
}

impl Inbound {
    pub fn data(turn: u64, data: impl Into<String>) -> Self {
        Self {
            turn,
            body: InboundBody::Data(data.into()),
        }
    }

    pub fn closed(turn: u64, exit_code: Option<i32>) -> Self {
        Self {
            turn,
            body: InboundBody::Closed { exit_code },
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to launch `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("assistant process has no stdout")]
    NoStdout,
    #[error("no running turn for session {0}")]
    NotRunning(String),
    #[error("failed to stop assistant: {0}")]
    Kill(#[source] std::io::Error),
    #[error("transport rejected the request: {0}")]
    Rejected(String),
}

/// Runs assistant turns
#[async_trait]
pub trait Transport: Send + Sync {
    /// Begin a turn with user content; returns the session id
    async fn start_turn(
        &self,
        turn: u64,
        content: &str,
        resume: Option<&str>,
    ) -> Result<String, TransportError>;

    /// Ask the assistant to keep going on an existing session
    async fn continue_turn(&self, turn: u64, session_id: &str) -> Result<String, TransportError>;

    /// Cancel whatever the session is doing
    async fn interrupt_turn(&self, session_id: &str) -> Result<(), TransportError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn start_turn(
        &self,
        turn: u64,
        content: &str,
        resume: Option<&str>,
    ) -> Result<String, TransportError> {
        (**self).start_turn(turn, content, resume).await
    }

    async fn continue_turn(&self, turn: u64, session_id: &str) -> Result<String, TransportError> {
        (**self).continue_turn(turn, session_id).await
    }

    async fn interrupt_turn(&self, session_id: &str) -> Result<(), TransportError> {
        (**self).interrupt_turn(session_id).await
    }
}
