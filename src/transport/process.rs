//! Assistant CLI run as a child process per turn

use super::{Inbound, Transport, TransportError};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{mpsc, Mutex};

/// Prompt sent when the user asks the assistant to keep going
const CONTINUE_PROMPT: &str = "continue";

/// How often a child whose stdout closed is checked for exit
const REAP_POLL: Duration = Duration::from_millis(50);

struct RunningTurn {
    turn: u64,
    session_id: String,
    child: Child,
}

/// Spawns the assistant CLI in stream-json mode, one process per turn.
///
/// Only one turn runs at a time; starting a new one kills the previous
/// process. Stdout lines are forwarded to the runtime tagged with the turn.
pub struct ProcessTransport {
    program: String,
    work_dir: Option<PathBuf>,
    inbound: mpsc::Sender<Inbound>,
    current: Arc<Mutex<Option<RunningTurn>>>,
}

impl ProcessTransport {
    pub fn new(
        program: impl Into<String>,
        work_dir: Option<PathBuf>,
        inbound: mpsc::Sender<Inbound>,
    ) -> Self {
        Self {
            program: program.into(),
            work_dir,
            inbound,
            current: Arc::new(Mutex::new(None)),
        }
    }

    fn args(prompt: &str, session: SessionArg<'_>) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            prompt.to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
        ];
        match session {
            SessionArg::New(id) => args.extend(["--session-id".to_string(), id.to_string()]),
            SessionArg::Resume(id) => args.extend(["--resume".to_string(), id.to_string()]),
        }
        args
    }

    async fn spawn_turn(
        &self,
        turn: u64,
        session_id: String,
        args: Vec<String>,
    ) -> Result<String, TransportError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = self.work_dir.as_ref().filter(|d| d.exists()) {
            cmd.current_dir(dir);
        }

        let mut slot = self.current.lock().await;
        if let Some(mut previous) = slot.take() {
            tracing::warn!(turn = previous.turn, "Killing previous assistant process");
            let _ = previous.child.start_kill();
        }

        let mut child = cmd.spawn().map_err(|source| TransportError::Spawn {
            program: self.program.clone(),
            source,
        })?;
        let stdout = child.stdout.take().ok_or(TransportError::NoStdout)?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(log_stderr(turn, stderr));
        }

        tracing::info!(turn, session_id = %session_id, pid = ?child.id(), "Assistant process started");
        *slot = Some(RunningTurn {
            turn,
            session_id: session_id.clone(),
            child,
        });
        drop(slot);

        tokio::spawn(forward_stdout(
            turn,
            stdout,
            self.inbound.clone(),
            self.current.clone(),
        ));
        Ok(session_id)
    }
}

enum SessionArg<'a> {
    New(&'a str),
    Resume(&'a str),
}

#[async_trait]
impl Transport for ProcessTransport {
    async fn start_turn(
        &self,
        turn: u64,
        content: &str,
        resume: Option<&str>,
    ) -> Result<String, TransportError> {
        let session_id = match resume {
            Some(id) => id.to_string(),
            None => uuid::Uuid::new_v4().to_string(),
        };
        let session = match resume {
            Some(id) => SessionArg::Resume(id),
            None => SessionArg::New(&session_id),
        };
        let args = Self::args(content, session);
        self.spawn_turn(turn, session_id.clone(), args).await
    }

    async fn continue_turn(&self, turn: u64, session_id: &str) -> Result<String, TransportError> {
        let args = Self::args(CONTINUE_PROMPT, SessionArg::Resume(session_id));
        self.spawn_turn(turn, session_id.to_string(), args).await
    }

    async fn interrupt_turn(&self, session_id: &str) -> Result<(), TransportError> {
        let mut slot = self.current.lock().await;
        let Some(running) = slot.as_mut().filter(|r| r.session_id == session_id) else {
            return Err(TransportError::NotRunning(session_id.to_string()));
        };
        tracing::info!(turn = running.turn, session_id, "Interrupting assistant process");
        running.child.kill().await.map_err(TransportError::Kill)?;
        *slot = None;
        Ok(())
    }
}

async fn forward_stdout(
    turn: u64,
    stdout: ChildStdout,
    inbound: mpsc::Sender<Inbound>,
    current: Arc<Mutex<Option<RunningTurn>>>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(mut line)) => {
                line.push('\n');
                if inbound.send(Inbound::data(turn, line)).await.is_err() {
                    return;
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(turn, error = %e, "Failed reading assistant output");
                break;
            }
        }
    }

    let exit_code = reap(turn, &current).await;
    tracing::debug!(turn, ?exit_code, "Assistant output closed");
    let _ = inbound.send(Inbound::closed(turn, exit_code)).await;
}

/// Wait for the turn's child to exit without holding the slot lock, so an
/// interrupt or the next turn can still take it. Returns `None` once the
/// child belongs to someone else.
async fn reap(turn: u64, current: &Mutex<Option<RunningTurn>>) -> Option<i32> {
    loop {
        {
            let mut slot = current.lock().await;
            let running = slot.as_mut().filter(|r| r.turn == turn)?;
            match running.child.try_wait() {
                Ok(Some(status)) => {
                    *slot = None;
                    return status.code();
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(turn, error = %e, "Failed waiting for assistant process");
                    *slot = None;
                    return None;
                }
            }
        }
        tokio::time::sleep(REAP_POLL).await;
    }
}

async fn log_stderr(turn: u64, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(turn, line = %line, "assistant stderr");
    }
}
