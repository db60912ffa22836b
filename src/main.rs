//! Streamdesk - terminal front end for an assistant CLI
//!
//! Reads prompts from stdin, streams the assistant's answer to stdout and
//! saves a recovery snapshot when the process is stopped or stalls.

use std::io::Write;
use streamdesk::config::ChatConfig;
use streamdesk::recovery::{analyze, CrashSignal, RecoveryBridge, SqliteSnapshotStore};
use streamdesk::runtime::watchdog::save_on_stall;
use streamdesk::runtime::{ChatHandle, ChatRuntime, Heartbeat, StoreUpdate, Watchdog};
use streamdesk::store::{ConversationStore, ConversationView};
use streamdesk::transport::ProcessTransport;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const HELP: &str = "commands: /continue /interrupt /allow /dismiss /clear /quit";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Logs go to stderr so stdout stays the conversation
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "streamdesk=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let config = ChatConfig::from_env()?;
    tracing::info!(
        cli = %config.cli,
        db = %config.db_path.display(),
        "Starting streamdesk"
    );

    let snapshots = SqliteSnapshotStore::open(&config.db_path, config.snapshot_max_bytes)?;
    let recovery = RecoveryBridge::new(snapshots.clone());

    // Pick up whatever the previous run left behind
    let mut store = ConversationStore::new(config.archive_threshold);
    let resume_hint = match recovery.take_pending().await? {
        Some(snapshot) => {
            let decision = analyze(&snapshot);
            let outcome = recovery.restore_into(&mut store).await?;
            tracing::info!(?outcome, reason = ?decision.reason, "Boot recovery");
            decision.suggest_continue
        }
        None => false,
    };

    let (inbound_tx, inbound_rx) = mpsc::channel(256);
    let transport = ProcessTransport::new(config.cli.clone(), config.work_dir.clone(), inbound_tx);

    let heartbeat = Heartbeat::new();
    let (runtime, handle) = ChatRuntime::new(store, transport, recovery, inbound_rx);
    let runtime = runtime.with_heartbeat(heartbeat.clone());

    let render = tokio::spawn(render_updates(handle.subscribe()));
    let runtime_task = tokio::spawn(runtime.run());

    let watchdog_cancel = CancellationToken::new();
    let (signal_tx, signal_rx) = mpsc::channel(4);
    tokio::spawn(
        Watchdog::new(heartbeat, config.heartbeat_stale).run(signal_tx, watchdog_cancel.clone()),
    );
    // Saves from the published snapshot, so a hung runtime loop can't block it
    tokio::spawn(save_on_stall(
        signal_rx,
        handle.snapshots(),
        RecoveryBridge::new(snapshots),
    ));

    let view = handle.view().await?;
    print_history(&view);
    if resume_hint {
        println!("[the last answer was cut off; type /continue to resume it]");
    }
    println!("{HELP}");

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            signal = &mut shutdown => {
                signal?;
                if let Err(e) = handle.save_snapshot(CrashSignal::Terminating).await {
                    tracing::error!(error = %e, "Failed to save recovery snapshot");
                }
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if !run_line(&handle, line.trim()).await {
                    break;
                }
            }
        }
    }

    watchdog_cancel.cancel();
    handle.shutdown();
    runtime_task.await?;
    render.abort();
    Ok(())
}

/// Resolves on SIGTERM or SIGINT
async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM - saving and shutting down");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT - saving and shutting down");
        }
    }
    Ok(())
}

/// Apply one line of user input. Returns false when the user quits.
async fn run_line(handle: &ChatHandle, line: &str) -> bool {
    let result = match line {
        "" => return true,
        "/quit" => return false,
        "/help" => {
            println!("{HELP}");
            Ok(())
        }
        "/continue" => handle.continue_session().await,
        "/interrupt" => handle.interrupt().await,
        "/clear" => handle.clear_messages().await,
        "/dismiss" => handle.clear_error().await,
        "/allow" => match handle.resolve_permission().await {
            Ok(Some(request)) => {
                let tools: Vec<_> = request.denials.iter().map(|d| d.tool_name.as_str()).collect();
                println!("[permission acknowledged for {}]", tools.join(", "));
                Ok(())
            }
            Ok(None) => {
                println!("[no pending permission request]");
                Ok(())
            }
            Err(e) => Err(e),
        },
        content => handle.send(content).await,
    };

    if let Err(e) = result {
        println!("[{e}]");
    }
    true
}

async fn render_updates(updates: broadcast::Receiver<StoreUpdate>) {
    let mut updates = BroadcastStream::new(updates);
    let mut last_error: Option<String> = None;
    let mut was_streaming = false;
    let mut last_permission: Option<String> = None;

    while let Some(update) = updates.next().await {
        match update {
            Ok(StoreUpdate::TextDelta(text)) => {
                print!("{text}");
                let _ = std::io::stdout().flush();
            }
            Ok(StoreUpdate::View(view)) => {
                if was_streaming && !view.is_streaming {
                    println!();
                    println!("[{}]", view.lifecycle);
                }
                was_streaming = view.is_streaming;

                if view.error != last_error {
                    if let Some(error) = &view.error {
                        println!("[error: {error}]");
                    }
                    last_error.clone_from(&view.error);
                }
                let permission = view.pending_permission.as_ref().map(|r| r.id.clone());
                if permission != last_permission {
                    if let Some(request) = &view.pending_permission {
                        for denial in &request.denials {
                            println!("[permission needed: {} ({})]", denial.tool_name, denial.reason);
                        }
                    }
                    last_permission = permission;
                }
            }
            Ok(StoreUpdate::SnapshotSaved { signal }) => {
                tracing::debug!(%signal, "Snapshot saved");
            }
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Renderer fell behind");
            }
        }
    }
}

fn print_history(view: &ConversationView) {
    if view.archived_count > 0 {
        println!("[{} older messages archived]", view.archived_count);
    }
    for message in &view.messages {
        println!("{:?}: {}", message.role, message.content);
        if let Some(summary) = &message.tool_summary {
            println!("  ({} tool calls: {})", summary.count, summary.names.join(", "));
        }
    }
}
