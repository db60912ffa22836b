//! SQLite-backed snapshot store

use super::{RecoveryError, RecoverySnapshot, SnapshotStore, SNAPSHOT_KEY};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS recovery_snapshots (
    key TEXT PRIMARY KEY,
    payload TEXT NOT NULL,
    saved_at TEXT NOT NULL
);
";

/// One row per key in a local SQLite file.
///
/// Payloads larger than `max_bytes` lose their oldest messages until they
/// fit.
#[derive(Clone)]
pub struct SqliteSnapshotStore {
    conn: Arc<Mutex<Connection>>,
    max_bytes: usize,
}

impl SqliteSnapshotStore {
    /// Open or create the database at the given path
    pub fn open<P: AsRef<Path>>(path: P, max_bytes: usize) -> Result<Self, RecoveryError> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::with_connection(conn, max_bytes)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory(max_bytes: usize) -> Result<Self, RecoveryError> {
        Self::with_connection(Connection::open_in_memory()?, max_bytes)
    }

    fn with_connection(conn: Connection, max_bytes: usize) -> Result<Self, RecoveryError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            max_bytes,
        })
    }

    /// Run a blocking closure against the connection off the async runtime
    async fn with_conn<T, F>(&self, f: F) -> Result<T, RecoveryError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, RecoveryError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().map_err(|_| RecoveryError::Poisoned)?;
            f(&conn)
        })
        .await
        .map_err(|e| RecoveryError::Task(e.to_string()))?
    }
}

/// Serialize, dropping the oldest messages until the payload fits
fn encode_bounded(snapshot: &RecoverySnapshot, max_bytes: usize) -> Result<String, RecoveryError> {
    let mut payload = serde_json::to_string(snapshot)?;
    if payload.len() <= max_bytes {
        return Ok(payload);
    }

    let original = payload.len();
    let mut trimmed = snapshot.clone();
    let mut dropped = 0usize;
    while payload.len() > max_bytes && !trimmed.messages.is_empty() {
        trimmed.messages.remove(0);
        dropped += 1;
        payload = serde_json::to_string(&trimmed)?;
    }
    if payload.len() > max_bytes {
        return Err(RecoveryError::TooLarge {
            bytes: payload.len(),
            max: max_bytes,
        });
    }

    tracing::warn!(
        original_bytes = original,
        bytes = payload.len(),
        dropped_messages = dropped,
        "Recovery snapshot over size limit, dropped oldest messages"
    );
    Ok(payload)
}

#[async_trait]
impl SnapshotStore for SqliteSnapshotStore {
    async fn save(&self, snapshot: &RecoverySnapshot) -> Result<(), RecoveryError> {
        let payload = encode_bounded(snapshot, self.max_bytes)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO recovery_snapshots (key, payload, saved_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET payload = excluded.payload, saved_at = excluded.saved_at",
                params![SNAPSHOT_KEY, payload, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
        .await
    }

    async fn load(&self) -> Result<Option<RecoverySnapshot>, RecoveryError> {
        let payload: Option<String> = self
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT payload FROM recovery_snapshots WHERE key = ?1",
                    params![SNAPSHOT_KEY],
                    |row| row.get(0),
                )
                .optional()
                .map_err(RecoveryError::from)
            })
            .await?;

        let Some(payload) = payload else {
            return Ok(None);
        };
        match serde_json::from_str(&payload) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(e) => {
                // An unreadable record would otherwise fail every boot
                tracing::warn!(error = %e, bytes = payload.len(), "Discarding corrupt recovery snapshot");
                self.clear().await?;
                Ok(None)
            }
        }
    }

    async fn clear(&self) -> Result<(), RecoveryError> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM recovery_snapshots WHERE key = ?1",
                params![SNAPSHOT_KEY],
            )?;
            Ok(())
        })
        .await
    }
}
