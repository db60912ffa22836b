//! Environment configuration

use crate::store::DEFAULT_ARCHIVE_THRESHOLD;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default cap on the serialized recovery snapshot
pub const DEFAULT_SNAPSHOT_MAX_BYTES: usize = 4 * 1024 * 1024;

/// Default heartbeat age after which a check counts as stale
pub const DEFAULT_HEARTBEAT_STALE_SECS: u64 = 5;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{var} must be a positive integer, got `{value}`")]
    InvalidNumber { var: &'static str, value: String },
}

/// Runtime settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatConfig {
    /// Assistant command to launch
    pub cli: String,
    /// Working directory for the assistant process
    pub work_dir: Option<PathBuf>,
    /// Recovery database location
    pub db_path: PathBuf,
    pub archive_threshold: usize,
    pub snapshot_max_bytes: usize,
    pub heartbeat_stale: Duration,
}

impl ChatConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let db_path = lookup("STREAMDESK_DB_PATH").map_or_else(
            || {
                let home = lookup("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(format!("{home}/.streamdesk/recovery.db"))
            },
            PathBuf::from,
        );

        Ok(Self {
            cli: lookup("STREAMDESK_CLI")
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| "claude".to_string()),
            work_dir: lookup("STREAMDESK_WORKDIR")
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from),
            db_path,
            archive_threshold: positive(
                &lookup,
                "STREAMDESK_ARCHIVE_THRESHOLD",
                DEFAULT_ARCHIVE_THRESHOLD,
            )?,
            snapshot_max_bytes: positive(
                &lookup,
                "STREAMDESK_SNAPSHOT_MAX_BYTES",
                DEFAULT_SNAPSHOT_MAX_BYTES,
            )?,
            heartbeat_stale: Duration::from_secs(positive(
                &lookup,
                "STREAMDESK_HEARTBEAT_STALE_SECS",
                DEFAULT_HEARTBEAT_STALE_SECS,
            )?),
        })
    }
}

fn positive<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default,
{
    let Some(raw) = lookup(var) else {
        return Ok(default);
    };
    match raw.trim().parse::<T>() {
        Ok(value) if value > T::default() => Ok(value),
        _ => Err(ConfigError::InvalidNumber { var, value: raw }),
    }
}
