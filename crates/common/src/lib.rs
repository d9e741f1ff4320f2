
use serde::{Deserialize, Serialize};
use std::{io, path::PathBuf};
use thiserror::Error;

/// Client session identifier, minted by the storage's monotone counter.
/// Examples:
/// - `let bootstrap: SessionId = 1;`
/// - `let internal: SessionId = 0; // server-internal requests`
pub type SessionId = i64;

/// Transaction identifier assigned in Raft log order; total order on
/// committed operations.
pub type Zxid = i64;

/// 1-based index of an entry in the replicated log.
pub type LogIndex = u64;

/// Raft term of a log entry.
pub type Term = u64;

/// Milliseconds since the unix epoch, as carried inside log entries.
pub type Timestamp = i64;

/// Canonical error type shared across the coordination subsystems.
///
/// User-visible request failures (ZNONODE, ZBADVERSION, ...) are *not*
/// represented here; they travel as error codes inside responses. This type
/// covers the server-side failures: disk I/O, corrupt on-disk artifacts and
/// malformed configuration.
#[derive(Error, Debug)]
pub enum CoordinationError {
    #[error("changelog: {0}")]
    Changelog(String),
    #[error("log entry codec: {0}")]
    Codec(String),
    #[error("snapshot: {0}")]
    Snapshot(String),
    #[error("state file: {0}")]
    StateFile(String),
    #[error("config: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Result alias that carries a `CoordinationError`.
pub type CoordinationResult<T> = Result<T, CoordinationError>;

/// Runtime knobs of the coordination engine.
///
/// # Example
/// ```
/// use common::CoordinationSettings;
///
/// let settings = CoordinationSettings::builder()
///     .snapshot_distance(10)
///     .reserved_log_items(10)
///     .rotate_log_storage_interval(10)
///     .build();
/// ```
#[derive(Clone, Debug, Serialize, Deserialize, bon::Builder)]
pub struct CoordinationSettings {
    /// Directory holding `changelog_<from>_<to>.bin[.zstd]` files.
    #[builder(default = PathBuf::from("./logs"))]
    pub log_storage_path: PathBuf,
    /// Directory holding `snapshot_<idx>.bin[.zstd]` files.
    #[builder(default = PathBuf::from("./snapshots"))]
    pub snapshot_storage_path: PathBuf,
    /// Directory holding the durable server `state` file.
    #[builder(default = PathBuf::from("."))]
    pub state_file_path: PathBuf,
    /// Commits between two snapshots.
    #[builder(default = 100_000)]
    pub snapshot_distance: u64,
    /// Committed entries kept in the log behind the last snapshot.
    #[builder(default = 100_000)]
    pub reserved_log_items: u64,
    /// Entries per changelog file.
    #[builder(default = 100_000)]
    pub rotate_log_storage_interval: u64,
    /// Upper bound on a single changelog file in bytes; 0 disables the bound.
    #[builder(default = 0)]
    pub max_log_file_size: u64,
    /// Compress newly created changelog and snapshot files with zstd.
    #[builder(default = false)]
    pub compress_logs: bool,
    /// Snapshot files retained on disk.
    #[builder(default = 3)]
    pub snapshots_to_keep: usize,
    /// Granularity of the session expiry clock, in milliseconds.
    #[builder(default = 500)]
    pub dead_session_check_period_ms: i64,
    /// fsync appended log entries at every batch boundary.
    #[builder(default = true)]
    pub force_sync: bool,
}

impl Default for CoordinationSettings {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Convenient re-exports for downstream crates.
pub mod prelude {
    pub use crate::{
        CoordinationError, CoordinationResult, CoordinationSettings, LogIndex, SessionId, Term,
        Timestamp, Zxid,
    };
}
