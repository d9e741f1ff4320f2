//! Consensus-facing surface of the coordination core.
//!
//! [`Engine`] aggregates the change log, the replicated state machine and
//! the server-state file as sibling components; the consensus library's
//! callbacks are satisfied by forwarding to it.

pub mod requests;
pub mod snapshot_manager;
pub mod state_machine;
pub mod state_manager;

pub use requests::RequestForSession;
pub use snapshot_manager::{SnapshotManager, SnapshotMeta, StorageSnapshot};
pub use state_machine::{
    spawn_snapshot_worker, CreateSnapshotTask, ResponsesSender, StateMachine,
};
pub use state_manager::{parse_raft_servers, RaftServerConfig, SrvState, StateManager};

use changelog::{Changelog, LogEntry, LogFileSettings};
use common::{CoordinationResult, CoordinationSettings, Term};
use std::sync::mpsc::Sender;

pub struct Engine {
    pub log: Changelog,
    pub state_machine: StateMachine,
    pub state_manager: StateManager,
}

impl Engine {
    /// Builds the three components, restores the newest snapshot and
    /// recovers the log from the last applied index on.
    pub fn new(
        settings: &CoordinationSettings,
        responses_tx: ResponsesSender,
        snapshots_tx: Sender<CreateSnapshotTask>,
    ) -> CoordinationResult<Self> {
        let state_machine = StateMachine::new(responses_tx, snapshots_tx, settings)?;
        state_machine.init()?;

        let log_settings = LogFileSettings::builder()
            .force_sync(settings.force_sync)
            .compress(settings.compress_logs)
            .rotate_interval(settings.rotate_log_storage_interval)
            .max_size(settings.max_log_file_size)
            .build();
        let mut log = Changelog::new(&settings.log_storage_path, log_settings)?;
        log.init(
            state_machine.last_commit_index() + 1,
            settings.reserved_log_items,
        )?;

        let state_manager = StateManager::new(&settings.state_file_path)?;

        Ok(Self {
            log,
            state_machine,
            state_manager,
        })
    }

    /// Encodes a request and appends it as a log entry.
    pub fn append_request(
        &mut self,
        term: Term,
        request: &RequestForSession,
    ) -> CoordinationResult<u64> {
        let payload = request.encode()?;
        self.log.append(LogEntry::new(term, payload))
    }
}
