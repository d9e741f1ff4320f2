//! The replicated state machine.
//!
//! Wraps the store behind the callback surface a consensus library drives:
//! `pre_commit` in log order ahead of consensus, `commit` once an entry is
//! replicated, `rollback` when a leader change discards a suffix, plus
//! snapshot creation/installation. The store sits behind an `RwLock` so the
//! snapshot worker can serialize from a read guard while the consensus
//! thread keeps committing through write guards; snapshot mode keeps the
//! frozen prefix stable across that interleaving.

use crate::requests::RequestForSession;
use crate::snapshot_manager::{SnapshotManager, SnapshotMeta, StorageSnapshot};
use common::{CoordinationError, CoordinationResult, CoordinationSettings, SessionId, Zxid};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use store::ResponseForSession;
use tracing::{error, info};

/// Sink for the response/watch-trigger tuples produced on commit; drained
/// by the session layer.
pub type ResponsesSender = Sender<ResponseForSession>;

/// Serialization job handed to the snapshot worker.
pub struct CreateSnapshotTask {
    snapshot: StorageSnapshot,
    storage: Arc<RwLock<store::Storage>>,
    manager: SnapshotManager,
    done: Box<dyn FnOnce(bool) + Send>,
}

impl CreateSnapshotTask {
    pub fn last_log_idx(&self) -> u64 {
        self.snapshot.meta.last_log_idx
    }

    /// Serializes and persists the snapshot, reports through the completion
    /// callback, then releases the store's snapshot mode.
    pub fn run(self) {
        let result = {
            let storage = self.storage.read().expect("storage lock poisoned");
            self.manager
                .serialize_snapshot_to_buffer(&storage, &self.snapshot)
                .and_then(|buf| {
                    self.manager
                        .serialize_snapshot_buffer_to_disk(&buf, self.snapshot.meta.last_log_idx)
                })
        };
        let ok = match &result {
            Ok(_) => true,
            Err(e) => {
                error!(error = %e, "snapshot creation failed");
                false
            }
        };

        {
            let mut storage = self.storage.write().expect("storage lock poisoned");
            storage.clear_garbage_after_snapshot();
            storage.container.disable_snapshot_mode();
        }
        (self.done)(ok);
    }
}

/// Runs queued snapshot tasks until the sending side closes.
pub fn spawn_snapshot_worker(rx: Receiver<CreateSnapshotTask>) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("snapshot-worker".into())
        .spawn(move || {
            while let Ok(task) = rx.recv() {
                task.run();
            }
        })
        .expect("spawn snapshot worker")
}

pub struct StateMachine {
    storage: Arc<RwLock<store::Storage>>,
    snapshot_manager: SnapshotManager,
    responses_tx: ResponsesSender,
    snapshots_tx: Sender<CreateSnapshotTask>,
    last_commit_index: AtomicU64,
    /// Highest zxid that went through `pre_commit` locally; commits beyond
    /// it (log replay after restore) preprocess on the spot.
    last_preprocessed_zxid: AtomicI64,
}

impl StateMachine {
    pub fn new(
        responses_tx: ResponsesSender,
        snapshots_tx: Sender<CreateSnapshotTask>,
        settings: &CoordinationSettings,
    ) -> CoordinationResult<Self> {
        let snapshot_manager = SnapshotManager::new(
            &settings.snapshot_storage_path,
            settings.snapshots_to_keep,
            settings.compress_logs,
        )?;
        let storage = Arc::new(RwLock::new(store::Storage::new(
            settings.dead_session_check_period_ms,
            store::ServerState::Init,
        )));
        Ok(Self {
            storage,
            snapshot_manager,
            responses_tx,
            snapshots_tx,
            last_commit_index: AtomicU64::new(0),
            last_preprocessed_zxid: AtomicI64::new(0),
        })
    }

    /// Restores the newest snapshot, if any, and opens the store for
    /// request traffic.
    pub fn init(&self) -> CoordinationResult<()> {
        if let Some((restored, meta, _cluster)) =
            self.snapshot_manager.restore_from_latest_snapshot()?
        {
            self.last_commit_index
                .store(meta.last_log_idx, Ordering::Release);
            self.last_preprocessed_zxid
                .store(restored.zxid, Ordering::Release);
            *self.storage.write().expect("storage lock poisoned") = restored;
            info!(last_log_idx = meta.last_log_idx, "state machine restored");
        }
        self.storage
            .write()
            .expect("storage lock poisoned")
            .set_server_state(store::ServerState::Running);
        Ok(())
    }

    /// Speculatively applies a not-yet-committed entry. Never blocks on I/O.
    pub fn pre_commit(&self, log_idx: u64, buf: &[u8]) -> CoordinationResult<()> {
        let request = RequestForSession::decode(buf)?;
        let mut storage = self.storage.write().expect("storage lock poisoned");
        storage.preprocess_request(
            &request.request,
            request.session_id,
            request.time_ms,
            request.zxid,
            true,
            request.digest,
            Some(log_idx),
        );
        self.last_preprocessed_zxid
            .fetch_max(request.zxid, Ordering::AcqRel);
        Ok(())
    }

    /// Applies a committed entry and queues its responses.
    pub fn commit(&self, log_idx: u64, buf: &[u8]) -> CoordinationResult<()> {
        let request = RequestForSession::decode(buf)?;
        let mut storage = self.storage.write().expect("storage lock poisoned");
        if request.zxid > self.last_preprocessed_zxid.load(Ordering::Acquire) {
            storage.preprocess_request(
                &request.request,
                request.session_id,
                request.time_ms,
                request.zxid,
                true,
                request.digest,
                Some(log_idx),
            );
            self.last_preprocessed_zxid
                .fetch_max(request.zxid, Ordering::AcqRel);
        }
        let responses = storage.process_request(
            &request.request,
            request.session_id,
            Some(request.zxid),
            true,
            false,
        );
        drop(storage);
        for response in responses {
            let _ = self.responses_tx.send(response);
        }
        self.last_commit_index.store(log_idx, Ordering::Release);
        Ok(())
    }

    /// Discards the speculative effects of an entry that lost consensus.
    pub fn rollback(&self, _log_idx: u64, buf: &[u8]) -> CoordinationResult<()> {
        let request = RequestForSession::decode(buf)?;
        self.storage
            .write()
            .expect("storage lock poisoned")
            .rollback_request(request.zxid);
        Ok(())
    }

    /// Freezes the current state and queues its serialization; `done` fires
    /// from the worker with the outcome.
    pub fn create_snapshot(
        &self,
        meta: SnapshotMeta,
        done: impl FnOnce(bool) + Send + 'static,
    ) -> CoordinationResult<()> {
        let snapshot = {
            let mut storage = self.storage.write().expect("storage lock poisoned");
            StorageSnapshot::capture(&mut storage, meta)
        };
        let task = CreateSnapshotTask {
            snapshot,
            storage: Arc::clone(&self.storage),
            manager: self.snapshot_manager.clone(),
            done: Box::new(done),
        };
        self.snapshots_tx.send(task).map_err(|_| {
            CoordinationError::Snapshot("snapshot worker is gone".into())
        })?;
        Ok(())
    }

    /// Replaces the store with the snapshot `meta` points at.
    pub fn apply_snapshot(&self, meta: &SnapshotMeta) -> CoordinationResult<()> {
        let buf = self
            .snapshot_manager
            .deserialize_snapshot_buffer_from_disk(meta.last_log_idx)?;
        let (mut restored, _, _) = self.snapshot_manager.deserialize_snapshot_from_buffer(&buf)?;
        restored.set_server_state(store::ServerState::Running);
        self.last_preprocessed_zxid
            .store(restored.zxid, Ordering::Release);
        *self.storage.write().expect("storage lock poisoned") = restored;
        self.last_commit_index
            .store(meta.last_log_idx, Ordering::Release);
        Ok(())
    }

    pub fn last_commit_index(&self) -> u64 {
        self.last_commit_index.load(Ordering::Acquire)
    }

    pub fn next_zxid(&self) -> Zxid {
        self.storage
            .read()
            .expect("storage lock poisoned")
            .next_zxid()
    }

    /// Sessions whose deadline passed; the host turns each into an internal
    /// close entry appended to the log.
    pub fn expired_sessions(&self) -> Vec<SessionId> {
        self.storage
            .write()
            .expect("storage lock poisoned")
            .expired_sessions()
    }

    /// Shared handle to the store; locking discipline is the caller's
    /// responsibility.
    pub fn storage(&self) -> Arc<RwLock<store::Storage>> {
        Arc::clone(&self.storage)
    }
}
