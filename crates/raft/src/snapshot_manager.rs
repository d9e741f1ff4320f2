//! Snapshot serialization, retention and restore.
//!
//! A snapshot file `snapshot_<last_log_idx>.bin[.zstd]` is a self-describing
//! blob:
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │ magic: u32, format version: u8              │
//! │ last_log_idx: u64, last_log_term: u64       │
//! │ session_id_counter: i64, zxid: i64          │
//! │ digest: u64                                 │
//! │ sessions: count + (id, timeout_ms) pairs    │
//! │ nodes: count + pre-order (path|data|acls|   │
//! │        stat), children sorted per level     │
//! │ cluster config blob (bincode, may be empty) │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! Serialization reads the *frozen* prefix of the container (see the
//! snapshot mode of `store`), so it can run on a worker thread while
//! commits keep landing as shadow entries. Sessions and counters are
//! captured eagerly at [`StorageSnapshot::capture`] time instead.
//!
//! Ephemeral registrations and child lists are not serialized; both are
//! rebuilt from node paths and stats on restore.

use crate::state_manager::RaftServerConfig;
use bincode::config::{self, Config};
use common::{CoordinationError, CoordinationResult, SessionId, Zxid};
use protocol::{wire, Acl, Stat};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use store::{Node, ServerState, Storage};
use tracing::{info, warn};

const SNAPSHOT_MAGIC: u32 = 0x50414E53; // "SNAP"
const FORMAT_VERSION: u8 = 1;
const MAX_BLOB_FIELD: usize = 1024 * 1024 * 1024;

fn bincode_config() -> impl Config {
    config::legacy()
}

/// Identity of one snapshot, as the consensus layer sees it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SnapshotMeta {
    pub last_log_idx: u64,
    pub last_log_term: u64,
}

impl SnapshotMeta {
    pub fn new(last_log_idx: u64, last_log_term: u64) -> Self {
        Self {
            last_log_idx,
            last_log_term,
        }
    }
}

/// Frozen view of a store, taken synchronously on the state-machine thread.
/// The node contents stay in the container (protected by snapshot mode);
/// everything else is copied out here because commits keep mutating it.
pub struct StorageSnapshot {
    pub meta: SnapshotMeta,
    pub session_id_counter: SessionId,
    pub zxid: Zxid,
    pub session_and_timeout: HashMap<SessionId, i64>,
    pub snapshot_container_size: usize,
    pub nodes_digest: u64,
    pub cluster_config: Vec<RaftServerConfig>,
}

impl StorageSnapshot {
    /// Enables snapshot mode on the container and captures the volatile
    /// state. The caller owns ending the mode after serialization (or on
    /// failure) via `clear_garbage_after_snapshot` + `disable_snapshot_mode`.
    pub fn capture(storage: &mut Storage, meta: SnapshotMeta) -> Self {
        let up_to_version = storage.container.current_version();
        storage.container.enable_snapshot_mode(up_to_version);
        let (snapshot_container_size, _) = storage.container.snapshot_size_with_version();
        Self {
            meta,
            session_id_counter: storage.session_id_counter,
            zxid: storage.zxid,
            session_and_timeout: storage.session_and_timeout.clone(),
            snapshot_container_size,
            nodes_digest: storage.nodes_digest,
            cluster_config: Vec::new(),
        }
    }
}

#[derive(Clone)]
pub struct SnapshotManager {
    snapshot_dir: PathBuf,
    snapshots_to_keep: usize,
    compress: bool,
}

impl SnapshotManager {
    pub fn new(
        snapshot_dir: impl AsRef<Path>,
        snapshots_to_keep: usize,
        compress: bool,
    ) -> CoordinationResult<Self> {
        let snapshot_dir = snapshot_dir.as_ref().to_path_buf();
        fs::create_dir_all(&snapshot_dir)?;
        Ok(Self {
            snapshot_dir,
            snapshots_to_keep,
            compress,
        })
    }

    /// Serializes the frozen view of `storage` described by `snapshot`.
    /// Byte-for-byte deterministic for a given state.
    pub fn serialize_snapshot_to_buffer(
        &self,
        storage: &Storage,
        snapshot: &StorageSnapshot,
    ) -> CoordinationResult<Vec<u8>> {
        let mut buf = Vec::new();
        wire::write_u32(&mut buf, SNAPSHOT_MAGIC)?;
        wire::write_u8(&mut buf, FORMAT_VERSION)?;
        wire::write_u64(&mut buf, snapshot.meta.last_log_idx)?;
        wire::write_u64(&mut buf, snapshot.meta.last_log_term)?;
        wire::write_i64(&mut buf, snapshot.session_id_counter)?;
        wire::write_i64(&mut buf, snapshot.zxid)?;
        wire::write_u64(&mut buf, snapshot.nodes_digest)?;

        let mut sessions: Vec<(SessionId, i64)> = snapshot
            .session_and_timeout
            .iter()
            .map(|(id, timeout)| (*id, *timeout))
            .collect();
        sessions.sort_unstable();
        wire::write_u32(&mut buf, sessions.len() as u32)?;
        for (session_id, timeout_ms) in sessions {
            wire::write_i64(&mut buf, session_id)?;
            wire::write_i64(&mut buf, timeout_ms)?;
        }

        // The first `snapshot_container_size` list positions are the frozen
        // view; entries shadowed after the capture still hold their old
        // value there.
        let mut frozen: HashMap<&str, &Node> = HashMap::new();
        for (path, node, _active) in storage
            .container
            .iter()
            .take(snapshot.snapshot_container_size)
        {
            frozen.insert(path, node);
        }

        let node_count = frozen.len();
        wire::write_u64(&mut buf, node_count as u64)?;
        let mut written = 0usize;
        let mut stack: Vec<String> = vec!["/".to_string()];
        while let Some(path) = stack.pop() {
            let Some(node) = frozen.remove(path.as_str()) else {
                continue;
            };
            write_node(&mut buf, &path, node)?;
            written += 1;
            let mut children: Vec<&String> = node.children.iter().collect();
            children.sort_unstable();
            for child in children.into_iter().rev() {
                let child_path = if path == "/" {
                    format!("/{child}")
                } else {
                    format!("{path}/{child}")
                };
                stack.push(child_path);
            }
        }
        if !frozen.is_empty() {
            // Nodes disconnected from the frozen root; keep them anyway.
            warn!(count = frozen.len(), "snapshot serializing unreachable nodes");
            let mut rest: Vec<(&str, &Node)> = frozen.into_iter().collect();
            rest.sort_unstable_by_key(|(path, _)| path.to_string());
            for (path, node) in rest {
                write_node(&mut buf, path, node)?;
                written += 1;
            }
        }
        debug_assert_eq!(written, node_count);

        let cluster = bincode::serde::encode_to_vec(&snapshot.cluster_config, bincode_config())
            .map_err(|e| CoordinationError::Snapshot(format!("encode cluster config: {e}")))?;
        wire::write_bytes(&mut buf, &cluster)?;
        Ok(buf)
    }

    /// Writes a serialized snapshot as `snapshot_<idx>.bin[.zstd]` and
    /// applies the retention policy.
    pub fn serialize_snapshot_buffer_to_disk(
        &self,
        buf: &[u8],
        last_log_idx: u64,
    ) -> CoordinationResult<PathBuf> {
        let name = snapshot_file_name(last_log_idx, self.compress);
        let path = self.snapshot_dir.join(&name);
        let tmp_path = self.snapshot_dir.join(format!("{name}.tmp"));

        let on_disk = if self.compress {
            zstd::encode_all(buf, 0)
                .map_err(|e| CoordinationError::Snapshot(format!("compress snapshot: {e}")))?
        } else {
            buf.to_vec()
        };

        let mut file = File::create(&tmp_path)?;
        file.write_all(&on_disk)?;
        file.sync_all()?;
        fs::rename(&tmp_path, &path)?;
        File::open(&self.snapshot_dir)?.sync_all()?;
        info!(?path, last_log_idx, "snapshot written");

        self.remove_outdated_snapshots()?;
        Ok(path)
    }

    /// Reads the snapshot taken at `last_log_idx`, whichever format it was
    /// written in.
    pub fn deserialize_snapshot_buffer_from_disk(
        &self,
        last_log_idx: u64,
    ) -> CoordinationResult<Vec<u8>> {
        for compressed in [self.compress, !self.compress] {
            let path = self
                .snapshot_dir
                .join(snapshot_file_name(last_log_idx, compressed));
            if !path.exists() {
                continue;
            }
            let mut raw = Vec::new();
            File::open(&path)?.read_to_end(&mut raw)?;
            return if compressed {
                zstd::decode_all(raw.as_slice()).map_err(|e| {
                    CoordinationError::Snapshot(format!("corrupt snapshot {path:?}: {e}"))
                })
            } else {
                Ok(raw)
            };
        }
        Err(CoordinationError::Snapshot(format!(
            "no snapshot for index {last_log_idx}"
        )))
    }

    /// Rebuilds a store from a snapshot blob.
    pub fn deserialize_snapshot_from_buffer(
        &self,
        buf: &[u8],
    ) -> CoordinationResult<(Storage, SnapshotMeta, Vec<RaftServerConfig>)> {
        let corrupt = |what: &str| CoordinationError::Snapshot(format!("corrupt snapshot: {what}"));

        let mut r = Cursor::new(buf);
        if wire::read_u32(&mut r).map_err(|_| corrupt("missing header"))? != SNAPSHOT_MAGIC {
            return Err(corrupt("bad magic"));
        }
        if wire::read_u8(&mut r).map_err(|_| corrupt("missing version"))? != FORMAT_VERSION {
            return Err(corrupt("unsupported version"));
        }
        let meta = SnapshotMeta {
            last_log_idx: wire::read_u64(&mut r).map_err(|_| corrupt("last_log_idx"))?,
            last_log_term: wire::read_u64(&mut r).map_err(|_| corrupt("last_log_term"))?,
        };
        let session_id_counter = wire::read_i64(&mut r).map_err(|_| corrupt("session counter"))?;
        let zxid = wire::read_i64(&mut r).map_err(|_| corrupt("zxid"))?;
        let digest = wire::read_u64(&mut r).map_err(|_| corrupt("digest"))?;

        let mut storage = Storage::new(500, ServerState::Init);

        let session_count = wire::read_u32(&mut r).map_err(|_| corrupt("session count"))?;
        for _ in 0..session_count {
            let session_id = wire::read_i64(&mut r).map_err(|_| corrupt("session id"))?;
            let timeout_ms = wire::read_i64(&mut r).map_err(|_| corrupt("session timeout"))?;
            storage.session_and_timeout.insert(session_id, timeout_ms);
            storage
                .session_expiry_queue
                .add_new_session_or_update(session_id, timeout_ms);
        }

        let node_count = wire::read_u64(&mut r).map_err(|_| corrupt("node count"))?;
        for _ in 0..node_count {
            let (path, node) = read_node(&mut r).map_err(|_| corrupt("node"))?;
            storage.insert_node_unchecked(path, node);
        }

        let cluster_bytes =
            wire::read_bytes(&mut r, MAX_BLOB_FIELD).map_err(|_| corrupt("cluster config"))?;
        let (cluster_config, _): (Vec<RaftServerConfig>, usize) =
            bincode::serde::decode_from_slice(&cluster_bytes, bincode_config())
                .map_err(|_| corrupt("cluster config"))?;

        storage.session_id_counter = session_id_counter;
        storage.zxid = zxid;
        storage.recalculate_digest();
        if digest != storage.nodes_digest {
            return Err(corrupt("state digest mismatch after restore"));
        }

        Ok((storage, meta, cluster_config))
    }

    /// Picks the highest-indexed snapshot on disk. A snapshot that exists
    /// but fails to load is an error, never silently skipped.
    pub fn restore_from_latest_snapshot(
        &self,
    ) -> CoordinationResult<Option<(Storage, SnapshotMeta, Vec<RaftServerConfig>)>> {
        let Some(last_log_idx) = self.existing_snapshots()?.pop() else {
            return Ok(None);
        };
        let buf = self.deserialize_snapshot_buffer_from_disk(last_log_idx)?;
        let restored = self.deserialize_snapshot_from_buffer(&buf)?;
        info!(last_log_idx, "restored from snapshot");
        Ok(Some(restored))
    }

    /// Snapshot indexes present on disk, ascending.
    pub fn existing_snapshots(&self) -> CoordinationResult<Vec<u64>> {
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.snapshot_dir)? {
            let path = entry?.path();
            if let Some(idx) = parse_snapshot_file_name(&path) {
                found.push(idx);
            }
        }
        found.sort_unstable();
        found.dedup();
        Ok(found)
    }

    fn remove_outdated_snapshots(&self) -> CoordinationResult<()> {
        let snapshots = self.existing_snapshots()?;
        if snapshots.len() <= self.snapshots_to_keep {
            return Ok(());
        }
        for idx in &snapshots[..snapshots.len() - self.snapshots_to_keep] {
            for compressed in [false, true] {
                let path = self.snapshot_dir.join(snapshot_file_name(*idx, compressed));
                if path.exists() {
                    info!(?path, "removing outdated snapshot");
                    fs::remove_file(&path)?;
                }
            }
        }
        Ok(())
    }
}

fn snapshot_file_name(last_log_idx: u64, compressed: bool) -> String {
    if compressed {
        format!("snapshot_{last_log_idx}.bin.zstd")
    } else {
        format!("snapshot_{last_log_idx}.bin")
    }
}

fn parse_snapshot_file_name(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    let stem = name
        .strip_suffix(".zstd")
        .unwrap_or(name)
        .strip_suffix(".bin")?;
    stem.strip_prefix("snapshot_")?.parse().ok()
}

fn write_node(buf: &mut Vec<u8>, path: &str, node: &Node) -> std::io::Result<()> {
    wire::write_string(buf, path)?;
    wire::write_bytes(buf, &node.data)?;
    wire::write_u32(buf, node.acls.len() as u32)?;
    for acl in &node.acls {
        wire::write_u32(buf, acl.permissions)?;
        wire::write_string(buf, &acl.scheme)?;
        wire::write_string(buf, &acl.id)?;
    }
    let stat = &node.stat;
    wire::write_i64(buf, stat.czxid)?;
    wire::write_i64(buf, stat.mzxid)?;
    wire::write_i64(buf, stat.ctime)?;
    wire::write_i64(buf, stat.mtime)?;
    wire::write_i32(buf, stat.version)?;
    wire::write_i32(buf, stat.cversion)?;
    wire::write_i32(buf, stat.aversion)?;
    wire::write_i64(buf, stat.ephemeral_owner)?;
    wire::write_i32(buf, stat.data_length)?;
    wire::write_i32(buf, stat.num_children)?;
    wire::write_i64(buf, stat.pzxid)?;
    Ok(())
}

fn read_node<R: Read>(r: &mut R) -> std::io::Result<(String, Node)> {
    let path = wire::read_string(r, MAX_BLOB_FIELD)?;
    let data = wire::read_bytes(r, MAX_BLOB_FIELD)?;
    let acl_count = wire::read_u32(r)?;
    let mut acls = Vec::with_capacity(acl_count as usize);
    for _ in 0..acl_count {
        let permissions = wire::read_u32(r)?;
        let scheme = wire::read_string(r, MAX_BLOB_FIELD)?;
        let id = wire::read_string(r, MAX_BLOB_FIELD)?;
        acls.push(Acl::new(permissions, scheme, id));
    }
    let stat = Stat {
        czxid: wire::read_i64(r)?,
        mzxid: wire::read_i64(r)?,
        ctime: wire::read_i64(r)?,
        mtime: wire::read_i64(r)?,
        version: wire::read_i32(r)?,
        cversion: wire::read_i32(r)?,
        aversion: wire::read_i32(r)?,
        ephemeral_owner: wire::read_i64(r)?,
        data_length: wire::read_i32(r)?,
        num_children: wire::read_i32(r)?,
        pzxid: wire::read_i64(r)?,
    };
    let mut node = Node::new(data);
    node.acls = acls;
    node.stat = stat;
    Ok((path, node))
}
