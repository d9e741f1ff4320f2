//! Durable server state and cluster configuration parsing.

use common::{CoordinationError, CoordinationResult};
use protocol::wire;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tracing::warn;

const STATE_MAGIC: u32 = 0x41545353; // "SSTA"
const STATE_VERSION: u8 = 1;
/// magic + version + term + voted_for + election flag + crc32.
const STATE_FILE_SIZE: u64 = 4 + 1 + 8 + 4 + 1 + 4;

/// Term/vote state the consensus library must find again after a restart.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SrvState {
    pub term: u64,
    pub voted_for: i32,
    pub election_timer_allowed: bool,
}

/// Owns the `state` file. Reads are tolerant of a missing file (a fresh
/// server) but a corrupted one is surfaced: silently starting with a blank
/// vote can elect two leaders for one term.
pub struct StateManager {
    state_file: PathBuf,
}

impl StateManager {
    pub fn new(state_dir: impl AsRef<Path>) -> CoordinationResult<Self> {
        let state_dir = state_dir.as_ref();
        fs::create_dir_all(state_dir)?;
        Ok(Self {
            state_file: state_dir.join("state"),
        })
    }

    pub fn state_file_path(&self) -> &Path {
        &self.state_file
    }

    pub fn save_state(&self, state: &SrvState) -> CoordinationResult<()> {
        let mut payload = Vec::new();
        wire::write_u32(&mut payload, STATE_MAGIC)?;
        wire::write_u8(&mut payload, STATE_VERSION)?;
        wire::write_u64(&mut payload, state.term)?;
        wire::write_i32(&mut payload, state.voted_for)?;
        wire::write_u8(&mut payload, state.election_timer_allowed as u8)?;
        let checksum = crc32fast::hash(&payload);
        wire::write_u32(&mut payload, checksum)?;

        let tmp = self.state_file.with_extension("tmp");
        fs::write(&tmp, &payload)?;
        File::open(&tmp)?.sync_all()?;
        fs::rename(&tmp, &self.state_file)?;
        if let Some(dir) = self.state_file.parent() {
            File::open(dir)?.sync_all()?;
        }
        Ok(())
    }

    /// `Ok(None)` when no usable state exists: the file is missing or has
    /// the wrong size. A well-sized file that fails validation panics in
    /// debug builds and reads as `None` in release builds.
    pub fn read_state(&self) -> CoordinationResult<Option<SrvState>> {
        let raw = match fs::read(&self.state_file) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if raw.len() as u64 != STATE_FILE_SIZE {
            warn!(
                len = raw.len(),
                expected = STATE_FILE_SIZE,
                "state file has unexpected size, ignoring it"
            );
            return Ok(None);
        }

        let (payload, stored_crc) = raw.split_at(raw.len() - 4);
        let stored_crc = u32::from_le_bytes(stored_crc.try_into().expect("4 bytes"));
        let mut r = Cursor::new(payload);
        let magic = wire::read_u32(&mut r)?;
        let version = wire::read_u8(&mut r)?;
        let valid =
            magic == STATE_MAGIC && version == STATE_VERSION && crc32fast::hash(payload) == stored_crc;
        if !valid {
            if cfg!(debug_assertions) {
                panic!("corrupted state file {:?}", self.state_file);
            }
            warn!(file = ?self.state_file, "corrupted state file, ignoring it");
            return Ok(None);
        }

        let term = wire::read_u64(&mut r)?;
        let voted_for = wire::read_i32(&mut r)?;
        let election_timer_allowed = wire::read_u8(&mut r)? != 0;
        Ok(Some(SrvState {
            term,
            voted_for,
            election_timer_allowed,
        }))
    }
}

/// One `server.<id>=<host>:<port>[;learner|participant[;priority]]` entry of
/// the cluster configuration string.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftServerConfig {
    pub id: u64,
    pub endpoint: String,
    pub learner: bool,
    pub priority: u32,
}

impl RaftServerConfig {
    pub fn new(id: u64, endpoint: impl Into<String>) -> Self {
        Self {
            id,
            endpoint: endpoint.into(),
            learner: false,
            priority: 1,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let key_value = value.strip_prefix("server.")?;
        let (id, value) = key_value.split_once('=')?;
        let id: u64 = id.parse().ok()?;
        if id == 0 {
            return None;
        }

        let mut parts = value.split(';');
        let endpoint = parts.next()?;
        // The port sits after the last colon, leaving IPv6 hosts intact.
        let (host, port) = endpoint.rsplit_once(':')?;
        if host.is_empty() || port.parse::<u16>().is_err() {
            return None;
        }

        let mut config = Self::new(id, endpoint);
        if let Some(role) = parts.next() {
            match role {
                "learner" => config.learner = true,
                "participant" => config.learner = false,
                _ => return None,
            }
        }
        if let Some(priority) = parts.next() {
            config.priority = priority.parse().ok()?;
        }
        if parts.next().is_some() {
            return None;
        }
        Some(config)
    }
}

/// Parses a comma-separated server list. Any malformed entry or duplicate
/// id / endpoint invalidates the whole list.
pub fn parse_raft_servers(value: &str) -> Vec<RaftServerConfig> {
    let mut servers: Vec<RaftServerConfig> = Vec::new();
    for part in value.split(',') {
        if part.is_empty() {
            continue;
        }
        let Some(config) = RaftServerConfig::parse(part) else {
            return Vec::new();
        };
        let duplicate = servers
            .iter()
            .any(|s| s.id == config.id || s.endpoint == config.endpoint);
        if duplicate {
            return Vec::new();
        }
        servers.push(config);
    }
    servers
}
