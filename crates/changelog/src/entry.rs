//! Replicated log entries.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Discriminates consensus-internal entries from application payloads.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum EntryKind {
    #[default]
    Data = 0,
    Config = 1,
}

impl EntryKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(EntryKind::Data),
            1 => Some(EntryKind::Config),
            _ => None,
        }
    }
}

/// One entry of the replicated log: a term plus an opaque payload. The
/// payload is only interpreted by the state machine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub kind: EntryKind,
    pub data: Bytes,
}

impl LogEntry {
    pub fn new(term: u64, data: impl Into<Bytes>) -> Self {
        Self {
            term,
            kind: EntryKind::Data,
            data: data.into(),
        }
    }

    pub fn config(term: u64, data: impl Into<Bytes>) -> Self {
        Self {
            term,
            kind: EntryKind::Config,
            data: data.into(),
        }
    }
}
