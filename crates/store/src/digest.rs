//! Running digest over committed state.
//!
//! Each node hashes to a 64-bit value; the container digest is the wrapping
//! sum of all node hashes, so add/remove/replace update it incrementally
//! and the result is independent of iteration order. The seeds are fixed:
//! two replicas hashing the same state must agree across processes.

use crate::node::Node;
use ahash::RandomState;
use std::hash::{BuildHasher, Hasher};

/// Entry-payload marker for whether a digest is carried and how to read it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum DigestVersion {
    NoDigest = 0,
    V1 = 1,
}

impl DigestVersion {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(DigestVersion::NoDigest),
            1 => Some(DigestVersion::V1),
            _ => None,
        }
    }
}

fn hasher() -> impl Hasher {
    RandomState::with_seeds(
        0x6b65_6570_6572_0001,
        0x6469_6765_7374_0002,
        0x7472_6565_0000_0003,
        0x7a78_6964_0000_0004,
    )
    .build_hasher()
}

/// Hash of one `(path, node)` pair over data and the replicated stat fields.
pub fn node_digest(path: &str, node: &Node) -> u64 {
    let mut h = hasher();
    h.write(path.as_bytes());
    h.write(&node.data);
    let stat = &node.stat;
    h.write_i64(stat.czxid);
    h.write_i64(stat.mzxid);
    h.write_i64(stat.ctime);
    h.write_i64(stat.mtime);
    h.write_i32(stat.version);
    h.write_i32(stat.cversion);
    h.write_i32(stat.aversion);
    h.write_i64(stat.ephemeral_owner);
    h.write_i32(stat.num_children);
    h.write_i64(stat.pzxid);
    h.finish()
}
