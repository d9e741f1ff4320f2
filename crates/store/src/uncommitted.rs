//! The uncommitted delta layer.
//!
//! Preprocessing turns each request into a list of operations keyed by its
//! zxid. The operations are plain data, never closures: a peer can replay
//! them verbatim, and a rollback only has to drop them. A per-path
//! projection sits on top so `get_node` sees the would-be state without
//! replaying the whole list.

use crate::node::Node;
use crate::snapshot_map::SnapshotableMap;
use bytes::Bytes;
use common::{SessionId, Zxid};
use protocol::{Acl, AuthId, ErrorCode, Stat};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

/// One step of state change produced by preprocess and applied by commit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    CreateNode {
        path: String,
        data: Bytes,
        acls: Vec<Acl>,
        stat: Stat,
    },
    RemoveNode {
        path: String,
        prev_version: i32,
    },
    /// Post-image of a node's data and stat.
    UpdateNode {
        path: String,
        data: Bytes,
        stat: Stat,
    },
    SetAcl {
        path: String,
        acls: Vec<Acl>,
        aversion: i32,
    },
    AddAuth {
        session_id: SessionId,
        auth_id: AuthId,
    },
    CloseSession {
        session_id: SessionId,
    },
    Error {
        error: ErrorCode,
    },
    /// Per-sub-operation deltas of a successful multi request.
    SubDeltas {
        subs: Vec<Vec<Operation>>,
    },
    /// A rejected multi: per-sub error codes, no state change.
    FailedMulti {
        errors: Vec<ErrorCode>,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    pub zxid: Zxid,
    pub operation: Operation,
}

/// Projected node state: what the node will look like once everything up to
/// a given zxid commits.
#[derive(Clone, Debug, PartialEq)]
pub struct UncommittedNode {
    pub data: Bytes,
    pub stat: Stat,
    pub acls: Vec<Acl>,
}

impl From<&Node> for UncommittedNode {
    fn from(node: &Node) -> Self {
        Self {
            data: node.data.clone(),
            stat: node.stat,
            acls: node.acls.clone(),
        }
    }
}

#[derive(Default)]
pub struct UncommittedState {
    deltas: VecDeque<Delta>,
    /// `Some` = node exists with this state once committed, `None` = a
    /// pending delta removes it.
    nodes: HashMap<String, Option<UncommittedNode>>,
    session_auths: HashMap<SessionId, Vec<AuthId>>,
}

impl UncommittedState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    pub fn last_zxid(&self) -> Option<Zxid> {
        self.deltas.back().map(|d| d.zxid)
    }

    pub fn deltas(&self) -> impl Iterator<Item = &Delta> {
        self.deltas.iter()
    }

    /// Whether a pending delta touches `path`.
    pub fn tracks_node(&self, path: &str) -> bool {
        self.nodes.contains_key(path)
    }

    /// The would-be state of `path` with every pending delta applied.
    pub fn get_node(
        &self,
        committed: &SnapshotableMap<Node>,
        path: &str,
    ) -> Option<UncommittedNode> {
        match self.nodes.get(path) {
            Some(projected) => projected.clone(),
            None => committed.get(path).map(UncommittedNode::from),
        }
    }

    pub fn get_acls(&self, committed: &SnapshotableMap<Node>, path: &str) -> Option<Vec<Acl>> {
        self.get_node(committed, path).map(|n| n.acls)
    }

    /// Digest identities the session holds counting uncommitted `AddAuth`s.
    pub fn session_auths(&self, session_id: SessionId) -> &[AuthId] {
        self.session_auths
            .get(&session_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn add_delta(&mut self, committed: &SnapshotableMap<Node>, delta: Delta) {
        self.project(committed, &delta.operation);
        self.deltas.push_back(delta);
    }

    /// Drops the deltas of `zxid` (a contiguous suffix) and rebuilds the
    /// projection from what remains.
    pub fn rollback(&mut self, committed: &SnapshotableMap<Node>, zxid: Zxid) {
        while matches!(self.deltas.back(), Some(d) if d.zxid == zxid) {
            self.deltas.pop_back();
        }
        self.rebuild(committed);
    }

    /// Removes and returns the operations of `zxid`, which must be the
    /// oldest pending transaction. Callers apply them to the committed
    /// container and then call [`UncommittedState::rebuild`].
    pub fn commit_pop(&mut self, zxid: Zxid) -> Vec<Operation> {
        debug_assert!(
            self.deltas.front().map_or(true, |d| d.zxid >= zxid),
            "commit out of order"
        );
        let mut operations = Vec::new();
        while matches!(self.deltas.front(), Some(d) if d.zxid == zxid) {
            operations.push(self.deltas.pop_front().expect("front checked").operation);
        }
        operations
    }

    /// Recomputes the projection from the committed state and the remaining
    /// deltas.
    pub fn rebuild(&mut self, committed: &SnapshotableMap<Node>) {
        self.nodes.clear();
        self.session_auths.clear();
        let deltas = std::mem::take(&mut self.deltas);
        for delta in &deltas {
            self.project(committed, &delta.operation);
        }
        self.deltas = deltas;
    }

    fn project(&mut self, committed: &SnapshotableMap<Node>, operation: &Operation) {
        match operation {
            Operation::CreateNode {
                path,
                data,
                acls,
                stat,
            } => {
                self.nodes.insert(
                    path.clone(),
                    Some(UncommittedNode {
                        data: data.clone(),
                        stat: *stat,
                        acls: acls.clone(),
                    }),
                );
            }
            Operation::RemoveNode { path, .. } => {
                self.nodes.insert(path.clone(), None);
            }
            Operation::UpdateNode { path, data, stat } => {
                let mut node = self
                    .get_node(committed, path)
                    .expect("update of a node known to exist");
                node.data = data.clone();
                node.stat = *stat;
                self.nodes.insert(path.clone(), Some(node));
            }
            Operation::SetAcl {
                path,
                acls,
                aversion,
            } => {
                let mut node = self
                    .get_node(committed, path)
                    .expect("set_acl of a node known to exist");
                node.acls = acls.clone();
                node.stat.aversion = *aversion;
                self.nodes.insert(path.clone(), Some(node));
            }
            Operation::AddAuth {
                session_id,
                auth_id,
            } => {
                self.session_auths
                    .entry(*session_id)
                    .or_default()
                    .push(auth_id.clone());
            }
            Operation::SubDeltas { subs } => {
                for sub in subs {
                    for op in sub {
                        self.project(committed, op);
                    }
                }
            }
            Operation::CloseSession { .. }
            | Operation::Error { .. }
            | Operation::FailedMulti { .. } => {}
        }
    }
}
