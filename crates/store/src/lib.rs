//! The snapshottable hierarchical store.
//!
//! `Storage` owns the committed tree, the session/ephemeral registries and
//! the uncommitted delta layer. Requests flow through it twice: once in
//! Raft log order through [`Storage::preprocess_request`], which validates
//! against the *speculative* state and records deltas, and once on commit
//! through [`Storage::process_request`], which applies the deltas to the
//! committed container and shapes the responses. Rollback just drops a
//! zxid's deltas.

pub mod digest;
pub mod node;
pub mod sessions;
pub mod snapshot_map;
pub mod uncommitted;


pub use digest::DigestVersion;
pub use node::Node;
pub use sessions::SessionExpiryQueue;
pub use snapshot_map::{EntrySize, SnapshotableMap};
pub use uncommitted::{Delta, Operation, UncommittedNode, UncommittedState};

use bytes::Bytes;
use common::{LogIndex, SessionId, Timestamp, Zxid};
use protocol::paths::{self, base_name, is_system_path, is_valid_path, parent_path};
use protocol::request::ResponseBody;
use protocol::{
    digest_from_credentials, Acl, AuthId, ErrorCode, FeatureFlags, ListRequestType, Permission,
    Request, Response, Stat,
};
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::debug;

/// Latest API version advertised through `/keeper/api_version`.
const API_VERSION: u8 = 3;

/// Lifecycle phase of the owning server. System paths may only be created
/// during `Init` (bootstrap and snapshot restore).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerState {
    Init,
    Running,
}

/// Watch event a committed operation would fire; dispatch to the sessions
/// actually watching is the session layer's job.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchEventType {
    Created,
    Deleted,
    Changed,
    Child,
}

#[derive(Clone, Debug, PartialEq)]
pub struct WatchTrigger {
    pub path: String,
    pub event: WatchEventType,
}

impl WatchTrigger {
    fn new(path: impl Into<String>, event: WatchEventType) -> Self {
        Self {
            path: path.into(),
            event,
        }
    }
}

/// One response produced by a request, paired with the session it belongs
/// to and the watch events the commit would fire.
#[derive(Clone, Debug)]
pub struct ResponseForSession {
    pub session_id: SessionId,
    pub response: Response,
    pub watch_triggers: Vec<WatchTrigger>,
}

pub struct Storage {
    pub container: SnapshotableMap<Node>,
    /// session -> paths of the ephemerals it owns.
    pub ephemerals: HashMap<SessionId, HashSet<String>>,
    pub session_and_timeout: HashMap<SessionId, i64>,
    pub session_and_auth: HashMap<SessionId, Vec<AuthId>>,
    pub session_expiry_queue: SessionExpiryQueue,
    pub uncommitted_state: UncommittedState,
    pub session_id_counter: SessionId,
    /// Last committed transaction id.
    pub zxid: Zxid,
    /// Running digest over the committed nodes.
    pub nodes_digest: u64,
    server_state: ServerState,
    /// Leader-provided digests awaiting verification, in zxid order.
    digest_expectations: VecDeque<(Zxid, u64, Option<LogIndex>)>,
}

impl Storage {
    pub fn new(dead_session_check_period_ms: i64, server_state: ServerState) -> Self {
        let mut storage = Self {
            container: SnapshotableMap::new(),
            ephemerals: HashMap::new(),
            session_and_timeout: HashMap::new(),
            session_and_auth: HashMap::new(),
            session_expiry_queue: SessionExpiryQueue::new(dead_session_check_period_ms),
            uncommitted_state: UncommittedState::new(),
            session_id_counter: 1,
            zxid: 0,
            nodes_digest: 0,
            server_state,
            digest_expectations: VecDeque::new(),
        };
        storage.insert_root_and_system_nodes();
        storage
    }

    pub fn server_state(&self) -> ServerState {
        self.server_state
    }

    pub fn set_server_state(&mut self, state: ServerState) {
        self.server_state = state;
    }

    /// Mints a new session id and registers its timeout.
    pub fn get_session_id(&mut self, timeout_ms: i64) -> SessionId {
        let session_id = self.session_id_counter;
        self.session_id_counter += 1;
        self.session_and_timeout.insert(session_id, timeout_ms);
        self.session_expiry_queue
            .add_new_session_or_update(session_id, timeout_ms);
        session_id
    }

    /// Next free transaction id, counting uncommitted ones.
    pub fn next_zxid(&self) -> Zxid {
        self.uncommitted_state
            .last_zxid()
            .unwrap_or(self.zxid)
            .max(self.zxid)
            + 1
    }

    /// Speculatively validates `request` against the uncommitted state and
    /// records the deltas for `new_last_zxid`. Called in log order before
    /// commit; never blocks.
    #[allow(clippy::too_many_arguments)]
    pub fn preprocess_request(
        &mut self,
        request: &Request,
        session_id: SessionId,
        time_ms: Timestamp,
        new_last_zxid: Zxid,
        check_acl: bool,
        digest: Option<u64>,
        log_idx: Option<LogIndex>,
    ) {
        let zxid = new_last_zxid;
        match request {
            Request::Close => {
                for path in self.collect_session_ephemerals(session_id) {
                    match self.remove_node_operations(&path, -1, zxid) {
                        Ok(ops) => self.add_operations(zxid, ops),
                        Err(error) => {
                            debug!(%path, ?error, "ephemeral vanished while closing session")
                        }
                    }
                }
                self.add_operations(zxid, vec![Operation::CloseSession { session_id }]);
            }
            Request::Multi { requests } => {
                self.preprocess_multi(requests, session_id, time_ms, zxid, check_acl);
            }
            _ if request.is_readonly() => {
                // Reads are evaluated at process time against the committed
                // state; they consume a zxid but leave no deltas.
            }
            _ => {
                let ops = self.preprocess_op(request, session_id, time_ms, zxid, check_acl);
                self.add_operations(zxid, ops);
            }
        }
        if let Some(expected) = digest {
            self.digest_expectations.push_back((zxid, expected, log_idx));
        }
    }

    /// Applies the deltas of `zxid` (when given) and shapes the responses.
    /// With no zxid the request is served read-only from committed state.
    pub fn process_request(
        &mut self,
        request: &Request,
        session_id: SessionId,
        zxid: Option<Zxid>,
        check_acl: bool,
        _is_local: bool,
    ) -> Vec<ResponseForSession> {
        let (response, watch_triggers) = match zxid {
            Some(zxid) => {
                let ops = self.uncommitted_state.commit_pop(zxid);
                let result = self.commit_and_respond(request, session_id, zxid, ops, check_acl);
                self.zxid = self.zxid.max(zxid);
                self.uncommitted_state.rebuild(&self.container);
                self.verify_digest(zxid);
                result
            }
            None => (self.process_read(request, session_id, check_acl), Vec::new()),
        };
        vec![ResponseForSession {
            session_id,
            response,
            watch_triggers,
        }]
    }

    /// Drops the uncommitted deltas of `zxid`.
    pub fn rollback_request(&mut self, zxid: Zxid) {
        self.uncommitted_state.rollback(&self.container, zxid);
        self.digest_expectations.retain(|(z, _, _)| *z != zxid);
    }

    /// Replays this store's pending deltas newer than `up_to_zxid` into a
    /// peer restored from a snapshot, so both commit identically.
    pub fn apply_uncommitted_state(&self, target: &mut Storage, up_to_zxid: Zxid) {
        for delta in self.uncommitted_state.deltas() {
            if delta.zxid > up_to_zxid {
                target
                    .uncommitted_state
                    .add_delta(&target.container, delta.clone());
            }
        }
    }

    /// Unlinks container entries shadowed during the last snapshot.
    pub fn clear_garbage_after_snapshot(&mut self) {
        self.container.clear_outdated_nodes();
    }

    /// Ephemeral paths owned by expired sessions are removed through
    /// synthesized close requests; this yields the sessions to close.
    pub fn expired_sessions(&mut self) -> Vec<SessionId> {
        self.session_expiry_queue.get_expired_sessions()
    }

    // ---------------------------------------------------------------------
    // Preprocessing
    // ---------------------------------------------------------------------

    fn preprocess_op(
        &mut self,
        request: &Request,
        session_id: SessionId,
        time_ms: Timestamp,
        zxid: Zxid,
        check_acl: bool,
    ) -> Vec<Operation> {
        let result = match request {
            Request::Create {
                path,
                data,
                is_ephemeral,
                is_sequential,
                acls,
            } => self.preprocess_create(
                path,
                data,
                *is_ephemeral,
                *is_sequential,
                acls,
                session_id,
                time_ms,
                zxid,
                check_acl,
            ),
            Request::Remove { path, version } => {
                self.preprocess_remove(path, *version, session_id, zxid, check_acl)
            }
            Request::Set {
                path,
                data,
                version,
            } => self.preprocess_set(path, data, *version, session_id, time_ms, zxid, check_acl),
            Request::SetAcl {
                path,
                acls,
                version,
            } => self.preprocess_set_acl(path, acls, *version, session_id, zxid, check_acl),
            Request::Check {
                path,
                version,
                not_exists,
            } => self.preprocess_check(path, *version, *not_exists),
            Request::Auth { scheme, data } => self.preprocess_auth(scheme, data, session_id),
            _ => Err(ErrorCode::BadArguments),
        };
        match result {
            Ok(ops) => ops,
            Err(error) => vec![Operation::Error { error }],
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn preprocess_create(
        &mut self,
        path: &str,
        data: &Bytes,
        is_ephemeral: bool,
        is_sequential: bool,
        acls: &[Acl],
        session_id: SessionId,
        time_ms: Timestamp,
        zxid: Zxid,
        check_acl: bool,
    ) -> Result<Vec<Operation>, ErrorCode> {
        if !is_valid_path(path) || path == "/" {
            return Err(ErrorCode::BadArguments);
        }
        if is_system_path(path) && self.server_state == ServerState::Running {
            return Err(ErrorCode::BadArguments);
        }

        let parent = parent_path(path).to_string();
        let parent_node = self
            .uncommitted_state
            .get_node(&self.container, &parent)
            .ok_or(ErrorCode::NoNode)?;
        if parent_node.stat.is_ephemeral() {
            return Err(ErrorCode::NoChildrenForEphemerals);
        }
        if check_acl
            && !self.check_permission(&parent_node.acls, Permission::CREATE, session_id)
        {
            return Err(ErrorCode::NoAuth);
        }

        let mut path_created = path.to_string();
        if is_sequential {
            path_created.push_str(&format!("{:010}", parent_node.stat.cversion));
        }
        if self
            .uncommitted_state
            .get_node(&self.container, &path_created)
            .is_some()
        {
            return Err(ErrorCode::NodeExists);
        }

        let acls = self.fixup_acls(acls, session_id)?;

        let stat = Stat {
            czxid: zxid,
            mzxid: zxid,
            ctime: time_ms,
            mtime: time_ms,
            pzxid: zxid,
            ephemeral_owner: if is_ephemeral { session_id } else { 0 },
            data_length: data.len() as i32,
            ..Default::default()
        };

        let mut parent_stat = parent_node.stat;
        parent_stat.cversion += 1;
        parent_stat.num_children += 1;
        parent_stat.pzxid = zxid;

        Ok(vec![
            Operation::CreateNode {
                path: path_created,
                data: data.clone(),
                acls,
                stat,
            },
            Operation::UpdateNode {
                path: parent,
                data: parent_node.data,
                stat: parent_stat,
            },
        ])
    }

    fn preprocess_remove(
        &mut self,
        path: &str,
        version: i32,
        session_id: SessionId,
        zxid: Zxid,
        check_acl: bool,
    ) -> Result<Vec<Operation>, ErrorCode> {
        if is_system_path(path) && self.server_state == ServerState::Running {
            return Err(ErrorCode::BadArguments);
        }
        if check_acl {
            let parent = parent_path(path);
            if let Some(parent_node) = self.uncommitted_state.get_node(&self.container, parent) {
                if !self.check_permission(&parent_node.acls, Permission::DELETE, session_id) {
                    return Err(ErrorCode::NoAuth);
                }
            }
        }
        self.remove_node_operations(path, version, zxid)
    }

    /// The delta pair removing one node; shared by `Remove` and session
    /// close.
    fn remove_node_operations(
        &self,
        path: &str,
        version: i32,
        zxid: Zxid,
    ) -> Result<Vec<Operation>, ErrorCode> {
        let node = self
            .uncommitted_state
            .get_node(&self.container, path)
            .ok_or(ErrorCode::NoNode)?;
        if version != -1 && node.stat.version != version {
            return Err(ErrorCode::BadVersion);
        }
        if node.stat.num_children != 0 {
            return Err(ErrorCode::NotEmpty);
        }

        let parent = parent_path(path).to_string();
        let parent_node = self
            .uncommitted_state
            .get_node(&self.container, &parent)
            .ok_or(ErrorCode::NoNode)?;
        let mut parent_stat = parent_node.stat;
        parent_stat.cversion += 1;
        parent_stat.num_children -= 1;
        parent_stat.pzxid = zxid;

        Ok(vec![
            Operation::RemoveNode {
                path: path.to_string(),
                prev_version: node.stat.version,
            },
            Operation::UpdateNode {
                path: parent,
                data: parent_node.data,
                stat: parent_stat,
            },
        ])
    }

    #[allow(clippy::too_many_arguments)]
    fn preprocess_set(
        &mut self,
        path: &str,
        data: &Bytes,
        version: i32,
        session_id: SessionId,
        time_ms: Timestamp,
        zxid: Zxid,
        check_acl: bool,
    ) -> Result<Vec<Operation>, ErrorCode> {
        if is_system_path(path) && self.server_state == ServerState::Running {
            return Err(ErrorCode::BadArguments);
        }
        let node = self
            .uncommitted_state
            .get_node(&self.container, path)
            .ok_or(ErrorCode::NoNode)?;
        if check_acl && !self.check_permission(&node.acls, Permission::WRITE, session_id) {
            return Err(ErrorCode::NoAuth);
        }
        if version != -1 && node.stat.version != version {
            return Err(ErrorCode::BadVersion);
        }

        let mut stat = node.stat;
        stat.version += 1;
        stat.mzxid = zxid;
        stat.mtime = time_ms;
        stat.data_length = data.len() as i32;

        Ok(vec![Operation::UpdateNode {
            path: path.to_string(),
            data: data.clone(),
            stat,
        }])
    }

    fn preprocess_set_acl(
        &mut self,
        path: &str,
        acls: &[Acl],
        version: i32,
        session_id: SessionId,
        _zxid: Zxid,
        check_acl: bool,
    ) -> Result<Vec<Operation>, ErrorCode> {
        if is_system_path(path) && self.server_state == ServerState::Running {
            return Err(ErrorCode::BadArguments);
        }
        let node = self
            .uncommitted_state
            .get_node(&self.container, path)
            .ok_or(ErrorCode::NoNode)?;
        if check_acl && !self.check_permission(&node.acls, Permission::ADMIN, session_id) {
            return Err(ErrorCode::NoAuth);
        }
        if version != -1 && node.stat.aversion != version {
            return Err(ErrorCode::BadVersion);
        }
        let acls = self.fixup_acls(acls, session_id)?;
        Ok(vec![Operation::SetAcl {
            path: path.to_string(),
            acls,
            aversion: node.stat.aversion + 1,
        }])
    }

    fn preprocess_check(
        &self,
        path: &str,
        version: i32,
        not_exists: bool,
    ) -> Result<Vec<Operation>, ErrorCode> {
        let node = self.uncommitted_state.get_node(&self.container, path);
        if not_exists {
            match node {
                None => Ok(Vec::new()),
                Some(node) if version != -1 && node.stat.version != version => Ok(Vec::new()),
                Some(_) => Err(ErrorCode::NodeExists),
            }
        } else {
            match node {
                None => Err(ErrorCode::NoNode),
                Some(node) if version != -1 && node.stat.version != version => {
                    Err(ErrorCode::BadVersion)
                }
                Some(_) => Ok(Vec::new()),
            }
        }
    }

    fn preprocess_auth(
        &self,
        scheme: &str,
        data: &str,
        session_id: SessionId,
    ) -> Result<Vec<Operation>, ErrorCode> {
        if scheme != "digest" || !data.contains(':') {
            return Err(ErrorCode::BadArguments);
        }
        Ok(vec![Operation::AddAuth {
            session_id,
            auth_id: AuthId::new("digest", digest_from_credentials(data)),
        }])
    }

    fn preprocess_multi(
        &mut self,
        requests: &[Request],
        session_id: SessionId,
        time_ms: Timestamp,
        zxid: Zxid,
        check_acl: bool,
    ) {
        let mut subs: Vec<Vec<Operation>> = Vec::with_capacity(requests.len());
        for (position, sub_request) in requests.iter().enumerate() {
            let ops = self.preprocess_op(sub_request, session_id, time_ms, zxid, check_acl);
            if let [Operation::Error { error }] = ops.as_slice() {
                // Atomic batch: undo the earlier subs and record the
                // per-sub verdicts instead.
                let error = *error;
                self.uncommitted_state.rollback(&self.container, zxid);
                let mut errors = vec![ErrorCode::Ok; position];
                errors.push(error);
                errors.extend(
                    std::iter::repeat(ErrorCode::RuntimeInconsistency)
                        .take(requests.len() - position - 1),
                );
                self.add_operations(zxid, vec![Operation::FailedMulti { errors }]);
                return;
            }
            // Applied eagerly so later subs see this one's effects.
            self.add_operations(zxid, ops.clone());
            subs.push(ops);
        }
        self.uncommitted_state.rollback(&self.container, zxid);
        self.add_operations(zxid, vec![Operation::SubDeltas { subs }]);
    }

    fn add_operations(&mut self, zxid: Zxid, operations: Vec<Operation>) {
        for operation in operations {
            self.uncommitted_state
                .add_delta(&self.container, Delta { zxid, operation });
        }
    }

    // ---------------------------------------------------------------------
    // Commit
    // ---------------------------------------------------------------------

    fn commit_and_respond(
        &mut self,
        request: &Request,
        session_id: SessionId,
        zxid: Zxid,
        ops: Vec<Operation>,
        check_acl: bool,
    ) -> (Response, Vec<WatchTrigger>) {
        if let [Operation::Error { error }] = ops.as_slice() {
            return (error_response(request, *error), Vec::new());
        }

        match request {
            Request::Multi { requests } => match ops.into_iter().next() {
                Some(Operation::FailedMulti { errors }) => {
                    let responses: Vec<Response> = requests
                        .iter()
                        .zip(&errors)
                        .map(|(sub, error)| error_response(sub, *error))
                        .collect();
                    let first_error = errors
                        .iter()
                        .copied()
                        .find(|e| !e.is_ok())
                        .unwrap_or(ErrorCode::Ok);
                    (
                        Response::error(first_error, ResponseBody::Multi { responses }),
                        Vec::new(),
                    )
                }
                Some(Operation::SubDeltas { subs }) => {
                    let mut watch_triggers = Vec::new();
                    let responses: Vec<Response> = requests
                        .iter()
                        .zip(subs)
                        .map(|(sub_request, sub_ops)| {
                            let (response, triggers) =
                                self.apply_and_respond(sub_request, session_id, sub_ops, check_acl);
                            watch_triggers.extend(triggers);
                            response
                        })
                        .collect();
                    (
                        Response::ok(ResponseBody::Multi { responses }),
                        watch_triggers,
                    )
                }
                _ => (
                    Response::error(
                        ErrorCode::RuntimeInconsistency,
                        ResponseBody::Multi {
                            responses: Vec::new(),
                        },
                    ),
                    Vec::new(),
                ),
            },
            _ => self.apply_and_respond(request, session_id, ops, check_acl),
        }
    }

    /// Applies one request's operations and builds its success (or
    /// read-time) response plus the watch events the commit fires.
    fn apply_and_respond(
        &mut self,
        request: &Request,
        session_id: SessionId,
        ops: Vec<Operation>,
        check_acl: bool,
    ) -> (Response, Vec<WatchTrigger>) {
        if let [Operation::Error { error }] = ops.as_slice() {
            return (error_response(request, *error), Vec::new());
        }

        let path_created = ops.iter().find_map(|op| match op {
            Operation::CreateNode { path, .. } => Some(path.clone()),
            _ => None,
        });
        let set_stat = ops.iter().find_map(|op| match op {
            Operation::UpdateNode { path, stat, .. } => match request {
                Request::Set { path: set_path, .. } if path == set_path => Some(*stat),
                _ => None,
            },
            _ => None,
        });
        let watch_triggers = watch_triggers(request, &ops);

        for op in ops {
            self.commit_op(op);
        }

        let response = match request {
            Request::Create { .. } => Response::ok(ResponseBody::Create {
                path_created: path_created.unwrap_or_default(),
            }),
            Request::Remove { .. } => Response::ok(ResponseBody::Remove),
            Request::Set { .. } => Response::ok(ResponseBody::Set {
                stat: set_stat.unwrap_or_default(),
            }),
            Request::SetAcl { path, .. } => {
                let stat = self
                    .container
                    .get(path)
                    .map(|n| n.stat)
                    .unwrap_or_default();
                Response::ok(ResponseBody::SetAcl { stat })
            }
            Request::Check { .. } => Response::ok(ResponseBody::Check),
            Request::Auth { .. } => Response::ok(ResponseBody::Auth),
            Request::Close => Response::ok(ResponseBody::Close),
            _ => self.process_read(request, session_id, check_acl),
        };
        (response, watch_triggers)
    }

    fn commit_op(&mut self, operation: Operation) {
        match operation {
            Operation::CreateNode {
                path,
                data,
                acls,
                stat,
            } => {
                let node = Node {
                    data,
                    acls,
                    stat,
                    children: HashSet::new(),
                };
                self.nodes_digest = self
                    .nodes_digest
                    .wrapping_add(digest::node_digest(&path, &node));
                if stat.ephemeral_owner != 0 {
                    self.ephemerals
                        .entry(stat.ephemeral_owner)
                        .or_default()
                        .insert(path.clone());
                }
                let parent = parent_path(&path).to_string();
                let child = base_name(&path).to_string();
                self.container.insert(path, node);
                self.container
                    .update_value(&parent, |p| p.add_child(child));
            }
            Operation::UpdateNode { path, data, stat } => {
                if let Some(old) = self.container.get(&path) {
                    self.nodes_digest = self
                        .nodes_digest
                        .wrapping_sub(digest::node_digest(&path, old));
                }
                self.container.update_value(&path, |node| {
                    node.data = data;
                    node.stat = stat;
                });
                let node = self.container.get(&path).expect("node updated in place");
                self.nodes_digest = self
                    .nodes_digest
                    .wrapping_add(digest::node_digest(&path, node));
            }
            Operation::RemoveNode { path, .. } => {
                if let Some(node) = self.container.get(&path) {
                    self.nodes_digest = self
                        .nodes_digest
                        .wrapping_sub(digest::node_digest(&path, node));
                    let owner = node.stat.ephemeral_owner;
                    if owner != 0 {
                        if let Some(owned) = self.ephemerals.get_mut(&owner) {
                            owned.remove(&path);
                            if owned.is_empty() {
                                self.ephemerals.remove(&owner);
                            }
                        }
                    }
                }
                self.container.erase(&path);
                let parent = parent_path(&path).to_string();
                let child = base_name(&path).to_string();
                self.container
                    .update_value(&parent, |p| p.remove_child(&child));
            }
            Operation::SetAcl {
                path,
                acls,
                aversion,
            } => {
                if let Some(old) = self.container.get(&path) {
                    self.nodes_digest = self
                        .nodes_digest
                        .wrapping_sub(digest::node_digest(&path, old));
                }
                self.container.update_value(&path, |node| {
                    node.acls = acls;
                    node.stat.aversion = aversion;
                });
                let node = self.container.get(&path).expect("node updated in place");
                self.nodes_digest = self
                    .nodes_digest
                    .wrapping_add(digest::node_digest(&path, node));
            }
            Operation::AddAuth {
                session_id,
                auth_id,
            } => {
                self.session_and_auth
                    .entry(session_id)
                    .or_default()
                    .push(auth_id);
            }
            Operation::CloseSession { session_id } => {
                self.session_and_timeout.remove(&session_id);
                self.session_and_auth.remove(&session_id);
                self.session_expiry_queue.remove(session_id);
            }
            Operation::SubDeltas { subs } => {
                for sub in subs {
                    for op in sub {
                        self.commit_op(op);
                    }
                }
            }
            Operation::Error { .. } | Operation::FailedMulti { .. } => {}
        }
    }

    fn verify_digest(&mut self, zxid: Zxid) {
        while matches!(self.digest_expectations.front(), Some((z, _, _)) if *z <= zxid) {
            let (z, expected, log_idx) = self
                .digest_expectations
                .pop_front()
                .expect("front checked");
            if z == zxid && expected != self.nodes_digest {
                // A divergent replica must never serve.
                panic!(
                    "state digest mismatch at zxid {z} (log index {log_idx:?}): \
                     local {:#x} != leader {expected:#x}",
                    self.nodes_digest
                );
            }
        }
    }

    // ---------------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------------

    fn process_read(
        &self,
        request: &Request,
        session_id: SessionId,
        check_acl: bool,
    ) -> Response {
        match request {
            Request::Get { path } => match self.container.get(path) {
                None => error_response(request, ErrorCode::NoNode),
                Some(node) => {
                    if check_acl
                        && !self.check_permission(&node.acls, Permission::READ, session_id)
                    {
                        return error_response(request, ErrorCode::NoAuth);
                    }
                    Response::ok(ResponseBody::Get {
                        data: node.data.clone(),
                        stat: node.stat,
                    })
                }
            },
            Request::Exists { path } => match self.container.get(path) {
                None => error_response(request, ErrorCode::NoNode),
                Some(node) => Response::ok(ResponseBody::Exists { stat: node.stat }),
            },
            Request::GetAcl { path } => match self.container.get(path) {
                None => error_response(request, ErrorCode::NoNode),
                Some(node) => Response::ok(ResponseBody::GetAcl {
                    acls: node.acls.clone(),
                    stat: node.stat,
                }),
            },
            Request::List { path } => self.list_children(path, ListRequestType::All, session_id, check_acl),
            Request::FilteredList {
                path,
                list_request_type,
            } => self.list_children(path, *list_request_type, session_id, check_acl),
            Request::Sync { path } => Response::ok(ResponseBody::Sync { path: path.clone() }),
            Request::Check {
                path,
                version,
                not_exists,
            } => match self.check_against_committed(path, *version, *not_exists) {
                ErrorCode::Ok => Response::ok(ResponseBody::Check),
                error => error_response(request, error),
            },
            Request::MultiRead { requests } => {
                let responses = requests
                    .iter()
                    .map(|sub| self.process_read(sub, session_id, check_acl))
                    .collect();
                Response::ok(ResponseBody::Multi { responses })
            }
            _ => error_response(request, ErrorCode::BadArguments),
        }
    }

    fn list_children(
        &self,
        path: &str,
        list_request_type: ListRequestType,
        session_id: SessionId,
        check_acl: bool,
    ) -> Response {
        let Some(node) = self.container.get(path) else {
            return Response::error(
                ErrorCode::NoNode,
                ResponseBody::List {
                    names: Vec::new(),
                    stat: Stat::default(),
                },
            );
        };
        if check_acl && !self.check_permission(&node.acls, Permission::READ, session_id) {
            return Response::error(
                ErrorCode::NoAuth,
                ResponseBody::List {
                    names: Vec::new(),
                    stat: Stat::default(),
                },
            );
        }
        let mut names: Vec<String> = node
            .children
            .iter()
            .filter(|child| match list_request_type {
                ListRequestType::All => true,
                ListRequestType::PersistentOnly | ListRequestType::EphemeralOnly => {
                    let child_path = if path == "/" {
                        format!("/{child}")
                    } else {
                        format!("{path}/{child}")
                    };
                    let ephemeral = self
                        .container
                        .get(&child_path)
                        .is_some_and(|c| c.is_ephemeral());
                    match list_request_type {
                        ListRequestType::EphemeralOnly => ephemeral,
                        _ => !ephemeral,
                    }
                }
            })
            .cloned()
            .collect();
        names.sort_unstable();
        Response::ok(ResponseBody::List {
            names,
            stat: node.stat,
        })
    }

    fn check_against_committed(&self, path: &str, version: i32, not_exists: bool) -> ErrorCode {
        let node = self.container.get(path);
        if not_exists {
            match node {
                None => ErrorCode::Ok,
                Some(n) if version != -1 && n.stat.version != version => ErrorCode::Ok,
                Some(_) => ErrorCode::NodeExists,
            }
        } else {
            match node {
                None => ErrorCode::NoNode,
                Some(n) if version != -1 && version != n.stat.version => ErrorCode::BadVersion,
                Some(_) => ErrorCode::Ok,
            }
        }
    }

    // ---------------------------------------------------------------------
    // ACLs and sessions
    // ---------------------------------------------------------------------

    /// Does some ACL entry grant `permission` to one of the session's
    /// identities? `world:anyone` always matches.
    fn check_permission(
        &self,
        acls: &[Acl],
        permission: u32,
        session_id: SessionId,
    ) -> bool {
        if acls.is_empty() {
            return true;
        }
        for acl in acls {
            if acl.permissions & permission == 0 {
                continue;
            }
            if acl.scheme == "world" && acl.id == "anyone" {
                return true;
            }
            let matches = |auth: &AuthId| auth.scheme == acl.scheme && auth.id == acl.id;
            if self
                .session_and_auth
                .get(&session_id)
                .is_some_and(|auths| auths.iter().any(matches))
            {
                return true;
            }
            if self
                .uncommitted_state
                .session_auths(session_id)
                .iter()
                .any(matches)
            {
                return true;
            }
        }
        false
    }

    /// Validates the requested ACLs and rewrites the `auth` scheme into the
    /// concrete digest identities the session holds.
    fn fixup_acls(&self, acls: &[Acl], session_id: SessionId) -> Result<Vec<Acl>, ErrorCode> {
        if acls.is_empty() {
            return Ok(vec![Acl::world_all()]);
        }
        let mut fixed = Vec::with_capacity(acls.len());
        for acl in acls {
            if acl.permissions == 0 || acl.permissions > Permission::ALL {
                return Err(ErrorCode::InvalidAcl);
            }
            match acl.scheme.as_str() {
                "world" => {
                    if acl.id != "anyone" {
                        return Err(ErrorCode::InvalidAcl);
                    }
                    fixed.push(acl.clone());
                }
                "auth" => {
                    let mut rewritten = false;
                    let committed = self
                        .session_and_auth
                        .get(&session_id)
                        .map(Vec::as_slice)
                        .unwrap_or(&[]);
                    for auth in committed
                        .iter()
                        .chain(self.uncommitted_state.session_auths(session_id))
                    {
                        if auth.scheme == "digest" {
                            fixed.push(Acl::new(acl.permissions, "digest", auth.id.clone()));
                            rewritten = true;
                        }
                    }
                    if !rewritten {
                        return Err(ErrorCode::InvalidAcl);
                    }
                }
                "digest" => {
                    if !acl.id.contains(':') {
                        return Err(ErrorCode::InvalidAcl);
                    }
                    fixed.push(acl.clone());
                }
                "ip" => {
                    if acl.id.is_empty() {
                        return Err(ErrorCode::InvalidAcl);
                    }
                    fixed.push(acl.clone());
                }
                _ => return Err(ErrorCode::InvalidAcl),
            }
        }
        if fixed.is_empty() {
            return Err(ErrorCode::InvalidAcl);
        }
        Ok(fixed)
    }

    /// Ephemeral paths the session would own once everything pending
    /// commits, sorted for deterministic removal order.
    fn collect_session_ephemerals(&self, session_id: SessionId) -> Vec<String> {
        let mut paths: HashSet<String> = self
            .ephemerals
            .get(&session_id)
            .cloned()
            .unwrap_or_default();
        for delta in self.uncommitted_state.deltas() {
            visit_operations(&delta.operation, &mut |op| match op {
                Operation::CreateNode { path, stat, .. }
                    if stat.ephemeral_owner == session_id =>
                {
                    paths.insert(path.clone());
                }
                Operation::RemoveNode { path, .. } => {
                    paths.remove(path);
                }
                _ => {}
            });
        }
        let mut paths: Vec<String> = paths.into_iter().collect();
        paths.sort_unstable();
        paths
    }

    // ---------------------------------------------------------------------
    // Bootstrap
    // ---------------------------------------------------------------------

    fn insert_root_and_system_nodes(&mut self) {
        for (path, data) in [
            ("/", Bytes::new()),
            (paths::SYSTEM_ROOT, Bytes::new()),
            (paths::API_VERSION_PATH, Bytes::from(API_VERSION.to_string())),
            (
                paths::FEATURE_FLAGS_PATH,
                Bytes::from(FeatureFlags::default().to_bytes()),
            ),
        ] {
            let mut node = Node::new(data);
            node.acls = vec![Acl::world_all()];
            self.insert_node_unchecked(path.to_string(), node);
            if path != "/" {
                self.container
                    .update_value(parent_path(path), |p| p.stat.num_children += 1);
            }
        }
        self.recalculate_digest();
    }

    /// Inserts a fully formed node, wiring the parent's child list and the
    /// ephemeral registry. Stats are taken as-is: the snapshot restore path
    /// relies on `num_children` already being correct in the stored stat.
    pub fn insert_node_unchecked(&mut self, path: String, node: Node) {
        if node.stat.ephemeral_owner != 0 {
            self.ephemerals
                .entry(node.stat.ephemeral_owner)
                .or_default()
                .insert(path.clone());
        }
        if path != "/" {
            let parent = parent_path(&path).to_string();
            let child = base_name(&path).to_string();
            self.container.update_value(&parent, |p| p.add_child(child));
        }
        self.container.insert_or_replace(path, node);
    }

    /// Recomputes the running digest from scratch; used after bootstrap and
    /// snapshot restore, where nodes were placed directly.
    pub fn recalculate_digest(&mut self) {
        let mut total: u64 = 0;
        for (path, node, active) in self.container.iter() {
            if active {
                total = total.wrapping_add(digest::node_digest(path, node));
            }
        }
        self.nodes_digest = total;
    }
}

/// Watch events fired by one request's committed operations. Parent-stat
/// updates are bookkeeping, not data changes, so only the `Set` target maps
/// to a `Changed` event.
fn watch_triggers(request: &Request, ops: &[Operation]) -> Vec<WatchTrigger> {
    let set_target = match request {
        Request::Set { path, .. } => Some(path.as_str()),
        _ => None,
    };
    let mut triggers = Vec::new();
    for op in ops {
        match op {
            Operation::CreateNode { path, .. } => {
                triggers.push(WatchTrigger::new(path.clone(), WatchEventType::Created));
                triggers.push(WatchTrigger::new(parent_path(path), WatchEventType::Child));
            }
            Operation::RemoveNode { path, .. } => {
                triggers.push(WatchTrigger::new(path.clone(), WatchEventType::Deleted));
                triggers.push(WatchTrigger::new(parent_path(path), WatchEventType::Child));
            }
            Operation::UpdateNode { path, .. } if Some(path.as_str()) == set_target => {
                triggers.push(WatchTrigger::new(path.clone(), WatchEventType::Changed));
            }
            _ => {}
        }
    }
    triggers
}

/// Walks an operation tree, recursing into multi sub-deltas.
fn visit_operations(operation: &Operation, visit: &mut impl FnMut(&Operation)) {
    visit(operation);
    if let Operation::SubDeltas { subs } = operation {
        for sub in subs {
            for op in sub {
                visit_operations(op, visit);
            }
        }
    }
}

/// A failure response shaped like the request that caused it.
fn error_response(request: &Request, error: ErrorCode) -> Response {
    let body = match request {
        Request::Create { .. } => ResponseBody::Create {
            path_created: String::new(),
        },
        Request::Remove { .. } => ResponseBody::Remove,
        Request::Exists { .. } => ResponseBody::Exists {
            stat: Stat::default(),
        },
        Request::Get { .. } => ResponseBody::Get {
            data: Bytes::new(),
            stat: Stat::default(),
        },
        Request::Set { .. } => ResponseBody::Set {
            stat: Stat::default(),
        },
        Request::GetAcl { .. } => ResponseBody::GetAcl {
            acls: Vec::new(),
            stat: Stat::default(),
        },
        Request::SetAcl { .. } => ResponseBody::SetAcl {
            stat: Stat::default(),
        },
        Request::List { .. } | Request::FilteredList { .. } => ResponseBody::List {
            names: Vec::new(),
            stat: Stat::default(),
        },
        Request::Sync { path } => ResponseBody::Sync { path: path.clone() },
        Request::Check { .. } => ResponseBody::Check,
        Request::Multi { .. } | Request::MultiRead { .. } => ResponseBody::Multi {
            responses: Vec::new(),
        },
        Request::Auth { .. } => ResponseBody::Auth,
        Request::Close => ResponseBody::Close,
    };
    Response::error(error, body)
}
