//! Session expiry bookkeeping.

use common::SessionId;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Instant;

/// Deadline queue with clock-granularity buckets. Deadlines are rounded up
/// to the expiration period, so a heartbeat only moves a session between
/// buckets once per period instead of on every tick.
pub struct SessionExpiryQueue {
    expiration_period_ms: i64,
    started: Instant,
    session_to_deadline: HashMap<SessionId, i64>,
    deadline_to_sessions: BTreeMap<i64, HashSet<SessionId>>,
}

impl SessionExpiryQueue {
    pub fn new(expiration_period_ms: i64) -> Self {
        Self {
            expiration_period_ms: expiration_period_ms.max(1),
            started: Instant::now(),
            session_to_deadline: HashMap::new(),
            deadline_to_sessions: BTreeMap::new(),
        }
    }

    /// Registers a session or refreshes its deadline after a heartbeat.
    pub fn add_new_session_or_update(&mut self, session_id: SessionId, timeout_ms: i64) {
        let deadline = self.round_up(self.now_ms() + timeout_ms.max(0));
        if let Some(old) = self.session_to_deadline.insert(session_id, deadline) {
            if old == deadline {
                return;
            }
            self.remove_from_bucket(session_id, old);
        }
        self.deadline_to_sessions
            .entry(deadline)
            .or_default()
            .insert(session_id);
    }

    pub fn remove(&mut self, session_id: SessionId) {
        if let Some(deadline) = self.session_to_deadline.remove(&session_id) {
            self.remove_from_bucket(session_id, deadline);
        }
    }

    /// Returns and unregisters every session whose deadline has passed.
    pub fn get_expired_sessions(&mut self) -> Vec<SessionId> {
        let now = self.now_ms();
        let mut expired = Vec::new();
        let live = self.deadline_to_sessions.split_off(&now);
        for (_, sessions) in std::mem::replace(&mut self.deadline_to_sessions, live) {
            for session_id in sessions {
                self.session_to_deadline.remove(&session_id);
                expired.push(session_id);
            }
        }
        expired.sort_unstable();
        expired
    }

    pub fn clear(&mut self) {
        self.session_to_deadline.clear();
        self.deadline_to_sessions.clear();
    }

    fn now_ms(&self) -> i64 {
        self.started.elapsed().as_millis() as i64
    }

    fn round_up(&self, deadline: i64) -> i64 {
        let period = self.expiration_period_ms;
        ((deadline + period - 1) / period) * period
    }

    fn remove_from_bucket(&mut self, session_id: SessionId, deadline: i64) {
        if let Some(bucket) = self.deadline_to_sessions.get_mut(&deadline) {
            bucket.remove(&session_id);
            if bucket.is_empty() {
                self.deadline_to_sessions.remove(&deadline);
            }
        }
    }
}
