//! Access control lists and authentication identities.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

/// Permission bits of an ACL entry.
pub struct Permission;

impl Permission {
    pub const READ: u32 = 1;
    pub const WRITE: u32 = 2;
    pub const CREATE: u32 = 4;
    pub const DELETE: u32 = 8;
    pub const ADMIN: u32 = 16;
    pub const ALL: u32 = 31;
}

/// One ACL entry on a node: a permission mask plus the `(scheme, id)`
/// predicate it applies to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acl {
    pub permissions: u32,
    pub scheme: String,
    pub id: String,
}

impl Acl {
    pub fn new(permissions: u32, scheme: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            permissions,
            scheme: scheme.into(),
            id: id.into(),
        }
    }

    /// `world:anyone` with all permissions, the default for new nodes.
    pub fn world_all() -> Self {
        Self::new(Permission::ALL, "world", "anyone")
    }
}

/// An authenticated identity attached to a session.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AuthId {
    pub scheme: String,
    pub id: String,
}

impl AuthId {
    pub fn new(scheme: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            id: id.into(),
        }
    }
}

/// Digest-scheme identity for `user:password` credentials:
/// `user:base64(sha1("user:password"))`.
pub fn digest_from_credentials(credentials: &str) -> String {
    let user = credentials.split(':').next().unwrap_or_default();
    let mut hasher = Sha1::new();
    hasher.update(credentials.as_bytes());
    format!("{}:{}", user, STANDARD.encode(hasher.finalize()))
}
