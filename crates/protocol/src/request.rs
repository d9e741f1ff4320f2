//! Request and response unions.
//!
//! The whole operation surface is two tagged unions; `Multi` nests the same
//! `Request` type. Serialization goes through serde so log entries, pack
//! blobs and peer replay all share one encoding.

use crate::acl::Acl;
use crate::error::ErrorCode;
use crate::stat::Stat;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Operation codes, matching the ZooKeeper wire values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum OpCode {
    Close = -11,
    Error = -1,
    Create = 1,
    Remove = 2,
    Exists = 3,
    Get = 4,
    Set = 5,
    GetAcl = 6,
    SetAcl = 7,
    List = 12,
    Sync = 9,
    Check = 13,
    Multi = 14,
    MultiRead = 22,
    Auth = 100,
    FilteredList = 500,
    CheckNotExists = 501,
}

/// Child filter of a `FilteredList` request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ListRequestType {
    #[default]
    All,
    PersistentOnly,
    EphemeralOnly,
}

/// A client (or server-internal) operation to be replicated and applied.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Request {
    Create {
        path: String,
        data: Bytes,
        is_ephemeral: bool,
        is_sequential: bool,
        acls: Vec<Acl>,
    },
    Remove {
        path: String,
        /// Expected data version; -1 matches any.
        version: i32,
    },
    Exists {
        path: String,
    },
    Get {
        path: String,
    },
    Set {
        path: String,
        data: Bytes,
        version: i32,
    },
    GetAcl {
        path: String,
    },
    SetAcl {
        path: String,
        acls: Vec<Acl>,
        version: i32,
    },
    List {
        path: String,
    },
    FilteredList {
        path: String,
        list_request_type: ListRequestType,
    },
    Sync {
        path: String,
    },
    Check {
        path: String,
        version: i32,
        /// Inverts the check: Ok when the node is absent (or the version
        /// differs), NodeExists otherwise.
        not_exists: bool,
    },
    Multi {
        requests: Vec<Request>,
    },
    MultiRead {
        requests: Vec<Request>,
    },
    Auth {
        scheme: String,
        data: String,
    },
    Close,
}

impl Request {
    /// Convenience constructor for the most common request in tests.
    pub fn create(path: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Request::Create {
            path: path.into(),
            data: data.into(),
            is_ephemeral: false,
            is_sequential: false,
            acls: Vec::new(),
        }
    }

    pub fn op_code(&self) -> OpCode {
        match self {
            Request::Create { .. } => OpCode::Create,
            Request::Remove { .. } => OpCode::Remove,
            Request::Exists { .. } => OpCode::Exists,
            Request::Get { .. } => OpCode::Get,
            Request::Set { .. } => OpCode::Set,
            Request::GetAcl { .. } => OpCode::GetAcl,
            Request::SetAcl { .. } => OpCode::SetAcl,
            Request::List { .. } => OpCode::List,
            Request::FilteredList { .. } => OpCode::FilteredList,
            Request::Sync { .. } => OpCode::Sync,
            Request::Check { not_exists, .. } => {
                if *not_exists {
                    OpCode::CheckNotExists
                } else {
                    OpCode::Check
                }
            }
            Request::Multi { .. } => OpCode::Multi,
            Request::MultiRead { .. } => OpCode::MultiRead,
            Request::Auth { .. } => OpCode::Auth,
            Request::Close => OpCode::Close,
        }
    }

    /// Read-only requests may be served from committed state without
    /// consuming a zxid.
    pub fn is_readonly(&self) -> bool {
        matches!(
            self,
            Request::Exists { .. }
                | Request::Get { .. }
                | Request::GetAcl { .. }
                | Request::List { .. }
                | Request::FilteredList { .. }
                | Request::Sync { .. }
                | Request::MultiRead { .. }
        )
    }
}

/// Result of applying one request: an error code plus the operation-shaped
/// body. Every tuple returned by the store pairs one of these with the
/// session it belongs to.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub error: ErrorCode,
    pub body: ResponseBody,
}

impl Response {
    pub fn ok(body: ResponseBody) -> Self {
        Self {
            error: ErrorCode::Ok,
            body,
        }
    }

    pub fn error(error: ErrorCode, body: ResponseBody) -> Self {
        Self { error, body }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ResponseBody {
    Create { path_created: String },
    Remove,
    Exists { stat: Stat },
    Get { data: Bytes, stat: Stat },
    Set { stat: Stat },
    GetAcl { acls: Vec<Acl>, stat: Stat },
    SetAcl { stat: Stat },
    List { names: Vec<String>, stat: Stat },
    Sync { path: String },
    Check,
    Multi { responses: Vec<Response> },
    Auth,
    Close,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_codes() {
        assert_eq!(Request::create("/a", "").op_code(), OpCode::Create);
        assert_eq!(
            Request::Check {
                path: "/a".into(),
                version: -1,
                not_exists: false,
            }
            .op_code(),
            OpCode::Check
        );
        assert_eq!(
            Request::Check {
                path: "/a".into(),
                version: -1,
                not_exists: true,
            }
            .op_code(),
            OpCode::CheckNotExists
        );
        assert_eq!(Request::Close.op_code(), OpCode::Close);
    }

    #[test]
    fn readonly_classification() {
        assert!(Request::Get { path: "/a".into() }.is_readonly());
        assert!(Request::MultiRead { requests: vec![] }.is_readonly());
        assert!(!Request::create("/a", "x").is_readonly());
        assert!(!Request::Multi { requests: vec![] }.is_readonly());
        assert!(!Request::Close.is_readonly());
    }
}
