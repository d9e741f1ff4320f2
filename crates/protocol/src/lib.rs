//! ZooKeeper-compatible semantic model.
//!
//! Requests, responses, error codes, ACLs and node statistics are modeled as
//! plain tagged unions; dispatch over them is a `match`, not a virtual call.
//! The `wire` module holds the little-endian primitives every on-disk format
//! in the workspace is built from.

pub mod acl;
pub mod error;
pub mod features;
pub mod paths;
pub mod request;
pub mod stat;
pub mod wire;

pub use acl::{digest_from_credentials, Acl, AuthId, Permission};
pub use error::ErrorCode;
pub use features::{FeatureFlag, FeatureFlags};
pub use request::{ListRequestType, OpCode, Request, Response};
pub use stat::Stat;
