//! Entry-payload codec.
//!
//! Every replicated log entry carries one request plus its session context:
//!
//! ```text
//! session_id: i64 | request (length-prefixed, bincode) | time_ms: i64 |
//! zxid: i64 | digest_version: u8 [ | digest: u64 ]
//! ```
//!
//! Little-endian throughout. This is the boundary between the consensus
//! library's opaque buffers and the typed request model.

use bincode::config::{self, Config};
use common::{CoordinationError, CoordinationResult, SessionId, Timestamp, Zxid};
use protocol::{wire, Request};
use std::io::Cursor;
use store::DigestVersion;

/// Requests can carry a few megabytes of node data, but a corrupt length
/// prefix must not be trusted further than this.
const MAX_REQUEST_SIZE: usize = 64 * 1024 * 1024;

fn bincode_config() -> impl Config {
    config::legacy()
}

/// One deserialized log-entry payload.
#[derive(Clone, Debug, PartialEq)]
pub struct RequestForSession {
    pub session_id: SessionId,
    pub time_ms: Timestamp,
    pub request: Request,
    pub zxid: Zxid,
    /// Leader-computed state digest after this transaction, if carried.
    pub digest: Option<u64>,
}

impl RequestForSession {
    pub fn new(session_id: SessionId, time_ms: Timestamp, request: Request, zxid: Zxid) -> Self {
        Self {
            session_id,
            time_ms,
            request,
            zxid,
            digest: None,
        }
    }

    /// Server-internal close for an expired session.
    pub fn close_session(session_id: SessionId, time_ms: Timestamp, zxid: Zxid) -> Self {
        Self::new(session_id, time_ms, Request::Close, zxid)
    }

    pub fn encode(&self) -> CoordinationResult<Vec<u8>> {
        let mut buf = Vec::new();
        wire::write_i64(&mut buf, self.session_id)?;
        let request = bincode::serde::encode_to_vec(&self.request, bincode_config())
            .map_err(|e| CoordinationError::Codec(format!("encode request: {e}")))?;
        wire::write_bytes(&mut buf, &request)?;
        wire::write_i64(&mut buf, self.time_ms)?;
        wire::write_i64(&mut buf, self.zxid)?;
        match self.digest {
            None => wire::write_u8(&mut buf, DigestVersion::NoDigest as u8)?,
            Some(digest) => {
                wire::write_u8(&mut buf, DigestVersion::V1 as u8)?;
                wire::write_u64(&mut buf, digest)?;
            }
        }
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> CoordinationResult<Self> {
        let mut r = Cursor::new(buf);
        let session_id = wire::read_i64(&mut r)?;
        let request_bytes = wire::read_bytes(&mut r, MAX_REQUEST_SIZE)?;
        let (request, _) = bincode::serde::decode_from_slice(&request_bytes, bincode_config())
            .map_err(|e| CoordinationError::Codec(format!("decode request: {e}")))?;
        let time_ms = wire::read_i64(&mut r)?;
        let zxid = wire::read_i64(&mut r)?;
        let digest_version = DigestVersion::from_u8(wire::read_u8(&mut r)?).ok_or_else(|| {
            CoordinationError::Codec("unknown digest version in log entry".into())
        })?;
        let digest = match digest_version {
            DigestVersion::NoDigest => None,
            DigestVersion::V1 => Some(wire::read_u64(&mut r)?),
        };
        Ok(Self {
            session_id,
            time_ms,
            request,
            zxid,
            digest,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_roundtrip() {
        let original = RequestForSession {
            session_id: 42,
            time_ms: 1_700_000_000_000,
            request: Request::Get {
                path: "/path/value".into(),
            },
            zxid: 7,
            digest: None,
        };
        let decoded = RequestForSession::decode(&original.encode().unwrap()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn payload_roundtrip_with_digest() {
        let original = RequestForSession {
            session_id: 1,
            time_ms: 0,
            request: Request::create("/hello", "world"),
            zxid: 3,
            digest: Some(0xDEAD_BEEF_CAFE_F00D),
        };
        let decoded = RequestForSession::decode(&original.encode().unwrap()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn truncated_payload_fails() {
        let buf = RequestForSession::new(1, 0, Request::Close, 9)
            .encode()
            .unwrap();
        assert!(RequestForSession::decode(&buf[..buf.len() - 2]).is_err());
    }
}
