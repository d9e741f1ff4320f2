//! ZooKeeper error codes.

use serde::{Deserialize, Serialize};

/// Error code carried inside responses. Values match the ZooKeeper wire
/// protocol; `Ok` is zero, failures are negative.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum ErrorCode {
    Ok = 0,
    RuntimeInconsistency = -2,
    OperationTimeout = -7,
    BadArguments = -8,
    NoNode = -101,
    NoAuth = -102,
    BadVersion = -103,
    NoChildrenForEphemerals = -108,
    NodeExists = -110,
    NotEmpty = -111,
    SessionExpired = -112,
    InvalidAcl = -114,
    Closing = -116,
}

impl ErrorCode {
    pub fn is_ok(self) -> bool {
        self == ErrorCode::Ok
    }

    /// Wire value of the code.
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        use ErrorCode::*;
        let err = match code {
            0 => Ok,
            -2 => RuntimeInconsistency,
            -7 => OperationTimeout,
            -8 => BadArguments,
            -101 => NoNode,
            -102 => NoAuth,
            -103 => BadVersion,
            -108 => NoChildrenForEphemerals,
            -110 => NodeExists,
            -111 => NotEmpty,
            -112 => SessionExpired,
            -114 => InvalidAcl,
            -116 => Closing,
            _ => return None,
        };
        Some(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_roundtrip() {
        for err in [
            ErrorCode::Ok,
            ErrorCode::RuntimeInconsistency,
            ErrorCode::OperationTimeout,
            ErrorCode::BadArguments,
            ErrorCode::NoNode,
            ErrorCode::NoAuth,
            ErrorCode::BadVersion,
            ErrorCode::NoChildrenForEphemerals,
            ErrorCode::NodeExists,
            ErrorCode::NotEmpty,
            ErrorCode::SessionExpired,
            ErrorCode::InvalidAcl,
            ErrorCode::Closing,
        ] {
            assert_eq!(ErrorCode::from_code(err.code()), Some(err));
        }
        assert_eq!(ErrorCode::from_code(42), None);
    }
}
