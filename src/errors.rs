//! Wire-visible error kinds shared by the coordinator service, the client,
//! and the federator mirror.
//!
//! Every RPC failure is one of six kinds. `NotLeader` carries the leader's
//! gRPC address (when known) so callers can retry against the right node;
//! on the wire it travels in the `x-leader-addr` response metadata entry.

use thiserror::Error;
use tonic::metadata::MetadataValue;
use tonic::{Code, Status};

/// Response metadata key carrying the leader's gRPC address on `NotLeader`.
pub const LEADER_ADDR_KEY: &str = "x-leader-addr";

/// Errors surfaced across the coordinator RPC boundary.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoordError {
    /// Missing path or missing cluster node.
    #[error("not found")]
    NotFound,

    /// A write was attempted on a follower. Retry against `leader_addr`.
    #[error("not leader (leader at {leader_addr:?})")]
    NotLeader { leader_addr: Option<String> },

    /// Unsupported value type or non-string mapping key.
    #[error("bad encoding: {0}")]
    BadEncoding(String),

    /// The caller's deadline expired before the operation completed.
    #[error("deadline exceeded")]
    Deadline,

    /// Raft is not ready: bootstrapping, or no leader elected yet.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Unexpected invariant violation; logged with context at the source.
    #[error("internal: {0}")]
    Internal(String),
}

impl CoordError {
    pub fn internal(msg: impl std::fmt::Display) -> Self {
        CoordError::Internal(msg.to_string())
    }

    pub fn unavailable(msg: impl std::fmt::Display) -> Self {
        CoordError::Unavailable(msg.to_string())
    }

    pub fn bad_encoding(msg: impl std::fmt::Display) -> Self {
        CoordError::BadEncoding(msg.to_string())
    }
}

impl From<CoordError> for Status {
    fn from(err: CoordError) -> Status {
        match err {
            CoordError::NotFound => Status::not_found("not found"),
            CoordError::NotLeader { leader_addr } => {
                let mut status = Status::failed_precondition("not leader");
                if let Some(addr) = leader_addr {
                    if let Ok(value) = MetadataValue::try_from(addr.as_str()) {
                        status.metadata_mut().insert(LEADER_ADDR_KEY, value);
                    }
                }
                status
            }
            CoordError::BadEncoding(msg) => Status::invalid_argument(msg),
            CoordError::Deadline => Status::deadline_exceeded("deadline exceeded"),
            CoordError::Unavailable(msg) => Status::unavailable(msg),
            CoordError::Internal(msg) => Status::internal(msg),
        }
    }
}

impl From<Status> for CoordError {
    fn from(status: Status) -> CoordError {
        match status.code() {
            Code::NotFound => CoordError::NotFound,
            Code::FailedPrecondition => CoordError::NotLeader {
                leader_addr: status
                    .metadata()
                    .get(LEADER_ADDR_KEY)
                    .and_then(|v| v.to_str().ok())
                    .map(String::from),
            },
            Code::InvalidArgument => CoordError::BadEncoding(status.message().to_string()),
            Code::DeadlineExceeded => CoordError::Deadline,
            Code::Unavailable => CoordError::Unavailable(status.message().to_string()),
            _ => CoordError::Internal(status.message().to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_maps_to_not_found_code() {
        let status: Status = CoordError::NotFound.into();
        assert_eq!(status.code(), Code::NotFound);
        assert_eq!(CoordError::from(status), CoordError::NotFound);
    }

    #[test]
    fn not_leader_carries_address_in_metadata() {
        let status: Status = CoordError::NotLeader {
            leader_addr: Some("10.0.0.1:17070".to_string()),
        }
        .into();
        assert_eq!(status.code(), Code::FailedPrecondition);
        assert_eq!(
            status.metadata().get(LEADER_ADDR_KEY).unwrap(),
            "10.0.0.1:17070"
        );

        let roundtrip = CoordError::from(status);
        assert_eq!(
            roundtrip,
            CoordError::NotLeader {
                leader_addr: Some("10.0.0.1:17070".to_string())
            }
        );
    }

    #[test]
    fn not_leader_without_address() {
        let status: Status = CoordError::NotLeader { leader_addr: None }.into();
        assert_eq!(
            CoordError::from(status),
            CoordError::NotLeader { leader_addr: None }
        );
    }

    #[test]
    fn bad_encoding_keeps_message() {
        let status: Status = CoordError::bad_encoding("non-string key").into();
        assert_eq!(status.code(), Code::InvalidArgument);
        assert_eq!(
            CoordError::from(status),
            CoordError::BadEncoding("non-string key".to_string())
        );
    }

    #[test]
    fn deadline_and_unavailable_roundtrip() {
        let status: Status = CoordError::Deadline.into();
        assert_eq!(CoordError::from(status), CoordError::Deadline);

        let status: Status = CoordError::unavailable("no leader yet").into();
        assert_eq!(
            CoordError::from(status),
            CoordError::Unavailable("no leader yet".to_string())
        );
    }
}
