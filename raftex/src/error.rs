//! Node error types.

use tonic::Status;

/// Error string returned by the admin service when a configuration change is
/// sent to a non-leader. Callers match on it to retry against another node.
pub const NOT_LEADER_SENTINEL: &str = "node is not the leader";

/// Errors produced by the replication layer.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// The request names an endpoint the Executor does not serve.
    #[error("endpoint {endpoint:?} is not served by the executor")]
    InvalidEndpoint {
        /// The endpoint extracted from the request header.
        endpoint: String,
    },

    /// A leader-side Executor snapshot is running; writes are not admitted.
    #[error("cannot accept writes while a snapshot is in progress")]
    SnapshotInFlight,

    /// The proposal was handled by a node that is not the leader.
    #[error("node is not the leader")]
    NotLeader {
        /// Last known leader, if any.
        leader_hint: Option<u64>,
    },

    /// The proposal did not commit and apply within the proposer deadline.
    #[error("proposal did not complete within {timeout_ms} ms")]
    RaftTimeout {
        /// The deadline that expired.
        timeout_ms: u64,
    },

    /// The downstream Executor RPC failed; carried through to the client.
    #[error("executor call failed: {0}")]
    Executor(#[source] Status),

    /// Snapshot polling reported FAILED or timed out.
    #[error("snapshot {id} failed: {reason}")]
    SnapshotFailure {
        /// Executor-assigned snapshot id.
        id: String,
        /// Terminal status or timeout description.
        reason: String,
    },

    /// Restore polling reported FAILED or timed out. Fatal to this replica.
    #[error("restore {id} failed: {reason}")]
    RestoreFailure {
        /// Executor-assigned restore id.
        id: String,
        /// Terminal status or timeout description.
        reason: String,
    },

    /// A request could not be decoded from log-entry bytes.
    #[error("cannot decode request: {0}")]
    Marshal(#[from] prost::DecodeError),

    /// An out-of-band administrative operation failed.
    #[error("admin operation failed: {message}")]
    Admin {
        /// Failure description reported by the target node.
        message: String,
    },

    /// The Executor could not be reached.
    #[error("executor unreachable at {target}: {reason}")]
    Dial {
        /// The configured Executor address.
        target: String,
        /// Transport-level failure description.
        reason: String,
    },

    /// Durable store failure.
    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    /// Error surfaced by the consensus library.
    #[error("raft error: {0}")]
    Raft(#[from] raft::Error),
}

impl NodeError {
    /// Whether a client library may transparently retry (possibly against
    /// another node) after seeing this error.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::NotLeader { .. } | Self::RaftTimeout { .. } | Self::Dial { .. }
        )
    }
}

impl From<NodeError> for Status {
    fn from(err: NodeError) -> Status {
        match err {
            NodeError::InvalidEndpoint { .. } => Status::invalid_argument(err.to_string()),
            NodeError::SnapshotInFlight => Status::failed_precondition(err.to_string()),
            NodeError::NotLeader { .. } => Status::unavailable(err.to_string()),
            NodeError::RaftTimeout { .. } => Status::deadline_exceeded(err.to_string()),
            NodeError::Executor(status) => status,
            NodeError::Dial { .. } => Status::unavailable(err.to_string()),
            NodeError::Marshal(_) => Status::invalid_argument(err.to_string()),
            NodeError::SnapshotFailure { .. }
            | NodeError::RestoreFailure { .. }
            | NodeError::Admin { .. }
            | NodeError::Storage(_)
            | NodeError::Raft(_) => Status::internal(err.to_string()),
        }
    }
}

/// Result type for node operations.
pub type NodeResult<T> = Result<T, NodeError>;

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Code;

    #[test]
    fn retriable_classification() {
        assert!(NodeError::NotLeader { leader_hint: None }.is_retriable());
        assert!(NodeError::RaftTimeout { timeout_ms: 1000 }.is_retriable());
        assert!(!NodeError::SnapshotInFlight.is_retriable());
        assert!(!NodeError::InvalidEndpoint {
            endpoint: "/unknown".into()
        }
        .is_retriable());
    }

    #[test]
    fn status_codes() {
        let status: Status = NodeError::InvalidEndpoint {
            endpoint: "/unknown".into(),
        }
        .into();
        assert_eq!(status.code(), Code::InvalidArgument);

        let status: Status = NodeError::SnapshotInFlight.into();
        assert_eq!(status.code(), Code::FailedPrecondition);

        let status: Status = NodeError::NotLeader { leader_hint: None }.into();
        assert_eq!(status.code(), Code::Unavailable);

        let status: Status = NodeError::RaftTimeout { timeout_ms: 1000 }.into();
        assert_eq!(status.code(), Code::DeadlineExceeded);
    }

    #[test]
    fn executor_status_passes_through() {
        let inner = Status::not_found("doc missing");
        let status: Status = NodeError::Executor(inner).into();
        assert_eq!(status.code(), Code::NotFound);
        assert_eq!(status.message(), "doc missing");
    }

    #[test]
    fn not_leader_message_carries_sentinel() {
        let err = NodeError::NotLeader { leader_hint: Some(2) };
        assert_eq!(err.to_string(), NOT_LEADER_SENTINEL);
    }
}
