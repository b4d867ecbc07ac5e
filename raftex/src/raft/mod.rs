//! Raft coordination layer.
//!
//! This module drives the consensus core over durable file storage and hands
//! committed entries to a state machine that fronts the local Executor.

pub mod membership;
pub mod node;
pub mod proposal;
mod segment;
pub mod storage;

use std::sync::Arc;

use crate::error::NodeResult;
use crate::executor::pb::DataRequestProto;
use crate::snapshot::SnapshotHandle;

/// Result of applying one committed entry. Delivered to the proposer through
/// the pending-proposal table on the leader; discarded on followers.
#[derive(Debug, Clone)]
pub enum ApplyOutcome {
    /// The Executor's response to the replicated request.
    Response(DataRequestProto),
    /// The apply failed; carries the error description.
    Error(String),
}

/// State machine managed by the raft driver.
///
/// `apply` sees committed entries exactly once per process lifetime, in log
/// order; the snapshot methods implement the asynchronous Executor-side
/// snapshot protocol.
#[async_trait::async_trait]
pub trait StateMachine: Send + Sync + 'static {
    /// Applies a committed entry. Waits while a snapshot is in progress.
    async fn apply(&self, index: u64, data: &[u8]) -> ApplyOutcome;

    /// Starts an Executor-side snapshot and records it as in progress.
    async fn begin_snapshot(&self) -> NodeResult<Arc<SnapshotHandle>>;

    /// Drives a started snapshot to completion, returning the payload bytes.
    async fn collect_snapshot(&self, handle: Arc<SnapshotHandle>) -> NodeResult<Vec<u8>>;

    /// Clears the in-progress snapshot. Idempotent.
    fn release_snapshot(&self);

    /// Loads Executor state from a snapshot payload. An error is fatal to
    /// this replica.
    async fn restore(&self, index: u64, term: u64, data: &[u8]) -> NodeResult<()>;

    /// Whether an Executor-side snapshot is currently running.
    fn snapshot_in_progress(&self) -> bool;
}
