//! Executor-side snapshot and restore lifecycle.
//!
//! Snapshots are asynchronous on the Executor: requesting one returns an id
//! and the path of the file the Executor will produce. The controller polls
//! the status every second until a terminal state or the overall timeout,
//! then collects the file contents for the raft snapshot store. Restore is
//! symmetric, minus the file collection.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};

use crate::error::{NodeError, NodeResult};
use crate::executor::pb::SnapshotStatusProto;
use crate::executor::ExecutorClient;

/// Interval between status polls.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Hard cap on one snapshot or restore operation.
pub const OVERALL_TIMEOUT: Duration = Duration::from_secs(500);

/// Progress of an Executor-side snapshot or restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SnapshotState {
    Running = 0,
    Succeeded = 1,
    Failed = 2,
}

impl SnapshotState {
    /// Maps the wire status onto the local state. Anything non-terminal
    /// counts as running.
    pub fn from_proto(status: i32) -> SnapshotState {
        match SnapshotStatusProto::from_i32(status) {
            Some(SnapshotStatusProto::Succeeded) => SnapshotState::Succeeded,
            Some(SnapshotStatusProto::Failed) => SnapshotState::Failed,
            _ => SnapshotState::Running,
        }
    }

    fn from_u8(value: u8) -> SnapshotState {
        match value {
            1 => SnapshotState::Succeeded,
            2 => SnapshotState::Failed,
            _ => SnapshotState::Running,
        }
    }
}

/// Bookkeeping for one in-flight snapshot. The status field is written by
/// the polling task and read concurrently by write admission and the apply
/// wait loop.
#[derive(Debug)]
pub struct SnapshotHandle {
    id: String,
    status: AtomicU8,
    snapshot_file: PathBuf,
}

impl SnapshotHandle {
    pub fn new(id: String, status: i32, snapshot_file: String) -> Self {
        SnapshotHandle {
            id,
            status: AtomicU8::new(SnapshotState::from_proto(status) as u8),
            snapshot_file: PathBuf::from(snapshot_file),
        }
    }

    /// Executor-assigned snapshot id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Path where the Executor deposits the snapshot file.
    pub fn snapshot_file(&self) -> &std::path::Path {
        &self.snapshot_file
    }

    pub fn state(&self) -> SnapshotState {
        SnapshotState::from_u8(self.status.load(Ordering::SeqCst))
    }

    pub fn set_state(&self, state: SnapshotState) {
        self.status.store(state as u8, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.state() == SnapshotState::Running
    }
}

/// Drives one snapshot from RUNNING to collected bytes.
pub struct SnapshotController {
    client: ExecutorClient,
    handle: Arc<SnapshotHandle>,
}

impl SnapshotController {
    pub fn new(client: ExecutorClient, handle: Arc<SnapshotHandle>) -> Self {
        SnapshotController { client, handle }
    }

    /// Polls until the snapshot reaches a terminal status, then reads and
    /// removes the Executor-produced file. Timeout or a FAILED status marks
    /// the handle failed and nothing reaches the snapshot store.
    pub async fn collect(self) -> NodeResult<Vec<u8>> {
        let id = self.handle.id().to_string();
        let deadline = Instant::now() + OVERALL_TIMEOUT;
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            if Instant::now() >= deadline {
                self.handle.set_state(SnapshotState::Failed);
                return Err(NodeError::SnapshotFailure {
                    id,
                    reason: format!("no terminal status within {}s", OVERALL_TIMEOUT.as_secs()),
                });
            }
            ticker.tick().await;

            match self.client.snapshot_status(&id).await {
                Ok(info) => {
                    let state = SnapshotState::from_proto(info.status);
                    self.handle.set_state(state);
                    match state {
                        SnapshotState::Running => {}
                        SnapshotState::Succeeded => break,
                        SnapshotState::Failed => {
                            return Err(NodeError::SnapshotFailure {
                                id,
                                reason: "executor reported FAILED".to_string(),
                            });
                        }
                    }
                }
                // Keep polling through transient status failures; the
                // overall timer bounds the attempt.
                Err(e) => log::warn!("snapshot {id}: status check failed: {e}"),
            }
        }

        let data = tokio::fs::read(self.handle.snapshot_file())
            .await
            .map_err(|e| {
                self.handle.set_state(SnapshotState::Failed);
                NodeError::SnapshotFailure {
                    id: id.clone(),
                    reason: format!(
                        "cannot read snapshot file {}: {e}",
                        self.handle.snapshot_file().display()
                    ),
                }
            })?;
        if let Err(e) = tokio::fs::remove_file(self.handle.snapshot_file()).await {
            log::warn!(
                "snapshot {id}: cannot remove {}: {e}",
                self.handle.snapshot_file().display()
            );
        }
        log::info!("snapshot {id}: collected {} bytes", data.len());
        Ok(data)
    }
}

/// Polls a running restore until it succeeds; FAILED or timeout is an error.
pub async fn await_restore(client: &ExecutorClient, id: &str) -> NodeResult<()> {
    let deadline = Instant::now() + OVERALL_TIMEOUT;
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        if Instant::now() >= deadline {
            return Err(NodeError::RestoreFailure {
                id: id.to_string(),
                reason: format!("no terminal status within {}s", OVERALL_TIMEOUT.as_secs()),
            });
        }
        ticker.tick().await;

        match client.restore_status(id).await {
            Ok(info) => match SnapshotState::from_proto(info.status) {
                SnapshotState::Running => {}
                SnapshotState::Succeeded => return Ok(()),
                SnapshotState::Failed => {
                    return Err(NodeError::RestoreFailure {
                        id: id.to_string(),
                        reason: "executor reported FAILED".to_string(),
                    });
                }
            },
            Err(e) => log::warn!("restore {id}: status check failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proto_status_mapping() {
        assert_eq!(
            SnapshotState::from_proto(SnapshotStatusProto::Running as i32),
            SnapshotState::Running
        );
        assert_eq!(
            SnapshotState::from_proto(SnapshotStatusProto::Succeeded as i32),
            SnapshotState::Succeeded
        );
        assert_eq!(
            SnapshotState::from_proto(SnapshotStatusProto::Failed as i32),
            SnapshotState::Failed
        );
        // Unknown statuses are treated as still running.
        assert_eq!(SnapshotState::from_proto(42), SnapshotState::Running);
    }

    #[test]
    fn handle_state_transitions_are_visible() {
        let handle = SnapshotHandle::new(
            "snap-1".to_string(),
            SnapshotStatusProto::Running as i32,
            "/tmp/snap-1".to_string(),
        );
        assert!(handle.is_running());

        handle.set_state(SnapshotState::Succeeded);
        assert!(!handle.is_running());
        assert_eq!(handle.state(), SnapshotState::Succeeded);

        handle.set_state(SnapshotState::Failed);
        assert_eq!(handle.state(), SnapshotState::Failed);
    }
}
