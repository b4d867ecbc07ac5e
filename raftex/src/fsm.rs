//! The Executor-backed state machine.
//!
//! Committed log entries are framed `DataRequestProto` messages; applying one
//! forwards it to the local Executor and returns the Executor's response as a
//! tagged outcome. Snapshot and restore drive the Executor's asynchronous
//! snapshot protocol. The Peer reads endpoints and snapshot progress through
//! this type and uses the weak-read path, which takes no lock.

use std::sync::{Arc, Mutex, RwLock};

use prost::Message;

use crate::error::{NodeError, NodeResult};
use crate::executor::endpoints::{Classification, EndpointSet};
use crate::executor::pb::DataRequestProto;
use crate::executor::ExecutorClient;
use crate::raft::{ApplyOutcome, StateMachine};
use crate::snapshot::{self, SnapshotController, SnapshotHandle};

/// Interval between checks of the in-progress snapshot in `apply`.
const SNAPSHOT_WAIT_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);

pub struct ExecutorFsm {
    client: ExecutorClient,
    endpoints: RwLock<EndpointSet>,
    /// Serializes applies against snapshot setup.
    write_lock: tokio::sync::Mutex<()>,
    snapshot: Mutex<Option<Arc<SnapshotHandle>>>,
}

impl ExecutorFsm {
    pub fn new(client: ExecutorClient) -> Self {
        ExecutorFsm {
            client,
            endpoints: RwLock::new(EndpointSet::default()),
            write_lock: tokio::sync::Mutex::new(()),
            snapshot: Mutex::new(None),
        }
    }

    pub fn client(&self) -> &ExecutorClient {
        &self.client
    }

    /// Queries the Executor for its endpoint sets and caches them. Until
    /// this succeeds every request is rejected as unknown.
    pub async fn discover_endpoints(&self) -> NodeResult<()> {
        let proto = self.client.discover_endpoints().await?;
        let set = EndpointSet::from_proto(&proto);
        log::info!(
            "discovered endpoints: write={:?} read={:?}",
            proto.write_endpoints,
            proto.read_endpoints
        );
        *self.endpoints.write().unwrap() = set;
        Ok(())
    }

    pub fn endpoints(&self) -> EndpointSet {
        self.endpoints.read().unwrap().clone()
    }

    pub fn classify(&self, endpoint: &str) -> Classification {
        self.endpoints.read().unwrap().classify(endpoint)
    }

    /// Weak-read path: straight to the Executor, no lock. Interleaving with
    /// an in-flight apply is the Executor's concern.
    pub async fn read(&self, request: DataRequestProto) -> NodeResult<DataRequestProto> {
        self.client.process_single_data(request).await
    }

    fn current_snapshot(&self) -> Option<Arc<SnapshotHandle>> {
        self.snapshot.lock().unwrap().clone()
    }

    pub fn is_snapshot_in_progress(&self) -> bool {
        self.current_snapshot().map_or(false, |h| h.is_running())
    }

    async fn wait_for_snapshot(&self) {
        while self.is_snapshot_in_progress() {
            log::info!("apply is waiting: a snapshot is in progress");
            tokio::time::sleep(SNAPSHOT_WAIT_INTERVAL).await;
        }
    }

    #[cfg(test)]
    pub(crate) fn set_endpoints(&self, set: EndpointSet) {
        *self.endpoints.write().unwrap() = set;
    }

    #[cfg(test)]
    pub(crate) fn set_snapshot(&self, handle: Arc<SnapshotHandle>) {
        *self.snapshot.lock().unwrap() = Some(handle);
    }
}

#[async_trait::async_trait]
impl StateMachine for ExecutorFsm {
    async fn apply(&self, index: u64, data: &[u8]) -> ApplyOutcome {
        self.wait_for_snapshot().await;
        let _guard = self.write_lock.lock().await;

        let request = match DataRequestProto::decode(data) {
            Ok(request) => request,
            Err(e) => {
                log::error!("entry {index}: cannot decode request: {e}");
                return ApplyOutcome::Error(format!("cannot decode entry {index}: {e}"));
            }
        };
        log::debug!(
            "applying entry {index} for endpoint {:?}",
            request.header.as_ref().map(|h| h.exec_endpoint.as_str())
        );

        match self.client.process_single_data(request).await {
            Ok(response) => ApplyOutcome::Response(response),
            Err(e) => {
                log::error!("entry {index}: executor apply failed: {e}");
                ApplyOutcome::Error(e.to_string())
            }
        }
    }

    async fn begin_snapshot(&self) -> NodeResult<Arc<SnapshotHandle>> {
        let _guard = self.write_lock.lock().await;
        let info = self.client.snapshot().await?;
        let handle = Arc::new(SnapshotHandle::new(
            info.id.clone(),
            info.status,
            info.snapshot_file,
        ));
        *self.snapshot.lock().unwrap() = Some(handle.clone());
        log::info!(
            "snapshot {} started, file {}",
            info.id,
            handle.snapshot_file().display()
        );
        Ok(handle)
    }

    async fn collect_snapshot(&self, handle: Arc<SnapshotHandle>) -> NodeResult<Vec<u8>> {
        SnapshotController::new(self.client.clone(), handle)
            .collect()
            .await
    }

    fn release_snapshot(&self) {
        self.snapshot.lock().unwrap().take();
    }

    async fn restore(&self, index: u64, term: u64, data: &[u8]) -> NodeResult<()> {
        // The Executor reads the payload from a file; the temp file is
        // removed when it drops, success or not.
        let file = tempfile::NamedTempFile::new().map_err(NodeError::Storage)?;
        std::fs::write(file.path(), data).map_err(NodeError::Storage)?;
        log::info!(
            "restoring executor state at index {index} term {term} from {}",
            file.path().display()
        );

        let restore = self.client.restore(file.path()).await?;
        snapshot::await_restore(&self.client, &restore.id).await?;
        log::info!("restore {} finished at index {index}", restore.id);
        Ok(())
    }

    fn snapshot_in_progress(&self) -> bool {
        self.is_snapshot_in_progress()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::pb::{HeaderProto, SnapshotStatusProto};
    use crate::snapshot::SnapshotState;

    fn fsm() -> ExecutorFsm {
        ExecutorFsm::new(ExecutorClient::new("localhost:54321").unwrap())
    }

    #[test]
    fn framing_preserves_header_and_payload() {
        let request = DataRequestProto {
            header: Some(HeaderProto {
                exec_endpoint: "/index".to_string(),
                request_id: "req-1".to_string(),
            }),
            payload: b"opaque".to_vec(),
        };
        let bytes = request.encode_to_vec();
        let decoded = DataRequestProto::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded, request);
    }

    #[tokio::test]
    async fn snapshot_gate_follows_handle_state() {
        let fsm = fsm();
        assert!(!fsm.is_snapshot_in_progress());

        let handle = Arc::new(SnapshotHandle::new(
            "snap-1".to_string(),
            SnapshotStatusProto::Running as i32,
            "/tmp/snap".to_string(),
        ));
        *fsm.snapshot.lock().unwrap() = Some(handle.clone());
        assert!(fsm.is_snapshot_in_progress());

        handle.set_state(SnapshotState::Succeeded);
        assert!(!fsm.is_snapshot_in_progress());

        fsm.release_snapshot();
        assert!(fsm.current_snapshot().is_none());
    }

    #[tokio::test]
    async fn apply_rejects_garbage_entries() {
        let fsm = fsm();
        match fsm.apply(3, b"\xff\xfe not proto").await {
            ApplyOutcome::Error(message) => assert!(message.contains("entry 3")),
            ApplyOutcome::Response(_) => panic!("garbage must not produce a response"),
        }
    }
}
