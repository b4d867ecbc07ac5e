//! End-to-end checks of the state machine against a stub Executor served
//! in-process over gRPC.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use prost::Message;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tonic::{Request, Response, Status};

use raftex::executor::pb::endpoint_discovery_rpc_server::{
    EndpointDiscoveryRpc, EndpointDiscoveryRpcServer,
};
use raftex::executor::pb::executor_restore_rpc_server::{
    ExecutorRestoreRpc, ExecutorRestoreRpcServer,
};
use raftex::executor::pb::executor_snapshot_rpc_server::{
    ExecutorSnapshotRpc, ExecutorSnapshotRpcServer,
};
use raftex::executor::pb::single_data_rpc_server::{SingleDataRpc, SingleDataRpcServer};
use raftex::executor::pb::{
    DataRequestProto, EndpointsProto, HeaderProto, RestoreCommandProto, RestoreInfoProto,
    SnapshotIdProto, SnapshotInfoProto, SnapshotStatusProto,
};
use raftex::executor::ExecutorClient;
use raftex::fsm::ExecutorFsm;
use raftex::raft::{ApplyOutcome, StateMachine};
use raftex::snapshot::SnapshotState;

#[derive(Default)]
struct StubState {
    applied: Vec<(String, Vec<u8>)>,
    snapshot_polls: u32,
    restored: Option<Vec<u8>>,
}

#[derive(Clone)]
struct StubExecutor {
    state: Arc<Mutex<StubState>>,
    snapshot_dir: PathBuf,
}

#[tonic::async_trait]
impl SingleDataRpc for StubExecutor {
    async fn process_single_data(
        &self,
        request: Request<DataRequestProto>,
    ) -> Result<Response<DataRequestProto>, Status> {
        let request = request.into_inner();
        let endpoint = request
            .header
            .as_ref()
            .map(|h| h.exec_endpoint.clone())
            .unwrap_or_default();

        if endpoint == "/fail" {
            return Err(Status::invalid_argument("stub rejects /fail"));
        }

        self.state
            .lock()
            .unwrap()
            .applied
            .push((endpoint, request.payload.clone()));

        // echo with a marker so callers can tell the response apart
        let mut response = request;
        response.payload.extend_from_slice(b":done");
        Ok(Response::new(response))
    }
}

#[tonic::async_trait]
impl EndpointDiscoveryRpc for StubExecutor {
    async fn endpoint_discovery(
        &self,
        _request: Request<()>,
    ) -> Result<Response<EndpointsProto>, Status> {
        Ok(Response::new(EndpointsProto {
            write_endpoints: vec!["/index".to_string(), "/fail".to_string()],
            read_endpoints: vec!["/search".to_string()],
        }))
    }
}

#[tonic::async_trait]
impl ExecutorSnapshotRpc for StubExecutor {
    async fn snapshot(
        &self,
        _request: Request<()>,
    ) -> Result<Response<SnapshotInfoProto>, Status> {
        let file = self.snapshot_dir.join("snap-1.bin");
        std::fs::write(&file, b"executor snapshot bytes").unwrap();
        Ok(Response::new(SnapshotInfoProto {
            id: "snap-1".to_string(),
            status: SnapshotStatusProto::Running as i32,
            snapshot_file: file.to_string_lossy().into_owned(),
        }))
    }

    /// Stays RUNNING for the first poll so the controller actually loops.
    async fn snapshot_status(
        &self,
        request: Request<SnapshotIdProto>,
    ) -> Result<Response<SnapshotInfoProto>, Status> {
        let id = request.into_inner().value;
        let mut state = self.state.lock().unwrap();
        state.snapshot_polls += 1;
        let status = if state.snapshot_polls > 1 {
            SnapshotStatusProto::Succeeded
        } else {
            SnapshotStatusProto::Running
        };
        Ok(Response::new(SnapshotInfoProto {
            id,
            status: status as i32,
            snapshot_file: String::new(),
        }))
    }
}

#[tonic::async_trait]
impl ExecutorRestoreRpc for StubExecutor {
    async fn restore(
        &self,
        request: Request<RestoreCommandProto>,
    ) -> Result<Response<RestoreInfoProto>, Status> {
        let path = request.into_inner().snapshot_file;
        let bytes = std::fs::read(&path)
            .map_err(|e| Status::invalid_argument(format!("cannot read {path}: {e}")))?;
        self.state.lock().unwrap().restored = Some(bytes);
        Ok(Response::new(RestoreInfoProto {
            id: "restore-1".to_string(),
            status: SnapshotStatusProto::Running as i32,
        }))
    }

    async fn restore_status(
        &self,
        request: Request<SnapshotIdProto>,
    ) -> Result<Response<RestoreInfoProto>, Status> {
        Ok(Response::new(RestoreInfoProto {
            id: request.into_inner().value,
            status: SnapshotStatusProto::Succeeded as i32,
        }))
    }
}

async fn start_stub(snapshot_dir: PathBuf) -> (String, Arc<Mutex<StubState>>) {
    let state = Arc::new(Mutex::new(StubState::default()));
    let stub = StubExecutor {
        state: state.clone(),
        snapshot_dir,
    };

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let incoming = TcpListenerStream::new(listener);

    tokio::spawn(
        Server::builder()
            .add_service(SingleDataRpcServer::new(stub.clone()))
            .add_service(EndpointDiscoveryRpcServer::new(stub.clone()))
            .add_service(ExecutorSnapshotRpcServer::new(stub.clone()))
            .add_service(ExecutorRestoreRpcServer::new(stub))
            .serve_with_incoming(incoming),
    );

    (format!("http://{addr}"), state)
}

fn encoded_request(endpoint: &str, request_id: &str, payload: &[u8]) -> Vec<u8> {
    DataRequestProto {
        header: Some(HeaderProto {
            exec_endpoint: endpoint.to_string(),
            request_id: request_id.to_string(),
        }),
        payload: payload.to_vec(),
    }
    .encode_to_vec()
}

#[tokio::test]
async fn apply_forwards_entries_to_the_executor() {
    let dir = tempfile::tempdir().unwrap();
    let (target, state) = start_stub(dir.path().to_path_buf()).await;
    let fsm = ExecutorFsm::new(ExecutorClient::new(&target).unwrap());

    let outcome = fsm
        .apply(2, &encoded_request("/index", "req-1", b"doc"))
        .await;
    match outcome {
        ApplyOutcome::Response(response) => {
            assert_eq!(response.payload, b"doc:done");
        }
        ApplyOutcome::Error(message) => panic!("apply failed: {message}"),
    }

    let applied = state.lock().unwrap().applied.clone();
    assert_eq!(applied, vec![("/index".to_string(), b"doc".to_vec())]);
}

#[tokio::test]
async fn apply_carries_executor_errors_back() {
    let dir = tempfile::tempdir().unwrap();
    let (target, state) = start_stub(dir.path().to_path_buf()).await;
    let fsm = ExecutorFsm::new(ExecutorClient::new(&target).unwrap());

    match fsm.apply(2, &encoded_request("/fail", "req-1", b"doc")).await {
        ApplyOutcome::Error(message) => assert!(message.contains("stub rejects /fail")),
        ApplyOutcome::Response(_) => panic!("stub must reject /fail"),
    }
    assert!(state.lock().unwrap().applied.is_empty());
}

#[tokio::test]
async fn discovery_populates_the_classifier() {
    let dir = tempfile::tempdir().unwrap();
    let (target, _state) = start_stub(dir.path().to_path_buf()).await;
    let fsm = ExecutorFsm::new(ExecutorClient::new(&target).unwrap());

    assert!(fsm.endpoints().is_empty());
    fsm.discover_endpoints().await.unwrap();

    use raftex::executor::endpoints::Classification;
    assert_eq!(fsm.classify("/index"), Classification::Write);
    assert_eq!(fsm.classify("/search"), Classification::Read);
    assert_eq!(fsm.classify("/nope"), Classification::Unknown);
}

#[tokio::test]
async fn weak_read_reaches_the_executor_directly() {
    let dir = tempfile::tempdir().unwrap();
    let (target, _state) = start_stub(dir.path().to_path_buf()).await;
    let fsm = ExecutorFsm::new(ExecutorClient::new(&target).unwrap());

    let response = fsm
        .read(DataRequestProto {
            header: Some(HeaderProto {
                exec_endpoint: "/search".to_string(),
                request_id: "req-9".to_string(),
            }),
            payload: b"query".to_vec(),
        })
        .await
        .unwrap();
    assert_eq!(response.payload, b"query:done");
}

#[tokio::test]
async fn snapshot_protocol_collects_the_executor_file() {
    let dir = tempfile::tempdir().unwrap();
    let (target, _state) = start_stub(dir.path().to_path_buf()).await;
    let fsm = ExecutorFsm::new(ExecutorClient::new(&target).unwrap());

    let handle = fsm.begin_snapshot().await.unwrap();
    assert!(fsm.snapshot_in_progress());
    assert_eq!(handle.id(), "snap-1");

    let data = fsm.collect_snapshot(handle.clone()).await.unwrap();
    assert_eq!(data, b"executor snapshot bytes");
    assert_eq!(handle.state(), SnapshotState::Succeeded);
    // the executor-side file is consumed
    assert!(!handle.snapshot_file().exists());

    fsm.release_snapshot();
    assert!(!fsm.snapshot_in_progress());
}

#[tokio::test]
async fn restore_pushes_the_payload_into_the_executor() {
    let dir = tempfile::tempdir().unwrap();
    let (target, state) = start_stub(dir.path().to_path_buf()).await;
    let fsm = ExecutorFsm::new(ExecutorClient::new(&target).unwrap());

    fsm.restore(7, 2, b"snapshot payload").await.unwrap();
    assert_eq!(
        state.lock().unwrap().restored.as_deref(),
        Some(&b"snapshot payload"[..])
    );
}
