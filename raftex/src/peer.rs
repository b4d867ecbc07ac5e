//! Client-facing request surface.
//!
//! Every replica serves the Executor's own request API. Incoming requests
//! are classified by endpoint: writes are proposed through the log, reads go
//! either through the log (strong mode) or straight to the local Executor
//! (eventual mode), and unknown endpoints are rejected.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use prost::Message as _;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};

use crate::config::ConsistencyMode;
use crate::error::NodeError;
use crate::executor::endpoints::Classification;
use crate::executor::health_pb;
use crate::executor::pb::endpoint_discovery_rpc_server::EndpointDiscoveryRpc;
use crate::executor::pb::info_rpc_server::InfoRpc;
use crate::executor::pb::single_data_rpc_server::SingleDataRpc;
use crate::executor::pb::stream_data_rpc_server::StreamDataRpc;
use crate::executor::pb::{DataRequestProto, EndpointsProto, HeaderProto, InfoProto};
use crate::fsm::ExecutorFsm;
use crate::metrics;
use crate::raft::node::RaftStatus;
use crate::raft::proposal::{Proposal, ProposalReply};
use crate::raft::ApplyOutcome;

/// Proposer-side deadline on one replicated request.
const PROPOSE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct PeerService {
    fsm: Arc<ExecutorFsm>,
    status: Arc<RaftStatus>,
    proposals: mpsc::Sender<Proposal>,
    consistency: ConsistencyMode,
    node_id: u64,
    request_seq: Arc<AtomicU64>,
}

impl PeerService {
    pub fn new(
        fsm: Arc<ExecutorFsm>,
        status: Arc<RaftStatus>,
        proposals: mpsc::Sender<Proposal>,
        consistency: ConsistencyMode,
        node_id: u64,
    ) -> Self {
        PeerService {
            fsm,
            status,
            proposals,
            consistency,
            node_id,
            request_seq: Arc::new(AtomicU64::new(0)),
        }
    }

    fn next_request_id(&self) -> String {
        format!(
            "{}-{}",
            self.node_id,
            self.request_seq.fetch_add(1, Ordering::Relaxed)
        )
    }

    async fn route(&self, request: DataRequestProto) -> Result<DataRequestProto, Status> {
        let endpoint = request
            .header
            .as_ref()
            .map(|h| h.exec_endpoint.clone())
            .unwrap_or_default();

        match self.fsm.classify(&endpoint) {
            Classification::Unknown => Err(NodeError::InvalidEndpoint { endpoint }.into()),
            Classification::Write => self.handle_write(request).await,
            Classification::Read => self.handle_read(request).await,
        }
    }

    async fn handle_write(&self, request: DataRequestProto) -> Result<DataRequestProto, Status> {
        // A snapshotting leader sheds writes instead of queuing behind the
        // snapshot.
        if self.status.is_leader() && self.fsm.is_snapshot_in_progress() {
            return Err(NodeError::SnapshotInFlight.into());
        }
        self.replicate(request).await
    }

    async fn handle_read(&self, request: DataRequestProto) -> Result<DataRequestProto, Status> {
        match self.consistency {
            ConsistencyMode::Eventual => self.fsm.read(request).await.map_err(Status::from),
            // Strong reads are linearized by running through the log like a
            // write.
            ConsistencyMode::Strong => self.replicate(request).await,
        }
    }

    async fn replicate(&self, mut request: DataRequestProto) -> Result<DataRequestProto, Status> {
        let header = request.header.get_or_insert_with(HeaderProto::default);
        if header.request_id.is_empty() {
            header.request_id = self.next_request_id();
        }
        let request_id = header.request_id.clone();

        let data = request.encode_to_vec();
        let (proposal, reply) = Proposal::normal(request_id, data);
        self.proposals
            .send(proposal)
            .await
            .map_err(|_| Status::unavailable("raft driver is shut down"))?;

        let reply = tokio::time::timeout(PROPOSE_TIMEOUT, reply)
            .await
            .map_err(|_| {
                Status::from(NodeError::RaftTimeout {
                    timeout_ms: PROPOSE_TIMEOUT.as_millis() as u64,
                })
            })?
            .map_err(|_| {
                // the driver dropped the reply channel mid-churn
                Status::from(NodeError::NotLeader {
                    leader_hint: self.status.leader_id(),
                })
            })?;

        match reply {
            ProposalReply::Applied(ApplyOutcome::Response(response)) => Ok(response),
            ProposalReply::Applied(ApplyOutcome::Error(message)) => {
                Err(Status::internal(message))
            }
            ProposalReply::NotLeader { leader_hint } => {
                Err(NodeError::NotLeader { leader_hint }.into())
            }
            ProposalReply::Superseded => Err(Status::unavailable(
                "log position was taken by a new leader, retry",
            )),
        }
    }
}

#[tonic::async_trait]
impl SingleDataRpc for PeerService {
    async fn process_single_data(
        &self,
        request: Request<DataRequestProto>,
    ) -> Result<Response<DataRequestProto>, Status> {
        metrics::record_metrics("process_single_data", || async {
            self.route(request.into_inner()).await.map(Response::new)
        })
        .await
    }
}

#[tonic::async_trait]
impl StreamDataRpc for PeerService {
    type StreamDataStream =
        Pin<Box<dyn tokio_stream::Stream<Item = Result<DataRequestProto, Status>> + Send>>;

    /// Routes each message of the stream exactly like a unary call.
    async fn stream_data(
        &self,
        request: Request<Streaming<DataRequestProto>>,
    ) -> Result<Response<Self::StreamDataStream>, Status> {
        let mut inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(16);
        let peer = self.clone();

        tokio::spawn(async move {
            loop {
                match inbound.message().await {
                    Ok(Some(message)) => {
                        let result = peer.route(message).await;
                        if tx.send(result).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(status) => {
                        let _ = tx.send(Err(status)).await;
                        break;
                    }
                }
            }
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}

#[tonic::async_trait]
impl EndpointDiscoveryRpc for PeerService {
    async fn endpoint_discovery(
        &self,
        _request: Request<()>,
    ) -> Result<Response<EndpointsProto>, Status> {
        let mut endpoints = self.fsm.endpoints();
        if endpoints.is_empty() {
            // initial discovery may still be pending; ask again on demand
            if self.fsm.discover_endpoints().await.is_ok() {
                endpoints = self.fsm.endpoints();
            }
        }
        Ok(Response::new(endpoints.to_proto()))
    }
}

#[tonic::async_trait]
impl InfoRpc for PeerService {
    async fn x_status(
        &self,
        _request: Request<()>,
    ) -> Result<Response<InfoProto>, Status> {
        let mut info = self.fsm.client().xstatus().await.map_err(Status::from)?;
        info.details
            .insert("raft_id".to_string(), self.node_id.to_string());
        info.details.insert(
            "raft_role".to_string(),
            if self.status.is_leader() {
                "leader".to_string()
            } else {
                "follower".to_string()
            },
        );
        if let Some(leader) = self.status.leader_id() {
            info.details
                .insert("raft_leader".to_string(), leader.to_string());
        }
        info.details
            .insert("raft_term".to_string(), self.status.term().to_string());
        info.details
            .insert("raft_applied".to_string(), self.status.applied().to_string());
        Ok(Response::new(info))
    }
}

#[tonic::async_trait]
impl health_pb::health_server::Health for PeerService {
    /// Health is the Executor's health.
    async fn check(
        &self,
        _request: Request<health_pb::HealthCheckRequest>,
    ) -> Result<Response<health_pb::HealthCheckResponse>, Status> {
        let response = self.fsm.client().health_check().await.map_err(Status::from)?;
        Ok(Response::new(response))
    }

    type WatchStream =
        Pin<Box<dyn tokio_stream::Stream<Item = Result<health_pb::HealthCheckResponse, Status>> + Send>>;

    /// Reports SERVING once and closes the stream.
    async fn watch(
        &self,
        _request: Request<health_pb::HealthCheckRequest>,
    ) -> Result<Response<Self::WatchStream>, Status> {
        let (tx, rx) = mpsc::channel(1);
        let _ = tx
            .send(Ok(health_pb::HealthCheckResponse {
                status: health_pb::health_check_response::ServingStatus::Serving as i32,
            }))
            .await;
        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::endpoints::EndpointSet;
    use crate::executor::ExecutorClient;
    use tonic::Code;

    fn peer_with_driver(
        consistency: ConsistencyMode,
    ) -> (PeerService, mpsc::Receiver<Proposal>, Arc<RaftStatus>) {
        let fsm = Arc::new(ExecutorFsm::new(
            ExecutorClient::new("localhost:1").unwrap(),
        ));
        fsm.set_endpoints(EndpointSet::new(
            vec!["/index".to_string()],
            vec!["/search".to_string()],
        ));
        let status = Arc::new(RaftStatus::default());
        let (proposal_tx, proposal_rx) = mpsc::channel(8);
        let peer = PeerService::new(fsm, status.clone(), proposal_tx, consistency, 1);
        (peer, proposal_rx, status)
    }

    fn request(endpoint: &str) -> DataRequestProto {
        DataRequestProto {
            header: Some(HeaderProto {
                exec_endpoint: endpoint.to_string(),
                request_id: String::new(),
            }),
            payload: b"payload".to_vec(),
        }
    }

    #[tokio::test]
    async fn unknown_endpoint_is_rejected_without_proposing() {
        let (peer, mut proposals, _) = peer_with_driver(ConsistencyMode::Eventual);
        let status = peer.route(request("/unknown")).await.unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);
        assert!(proposals.try_recv().is_err());
    }

    #[tokio::test]
    async fn missing_header_is_rejected() {
        let (peer, _, _) = peer_with_driver(ConsistencyMode::Eventual);
        let status = peer
            .route(DataRequestProto {
                header: None,
                payload: vec![],
            })
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn write_is_proposed_and_answered() {
        let (peer, mut proposals, _) = peer_with_driver(ConsistencyMode::Eventual);

        let driver = tokio::spawn(async move {
            let mut proposal = proposals.recv().await.unwrap();
            let data = proposal.normal.take().unwrap();
            let entry = DataRequestProto::decode(data.as_slice()).unwrap();
            assert_eq!(entry.header.as_ref().unwrap().exec_endpoint, "/index");
            assert!(!entry.header.as_ref().unwrap().request_id.is_empty());

            let tx = proposal.data_reply.take().unwrap();
            let _ = tx.send(ProposalReply::Applied(ApplyOutcome::Response(entry)));
        });

        let response = peer.route(request("/index")).await.unwrap();
        assert_eq!(response.payload, b"payload");
        driver.await.unwrap();
    }

    #[tokio::test]
    async fn snapshotting_leader_sheds_writes() {
        use crate::executor::pb::SnapshotStatusProto;
        use crate::snapshot::SnapshotHandle;

        let (peer, mut proposals, status) = peer_with_driver(ConsistencyMode::Eventual);
        status.set_role(true, 1, 1);
        peer.fsm.set_snapshot(Arc::new(SnapshotHandle::new(
            "snap-1".to_string(),
            SnapshotStatusProto::Running as i32,
            "/tmp/snap-1".to_string(),
        )));

        let err = peer.route(request("/index")).await.unwrap_err();
        assert_eq!(err.code(), Code::FailedPrecondition);
        assert!(proposals.try_recv().is_err());
    }

    #[tokio::test]
    async fn strong_read_goes_through_the_log() {
        let (peer, mut proposals, _) = peer_with_driver(ConsistencyMode::Strong);

        let driver = tokio::spawn(async move {
            let mut proposal = proposals.recv().await.unwrap();
            assert!(proposal.normal.is_some());
            let tx = proposal.data_reply.take().unwrap();
            let _ = tx.send(ProposalReply::NotLeader { leader_hint: Some(2) });
        });

        let status = peer.route(request("/search")).await.unwrap_err();
        assert_eq!(status.code(), Code::Unavailable);
        driver.await.unwrap();
    }

    #[tokio::test]
    async fn not_leader_write_is_retriable() {
        let (peer, mut proposals, _) = peer_with_driver(ConsistencyMode::Eventual);

        let driver = tokio::spawn(async move {
            let mut proposal = proposals.recv().await.unwrap();
            let tx = proposal.data_reply.take().unwrap();
            let _ = tx.send(ProposalReply::NotLeader { leader_hint: None });
        });

        let status = peer.route(request("/index")).await.unwrap_err();
        assert_eq!(status.code(), Code::Unavailable);
        driver.await.unwrap();
    }

    #[tokio::test]
    async fn executor_error_is_carried_to_the_client() {
        let (peer, mut proposals, _) = peer_with_driver(ConsistencyMode::Eventual);

        let driver = tokio::spawn(async move {
            let mut proposal = proposals.recv().await.unwrap();
            let tx = proposal.data_reply.take().unwrap();
            let _ = tx.send(ProposalReply::Applied(ApplyOutcome::Error(
                "document too large".to_string(),
            )));
        });

        let status = peer.route(request("/index")).await.unwrap_err();
        assert_eq!(status.code(), Code::Internal);
        assert!(status.message().contains("document too large"));
        driver.await.unwrap();
    }

    #[tokio::test]
    async fn superseded_proposal_is_retriable() {
        let (peer, mut proposals, _) = peer_with_driver(ConsistencyMode::Eventual);

        let driver = tokio::spawn(async move {
            let mut proposal = proposals.recv().await.unwrap();
            let tx = proposal.data_reply.take().unwrap();
            let _ = tx.send(ProposalReply::Superseded);
        });

        let status = peer.route(request("/index")).await.unwrap_err();
        assert_eq!(status.code(), Code::Unavailable);
        driver.await.unwrap();
    }
}
