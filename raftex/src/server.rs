//! Node wiring and lifecycle.
//!
//! `Server::start` opens the durable stores, builds the state machine,
//! launches the raft driver and registers every gRPC service on one
//! listener; `Server::stop` drains them in the reverse order.

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response};
use once_cell::sync::OnceCell;
use prometheus::{Encoder, TextEncoder};
use raft::prelude::Message;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::admin::pb::raft_admin_server::RaftAdminServer;
use crate::admin::AdminService;
use crate::config::{self, NodeConfig};
use crate::error::{NodeError, NodeResult};
use crate::executor::health_pb::health_server::HealthServer;
use crate::executor::pb::endpoint_discovery_rpc_server::EndpointDiscoveryRpcServer;
use crate::executor::pb::info_rpc_server::InfoRpcServer;
use crate::executor::pb::single_data_rpc_server::SingleDataRpcServer;
use crate::executor::pb::stream_data_rpc_server::StreamDataRpcServer;
use crate::executor::ExecutorClient;
use crate::fsm::ExecutorFsm;
use crate::metrics;
use crate::peer::PeerService;
use crate::raft::membership::Membership;
use crate::raft::node::{self, RaftStatus};
use crate::raft::proposal::Proposal;
use crate::raft::storage::FileStorage;
use crate::raft::StateMachine;
use crate::raft_client::RaftClient;
use crate::raft_service::pb::raft_service_server::RaftServiceServer;
use crate::raft_service::RaftServiceSVC;

const IN_MAILBOX_SIZE: usize = 1000;
const PROPOSAL_QUEUE_SIZE: usize = 256;
const DISCOVERY_RETRY_INTERVAL: Duration = Duration::from_secs(5);

static INSTANCE: OnceCell<Mutex<Server>> = OnceCell::new();

/// Returns a reference to the global server instance
pub fn instance() -> &'static Mutex<Server> {
    INSTANCE.get_or_init(|| Mutex::new(Server::new()))
}

pub struct Server {
    shutdown: Option<watch::Sender<bool>>,
    grpc_handle: Option<JoinHandle<()>>,
    raft_handle: Option<JoinHandle<()>>,
}

impl Server {
    fn new() -> Self {
        Server {
            shutdown: None,
            grpc_handle: None,
            raft_handle: None,
        }
    }

    pub async fn start(&mut self) -> NodeResult<()> {
        let config = config::current();

        let membership = Membership::default();
        let (storage, fresh) = FileStorage::open(
            config.node_dir(),
            membership.clone(),
            config.trailing_logs,
            Some((config.id, config.address.clone())),
        )?;
        if fresh {
            log::info!("bootstrapped a single-voter cluster as node {}", config.id);
        } else {
            log::info!(
                "raft cluster already bootstrapped, rejoining as node {}",
                config.id
            );
        }

        let client = ExecutorClient::new(&config.executor_target)?;
        let fsm = Arc::new(ExecutorFsm::new(client));
        if let Err(e) = fsm.discover_endpoints().await {
            log::warn!("endpoint discovery failed, requests are rejected until it succeeds: {e}");
            Self::retry_discovery(fsm.clone());
        }

        if !config.no_snapshot_restore_on_start {
            if let Some((index, term, data)) = storage.latest_snapshot_payload()? {
                log::info!("reloading executor from local snapshot at index {index}");
                fsm.restore(index, term, &data).await?;
            }
        }

        let status = Arc::new(RaftStatus::default());
        let (in_tx, in_rx) = mpsc::channel(IN_MAILBOX_SIZE);
        let (proposal_tx, proposal_rx) = mpsc::channel(PROPOSAL_QUEUE_SIZE);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let (out_mailbox, raft_handle) = node::start(
            &config,
            storage,
            fsm.clone(),
            membership.clone(),
            status.clone(),
            in_rx,
            proposal_rx,
            shutdown_rx.clone(),
        )?;
        Self::start_out_pump(membership.clone(), out_mailbox);

        let grpc_handle = Self::start_grpc_server(
            &config,
            fsm,
            status,
            proposal_tx,
            in_tx,
            membership,
            shutdown_rx,
        )?;
        Self::start_metrics_server(&config);

        self.shutdown = Some(shutdown_tx);
        self.grpc_handle = Some(grpc_handle);
        self.raft_handle = Some(raft_handle);
        Ok(())
    }

    /// Gracefully stops the gRPC server, then the raft driver, and waits for
    /// both.
    pub async fn stop(&mut self) {
        log::info!("server stopping");
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        if let Some(handle) = self.grpc_handle.take() {
            let _ = handle.await;
        }
        if let Some(handle) = self.raft_handle.take() {
            let _ = handle.await;
        }
        log::info!("server stopped");
    }

    fn retry_discovery(fsm: Arc<ExecutorFsm>) {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(DISCOVERY_RETRY_INTERVAL).await;
                match fsm.discover_endpoints().await {
                    Ok(()) => break,
                    Err(e) => log::warn!("endpoint discovery retry failed: {e}"),
                }
            }
        });
    }

    fn resolve(address: &str) -> NodeResult<SocketAddr> {
        address
            .to_socket_addrs()
            .map_err(NodeError::Storage)?
            .next()
            .ok_or_else(|| NodeError::Dial {
                target: address.to_string(),
                reason: "address resolves to nothing".to_string(),
            })
    }

    fn start_grpc_server(
        config: &NodeConfig,
        fsm: Arc<ExecutorFsm>,
        status: Arc<RaftStatus>,
        proposal_tx: mpsc::Sender<Proposal>,
        in_tx: mpsc::Sender<Message>,
        membership: Membership,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> NodeResult<JoinHandle<()>> {
        let addr = Self::resolve(&config.address)?;

        let peer = PeerService::new(
            fsm,
            status.clone(),
            proposal_tx.clone(),
            config.consistency,
            config.id,
        );
        let raft_service = RaftServiceSVC::new(in_tx);
        let admin_service = AdminService::new(proposal_tx, membership, status);

        let server = tonic::transport::Server::builder()
            .add_service(SingleDataRpcServer::new(peer.clone()))
            .add_service(StreamDataRpcServer::new(peer.clone()))
            .add_service(EndpointDiscoveryRpcServer::new(peer.clone()))
            .add_service(InfoRpcServer::new(peer.clone()))
            .add_service(HealthServer::new(peer))
            .add_service(RaftServiceServer::new(raft_service))
            .add_service(RaftAdminServer::new(admin_service))
            .serve_with_shutdown(addr, async move {
                let _ = shutdown_rx.changed().await;
            });

        let handle = tokio::spawn(async move {
            if let Err(e) = server.await {
                log::error!("grpc server failed: {e}");
            }
        });
        log::info!("grpc server started on {addr}");
        Ok(handle)
    }

    fn start_metrics_server(config: &NodeConfig) {
        let Some(metrics_address) = config.metrics_address.clone() else {
            return;
        };
        let addr = match Self::resolve(&metrics_address) {
            Ok(addr) => addr,
            Err(e) => {
                log::error!("invalid metrics address {metrics_address}: {e}");
                return;
            }
        };

        let make_svc = make_service_fn(move |_| {
            let registry = metrics::REGISTRY.clone();
            async move {
                Ok::<_, hyper::Error>(service_fn(move |_: Request<Body>| {
                    let registry = registry.clone();
                    async move {
                        let encoder = TextEncoder::new();
                        let metric_families = registry.gather();
                        let mut buffer = Vec::new();
                        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
                            log::warn!("cannot encode metrics: {e}");
                        }
                        Ok::<_, hyper::Error>(Response::new(Body::from(buffer)))
                    }
                }))
            }
        });
        metrics::init_registry();
        let server = hyper::Server::bind(&addr).serve(make_svc);
        tokio::spawn(async move {
            if let Err(e) = server.await {
                log::error!("metrics server failed: {e}");
            }
        });
        log::info!("metrics server started on {addr}");
    }

    fn start_out_pump(membership: Membership, mut out_mailbox: mpsc::Receiver<Message>) {
        tokio::spawn(async move {
            let client = Arc::new(RaftClient::new(membership));
            while let Some(message) = out_mailbox.recv().await {
                let client = client.clone();
                tokio::spawn(async move {
                    client.post_data(message).await;
                });
            }
        });
    }
}
