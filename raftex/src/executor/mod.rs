//! Client side of the local Executor process.
//!
//! The replication layer owns a single lazily-dialed channel to the Executor;
//! tonic re-establishes the connection on demand, so transient dial failures
//! surface per call instead of poisoning the client.

use std::path::Path;
use std::time::Duration;

use tonic::transport::{Channel, Endpoint};
use tonic::Status;

use crate::error::{NodeError, NodeResult};

pub mod endpoints;

#[allow(clippy::module_inception)]
pub mod pb {
    tonic::include_proto!("executor");
}

pub mod health_pb {
    tonic::include_proto!("grpc.health.v1");
}

use pb::endpoint_discovery_rpc_client::EndpointDiscoveryRpcClient;
use pb::executor_restore_rpc_client::ExecutorRestoreRpcClient;
use pb::executor_snapshot_rpc_client::ExecutorSnapshotRpcClient;
use pb::info_rpc_client::InfoRpcClient;
use pb::single_data_rpc_client::SingleDataRpcClient;
use pb::{
    DataRequestProto, EndpointsProto, InfoProto, RestoreCommandProto, RestoreInfoProto,
    SnapshotIdProto, SnapshotInfoProto,
};

/// Reconnecting client for the Executor bound to a fixed local address.
///
/// Deadlines are the caller's responsibility; the client imposes none.
#[derive(Clone)]
pub struct ExecutorClient {
    target: String,
    channel: Channel,
}

impl ExecutorClient {
    /// Creates a client for `target`. The connection is established on first
    /// use and re-dialed whenever it drops.
    pub fn new(target: &str) -> NodeResult<Self> {
        let uri = if target.contains("://") {
            target.to_string()
        } else {
            format!("http://{target}")
        };
        let endpoint = Endpoint::from_shared(uri)
            .map_err(|e| NodeError::Dial {
                target: target.to_string(),
                reason: e.to_string(),
            })?
            .connect_timeout(Duration::from_secs(5));
        Ok(ExecutorClient {
            target: target.to_string(),
            channel: endpoint.connect_lazy(),
        })
    }

    /// The configured Executor address.
    pub fn target(&self) -> &str {
        &self.target
    }

    fn map_status(&self, status: Status) -> NodeError {
        if status.code() == tonic::Code::Unavailable {
            NodeError::Dial {
                target: self.target.clone(),
                reason: status.message().to_string(),
            }
        } else {
            NodeError::Executor(status)
        }
    }

    /// Forwards a single request to the Executor.
    pub async fn process_single_data(
        &self,
        request: DataRequestProto,
    ) -> NodeResult<DataRequestProto> {
        let response = SingleDataRpcClient::new(self.channel.clone())
            .process_single_data(request)
            .await
            .map_err(|s| self.map_status(s))?;
        Ok(response.into_inner())
    }

    /// Asks the Executor for the endpoints it serves.
    pub async fn discover_endpoints(&self) -> NodeResult<EndpointsProto> {
        let response = EndpointDiscoveryRpcClient::new(self.channel.clone())
            .endpoint_discovery(())
            .await
            .map_err(|s| self.map_status(s))?;
        Ok(response.into_inner())
    }

    /// Starts an asynchronous Executor-side snapshot.
    pub async fn snapshot(&self) -> NodeResult<SnapshotInfoProto> {
        let response = ExecutorSnapshotRpcClient::new(self.channel.clone())
            .snapshot(())
            .await
            .map_err(|s| self.map_status(s))?;
        Ok(response.into_inner())
    }

    /// Polls the status of a running snapshot.
    pub async fn snapshot_status(&self, id: &str) -> NodeResult<SnapshotInfoProto> {
        let response = ExecutorSnapshotRpcClient::new(self.channel.clone())
            .snapshot_status(SnapshotIdProto {
                value: id.to_string(),
            })
            .await
            .map_err(|s| self.map_status(s))?;
        Ok(response.into_inner())
    }

    /// Asks the Executor to load its state from `snapshot_file`.
    pub async fn restore(&self, snapshot_file: &Path) -> NodeResult<RestoreInfoProto> {
        let response = ExecutorRestoreRpcClient::new(self.channel.clone())
            .restore(RestoreCommandProto {
                snapshot_file: snapshot_file.to_string_lossy().into_owned(),
            })
            .await
            .map_err(|s| self.map_status(s))?;
        Ok(response.into_inner())
    }

    /// Polls the status of a running restore.
    pub async fn restore_status(&self, id: &str) -> NodeResult<RestoreInfoProto> {
        let response = ExecutorRestoreRpcClient::new(self.channel.clone())
            .restore_status(SnapshotIdProto {
                value: id.to_string(),
            })
            .await
            .map_err(|s| self.map_status(s))?;
        Ok(response.into_inner())
    }

    /// Fetches the Executor's build/runtime information.
    pub async fn xstatus(&self) -> NodeResult<InfoProto> {
        let response = InfoRpcClient::new(self.channel.clone())
            .x_status(())
            .await
            .map_err(|s| self.map_status(s))?;
        Ok(response.into_inner())
    }

    /// Standard health check against the Executor.
    pub async fn health_check(&self) -> NodeResult<health_pb::HealthCheckResponse> {
        let mut client = health_pb::health_client::HealthClient::new(self.channel.clone());
        let response = client
            .check(health_pb::HealthCheckRequest {
                service: String::new(),
            })
            .await
            .map_err(|s| self.map_status(s))?;
        Ok(response.into_inner())
    }
}
