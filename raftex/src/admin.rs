#![allow(clippy::field_reassign_with_default)]

//! Cluster administration.
//!
//! Every node serves the admin surface; membership changes must reach the
//! leader and block until the configuration change commits. The offline
//! configuration readback opens the durable stores directly, without
//! starting a driver, so an embedding runtime can decide whether prior state
//! is worth rejoining.

use std::path::Path;
use std::sync::Arc;

use raft::eraftpb::{ConfChange, ConfChangeType};
use tokio::sync::mpsc;
use tonic::{Request, Response, Status};

use crate::error::{NodeError, NodeResult, NOT_LEADER_SENTINEL};
use crate::raft::membership::{ConfChangeContext, Member, Membership, Suffrage};
use crate::raft::node::RaftStatus;
use crate::raft::proposal::Proposal;
use crate::raft::storage::FileStorage;

#[allow(clippy::module_inception)]
pub mod pb {
    tonic::include_proto!("raft");
}

use pb::raft_admin_client::RaftAdminClient;
use pb::raft_admin_server::RaftAdmin;
use pb::{
    AddVoterRequest, ChangeResponse, GetConfigurationRequest, GetConfigurationResponse,
    MemberProto, RemoveServerRequest, SuffrageProto,
};

pub struct AdminService {
    proposals: mpsc::Sender<Proposal>,
    membership: Membership,
    status: Arc<RaftStatus>,
}

impl AdminService {
    pub fn new(
        proposals: mpsc::Sender<Proposal>,
        membership: Membership,
        status: Arc<RaftStatus>,
    ) -> Self {
        AdminService {
            proposals,
            membership,
            status,
        }
    }

    /// Proposes a configuration change and waits for it to commit. The
    /// result travels in the response body so callers can match the
    /// not-leader sentinel and retry elsewhere.
    async fn change(&self, cc: ConfChange) -> Result<Response<ChangeResponse>, Status> {
        if !self.status.is_leader() {
            return Ok(Response::new(ChangeResponse {
                index: 0,
                error: NOT_LEADER_SENTINEL.to_string(),
            }));
        }

        let (proposal, reply) = Proposal::conf_change(&cc);
        self.proposals
            .send(proposal)
            .await
            .map_err(|_| Status::unavailable("raft driver is shut down"))?;

        let response = match reply.await {
            Ok(Ok(index)) => ChangeResponse {
                index,
                error: String::new(),
            },
            Ok(Err(e)) => ChangeResponse {
                index: 0,
                error: e.to_string(),
            },
            Err(_) => ChangeResponse {
                index: 0,
                error: "raft driver dropped the proposal".to_string(),
            },
        };
        Ok(Response::new(response))
    }
}

#[tonic::async_trait]
impl RaftAdmin for AdminService {
    async fn add_voter(
        &self,
        request: Request<AddVoterRequest>,
    ) -> Result<Response<ChangeResponse>, Status> {
        let req = request.into_inner();
        log::info!("add voter {} at {}", req.id, req.address);

        // Context carries the complete membership as of this change, so the
        // joining node learns every peer's address from the entry itself.
        let mut members = self.membership.members();
        members.retain(|m| m.id != req.id);
        members.push(Member {
            id: req.id,
            address: req.address,
            suffrage: Suffrage::Voter,
        });

        let mut cc = ConfChange::default();
        cc.node_id = req.id;
        cc.set_change_type(ConfChangeType::AddNode);
        cc.set_context(ConfChangeContext { members }.encode().into());
        self.change(cc).await
    }

    async fn remove_server(
        &self,
        request: Request<RemoveServerRequest>,
    ) -> Result<Response<ChangeResponse>, Status> {
        let req = request.into_inner();
        log::info!("remove server {}", req.id);

        let mut members = self.membership.members();
        members.retain(|m| m.id != req.id);

        let mut cc = ConfChange::default();
        cc.node_id = req.id;
        cc.set_change_type(ConfChangeType::RemoveNode);
        cc.set_context(ConfChangeContext { members }.encode().into());
        self.change(cc).await
    }

    async fn get_configuration(
        &self,
        _request: Request<GetConfigurationRequest>,
    ) -> Result<Response<GetConfigurationResponse>, Status> {
        let members = self
            .membership
            .members()
            .into_iter()
            .map(|member| MemberProto {
                id: member.id,
                address: member.address,
                suffrage: match member.suffrage {
                    Suffrage::Voter => SuffrageProto::Voter as i32,
                    Suffrage::Nonvoter => SuffrageProto::Nonvoter as i32,
                    Suffrage::Staging => SuffrageProto::Staging as i32,
                },
            })
            .collect();
        Ok(Response::new(GetConfigurationResponse { members }))
    }
}

/// Client-side helper: asks the node at `target` to add `(id, address)` as a
/// voter. Must be directed at the leader; a not-leader reply surfaces as
/// [`NodeError::NotLeader`] so the caller can retry against another node.
pub async fn add_voter(target: &str, id: u64, address: &str) -> NodeResult<()> {
    let target_uri = if target.contains("://") {
        target.to_string()
    } else {
        format!("http://{target}")
    };
    let mut client = RaftAdminClient::connect(target_uri)
        .await
        .map_err(|e| NodeError::Dial {
            target: target.to_string(),
            reason: e.to_string(),
        })?;

    let response = client
        .add_voter(AddVoterRequest {
            id,
            address: address.to_string(),
            previous_index: 0,
        })
        .await
        .map_err(|status| NodeError::Admin {
            message: status.message().to_string(),
        })?
        .into_inner();

    if response.error.is_empty() {
        log::info!("voter {id} added at log index {}", response.index);
        Ok(())
    } else if response.error.contains(NOT_LEADER_SENTINEL) {
        Err(NodeError::NotLeader { leader_hint: None })
    } else {
        Err(NodeError::Admin {
            message: response.error,
        })
    }
}

/// Offline configuration readback: opens the stores a node with this id
/// would use and returns the address persisted for it. `None` when the
/// directory holds no configuration. Must not run against the data
/// directory of a live node.
pub fn get_configuration(id: u64, data_dir: &Path) -> NodeResult<Option<String>> {
    let membership = Membership::default();
    let base = data_dir.join(id.to_string());
    let _storage = FileStorage::open(&base, membership.clone(), 0, None)?;

    if membership.is_empty() {
        log::info!("no configuration persisted under {}", base.display());
        return Ok(None);
    }
    Ok(membership.address_of(id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn readback_of_empty_directory_finds_nothing() {
        let dir = tempdir().unwrap();
        assert_eq!(get_configuration(1, dir.path()).unwrap(), None);
    }

    #[test]
    fn readback_after_bootstrap_returns_own_address() {
        let dir = tempdir().unwrap();
        {
            let membership = Membership::default();
            FileStorage::open(
                dir.path().join("1"),
                membership,
                0,
                Some((1, "127.0.0.1:50051".to_string())),
            )
            .unwrap();
        }

        assert_eq!(
            get_configuration(1, dir.path()).unwrap(),
            Some("127.0.0.1:50051".to_string())
        );
        // another id has no persisted address
        assert_eq!(get_configuration(2, dir.path()).unwrap(), None);
    }
}
