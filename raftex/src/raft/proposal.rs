#![allow(clippy::field_reassign_with_default)]

//! Proposal envelopes handed to the raft driver.

use raft::prelude::ConfChange;
use tokio::sync::oneshot;

use crate::error::NodeError;
use crate::raft::ApplyOutcome;

/// Reply delivered to the proposer of a data entry.
#[derive(Debug)]
pub enum ProposalReply {
    /// The entry committed and was applied; tagged Executor outcome.
    Applied(ApplyOutcome),
    /// This node was not, or stopped being, the leader.
    NotLeader {
        /// Last known leader, if any.
        leader_hint: Option<u64>,
    },
    /// The log position was taken by a different entry after a leader change.
    Superseded,
}

pub type DataReplySender = oneshot::Sender<ProposalReply>;
pub type ControlReplySender = oneshot::Sender<Result<u64, NodeError>>;

/// One pending proposal: either an opaque data entry with a reply channel for
/// the Executor outcome, or a configuration change acknowledged at commit.
pub struct Proposal {
    pub normal: Option<Vec<u8>>,
    pub conf_change: Option<ConfChange>,
    /// Request id from the framing header, used to verify that the entry
    /// committed at the assigned index is still this proposal.
    pub request_id: String,
    pub data_reply: Option<DataReplySender>,
    pub control_reply: Option<ControlReplySender>,
}

impl Proposal {
    pub fn normal(request_id: String, data: Vec<u8>) -> (Self, oneshot::Receiver<ProposalReply>) {
        let (tx, rx) = oneshot::channel();
        let proposal = Proposal {
            normal: Some(data),
            conf_change: None,
            request_id,
            data_reply: Some(tx),
            control_reply: None,
        };
        (proposal, rx)
    }

    pub fn conf_change(cc: &ConfChange) -> (Self, oneshot::Receiver<Result<u64, NodeError>>) {
        let (tx, rx) = oneshot::channel();
        let proposal = Proposal {
            normal: None,
            conf_change: Some(cc.clone()),
            request_id: String::new(),
            data_reply: None,
            control_reply: Some(tx),
        };
        (proposal, rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_proposal_carries_data_reply() {
        let (proposal, _rx) = Proposal::normal("req-1".to_string(), vec![1, 2, 3]);
        assert_eq!(proposal.normal.as_deref(), Some(&[1u8, 2, 3][..]));
        assert!(proposal.conf_change.is_none());
        assert!(proposal.data_reply.is_some());
        assert!(proposal.control_reply.is_none());
    }

    #[test]
    fn conf_change_proposal_carries_control_reply() {
        let mut cc = ConfChange::default();
        cc.node_id = 2;
        let (proposal, _rx) = Proposal::conf_change(&cc);
        assert!(proposal.normal.is_none());
        assert_eq!(proposal.conf_change.as_ref().unwrap().node_id, 2);
        assert!(proposal.data_reply.is_none());
        assert!(proposal.control_reply.is_some());
    }
}
