//! Inbound raft transport.
//!
//! Peers stream serialized raft messages at this service; parsed messages
//! are fed into the driver's mailbox.

use protobuf::Message;
use raft::prelude::Message as RaftMessage;
use tokio::sync::mpsc;
use tonic::Streaming;

#[allow(clippy::module_inception)]
pub mod pb {
    tonic::include_proto!("raft");
}

use pb::raft_service_server::RaftService;
use pb::{PostDataRequest, PostDataResponse};

pub struct RaftServiceSVC {
    in_mailbox: mpsc::Sender<RaftMessage>,
}

impl RaftServiceSVC {
    pub fn new(in_mailbox: mpsc::Sender<RaftMessage>) -> Self {
        RaftServiceSVC { in_mailbox }
    }
}

#[tonic::async_trait]
impl RaftService for RaftServiceSVC {
    /// Drains one peer's message stream into the driver mailbox. Messages
    /// that fail to parse are logged and skipped.
    async fn post_data(
        &self,
        request: tonic::Request<Streaming<PostDataRequest>>,
    ) -> Result<tonic::Response<PostDataResponse>, tonic::Status> {
        let mut stream = request.into_inner();
        while let Some(req) = stream.message().await? {
            match RaftMessage::parse_from_bytes(req.data.as_slice()) {
                Ok(message) => {
                    if self.in_mailbox.send(message).await.is_err() {
                        log::warn!("raft driver is gone, closing transport stream");
                        break;
                    }
                }
                Err(e) => {
                    log::warn!("cannot parse raft message: {e}");
                    continue;
                }
            }
        }
        Ok(tonic::Response::new(PostDataResponse::default()))
    }
}
