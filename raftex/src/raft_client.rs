//! Outbound raft transport.
//!
//! One streaming connection per peer, resolved from the replicated
//! membership. A peer's send queue exists from the first message; the task
//! behind it dials with bounded retries, drives one long-lived stream, and
//! marks itself gone when either fails. The next message to a gone peer
//! spawns a replacement, so transient outages cost queued messages only —
//! raft retransmits on its own schedule.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use protobuf::Message;
use raft::prelude::Message as RaftMessage;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::sync::Mutex;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::{Channel, Endpoint};

use crate::raft::membership::Membership;

#[allow(clippy::module_inception)]
pub mod pb {
    tonic::include_proto!("raft");
}

use pb::raft_service_client::RaftServiceClient;
use pb::PostDataRequest;

const DIAL_TIMEOUT: Duration = Duration::from_secs(3);
const DIAL_RETRIES: u32 = 3;
const DIAL_BACKOFF: Duration = Duration::from_millis(200);
const PEER_QUEUE_SIZE: usize = 1000;

struct PeerClient {
    sender: Sender<PostDataRequest>,
    gone: Arc<AtomicBool>,
}

impl PeerClient {
    /// Creates the send queue up front and hands the dial to a background
    /// task, so messages queue while the connection comes up.
    fn spawn(id: u64, address: String) -> Self {
        let (sender, receiver) = mpsc::channel(PEER_QUEUE_SIZE);
        let gone = Arc::new(AtomicBool::new(false));
        let flag = gone.clone();

        tokio::spawn(async move {
            if let Err(e) = Self::pump(&address, receiver).await {
                log::warn!("transport to peer {id} at {address} ended: {e}");
            }
            flag.store(true, Ordering::SeqCst);
        });

        PeerClient { sender, gone }
    }

    /// Dials with linear backoff, then forwards the queue as one request
    /// stream until it breaks.
    async fn pump(
        address: &str,
        receiver: Receiver<PostDataRequest>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let uri = if address.contains("://") {
            address.to_string()
        } else {
            format!("http://{address}")
        };
        let endpoint = Endpoint::from_shared(uri)?.connect_timeout(DIAL_TIMEOUT);

        let mut attempt = 0;
        let channel: Channel = loop {
            match endpoint.connect().await {
                Ok(channel) => break channel,
                Err(e) if attempt + 1 < DIAL_RETRIES => {
                    attempt += 1;
                    log::warn!("dial {address} failed (attempt {attempt}): {e}");
                    tokio::time::sleep(DIAL_BACKOFF * attempt).await;
                }
                Err(e) => return Err(e.into()),
            }
        };

        let mut client = RaftServiceClient::new(channel);
        client.post_data(ReceiverStream::new(receiver)).await?;
        Ok(())
    }
}

pub struct RaftClient {
    membership: Membership,
    peers: Mutex<HashMap<u64, PeerClient>>,
}

impl RaftClient {
    pub fn new(membership: Membership) -> RaftClient {
        RaftClient {
            membership,
            peers: Mutex::new(HashMap::new()),
        }
    }

    /// Ships one raft message to its destination, respawning the peer's
    /// connection if the previous one died.
    pub async fn post_data(&self, message: RaftMessage) {
        let to = message.to;
        let data = match message.write_to_bytes() {
            Ok(data) => data,
            Err(e) => {
                log::warn!("cannot serialize raft message: {e}");
                return;
            }
        };

        let mut peers = self.peers.lock().await;
        if peers
            .get(&to)
            .map_or(false, |peer| peer.gone.load(Ordering::SeqCst))
        {
            peers.remove(&to);
        }
        if !peers.contains_key(&to) {
            let address = match self.membership.address_of(to) {
                Some(address) => address,
                None => {
                    log::warn!("no address known for peer {to}, dropping message");
                    return;
                }
            };
            peers.insert(to, PeerClient::spawn(to, address));
        }

        let peer = peers.get(&to).expect("peer inserted above");
        if peer.sender.try_send(PostDataRequest { data }).is_err() {
            log::debug!("send queue to peer {to} is full, dropping message");
        }
    }
}
