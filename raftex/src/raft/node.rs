#![allow(clippy::field_reassign_with_default)]

//! The raft driver.
//!
//! One background loop owns the consensus core: it ticks, steps inbound
//! messages, proposes, persists ready state and resolves pending proposals.
//! Committed entries are handed to a separate applier task so a slow
//! Executor call or an in-flight snapshot cannot stall heartbeats.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use protobuf::Message as PbMessage;
use raft::{prelude::*, StateRole};
use slog::{o, Drain};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant};

use crate::config::NodeConfig;
use crate::error::{NodeError, NodeResult};
use crate::raft::membership::{ConfChangeContext, Membership};
use crate::raft::proposal::{ControlReplySender, DataReplySender, Proposal, ProposalReply};
use crate::raft::storage::FileStorage;
use crate::raft::StateMachine;

const TICK_INTERVAL: Duration = Duration::from_millis(100);
const LOGGER_CHANNEL_SIZE: usize = 4096;
const OUT_MAILBOX_SIZE: usize = 1000;

/// Role and progress surface shared with the request and admin paths.
#[derive(Debug, Default)]
pub struct RaftStatus {
    leader: AtomicBool,
    leader_id: AtomicU64,
    term: AtomicU64,
    applied: AtomicU64,
}

impl RaftStatus {
    pub fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }

    /// Last known leader id, if any.
    pub fn leader_id(&self) -> Option<u64> {
        match self.leader_id.load(Ordering::SeqCst) {
            0 => None,
            id => Some(id),
        }
    }

    pub fn term(&self) -> u64 {
        self.term.load(Ordering::SeqCst)
    }

    /// Highest log index the Executor has applied.
    pub fn applied(&self) -> u64 {
        self.applied.load(Ordering::SeqCst)
    }

    pub(crate) fn set_role(&self, is_leader: bool, leader_id: u64, term: u64) {
        self.leader.store(is_leader, Ordering::SeqCst);
        self.leader_id.store(leader_id, Ordering::SeqCst);
        self.term.store(term, Ordering::SeqCst);
    }

    fn set_applied(&self, index: u64) {
        self.applied.store(index, Ordering::SeqCst);
    }
}

/// Work dispatched from the driver loop to the applier task.
enum ApplyTask {
    Entry {
        index: u64,
        data: Vec<u8>,
        reply: Option<(String, DataReplySender)>,
    },
    Restore {
        index: u64,
        term: u64,
        data: Vec<u8>,
    },
    TakeSnapshot,
}

enum SnapshotNotice {
    Ready { index: u64, data: Vec<u8> },
    Failed { reason: String },
}

fn raft_config(config: &NodeConfig) -> Config {
    let tick_ms = TICK_INTERVAL.as_millis() as u64;
    let election_tick = (config.election_timeout_ms / tick_ms).max(5) as usize;
    // Heartbeats go out a few times per heartbeat timeout.
    let heartbeat_tick = ((config.heartbeat_timeout_ms / tick_ms / 3).max(1) as usize)
        .min(election_tick.saturating_sub(1).max(1));
    Config {
        id: config.id,
        election_tick,
        heartbeat_tick,
        check_quorum: true,
        pre_vote: true,
        max_size_per_msg: 1024 * 1024,
        ..Default::default()
    }
}

/// Starts the raft driver and its applier over an opened storage. Returns
/// the outbound message stream for the transport client and the driver's
/// join handle.
pub fn start<S: StateMachine>(
    config: &NodeConfig,
    storage: FileStorage,
    state_machine: Arc<S>,
    membership: Membership,
    status: Arc<RaftStatus>,
    my_mailbox: mpsc::Receiver<Message>,
    proposals: mpsc::Receiver<Proposal>,
    shutdown: watch::Receiver<bool>,
) -> NodeResult<(mpsc::Receiver<Message>, JoinHandle<()>)> {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain)
        .chan_size(LOGGER_CHANNEL_SIZE)
        .overflow_strategy(slog_async::OverflowStrategy::Block)
        .build()
        .fuse();
    let logger = slog::Logger::root(drain, o!("node" => config.id));

    let last_snapshot_index = storage.snapshot_index();
    let raft_group = RawNode::new(&raft_config(config), storage, &logger).map_err(NodeError::Raft)?;
    status.set_applied(raft_group.raft.raft_log.applied());

    let (out_tx, out_rx) = mpsc::channel(OUT_MAILBOX_SIZE);
    let (apply_tx, apply_rx) = mpsc::unbounded_channel();
    let (notice_tx, notice_rx) = mpsc::channel(4);

    let applier = tokio::spawn(run_applier(
        state_machine,
        apply_rx,
        status.clone(),
        notice_tx,
    ));

    let node = Node {
        raft_group,
        out_mailbox: out_tx,
        my_mailbox,
        proposals,
        apply_tx,
        snapshot_notices: notice_rx,
        pending_data: HashMap::new(),
        pending_control: HashMap::new(),
        status,
        membership,
        shutdown,
        batch_apply: config.batch_apply,
        shutdown_on_remove: config.shutdown_on_remove,
        snapshot_interval: Duration::from_secs(config.snapshot_interval_secs),
        snapshot_threshold: config.snapshot_threshold,
        last_snapshot_time: Instant::now(),
        last_snapshot_index,
        snapshot_requested: false,
        was_leader: false,
        removed: false,
    };

    let join = tokio::spawn(async move {
        node.run().await;
        // dropping the node closes the apply channel; wait out the applier
        let _ = applier.await;
    });

    Ok((out_rx, join))
}

async fn run_applier<S: StateMachine>(
    state_machine: Arc<S>,
    mut tasks: mpsc::UnboundedReceiver<ApplyTask>,
    status: Arc<RaftStatus>,
    notices: mpsc::Sender<SnapshotNotice>,
) {
    while let Some(task) = tasks.recv().await {
        match task {
            ApplyTask::Entry { index, data, reply } => {
                let outcome = state_machine.apply(index, &data).await;
                status.set_applied(index);
                if let Some((request_id, tx)) = reply {
                    let reply = match entry_request_id(&data) {
                        Some(id) if id == request_id => ProposalReply::Applied(outcome),
                        _ => ProposalReply::Superseded,
                    };
                    let _ = tx.send(reply);
                }
            }
            ApplyTask::Restore { index, term, data } => {
                if let Err(e) = state_machine.restore(index, term, &data).await {
                    log::error!("restore at index {index} failed, replica cannot continue: {e}");
                    std::process::exit(1);
                }
                status.set_applied(index);
            }
            ApplyTask::TakeSnapshot => {
                if state_machine.snapshot_in_progress() {
                    continue;
                }
                let handle = match state_machine.begin_snapshot().await {
                    Ok(handle) => handle,
                    Err(e) => {
                        let _ = notices
                            .send(SnapshotNotice::Failed {
                                reason: e.to_string(),
                            })
                            .await;
                        continue;
                    }
                };
                // Everything queued before this task is applied, so the
                // Executor state matches this index exactly.
                let index = status.applied();
                let state_machine = state_machine.clone();
                let notices = notices.clone();
                tokio::spawn(async move {
                    let result = state_machine.collect_snapshot(handle).await;
                    state_machine.release_snapshot();
                    let notice = match result {
                        Ok(data) => SnapshotNotice::Ready { index, data },
                        Err(e) => SnapshotNotice::Failed {
                            reason: e.to_string(),
                        },
                    };
                    let _ = notices.send(notice).await;
                });
            }
        }
    }
}

fn entry_request_id(data: &[u8]) -> Option<String> {
    use prost::Message;
    crate::executor::pb::DataRequestProto::decode(data)
        .ok()
        .and_then(|request| request.header)
        .map(|header| header.request_id)
}

struct Node {
    raft_group: RawNode<FileStorage>,
    out_mailbox: mpsc::Sender<Message>,
    my_mailbox: mpsc::Receiver<Message>,
    proposals: mpsc::Receiver<Proposal>,
    apply_tx: mpsc::UnboundedSender<ApplyTask>,
    snapshot_notices: mpsc::Receiver<SnapshotNotice>,
    pending_data: HashMap<u64, (String, DataReplySender)>,
    pending_control: HashMap<u64, ControlReplySender>,
    status: Arc<RaftStatus>,
    membership: Membership,
    shutdown: watch::Receiver<bool>,
    batch_apply: bool,
    shutdown_on_remove: bool,
    snapshot_interval: Duration,
    snapshot_threshold: u64,
    last_snapshot_time: Instant,
    last_snapshot_index: u64,
    snapshot_requested: bool,
    was_leader: bool,
    removed: bool,
}

impl Node {
    async fn run(mut self) {
        let mut last_tick = Instant::now();
        log::info!("raft driver started");

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => break,
                Some(message) = self.my_mailbox.recv() => {
                    let _ = self.raft_group.step(message);
                    while let Ok(message) = self.my_mailbox.try_recv() {
                        let _ = self.raft_group.step(message);
                    }
                }
                Some(proposal) = self.proposals.recv() => {
                    self.propose(proposal);
                    if self.batch_apply {
                        while let Ok(proposal) = self.proposals.try_recv() {
                            self.propose(proposal);
                        }
                    }
                }
                Some(notice) = self.snapshot_notices.recv() => {
                    self.handle_snapshot_notice(notice);
                }
                _ = time::sleep(Duration::from_millis(1)) => {}
            }

            if last_tick.elapsed() >= TICK_INTERVAL {
                self.raft_group.tick();
                last_tick = Instant::now();
            }

            self.maybe_trigger_snapshot();
            self.on_ready();

            if self.removed {
                log::info!("removed from the configuration, shutting down");
                break;
            }
        }

        log::info!("raft driver stopped");
    }

    fn propose(&mut self, mut proposal: Proposal) {
        if self.raft_group.raft.state != StateRole::Leader {
            let leader_hint = self.status.leader_id();
            if let Some(tx) = proposal.data_reply.take() {
                let _ = tx.send(ProposalReply::NotLeader { leader_hint });
            }
            if let Some(tx) = proposal.control_reply.take() {
                let _ = tx.send(Err(NodeError::NotLeader { leader_hint }));
            }
            return;
        }

        let last_index = self.raft_group.raft.raft_log.last_index() + 1;
        if let Some(data) = proposal.normal.take() {
            let _ = self.raft_group.propose(vec![], data);
        } else if let Some(cc) = proposal.conf_change.take() {
            let _ = self.raft_group.propose_conf_change(vec![], cc);
        }

        let new_last_index = self.raft_group.raft.raft_log.last_index() + 1;
        if new_last_index == last_index {
            // dropped, e.g. while an earlier configuration change is pending
            if let Some(tx) = proposal.data_reply.take() {
                let _ = tx.send(ProposalReply::NotLeader {
                    leader_hint: Some(self.raft_group.raft.id),
                });
            }
            if let Some(tx) = proposal.control_reply.take() {
                let _ = tx.send(Err(NodeError::Raft(raft::Error::ProposalDropped)));
            }
            return;
        }

        if let Some(tx) = proposal.data_reply.take() {
            self.pending_data
                .insert(last_index, (proposal.request_id.clone(), tx));
        } else if let Some(tx) = proposal.control_reply.take() {
            self.pending_control.insert(last_index, tx);
        }
    }

    fn on_ready(&mut self) {
        if !self.raft_group.has_ready() {
            return;
        }
        let mut ready = self.raft_group.ready();

        if !ready.messages().is_empty() {
            self.forward_messages(ready.take_messages());
        }

        if *ready.snapshot() != Snapshot::default() {
            self.install_snapshot(ready.snapshot().clone());
        }

        let committed = ready.take_committed_entries();
        self.dispatch_committed(committed);

        self.persist_ready(&ready);
        if !ready.persisted_messages().is_empty() {
            self.forward_messages(ready.take_persisted_messages());
        }

        let mut light_rd = self.raft_group.advance(ready);
        if let Some(commit) = light_rd.commit_index() {
            self.raft_group.raft.raft_log.store.set_commit(commit);
        }
        self.forward_messages(light_rd.take_messages());
        self.dispatch_committed(light_rd.take_committed_entries());
        self.raft_group.advance_apply();

        self.refresh_status();
    }

    fn forward_messages(&self, messages: Vec<Message>) {
        for message in messages {
            if let Err(e) = self.out_mailbox.try_send(message) {
                log::warn!("failed to queue raft message {e}, raft will retry");
            }
        }
    }

    fn persist_ready(&mut self, ready: &Ready) {
        let store = &mut self.raft_group.raft.raft_log.store;
        if let Err(e) = store.append_entries(ready.entries()) {
            log::error!("cannot persist raft log: {e}");
            return;
        }
        if let Some(hs) = ready.hs() {
            store.set_hardstate(hs.clone());
        }
    }

    fn dispatch_committed(&mut self, entries: Vec<Entry>) {
        for entry in entries {
            if entry.data.is_empty() {
                // the no-op entry a fresh leader commits
                continue;
            }
            match entry.get_entry_type() {
                EntryType::EntryConfChange => self.apply_conf_change_entry(&entry),
                _ => {
                    let reply = self.pending_data.remove(&entry.index);
                    let task = ApplyTask::Entry {
                        index: entry.index,
                        data: entry.data.to_vec(),
                        reply,
                    };
                    if self.apply_tx.send(task).is_err() {
                        log::error!("applier is gone, dropping entry {}", entry.index);
                    }
                }
            }
        }
    }

    fn apply_conf_change_entry(&mut self, entry: &Entry) {
        let mut cc = ConfChange::default();
        if let Err(e) = cc.merge_from_bytes(&entry.data) {
            log::error!("cannot decode conf change at {}: {e}", entry.index);
            return;
        }

        let conf_state = match self.raft_group.apply_conf_change(&cc) {
            Ok(conf_state) => conf_state,
            Err(e) => {
                log::error!("conf change at {} rejected: {e}", entry.index);
                if let Some(tx) = self.pending_control.remove(&entry.index) {
                    let _ = tx.send(Err(NodeError::Raft(e)));
                }
                return;
            }
        };

        // The context carries the complete post-change membership.
        match ConfChangeContext::decode(cc.get_context()) {
            Some(ctx) => self.membership.replace(ctx.members),
            None => {
                log::warn!(
                    "conf change at {} has no membership context",
                    entry.index
                );
                if cc.get_change_type() == ConfChangeType::RemoveNode {
                    self.membership.remove(cc.node_id);
                }
            }
        }
        if cc.get_change_type() == ConfChangeType::RemoveNode
            && cc.node_id == self.raft_group.raft.id
            && self.shutdown_on_remove
        {
            self.removed = true;
        }

        self.raft_group.raft.raft_log.store.set_conf_state(conf_state);
        log::info!(
            "configuration change applied at {}: {:?} node {}",
            entry.index,
            cc.get_change_type(),
            cc.node_id
        );

        if let Some(tx) = self.pending_control.remove(&entry.index) {
            let _ = tx.send(Ok(entry.index));
        }
    }

    fn install_snapshot(&mut self, snapshot: Snapshot) {
        let metadata = snapshot.get_metadata().clone();
        log::info!(
            "installing snapshot at index {} term {}",
            metadata.index,
            metadata.term
        );

        let data = {
            let store = &mut self.raft_group.raft.raft_log.store;
            match store.apply_snapshot(&snapshot) {
                Ok(data) => data,
                Err(e) => {
                    log::error!("cannot apply snapshot: {e}");
                    return;
                }
            }
        };

        let task = ApplyTask::Restore {
            index: metadata.index,
            term: metadata.term,
            data,
        };
        if self.apply_tx.send(task).is_err() {
            log::error!("applier is gone, dropping snapshot restore");
        }
    }

    fn maybe_trigger_snapshot(&mut self) {
        if self.snapshot_requested {
            return;
        }
        if self.last_snapshot_time.elapsed() < self.snapshot_interval {
            return;
        }
        let applied = self.status.applied();
        if applied.saturating_sub(self.last_snapshot_index) < self.snapshot_threshold {
            return;
        }
        if self.apply_tx.send(ApplyTask::TakeSnapshot).is_ok() {
            self.snapshot_requested = true;
            log::info!("triggering executor snapshot around index {applied}");
        }
    }

    fn handle_snapshot_notice(&mut self, notice: SnapshotNotice) {
        self.snapshot_requested = false;
        self.last_snapshot_time = Instant::now();
        match notice {
            SnapshotNotice::Ready { index, data } => {
                let store = &mut self.raft_group.raft.raft_log.store;
                match store.save_snapshot(data, index) {
                    Ok(()) => {
                        self.last_snapshot_index = index;
                        log::info!("snapshot saved at index {index}");
                    }
                    Err(e) => log::error!("cannot save snapshot at index {index}: {e}"),
                }
            }
            SnapshotNotice::Failed { reason } => {
                log::warn!("snapshot attempt failed: {reason}");
            }
        }
    }

    fn refresh_status(&mut self) {
        let raft = &self.raft_group.raft;
        let is_leader = raft.state == StateRole::Leader;
        self.status.set_role(is_leader, raft.leader_id, raft.term);

        if self.was_leader && !is_leader {
            for (_, (_, tx)) in self.pending_data.drain() {
                let _ = tx.send(ProposalReply::NotLeader {
                    leader_hint: self.status.leader_id(),
                });
            }
            for (_, tx) in self.pending_control.drain() {
                let _ = tx.send(Err(NodeError::NotLeader {
                    leader_hint: self.status.leader_id(),
                }));
            }
        }
        self.was_leader = is_leader;
    }
}
