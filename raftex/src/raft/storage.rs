#![allow(clippy::field_reassign_with_default)]

//! Durable raft storage.
//!
//! `FileStorage` pairs the consensus library's in-memory storage with a
//! durable layer under the node directory: segmented log files
//! (`logs_<base>.dat`), a stable file (`stable.dat`) holding hard state,
//! configuration and the member registry, and raft snapshots
//! (`snapshot_<index>.dat`) with a bounded retention.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use prost::bytes::Bytes;
use protobuf::Message;
use raft::eraftpb::{Entry, HardState, Snapshot};
use raft::{storage::MemStorage, GetEntriesContext, RaftState, Result, Storage};
use raft_proto::eraftpb::ConfState;
use serde::{Deserialize, Serialize};

use crate::raft::membership::{Member, Membership, Suffrage};
use crate::raft::segment::Segment;

const SEGMENT_SPAN: u64 = 10_000;
const SNAPSHOT_RETENTION: usize = 3;
const STABLE_FILE: &str = "stable.dat";

fn store_err<E: std::error::Error + Send + Sync + 'static>(e: E) -> raft::Error {
    raft::Error::Store(raft::StorageError::Other(Box::new(e)))
}

/// Durable scalar state: the raft hard state, the configuration, and the
/// metadata of the newest snapshot the log is anchored on.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StableState {
    term: u64,
    vote: u64,
    commit: u64,
    snapshot_index: u64,
    snapshot_term: u64,
    voters: Vec<u64>,
    learners: Vec<u64>,
    members: Vec<Member>,
}

/// Envelope carried as raft snapshot data: the Executor's snapshot bytes plus
/// the member registry a joining follower needs for dialing.
#[derive(Debug, Serialize, Deserialize)]
pub struct SnapshotPayload {
    pub members: Vec<Member>,
    pub data: Vec<u8>,
}

/// File-backed storage for the consensus core.
pub struct FileStorage {
    mem_storage: MemStorage,
    segments: BTreeMap<u64, Segment>,
    membership: Membership,
    base_path: PathBuf,
    trailing_logs: u64,
    snapshot_meta: (u64, u64),
    latest_snapshot: Option<Snapshot>,
}

impl FileStorage {
    /// Opens the storage under `base_path`, replaying durable state into
    /// memory. With `bootstrap = Some((id, address))` an empty directory is
    /// initialized as a single-voter cluster; the returned flag tells whether
    /// that initialization ran (false means prior state was found). With
    /// `bootstrap = None` an empty directory stays empty, which is what the
    /// offline configuration readback wants.
    pub fn open<P: AsRef<Path>>(
        base_path: P,
        membership: Membership,
        trailing_logs: u64,
        bootstrap: Option<(u64, String)>,
    ) -> Result<(Self, bool)> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path)?;

        let mut storage = FileStorage {
            mem_storage: MemStorage::new(),
            segments: BTreeMap::new(),
            membership,
            base_path,
            trailing_logs,
            snapshot_meta: (0, 0),
            latest_snapshot: None,
        };

        let stable = storage.load_stable()?;
        let fresh = stable.is_none() && bootstrap.is_some();
        let mut persisted_commit = 0;

        match stable {
            Some(state) => {
                let mut seed = Snapshot::default();
                seed.mut_metadata().index = state.snapshot_index;
                seed.mut_metadata().term = state.snapshot_term;
                seed.mut_metadata().mut_conf_state().voters = state.voters.clone();
                seed.mut_metadata().mut_conf_state().learners = state.learners.clone();
                storage.mem_storage.wl().apply_snapshot(seed)?;
                storage.snapshot_meta = (state.snapshot_index, state.snapshot_term);
                storage.membership.replace(state.members.clone());

                let mut hs = HardState::default();
                hs.term = state.term;
                hs.vote = state.vote;
                storage.mem_storage.wl().set_hardstate(hs);
                persisted_commit = state.commit;
            }
            None => {
                if let Some((id, address)) = bootstrap {
                    let mut seed = Snapshot::default();
                    seed.mut_metadata().index = 1;
                    seed.mut_metadata().term = 1;
                    seed.mut_metadata().mut_conf_state().voters = vec![id];
                    storage.mem_storage.wl().apply_snapshot(seed)?;
                    storage.snapshot_meta = (1, 1);
                    storage.membership.upsert(id, address, Suffrage::Voter);
                    storage.persist_stable()?;
                }
            }
        }

        storage.load_latest_snapshot()?;
        storage.load_segments()?;

        // The commit index may not run ahead of the replayed log.
        if persisted_commit > 0 {
            let last = storage.mem_storage.last_index()?;
            let mut hs = storage.mem_storage.initial_state()?.hard_state;
            hs.commit = persisted_commit.min(last);
            storage.mem_storage.wl().set_hardstate(hs);
        }

        Ok((storage, fresh))
    }

    fn stable_path(&self) -> PathBuf {
        self.base_path.join(STABLE_FILE)
    }

    fn segment_path(&self, base: u64) -> PathBuf {
        self.base_path.join(format!("logs_{base}.dat"))
    }

    fn snapshot_path(&self, index: u64) -> PathBuf {
        self.base_path.join(format!("snapshot_{index}.dat"))
    }

    fn segment_base(index: u64) -> u64 {
        index - index % SEGMENT_SPAN
    }

    fn load_stable(&self) -> Result<Option<StableState>> {
        let path = self.stable_path();
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)?;
        let state = bincode::deserialize(&bytes).map_err(store_err)?;
        Ok(Some(state))
    }

    fn persist_stable(&self) -> Result<()> {
        let raft_state = self.mem_storage.initial_state()?;
        let state = StableState {
            term: raft_state.hard_state.term,
            vote: raft_state.hard_state.vote,
            commit: raft_state.hard_state.commit,
            snapshot_index: self.snapshot_meta.0,
            snapshot_term: self.snapshot_meta.1,
            voters: raft_state.conf_state.voters.clone(),
            learners: raft_state.conf_state.learners.clone(),
            members: self.membership.members(),
        };
        let bytes = bincode::serialize(&state).map_err(store_err)?;
        let tmp = self.base_path.join("stable.tmp");
        fs::write(&tmp, &bytes)?;
        fs::rename(&tmp, self.stable_path())?;
        Ok(())
    }

    fn list_snapshot_files(&self) -> Result<Vec<(u64, PathBuf)>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.base_path)? {
            let path = entry?.path();
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name,
                None => continue,
            };
            if let Some(index) = name
                .strip_prefix("snapshot_")
                .and_then(|n| n.strip_suffix(".dat"))
                .and_then(|n| n.parse().ok())
            {
                files.push((index, path));
            }
        }
        files.sort_by_key(|(index, _)| *index);
        Ok(files)
    }

    fn load_latest_snapshot(&mut self) -> Result<()> {
        if let Some((_, path)) = self.list_snapshot_files()?.last() {
            let bytes = fs::read(path)?;
            let mut snapshot = Snapshot::default();
            snapshot.merge_from_bytes(&bytes).map_err(store_err)?;
            self.latest_snapshot = Some(snapshot);
        }
        Ok(())
    }

    fn write_snapshot_file(&mut self, snapshot: &Snapshot) -> Result<()> {
        let bytes = snapshot.write_to_bytes().map_err(store_err)?;
        let tmp = self.base_path.join("snapshot.tmp");
        fs::write(&tmp, &bytes)?;
        fs::rename(&tmp, self.snapshot_path(snapshot.get_metadata().index))?;

        let files = self.list_snapshot_files()?;
        if files.len() > SNAPSHOT_RETENTION {
            for (_, path) in &files[..files.len() - SNAPSHOT_RETENTION] {
                if let Err(e) = fs::remove_file(path) {
                    log::warn!("cannot remove old snapshot {}: {e}", path.display());
                }
            }
        }
        Ok(())
    }

    fn load_segments(&mut self) -> Result<()> {
        let mut bases = Vec::new();
        for entry in fs::read_dir(&self.base_path)? {
            let path = entry?.path();
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name,
                None => continue,
            };
            if let Some(base) = name
                .strip_prefix("logs_")
                .and_then(|n| n.strip_suffix(".dat"))
                .and_then(|n| n.parse().ok())
            {
                bases.push(base);
            }
        }
        bases.sort_unstable();

        let last_index = self.mem_storage.last_index()?;
        let mut replay = Vec::new();
        for base in bases {
            let mut segment = Segment::open(self.segment_path(base))?;
            if let (Some(first), Some(last)) = (segment.first_index(), segment.last_index()) {
                for index in first..=last {
                    if index > last_index {
                        let bytes = segment.read(index)?;
                        let mut entry = Entry::default();
                        entry.merge_from_bytes(&bytes).map_err(store_err)?;
                        replay.push(entry);
                    }
                }
            }
            self.segments.insert(base, segment);
        }

        // Replay stops at the first gap; anything beyond it is unreachable.
        let mut expect = last_index + 1;
        let mut usable = Vec::new();
        for entry in replay {
            if entry.index == expect {
                usable.push(entry);
                expect += 1;
            } else if entry.index > expect {
                log::warn!("log gap at index {expect}, dropping stale entries from {}", entry.index);
                break;
            }
        }
        if !usable.is_empty() {
            self.mem_storage.wl().append(&usable)?;
        }
        Ok(())
    }

    fn get_or_create_segment(&mut self, base: u64) -> Result<&mut Segment> {
        if !self.segments.contains_key(&base) {
            let segment = Segment::open(self.segment_path(base))?;
            self.segments.insert(base, segment);
        }
        Ok(self.segments.get_mut(&base).unwrap())
    }

    /// Drops every durable entry with an index at or above `index`; raft
    /// rewrites the tail after a leader change.
    fn truncate_from(&mut self, index: u64) -> Result<()> {
        let mut remove = Vec::new();
        for (&base, segment) in self.segments.iter_mut() {
            match segment.first_index() {
                Some(first) if first >= index => {
                    fs::remove_file(segment.path())?;
                    remove.push(base);
                }
                Some(_) => segment.truncate_after(index.saturating_sub(1))?,
                None => {}
            }
        }
        for base in remove {
            self.segments.remove(&base);
        }
        Ok(())
    }

    fn drop_segments_through(&mut self, index: u64) -> Result<()> {
        let mut remove = Vec::new();
        for (&base, segment) in self.segments.iter() {
            if segment.last_index().map_or(true, |last| last <= index) {
                fs::remove_file(segment.path())?;
                remove.push(base);
            }
        }
        for base in remove {
            self.segments.remove(&base);
        }
        Ok(())
    }

    /// Appends entries to memory and the durable log.
    pub fn append_entries(&mut self, entries: &[Entry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.mem_storage.wl().append(entries)?;
        self.truncate_from(entries[0].index)?;

        let mut frames: BTreeMap<u64, Vec<(u64, Vec<u8>)>> = BTreeMap::new();
        for entry in entries {
            let bytes = entry.write_to_bytes().map_err(store_err)?;
            frames
                .entry(Self::segment_base(entry.index))
                .or_default()
                .push((entry.index, bytes));
        }
        for (base, frames) in frames {
            self.get_or_create_segment(base)?.append(&frames)?;
        }
        Ok(())
    }

    /// Sets the configuration state and persists it.
    pub fn set_conf_state(&mut self, conf_state: ConfState) {
        self.mem_storage.wl().set_conf_state(conf_state);
        if let Err(e) = self.persist_stable() {
            log::error!("cannot persist stable state: {e}");
        }
    }

    /// Sets the hard state; term and vote changes hit the stable file.
    pub fn set_hardstate(&mut self, hs: HardState) {
        let vote_or_term_changed = {
            let current = self.mem_storage.rl().hard_state().clone();
            current.term != hs.term || current.vote != hs.vote
        };
        self.mem_storage.wl().set_hardstate(hs);
        if vote_or_term_changed {
            if let Err(e) = self.persist_stable() {
                log::error!("cannot persist stable state: {e}");
            }
        }
    }

    /// Advances the in-memory commit index. Recovered from the cluster on
    /// restart, so not persisted eagerly.
    pub fn set_commit(&mut self, commit: u64) {
        self.mem_storage.wl().mut_hard_state().set_commit(commit);
    }

    /// Saves an Executor snapshot taken at `applied` and compacts the log
    /// behind it, keeping the trailing window for slow followers.
    pub fn save_snapshot(&mut self, data: Vec<u8>, applied: u64) -> Result<()> {
        let term = self.mem_storage.term(applied)?;
        let conf_state = self.mem_storage.initial_state()?.conf_state;

        let payload = SnapshotPayload {
            members: self.membership.members(),
            data,
        };
        let mut snapshot = Snapshot::default();
        snapshot.mut_metadata().index = applied;
        snapshot.mut_metadata().term = term;
        snapshot.mut_metadata().set_conf_state(conf_state);
        snapshot.set_data(Bytes::from(
            bincode::serialize(&payload).map_err(store_err)?,
        ));

        self.write_snapshot_file(&snapshot)?;
        self.snapshot_meta = (applied, term);
        self.latest_snapshot = Some(snapshot);

        let compact_to = applied.saturating_sub(self.trailing_logs);
        if compact_to > self.mem_storage.first_index()? {
            self.mem_storage.wl().compact(compact_to)?;
            self.drop_segments_through(compact_to)?;
        }
        self.persist_stable()?;
        Ok(())
    }

    /// Index of the newest saved snapshot the log is anchored on.
    pub fn snapshot_index(&self) -> u64 {
        self.snapshot_meta.0
    }

    /// The Executor payload of the newest saved snapshot, with its log
    /// position. Used to reload the Executor on startup.
    pub fn latest_snapshot_payload(&self) -> Result<Option<(u64, u64, Vec<u8>)>> {
        match &self.latest_snapshot {
            Some(snapshot) => {
                let metadata = snapshot.get_metadata();
                let payload: SnapshotPayload =
                    bincode::deserialize(snapshot.get_data()).map_err(store_err)?;
                Ok(Some((metadata.index, metadata.term, payload.data)))
            }
            None => Ok(None),
        }
    }

    /// Installs a snapshot received from the leader, replacing the log.
    /// Returns the Executor payload for the state machine to restore.
    pub fn apply_snapshot(&mut self, snapshot: &Snapshot) -> Result<Vec<u8>> {
        let metadata = snapshot.get_metadata().clone();
        let payload: SnapshotPayload =
            bincode::deserialize(snapshot.get_data()).map_err(store_err)?;

        self.write_snapshot_file(snapshot)?;
        self.mem_storage.wl().apply_snapshot(snapshot.clone())?;
        self.snapshot_meta = (metadata.index, metadata.term);
        self.membership.replace(payload.members);
        self.latest_snapshot = Some(snapshot.clone());

        let bases: Vec<u64> = self.segments.keys().copied().collect();
        for base in bases {
            if let Some(segment) = self.segments.remove(&base) {
                if let Err(e) = fs::remove_file(segment.path()) {
                    log::warn!("cannot remove {}: {e}", segment.path().display());
                }
            }
        }
        self.persist_stable()?;
        Ok(payload.data)
    }
}

impl Storage for FileStorage {
    fn initial_state(&self) -> Result<RaftState> {
        self.mem_storage.initial_state()
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        context: GetEntriesContext,
    ) -> Result<Vec<Entry>> {
        self.mem_storage.entries(low, high, max_size, context)
    }

    fn term(&self, idx: u64) -> Result<u64> {
        self.mem_storage.term(idx)
    }

    fn first_index(&self) -> Result<u64> {
        self.mem_storage.first_index()
    }

    fn last_index(&self) -> Result<u64> {
        self.mem_storage.last_index()
    }

    /// Serves the newest Executor snapshot on disk; the consensus core
    /// retries while none covers `request_index` yet.
    fn snapshot(&self, request_index: u64, _to: u64) -> Result<Snapshot> {
        match &self.latest_snapshot {
            Some(snapshot) if snapshot.get_metadata().index >= request_index => {
                Ok(snapshot.clone())
            }
            _ => Err(raft::Error::Store(
                raft::StorageError::SnapshotTemporarilyUnavailable,
            )),
        }
    }
}
