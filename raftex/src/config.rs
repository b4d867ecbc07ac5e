//! Configuration for a replication node.
//!
//! Settings are parsed from the command line (or supplied by an embedding
//! runtime) and installed once; everything else reads the global instance.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Mutex;

use once_cell::sync::OnceCell;
use serde::Deserialize;

/// Global configuration instance
static INSTANCE: OnceCell<Mutex<NodeConfig>> = OnceCell::new();

/// Returns a reference to the global configuration instance
pub fn instance() -> &'static Mutex<NodeConfig> {
    INSTANCE.get_or_init(|| Mutex::new(NodeConfig::default()))
}

/// Installs `config` as the process-wide configuration.
pub fn install(config: NodeConfig) {
    instance().lock().unwrap().clone_from(&config);
}

/// Returns a copy of the installed configuration.
pub fn current() -> NodeConfig {
    instance().lock().unwrap().clone()
}

/// How reads are served by this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsistencyMode {
    /// Reads are proposed through the log, linearized with writes.
    Strong,
    /// Reads go straight to the local Executor.
    Eventual,
}

impl FromStr for ConsistencyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "strong" => Ok(ConsistencyMode::Strong),
            "eventual" => Ok(ConsistencyMode::Eventual),
            other => Err(format!("unknown consistency mode {other:?}")),
        }
    }
}

impl std::fmt::Display for ConsistencyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConsistencyMode::Strong => write!(f, "strong"),
            ConsistencyMode::Eventual => write!(f, "eventual"),
        }
    }
}

/// Settings of a single replication node, immutable after startup.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Numeric id of this node inside the cluster.
    pub id: u64,
    /// Public host:port serving the client, transport and admin services.
    pub address: String,
    /// Root directory for durable state; this node writes under `<dir>/<id>`.
    pub data_dir: PathBuf,
    /// Address of the local Executor process, e.g. `localhost:54321`.
    pub executor_target: String,
    /// Read-path consistency mode.
    pub consistency: ConsistencyMode,
    /// Optional host:port for the Prometheus metrics listener.
    pub metrics_address: Option<String>,

    /// Follower heartbeat timeout, in milliseconds.
    pub heartbeat_timeout_ms: u64,
    /// Election timeout, in milliseconds.
    pub election_timeout_ms: u64,
    /// Commit pipelining interval, in milliseconds.
    pub commit_timeout_ms: u64,
    /// Upper bound on entries shipped per append message.
    pub max_append_entries: u64,
    /// Whether committed entries are drained to the applier in batches.
    pub batch_apply: bool,
    /// Shut the node down once it is removed from the configuration.
    pub shutdown_on_remove: bool,
    /// Entries retained behind the snapshot index at compaction time.
    pub trailing_logs: u64,
    /// Minimum seconds between Executor snapshots.
    pub snapshot_interval_secs: u64,
    /// Minimum applied entries between Executor snapshots.
    pub snapshot_threshold: u64,
    /// Leader lease duration, in milliseconds.
    pub leader_lease_timeout_ms: u64,
    /// Log filter, e.g. `info` or `debug`.
    pub log_level: String,
    /// Skip pushing the newest local snapshot into the Executor on start.
    pub no_snapshot_restore_on_start: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            id: 0,
            address: "localhost:50051".to_string(),
            data_dir: PathBuf::from("data/"),
            executor_target: "localhost:54321".to_string(),
            consistency: ConsistencyMode::Eventual,
            metrics_address: None,
            heartbeat_timeout_ms: 1000,
            election_timeout_ms: 1000,
            commit_timeout_ms: 50,
            max_append_entries: 64,
            batch_apply: true,
            shutdown_on_remove: true,
            trailing_logs: 10240,
            snapshot_interval_secs: 120,
            snapshot_threshold: 8192,
            leader_lease_timeout_ms: 500,
            log_level: "info".to_string(),
            no_snapshot_restore_on_start: false,
        }
    }
}

impl NodeConfig {
    /// Directory holding this node's durable state.
    pub fn node_dir(&self) -> PathBuf {
        self.data_dir.join(self.id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consistency_mode_parses() {
        assert_eq!(
            "strong".parse::<ConsistencyMode>().unwrap(),
            ConsistencyMode::Strong
        );
        assert_eq!(
            "Eventual".parse::<ConsistencyMode>().unwrap(),
            ConsistencyMode::Eventual
        );
        assert!("quorum".parse::<ConsistencyMode>().is_err());
    }

    #[test]
    fn node_dir_appends_id() {
        let config = NodeConfig {
            id: 7,
            data_dir: PathBuf::from("/tmp/raftex"),
            ..NodeConfig::default()
        };
        assert_eq!(config.node_dir(), PathBuf::from("/tmp/raftex/7"));
    }
}
