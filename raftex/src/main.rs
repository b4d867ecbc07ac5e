//! Standalone replication node binary.
//!
//! Parses the node settings, initializes logging and runs the server until a
//! shutdown signal arrives.

use std::path::PathBuf;

use clap::Parser;

use raftex::{ConsistencyMode, NodeConfig};

/// Environment variable consulted for the log filter when `--log-level` is
/// not given.
const LOG_LEVEL_ENV: &str = "RAFTEX_LOG_LEVEL";

/// Command line arguments for the node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TCP host:port for this node
    #[arg(long, default_value = "localhost:50051")]
    address: String,

    /// Numeric node id used by raft
    #[arg(long)]
    raft_id: u64,

    /// Raft data dir
    #[arg(long, default_value = "data/")]
    raft_data_dir: PathBuf,

    /// Underlying executor host:port
    #[arg(long, default_value = "localhost:54321")]
    executor_target: String,

    /// Read consistency: strong or eventual
    #[arg(long, default_value = "eventual")]
    consistency: ConsistencyMode,

    /// Optional host:port for the Prometheus metrics listener
    #[arg(long)]
    metrics_address: Option<String>,

    /// Heartbeat timeout in milliseconds
    #[arg(long, default_value_t = 1000)]
    heartbeat_timeout: u64,

    /// Election timeout in milliseconds
    #[arg(long, default_value_t = 1000)]
    election_timeout: u64,

    /// Commit timeout in milliseconds
    #[arg(long, default_value_t = 50)]
    commit_timeout: u64,

    /// Maximum entries per append message
    #[arg(long, default_value_t = 64)]
    max_append_entries: u64,

    /// Drain committed entries to the applier in batches
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    batch_applych: bool,

    /// Shut down once removed from the configuration
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    shutdown_on_remove: bool,

    /// Log entries retained behind a snapshot
    #[arg(long, default_value_t = 10240)]
    trailing_logs: u64,

    /// Seconds between snapshot checks
    #[arg(long, default_value_t = 120)]
    snapshot_interval: u64,

    /// Minimum applied entries between snapshots
    #[arg(long, default_value_t = 8192)]
    snapshot_threshold: u64,

    /// Leader lease timeout in milliseconds
    #[arg(long, default_value_t = 500)]
    leader_lease_timeout: u64,

    /// Log filter (error, warn, info, debug, trace)
    #[arg(long)]
    log_level: Option<String>,

    /// Skip reloading the executor from the newest local snapshot on start
    #[arg(long, default_value_t = false, action = clap::ArgAction::Set)]
    no_snapshot_restore_on_start: bool,
}

impl Args {
    fn into_config(self) -> NodeConfig {
        NodeConfig {
            id: self.raft_id,
            address: self.address,
            data_dir: self.raft_data_dir,
            executor_target: self.executor_target,
            consistency: self.consistency,
            metrics_address: self.metrics_address,
            heartbeat_timeout_ms: self.heartbeat_timeout,
            election_timeout_ms: self.election_timeout,
            commit_timeout_ms: self.commit_timeout,
            max_append_entries: self.max_append_entries,
            batch_apply: self.batch_applych,
            shutdown_on_remove: self.shutdown_on_remove,
            trailing_logs: self.trailing_logs,
            snapshot_interval_secs: self.snapshot_interval,
            snapshot_threshold: self.snapshot_threshold,
            leader_lease_timeout_ms: self.leader_lease_timeout,
            log_level: String::new(),
            no_snapshot_restore_on_start: self.no_snapshot_restore_on_start,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let log_level = args
        .log_level
        .clone()
        .or_else(|| std::env::var(LOG_LEVEL_ENV).ok())
        .unwrap_or_else(|| "info".to_string());
    env_logger::Builder::new()
        .parse_filters(&log_level)
        .try_init()
        .unwrap_or_default();

    let mut config = args.into_config();
    config.log_level = log_level;

    raftex::run(config).await?;
    Ok(())
}
