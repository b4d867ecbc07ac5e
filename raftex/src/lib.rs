//! Replicates a stateful Executor service across a cluster of nodes with
//! Raft.
//!
//! Every node mirrors the Executor's gRPC request surface: mutating requests
//! are agreed through the replicated log and applied to each node's local
//! Executor in the same order; reads are served strongly (through the log)
//! or eventually (straight from the Executor), per configuration. The crate
//! is usable as a library by an embedding runtime ([`run`], [`add_voter`],
//! [`get_configuration`]) or through the `raftex` binary.

pub mod admin;
pub mod config;
pub mod error;
pub mod executor;
pub mod fsm;
pub mod metrics;
pub mod peer;
pub mod raft;
pub mod raft_client;
pub mod raft_service;
pub mod server;
pub mod snapshot;

pub use admin::{add_voter, get_configuration};
pub use config::{ConsistencyMode, NodeConfig};
pub use error::{NodeError, NodeResult};

use tokio::signal;

/// Waits for SIGINT, SIGTERM or SIGQUIT.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(unix)]
    let quit = async {
        signal::unix::signal(signal::unix::SignalKind::quit())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    #[cfg(not(unix))]
    let quit = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = quit => {},
    }
}

/// Runs a node with the given configuration until a shutdown signal
/// arrives, then stops it gracefully. Returns once shutdown completes.
pub async fn run(node_config: NodeConfig) -> NodeResult<()> {
    config::install(node_config);
    server::instance().lock().await.start().await?;
    shutdown_signal().await;
    server::instance().lock().await.stop().await;
    Ok(())
}
