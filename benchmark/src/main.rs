use clap::Parser;
use hdrhistogram::Histogram;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use pb::single_data_rpc_client::SingleDataRpcClient;
use pb::{DataRequestProto, HeaderProto};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of concurrent clients
    #[arg(short, long, default_value = "1")]
    concurrency: usize,

    /// Delay between requests per client, in milliseconds
    #[arg(short, long, default_value = "100")]
    interval: u64,

    /// Duration of the benchmark in seconds
    #[arg(short, long, default_value = "30")]
    duration: u64,

    /// Node address
    #[arg(short, long, default_value = "http://127.0.0.1:50051")]
    server: String,

    /// Endpoint to exercise; must be one the executor declares
    #[arg(short, long, default_value = "/index")]
    endpoint: String,

    /// Payload size in bytes
    #[arg(short, long, default_value = "256")]
    payload_size: usize,
}

#[allow(clippy::module_inception)]
pub mod pb {
    tonic::include_proto!("executor");
}

#[derive(Debug)]
struct Stats {
    latencies: Histogram<u64>,
    ok: u64,
    failed: u64,
}

impl Stats {
    fn new() -> Self {
        Stats {
            latencies: Histogram::new(3).expect("histogram bounds are static"),
            ok: 0,
            failed: 0,
        }
    }
}

fn request(endpoint: &str, payload_size: usize) -> DataRequestProto {
    let payload: Vec<u8> = (0..payload_size).map(|_| rand::random::<u8>()).collect();
    DataRequestProto {
        header: Some(HeaderProto {
            exec_endpoint: endpoint.to_string(),
            request_id: format!("bench-{}", rand::random::<u64>()),
        }),
        payload,
    }
}

async fn worker(args: Arc<Args>, stats: Arc<Mutex<Stats>>, deadline: Instant) {
    let mut client = match SingleDataRpcClient::connect(args.server.clone()).await {
        Ok(client) => client,
        Err(e) => {
            eprintln!("cannot connect to {}: {}", args.server, e);
            return;
        }
    };

    while Instant::now() < deadline {
        let start = Instant::now();
        let result = client
            .process_single_data(request(&args.endpoint, args.payload_size))
            .await;

        let mut stats = stats.lock().await;
        match result {
            Ok(_) => {
                stats.ok += 1;
                let _ = stats.latencies.record(start.elapsed().as_micros() as u64);
            }
            Err(e) => {
                stats.failed += 1;
                eprintln!("request failed: {}", e);
            }
        }
        drop(stats);

        tokio::time::sleep(Duration::from_millis(args.interval)).await;
    }
}

fn report(stats: &Stats, duration: u64) {
    let total = stats.ok + stats.failed;
    println!();
    println!(
        "{} requests in {}s ({:.1} req/s), {} ok / {} failed",
        total,
        duration,
        total as f64 / duration as f64,
        stats.ok,
        stats.failed
    );
    if stats.ok == 0 {
        return;
    }

    println!("latency (us):");
    for (label, quantile) in [("p50", 50.0), ("p90", 90.0), ("p99", 99.0), ("p99.9", 99.9)] {
        println!(
            "  {:>6}  {}",
            label,
            stats.latencies.value_at_percentile(quantile)
        );
    }
    println!("  {:>6}  {}", "max", stats.latencies.max());
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Arc::new(Args::parse());
    let stats = Arc::new(Mutex::new(Stats::new()));
    let deadline = Instant::now() + Duration::from_secs(args.duration);

    println!(
        "driving {} at {} with {} clients, {}ms apart",
        args.endpoint, args.server, args.concurrency, args.interval
    );

    let workers: Vec<_> = (0..args.concurrency)
        .map(|_| tokio::spawn(worker(args.clone(), stats.clone(), deadline)))
        .collect();
    for handle in workers {
        let _ = handle.await;
    }

    report(&*stats.lock().await, args.duration);
    Ok(())
}
