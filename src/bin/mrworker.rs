use std::sync::Arc;

use clap::Parser;
use mapred::mr::function::wc::WordCount;
use mapred::mr::worker::{run_worker, WorkerConfig};
use tracing_subscriber::EnvFilter;

/// Run map and reduce tasks for a master until the job is done.
#[derive(Parser)]
#[command(name = "mrworker", version)]
struct Args {
    /// host:port this worker serves its intermediate files on
    address: String,
    /// host:port of the master's task service
    master_address: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    run_worker(
        WorkerConfig {
            address: args.address,
            master_address: args.master_address,
        },
        Arc::new(WordCount::new()),
    )
    .await?;
    Ok(())
}
