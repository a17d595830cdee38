use std::path::PathBuf;

use clap::Parser;
use mapred::mr::master::{run_master, MasterConfig};
use tracing_subscriber::EnvFilter;

/// Coordinate a MapReduce job: split the input, hand out tasks, merge the
/// result into data/final.sqlite3.
#[derive(Parser)]
#[command(name = "mrmaster", version)]
struct Args {
    /// host:port to serve tasks on; intermediate files are served one port
    /// above it
    address: String,
    /// number of map tasks
    m: usize,
    /// number of reduce tasks
    r: usize,
    /// SQLite relation holding the input pairs
    source: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    run_master(MasterConfig {
        address: args.address,
        m: args.m,
        r: args.r,
        source: args.source,
        data_dir: PathBuf::from("data"),
    })
    .await?;
    Ok(())
}
