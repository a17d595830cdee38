//! The worker main loop: serve intermediate files, poll the master for
//! tasks, run them, report back.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tarpc::tokio_serde::formats::Json;
use tarpc::{client, context};
use tokio::time::sleep;
use tracing::{debug, info};

use crate::mr::error::{MrError, Result};
use crate::mr::function::UserFns;
use crate::mr::master::JobServiceClient;
use crate::mr::names;
use crate::mr::task::{TaskAssignment, TaskReport};
use crate::mr::transport;

/// How long to sleep when the master has nothing to hand out.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// The completion report that closes a phase can keep the master busy well
/// past the default RPC deadline (the final merge runs inside the handler),
/// so reports get a generous one.
const REPORT_DEADLINE: Duration = Duration::from_secs(600);

pub struct WorkerConfig {
    /// host:port this worker's file server advertises and binds.
    pub address: String,
    /// host:port of the master's task service.
    pub master_address: String,
}

/// Run tasks until the master says the job is done.
pub async fn run_worker(cfg: WorkerConfig, fns: Arc<dyn UserFns>) -> Result<()> {
    let tempdir = std::env::temp_dir().join(format!("mapreduce.{}", std::process::id()));
    tokio::fs::create_dir_all(&tempdir).await?;

    // Reduce workers pull this worker's map outputs from here.
    transport::serve_files(&cfg.address, &tempdir).await?;

    let result = work_loop(&cfg, &tempdir, fns).await;
    let _ = tokio::fs::remove_dir_all(&tempdir).await;
    result
}

async fn work_loop(cfg: &WorkerConfig, tempdir: &Path, fns: Arc<dyn UserFns>) -> Result<()> {
    let transport = tarpc::serde_transport::tcp::connect(&cfg.master_address, Json::default)
        .await
        .map_err(|e| MrError::Rpc(e.to_string()))?;
    let client = JobServiceClient::new(client::Config::default(), transport).spawn();
    info!(
        "worker {} connected to master {}",
        cfg.address, cfg.master_address
    );

    loop {
        let assignment = client
            .get_task(context::current())
            .await
            .map_err(|e| MrError::Rpc(e.to_string()))?;
        match assignment {
            TaskAssignment::Map(task) => {
                info!("processing map task {}", task.n);
                let task_id = task.n;
                task.process(tempdir, Arc::clone(&fns)).await?;
                report_finished(&client, task_id, &cfg.address).await?;
            }
            TaskAssignment::Reduce(task) => {
                info!("processing reduce task {}", task.n);
                let task_id = task.n;
                task.process(tempdir, Arc::clone(&fns)).await?;
                report_finished(&client, task_id, &cfg.address).await?;
            }
            TaskAssignment::Wait => {
                debug!("no task available, sleeping");
                sleep(POLL_INTERVAL).await;
            }
            TaskAssignment::Done => {
                info!("job finished, cleaning up");
                return Ok(());
            }
        }
    }
}

async fn report_finished(
    client: &JobServiceClient,
    task_id: usize,
    worker_address: &str,
) -> Result<()> {
    let mut ctx = context::current();
    ctx.deadline = SystemTime::now() + REPORT_DEADLINE;
    let report = TaskReport {
        task_id,
        worker_address: worker_address.to_string(),
        directory: names::DATA_DIR.to_string(),
    };
    client
        .finished_task(ctx, report)
        .await
        .map_err(|e| MrError::Rpc(e.to_string()))?;
    Ok(())
}
