//! The master: global scheduling state machine, the task RPC service, and
//! the final merge.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tarpc::context;
use tarpc::server::incoming::Incoming;
use tarpc::tokio_serde::formats::Json;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{error, info};

use crate::mr::error::MrError;
use crate::mr::error::Result as MrResult;
use crate::mr::names;
use crate::mr::store::{split_store, PairStore};
use crate::mr::task::{MapTask, ReduceTask, TaskAssignment, TaskReport};
use crate::mr::transport;

/// The two-method protocol between workers and the master. Workers poll
/// `get_task` with a bounded sleep; `finished_task` is called exactly once
/// per completed task.
#[tarpc::service]
pub trait JobService {
    async fn get_task() -> TaskAssignment;
    async fn finished_task(report: TaskReport) -> bool;
}

/// Where the job stands globally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Map,
    Reduce,
    Done,
}

/// Global scheduling state. Created once after splitting, mutated only by
/// the RPC handlers while the master's one lock is held, dropped when the
/// process exits.
pub struct Work {
    map_tasks: Vec<MapTask>,
    reduce_tasks: Vec<ReduceTask>,
    phase: Phase,
    /// Index of the next task to hand out in the current phase.
    next_task: usize,
    tasks_completed: usize,
    reduce_output_urls: Vec<String>,
    merge_complete: bool,
    merge_error: Option<MrError>,
}

impl Work {
    /// `source_host` is the address map workers fetch their shards from,
    /// i.e. the master's file server.
    pub fn new(m: usize, r: usize, source_host: &str) -> Self {
        let map_tasks = (0..m)
            .map(|n| MapTask {
                m,
                r,
                n,
                source_host: source_host.to_string(),
            })
            .collect();
        let reduce_tasks = (0..r)
            .map(|n| ReduceTask {
                m,
                r,
                n,
                source_hosts: Vec::new(),
            })
            .collect();
        Self {
            map_tasks,
            reduce_tasks,
            phase: Phase::Map,
            next_task: 0,
            tasks_completed: 0,
            reduce_output_urls: Vec::new(),
            merge_complete: false,
            merge_error: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// True once the final merge has run (successfully or not).
    pub fn done(&self) -> bool {
        self.merge_complete
    }

    /// Hand out the next task of the current phase. Each ordinal is
    /// returned at most once per phase.
    pub fn next_assignment(&mut self) -> TaskAssignment {
        match self.phase {
            Phase::Map => {
                if self.next_task < self.map_tasks.len() {
                    let task = self.map_tasks[self.next_task].clone();
                    self.next_task += 1;
                    info!("assigned map task {} of {}", task.n, task.m);
                    TaskAssignment::Map(task)
                } else {
                    TaskAssignment::Wait
                }
            }
            Phase::Reduce => {
                if self.next_task < self.reduce_tasks.len() {
                    let task = self.reduce_tasks[self.next_task].clone();
                    self.next_task += 1;
                    info!("assigned reduce task {} of {}", task.n, task.r);
                    TaskAssignment::Reduce(task)
                } else {
                    TaskAssignment::Wait
                }
            }
            // Workers may only leave once the final merge no longer needs
            // the files they serve.
            Phase::Done if self.merge_complete => TaskAssignment::Done,
            Phase::Done => TaskAssignment::Wait,
        }
    }

    /// Record a completion report; returns the phase newly entered if this
    /// report closed out the current one.
    pub fn record_finished(&mut self, report: &TaskReport) -> Option<Phase> {
        match self.phase {
            Phase::Map => {
                // Partition r of this map output feeds reduce task r, for
                // every r including on the map task that closes the phase.
                for (r, reduce) in self.reduce_tasks.iter_mut().enumerate() {
                    reduce.source_hosts.push(format!(
                        "http://{}/{}/{}",
                        report.worker_address,
                        report.directory,
                        names::map_output_file(report.task_id, r)
                    ));
                }
                self.tasks_completed += 1;
                info!(
                    "map task {} finished ({}/{})",
                    report.task_id,
                    self.tasks_completed,
                    self.map_tasks.len()
                );
                if self.tasks_completed == self.map_tasks.len() {
                    self.phase = Phase::Reduce;
                    self.next_task = 0;
                    self.tasks_completed = 0;
                    info!("all map tasks finished, entering the reduce phase");
                    return Some(Phase::Reduce);
                }
                None
            }
            Phase::Reduce => {
                self.reduce_output_urls.push(format!(
                    "http://{}/{}/{}",
                    report.worker_address,
                    report.directory,
                    names::reduce_output_file(report.task_id)
                ));
                self.tasks_completed += 1;
                info!(
                    "reduce task {} finished ({}/{})",
                    report.task_id,
                    self.tasks_completed,
                    self.reduce_tasks.len()
                );
                if self.tasks_completed == self.reduce_tasks.len() {
                    self.phase = Phase::Done;
                    return Some(Phase::Done);
                }
                None
            }
            Phase::Done => None,
        }
    }

    pub fn reduce_output_urls(&self) -> &[String] {
        &self.reduce_output_urls
    }

    fn complete_merge(&mut self, outcome: MrResult<u64>) {
        match outcome {
            Ok(rows) => info!("final merge wrote {rows} rows"),
            Err(e) => {
                error!("final merge failed: {e}");
                self.merge_error = Some(e);
            }
        }
        self.merge_complete = true;
    }

    fn take_merge_error(&mut self) -> Option<MrError> {
        self.merge_error.take()
    }
}

/// The RPC server. Cloned per connection; all clones share one `Work`.
#[derive(Clone)]
pub struct Master {
    work: Arc<Mutex<Work>>,
    data_dir: PathBuf,
}

impl Master {
    pub fn new(work: Arc<Mutex<Work>>, data_dir: PathBuf) -> Self {
        Self { work, data_dir }
    }
}

#[tarpc::server]
impl JobService for Master {
    async fn get_task(self, _: context::Context) -> TaskAssignment {
        self.work.lock().await.next_assignment()
    }

    async fn finished_task(self, _: context::Context, report: TaskReport) -> bool {
        let mut work = self.work.lock().await;
        if work.record_finished(&report) == Some(Phase::Done) {
            // The merge runs before the lock is released: until it is done,
            // get_task answers Wait, and no worker removes the outputs the
            // merge still has to fetch.
            let outcome = merge_outputs(work.reduce_output_urls(), &self.data_dir).await;
            work.complete_merge(outcome);
        }
        true
    }
}

/// Fetch each reduce output and append it into `final.sqlite3`. Returns the
/// final row count.
async fn merge_outputs(urls: &[String], data_dir: &Path) -> MrResult<u64> {
    let store = PairStore::create(data_dir.join(names::FINAL_FILE))?;
    let scratch = data_dir.join(names::SCRATCH_FILE);
    for url in urls {
        transport::fetch(url, &scratch).await?;
        store.merge_from(&scratch)?;
        tokio::fs::remove_file(&scratch).await?;
    }
    store.count()
}

pub struct MasterConfig {
    /// host:port the task service listens on; the file server binds one
    /// port above it.
    pub address: String,
    pub m: usize,
    pub r: usize,
    /// The input relation to split.
    pub source: PathBuf,
    /// Directory the shards and the final result live in.
    pub data_dir: PathBuf,
}

/// Split the source, serve shards and tasks, wait for the job to finish.
pub async fn run_master(cfg: MasterConfig) -> MrResult<()> {
    if cfg.m == 0 || cfg.r == 0 {
        return Err(MrError::Config(format!(
            "need at least one map and one reduce task, got m={} r={}",
            cfg.m, cfg.r
        )));
    }

    std::fs::create_dir_all(&cfg.data_dir)?;
    let pattern = cfg.data_dir.join(names::MAP_SOURCE_PATTERN);
    let pattern = pattern
        .to_str()
        .ok_or_else(|| MrError::Config("data directory is not valid UTF-8".into()))?;
    let shards = split_store(&cfg.source, pattern, cfg.m)?;
    info!(
        "split {} into {} shards under {}",
        cfg.source.display(),
        shards.len(),
        cfg.data_dir.display()
    );

    let files_address = transport::data_sibling(&cfg.address)?;
    transport::serve_files(&files_address, &cfg.data_dir).await?;

    let work = Arc::new(Mutex::new(Work::new(cfg.m, cfg.r, &files_address)));
    let master = Master::new(Arc::clone(&work), cfg.data_dir.clone());

    let listener = tarpc::serde_transport::tcp::listen(&cfg.address, Json::default)
        .await
        .map_err(MrError::Io)?;
    tokio::spawn(
        listener
            .filter_map(|r| async { r.ok() })
            .map(tarpc::server::BaseChannel::with_defaults)
            .execute(master.serve()),
    );
    info!(
        "master serving tasks on {} and files on {}",
        cfg.address, files_address
    );

    // The last finished_task report runs the final merge; this loop only
    // has to notice that it happened.
    loop {
        sleep(Duration::from_secs(1)).await;
        let mut work = work.lock().await;
        if work.done() {
            if let Some(err) = work.take_merge_error() {
                return Err(err);
            }
            break;
        }
    }
    info!(
        "job complete, final output at {}",
        cfg.data_dir.join(names::FINAL_FILE).display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(task_id: usize, worker: &str) -> TaskReport {
        TaskReport {
            task_id,
            worker_address: worker.to_string(),
            directory: names::DATA_DIR.to_string(),
        }
    }

    fn drain_phase(work: &mut Work, expect: usize) -> Vec<usize> {
        let mut ordinals = Vec::new();
        loop {
            match work.next_assignment() {
                TaskAssignment::Map(t) => ordinals.push(t.n),
                TaskAssignment::Reduce(t) => ordinals.push(t.n),
                TaskAssignment::Wait | TaskAssignment::Done => break,
            }
        }
        assert_eq!(ordinals.len(), expect);
        ordinals
    }

    #[test]
    fn each_ordinal_is_assigned_at_most_once() {
        let mut work = Work::new(3, 2, "master:8081");
        let ordinals = drain_phase(&mut work, 3);
        assert_eq!(ordinals, vec![0, 1, 2]);
        // Exhausted phase keeps answering Wait.
        assert!(matches!(work.next_assignment(), TaskAssignment::Wait));
    }

    #[test]
    fn no_reduce_task_before_every_map_finished() {
        let mut work = Work::new(2, 2, "master:8081");
        drain_phase(&mut work, 2);

        assert!(work.record_finished(&report(0, "w1:9000")).is_none());
        // One map task is still out: the barrier holds.
        assert!(matches!(work.next_assignment(), TaskAssignment::Wait));
        assert_eq!(work.phase(), Phase::Map);

        assert_eq!(
            work.record_finished(&report(1, "w2:9000")),
            Some(Phase::Reduce)
        );
        assert_eq!(work.phase(), Phase::Reduce);
        drain_phase(&mut work, 2);
    }

    #[test]
    fn map_completion_fans_out_all_partitions() {
        let mut work = Work::new(2, 3, "master:8081");
        drain_phase(&mut work, 2);
        work.record_finished(&report(0, "w1:9000"));
        work.record_finished(&report(1, "w2:9000"));

        // Every reduce task carries one URL per map task, in completion
        // order, including from the map task that closed the phase.
        for r in 0..3 {
            match work.next_assignment() {
                TaskAssignment::Reduce(task) => {
                    assert_eq!(task.n, r);
                    assert_eq!(
                        task.source_hosts,
                        vec![
                            names::make_url("w1:9000", &names::map_output_file(0, r)),
                            names::make_url("w2:9000", &names::map_output_file(1, r)),
                        ]
                    );
                }
                other => panic!("expected a reduce task, got {other:?}"),
            }
        }
    }

    #[test]
    fn master_urls_match_worker_served_paths() {
        // The URL built from a report must equal the canonical form the
        // worker's file server answers.
        let mut work = Work::new(1, 1, "master:8081");
        drain_phase(&mut work, 1);
        work.record_finished(&report(0, "worker:9000"));
        match work.next_assignment() {
            TaskAssignment::Reduce(task) => assert_eq!(
                task.source_hosts,
                vec!["http://worker:9000/data/map_0_output_0.sqlite3".to_string()]
            ),
            other => panic!("expected a reduce task, got {other:?}"),
        }
    }

    #[test]
    fn done_is_withheld_until_the_merge_completes() {
        let mut work = Work::new(1, 1, "master:8081");
        drain_phase(&mut work, 1);
        work.record_finished(&report(0, "w:9000"));
        drain_phase(&mut work, 1);

        assert_eq!(work.record_finished(&report(0, "w:9000")), Some(Phase::Done));
        assert_eq!(
            work.reduce_output_urls(),
            &["http://w:9000/data/reduce_0_output.sqlite3".to_string()]
        );
        // Merge still running: late pollers wait.
        assert!(matches!(work.next_assignment(), TaskAssignment::Wait));

        work.complete_merge(Ok(1));
        assert!(work.done());
        assert!(matches!(work.next_assignment(), TaskAssignment::Done));
        // Reports after the job is done are ignored.
        assert!(work.record_finished(&report(0, "w:9000")).is_none());
    }

    #[tokio::test]
    async fn concurrent_polling_assigns_each_ordinal_once() {
        let work = Arc::new(Mutex::new(Work::new(8, 1, "master:8081")));
        let mut pollers = Vec::new();
        for _ in 0..4 {
            let work = Arc::clone(&work);
            pollers.push(tokio::spawn(async move {
                let mut got = Vec::new();
                loop {
                    match work.lock().await.next_assignment() {
                        TaskAssignment::Map(task) => got.push(task.n),
                        _ => break,
                    }
                    tokio::task::yield_now().await;
                }
                got
            }));
        }

        let mut all = Vec::new();
        for poller in pollers {
            all.extend(poller.await.unwrap());
        }
        all.sort_unstable();
        assert_eq!(all, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn merge_failure_is_reported_once() {
        let mut work = Work::new(1, 1, "master:8081");
        drain_phase(&mut work, 1);
        work.record_finished(&report(0, "w:9000"));
        drain_phase(&mut work, 1);
        work.record_finished(&report(0, "w:9000"));

        work.complete_merge(Err(MrError::Config("boom".into())));
        assert!(work.done());
        assert!(matches!(
            work.take_merge_error(),
            Some(MrError::Config(_))
        ));
        assert!(work.take_merge_error().is_none());
    }
}
