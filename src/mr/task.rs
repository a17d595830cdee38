//! Task execution on the worker: the map and reduce pipelines.
//!
//! Both pipelines overlap user-function execution with storage I/O through
//! bounded channels and short-lived scoped threads; the engine side of each
//! channel keeps every output relation single-writer.

use std::path::Path;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::mr::error::{MrError, Result};
use crate::mr::function::{PairSender, UserFns, ValueStream, CHANNEL_DEPTH};
use crate::mr::names;
use crate::mr::store::{PairStore, ScanOrder};
use crate::mr::transport;

/// One key/value pair. Both sides are opaque to the engine, which only
/// hashes keys and compares bytewise.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Pair {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapTask {
    /// Totals for the whole job.
    pub m: usize,
    pub r: usize,
    /// This task's ordinal, 0-based.
    pub n: usize,
    /// Address hosting this task's input shard.
    pub source_host: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReduceTask {
    pub m: usize,
    pub r: usize,
    pub n: usize,
    /// One URL per map task, each naming that map output's partition `n`.
    /// Filled in by the master before the task is handed out.
    pub source_hosts: Vec<String>,
}

/// What the master hands a polling worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TaskAssignment {
    Map(MapTask),
    Reduce(ReduceTask),
    /// Nothing available right now; poll again shortly.
    Wait,
    /// The job is complete; the worker should exit.
    Done,
}

/// Completion report a worker sends for each task it ran.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReport {
    pub task_id: usize,
    /// Address of the worker's file server.
    pub worker_address: String,
    /// Path prefix its files are served under.
    pub directory: String,
}

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 16_777_619;

/// 32-bit FNV-1 (multiply, then xor). Every map worker must route a key with
/// exactly this function or the key's values scatter across reduce tasks, so
/// it is written out here rather than taken from a crate.
pub fn fnv1_32(bytes: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for &b in bytes {
        hash = hash.wrapping_mul(FNV_PRIME);
        hash ^= u32::from(b);
    }
    hash
}

/// The output partition a key belongs to.
pub fn partition_for_key(key: &str, r: usize) -> usize {
    (fnv1_32(key.as_bytes()) as usize) % r
}

/// Run `f` on the blocking pool and propagate its panic if it has one.
async fn run_blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result,
        Err(e) => std::panic::resume_unwind(e.into_panic()),
    }
}

impl MapTask {
    /// Run this map task inside `tempdir`. Returns the pairs-processed and
    /// pairs-generated counters.
    pub async fn process(
        &self,
        tempdir: &Path,
        fns: Arc<dyn UserFns>,
    ) -> Result<(u64, u64)> {
        let source_url = names::make_url(&self.source_host, &names::map_source_file(self.n));
        let input_path = tempdir.join(names::map_input_file(self.n));
        transport::fetch(&source_url, &input_path).await?;

        let task = self.clone();
        let tempdir = tempdir.to_path_buf();
        run_blocking(move || task.run(&tempdir, &input_path, fns.as_ref())).await
    }

    fn run(&self, tempdir: &Path, input_path: &Path, fns: &dyn UserFns) -> Result<(u64, u64)> {
        let input = PairStore::open(input_path)?;
        let mut outputs = Vec::with_capacity(self.r);
        for r in 0..self.r {
            outputs.push(PairStore::create(
                tempdir.join(names::map_output_file(self.n, r)),
            )?);
        }

        let mut processed = 0u64;
        let mut generated = 0u64;
        input.scan(ScanOrder::Insertion, |key, value| {
            processed += 1;
            generated += map_one(fns, &outputs, self.r, key, value)?;
            Ok(())
        })?;

        // Write-close every partition before the completion report makes
        // them visible to reduce workers.
        drop(outputs);
        info!(
            "map task {} processed {processed} pairs, generated {generated} pairs",
            self.n
        );
        Ok((processed, generated))
    }
}

/// Feed one input pair through the user's `Map` and route everything it
/// emits. The user function runs on its own thread against a bounded
/// channel; the collector drains it here so each partition store keeps a
/// single writer, and the user's error is picked up once the pair is fully
/// collected.
fn map_one(
    fns: &dyn UserFns,
    outputs: &[PairStore],
    r_total: usize,
    key: String,
    value: String,
) -> Result<u64> {
    let (tx, rx) = mpsc::sync_channel(CHANNEL_DEPTH);
    thread::scope(|s| {
        let user = s.spawn(move || fns.map(&key, &value, PairSender::new(tx)));

        let mut generated = 0u64;
        for pair in rx {
            let r = partition_for_key(&pair.key, r_total);
            outputs[r].insert(&pair.key, &pair.value)?;
            generated += 1;
        }

        match user.join() {
            Ok(result) => result.map_err(MrError::User)?,
            Err(panic) => std::panic::resume_unwind(panic),
        }
        Ok(generated)
    })
}

impl ReduceTask {
    /// Run this reduce task inside `tempdir`: shuffle the partitions in,
    /// then group and reduce them.
    pub async fn process(&self, tempdir: &Path, fns: Arc<dyn UserFns>) -> Result<()> {
        // Shuffle: pull partition n from every map worker and append it
        // into one local relation. The scratch file name is fixed and
        // reused across merges.
        let input_path = tempdir.join(names::reduce_input_file(self.n));
        let scratch = tempdir.join(names::SCRATCH_FILE);
        let input = PairStore::create(&input_path)?;
        for url in &self.source_hosts {
            transport::fetch(url, &scratch).await?;
            input.merge_from(&scratch)?;
            tokio::fs::remove_file(&scratch).await?;
        }
        debug!(
            "reduce task {} shuffled {} sources, {} rows",
            self.n,
            self.source_hosts.len(),
            input.count()?
        );
        drop(input);

        let task = self.clone();
        let tempdir = tempdir.to_path_buf();
        run_blocking(move || task.run(&tempdir, fns)).await
    }

    fn run(&self, tempdir: &Path, fns: Arc<dyn UserFns>) -> Result<()> {
        let input = PairStore::open(tempdir.join(names::reduce_input_file(self.n)))?;
        let output = Mutex::new(PairStore::create(
            tempdir.join(names::reduce_output_file(self.n)),
        )?);

        let mut groups = 0u64;
        thread::scope(|s| -> Result<()> {
            let mut group: Option<Group<'_>> = None;
            input.scan(ScanOrder::SortedKeyValue, |key, value| {
                let same = matches!(&group, Some(g) if g.key == key);
                if !same {
                    if let Some(prev) = group.take() {
                        prev.finish()?;
                    }
                    groups += 1;
                    group = Some(Group::launch(s, key, Arc::clone(&fns), &output));
                }
                let sent = match &group {
                    Some(g) => g.send(value).is_ok(),
                    None => true,
                };
                if !sent {
                    // The reducer stopped accepting values early; its own
                    // error is the one worth reporting.
                    if let Some(stopped) = group.take() {
                        stopped.finish()?;
                    }
                    return Err(MrError::User(anyhow::anyhow!(
                        "reducer exited before its value stream ended"
                    )));
                }
                Ok(())
            })?;
            // The scan delivers the last group's rows without a trailing
            // key change, so it is closed here.
            if let Some(last) = group.take() {
                last.finish()?;
            }
            Ok(())
        })?;

        info!("reduce task {} reduced {groups} key groups", self.n);
        Ok(())
    }
}

/// One in-flight key group: the user's `Reduce` on one thread, a driver
/// draining its output into the store on another, and the value sender the
/// scan feeds.
struct Group<'scope> {
    key: String,
    values: mpsc::SyncSender<String>,
    user: thread::ScopedJoinHandle<'scope, anyhow::Result<()>>,
    driver: thread::ScopedJoinHandle<'scope, Result<u64>>,
}

impl<'scope> Group<'scope> {
    fn launch<'env>(
        s: &'scope thread::Scope<'scope, 'env>,
        key: String,
        fns: Arc<dyn UserFns>,
        output: &'env Mutex<PairStore>,
    ) -> Group<'scope> {
        let (vtx, vrx) = mpsc::sync_channel(CHANNEL_DEPTH);
        let (otx, orx) = mpsc::sync_channel::<Pair>(CHANNEL_DEPTH);

        let user_key = key.clone();
        let user =
            s.spawn(move || fns.reduce(&user_key, ValueStream::new(vrx), PairSender::new(otx)));

        let driver = s.spawn(move || {
            // One transaction per key group; groups run strictly one at a
            // time, so the lock is never contended.
            let store = output.lock().unwrap();
            store.begin_batch()?;
            let mut written = 0u64;
            for pair in orx {
                store.insert(&pair.key, &pair.value)?;
                written += 1;
            }
            store.commit_batch()?;
            Ok(written)
        });

        Group {
            key,
            values: vtx,
            user,
            driver,
        }
    }

    fn send(&self, value: String) -> std::result::Result<(), mpsc::SendError<String>> {
        self.values.send(value)
    }

    /// Close the value stream and wait for the reducer and its driver.
    fn finish(self) -> Result<()> {
        drop(self.values);
        let user = match self.user.join() {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        };
        let driven = match self.driver.join() {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        };
        user.map_err(MrError::User)?;
        driven?;
        Ok(())
    }
}
