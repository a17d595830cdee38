//! End-to-end word count: split, map, shuffle over live file servers,
//! reduce, merge. Everything runs in-process; the phases are driven here
//! the way the master and worker loops drive them.

use std::collections::HashMap;
use std::sync::Arc;

use mapred::mr::function::wc::WordCount;
use mapred::mr::names;
use mapred::mr::store::{split_store, PairStore, ScanOrder};
use mapred::mr::task::{MapTask, ReduceTask};
use mapred::mr::transport::serve_files;
use tempfile::TempDir;

async fn run_job(docs: &[(&str, &str)], m: usize, r: usize) -> HashMap<String, String> {
    let master_dir = TempDir::new().unwrap();
    let worker_dir = TempDir::new().unwrap();

    let source_path = master_dir.path().join("source.sqlite3");
    let source = PairStore::create(&source_path).unwrap();
    for (key, value) in docs {
        source.insert(key, value).unwrap();
    }
    drop(source);

    let pattern = master_dir.path().join(names::MAP_SOURCE_PATTERN);
    let shards = split_store(&source_path, pattern.to_str().unwrap(), m).unwrap();
    assert_eq!(shards.len(), m);

    let (master_addr, _master_server) = serve_files("127.0.0.1:0", master_dir.path())
        .await
        .unwrap();
    let (worker_addr, _worker_server) = serve_files("127.0.0.1:0", worker_dir.path())
        .await
        .unwrap();

    let fns = Arc::new(WordCount::new());
    for n in 0..m {
        let task = MapTask {
            m,
            r,
            n,
            source_host: master_addr.to_string(),
        };
        task.process(worker_dir.path(), fns.clone()).await.unwrap();
    }

    for n in 0..r {
        let source_hosts = (0..m)
            .map(|i| names::make_url(&worker_addr.to_string(), &names::map_output_file(i, n)))
            .collect();
        let task = ReduceTask {
            m,
            r,
            n,
            source_hosts,
        };
        task.process(worker_dir.path(), fns.clone()).await.unwrap();
    }

    let final_store = PairStore::create(master_dir.path().join(names::FINAL_FILE)).unwrap();
    for n in 0..r {
        final_store
            .merge_from(worker_dir.path().join(names::reduce_output_file(n)))
            .unwrap();
    }

    let mut counts = HashMap::new();
    final_store
        .scan(ScanOrder::SortedKeyValue, |key, value| {
            counts.insert(key, value);
            Ok(())
        })
        .unwrap();
    // Exactly one output row per distinct word, across all partitions.
    assert_eq!(final_store.count().unwrap() as usize, counts.len());
    counts
}

#[tokio::test]
async fn counts_a_single_repeated_word() {
    let counts = run_job(&[("a", "The the THE.")], 1, 1).await;
    assert_eq!(counts, HashMap::from([("the".to_string(), "3".to_string())]));
}

#[tokio::test]
async fn counts_across_documents_and_partitions() {
    let counts = run_job(&[("a", "hello"), ("b", "hello world")], 2, 2).await;
    assert_eq!(
        counts,
        HashMap::from([
            ("hello".to_string(), "2".to_string()),
            ("world".to_string(), "1".to_string()),
        ])
    );
}

#[tokio::test]
async fn counts_with_more_shards_than_reducers() {
    let counts = run_job(
        &[
            ("a", "apple banana apple"),
            ("b", "banana cherry"),
            ("c", "date"),
        ],
        3,
        2,
    )
    .await;
    assert_eq!(
        counts,
        HashMap::from([
            ("apple".to_string(), "2".to_string()),
            ("banana".to_string(), "2".to_string()),
            ("cherry".to_string(), "1".to_string()),
            ("date".to_string(), "1".to_string()),
        ])
    );
}
