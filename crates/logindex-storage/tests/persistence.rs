//! Restart and reindex behavior over file-backed storage.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use logindex_core::{
    BatchHandler, Block, BlockLog, Entry, IndexError, Indexer, IndexerOptions, MemoryLog,
};
use logindex_storage::DirStorageFactory;
use tempfile::tempdir;

struct Collector {
    seen: Mutex<Vec<Entry>>,
}

impl Collector {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
        })
    }

    fn entries(&self) -> Vec<Entry> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl BatchHandler for Collector {
    async fn handle(&self, entries: &[Entry]) -> Result<(), IndexError> {
        self.seen.lock().unwrap().extend_from_slice(entries);
        Ok(())
    }
}

fn seeded_logs(seeds: &[u8]) -> Vec<Arc<MemoryLog>> {
    seeds.iter().map(|s| Arc::new(MemoryLog::from_seed(*s))).collect()
}

fn as_dyn(logs: &[Arc<MemoryLog>]) -> Vec<Arc<dyn BlockLog>> {
    logs.iter().map(|l| Arc::clone(l) as Arc<dyn BlockLog>).collect()
}

fn append_range(logs: &[Arc<MemoryLog>], range: std::ops::Range<u64>) {
    for log in logs {
        for i in range.clone() {
            log.append(Block::Utf8(format!("block-{i}")));
        }
    }
}

async fn run_to_idle(
    logs: &[Arc<MemoryLog>],
    dir: &std::path::Path,
    collector: &Arc<Collector>,
    reindex: bool,
) -> Indexer {
    let indexer = Indexer::open(
        as_dyn(logs),
        DirStorageFactory::shared(dir),
        Arc::clone(collector) as Arc<dyn BatchHandler>,
        IndexerOptions {
            reindex,
            ..Default::default()
        },
    )
    .await
    .unwrap();
    tokio::time::timeout(Duration::from_secs(30), indexer.idle())
        .await
        .expect("indexer should reach idle")
        .unwrap();
    indexer
}

fn assert_no_duplicates(entries: &[Entry]) {
    let mut keys = HashSet::new();
    for e in entries {
        assert!(
            keys.insert((e.discovery_id.clone(), e.index)),
            "duplicate delivery of {}:{}",
            e.discovery_id,
            e.index
        );
    }
}

#[tokio::test]
async fn restart_resumes_where_the_last_run_stopped() {
    let dir = tempdir().unwrap();
    let logs = seeded_logs(&[1, 2, 3, 4, 5]);
    append_range(&logs, 0..1000);

    // Run A indexes everything, then closes.
    let run_a = Collector::new();
    let indexer = run_to_idle(&logs, dir.path(), &run_a, false).await;
    assert_eq!(run_a.entries().len(), 5000);
    indexer.close().await.unwrap();

    // Run B over the same directory sees only the new appends.
    append_range(&logs, 1000..2000);
    let run_b = Collector::new();
    let indexer = run_to_idle(&logs, dir.path(), &run_b, false).await;
    let entries = run_b.entries();
    assert_eq!(entries.len(), 5000);
    assert_no_duplicates(&entries);
    assert!(
        entries.iter().all(|e| e.index >= 1000),
        "run B must not re-deliver run A's blocks"
    );
    indexer.close().await.unwrap();
}

#[tokio::test]
async fn unlink_forces_a_full_redelivery() {
    let dir = tempdir().unwrap();
    let logs = seeded_logs(&[11, 12, 13, 14, 15]);
    append_range(&logs, 0..1000);

    let run_a = Collector::new();
    let indexer = run_to_idle(&logs, dir.path(), &run_a, false).await;
    assert_eq!(run_a.entries().len(), 5000);
    indexer.close().await.unwrap();
    indexer.unlink().await.unwrap();

    // With the persisted state gone, everything comes back.
    let run_b = Collector::new();
    let indexer = run_to_idle(&logs, dir.path(), &run_b, false).await;
    let entries = run_b.entries();
    assert_eq!(entries.len(), 5000);
    assert_no_duplicates(&entries);
    indexer.close().await.unwrap();
}

#[tokio::test]
async fn reindex_option_redelivers_without_unlinking_first() {
    let dir = tempdir().unwrap();
    let logs = seeded_logs(&[21]);
    append_range(&logs, 0..100);

    let run_a = Collector::new();
    let indexer = run_to_idle(&logs, dir.path(), &run_a, false).await;
    assert_eq!(run_a.entries().len(), 100);
    indexer.close().await.unwrap();

    let run_b = Collector::new();
    let indexer = run_to_idle(&logs, dir.path(), &run_b, true).await;
    assert_eq!(run_b.entries().len(), 100);
    indexer.close().await.unwrap();
}

#[tokio::test]
async fn state_files_follow_the_discovery_key_layout() {
    let dir = tempdir().unwrap();
    let logs = seeded_logs(&[0xab]);
    append_range(&logs, 0..1);

    let collector = Collector::new();
    let indexer = run_to_idle(&logs, dir.path(), &collector, false).await;
    indexer.close().await.unwrap();

    let hex = "ab".repeat(32);
    let expected = dir.path().join("ab").join("ab").join(&hex);
    assert!(expected.is_file(), "missing state file {expected:?}");
}
