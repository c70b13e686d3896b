//! The indexer driver: batches the fan-in, invokes the user's batch
//! handler, acknowledges delivered blocks, and exposes an observable
//! progress/state machine.
//!
//! The driver runs as one owned engine task. The public `Indexer` handle
//! talks to it over a command channel and observes it through a state watch
//! and an event broadcast. Blocks count as `remaining` until the batch that
//! contained them succeeds and they are acknowledged, so a consumer reading
//! the state from inside its own batch still sees that batch counted.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::core_stream::LogIndexStream;
use crate::error::IndexError;
use crate::log::BlockLog;
use crate::multi_stream::MultiLogStream;
use crate::signal::Signal;
use crate::storage::StorageFactory;
use crate::types::Entry;

// ─── Observable state ─────────────────────────────────────────────────────────

/// Lifecycle phase of the indexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexStatus {
    /// Everything known has been delivered and acknowledged.
    Idle,
    /// Entries are being delivered or are known to be deliverable.
    Indexing,
    /// Shutting down.
    Closing,
    /// Terminated.
    Closed,
}

impl std::fmt::Display for IndexStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Indexing => write!(f, "indexing"),
            Self::Closing => write!(f, "closing"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// A snapshot of the indexer's progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexState {
    pub current: IndexStatus,
    /// Blocks known but not yet acknowledged, summed over all logs.
    pub remaining: u64,
    /// Smoothed delivery rate.
    pub entries_per_second: f64,
}

/// Edge notifications; `Indexing` and `Idle` strictly alternate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexEvent {
    Indexing,
    Idle,
}

/// Counters accumulated over the life of the indexer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexerMetrics {
    pub batches: u64,
    pub entries: u64,
}

// ─── Configuration ────────────────────────────────────────────────────────────

/// Configuration for an `Indexer`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexerOptions {
    /// Most entries handed to the batch handler per call.
    pub max_batch: usize,
    /// Discard persisted index state on open and re-deliver everything
    /// locally present.
    pub reindex: bool,
}

impl Default for IndexerOptions {
    fn default() -> Self {
        Self {
            max_batch: 100,
            reindex: false,
        }
    }
}

/// Consumes batches of entries. Called serially, one batch at a time.
///
/// An error fails the pipeline: delivery stops, the indexer closes, and the
/// failed batch is not acknowledged, so its entries re-deliver on the next
/// run over the same storage.
#[async_trait]
pub trait BatchHandler: Send + Sync {
    async fn handle(&self, entries: &[Entry]) -> Result<(), IndexError>;
}

// ─── Handle ───────────────────────────────────────────────────────────────────

enum Command {
    AddLog {
        log: Arc<dyn BlockLog>,
        /// `Ok(true)` iff the log joined the stream set; a log that failed
        /// readiness is reported as accepted-but-inert with `Ok(false)`.
        ack: oneshot::Sender<Result<bool, IndexError>>,
    },
    Close {
        ack: oneshot::Sender<Result<(), IndexError>>,
    },
}

/// Public handle to a running indexer.
pub struct Indexer {
    commands: mpsc::Sender<Command>,
    state_rx: watch::Receiver<IndexState>,
    events: broadcast::Sender<IndexEvent>,
    metrics: Arc<Mutex<IndexerMetrics>>,
    factory: Arc<dyn StorageFactory>,
    logs: Mutex<Vec<Arc<dyn BlockLog>>>,
    task: Mutex<Option<JoinHandle<Result<(), IndexError>>>>,
}

impl Indexer {
    /// Open an indexer over `logs`, delivering batches to `handler` and
    /// persisting per-log progress through `storage`.
    ///
    /// For directory-backed state, pass the directory-rooted factory from
    /// the companion storage crate (`DirStorageFactory::shared(dir)`).
    pub async fn open(
        logs: Vec<Arc<dyn BlockLog>>,
        storage: Arc<dyn StorageFactory>,
        handler: Arc<dyn BatchHandler>,
        options: IndexerOptions,
    ) -> Result<Self, IndexError> {
        let mut multi = MultiLogStream::new(Arc::clone(&storage));
        // Only logs that actually joined the stream set take part in later
        // lifecycle operations such as `unlink`.
        let mut accepted = Vec::with_capacity(logs.len());
        for log in logs {
            match LogIndexStream::open(Arc::clone(&log), Arc::clone(&storage), options.reindex)
                .await
            {
                Ok(stream) => {
                    if let Err(e) = multi.add_stream(stream).await {
                        let _ = multi.destroy().await;
                        return Err(e);
                    }
                    accepted.push(log);
                }
                Err(IndexError::Log(reason)) => {
                    tracing::warn!(%reason, "log failed readiness; it will not produce entries");
                }
                Err(e) => {
                    let _ = multi.destroy().await;
                    return Err(e);
                }
            }
        }

        let (commands, commands_rx) = mpsc::channel(16);
        let (state_tx, state_rx) = watch::channel(IndexState {
            current: IndexStatus::Indexing,
            remaining: multi.remaining(),
            entries_per_second: 0.0,
        });
        let (events, _) = broadcast::channel(64);
        let metrics = Arc::new(Mutex::new(IndexerMetrics::default()));

        let engine = Engine {
            multi,
            handler,
            max_batch: options.max_batch.max(1),
            reindex: options.reindex,
            factory: Arc::clone(&storage),
            state_tx,
            events: events.clone(),
            metrics: Arc::clone(&metrics),
            current: IndexStatus::Indexing,
            rate: 0.0,
            has_rate: false,
            rate_start: Instant::now(),
        };
        let task = tokio::spawn(engine.run(commands_rx));

        Ok(Self {
            commands,
            state_rx,
            events,
            metrics,
            factory: storage,
            logs: Mutex::new(accepted),
            task: Mutex::new(Some(task)),
        })
    }

    /// Current state snapshot.
    pub fn state(&self) -> IndexState {
        self.state_rx.borrow().clone()
    }

    /// Watch every state change.
    pub fn watch_state(&self) -> watch::Receiver<IndexState> {
        self.state_rx.clone()
    }

    /// Subscribe to idle/indexing edge events.
    pub fn subscribe(&self) -> broadcast::Receiver<IndexEvent> {
        self.events.subscribe()
    }

    /// Lifetime counters.
    pub fn metrics(&self) -> IndexerMetrics {
        *self.metrics.lock().unwrap()
    }

    /// Start indexing one more log. Fails once the indexer is closing.
    pub async fn add_log(&self, log: Arc<dyn BlockLog>) -> Result<(), IndexError> {
        match self.state_rx.borrow().current {
            IndexStatus::Closing => return Err(IndexError::AlreadyClosing),
            IndexStatus::Closed => return Err(IndexError::Closed),
            IndexStatus::Idle | IndexStatus::Indexing => {}
        }
        let (ack, ack_rx) = oneshot::channel();
        self.commands
            .send(Command::AddLog {
                log: Arc::clone(&log),
                ack,
            })
            .await
            .map_err(|_| IndexError::Closed)?;
        let added = ack_rx.await.map_err(|_| IndexError::Closed)??;
        if added {
            self.logs.lock().unwrap().push(log);
        }
        Ok(())
    }

    /// Wait until the indexer has delivered and acknowledged everything it
    /// currently knows about. Resolves immediately when already idle, and
    /// on close. Any number of concurrent waiters resolve together.
    pub async fn idle(&self) -> Result<(), IndexError> {
        let mut rx = self.state_rx.clone();
        if rx.borrow().current == IndexStatus::Closed {
            return Err(IndexError::Closed);
        }
        loop {
            match rx.borrow_and_update().current {
                IndexStatus::Idle | IndexStatus::Closing | IndexStatus::Closed => return Ok(()),
                IndexStatus::Indexing => {}
            }
            if rx.changed().await.is_err() {
                return Ok(());
            }
        }
    }

    /// Shut down: destroy the streams, flush and release their storage, and
    /// resolve pending `idle` waiters. Fails if already closing or closed.
    pub async fn close(&self) -> Result<(), IndexError> {
        let current = self.state_rx.borrow().current;
        match current {
            IndexStatus::Closing => return Err(IndexError::AlreadyClosing),
            IndexStatus::Closed => {
                // A batch failure closes the engine on its own; the first
                // close() after that surfaces the pipeline error.
                self.join().await?;
                return Err(IndexError::Closed);
            }
            IndexStatus::Idle | IndexStatus::Indexing => {}
        }
        let (ack, ack_rx) = oneshot::channel();
        if self.commands.send(Command::Close { ack }).await.is_err() {
            // The engine died on its own (batch failure); surface its error.
            self.join().await?;
            return Err(IndexError::Closed);
        }
        match ack_rx.await {
            Ok(res) => {
                self.join().await?;
                res
            }
            Err(_) => self.join().await,
        }
    }

    /// Delete all persisted index state. Only valid on a closed indexer.
    /// Every log's storage is attempted; the first failure is reported
    /// after the rest have been unlinked.
    pub async fn unlink(&self) -> Result<(), IndexError> {
        if self.state_rx.borrow().current != IndexStatus::Closed {
            return Err(IndexError::NotClosed);
        }
        let logs: Vec<_> = self.logs.lock().unwrap().clone();
        let mut first_err = None;
        for log in &logs {
            if let Err(e) = LogIndexStream::unlink_storage(log, &self.factory).await {
                tracing::warn!(error = %e, "storage unlink failed");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Wait for the engine task and surface a pipeline error, if any.
    async fn join(&self) -> Result<(), IndexError> {
        let task = self.task.lock().unwrap().take();
        match task {
            Some(task) => task
                .await
                .map_err(|e| IndexError::Other(format!("engine task failed: {e}")))?,
            None => Ok(()),
        }
    }
}

// ─── Engine ───────────────────────────────────────────────────────────────────

struct Engine {
    multi: MultiLogStream,
    handler: Arc<dyn BatchHandler>,
    max_batch: usize,
    reindex: bool,
    factory: Arc<dyn StorageFactory>,
    state_tx: watch::Sender<IndexState>,
    events: broadcast::Sender<IndexEvent>,
    metrics: Arc<Mutex<IndexerMetrics>>,
    current: IndexStatus,
    rate: f64,
    has_rate: bool,
    rate_start: Instant,
}

impl Engine {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) -> Result<(), IndexError> {
        loop {
            // Commands are serviced between batches.
            loop {
                match commands.try_recv() {
                    Ok(cmd) => {
                        if self.handle_command(cmd).await {
                            return Ok(());
                        }
                    }
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        return self.shutdown().await;
                    }
                }
            }

            if self.multi.has_work() {
                self.enter_indexing();
                let entries = self.multi.read_batch(self.max_batch).await?;
                if !entries.is_empty() {
                    if let Err(e) = self.handle_entries(&entries).await {
                        tracing::error!(error = %e, "batch failed; closing pipeline");
                        let _ = self.shutdown().await;
                        return Err(e);
                    }
                }
                self.maybe_idle();
            } else {
                self.maybe_idle();
                let wake = self.multi.wake_signals();
                tokio::select! {
                    cmd = commands.recv() => match cmd {
                        Some(cmd) => {
                            if self.handle_command(cmd).await {
                                return Ok(());
                            }
                        }
                        None => return self.shutdown().await,
                    },
                    _ = wait_any(wake) => {}
                }
            }
        }
    }

    /// Returns `true` when the engine should stop.
    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::AddLog { log, ack } => {
                let _ = ack.send(self.add_log(log).await);
                false
            }
            Command::Close { ack } => {
                let _ = ack.send(self.shutdown().await);
                true
            }
        }
    }

    /// Returns `Ok(true)` iff the log joined the stream set.
    async fn add_log(&mut self, log: Arc<dyn BlockLog>) -> Result<bool, IndexError> {
        match LogIndexStream::open(log, Arc::clone(&self.factory), self.reindex).await {
            Ok(stream) => {
                self.multi.add_stream(stream).await?;
                self.publish();
                Ok(true)
            }
            Err(IndexError::Log(reason)) => {
                tracing::warn!(%reason, "log failed readiness; it will not produce entries");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn handle_entries(&mut self, entries: &[Entry]) -> Result<(), IndexError> {
        // The batch is counted in `remaining` (via in-flight) until the
        // acknowledgements below, so the handler observes itself.
        self.publish();
        self.handler
            .handle(entries)
            .await
            .map_err(|e| IndexError::Batch(e.to_string()))?;
        for entry in entries {
            self.multi.set_indexed(&entry.discovery_id, entry.index);
        }
        self.update_rate(entries.len());
        self.multi.flush().await?;
        {
            let mut m = self.metrics.lock().unwrap();
            m.batches += 1;
            m.entries += entries.len() as u64;
        }
        tracing::debug!(
            entries = entries.len(),
            bytes = entries.iter().map(|e| e.byte_len()).sum::<usize>(),
            remaining = self.multi.remaining(),
            "batch indexed"
        );
        self.publish();
        Ok(())
    }

    fn update_rate(&mut self, delivered: usize) {
        let elapsed = self.rate_start.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            let sample = delivered as f64 / elapsed;
            self.rate = if self.has_rate {
                sample + (self.rate - sample) / 5.0
            } else {
                sample
            };
            self.has_rate = true;
        }
        self.rate_start = Instant::now();
    }

    fn enter_indexing(&mut self) {
        if self.current == IndexStatus::Idle {
            self.current = IndexStatus::Indexing;
            let _ = self.events.send(IndexEvent::Indexing);
        }
        self.publish();
    }

    fn maybe_idle(&mut self) {
        if self.current == IndexStatus::Indexing
            && self.multi.drained()
            && self.multi.remaining() == 0
        {
            self.current = IndexStatus::Idle;
            let _ = self.events.send(IndexEvent::Idle);
        }
        self.publish();
    }

    async fn shutdown(&mut self) -> Result<(), IndexError> {
        self.current = IndexStatus::Closing;
        self.publish();
        let res = self.multi.destroy().await;
        self.current = IndexStatus::Closed;
        self.publish();
        tracing::info!("indexer closed");
        res
    }

    fn publish(&self) {
        let state = IndexState {
            current: self.current,
            remaining: self.multi.remaining(),
            entries_per_second: self.rate,
        };
        self.state_tx.send_if_modified(|s| {
            if *s != state {
                *s = state;
                true
            } else {
                false
            }
        });
    }
}

/// Resolves when any of `signals` is raised; pends forever when empty.
async fn wait_any(signals: Vec<Arc<Signal>>) {
    if signals.is_empty() {
        return futures::future::pending().await;
    }
    let waits = signals
        .into_iter()
        .map(|sig| Box::pin(async move { sig.wait().await }))
        .collect::<Vec<_>>();
    futures::future::select_all(waits).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::MemoryLog;
    use crate::storage::RamStorageFactory;
    use crate::types::Block;
    use std::time::Duration;

    struct Sink;

    #[async_trait]
    impl BatchHandler for Sink {
        async fn handle(&self, _entries: &[Entry]) -> Result<(), IndexError> {
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl BatchHandler for Failing {
        async fn handle(&self, _entries: &[Entry]) -> Result<(), IndexError> {
            Err(IndexError::Other("boom".into()))
        }
    }

    fn ram() -> Arc<dyn StorageFactory> {
        Arc::new(RamStorageFactory::new())
    }

    async fn wait_idle(indexer: &Indexer) {
        tokio::time::timeout(Duration::from_secs(5), indexer.idle())
            .await
            .expect("should reach idle")
            .unwrap();
    }

    #[tokio::test]
    async fn empty_indexer_goes_idle() {
        let indexer = Indexer::open(vec![], ram(), Arc::new(Sink), IndexerOptions::default())
            .await
            .unwrap();
        wait_idle(&indexer).await;
        let state = indexer.state();
        assert_eq!(state.current, IndexStatus::Idle);
        assert_eq!(state.remaining, 0);
        indexer.close().await.unwrap();
        assert_eq!(indexer.state().current, IndexStatus::Closed);
    }

    #[tokio::test]
    async fn close_twice_is_an_error() {
        let indexer = Indexer::open(vec![], ram(), Arc::new(Sink), IndexerOptions::default())
            .await
            .unwrap();
        indexer.close().await.unwrap();
        assert!(matches!(
            indexer.close().await,
            Err(IndexError::Closed | IndexError::AlreadyClosing)
        ));
    }

    #[tokio::test]
    async fn add_log_after_close_is_an_error() {
        let indexer = Indexer::open(vec![], ram(), Arc::new(Sink), IndexerOptions::default())
            .await
            .unwrap();
        indexer.close().await.unwrap();
        let log: Arc<dyn BlockLog> = Arc::new(MemoryLog::from_seed(1));
        assert!(matches!(
            indexer.add_log(log).await,
            Err(IndexError::Closed)
        ));
    }

    #[tokio::test]
    async fn unlink_requires_closed() {
        let indexer = Indexer::open(vec![], ram(), Arc::new(Sink), IndexerOptions::default())
            .await
            .unwrap();
        assert!(matches!(indexer.unlink().await, Err(IndexError::NotClosed)));
        indexer.close().await.unwrap();
        indexer.unlink().await.unwrap();
    }

    #[tokio::test]
    async fn unready_log_is_skipped_and_not_tracked() {
        let factory = ram();
        let good = Arc::new(MemoryLog::from_seed(4));
        good.append(Block::Utf8("a".into()));
        let bad = Arc::new(MemoryLog::from_seed(5));
        bad.append(Block::Utf8("never delivered".into()));
        bad.fail_ready("no identity");

        let logs: Vec<Arc<dyn BlockLog>> = vec![Arc::clone(&good) as _, Arc::clone(&bad) as _];
        let indexer = Indexer::open(
            logs,
            Arc::clone(&factory),
            Arc::new(Sink),
            IndexerOptions::default(),
        )
        .await
        .unwrap();
        wait_idle(&indexer).await;
        assert_eq!(indexer.metrics().entries, 1);

        // Adding another unready log succeeds but stays inert.
        let late = Arc::new(MemoryLog::from_seed(6));
        late.fail_ready("still no identity");
        indexer
            .add_log(Arc::clone(&late) as Arc<dyn BlockLog>)
            .await
            .unwrap();
        wait_idle(&indexer).await;
        assert_eq!(indexer.metrics().entries, 1);

        // Unlink must not stumble over logs that never joined.
        indexer.close().await.unwrap();
        indexer.unlink().await.unwrap();
    }

    #[tokio::test]
    async fn batch_failure_closes_the_pipeline() {
        let log = Arc::new(MemoryLog::from_seed(2));
        log.append(Block::Utf8("a".into()));
        let logs: Vec<Arc<dyn BlockLog>> = vec![log];
        let indexer = Indexer::open(logs, ram(), Arc::new(Failing), IndexerOptions::default())
            .await
            .unwrap();

        let mut rx = indexer.watch_state();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if rx.borrow_and_update().current == IndexStatus::Closed {
                    break;
                }
                if rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .expect("pipeline should close itself");

        // close() after the self-close surfaces the batch error.
        let err = indexer.close().await.unwrap_err();
        assert!(matches!(err, IndexError::Batch(_)));
    }

    #[tokio::test]
    async fn failed_batches_are_not_acknowledged() {
        let factory = ram();
        let log = Arc::new(MemoryLog::from_seed(3));
        log.append(Block::Utf8("a".into()));

        let logs: Vec<Arc<dyn BlockLog>> = vec![Arc::clone(&log) as _];
        let indexer = Indexer::open(
            logs,
            Arc::clone(&factory),
            Arc::new(Failing),
            IndexerOptions::default(),
        )
        .await
        .unwrap();
        let _ = indexer.close().await; // surfaces the batch error

        // A fresh run over the same storage re-delivers the block.
        let logs: Vec<Arc<dyn BlockLog>> = vec![log];
        let indexer = Indexer::open(logs, factory, Arc::new(Sink), IndexerOptions::default())
            .await
            .unwrap();
        wait_idle(&indexer).await;
        assert_eq!(indexer.metrics().entries, 1);
        indexer.close().await.unwrap();
    }
}
