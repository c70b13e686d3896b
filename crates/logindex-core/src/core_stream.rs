//! Per-log index stream: the pull source that drains a single log.
//!
//! The stream walks the log linearly, skipping positions that are already
//! indexed, already in flight, or not locally present. Positions that become
//! present behind the linear frontier are queued by the download pump and
//! revisited. Indexed positions are persisted as a sparse bitfield; in-flight
//! positions live in a second, purely in-memory bitfield so a block is never
//! emitted twice between its push and the driver's acknowledgement.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::bitfield::Bitfield;
use crate::error::IndexError;
use crate::log::{BlockLog, LogEvent};
use crate::signal::Signal;
use crate::storage::StorageFactory;
use crate::types::{discovery_id, Entry};

/// Relative storage name for a log, derived from its discovery key:
/// two levels of hex fan-out, then the full hex key.
///
/// This layout is a compatibility contract; the same key must map to the
/// same name across versions.
pub fn storage_name(discovery_key: &[u8; 32]) -> String {
    let hex = discovery_id(discovery_key);
    format!("{}/{}/{}", &hex[0..2], &hex[2..4], hex)
}

/// State the event pump shares with the stream.
struct PumpShared {
    /// Positions announced as downloaded, pending a revisit.
    downloaded: Mutex<BTreeSet<u64>>,
    /// Raised on every append/download so a sleeping reader re-checks.
    wake: Arc<Signal>,
}

/// A pull source over one log.
pub struct LogIndexStream {
    log: Arc<dyn BlockLog>,
    discovery_id: String,
    storage_name: String,
    indexed: Bitfield,
    in_progress: Bitfield,
    next_scan: u64,
    in_flight: u64,
    shared: Arc<PumpShared>,
    pump: Option<JoinHandle<()>>,
    destroying: bool,
}

impl LogIndexStream {
    /// Open a stream over `log`, restoring the persisted indexed set.
    ///
    /// With `reindex`, any persisted state for this log is unlinked first,
    /// so every locally present block is emitted again.
    pub async fn open(
        log: Arc<dyn BlockLog>,
        factory: Arc<dyn StorageFactory>,
        reindex: bool,
    ) -> Result<Self, IndexError> {
        log.ready().await?;
        // Subscribe before the update so nothing announced in between is lost.
        let events = log.subscribe();
        log.update(true).await?;

        let dk = log.discovery_key();
        let name = storage_name(&dk);
        if reindex {
            let mut storage = factory.create(&name).await?;
            storage.unlink().await?;
            storage.close().await?;
        }
        let indexed = Bitfield::open(factory.create(&name).await?).await?;

        let shared = Arc::new(PumpShared {
            downloaded: Mutex::new(BTreeSet::new()),
            wake: Arc::new(Signal::new()),
        });
        let pump = tokio::spawn(pump_events(events, Arc::clone(&shared)));

        tracing::debug!(log = %discovery_id(&dk), length = log.length(), reindex, "index stream open");

        Ok(Self {
            discovery_id: discovery_id(&dk),
            storage_name: name,
            log,
            indexed,
            in_progress: Bitfield::ephemeral(),
            next_scan: 0,
            in_flight: 0,
            shared,
            pump: Some(pump),
            destroying: false,
        })
    }

    /// Hex discovery id of the underlying log.
    pub fn discovery_id(&self) -> &str {
        &self.discovery_id
    }

    /// Relative storage name holding this stream's persisted state.
    pub fn storage_name(&self) -> &str {
        &self.storage_name
    }

    /// Signal raised whenever the log announces an append or download.
    pub fn wake_signal(&self) -> Arc<Signal> {
        Arc::clone(&self.shared.wake)
    }

    /// Blocks known but not yet acknowledged: unscanned positions, queued
    /// downloads, and in-flight entries.
    pub fn remaining(&self) -> u64 {
        self.log.length().saturating_sub(self.next_scan)
            + self.shared.downloaded.lock().unwrap().len() as u64
            + self.in_flight
    }

    /// Returns `true` if a read pass could deliver something right now.
    pub fn has_work(&self) -> bool {
        self.next_scan < self.log.length()
            || !self.shared.downloaded.lock().unwrap().is_empty()
    }

    /// Returns `true` while the stream is out of deliverable work and
    /// waiting for the next append or download.
    pub fn drained(&self) -> bool {
        !self.has_work()
    }

    /// Run one read pass, pushing at most `max - out.len()` entries into
    /// `out`. Returns how many entries this pass pushed.
    ///
    /// A pass that pushes nothing but still has work (positions turned out
    /// to be absent or already indexed) re-evaluates against the latest
    /// length before giving up. The indexed bitfield is flushed on the way
    /// out of every pass.
    pub async fn fill(&mut self, out: &mut Vec<Entry>, max: usize) -> Result<usize, IndexError> {
        let mut pushed = 0usize;
        loop {
            if self.destroying || out.len() >= max {
                break;
            }
            // Linear pass over the unscanned suffix.
            let length = self.log.length();
            while out.len() < max && self.next_scan < length {
                let index = self.next_scan;
                if self.push_entry(index, out).await? {
                    pushed += 1;
                }
                // Advanced only after the awaited push returns, so a
                // cancelled pass never skips a position.
                self.next_scan = index + 1;
            }
            // Positions downloaded behind the frontier.
            while out.len() < max {
                let next = self.shared.downloaded.lock().unwrap().pop_first();
                let Some(index) = next else { break };
                if self.push_entry(index, out).await? {
                    pushed += 1;
                }
            }
            if pushed > 0 || !self.has_work() {
                break;
            }
        }
        self.indexed.flush().await?;
        Ok(pushed)
    }

    async fn push_entry(&mut self, index: u64, out: &mut Vec<Entry>) -> Result<bool, IndexError> {
        if self.indexed.get(index) || self.in_progress.get(index) {
            return Ok(false);
        }
        let Some(block) = self.log.get(index).await? else {
            return Ok(false);
        };
        self.in_progress.set(index, true);
        self.in_flight += 1;
        out.push(Entry {
            index,
            discovery_id: self.discovery_id.clone(),
            block,
        });
        Ok(true)
    }

    /// Mark `index` permanently indexed. Persists on the next flush.
    pub fn set_indexed(&mut self, index: u64) {
        self.in_flight = self.in_flight.saturating_sub(1);
        self.indexed.set(index, true);
        self.in_progress.set(index, false);
    }

    /// Flush the persisted indexed set.
    pub async fn flush(&mut self) -> Result<(), IndexError> {
        self.indexed.flush().await
    }

    /// Detach from the log, flush, and release storage.
    pub async fn destroy(&mut self) -> Result<(), IndexError> {
        self.destroying = true;
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        self.shared.wake.raise();
        self.indexed.flush().await?;
        self.indexed.close().await?;
        tracing::debug!(log = %self.discovery_id, "index stream destroyed");
        Ok(())
    }

    /// Delete the persisted state for `log` without opening a stream.
    pub async fn unlink_storage(
        log: &Arc<dyn BlockLog>,
        factory: &Arc<dyn StorageFactory>,
    ) -> Result<(), IndexError> {
        log.ready().await?;
        let name = storage_name(&log.discovery_key());
        let mut storage = factory.create(&name).await?;
        storage.unlink().await?;
        storage.close().await
    }
}

/// Applies a log's notifications to the shared scan state.
async fn pump_events(mut events: broadcast::Receiver<LogEvent>, shared: Arc<PumpShared>) {
    loop {
        match events.recv().await {
            Ok(LogEvent::Append) => shared.wake.raise(),
            Ok(LogEvent::Download { index }) => {
                shared.downloaded.lock().unwrap().insert(index);
                shared.wake.raise();
            }
            Ok(LogEvent::Close) | Err(broadcast::error::RecvError::Closed) => break,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!(missed = n, "log event subscriber lagged");
                shared.wake.raise();
            }
        }
    }
}
