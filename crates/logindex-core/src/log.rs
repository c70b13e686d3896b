//! The append-only log interface consumed by the engine.
//!
//! A log is an append-only sequence of blocks with a stable public key.
//! Blocks may be only partially present locally: `get` returns `None` for a
//! position that is known but not yet downloaded, and the log announces
//! later arrivals through `LogEvent::Download`. The engine never writes to
//! or closes a log; it only reads and subscribes.

use async_trait::async_trait;
use std::sync::Mutex;
use tokio::sync::broadcast;

use crate::error::IndexError;
use crate::types::Block;

/// Event capacity per subscriber. Sized so a burst of appends or downloads
/// does not lag a subscriber that drains promptly.
const EVENT_CAPACITY: usize = 4096;

/// Notifications emitted by a log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogEvent {
    /// The log's length grew.
    Append,
    /// The block at `index` became locally present.
    Download { index: u64 },
    /// The log is shutting down.
    Close,
}

/// An append-only, partially-downloadable block log.
#[async_trait]
pub trait BlockLog: Send + Sync {
    /// Wait until the log's identity (key, discovery key) is known.
    async fn ready(&self) -> Result<(), IndexError>;

    /// Ask the log to refresh its view of the latest length.
    async fn update(&self, wait: bool) -> Result<(), IndexError>;

    /// One past the highest known block position.
    fn length(&self) -> u64;

    /// The log's public key.
    fn key(&self) -> [u8; 32];

    /// The derived discovery key. Valid after `ready`.
    fn discovery_key(&self) -> [u8; 32];

    /// The block at `index` iff it is locally present.
    async fn get(&self, index: u64) -> Result<Option<Block>, IndexError>;

    /// Subscribe to append/download notifications.
    fn subscribe(&self) -> broadcast::Receiver<LogEvent>;
}

// ─── In-memory log ────────────────────────────────────────────────────────────

/// A fully in-memory `BlockLog` for tests and ephemeral pipelines.
///
/// Local appends, remote (absent) length growth, and later downloads are all
/// driven explicitly, which makes sparse-presence scenarios easy to script.
pub struct MemoryLog {
    key: [u8; 32],
    discovery_key: [u8; 32],
    blocks: Mutex<Vec<Option<Block>>>,
    ready_error: Mutex<Option<String>>,
    events: broadcast::Sender<LogEvent>,
}

impl MemoryLog {
    pub fn new(key: [u8; 32], discovery_key: [u8; 32]) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            key,
            discovery_key,
            blocks: Mutex::new(Vec::new()),
            ready_error: Mutex::new(None),
            events,
        }
    }

    /// A log whose key and discovery key are both filled with `seed`.
    pub fn from_seed(seed: u8) -> Self {
        Self::new([seed; 32], [seed; 32])
    }

    /// Append a locally-present block.
    pub fn append(&self, block: Block) {
        self.blocks.lock().unwrap().push(Some(block));
        let _ = self.events.send(LogEvent::Append);
    }

    /// Grow the length by `n` positions whose blocks are not locally
    /// present, as when a peer appends faster than we download.
    pub fn extend_remote(&self, n: u64) {
        let mut blocks = self.blocks.lock().unwrap();
        for _ in 0..n {
            blocks.push(None);
        }
        drop(blocks);
        let _ = self.events.send(LogEvent::Append);
    }

    /// Make the block at `index` locally present.
    pub fn download(&self, index: u64, block: Block) {
        let mut blocks = self.blocks.lock().unwrap();
        if blocks.len() <= index as usize {
            blocks.resize(index as usize + 1, None);
        }
        blocks[index as usize] = Some(block);
        drop(blocks);
        let _ = self.events.send(LogEvent::Download { index });
    }

    /// Make every subsequent `ready` call fail, for exercising logs that
    /// never become usable.
    pub fn fail_ready(&self, reason: impl Into<String>) {
        *self.ready_error.lock().unwrap() = Some(reason.into());
    }

    /// Announce shutdown to subscribers.
    pub fn close(&self) {
        let _ = self.events.send(LogEvent::Close);
    }
}

#[async_trait]
impl BlockLog for MemoryLog {
    async fn ready(&self) -> Result<(), IndexError> {
        match self.ready_error.lock().unwrap().clone() {
            Some(reason) => Err(IndexError::Log(reason)),
            None => Ok(()),
        }
    }

    async fn update(&self, _wait: bool) -> Result<(), IndexError> {
        Ok(())
    }

    fn length(&self) -> u64 {
        self.blocks.lock().unwrap().len() as u64
    }

    fn key(&self) -> [u8; 32] {
        self.key
    }

    fn discovery_key(&self) -> [u8; 32] {
        self.discovery_key
    }

    async fn get(&self, index: u64) -> Result<Option<Block>, IndexError> {
        Ok(self
            .blocks
            .lock()
            .unwrap()
            .get(index as usize)
            .cloned()
            .flatten())
    }

    fn subscribe(&self) -> broadcast::Receiver<LogEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_grows_length_and_notifies() {
        let log = MemoryLog::from_seed(1);
        let mut rx = log.subscribe();
        log.append(Block::Utf8("a".into()));

        assert_eq!(log.length(), 1);
        assert_eq!(rx.recv().await.unwrap(), LogEvent::Append);
        assert_eq!(
            log.get(0).await.unwrap(),
            Some(Block::Utf8("a".into()))
        );
    }

    #[tokio::test]
    async fn remote_blocks_are_absent_until_downloaded() {
        let log = MemoryLog::from_seed(2);
        log.extend_remote(3);
        assert_eq!(log.length(), 3);
        assert_eq!(log.get(1).await.unwrap(), None);

        let mut rx = log.subscribe();
        log.download(1, Block::Binary(vec![9]));
        assert_eq!(rx.recv().await.unwrap(), LogEvent::Download { index: 1 });
        assert_eq!(log.get(1).await.unwrap(), Some(Block::Binary(vec![9])));
    }

    #[tokio::test]
    async fn get_out_of_range_is_absent() {
        let log = MemoryLog::from_seed(3);
        assert_eq!(log.get(10).await.unwrap(), None);
    }

    #[tokio::test]
    async fn fail_ready_surfaces_a_log_error() {
        let log = MemoryLog::from_seed(4);
        log.ready().await.unwrap();
        log.fail_ready("no identity");
        assert!(matches!(log.ready().await, Err(IndexError::Log(_))));
    }
}
