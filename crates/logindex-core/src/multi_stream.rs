//! Fan-in over a dynamic set of per-log index streams.
//!
//! Merges many `LogIndexStream`s into one entry source. Aggregate progress
//! is the sum of the inner streams' progress, and the fan-in is drained only
//! while every inner stream is. Entries from different logs are not ordered
//! relative to each other.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::core_stream::LogIndexStream;
use crate::error::IndexError;
use crate::signal::Signal;
use crate::storage::StorageFactory;
use crate::types::Entry;

pub struct MultiLogStream {
    /// Inner streams keyed by discovery id, which also routes `set_indexed`.
    streams: BTreeMap<String, LogIndexStream>,
    factory: Arc<dyn StorageFactory>,
    destroying: bool,
}

impl MultiLogStream {
    pub fn new(factory: Arc<dyn StorageFactory>) -> Self {
        Self {
            streams: BTreeMap::new(),
            factory,
            destroying: false,
        }
    }

    /// Add a stream. Re-adding a discovery id that is already present keeps
    /// the existing stream and tears down the duplicate.
    pub async fn add_stream(&mut self, mut stream: LogIndexStream) -> Result<bool, IndexError> {
        let id = stream.discovery_id().to_string();
        if self.streams.contains_key(&id) {
            stream.destroy().await?;
            return Ok(false);
        }
        self.streams.insert(id, stream);
        Ok(true)
    }

    /// Detach and destroy the stream for `discovery_id`, then unlink its
    /// backing storage. Returns `false` for an unknown id.
    pub async fn remove_stream_and_unlink(
        &mut self,
        discovery_id: &str,
    ) -> Result<bool, IndexError> {
        let Some(mut stream) = self.streams.remove(discovery_id) else {
            return Ok(false);
        };
        let name = stream.storage_name().to_string();
        stream.destroy().await?;
        let mut storage = self.factory.create(&name).await?;
        storage.unlink().await?;
        storage.close().await?;
        Ok(true)
    }

    /// Total blocks known but not yet acknowledged, across all streams.
    pub fn remaining(&self) -> u64 {
        self.streams.values().map(|s| s.remaining()).sum()
    }

    /// Returns `true` while every inner stream is drained.
    pub fn drained(&self) -> bool {
        self.streams.values().all(|s| s.drained())
    }

    /// Returns `true` if any inner stream could deliver entries right now.
    pub fn has_work(&self) -> bool {
        self.streams.values().any(|s| s.has_work())
    }

    /// Wake signals of every inner stream; any of them firing means a read
    /// pass may make progress.
    pub fn wake_signals(&self) -> Vec<Arc<Signal>> {
        self.streams.values().map(|s| s.wake_signal()).collect()
    }

    /// Route an acknowledgement to the right stream. Unknown ids are a
    /// benign race with stream removal and are ignored.
    pub fn set_indexed(&mut self, discovery_id: &str, index: u64) {
        if let Some(stream) = self.streams.get_mut(discovery_id) {
            stream.set_indexed(index);
        }
    }

    /// Pull up to `max` entries from the streams that currently have work.
    pub async fn read_batch(&mut self, max: usize) -> Result<Vec<Entry>, IndexError> {
        let mut out = Vec::new();
        if self.destroying {
            return Ok(out);
        }
        for stream in self.streams.values_mut() {
            if out.len() >= max {
                break;
            }
            if stream.has_work() {
                stream.fill(&mut out, max).await?;
            }
        }
        Ok(out)
    }

    /// Flush every inner stream's persisted state.
    pub async fn flush(&mut self) -> Result<(), IndexError> {
        for stream in self.streams.values_mut() {
            stream.flush().await?;
        }
        Ok(())
    }

    /// Destroy every inner stream. The first error is reported after all
    /// streams have been torn down.
    pub async fn destroy(&mut self) -> Result<(), IndexError> {
        self.destroying = true;
        let mut first_err = None;
        for stream in self.streams.values_mut() {
            if let Err(e) = stream.destroy().await {
                tracing::warn!(log = %stream.discovery_id(), error = %e, "stream destroy failed");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Unlink every stream's backing storage. Only valid once destroyed.
    pub async fn unlink(&mut self) -> Result<(), IndexError> {
        if !self.destroying {
            return Err(IndexError::NotClosed);
        }
        for stream in self.streams.values() {
            let mut storage = self.factory.create(stream.storage_name()).await?;
            storage.unlink().await?;
            storage.close().await?;
        }
        Ok(())
    }
}
