//! Random-access storage abstraction backing persisted index state.
//!
//! The engine only needs a tiny slice of a filesystem: positioned reads and
//! writes, a size probe, and deletion. Durable backends live in
//! `logindex-storage`; the in-memory backend below covers tests and
//! ephemeral pipelines.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::IndexError;

/// An asynchronous random-access byte store.
#[async_trait]
pub trait RandomAccess: Send {
    /// Size of the backing store in bytes, or `None` if it does not exist.
    async fn stat(&mut self) -> Result<Option<u64>, IndexError>;

    /// Read exactly `len` bytes starting at `offset`.
    /// Reading past the end of the store is an error.
    async fn read(&mut self, offset: u64, len: u64) -> Result<Vec<u8>, IndexError>;

    /// Write `data` at `offset`, growing the store if needed.
    async fn write(&mut self, offset: u64, data: &[u8]) -> Result<(), IndexError>;

    /// Delete `len` bytes at `offset`. A deletion reaching the current end
    /// truncates; an interior deletion zeroes the range.
    async fn del(&mut self, offset: u64, len: u64) -> Result<(), IndexError>;

    /// Release the handle. Further operations fail.
    async fn close(&mut self) -> Result<(), IndexError>;

    /// Remove the backing state entirely. Succeeds if it never existed.
    async fn unlink(&mut self) -> Result<(), IndexError>;
}

/// Creates stores for relative names, e.g. one per indexed log.
#[async_trait]
pub trait StorageFactory: Send + Sync {
    async fn create(&self, name: &str) -> Result<Box<dyn RandomAccess>, IndexError>;
}

// ─── In-memory backend ────────────────────────────────────────────────────────

type RamMap = Arc<Mutex<HashMap<String, Vec<u8>>>>;

/// In-memory storage factory. Stores created for the same name share one
/// buffer, so closing and re-creating a name sees the prior contents — the
/// same observable behavior as reopening a file.
#[derive(Default, Clone)]
pub struct RamStorageFactory {
    data: RamMap,
}

impl RamStorageFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names that currently exist in the factory.
    pub fn names(&self) -> Vec<String> {
        self.data.lock().unwrap().keys().cloned().collect()
    }
}

#[async_trait]
impl StorageFactory for RamStorageFactory {
    async fn create(&self, name: &str) -> Result<Box<dyn RandomAccess>, IndexError> {
        Ok(Box::new(RamStorage {
            name: name.to_string(),
            data: Arc::clone(&self.data),
            closed: false,
        }))
    }
}

/// One named in-memory store.
pub struct RamStorage {
    name: String,
    data: RamMap,
    closed: bool,
}

impl RamStorage {
    /// A standalone store not shared with any factory.
    pub fn new() -> Self {
        Self {
            name: "ram".to_string(),
            data: Arc::default(),
            closed: false,
        }
    }

    fn ensure_open(&self) -> Result<(), IndexError> {
        if self.closed {
            return Err(IndexError::Storage("storage is closed".into()));
        }
        Ok(())
    }
}

impl Default for RamStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RandomAccess for RamStorage {
    async fn stat(&mut self) -> Result<Option<u64>, IndexError> {
        self.ensure_open()?;
        Ok(self
            .data
            .lock()
            .unwrap()
            .get(&self.name)
            .map(|b| b.len() as u64))
    }

    async fn read(&mut self, offset: u64, len: u64) -> Result<Vec<u8>, IndexError> {
        self.ensure_open()?;
        let map = self.data.lock().unwrap();
        let buf = map
            .get(&self.name)
            .ok_or_else(|| IndexError::Storage(format!("{}: does not exist", self.name)))?;
        let start = offset as usize;
        let end = start + len as usize;
        if end > buf.len() {
            return Err(IndexError::Storage(format!(
                "{}: read past end ({} > {})",
                self.name,
                end,
                buf.len()
            )));
        }
        Ok(buf[start..end].to_vec())
    }

    async fn write(&mut self, offset: u64, data: &[u8]) -> Result<(), IndexError> {
        self.ensure_open()?;
        let mut map = self.data.lock().unwrap();
        let buf = map.entry(self.name.clone()).or_default();
        let end = offset as usize + data.len();
        if buf.len() < end {
            buf.resize(end, 0);
        }
        buf[offset as usize..end].copy_from_slice(data);
        Ok(())
    }

    async fn del(&mut self, offset: u64, len: u64) -> Result<(), IndexError> {
        self.ensure_open()?;
        let mut map = self.data.lock().unwrap();
        let Some(buf) = map.get_mut(&self.name) else {
            return Ok(());
        };
        let start = (offset as usize).min(buf.len());
        let end = (offset as usize).saturating_add(len as usize);
        if end >= buf.len() {
            buf.truncate(start);
        } else {
            buf[start..end].fill(0);
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), IndexError> {
        self.closed = true;
        Ok(())
    }

    async fn unlink(&mut self) -> Result<(), IndexError> {
        self.ensure_open()?;
        self.data.lock().unwrap().remove(&self.name);
        Ok(())
    }
}
