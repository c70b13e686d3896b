//! File-backed random-access storage.
//!
//! One store maps to one file. Parent directories are created on first
//! write, so the hex fan-out names produced by the engine materialise as a
//! shallow directory tree under the factory's root.

use async_trait::async_trait;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use logindex_core::{IndexError, RandomAccess, StorageFactory};
use tracing::debug;

/// Creates `FileStorage` stores under a root directory.
pub struct DirStorageFactory {
    root: PathBuf,
}

impl DirStorageFactory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Convenience wrapper producing the trait object the engine consumes.
    pub fn shared(root: impl Into<PathBuf>) -> Arc<dyn StorageFactory> {
        Arc::new(Self::new(root))
    }
}

#[async_trait]
impl StorageFactory for DirStorageFactory {
    async fn create(&self, name: &str) -> Result<Box<dyn RandomAccess>, IndexError> {
        Ok(Box::new(FileStorage::new(self.root.join(name))))
    }
}

/// A single file exposed as a random-access store.
///
/// The file is opened lazily: `stat` on a path that does not exist reports
/// absence rather than creating anything.
pub struct FileStorage {
    path: PathBuf,
    file: Option<File>,
    closed: bool,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
            closed: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_open(&self) -> Result<(), IndexError> {
        if self.closed {
            return Err(IndexError::Storage(format!(
                "{}: storage is closed",
                self.path.display()
            )));
        }
        Ok(())
    }

    /// Open (and create) the backing file, making parent directories.
    async fn writable(&mut self) -> Result<&mut File, IndexError> {
        if self.file.is_none() {
            if let Some(parent) = self.path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&self.path)
                .await?;
            debug!(path = %self.path.display(), "opened state file");
            self.file = Some(file);
        }
        Ok(self.file.as_mut().unwrap())
    }

    /// Open the backing file read-write without creating it.
    async fn existing(&mut self) -> Result<&mut File, IndexError> {
        if self.file.is_none() {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&self.path)
                .await
                .map_err(|e| {
                    IndexError::Storage(format!("{}: {e}", self.path.display()))
                })?;
            self.file = Some(file);
        }
        Ok(self.file.as_mut().unwrap())
    }
}

#[async_trait]
impl RandomAccess for FileStorage {
    async fn stat(&mut self) -> Result<Option<u64>, IndexError> {
        self.ensure_open()?;
        match tokio::fs::metadata(&self.path).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn read(&mut self, offset: u64, len: u64) -> Result<Vec<u8>, IndexError> {
        self.ensure_open()?;
        let path = self.path.clone();
        let file = self.existing().await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; len as usize];
        file.read_exact(&mut buf).await.map_err(|e| {
            IndexError::Storage(format!("{}: read {len}@{offset}: {e}", path.display()))
        })?;
        Ok(buf)
    }

    async fn write(&mut self, offset: u64, data: &[u8]) -> Result<(), IndexError> {
        self.ensure_open()?;
        let file = self.writable().await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(())
    }

    async fn del(&mut self, offset: u64, len: u64) -> Result<(), IndexError> {
        self.ensure_open()?;
        let size = match self.stat().await? {
            Some(size) => size,
            None => return Ok(()),
        };
        if offset.saturating_add(len) >= size {
            let file = self.writable().await?;
            file.set_len(offset.min(size)).await?;
        } else {
            let zeros = vec![0u8; len as usize];
            self.write(offset, &zeros).await?;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), IndexError> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
        }
        self.closed = true;
        Ok(())
    }

    async fn unlink(&mut self) -> Result<(), IndexError> {
        self.ensure_open()?;
        self.file = None;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                debug!(path = %self.path.display(), "unlinked state file");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
