//! Fluent builder API for opening indexers.
//!
//! Storage is any `StorageFactory`; for state rooted at a directory path,
//! pass the companion storage crate's `DirStorageFactory::shared(dir)`.
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example(
//! #     logs: Vec<std::sync::Arc<dyn logindex_core::BlockLog>>,
//! #     storage: std::sync::Arc<dyn logindex_core::StorageFactory>,
//! #     handler: std::sync::Arc<dyn logindex_core::BatchHandler>,
//! # ) -> Result<(), logindex_core::IndexError> {
//! use logindex_core::IndexerBuilder;
//!
//! let indexer = IndexerBuilder::new()
//!     .max_batch(50)
//!     .reindex(true)
//!     .open(logs, storage, handler)
//!     .await?;
//! # let _ = indexer;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use crate::error::IndexError;
use crate::indexer::{BatchHandler, Indexer, IndexerOptions};
use crate::log::BlockLog;
use crate::storage::StorageFactory;

/// Fluent builder for `IndexerOptions` + `Indexer::open`.
#[derive(Default)]
pub struct IndexerBuilder {
    options: IndexerOptions,
}

impl IndexerBuilder {
    pub fn new() -> Self {
        Self {
            options: IndexerOptions::default(),
        }
    }

    /// Most entries handed to the batch handler per call.
    pub fn max_batch(mut self, max: usize) -> Self {
        self.options.max_batch = max;
        self
    }

    /// Discard persisted index state and re-deliver everything present.
    pub fn reindex(mut self, reindex: bool) -> Self {
        self.options.reindex = reindex;
        self
    }

    /// Build the `IndexerOptions` without opening anything.
    pub fn build_options(self) -> IndexerOptions {
        self.options
    }

    /// Open the indexer.
    pub async fn open(
        self,
        logs: Vec<Arc<dyn BlockLog>>,
        storage: Arc<dyn StorageFactory>,
        handler: Arc<dyn BatchHandler>,
    ) -> Result<Indexer, IndexError> {
        Indexer::open(logs, storage, handler, self.options).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults() {
        let opts = IndexerBuilder::new().build_options();
        assert_eq!(opts.max_batch, 100);
        assert!(!opts.reindex);
    }

    #[test]
    fn builder_custom() {
        let opts = IndexerBuilder::new()
            .max_batch(500)
            .reindex(true)
            .build_options();
        assert_eq!(opts.max_batch, 500);
        assert!(opts.reindex);
    }
}
