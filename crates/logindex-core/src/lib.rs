//! logindex-core — live multi-log indexing engine.
//!
//! Consumes blocks from one or more append-only, partially-downloadable
//! logs, delivers each block exactly once per run to a batch handler, and
//! persists which blocks have been indexed so work resumes across restarts.
//!
//! # Architecture
//!
//! ```text
//! Indexer (driver task)
//!     └── MultiLogStream            (fan-in, set_indexed routing)
//!             └── LogIndexStream    (per-log scan + download revisits)
//!                     └── Bitfield  (persisted indexed set)
//!                             └── RandomAccess storage
//! ```
//!
//! Progress persists only after a batch succeeds, so a crash mid-batch
//! re-delivers that batch on the next run.

pub mod bitfield;
pub mod builder;
pub mod core_stream;
pub mod error;
pub mod indexer;
pub mod log;
pub mod multi_stream;
pub mod signal;
pub mod storage;
pub mod types;

pub use bitfield::Bitfield;
pub use builder::IndexerBuilder;
pub use core_stream::{storage_name, LogIndexStream};
pub use error::IndexError;
pub use indexer::{
    BatchHandler, IndexEvent, IndexState, IndexStatus, Indexer, IndexerMetrics, IndexerOptions,
};
pub use log::{BlockLog, LogEvent, MemoryLog};
pub use multi_stream::MultiLogStream;
pub use signal::Signal;
pub use storage::{RamStorage, RamStorageFactory, RandomAccess, StorageFactory};
pub use types::{discovery_id, Block, BlockEncoding, Entry};
