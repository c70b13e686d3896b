//! logindex-storage — durable storage backends for the logindex engine.
//!
//! Provides the file-backed `RandomAccess` implementation and a
//! directory-rooted factory, so an indexer can be pointed at a directory
//! and keep one sparse state file per indexed log under it.

pub mod file;

pub use file::{DirStorageFactory, FileStorage};
