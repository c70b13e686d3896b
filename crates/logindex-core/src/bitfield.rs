//! Paged sparse bit set persisted to a random-access store.
//!
//! Tracks which block positions of one log have been indexed. Pages are
//! fixed-size and written back at page-aligned offsets, so the on-disk
//! layout is a plain concatenation of pages: bit `b` of little-endian word
//! `w` of page `p` encodes position `p * 32768 + w * 32 + b`.

use std::collections::BTreeMap;

use crate::error::IndexError;
use crate::storage::RandomAccess;

/// Bits per page.
pub const PAGE_BITS: u64 = 32_768;
/// 32-bit words per page.
const PAGE_WORDS: usize = 1024;
/// Bytes per page on disk.
const PAGE_BYTES: u64 = 4096;

struct Page {
    words: Box<[u32; PAGE_WORDS]>,
    dirty: bool,
}

impl Page {
    fn zeroed(dirty: bool) -> Self {
        Self {
            words: Box::new([0u32; PAGE_WORDS]),
            dirty,
        }
    }

    fn is_zero(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }
}

/// A sparse bit array over block positions.
pub struct Bitfield {
    storage: Option<Box<dyn RandomAccess>>,
    pages: BTreeMap<u64, Page>,
}

impl Bitfield {
    /// An in-memory bitfield with no backing store. `flush` is a no-op.
    pub fn ephemeral() -> Self {
        Self {
            storage: None,
            pages: BTreeMap::new(),
        }
    }

    /// Open a bitfield over `storage`, materialising any existing pages.
    /// A store that does not exist yet opens empty.
    pub async fn open(mut storage: Box<dyn RandomAccess>) -> Result<Self, IndexError> {
        let mut pages = BTreeMap::new();
        if let Some(size) = storage.stat().await? {
            if size > 0 {
                let bytes = storage.read(0, size).await?;
                for (p, chunk) in bytes.chunks(PAGE_BYTES as usize).enumerate() {
                    let mut page = Page::zeroed(false);
                    for (w, word) in chunk.chunks(4).enumerate() {
                        let mut buf = [0u8; 4];
                        buf[..word.len()].copy_from_slice(word);
                        page.words[w] = u32::from_le_bytes(buf);
                    }
                    // All-zero pages carry no information; keep the map sparse.
                    if !page.is_zero() {
                        pages.insert(p as u64, page);
                    }
                }
            }
        }
        Ok(Self {
            storage: Some(storage),
            pages,
        })
    }

    /// Returns the bit at `index`.
    pub fn get(&self, index: u64) -> bool {
        let (p, w, b) = locate(index);
        match self.pages.get(&p) {
            Some(page) => page.words[w] & (1 << b) != 0,
            None => false,
        }
    }

    /// Set the bit at `index`. Writing the value a bit already has is a
    /// no-op; in particular a `false` write never allocates a page.
    pub fn set(&mut self, index: u64, value: bool) {
        let (p, w, b) = locate(index);
        let page = match self.pages.get_mut(&p) {
            Some(page) => page,
            None => {
                if !value {
                    return;
                }
                self.pages.entry(p).or_insert_with(|| Page::zeroed(false))
            }
        };
        let mask = 1u32 << b;
        let current = page.words[w] & mask != 0;
        if current == value {
            return;
        }
        if value {
            page.words[w] |= mask;
        } else {
            page.words[w] &= !mask;
        }
        page.dirty = true;
    }

    /// Write all dirty pages back at their aligned offsets.
    pub async fn flush(&mut self) -> Result<(), IndexError> {
        let Some(storage) = self.storage.as_mut() else {
            return Ok(());
        };
        for (p, page) in self.pages.iter_mut() {
            if !page.dirty {
                continue;
            }
            let mut bytes = Vec::with_capacity(PAGE_BYTES as usize);
            for word in page.words.iter() {
                bytes.extend_from_slice(&word.to_le_bytes());
            }
            storage.write(p * PAGE_BYTES, &bytes).await?;
            page.dirty = false;
        }
        Ok(())
    }

    /// Release the storage handle without flushing.
    pub async fn close(&mut self) -> Result<(), IndexError> {
        if let Some(mut storage) = self.storage.take() {
            storage.close().await?;
        }
        Ok(())
    }

    /// Delete all backing state.
    pub async fn unlink(&mut self) -> Result<(), IndexError> {
        self.pages.clear();
        if let Some(storage) = self.storage.as_mut() {
            storage.unlink().await?;
        }
        Ok(())
    }

    #[cfg(test)]
    fn page_count(&self) -> usize {
        self.pages.len()
    }
}

fn locate(index: u64) -> (u64, usize, u32) {
    let p = index / PAGE_BITS;
    let rem = index % PAGE_BITS;
    let w = (rem / 32) as usize;
    let b = (rem % 32) as u32;
    (p, w, b)
}
