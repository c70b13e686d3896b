//! Shared types for the indexing pipeline.

use serde::{Deserialize, Serialize};

// ─── Block ────────────────────────────────────────────────────────────────────

/// How block payloads are encoded. All logs feeding one indexer share one
/// encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockEncoding {
    Binary,
    Utf8,
    Json,
}

/// An opaque block payload at some position in a log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Block {
    Binary(Vec<u8>),
    Utf8(String),
    Json(serde_json::Value),
}

/// Byte length assumed for a JSON block when accounting buffer usage.
/// JSON values have no cheap byte size, so a fixed estimate is used.
const JSON_BLOCK_LEN: usize = 1024;

impl Block {
    /// The encoding this payload carries.
    pub fn encoding(&self) -> BlockEncoding {
        match self {
            Self::Binary(_) => BlockEncoding::Binary,
            Self::Utf8(_) => BlockEncoding::Utf8,
            Self::Json(_) => BlockEncoding::Json,
        }
    }

    /// Byte length used for buffer accounting.
    pub fn byte_len(&self) -> usize {
        match self {
            Self::Binary(b) => b.len(),
            Self::Utf8(s) => s.len(),
            Self::Json(_) => JSON_BLOCK_LEN,
        }
    }
}

// ─── Entry ────────────────────────────────────────────────────────────────────

/// One block handed to the batch handler, tagged with its origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// Position of the block within its log.
    pub index: u64,
    /// Hex-encoded discovery key of the log the block came from.
    pub discovery_id: String,
    /// The block payload.
    pub block: Block,
}

impl Entry {
    /// Byte length used for buffer accounting.
    pub fn byte_len(&self) -> usize {
        self.block.byte_len()
    }
}

/// Lowercase-hex discovery id for a 32-byte discovery key.
pub fn discovery_id(discovery_key: &[u8; 32]) -> String {
    let mut out = String::with_capacity(64);
    for b in discovery_key {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_len_binary_and_utf8() {
        assert_eq!(Block::Binary(vec![0; 7]).byte_len(), 7);
        assert_eq!(Block::Utf8("héllo".into()).byte_len(), 6); // é is 2 bytes
    }

    #[test]
    fn encoding_matches_payload() {
        assert_eq!(Block::Binary(vec![]).encoding(), BlockEncoding::Binary);
        assert_eq!(Block::Utf8(String::new()).encoding(), BlockEncoding::Utf8);
        assert_eq!(
            Block::Json(serde_json::Value::Null).encoding(),
            BlockEncoding::Json
        );
    }

    #[test]
    fn byte_len_json_is_fixed() {
        assert_eq!(Block::Json(serde_json::Value::Null).byte_len(), 1024);
        assert_eq!(
            Block::Json(serde_json::json!({"a": [1, 2, 3]})).byte_len(),
            1024
        );
    }

    #[test]
    fn discovery_id_hex() {
        let mut key = [0u8; 32];
        key[0] = 0xab;
        key[31] = 0x01;
        let id = discovery_id(&key);
        assert_eq!(id.len(), 64);
        assert!(id.starts_with("ab"));
        assert!(id.ends_with("01"));
    }
}
