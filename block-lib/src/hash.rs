use crate::{StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Width of one block digest. A file content hash is always a whole number
/// of these units.
pub const HASH_UNIT_WIDTH: usize = 32;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockHash([u8; HASH_UNIT_WIDTH]);

impl BlockHash {
    pub fn from_bytes(bytes: &[u8]) -> StoreResult<Self> {
        if bytes.len() != HASH_UNIT_WIDTH {
            return Err(StoreError::InvalidData(format!(
                "block hash must be {} bytes, got {}",
                HASH_UNIT_WIDTH,
                bytes.len()
            )));
        }
        let mut raw = [0u8; HASH_UNIT_WIDTH];
        raw.copy_from_slice(bytes);
        Ok(Self(raw))
    }

    pub fn from_hex(hex_str: &str) -> StoreResult<Self> {
        let bytes = hex::decode(hex_str)
            .map_err(|e| StoreError::InvalidData(format!("bad hash hex: {}", e)))?;
        Self::from_bytes(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; HASH_UNIT_WIDTH] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockHash({})", self.to_hex())
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Incremental SHA-256 over one block's decoded bytes.
pub struct BlockHasher {
    sha: Sha256,
    length: u64,
}

impl BlockHasher {
    pub fn new() -> Self {
        Self {
            sha: Sha256::new(),
            length: 0,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.sha.update(data);
        self.length += data.len() as u64;
    }

    /// Decoded bytes fed so far.
    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn finalize(self) -> BlockHash {
        let digest = self.sha.finalize();
        let mut raw = [0u8; HASH_UNIT_WIDTH];
        raw.copy_from_slice(&digest);
        BlockHash(raw)
    }

    pub fn calc_from_bytes(data: &[u8]) -> BlockHash {
        let mut hasher = Self::new();
        hasher.update(data);
        hasher.finalize()
    }
}

impl Default for BlockHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// A file version's content hash: the per-block digests concatenated in
/// block order. The buffer IS the block manifest, there is no side table.
#[derive(Clone, PartialEq, Eq)]
pub struct ContentHash {
    raw: Vec<u8>,
}

impl ContentHash {
    pub fn empty() -> Self {
        Self { raw: Vec::new() }
    }

    pub fn from_bytes(raw: Vec<u8>) -> StoreResult<Self> {
        if raw.len() % HASH_UNIT_WIDTH != 0 {
            return Err(StoreError::InvalidData(format!(
                "content hash length {} is not a multiple of {}",
                raw.len(),
                HASH_UNIT_WIDTH
            )));
        }
        Ok(Self { raw })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    pub fn block_count(&self) -> usize {
        self.raw.len() / HASH_UNIT_WIDTH
    }

    pub fn block_hash(&self, index: usize) -> StoreResult<BlockHash> {
        if index >= self.block_count() {
            return Err(StoreError::InvalidParam(format!(
                "block index {} out of range, manifest has {} blocks",
                index,
                self.block_count()
            )));
        }
        let start = index * HASH_UNIT_WIDTH;
        BlockHash::from_bytes(&self.raw[start..start + HASH_UNIT_WIDTH])
    }

    pub fn iter(&self) -> impl Iterator<Item = BlockHash> + '_ {
        self.raw.chunks_exact(HASH_UNIT_WIDTH).map(|chunk| {
            let mut raw = [0u8; HASH_UNIT_WIDTH];
            raw.copy_from_slice(chunk);
            BlockHash(raw)
        })
    }
}

// The manifest can hold thousands of block hashes, keep Debug short.
impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({} blocks)", self.block_count())
    }
}

/// Accumulates per-block hashes while a chunking pass runs.
pub struct ContentHashBuilder {
    raw: Vec<u8>,
}

impl ContentHashBuilder {
    pub fn new(expected_blocks: usize) -> Self {
        Self {
            raw: Vec::with_capacity(expected_blocks * HASH_UNIT_WIDTH),
        }
    }

    pub fn append(&mut self, hash: BlockHash) {
        self.raw.extend_from_slice(hash.as_bytes());
    }

    pub fn block_count(&self) -> usize {
        self.raw.len() / HASH_UNIT_WIDTH
    }

    pub fn build(self) -> ContentHash {
        ContentHash { raw: self.raw }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_hash_roundtrip() {
        let hash = BlockHasher::calc_from_bytes(b"hello block store");
        let hex_str = hash.to_hex();
        let parsed = BlockHash::from_hex(&hex_str).unwrap();
        assert_eq!(hash, parsed);
    }

    #[test]
    fn test_hasher_matches_oneshot() {
        let mut hasher = BlockHasher::new();
        hasher.update(b"hello ");
        hasher.update(b"block store");
        assert_eq!(hasher.length(), 17);
        let streamed = hasher.finalize();
        assert_eq!(streamed, BlockHasher::calc_from_bytes(b"hello block store"));
    }

    #[test]
    fn test_content_hash_manifest() {
        let a = BlockHasher::calc_from_bytes(b"aaaa");
        let b = BlockHasher::calc_from_bytes(b"bbbb");

        let mut builder = ContentHashBuilder::new(2);
        builder.append(a);
        builder.append(b);
        let manifest = builder.build();

        assert_eq!(manifest.block_count(), 2);
        assert_eq!(manifest.as_bytes().len(), 2 * HASH_UNIT_WIDTH);
        assert_eq!(manifest.block_hash(0).unwrap(), a);
        assert_eq!(manifest.block_hash(1).unwrap(), b);
        assert!(manifest.block_hash(2).is_err());

        let collected: Vec<BlockHash> = manifest.iter().collect();
        assert_eq!(collected, vec![a, b]);

        let reparsed = ContentHash::from_bytes(manifest.as_bytes().to_vec()).unwrap();
        assert_eq!(reparsed, manifest);
    }

    #[test]
    fn test_content_hash_rejects_partial_unit() {
        assert!(ContentHash::from_bytes(vec![0u8; HASH_UNIT_WIDTH + 1]).is_err());
        assert!(ContentHash::from_bytes(Vec::new()).unwrap().is_empty());
    }
}
