use crate::{BlockHash, StoreError, StoreResult};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::io::Cursor;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt};

pub type BlockReadStream = Pin<Box<dyn AsyncRead + Send + Sync + Unpin>>;

/// Opaque per-block metadata produced by the backend's encoding decorator
/// (compression parameters, cipher nonce, whatever the backend needs). The
/// engine only carries it from `wrap_for_encoding` to `put_block`.
#[derive(Debug, Clone, Default)]
pub struct EncoderMeta(pub Option<Value>);

impl EncoderMeta {
    pub fn none() -> Self {
        Self(None)
    }
}

/// Content-addressed key-value storage for blocks.
///
/// Implementations must guarantee write idempotence (same hash, same bytes)
/// and immutability once a hash exists; under those rules reads and deletes
/// may race freely. `put_block` receives a stream that can be reset to its
/// start, so a backend is free to retry a partial upload. `delete_block`
/// may perform blocking I/O; callers suspend the core lock around it.
#[async_trait]
pub trait BlockBackend: Send + Sync {
    async fn init(&self) -> StoreResult<()>;

    /// Stream over the block's decoded bytes, positioned at offset 0. Any
    /// transparent encoding applied on the write path is undone here.
    async fn open_block(&self, hash: &BlockHash) -> StoreResult<BlockReadStream>;

    async fn put_block(
        &self,
        hash: &BlockHash,
        stream: BlockReadStream,
        decoded_len: u64,
        encoder_meta: EncoderMeta,
    ) -> StoreResult<()>;

    async fn delete_block(&self, hash: &BlockHash) -> StoreResult<()>;

    /// Decorate an outgoing stream with the backend's transparent encoding.
    fn wrap_for_encoding(&self, stream: BlockReadStream) -> (BlockReadStream, EncoderMeta);
}

/// Reference backend keeping blocks in a process-local map. Used by the
/// engine's tests; real deployments plug a disk or remote implementation
/// into the same trait.
#[derive(Default)]
pub struct MemoryBackend {
    blocks: Mutex<HashMap<BlockHash, Arc<Vec<u8>>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.lock().unwrap().len()
    }

    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.blocks.lock().unwrap().contains_key(hash)
    }
}

#[async_trait]
impl BlockBackend for MemoryBackend {
    async fn init(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn open_block(&self, hash: &BlockHash) -> StoreResult<BlockReadStream> {
        let data = self
            .blocks
            .lock()
            .unwrap()
            .get(hash)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("block not found: {}", hash)))?;
        Ok(Box::pin(Cursor::new(data.as_ref().clone())))
    }

    async fn put_block(
        &self,
        hash: &BlockHash,
        mut stream: BlockReadStream,
        decoded_len: u64,
        _encoder_meta: EncoderMeta,
    ) -> StoreResult<()> {
        let mut data = Vec::with_capacity(decoded_len as usize);
        stream.read_to_end(&mut data).await.map_err(|e| {
            warn!("MemoryBackend: read put stream failed! {}", e);
            StoreError::IoError(e.to_string())
        })?;
        self.blocks
            .lock()
            .unwrap()
            .insert(*hash, Arc::new(data));
        Ok(())
    }

    async fn delete_block(&self, hash: &BlockHash) -> StoreResult<()> {
        self.blocks.lock().unwrap().remove(hash);
        Ok(())
    }

    fn wrap_for_encoding(&self, stream: BlockReadStream) -> (BlockReadStream, EncoderMeta) {
        // identity encoding
        (stream, EncoderMeta::none())
    }
}
