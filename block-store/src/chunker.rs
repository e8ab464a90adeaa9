use crate::StoreMetaDb;
use block_lib::{
    BlockBackend, BlockHasher, ContentHash, ContentHashBuilder, CoreGuard, StoreError,
    StoreResult,
};
use std::io::Cursor;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Decoded length of block `index` in a file of `total_len` bytes.
pub fn block_span(index: usize, total_len: u64, block_size: u64) -> u64 {
    let start = index as u64 * block_size;
    total_len.saturating_sub(start).min(block_size)
}

/// Number of blocks a stored file of `length` bytes occupies. A zero-length
/// file still takes one (empty) block when empty-skip is off.
pub fn block_count_for(length: u64, block_size: u64, skip_empty: bool) -> usize {
    if length == 0 {
        if skip_empty {
            0
        } else {
            1
        }
    } else {
        ((length + block_size - 1) / block_size) as usize
    }
}

/// Splits staged content into fixed-size blocks, hashes each block's decoded
/// bytes, and drives the backend writes. Purely write-side; reassembly lives
/// in the block reader.
pub struct FileChunker {
    db: Arc<StoreMetaDb>,
    backend: Arc<dyn BlockBackend>,
    block_size: u64,
    skip_empty: bool,
}

impl FileChunker {
    pub fn new(
        db: Arc<StoreMetaDb>,
        backend: Arc<dyn BlockBackend>,
        block_size: u64,
        skip_empty: bool,
    ) -> Self {
        Self {
            db,
            backend,
            block_size,
            skip_empty,
        }
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Chunk `length` bytes from `input` into the backend and return the
    /// file content hash. The caller holds the core lock; every backend
    /// write happens with it suspended. A failure aborts the whole pass
    /// with no rollback: writes are idempotent and keyed by content, a
    /// retry reproduces the same blocks under the same hashes.
    pub async fn split_and_store<R>(
        &self,
        core: &mut CoreGuard<'_>,
        mut input: R,
        length: u64,
    ) -> StoreResult<ContentHash>
    where
        R: AsyncRead + Unpin + Send,
    {
        if length == 0 && self.skip_empty {
            return Ok(ContentHash::empty());
        }

        let num_blocks = block_count_for(length, self.block_size, false);
        let mut manifest = ContentHashBuilder::new(num_blocks);

        for index in 0..num_blocks {
            let span = block_span(index, length, self.block_size);

            // bounded window over the input: exactly one block's worth
            let mut block_data = Vec::with_capacity(span as usize);
            let mut window = (&mut input).take(span);
            window.read_to_end(&mut block_data).await.map_err(|e| {
                warn!("FileChunker: read block {} failed! {}", index, e);
                StoreError::IoError(e.to_string())
            })?;
            if block_data.len() as u64 != span {
                return Err(StoreError::IoError(format!(
                    "staged input ended early: block {} expected {} bytes got {}",
                    index,
                    span,
                    block_data.len()
                )));
            }

            let mut hasher = BlockHasher::new();
            hasher.update(&block_data);
            let decoded_len = hasher.length();
            // a slice wider than one block means the windowing is broken;
            // the digest would cover multi-block content
            if decoded_len > self.block_size {
                return Err(StoreError::Integrity(format!(
                    "block {} digest covers {} bytes, limit {}",
                    index, decoded_len, self.block_size
                )));
            }
            let hash = hasher.finalize();

            // bookkeeping only; a block already stored is still rewritten,
            // keeping retry semantics for interrupted writes
            if let Some(state) = self.db.get_block_state(&hash)? {
                debug!(
                    "FileChunker: block {} already known, state={}",
                    hash,
                    state.to_str()
                );
            }
            self.db.pre_put_block(&hash, decoded_len)?;

            let (stream, encoder_meta) = self
                .backend
                .wrap_for_encoding(Box::pin(Cursor::new(block_data)));
            core.unlocked(
                "backend put block",
                self.backend.put_block(&hash, stream, decoded_len, encoder_meta),
            )
            .await??;

            self.db.post_put_block(&hash)?;
            manifest.append(hash);
        }

        Ok(manifest.build())
    }
}
