use crate::chunker::block_span;
use block_lib::{BlockHash, BlockReadStream, ContentHash};
use futures::future::BoxFuture;
use std::io::SeekFrom;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, ReadBuf};

pub type OpenBlockFuture = BoxFuture<'static, std::io::Result<BlockReadStream>>;

pub type OpenBlockFn = Arc<dyn Fn(BlockHash) -> OpenBlockFuture + Send + Sync + 'static>;

/// Reassembles one logical byte stream from a file version's ordered block
/// manifest. Blocks are opened lazily and advanced transparently; reading
/// across all of them is indistinguishable from one contiguous stream.
pub struct BlockListReader {
    manifest: ContentHash,
    block_size: u64,
    total_size: u64,
    position: u64,

    next_block_index: usize,
    next_block_offset: u64,
    active_block_index: Option<usize>,

    pending_seek: Option<u64>,
    loading_block_index: Option<usize>,
    loading_future: Option<OpenBlockFuture>,
    current_reader: Option<BlockReadStream>,

    open_block: OpenBlockFn,
}

impl BlockListReader {
    pub fn new(
        manifest: ContentHash,
        total_size: u64,
        block_size: u64,
        open_block: OpenBlockFn,
    ) -> Self {
        Self {
            manifest,
            block_size,
            total_size,
            position: 0,
            next_block_index: 0,
            next_block_offset: 0,
            active_block_index: None,
            pending_seek: None,
            loading_block_index: None,
            loading_future: None,
            current_reader: None,
            open_block,
        }
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Mark every block consumed and release the open backend stream.
    pub fn close(&mut self) {
        self.apply_seek_target(self.total_size);
    }

    fn calc_seek_target(&self, seek_from: SeekFrom) -> std::io::Result<u64> {
        let target = match seek_from {
            SeekFrom::Start(offset) => offset as i128,
            SeekFrom::Current(delta) => self.position as i128 + delta as i128,
            SeekFrom::End(delta) => self.total_size as i128 + delta as i128,
        };

        if target < 0 || target > self.total_size as i128 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!(
                    "seek target {} out of range [0, {}]",
                    target, self.total_size
                ),
            ));
        }
        Ok(target as u64)
    }

    fn apply_seek_target(&mut self, position: u64) {
        self.position = position;
        let (next_block_index, next_block_offset) = self.locate_position(position);

        self.next_block_index = next_block_index;
        self.next_block_offset = next_block_offset;
        self.active_block_index = None;
        self.pending_seek = None;
        self.current_reader = None;
        self.loading_future = None;
        self.loading_block_index = None;
    }

    fn locate_position(&self, position: u64) -> (usize, u64) {
        if position >= self.total_size || self.manifest.is_empty() {
            return (self.manifest.block_count(), 0);
        }
        let index = (position / self.block_size) as usize;
        let offset = position - index as u64 * self.block_size;
        (index, offset)
    }

    fn start_loading_current_block(&mut self) -> std::io::Result<()> {
        if self.next_block_index >= self.manifest.block_count() {
            return Ok(());
        }

        let hash = self
            .manifest
            .block_hash(self.next_block_index)
            .map_err(std::io::Error::from)?;
        let span = block_span(self.next_block_index, self.total_size, self.block_size);
        let offset = self.next_block_offset;
        if offset > span {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("block offset {} exceeds block span {} for {}", offset, span, hash),
            ));
        }

        let open_block = self.open_block.clone();
        self.loading_block_index = Some(self.next_block_index);
        self.loading_future = Some(Box::pin(async move {
            let mut stream = open_block(hash).await?;
            if offset > 0 {
                let mut sink = tokio::io::sink();
                let skipped =
                    tokio::io::copy(&mut (&mut stream).take(offset), &mut sink).await?;
                if skipped != offset {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!("block {} shorter than resume offset {}", hash, offset),
                    ));
                }
            }
            let limited: BlockReadStream = Box::pin(stream.take(span - offset));
            Ok(limited)
        }));
        Ok(())
    }

    fn advance_after_block_eof(&mut self) {
        if let Some(active_block_index) = self.active_block_index.take() {
            self.next_block_index = active_block_index.saturating_add(1);
            self.next_block_offset = 0;
        }
        self.current_reader = None;
    }
}

impl AsyncRead for BlockListReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();

        if this.pending_seek.is_some() {
            return Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "seek in progress, call poll_complete before read",
            )));
        }

        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        loop {
            if let Some(reader) = this.current_reader.as_mut() {
                let before = buf.filled().len();
                match Pin::new(reader).poll_read(cx, buf) {
                    Poll::Ready(Ok(())) => {
                        let bytes_read = buf.filled().len().saturating_sub(before);
                        if bytes_read > 0 {
                            this.position = this.position.saturating_add(bytes_read as u64);
                            return Poll::Ready(Ok(()));
                        }

                        this.advance_after_block_eof();
                        continue;
                    }
                    Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
                    Poll::Pending => return Poll::Pending,
                }
            }

            if let Some(fut) = this.loading_future.as_mut() {
                match fut.as_mut().poll(cx) {
                    Poll::Ready(Ok(reader)) => {
                        let Some(active_block_index) = this.loading_block_index.take() else {
                            return Poll::Ready(Err(std::io::Error::new(
                                std::io::ErrorKind::Other,
                                "loading block index missing",
                            )));
                        };

                        this.loading_future = None;
                        this.active_block_index = Some(active_block_index);
                        this.current_reader = Some(reader);
                        continue;
                    }
                    Poll::Ready(Err(err)) => {
                        this.loading_future = None;
                        this.loading_block_index = None;
                        return Poll::Ready(Err(err));
                    }
                    Poll::Pending => return Poll::Pending,
                }
            }

            if this.position >= this.total_size
                || this.next_block_index >= this.manifest.block_count()
            {
                return Poll::Ready(Ok(()));
            }

            if let Err(err) = this.start_loading_current_block() {
                return Poll::Ready(Err(err));
            }
        }
    }
}

impl AsyncSeek for BlockListReader {
    fn start_seek(self: Pin<&mut Self>, position: SeekFrom) -> std::io::Result<()> {
        let this = self.get_mut();
        let target = this.calc_seek_target(position)?;
        this.pending_seek = Some(target);
        Ok(())
    }

    fn poll_complete(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<u64>> {
        let this = self.get_mut();
        if let Some(target) = this.pending_seek.take() {
            this.apply_seek_target(target);
        }
        Poll::Ready(Ok(this.position))
    }
}
