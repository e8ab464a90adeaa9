use crate::{FileChunker, FileId};
use block_lib::{ContentHash, CoreGuard, StoreError, StoreResult};
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;

const STAGING_EXT: &str = "prefix";

/// On-disk location for one id's staging file. Nested under the internal
/// name so bulk purges can drop whole stores/objects by removing one
/// directory.
pub fn staging_path(staging_dir: &Path, file_id: &FileId) -> PathBuf {
    staging_dir.join(format!("{}.{}", file_id.internal_name(), STAGING_EXT))
}

/// Map an internal-name prefix (always ending in '/') to its staging subtree.
pub fn staging_dir_for_prefix(staging_dir: &Path, prefix: &str) -> PathBuf {
    staging_dir.join(prefix.trim_end_matches('/'))
}

/// A temporary file accumulating content for one logical file before it is
/// committed into the block store. `prepare` runs the chunking pass; `apply`
/// on the engine consumes the prepared prefix and deletes the file once the
/// metadata transaction commits.
pub struct StagingPrefix {
    file_id: FileId,
    path: PathBuf,
    length: u64,
    writer: Option<File>,
    content_hash: Option<ContentHash>,
}

impl StagingPrefix {
    pub async fn create(staging_dir: &Path, file_id: FileId) -> StoreResult<Self> {
        let path = staging_path(staging_dir, &file_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                warn!("StagingPrefix: create staging dir failed! {}", e);
                StoreError::IoError(e.to_string())
            })?;
        }
        let writer = File::create(&path).await.map_err(|e| {
            warn!("StagingPrefix: create staging file failed! {}", e);
            StoreError::IoError(e.to_string())
        })?;

        Ok(Self {
            file_id,
            path,
            length: 0,
            writer: Some(writer),
            content_hash: None,
        })
    }

    pub fn file_id(&self) -> &FileId {
        &self.file_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    /// Set once `prepare` has chunked the staged content.
    pub fn content_hash(&self) -> Option<&ContentHash> {
        self.content_hash.as_ref()
    }

    pub async fn append(&mut self, data: &[u8]) -> StoreResult<()> {
        if self.content_hash.is_some() {
            return Err(StoreError::InvalidParam(
                "staging prefix already prepared".to_string(),
            ));
        }
        if self.writer.is_none() {
            let file = OpenOptions::new()
                .append(true)
                .open(&self.path)
                .await
                .map_err(|e| StoreError::IoError(e.to_string()))?;
            self.writer = Some(file);
        }
        let Some(writer) = self.writer.as_mut() else {
            return Err(StoreError::Internal("staging writer missing".to_string()));
        };
        writer.write_all(data).await.map_err(|e| {
            warn!("StagingPrefix: append failed! {}", e);
            StoreError::IoError(e.to_string())
        })?;
        self.length += data.len() as u64;
        Ok(())
    }

    /// Run the chunk/hash pass over the staged bytes and record the content
    /// hash. Idempotent; a second call just returns the recorded hash.
    pub async fn prepare(
        &mut self,
        core: &mut CoreGuard<'_>,
        chunker: &FileChunker,
    ) -> StoreResult<ContentHash> {
        if let Some(hash) = &self.content_hash {
            return Ok(hash.clone());
        }

        if let Some(mut writer) = self.writer.take() {
            writer.flush().await.map_err(|e| StoreError::IoError(e.to_string()))?;
        }

        let input = File::open(&self.path).await.map_err(|e| {
            warn!("StagingPrefix: open staged file failed! {}", e);
            StoreError::IoError(e.to_string())
        })?;
        let hash = chunker.split_and_store(core, input, self.length).await?;
        self.content_hash = Some(hash.clone());
        Ok(hash)
    }
}
