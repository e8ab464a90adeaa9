use crate::chunker::block_span;
use crate::{
    staging_dir_for_prefix, BlockListReader, BlockStoreConfig, CommitAction, DeadBlockCollector,
    FileChunker, FileId, FileInfo, FileState, MetaTxn, OpenBlockFn, StagingPrefix, StoreMetaDb,
};
use block_lib::{BlockBackend, ContentHash, CoreGuard, StoreError, StoreResult};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;

#[derive(Debug, Clone, Copy)]
pub struct EngineStats {
    pub live_files: u64,
    pub total_blocks: u64,
    pub dead_blocks: u64,
}

/// Orchestrates the file-lifecycle state machine over the metadata store and
/// the block backend. All collaborators are injected at construction; the
/// engine has an explicit open/close lifecycle and no ambient state.
pub struct BlockStoreEngine {
    pub(crate) config: BlockStoreConfig,
    pub(crate) db: Arc<StoreMetaDb>,
    pub(crate) backend: Arc<dyn BlockBackend>,
    pub(crate) chunker: FileChunker,
    pub(crate) collector: DeadBlockCollector,
    staging_dir: PathBuf,
}

impl BlockStoreEngine {
    pub async fn open(root_dir: PathBuf, backend: Arc<dyn BlockBackend>) -> StoreResult<Self> {
        fs::create_dir_all(&root_dir).await.map_err(|e| {
            StoreError::IoError(format!("create store root failed: {}", e))
        })?;
        let config = BlockStoreConfig::load_or_init(&root_dir).await?;
        Self::open_with_config(root_dir, backend, config).await
    }

    pub async fn open_with_config(
        root_dir: PathBuf,
        backend: Arc<dyn BlockBackend>,
        config: BlockStoreConfig,
    ) -> StoreResult<Self> {
        fs::create_dir_all(&root_dir).await.map_err(|e| {
            StoreError::IoError(format!("create store root failed: {}", e))
        })?;
        let staging_dir = root_dir.join(&config.staging_dir_name);
        fs::create_dir_all(&staging_dir).await.map_err(|e| {
            StoreError::IoError(format!("create staging dir failed: {}", e))
        })?;

        backend.init().await?;

        let db_path = root_dir.join(&config.db_file);
        let db = Arc::new(StoreMetaDb::new(db_path.to_string_lossy().to_string())?);
        let chunker = FileChunker::new(
            db.clone(),
            backend.clone(),
            config.block_size,
            config.skip_empty_blocks,
        );
        let collector = DeadBlockCollector::new(db.clone(), backend.clone());

        info!(
            "BlockStoreEngine: opened at {}, block_size={}",
            root_dir.to_string_lossy(),
            config.block_size
        );
        Ok(Self {
            config,
            db,
            backend,
            chunker,
            collector,
            staging_dir,
        })
    }

    pub fn close(self) {
        debug!("BlockStoreEngine: closed");
    }

    pub fn config(&self) -> &BlockStoreConfig {
        &self.config
    }

    pub fn chunker(&self) -> &FileChunker {
        &self.chunker
    }

    pub fn collector(&self) -> &DeadBlockCollector {
        &self.collector
    }

    pub async fn create_staging(&self, file_id: FileId) -> StoreResult<StagingPrefix> {
        StagingPrefix::create(&self.staging_dir, file_id).await
    }

    /// Insert an empty live version. A live id is an existence conflict; a
    /// tombstoned id revives with the next version number.
    pub async fn create(
        &self,
        _core: &mut CoreGuard<'_>,
        file_id: &FileId,
        mtime: u64,
    ) -> StoreResult<FileInfo> {
        let internal_name = file_id.internal_name();
        let (info, _) = self.db.with_txn(false, |txn| {
            let id = txn.get_or_create_file_index(&internal_name)?;
            let state = txn.get_file_state(id)?;
            if state.is_live() {
                return Err(StoreError::AlreadyExists(format!(
                    "file already exists: {}",
                    internal_name
                )));
            }
            let info = FileInfo {
                id,
                version: state.next_version(),
                length: 0,
                mtime,
                content_hash: ContentHash::empty(),
            };
            txn.put_file_info(&info)?;
            Ok(info)
        })?;
        Ok(info)
    }

    /// Commit a prepared staging prefix as the id's next version.
    ///
    /// `was_present` is the caller's cached belief about the file's current
    /// existence; a mismatch against DB ground truth is a race and always
    /// surfaces as a conflict error, never a silent reconciliation.
    pub async fn apply(
        &self,
        core: &mut CoreGuard<'_>,
        prefix: &StagingPrefix,
        path: &str,
        was_present: bool,
        mtime: u64,
        retain: Option<bool>,
    ) -> StoreResult<FileInfo> {
        let content_hash = prefix.content_hash().cloned().ok_or_else(|| {
            StoreError::InvalidParam(format!(
                "staging prefix for {} not prepared",
                prefix.file_id()
            ))
        })?;
        let internal_name = prefix.file_id().internal_name();
        let keep = retain.unwrap_or(self.config.keep_history);
        let block_size = self.config.block_size;
        let length = prefix.length();
        let staging_file = prefix.path().to_path_buf();

        let (info, actions) = self.db.with_txn(keep, |txn| {
            let id = txn.get_or_create_file_index(&internal_name)?;
            let state = txn.get_file_state(id)?;
            match (&state, was_present) {
                (FileState::Live(_), true) => {}
                (FileState::Live(_), false) => {
                    return Err(StoreError::AlreadyExists(format!(
                        "apply expected absent file but {} is live",
                        internal_name
                    )));
                }
                (_, true) => {
                    return Err(StoreError::NotFound(format!(
                        "apply expected live file but {} is not",
                        internal_name
                    )));
                }
                (_, false) => {}
            }

            let info = FileInfo {
                id,
                version: state.next_version(),
                length,
                mtime,
                content_hash: content_hash.clone(),
            };
            reference_manifest(txn, &info.content_hash, length, block_size)?;
            if let FileState::Live(old) = &state {
                retire_outgoing(txn, path, old)?;
            }
            txn.put_file_info(&info)?;
            // the superseded staging file goes away only if this commits
            txn.after_commit(CommitAction::RemoveStaging(staging_file.clone()));
            Ok(info)
        })?;

        self.run_commit_actions(core, actions).await?;
        Ok(info)
    }

    /// Tombstone a live id. Absent and already-deleted ids are a no-op so
    /// racing removal paths stay idempotent.
    pub async fn delete(
        &self,
        core: &mut CoreGuard<'_>,
        file_id: &FileId,
        path: &str,
        mtime: u64,
        retain: Option<bool>,
    ) -> StoreResult<()> {
        let internal_name = file_id.internal_name();
        let keep = retain.unwrap_or(self.config.keep_history);

        let (_, actions) = self.db.with_txn(keep, |txn| {
            let Some(id) = txn.get_file_index(&internal_name)? else {
                return Ok(());
            };
            let FileState::Live(old) = txn.get_file_state(id)? else {
                return Ok(());
            };
            retire_outgoing(txn, path, &old)?;
            txn.put_tombstone(id, old.version + 1, mtime)
        })?;

        self.run_commit_actions(core, actions).await?;
        Ok(())
    }

    /// Repoint a live file to a new name: pure metadata, zero data copy.
    /// The destination carries the source's manifest and length; a cross-id
    /// move additionally tombstones the source.
    pub async fn move_file(
        &self,
        core: &mut CoreGuard<'_>,
        from_id: &FileId,
        from_path: &str,
        to_id: &FileId,
        _to_path: &str,
        retain: Option<bool>,
    ) -> StoreResult<FileInfo> {
        let from_name = from_id.internal_name();
        let to_name = to_id.internal_name();
        let same_id = from_name == to_name;
        let keep = retain.unwrap_or(self.config.keep_history);
        let block_size = self.config.block_size;

        let (info, actions) = self.db.with_txn(keep, |txn| {
            let Some(src_id) = txn.get_file_index(&from_name)? else {
                return Err(StoreError::NotFound(format!(
                    "move source not found: {}",
                    from_name
                )));
            };
            let FileState::Live(src) = txn.get_file_state(src_id)? else {
                return Err(StoreError::NotFound(format!(
                    "move source not live: {}",
                    from_name
                )));
            };

            let (dest_id, dest_version) = if same_id {
                (src_id, src.version + 1)
            } else {
                let dest_id = txn.get_or_create_file_index(&to_name)?;
                let dest_state = txn.get_file_state(dest_id)?;
                if dest_state.is_live() {
                    return Err(StoreError::AlreadyExists(format!(
                        "move destination occupied: {}",
                        to_name
                    )));
                }
                (dest_id, dest_state.next_version())
            };

            let info = FileInfo {
                id: dest_id,
                version: dest_version,
                length: src.length,
                mtime: src.mtime,
                content_hash: src.content_hash.clone(),
            };
            reference_manifest(txn, &info.content_hash, info.length, block_size)?;
            retire_outgoing(txn, from_path, &src)?;
            txn.put_file_info(&info)?;
            if !same_id {
                txn.put_tombstone(src_id, src.version + 1, src.mtime)?;
            }
            Ok(info)
        })?;

        self.run_commit_actions(core, actions).await?;
        Ok(info)
    }

    /// Bulk purge of every file whose internal name starts with `prefix`
    /// (whole stores or whole objects). Returns the number of rows removed.
    pub async fn delete_under(
        &self,
        core: &mut CoreGuard<'_>,
        prefix: &str,
        retain: Option<bool>,
    ) -> StoreResult<usize> {
        let keep = retain.unwrap_or(self.config.keep_history);

        let (removed, actions) = self.db.with_txn(keep, |txn| {
            let rows = txn.list_names_with_prefix(prefix)?;
            let mut removed = 0usize;
            for (name, id) in rows {
                if let FileState::Live(old) = txn.get_file_state(id)? {
                    // no real path here, archive under the internal name
                    retire_outgoing(txn, &format!("/{}", name), &old)?;
                }
                txn.remove_file(id)?;
                removed += 1;
            }
            txn.after_commit(CommitAction::RemoveStagingUnder(prefix.to_string()));
            Ok(removed)
        })?;

        self.run_commit_actions(core, actions).await?;
        Ok(removed)
    }

    /// Sequenced reader over the id's current live content. Content is
    /// immutable under its hashes, so reads need no core lock.
    pub async fn open_file(&self, file_id: &FileId) -> StoreResult<BlockListReader> {
        let state = self
            .db
            .get_file_state_by_name(&file_id.internal_name())?;
        let FileState::Live(info) = state else {
            return Err(StoreError::NotFound(format!(
                "file not found: {}",
                file_id
            )));
        };
        Ok(self.make_reader(&info))
    }

    pub fn stats(&self) -> StoreResult<EngineStats> {
        Ok(EngineStats {
            live_files: self.db.count_live_files()?,
            total_blocks: self.db.count_blocks()?,
            dead_blocks: self.db.count_dead_blocks()?,
        })
    }

    pub(crate) fn make_reader(&self, info: &FileInfo) -> BlockListReader {
        let backend = self.backend.clone();
        let open_block: OpenBlockFn = Arc::new(move |hash| {
            let backend = backend.clone();
            Box::pin(async move { backend.open_block(&hash).await.map_err(Into::into) })
        });
        BlockListReader::new(
            info.content_hash.clone(),
            info.length,
            self.config.block_size,
            open_block,
        )
    }

    /// Fire commit-only side effects. Staging cleanup is best-effort and
    /// idempotent; a cooperative abort from the sweep still propagates.
    pub(crate) async fn run_commit_actions(
        &self,
        core: &mut CoreGuard<'_>,
        actions: Vec<CommitAction>,
    ) -> StoreResult<()> {
        for action in actions {
            match action {
                CommitAction::RemoveStaging(path) => {
                    if let Err(e) = fs::remove_file(&path).await {
                        if e.kind() != std::io::ErrorKind::NotFound {
                            warn!(
                                "BlockStoreEngine: remove staging {} failed! {}",
                                path.to_string_lossy(),
                                e
                            );
                        }
                    }
                }
                CommitAction::RemoveStagingUnder(prefix) => {
                    let dir = staging_dir_for_prefix(&self.staging_dir, &prefix);
                    if let Err(e) = fs::remove_dir_all(&dir).await {
                        if e.kind() != std::io::ErrorKind::NotFound {
                            warn!(
                                "BlockStoreEngine: remove staging under {} failed! {}",
                                dir.to_string_lossy(),
                                e
                            );
                        }
                    }
                }
                CommitAction::SweepDeadBlocks => {
                    crate::collector::sweep_best_effort(&self.collector, core).await?;
                }
            }
        }
        Ok(())
    }
}

/// Bump the refcount of every block the new version references.
fn reference_manifest(
    txn: &mut MetaTxn<'_>,
    manifest: &ContentHash,
    length: u64,
    block_size: u64,
) -> StoreResult<()> {
    for (index, hash) in manifest.iter().enumerate() {
        txn.inc_block_count(&hash, block_span(index, length, block_size))?;
    }
    Ok(())
}

/// Route an outgoing live version through the history/deref decision: with
/// retention it is archived and its refcounts stay put, otherwise every
/// referenced block is dereferenced and a sweep is scheduled for after
/// commit.
fn retire_outgoing(txn: &mut MetaTxn<'_>, path: &str, outgoing: &FileInfo) -> StoreResult<()> {
    if txn.keep_history() {
        txn.preserve_file_info(path, outgoing)?;
    } else {
        for hash in outgoing.content_hash.iter() {
            txn.dec_block_count(&hash)?;
        }
        txn.after_commit(CommitAction::SweepDeadBlocks);
    }
    Ok(())
}
