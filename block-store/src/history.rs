use crate::{
    BlockListReader, BlockStoreEngine, CommitAction, HistoryEntry, MetaTxn, HIST_ROOT_DIR,
};
use block_lib::{CoreGuard, StoreError, StoreResult};
use std::fmt;

/// Opaque handle for one retained version. Callers only round-trip it
/// between `list_history` and `open_revision`/`delete_revision`; the
/// encoding is the metadata store's business.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionToken(String);

impl RevisionToken {
    pub(crate) fn from_parts(id: i64, version: i64) -> Self {
        Self(format!("{:x}.{:x}", id, version))
    }

    pub(crate) fn parse(&self) -> StoreResult<(i64, i64)> {
        let mut parts = self.0.splitn(2, '.');
        let id = parts
            .next()
            .and_then(|s| i64::from_str_radix(s, 16).ok());
        let version = parts
            .next()
            .and_then(|s| i64::from_str_radix(s, 16).ok());
        match (id, version) {
            (Some(id), Some(version)) => Ok((id, version)),
            _ => Err(StoreError::InvalidRevision(self.0.clone())),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RevisionToken {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for RevisionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct RevisionInfo {
    pub token: RevisionToken,
    pub version: i64,
    pub length: u64,
    pub mtime: u64,
}

fn split_history_path(path: &str) -> StoreResult<(String, &str)> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(split_at) => Ok((trimmed[..split_at].to_string(), &trimmed[split_at + 1..])),
        None if !trimmed.is_empty() => Ok((String::new(), trimmed)),
        _ => Err(StoreError::InvalidParam(format!(
            "history path has no file name: {}",
            path
        ))),
    }
}

/// Walk a path inside an open transaction (the non-transactional walk lives
/// on StoreMetaDb).
fn resolve_dir_in_txn(txn: &MetaTxn<'_>, path: &str) -> StoreResult<Option<i64>> {
    let mut dir = HIST_ROOT_DIR;
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        match txn.hist_dir_child(dir, segment)? {
            Some(id) => dir = id,
            None => return Ok(None),
        }
    }
    Ok(Some(dir))
}

/// Revision-history browsing and pruning. History is addressed by the
/// hierarchical path a version was archived under, never by internal name.
impl BlockStoreEngine {
    pub fn list_children(&self, path: &str) -> StoreResult<Vec<HistoryEntry>> {
        let dir = self
            .db
            .resolve_hist_dir(path)?
            .ok_or_else(|| StoreError::NotFound(format!("history path not found: {}", path)))?;
        self.db.list_hist_children(dir)
    }

    /// Retained versions of one file, newest first.
    pub fn list_history(&self, path: &str) -> StoreResult<Vec<RevisionInfo>> {
        let (dir_path, real_name) = split_history_path(path)?;
        let dir = self
            .db
            .resolve_hist_dir(&dir_path)?
            .ok_or_else(|| StoreError::NotFound(format!("history path not found: {}", path)))?;

        let versions = self.db.list_hist_versions(dir, real_name)?;
        Ok(versions
            .into_iter()
            .map(|row| RevisionInfo {
                token: RevisionToken::from_parts(row.id, row.version),
                version: row.version,
                length: row.length,
                mtime: row.mtime,
            })
            .collect())
    }

    /// Open a retained version for sequenced reading. The token must name a
    /// revision archived under `path`.
    pub async fn open_revision(
        &self,
        path: &str,
        token: &RevisionToken,
    ) -> StoreResult<BlockListReader> {
        let (id, version) = token.parse()?;
        let Some((parent_dir, real_name, info)) = self.db.get_history_info(id, version)? else {
            return Err(StoreError::InvalidRevision(token.to_string()));
        };

        let (dir_path, name) = split_history_path(path)?;
        let resolved = self.db.resolve_hist_dir(&dir_path)?;
        if resolved != Some(parent_dir) || name != real_name {
            return Err(StoreError::InvalidRevision(format!(
                "revision {} is not archived under {}",
                token, path
            )));
        }

        Ok(self.make_reader(&info))
    }

    /// Drop one retained version and dereference its blocks.
    pub async fn delete_revision(
        &self,
        core: &mut CoreGuard<'_>,
        path: &str,
        token: &RevisionToken,
    ) -> StoreResult<()> {
        let (id, version) = token.parse()?;
        let (dir_path, name) = split_history_path(path)?;

        let (_, actions) = self.db.with_txn(false, |txn| {
            let Some((parent_dir, real_name, info)) = txn.get_history_info(id, version)? else {
                return Err(StoreError::InvalidRevision(token.to_string()));
            };
            let resolved = resolve_dir_in_txn(txn, &dir_path)?;
            if resolved != Some(parent_dir) || name != real_name {
                return Err(StoreError::InvalidRevision(format!(
                    "revision {} is not archived under {}",
                    token, path
                )));
            }

            for hash in info.content_hash.iter() {
                txn.dec_block_count(&hash)?;
            }
            txn.remove_history_row(id, version)?;
            txn.after_commit(CommitAction::SweepDeadBlocks);
            Ok(())
        })?;

        self.run_commit_actions(core, actions).await?;
        Ok(())
    }

    /// Drop every retained version under `path` (a file or a whole history
    /// subtree) and dereference their blocks. Returns how many revisions
    /// were removed.
    pub async fn delete_all_revisions_under(
        &self,
        core: &mut CoreGuard<'_>,
        path: &str,
    ) -> StoreResult<usize> {
        let (removed, actions) = self.db.with_txn(false, |txn| {
            let mut removed = 0usize;

            if let Some(dir) = resolve_dir_in_txn(txn, path)? {
                // whole subtree: walk directories breadth-first, the batch
                // lives in memory so no cursor outlasts a statement
                let mut pending = vec![dir];
                let mut visited = Vec::new();
                while let Some(current) = pending.pop() {
                    pending.extend(txn.hist_child_dirs(current)?);
                    visited.push(current);
                }

                for dir_id in &visited {
                    for (id, version, content_hash) in txn.hist_files_in_dir(*dir_id, None)? {
                        for hash in content_hash.iter() {
                            txn.dec_block_count(&hash)?;
                        }
                        txn.remove_history_row(id, version)?;
                        removed += 1;
                    }
                }
                for dir_id in visited {
                    if dir_id != HIST_ROOT_DIR {
                        txn.remove_hist_dir(dir_id)?;
                    }
                }
            } else {
                // not a directory: all versions of a single file
                let (dir_path, real_name) = split_history_path(path)?;
                if let Some(dir) = resolve_dir_in_txn(txn, &dir_path)? {
                    for (id, version, content_hash) in
                        txn.hist_files_in_dir(dir, Some(real_name))?
                    {
                        for hash in content_hash.iter() {
                            txn.dec_block_count(&hash)?;
                        }
                        txn.remove_history_row(id, version)?;
                        removed += 1;
                    }
                }
            }

            if removed > 0 {
                txn.after_commit(CommitAction::SweepDeadBlocks);
            }
            Ok(removed)
        })?;

        self.run_commit_actions(core, actions).await?;
        Ok(removed)
    }
}
