use block_lib::{BlockHash, ContentHash, StoreError, StoreResult};
use rusqlite::types::{FromSql, ToSql, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Root of the lazily mirrored history directory tree. Real dir rows get
/// AUTOINCREMENT ids starting at 1.
pub const HIST_ROOT_DIR: i64 = 0;

#[derive(Debug, Clone, PartialEq)]
pub struct FileInfo {
    pub id: i64,
    pub version: i64,
    pub length: u64,
    pub mtime: u64,
    pub content_hash: ContentHash,
}

/// Explicit three-state row model; the absent/live/tombstoned distinction
/// never travels as sentinel lengths in code.
#[derive(Debug, Clone, PartialEq)]
pub enum FileState {
    Absent,
    Live(FileInfo),
    Deleted { version: i64, mtime: u64 },
}

impl FileState {
    pub fn is_live(&self) -> bool {
        matches!(self, FileState::Live(_))
    }

    /// Version to assign to the next written row for this id.
    pub fn next_version(&self) -> i64 {
        match self {
            FileState::Absent => 0,
            FileState::Live(info) => info.version + 1,
            FileState::Deleted { version, .. } => version + 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockCountState {
    /// A chunking pass is writing the block right now.
    Storing,
    /// The backend write finished; no file version references it yet.
    Stored,
    /// At least one live or retained file version has referenced it.
    Referenced,
}

impl BlockCountState {
    pub fn from_str(s: &str) -> Self {
        match s {
            "storing" => BlockCountState::Storing,
            "stored" => BlockCountState::Stored,
            "referenced" => BlockCountState::Referenced,
            _ => BlockCountState::Storing,
        }
    }

    pub fn to_str(&self) -> &'static str {
        match self {
            BlockCountState::Storing => "storing",
            BlockCountState::Stored => "stored",
            BlockCountState::Referenced => "referenced",
        }
    }
}

impl ToSql for BlockCountState {
    fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
        Ok(self.to_str().into())
    }
}

impl FromSql for BlockCountState {
    fn column_result(value: ValueRef<'_>) -> rusqlite::types::FromSqlResult<Self> {
        let s = value.as_str().unwrap_or("storing");
        Ok(BlockCountState::from_str(s))
    }
}

#[derive(Debug, Clone)]
pub struct BlockCount {
    pub hash: BlockHash,
    pub block_size: u64,
    pub state: BlockCountState,
    pub ref_count: i64,
}

/// A retained version row, as listed by the history queries.
#[derive(Debug, Clone)]
pub struct HistVersionRow {
    pub id: i64,
    pub version: i64,
    pub length: u64,
    pub mtime: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub name: String,
    pub is_dir: bool,
}

/// Side effects that must happen only if the owning transaction commits.
/// The engine fires them after `with_txn` returns; a rollback drops them.
#[derive(Debug, Clone)]
pub enum CommitAction {
    RemoveStaging(PathBuf),
    RemoveStagingUnder(String),
    SweepDeadBlocks,
}

pub struct MetaTxn<'a> {
    tx: Transaction<'a>,
    keep_history: bool,
    actions: Vec<CommitAction>,
}

pub struct StoreMetaDb {
    pub db_path: String,
    conn: Mutex<Connection>,
}

impl StoreMetaDb {
    pub fn new(db_path: String) -> StoreResult<Self> {
        debug!("StoreMetaDb: new db path: {}", db_path);
        let conn = Connection::open(&db_path).map_err(|e| {
            warn!("StoreMetaDb: open db failed! {}", e.to_string());
            StoreError::DbError(e.to_string())
        })?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS file_index (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                internal_name TEXT NOT NULL UNIQUE
            )",
            [],
        )
        .map_err(|e| {
            warn!("StoreMetaDb: create file_index failed! {}", e.to_string());
            StoreError::DbError(e.to_string())
        })?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS file_current (
                id INTEGER PRIMARY KEY,
                version INTEGER NOT NULL,
                length INTEGER NOT NULL,
                mtime INTEGER NOT NULL,
                deleted INTEGER NOT NULL DEFAULT 0,
                content_hash BLOB NOT NULL
            )",
            [],
        )
        .map_err(|e| {
            warn!("StoreMetaDb: create file_current failed! {}", e.to_string());
            StoreError::DbError(e.to_string())
        })?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS file_history (
                id INTEGER NOT NULL,
                version INTEGER NOT NULL,
                parent_dir INTEGER NOT NULL,
                real_name TEXT NOT NULL,
                length INTEGER NOT NULL,
                mtime INTEGER NOT NULL,
                content_hash BLOB NOT NULL,
                PRIMARY KEY (id, version)
            )",
            [],
        )
        .map_err(|e| {
            warn!("StoreMetaDb: create file_history failed! {}", e.to_string());
            StoreError::DbError(e.to_string())
        })?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_file_history_dir
             ON file_history(parent_dir, real_name)",
            [],
        )
        .map_err(|e| {
            warn!("StoreMetaDb: create history index failed! {}", e.to_string());
            StoreError::DbError(e.to_string())
        })?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS hist_dirs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                parent INTEGER NOT NULL,
                name TEXT NOT NULL,
                UNIQUE (parent, name)
            )",
            [],
        )
        .map_err(|e| {
            warn!("StoreMetaDb: create hist_dirs failed! {}", e.to_string());
            StoreError::DbError(e.to_string())
        })?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS block_counts (
                hash TEXT PRIMARY KEY,
                block_size INTEGER NOT NULL,
                state TEXT NOT NULL,
                ref_count INTEGER NOT NULL DEFAULT 0,
                update_time INTEGER NOT NULL
            )",
            [],
        )
        .map_err(|e| {
            warn!("StoreMetaDb: create block_counts failed! {}", e.to_string());
            StoreError::DbError(e.to_string())
        })?;

        Ok(Self {
            db_path,
            conn: Mutex::new(conn),
        })
    }

    /// Run `f` inside one transaction; commit is the atomicity boundary.
    /// Commit-only actions registered by `f` come back to the caller only
    /// after the commit succeeded, never on rollback.
    pub fn with_txn<T>(
        &self,
        keep_history: bool,
        f: impl FnOnce(&mut MetaTxn<'_>) -> StoreResult<T>,
    ) -> StoreResult<(T, Vec<CommitAction>)> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(|e| {
            warn!("StoreMetaDb: open transaction failed! {}", e.to_string());
            StoreError::DbError(e.to_string())
        })?;

        let mut txn = MetaTxn {
            tx,
            keep_history,
            actions: Vec::new(),
        };
        let value = f(&mut txn)?;

        let MetaTxn { tx, actions, .. } = txn;
        tx.commit().map_err(|e| {
            warn!("StoreMetaDb: commit failed! {}", e.to_string());
            StoreError::DbError(e.to_string())
        })?;
        Ok((value, actions))
    }

    // ---- block bookkeeping (single statements, used by the chunker while
    // ---- holding the core lock; no enclosing transaction needed)

    pub fn get_block_state(&self, hash: &BlockHash) -> StoreResult<Option<BlockCountState>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT state FROM block_counts WHERE hash = ?1",
            params![hash.to_hex()],
            |row| row.get::<_, BlockCountState>(0),
        )
        .optional()
        .map_err(|e| {
            warn!("StoreMetaDb: get block state failed! {}", e.to_string());
            StoreError::DbError(e.to_string())
        })
    }

    pub fn get_block_count(&self, hash: &BlockHash) -> StoreResult<Option<BlockCount>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT block_size, state, ref_count FROM block_counts WHERE hash = ?1",
            params![hash.to_hex()],
            |row| {
                Ok(BlockCount {
                    hash: *hash,
                    block_size: row.get::<_, i64>(0)? as u64,
                    state: row.get(1)?,
                    ref_count: row.get(2)?,
                })
            },
        )
        .optional()
        .map_err(|e| {
            warn!("StoreMetaDb: get block count failed! {}", e.to_string());
            StoreError::DbError(e.to_string())
        })
    }

    /// Mark a block as being written. Keeps any existing ref_count; a dead
    /// block being rewritten leaves the collector's reach until the write
    /// settles.
    pub fn pre_put_block(&self, hash: &BlockHash, block_size: u64) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO block_counts (hash, block_size, state, ref_count, update_time)
             VALUES (?1, ?2, 'storing', 0, ?3)
             ON CONFLICT(hash) DO UPDATE SET
                 state = 'storing',
                 block_size = excluded.block_size,
                 update_time = excluded.update_time",
            params![hash.to_hex(), block_size as i64, unix_timestamp() as i64],
        )
        .map_err(|e| {
            warn!("StoreMetaDb: pre put block failed! {}", e.to_string());
            StoreError::DbError(e.to_string())
        })?;
        Ok(())
    }

    /// Promote a settled write to stored. Never demotes a block that picked
    /// up a reference in the meantime.
    pub fn post_put_block(&self, hash: &BlockHash) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE block_counts SET state = 'stored', update_time = ?1
             WHERE hash = ?2 AND state = 'storing'",
            params![unix_timestamp() as i64, hash.to_hex()],
        )
        .map_err(|e| {
            warn!("StoreMetaDb: post put block failed! {}", e.to_string());
            StoreError::DbError(e.to_string())
        })?;
        Ok(())
    }

    // ---- dead-block collection

    /// Hashes currently eligible for backend deletion. The caller gets a
    /// plain Vec, never a live cursor, so nothing DB-held can survive a
    /// cooperative suspend.
    pub fn get_dead_blocks(&self, limit: usize) -> StoreResult<Vec<BlockHash>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT hash FROM block_counts
                 WHERE ref_count = 0 AND state = 'referenced'
                 LIMIT ?1",
            )
            .map_err(|e| StoreError::DbError(e.to_string()))?;

        let rows = stmt
            .query_map(params![limit as i64], |row| row.get::<_, String>(0))
            .map_err(|e| {
                warn!("StoreMetaDb: query dead blocks failed! {}", e.to_string());
                StoreError::DbError(e.to_string())
            })?;

        let mut dead = Vec::new();
        for row in rows {
            let hex_str = row.map_err(|e| StoreError::DbError(e.to_string()))?;
            dead.push(BlockHash::from_hex(&hex_str)?);
        }
        Ok(dead)
    }

    /// Drop one dead block row. The guard re-checks eligibility so a
    /// reference picked up since the batch was fetched keeps the row.
    pub fn remove_dead_block(&self, hash: &BlockHash) -> StoreResult<bool> {
        let conn = self.conn.lock().unwrap();
        let removed = conn
            .execute(
                "DELETE FROM block_counts
                 WHERE hash = ?1 AND ref_count = 0 AND state = 'referenced'",
                params![hash.to_hex()],
            )
            .map_err(|e| {
                warn!("StoreMetaDb: remove dead block failed! {}", e.to_string());
                StoreError::DbError(e.to_string())
            })?;
        Ok(removed > 0)
    }

    // ---- plain reads used outside any engine transaction

    pub fn get_file_index(&self, internal_name: &str) -> StoreResult<Option<i64>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id FROM file_index WHERE internal_name = ?1",
            params![internal_name],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| StoreError::DbError(e.to_string()))
    }

    pub fn get_file_state(&self, id: i64) -> StoreResult<FileState> {
        let conn = self.conn.lock().unwrap();
        read_file_state(&conn, id)
    }

    pub fn get_file_state_by_name(&self, internal_name: &str) -> StoreResult<FileState> {
        match self.get_file_index(internal_name)? {
            Some(id) => self.get_file_state(id),
            None => Ok(FileState::Absent),
        }
    }

    // ---- history reads

    /// Walk a slash path down the mirrored history tree. `/` is the root.
    pub fn resolve_hist_dir(&self, path: &str) -> StoreResult<Option<i64>> {
        let conn = self.conn.lock().unwrap();
        let mut dir = HIST_ROOT_DIR;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            let child: Option<i64> = conn
                .query_row(
                    "SELECT id FROM hist_dirs WHERE parent = ?1 AND name = ?2",
                    params![dir, segment],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| StoreError::DbError(e.to_string()))?;
            match child {
                Some(id) => dir = id,
                None => return Ok(None),
            }
        }
        Ok(Some(dir))
    }

    pub fn list_hist_children(&self, dir_id: i64) -> StoreResult<Vec<HistoryEntry>> {
        let conn = self.conn.lock().unwrap();
        let mut entries = Vec::new();

        let mut stmt = conn
            .prepare("SELECT name FROM hist_dirs WHERE parent = ?1 ORDER BY name")
            .map_err(|e| StoreError::DbError(e.to_string()))?;
        let dirs = stmt
            .query_map(params![dir_id], |row| row.get::<_, String>(0))
            .map_err(|e| StoreError::DbError(e.to_string()))?;
        for name in dirs {
            entries.push(HistoryEntry {
                name: name.map_err(|e| StoreError::DbError(e.to_string()))?,
                is_dir: true,
            });
        }

        let mut stmt = conn
            .prepare(
                "SELECT DISTINCT real_name FROM file_history
                 WHERE parent_dir = ?1 ORDER BY real_name",
            )
            .map_err(|e| StoreError::DbError(e.to_string()))?;
        let files = stmt
            .query_map(params![dir_id], |row| row.get::<_, String>(0))
            .map_err(|e| StoreError::DbError(e.to_string()))?;
        for name in files {
            entries.push(HistoryEntry {
                name: name.map_err(|e| StoreError::DbError(e.to_string()))?,
                is_dir: false,
            });
        }

        Ok(entries)
    }

    pub fn list_hist_versions(
        &self,
        dir_id: i64,
        real_name: &str,
    ) -> StoreResult<Vec<HistVersionRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT id, version, length, mtime FROM file_history
                 WHERE parent_dir = ?1 AND real_name = ?2
                 ORDER BY version DESC",
            )
            .map_err(|e| StoreError::DbError(e.to_string()))?;

        let rows = stmt
            .query_map(params![dir_id, real_name], |row| {
                Ok(HistVersionRow {
                    id: row.get(0)?,
                    version: row.get(1)?,
                    length: row.get::<_, i64>(2)? as u64,
                    mtime: row.get::<_, i64>(3)? as u64,
                })
            })
            .map_err(|e| StoreError::DbError(e.to_string()))?;

        let mut versions = Vec::new();
        for row in rows {
            versions.push(row.map_err(|e| StoreError::DbError(e.to_string()))?);
        }
        Ok(versions)
    }

    /// Load one retained version, with the dir/name it was archived under.
    pub fn get_history_info(
        &self,
        id: i64,
        version: i64,
    ) -> StoreResult<Option<(i64, String, FileInfo)>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT parent_dir, real_name, length, mtime, content_hash
             FROM file_history WHERE id = ?1 AND version = ?2",
            params![id, version],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)? as u64,
                    row.get::<_, i64>(3)? as u64,
                    row.get::<_, Vec<u8>>(4)?,
                ))
            },
        )
        .optional()
        .map_err(|e| StoreError::DbError(e.to_string()))?
        .map(|(parent_dir, real_name, length, mtime, raw)| {
            let content_hash = ContentHash::from_bytes(raw)?;
            Ok((
                parent_dir,
                real_name,
                FileInfo {
                    id,
                    version,
                    length,
                    mtime,
                    content_hash,
                },
            ))
        })
        .transpose()
    }

    // ---- counters for the daemon's UI

    pub fn count_live_files(&self) -> StoreResult<u64> {
        self.count_query("SELECT COUNT(*) FROM file_current WHERE deleted = 0")
    }

    pub fn count_blocks(&self) -> StoreResult<u64> {
        self.count_query("SELECT COUNT(*) FROM block_counts")
    }

    pub fn count_dead_blocks(&self) -> StoreResult<u64> {
        self.count_query(
            "SELECT COUNT(*) FROM block_counts WHERE ref_count = 0 AND state = 'referenced'",
        )
    }

    fn count_query(&self, sql: &str) -> StoreResult<u64> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(sql, [], |row| row.get::<_, i64>(0))
            .map(|n| n as u64)
            .map_err(|e| StoreError::DbError(e.to_string()))
    }
}

fn read_file_state(conn: &Connection, id: i64) -> StoreResult<FileState> {
    let row = conn
        .query_row(
            "SELECT version, length, mtime, deleted, content_hash
             FROM file_current WHERE id = ?1",
            params![id],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)? as u64,
                    row.get::<_, i64>(2)? as u64,
                    row.get::<_, i64>(3)?,
                    row.get::<_, Vec<u8>>(4)?,
                ))
            },
        )
        .optional()
        .map_err(|e| {
            warn!("StoreMetaDb: get file state failed! {}", e.to_string());
            StoreError::DbError(e.to_string())
        })?;

    match row {
        None => Ok(FileState::Absent),
        Some((version, _, mtime, deleted, _)) if deleted != 0 => {
            Ok(FileState::Deleted { version, mtime })
        }
        Some((version, length, mtime, _, raw)) => Ok(FileState::Live(FileInfo {
            id,
            version,
            length,
            mtime,
            content_hash: ContentHash::from_bytes(raw)?,
        })),
    }
}

impl<'a> MetaTxn<'a> {
    pub fn keep_history(&self) -> bool {
        self.keep_history
    }

    pub fn after_commit(&mut self, action: CommitAction) {
        self.actions.push(action);
    }

    pub fn get_or_create_file_index(&self, internal_name: &str) -> StoreResult<i64> {
        self.tx
            .execute(
                "INSERT OR IGNORE INTO file_index (internal_name) VALUES (?1)",
                params![internal_name],
            )
            .map_err(|e| {
                warn!("StoreMetaDb: create file index failed! {}", e.to_string());
                StoreError::DbError(e.to_string())
            })?;
        self.tx
            .query_row(
                "SELECT id FROM file_index WHERE internal_name = ?1",
                params![internal_name],
                |row| row.get(0),
            )
            .map_err(|e| StoreError::DbError(e.to_string()))
    }

    pub fn get_file_index(&self, internal_name: &str) -> StoreResult<Option<i64>> {
        self.tx
            .query_row(
                "SELECT id FROM file_index WHERE internal_name = ?1",
                params![internal_name],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| StoreError::DbError(e.to_string()))
    }

    pub fn get_file_state(&self, id: i64) -> StoreResult<FileState> {
        read_file_state(&self.tx, id)
    }

    pub fn put_file_info(&self, info: &FileInfo) -> StoreResult<()> {
        self.tx
            .execute(
                "INSERT OR REPLACE INTO file_current
                 (id, version, length, mtime, deleted, content_hash)
                 VALUES (?1, ?2, ?3, ?4, 0, ?5)",
                params![
                    info.id,
                    info.version,
                    info.length as i64,
                    info.mtime as i64,
                    info.content_hash.as_bytes(),
                ],
            )
            .map_err(|e| {
                warn!("StoreMetaDb: put file info failed! {}", e.to_string());
                StoreError::DbError(e.to_string())
            })?;
        Ok(())
    }

    pub fn put_tombstone(&self, id: i64, version: i64, mtime: u64) -> StoreResult<()> {
        self.tx
            .execute(
                "INSERT OR REPLACE INTO file_current
                 (id, version, length, mtime, deleted, content_hash)
                 VALUES (?1, ?2, 0, ?3, 1, X'')",
                params![id, version, mtime as i64],
            )
            .map_err(|e| {
                warn!("StoreMetaDb: put tombstone failed! {}", e.to_string());
                StoreError::DbError(e.to_string())
            })?;
        Ok(())
    }

    /// Hard-remove a file row and its index entry (bulk purge path).
    pub fn remove_file(&self, id: i64) -> StoreResult<()> {
        self.tx
            .execute("DELETE FROM file_current WHERE id = ?1", params![id])
            .map_err(|e| StoreError::DbError(e.to_string()))?;
        self.tx
            .execute("DELETE FROM file_index WHERE id = ?1", params![id])
            .map_err(|e| StoreError::DbError(e.to_string()))?;
        Ok(())
    }

    pub fn list_names_with_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, i64)>> {
        let mut stmt = self
            .tx
            .prepare(
                "SELECT internal_name, id FROM file_index
                 WHERE internal_name LIKE ?1 || '%' ORDER BY internal_name",
            )
            .map_err(|e| StoreError::DbError(e.to_string()))?;

        let rows = stmt
            .query_map(params![prefix], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .map_err(|e| {
                warn!("StoreMetaDb: prefix scan failed! {}", e.to_string());
                StoreError::DbError(e.to_string())
            })?;

        let mut names = Vec::new();
        for row in rows {
            names.push(row.map_err(|e| StoreError::DbError(e.to_string()))?);
        }
        Ok(names)
    }

    // ---- block refcounts

    pub fn inc_block_count(&self, hash: &BlockHash, block_size: u64) -> StoreResult<()> {
        self.tx
            .execute(
                "INSERT INTO block_counts (hash, block_size, state, ref_count, update_time)
                 VALUES (?1, ?2, 'referenced', 1, ?3)
                 ON CONFLICT(hash) DO UPDATE SET
                     ref_count = ref_count + 1,
                     state = 'referenced',
                     update_time = excluded.update_time",
                params![hash.to_hex(), block_size as i64, unix_timestamp() as i64],
            )
            .map_err(|e| {
                warn!("StoreMetaDb: inc block count failed! {}", e.to_string());
                StoreError::DbError(e.to_string())
            })?;
        Ok(())
    }

    /// Floor at zero; a double-decrement must never produce a negative count.
    pub fn dec_block_count(&self, hash: &BlockHash) -> StoreResult<()> {
        self.tx
            .execute(
                "UPDATE block_counts
                 SET ref_count = MAX(ref_count - 1, 0), update_time = ?1
                 WHERE hash = ?2",
                params![unix_timestamp() as i64, hash.to_hex()],
            )
            .map_err(|e| {
                warn!("StoreMetaDb: dec block count failed! {}", e.to_string());
                StoreError::DbError(e.to_string())
            })?;
        Ok(())
    }

    // ---- history writes

    fn get_or_create_hist_dir(&self, parent: i64, name: &str) -> StoreResult<i64> {
        self.tx
            .execute(
                "INSERT OR IGNORE INTO hist_dirs (parent, name) VALUES (?1, ?2)",
                params![parent, name],
            )
            .map_err(|e| {
                warn!("StoreMetaDb: create hist dir failed! {}", e.to_string());
                StoreError::DbError(e.to_string())
            })?;
        self.tx
            .query_row(
                "SELECT id FROM hist_dirs WHERE parent = ?1 AND name = ?2",
                params![parent, name],
                |row| row.get(0),
            )
            .map_err(|e| StoreError::DbError(e.to_string()))
    }

    /// Snapshot an outgoing version into history under `path`, mirroring any
    /// missing directory ancestors along the way.
    pub fn preserve_file_info(&self, path: &str, info: &FileInfo) -> StoreResult<()> {
        let mut segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let real_name = segments.pop().ok_or_else(|| {
            StoreError::InvalidParam(format!("history path has no file name: {}", path))
        })?;

        let mut dir = HIST_ROOT_DIR;
        for segment in segments {
            dir = self.get_or_create_hist_dir(dir, segment)?;
        }

        self.tx
            .execute(
                "INSERT OR REPLACE INTO file_history
                 (id, version, parent_dir, real_name, length, mtime, content_hash)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    info.id,
                    info.version,
                    dir,
                    real_name,
                    info.length as i64,
                    info.mtime as i64,
                    info.content_hash.as_bytes(),
                ],
            )
            .map_err(|e| {
                warn!("StoreMetaDb: preserve file info failed! {}", e.to_string());
                StoreError::DbError(e.to_string())
            })?;
        Ok(())
    }

    pub fn get_history_info(
        &self,
        id: i64,
        version: i64,
    ) -> StoreResult<Option<(i64, String, FileInfo)>> {
        self.tx
            .query_row(
                "SELECT parent_dir, real_name, length, mtime, content_hash
                 FROM file_history WHERE id = ?1 AND version = ?2",
                params![id, version],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)? as u64,
                        row.get::<_, i64>(3)? as u64,
                        row.get::<_, Vec<u8>>(4)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| StoreError::DbError(e.to_string()))?
            .map(|(parent_dir, real_name, length, mtime, raw)| {
                let content_hash = ContentHash::from_bytes(raw)?;
                Ok((
                    parent_dir,
                    real_name,
                    FileInfo {
                        id,
                        version,
                        length,
                        mtime,
                        content_hash,
                    },
                ))
            })
            .transpose()
    }

    pub fn remove_history_row(&self, id: i64, version: i64) -> StoreResult<()> {
        self.tx
            .execute(
                "DELETE FROM file_history WHERE id = ?1 AND version = ?2",
                params![id, version],
            )
            .map_err(|e| StoreError::DbError(e.to_string()))?;
        Ok(())
    }

    pub fn hist_dir_child(&self, parent: i64, name: &str) -> StoreResult<Option<i64>> {
        self.tx
            .query_row(
                "SELECT id FROM hist_dirs WHERE parent = ?1 AND name = ?2",
                params![parent, name],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| StoreError::DbError(e.to_string()))
    }

    pub fn hist_child_dirs(&self, parent: i64) -> StoreResult<Vec<i64>> {
        let mut stmt = self
            .tx
            .prepare("SELECT id FROM hist_dirs WHERE parent = ?1")
            .map_err(|e| StoreError::DbError(e.to_string()))?;
        let rows = stmt
            .query_map(params![parent], |row| row.get::<_, i64>(0))
            .map_err(|e| StoreError::DbError(e.to_string()))?;

        let mut dirs = Vec::new();
        for row in rows {
            dirs.push(row.map_err(|e| StoreError::DbError(e.to_string()))?);
        }
        Ok(dirs)
    }

    /// All retained versions archived directly under one history dir,
    /// optionally restricted to one file name.
    pub fn hist_files_in_dir(
        &self,
        dir_id: i64,
        real_name: Option<&str>,
    ) -> StoreResult<Vec<(i64, i64, ContentHash)>> {
        let mut stmt = self
            .tx
            .prepare(
                "SELECT id, version, content_hash FROM file_history
                 WHERE parent_dir = ?1 AND (?2 IS NULL OR real_name = ?2)",
            )
            .map_err(|e| StoreError::DbError(e.to_string()))?;

        let rows = stmt
            .query_map(params![dir_id, real_name], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                ))
            })
            .map_err(|e| StoreError::DbError(e.to_string()))?;

        let mut files = Vec::new();
        for row in rows {
            let (id, version, raw) = row.map_err(|e| StoreError::DbError(e.to_string()))?;
            files.push((id, version, ContentHash::from_bytes(raw)?));
        }
        Ok(files)
    }

    pub fn remove_hist_dir(&self, dir_id: i64) -> StoreResult<()> {
        self.tx
            .execute("DELETE FROM hist_dirs WHERE id = ?1", params![dir_id])
            .map_err(|e| StoreError::DbError(e.to_string()))?;
        Ok(())
    }
}
