use block_lib::{StoreError, StoreResult, BLOCK_DEFAULT_SIZE};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;

const CONFIG_FILE_NAME: &str = "block_store.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockStoreConfig {
    /// Chunking block size in decoded bytes.
    pub block_size: u64,
    /// Return the empty content hash for zero-length files without touching
    /// the backend.
    pub skip_empty_blocks: bool,
    /// Global default for history retention; each transaction may override.
    pub keep_history: bool,
    pub db_file: String,
    pub staging_dir_name: String,
}

impl Default for BlockStoreConfig {
    fn default() -> Self {
        Self {
            block_size: BLOCK_DEFAULT_SIZE,
            skip_empty_blocks: true,
            keep_history: false,
            db_file: "block_store.db".to_string(),
            staging_dir_name: "staging".to_string(),
        }
    }
}

impl BlockStoreConfig {
    /// Load the store config under `root_path`, writing the defaults on
    /// first use the way the daemon bootstraps a fresh store directory.
    pub async fn load_or_init(root_path: &Path) -> StoreResult<Self> {
        let config_path = root_path.join(CONFIG_FILE_NAME);
        if !config_path.exists() {
            let config = Self::default();
            let json = serde_json::to_string_pretty(&config)
                .map_err(|e| StoreError::Internal(e.to_string()))?;
            fs::write(&config_path, json).await.map_err(|e| {
                StoreError::IoError(format!("write store config failed: {}", e))
            })?;
            return Ok(config);
        }

        let json = fs::read_to_string(&config_path).await.map_err(|e| {
            warn!("BlockStoreConfig: read config failed! {}", e);
            StoreError::NotFound("store config not found".to_string())
        })?;
        serde_json::from_str(&json).map_err(|e| {
            warn!("BlockStoreConfig: parse config failed! {}", e);
            StoreError::InvalidData("store config invalid".to_string())
        })
    }
}
