mod backend;
mod core_lock;
mod hash;

pub use backend::*;
pub use core_lock::*;
pub use hash::*;

use thiserror::Error;

#[macro_use]
extern crate log;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("internal error: {0}")]
    Internal(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("I/O error: {0}")]
    IoError(String),
    #[error("db error: {0}")]
    DbError(String),
    #[error("invalid data: {0}")]
    InvalidData(String),
    #[error("invalid param: {0}")]
    InvalidParam(String),
    #[error("offset too large: {0}")]
    OffsetTooLarge(String),
    #[error("block integrity violation: {0}")]
    Integrity(String),
    #[error("invalid revision token: {0}")]
    InvalidRevision(String),
    #[error("aborted while suspended: {0}")]
    Aborted(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StoreError::NotFound(_) | StoreError::AlreadyExists(_)
        )
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::IoError(err.to_string())
    }
}

impl From<StoreError> for std::io::Error {
    fn from(err: StoreError) -> Self {
        std::io::Error::new(std::io::ErrorKind::Other, err.to_string())
    }
}

/// Default block size for the chunking pipeline. Backends see blocks of at
/// most this many decoded bytes.
pub const BLOCK_DEFAULT_SIZE: u64 = 1024 * 1024;
