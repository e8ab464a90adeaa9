use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical identity of one file incarnation: which store it lives in, which
/// synced object it belongs to, and which branch of that object. Storage
/// addressing always goes through the internal name derived from this
/// triple; hierarchical paths are only used for history naming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileId {
    pub store_index: u32,
    pub object_id: u64,
    pub branch_index: u32,
}

impl FileId {
    pub fn new(store_index: u32, object_id: u64, branch_index: u32) -> Self {
        Self {
            store_index,
            object_id,
            branch_index,
        }
    }

    /// Deterministic row key. Fixed-width hex keeps lexicographic order equal
    /// to numeric order, so the prefixes below select whole stores/objects.
    pub fn internal_name(&self) -> String {
        format!(
            "{:08x}/{:016x}/{:08x}",
            self.store_index, self.object_id, self.branch_index
        )
    }

    /// Prefix matching every internal name inside one store.
    pub fn store_prefix(store_index: u32) -> String {
        format!("{:08x}/", store_index)
    }

    /// Prefix matching every branch of one object.
    pub fn object_prefix(store_index: u32, object_id: u64) -> String {
        format!("{:08x}/{:016x}/", store_index, object_id)
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.internal_name())
    }
}
