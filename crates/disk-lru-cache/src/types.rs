//! Cache types

use serde::{Deserialize, Serialize};

/// Statistics about the cache
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub total_size: u64,
    pub max_size: u64,
    /// Journal records that a rebuild would drop
    pub redundant_ops: usize,
    pub hits: u64,
    pub misses: u64,
}
