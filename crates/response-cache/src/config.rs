//! Configuration for the response cache

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseCacheConfig {
    pub cache_dir: PathBuf,
    /// Bumping this discards everything written by an older version
    pub cache_version: u32,
    pub max_cache_size: u64,
    /// Lifetime of a response stored without an explicit TTL. 0 never expires.
    pub cache_ttl_secs: u64,
}

impl Default for ResponseCacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("./cache/responses"),
            cache_version: 1,
            max_cache_size: 256 * 1024 * 1024, // 256MB
            cache_ttl_secs: 60 * 60,           // 1 hour
        }
    }
}

impl ResponseCacheConfig {
    /// Read `CACHE_DIR`, `CACHE_VERSION`, `MAX_CACHE_SIZE` and
    /// `CACHE_TTL_SECS`, keeping the default for anything unset or unparseable
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let cache_dir = lookup("CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.cache_dir);

        let cache_version = lookup("CACHE_VERSION")
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(defaults.cache_version);

        let max_cache_size = lookup("MAX_CACHE_SIZE")
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|&size| size > 0)
            .unwrap_or(defaults.max_cache_size);

        let cache_ttl_secs = lookup("CACHE_TTL_SECS")
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(defaults.cache_ttl_secs);

        Self {
            cache_dir,
            cache_version,
            max_cache_size,
            cache_ttl_secs,
        }
    }
}
