//! HTTP response cache backed by a journaled disk LRU cache
//!
//! Responses are stored under the SHA-256 of their request URL together with
//! an absolute expiry. Stale responses stay on disk until evicted, so callers
//! can still fall back to them.
//!
//! ```no_run
//! use response_cache::{ResponseCache, ResponseCacheConfig};
//!
//! # async fn example() -> response_cache::Result<()> {
//! let cache = ResponseCache::open(ResponseCacheConfig::from_env()).await?;
//! cache.put("https://example.com/", b"<html></html>".to_vec(), None).await?;
//! if let Some(body) = cache.get_fresh("https://example.com/").await? {
//!     println!("{} cached bytes", body.len());
//! }
//! # Ok(())
//! # }
//! ```

mod cache;
mod config;
mod error;

pub use cache::{CachedResponse, Expiry, ResponseCache};
pub use config::ResponseCacheConfig;
pub use disk_lru_cache::CacheStats;
pub use error::{ResponseCacheError, Result};
