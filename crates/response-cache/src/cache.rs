//! Expiring response storage on top of the disk cache
//!
//! Each response occupies one entry of a two-slot [`DiskLruCache`]: slot 0
//! holds the body bytes, slot 1 the absolute expiry as decimal milliseconds
//! since the Unix epoch (`0` for responses that never expire).

use crate::config::ResponseCacheConfig;
use crate::error::Result;
use chrono::{DateTime, Utc};
use disk_lru_cache::{CacheStats, DiskLruCache};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::io::{Read, Write};
use tokio::sync::RwLock;
use tracing::{debug, info};

const BODY_SLOT: usize = 0;
const EXPIRY_SLOT: usize = 1;
const VALUE_COUNT: usize = 2;

/// When a cached response stops being fresh
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Expiry {
    Never,
    At(DateTime<Utc>),
    /// The stored timestamp could not be parsed; treated as expired
    Unknown,
}

impl Expiry {
    fn after_ttl(now: DateTime<Utc>, ttl_secs: u64) -> Self {
        if ttl_secs == 0 {
            return Expiry::Never;
        }
        i64::try_from(ttl_secs)
            .ok()
            .and_then(|secs| secs.checked_mul(1000))
            .and_then(|ms| now.timestamp_millis().checked_add(ms))
            .and_then(DateTime::from_timestamp_millis)
            .map(Expiry::At)
            .unwrap_or(Expiry::Never)
    }

    fn parse(value: &str) -> Self {
        match value.trim().parse::<i64>() {
            Ok(0) => Expiry::Never,
            Ok(ms) if ms > 0 => DateTime::from_timestamp_millis(ms)
                .map(Expiry::At)
                .unwrap_or(Expiry::Unknown),
            _ => Expiry::Unknown,
        }
    }

    fn encode(&self) -> String {
        match self {
            Expiry::Never | Expiry::Unknown => "0".to_string(),
            Expiry::At(at) => at.timestamp_millis().to_string(),
        }
    }
}

/// A response read back from the cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
    pub body: Vec<u8>,
    pub expiry: Expiry,
}

impl CachedResponse {
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        match self.expiry {
            Expiry::Never => true,
            Expiry::At(at) => now < at,
            Expiry::Unknown => false,
        }
    }
}

/// Async facade over a [`DiskLruCache`] keyed by request URL
pub struct ResponseCache {
    config: ResponseCacheConfig,
    disk: RwLock<DiskLruCache>,
}

impl ResponseCache {
    /// Open (or create) the cache described by `config`
    pub async fn open(config: ResponseCacheConfig) -> Result<Self> {
        let disk = open_disk(config.clone()).await?;
        info!(
            cache_dir = ?config.cache_dir,
            entries = disk.stats().entries,
            "Response cache ready"
        );
        Ok(Self {
            config,
            disk: RwLock::new(disk),
        })
    }

    /// Generate a cache key from a request URL
    pub fn cache_key(url: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(url.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn config(&self) -> &ResponseCacheConfig {
        &self.config
    }

    /// The stored response for `url`, fresh or not
    pub async fn get(&self, url: &str) -> Result<Option<CachedResponse>> {
        let key = Self::cache_key(url);
        let response = self
            .with_disk(move |disk| {
                let Some(mut snapshot) = disk.get(&key)? else {
                    return Ok(None);
                };
                let mut body = Vec::new();
                snapshot.input_stream(BODY_SLOT)?.read_to_end(&mut body)?;
                let expiry = Expiry::parse(&snapshot.get_string(EXPIRY_SLOT)?);
                Ok(Some(CachedResponse { body, expiry }))
            })
            .await?;

        debug!(url, hit = response.is_some(), "Response cache lookup");
        Ok(response)
    }

    /// The stored body for `url` if it has not expired yet
    pub async fn get_fresh(&self, url: &str) -> Result<Option<Vec<u8>>> {
        let now = Utc::now();
        Ok(self
            .get(url)
            .await?
            .filter(|response| response.is_fresh(now))
            .map(|response| response.body))
    }

    /// Store `body` for `url`, expiring after `ttl_secs` (the configured
    /// default when `None`, never when 0). Returns false without writing when
    /// another writer holds the entry.
    pub async fn put(&self, url: &str, body: Vec<u8>, ttl_secs: Option<u64>) -> Result<bool> {
        let key = Self::cache_key(url);
        let ttl_secs = ttl_secs.unwrap_or(self.config.cache_ttl_secs);
        let expiry = Expiry::after_ttl(Utc::now(), ttl_secs);
        let size = body.len();

        let stored = self
            .with_disk(move |disk| {
                let Some(mut editor) = disk.edit(&key)? else {
                    return Ok(false);
                };
                editor.set_string(EXPIRY_SLOT, &expiry.encode())?;
                {
                    let mut out = editor.new_output_stream(BODY_SLOT)?;
                    out.write_all(&body)?;
                }
                editor.commit()?;
                disk.flush()?;
                Ok(true)
            })
            .await?;

        if stored {
            debug!(url, size, ttl_secs, "Stored response");
        } else {
            debug!(url, "Response is being written elsewhere, skipped");
        }
        Ok(stored)
    }

    /// Mark the response for `url` as expired while keeping its body.
    /// Returns false if there is nothing to expire or the entry is busy.
    pub async fn expire_now(&self, url: &str) -> Result<bool> {
        let key = Self::cache_key(url);
        let now = Expiry::At(Utc::now());

        let expired = self
            .with_disk(move |disk| {
                let Some(snapshot) = disk.get(&key)? else {
                    return Ok(false);
                };
                let Some(mut editor) = snapshot.edit()? else {
                    return Ok(false);
                };
                editor.set_string(EXPIRY_SLOT, &now.encode())?;
                editor.commit()?;
                disk.flush()?;
                Ok(true)
            })
            .await?;

        debug!(url, expired, "Forced response expiry");
        Ok(expired)
    }

    pub async fn remove(&self, url: &str) -> Result<bool> {
        let key = Self::cache_key(url);
        self.with_disk(move |disk| Ok(disk.remove(&key)?)).await
    }

    pub async fn stats(&self) -> CacheStats {
        self.disk.read().await.stats()
    }

    pub async fn close(&self) -> Result<()> {
        self.with_disk(|disk| Ok(disk.close()?)).await
    }

    /// Delete every stored response and start over with an empty cache
    pub async fn clear(&self) -> Result<()> {
        let mut disk = self.disk.write().await;
        let old = disk.clone();
        tokio::task::spawn_blocking(move || old.delete()).await??;
        *disk = open_disk(self.config.clone()).await?;
        info!(cache_dir = ?self.config.cache_dir, "Response cache cleared");
        Ok(())
    }

    /// Run a blocking cache operation off the async runtime. The read lock is
    /// held throughout so `clear` cannot swap the cache underneath it.
    async fn with_disk<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(DiskLruCache) -> Result<T> + Send + 'static,
    {
        let guard = self.disk.read().await;
        let disk = guard.clone();
        let result = tokio::task::spawn_blocking(move || f(disk)).await?;
        drop(guard);
        result
    }
}

async fn open_disk(config: ResponseCacheConfig) -> Result<DiskLruCache> {
    let disk = tokio::task::spawn_blocking(move || {
        DiskLruCache::open(
            &config.cache_dir,
            config.cache_version,
            VALUE_COUNT,
            config.max_cache_size,
        )
    })
    .await??;
    Ok(disk)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::tempdir;

    fn test_config(dir: &std::path::Path) -> ResponseCacheConfig {
        ResponseCacheConfig {
            cache_dir: dir.to_path_buf(),
            cache_version: 1,
            max_cache_size: 1024 * 1024,
            cache_ttl_secs: 3600,
        }
    }

    #[test]
    fn test_cache_key_is_sha256_hex() {
        let key = ResponseCache::cache_key("https://example.com/a?b=c");
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(key, ResponseCache::cache_key("https://example.com/a?b=c"));
        assert_ne!(key, ResponseCache::cache_key("https://example.com/a?b=d"));
    }

    #[test]
    fn test_expiry_parse() {
        assert_eq!(Expiry::parse("0"), Expiry::Never);
        assert_eq!(Expiry::parse("not a number"), Expiry::Unknown);
        assert_eq!(Expiry::parse("-3"), Expiry::Unknown);
        assert_eq!(
            Expiry::parse("1700000000000"),
            Expiry::At(DateTime::from_timestamp_millis(1_700_000_000_000).unwrap())
        );
    }

    #[test]
    fn test_is_fresh() {
        let now = Utc::now();
        let response = |expiry| CachedResponse {
            body: Vec::new(),
            expiry,
        };

        assert!(response(Expiry::Never).is_fresh(now));
        assert!(response(Expiry::At(now + Duration::seconds(1))).is_fresh(now));
        assert!(!response(Expiry::At(now)).is_fresh(now));
        assert!(!response(Expiry::Unknown).is_fresh(now));
    }

    #[test]
    fn test_after_ttl() {
        let now = DateTime::from_timestamp_millis(1_000_000).unwrap();
        assert_eq!(Expiry::after_ttl(now, 0), Expiry::Never);
        assert_eq!(
            Expiry::after_ttl(now, 60).encode(),
            (1_000_000 + 60_000).to_string()
        );
        assert_eq!(Expiry::after_ttl(now, u64::MAX), Expiry::Never);
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let dir = tempdir().unwrap();
        let cache = ResponseCache::open(test_config(dir.path())).await.unwrap();

        let url = "https://example.com/data.json";
        assert!(cache.put(url, b"{\"ok\":true}".to_vec(), None).await.unwrap());

        let response = cache.get(url).await.unwrap().unwrap();
        assert_eq!(response.body, b"{\"ok\":true}");
        assert!(response.is_fresh(Utc::now()));
        assert_eq!(
            cache.get_fresh(url).await.unwrap().as_deref(),
            Some(&b"{\"ok\":true}"[..])
        );
    }

    #[tokio::test]
    async fn test_cache_miss() {
        let dir = tempdir().unwrap();
        let cache = ResponseCache::open(test_config(dir.path())).await.unwrap();

        assert!(cache.get("https://example.com/missing").await.unwrap().is_none());
        assert!(cache
            .get_fresh("https://example.com/missing")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_zero_ttl_never_expires() {
        let dir = tempdir().unwrap();
        let cache = ResponseCache::open(test_config(dir.path())).await.unwrap();

        cache
            .put("https://example.com/", b"forever".to_vec(), Some(0))
            .await
            .unwrap();
        let response = cache.get("https://example.com/").await.unwrap().unwrap();
        assert_eq!(response.expiry, Expiry::Never);
    }

    #[tokio::test]
    async fn test_expire_now_keeps_body() {
        let dir = tempdir().unwrap();
        let cache = ResponseCache::open(test_config(dir.path())).await.unwrap();
        let url = "https://example.com/page";

        cache.put(url, b"body".to_vec(), Some(3600)).await.unwrap();
        assert!(cache.expire_now(url).await.unwrap());

        assert!(cache.get_fresh(url).await.unwrap().is_none());
        let response = cache.get(url).await.unwrap().unwrap();
        assert_eq!(response.body, b"body");
        assert!(matches!(response.expiry, Expiry::At(_)));

        assert!(!cache.expire_now("https://example.com/other").await.unwrap());
    }

    #[tokio::test]
    async fn test_remove() {
        let dir = tempdir().unwrap();
        let cache = ResponseCache::open(test_config(dir.path())).await.unwrap();
        let url = "https://example.com/page";

        cache.put(url, b"body".to_vec(), None).await.unwrap();
        assert!(cache.remove(url).await.unwrap());
        assert!(!cache.remove(url).await.unwrap());
        assert!(cache.get(url).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_put_skipped_while_entry_is_edited() {
        let dir = tempdir().unwrap();
        let cache = ResponseCache::open(test_config(dir.path())).await.unwrap();
        let url = "https://example.com/busy";

        let disk = cache.disk.read().await.clone();
        let editor = disk.edit(&ResponseCache::cache_key(url)).unwrap().unwrap();

        assert!(!cache.put(url, b"body".to_vec(), None).await.unwrap());
        editor.abort().unwrap();
        assert!(cache.put(url, b"body".to_vec(), None).await.unwrap());
    }

    #[tokio::test]
    async fn test_cache_stats() {
        let dir = tempdir().unwrap();
        let cache = ResponseCache::open(test_config(dir.path())).await.unwrap();

        let stats = cache.stats().await;
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.total_size, 0);

        cache
            .put("https://example.com/", b"12345".to_vec(), Some(0))
            .await
            .unwrap();
        let stats = cache.stats().await;
        assert_eq!(stats.entries, 1);
        // Body plus the "0" expiry
        assert_eq!(stats.total_size, 6);
        assert_eq!(stats.max_size, 1024 * 1024);
    }

    #[tokio::test]
    async fn test_clear_empties_and_reopens() {
        let dir = tempdir().unwrap();
        let cache = ResponseCache::open(test_config(dir.path())).await.unwrap();

        cache
            .put("https://example.com/", b"body".to_vec(), None)
            .await
            .unwrap();
        cache.clear().await.unwrap();

        assert_eq!(cache.stats().await.entries, 0);
        assert!(cache.get("https://example.com/").await.unwrap().is_none());
        assert!(cache
            .put("https://example.com/", b"again".to_vec(), None)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_responses_survive_reopen() {
        let dir = tempdir().unwrap();
        {
            let cache = ResponseCache::open(test_config(dir.path())).await.unwrap();
            cache
                .put("https://example.com/", b"persisted".to_vec(), None)
                .await
                .unwrap();
            cache.close().await.unwrap();
        }

        let cache = ResponseCache::open(test_config(dir.path())).await.unwrap();
        assert_eq!(
            cache.get_fresh("https://example.com/").await.unwrap().unwrap(),
            b"persisted"
        );
    }

    #[tokio::test]
    async fn test_lru_eviction_by_size() {
        let dir = tempdir().unwrap();
        let config = ResponseCacheConfig {
            max_cache_size: 100,
            ..test_config(dir.path())
        };
        let cache = ResponseCache::open(config).await.unwrap();

        cache
            .put("https://example.com/a", vec![b'a'; 60], Some(0))
            .await
            .unwrap();
        cache
            .put("https://example.com/b", vec![b'b'; 60], Some(0))
            .await
            .unwrap();

        // put flushes, which trims synchronously
        assert!(cache.get("https://example.com/a").await.unwrap().is_none());
        assert!(cache.get("https://example.com/b").await.unwrap().is_some());
        assert!(cache.stats().await.total_size <= 100);
    }
}
