//! Journaled, size-bounded LRU cache stored on disk
//!
//! Every entry holds a fixed number of independently sized values ("slots"),
//! each kept in its own file inside the cache directory. An append-only
//! journal records every state transition so the in-memory index can be
//! rebuilt after an unclean shutdown, and writes go through exclusive
//! [`Editor`] transactions that become visible atomically on commit.
//!
//! ```no_run
//! use disk_lru_cache::DiskLruCache;
//! use std::io::Read;
//!
//! # fn main() -> disk_lru_cache::Result<()> {
//! let cache = DiskLruCache::open("/tmp/http-cache", 1, 2, 10 * 1024 * 1024)?;
//!
//! if let Some(mut editor) = cache.edit("f3a9c2")? {
//!     editor.set_string(0, "response body")?;
//!     editor.set_string(1, "0")?;
//!     editor.commit()?;
//! }
//!
//! if let Some(mut snapshot) = cache.get("f3a9c2")? {
//!     let mut body = String::new();
//!     snapshot.input_stream(0)?.read_to_string(&mut body)?;
//! }
//! # Ok(())
//! # }
//! ```

mod cache;
mod compactor;
mod editor;
mod error;
mod index;
mod journal;
mod layout;
mod snapshot;
mod types;

pub use cache::DiskLruCache;
pub use editor::{Editor, SlotWriter};
pub use error::{CacheError, Result};
pub use journal::{JOURNAL_FILE, JOURNAL_FILE_TMP};
pub use snapshot::Snapshot;
pub use types::CacheStats;
