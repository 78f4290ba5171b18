//! Point-in-time read handles

use crate::cache::Shared;
use crate::editor::Editor;
use crate::error::Result;
use std::fs::File;
use std::io::Read;
use std::sync::Arc;

/// The committed values of one entry as of the moment it was read.
///
/// Every slot file is opened up front, so later commits (which replace files
/// by renaming) never show through. Dropping the snapshot closes the files.
pub struct Snapshot {
    shared: Arc<Shared>,
    key: String,
    sequence_number: u64,
    files: Vec<File>,
    lengths: Vec<u64>,
}

impl Snapshot {
    pub(crate) fn new(
        shared: Arc<Shared>,
        key: String,
        sequence_number: u64,
        files: Vec<File>,
        lengths: Vec<u64>,
    ) -> Self {
        Self {
            shared,
            key,
            sequence_number,
            files,
            lengths,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Editor for this entry, or `None` if the entry has been committed or
    /// removed since this snapshot was taken, or another edit is in progress
    pub fn edit(&self) -> Result<Option<Editor>> {
        self.shared.edit(&self.key, Some(self.sequence_number))
    }

    /// Unbuffered stream over the value of `slot`
    pub fn input_stream(&mut self, slot: usize) -> Result<&mut File> {
        self.shared.check_slot(slot)?;
        Ok(&mut self.files[slot])
    }

    /// Remaining contents of `slot` as a string. Reads from the current
    /// stream position, so a second call returns what the first left unread.
    pub fn get_string(&mut self, slot: usize) -> Result<String> {
        let mut value = String::new();
        self.input_stream(slot)?.read_to_string(&mut value)?;
        Ok(value)
    }

    /// Committed byte length of `slot`
    pub fn length(&self, slot: usize) -> Option<u64> {
        self.lengths.get(slot).copied()
    }

    /// Release the file handles
    pub fn close(self) {}
}

#[cfg(test)]
mod tests {
    use crate::{CacheError, DiskLruCache};
    use std::io::Read;
    use tempfile::tempdir;

    fn put(cache: &DiskLruCache, key: &str, value: &str) {
        let mut editor = cache.edit(key).unwrap().unwrap();
        editor.set_string(0, value).unwrap();
        editor.commit().unwrap();
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_commits() {
        let dir = tempdir().unwrap();
        let cache = DiskLruCache::open(dir.path(), 1, 1, 1024).unwrap();
        put(&cache, "k1", "first");

        let mut snapshot = cache.get("k1").unwrap().unwrap();
        put(&cache, "k1", "second");

        assert_eq!(snapshot.get_string(0).unwrap(), "first");
        let mut latest = cache.get("k1").unwrap().unwrap();
        assert_eq!(latest.get_string(0).unwrap(), "second");
    }

    #[test]
    fn test_snapshot_edit_succeeds_when_current() {
        let dir = tempdir().unwrap();
        let cache = DiskLruCache::open(dir.path(), 1, 1, 1024).unwrap();
        put(&cache, "k1", "value");

        let snapshot = cache.get("k1").unwrap().unwrap();
        let mut editor = snapshot.edit().unwrap().expect("snapshot is current");
        editor.set_string(0, "updated").unwrap();
        editor.commit().unwrap();
        snapshot.close();

        let mut snapshot = cache.get("k1").unwrap().unwrap();
        assert_eq!(snapshot.get_string(0).unwrap(), "updated");
    }

    #[test]
    fn test_stale_snapshot_cannot_edit() {
        let dir = tempdir().unwrap();
        let cache = DiskLruCache::open(dir.path(), 1, 1, 1024).unwrap();
        put(&cache, "k1", "value");

        let snapshot = cache.get("k1").unwrap().unwrap();
        put(&cache, "k1", "newer");

        assert!(snapshot.edit().unwrap().is_none());
    }

    #[test]
    fn test_snapshot_of_removed_entry_cannot_edit() {
        let dir = tempdir().unwrap();
        let cache = DiskLruCache::open(dir.path(), 1, 1, 1024).unwrap();
        put(&cache, "k1", "value");

        let snapshot = cache.get("k1").unwrap().unwrap();
        assert!(cache.remove("k1").unwrap());

        assert!(snapshot.edit().unwrap().is_none());
    }

    #[test]
    fn test_snapshot_edit_refused_while_editing() {
        let dir = tempdir().unwrap();
        let cache = DiskLruCache::open(dir.path(), 1, 1, 1024).unwrap();
        put(&cache, "k1", "value");

        let snapshot = cache.get("k1").unwrap().unwrap();
        let _editor = cache.edit("k1").unwrap().unwrap();

        assert!(snapshot.edit().unwrap().is_none());
    }

    #[test]
    fn test_snapshot_survives_remove() {
        let dir = tempdir().unwrap();
        let cache = DiskLruCache::open(dir.path(), 1, 1, 1024).unwrap();
        put(&cache, "k1", "still readable");

        let mut snapshot = cache.get("k1").unwrap().unwrap();
        assert!(cache.remove("k1").unwrap());

        let mut value = String::new();
        snapshot.input_stream(0).unwrap().read_to_string(&mut value).unwrap();
        assert_eq!(value, "still readable");
        assert_eq!(snapshot.key(), "k1");
        assert_eq!(snapshot.length(0), Some(14));
        assert_eq!(snapshot.length(1), None);
    }

    #[test]
    fn test_input_stream_rejects_bad_slot() {
        let dir = tempdir().unwrap();
        let cache = DiskLruCache::open(dir.path(), 1, 1, 1024).unwrap();
        put(&cache, "k1", "v");

        let mut snapshot = cache.get("k1").unwrap().unwrap();
        assert!(matches!(
            snapshot.input_stream(3),
            Err(CacheError::InvalidSlot { slot: 3, .. })
        ));
    }
}
