//! On-disk naming of value files

use crate::error::{CacheError, Result};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Committed value file for `slot` of `key`: `<key>.<slot>`
pub(crate) fn clean_file(dir: &Path, key: &str, slot: usize) -> PathBuf {
    dir.join(format!("{}.{}", key, slot))
}

/// In-progress value file for `slot` of `key`: `<key>.<slot>.tmp`
pub(crate) fn dirty_file(dir: &Path, key: &str, slot: usize) -> PathBuf {
    dir.join(format!("{}.{}.tmp", key, slot))
}

/// Keys become file names and journal tokens, so they must be non-empty and
/// free of whitespace and path separators.
pub(crate) fn validate_key(key: &str) -> Result<()> {
    let invalid = key.is_empty()
        || key
            .chars()
            .any(|c| c.is_whitespace() || c == '/' || c == '\\');
    if invalid {
        return Err(CacheError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Remove a file, treating "already gone" as success
pub(crate) fn delete_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Recursively delete everything inside `dir`, keeping `dir` itself
pub(crate) fn delete_contents(dir: &Path) -> io::Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            delete_if_exists(&path)?;
        }
    }
    Ok(())
}

/// Size of a file in bytes
pub(crate) fn file_len(path: &Path) -> io::Result<u64> {
    Ok(fs::metadata(path)?.len())
}
