//! Error types for the disk cache

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Journal recovery failed: {0}")]
    Recovery(String),

    #[error("Editor for key {0:?} no longer owns its entry")]
    EditConflict(String),

    #[error("Edit of key {key:?} did not write slot {slot}")]
    MissingSlot { key: String, slot: usize },

    #[error("Write to key {0:?} failed, edit aborted")]
    IoFault(String),

    #[error("Cache is closed")]
    Closed,

    #[error("Invalid key {0:?}: keys must be non-empty without whitespace or path separators")]
    InvalidKey(String),

    #[error("Slot {slot} out of range for {value_count} value slots")]
    InvalidSlot { slot: usize, value_count: usize },

    #[error("Configuration error: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, CacheError>;
