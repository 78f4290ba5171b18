//! Cache facade: open, read, edit, remove and close a journaled disk cache

use crate::compactor::Compactor;
use crate::editor::Editor;
use crate::error::{CacheError, Result};
use crate::index::EntryIndex;
use crate::journal::{self, JournalHeader, JournalWriter, Record, JOURNAL_FILE, JOURNAL_FILE_TMP};
use crate::layout::{self, clean_file, dirty_file, validate_key};
use crate::snapshot::Snapshot;
use crate::types::CacheStats;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info, warn};

/// A size-bounded LRU cache of multi-slot values stored in a directory.
///
/// Cloning the handle is cheap and every clone refers to the same cache.
/// A directory must only be used by one open cache at a time.
#[derive(Clone)]
pub struct DiskLruCache {
    shared: Arc<Shared>,
}

/// State shared between the facade, its editors and snapshots, and the
/// background compactor
pub(crate) struct Shared {
    directory: PathBuf,
    header: JournalHeader,
    max_size: u64,
    state: Mutex<State>,
    compactor: Compactor,
}

/// Everything guarded by the cache lock
struct State {
    index: EntryIndex,
    /// Appender for the active journal, `None` once the cache is closed
    journal: Option<JournalWriter>,
    /// Sum of the committed lengths of every entry
    size: u64,
    /// Journal records that a rebuild would drop
    redundant_ops: usize,
    next_sequence_number: u64,
    next_editor_id: u64,
    hits: u64,
    misses: u64,
}

impl State {
    fn new(index: EntryIndex, journal: JournalWriter) -> Self {
        let size = index.iter().map(|entry| entry.total_length()).sum();
        Self {
            index,
            journal: Some(journal),
            size,
            redundant_ops: 0,
            // Recovered entries carry sequence number 0, so commits start at 1
            // and a snapshot of a recovered entry still detects later commits
            next_sequence_number: 1,
            // 0 marks editors recovered from the journal
            next_editor_id: 1,
            hits: 0,
            misses: 0,
        }
    }

    fn journal(&mut self) -> Result<&mut JournalWriter> {
        self.journal.as_mut().ok_or(CacheError::Closed)
    }

    fn check_open(&self) -> Result<()> {
        if self.journal.is_none() {
            return Err(CacheError::Closed);
        }
        Ok(())
    }

    fn check_owner(&self, key: &str, editor_id: u64) -> Result<bool> {
        match self.index.get(key) {
            Some(entry) if entry.current_editor == Some(editor_id) => Ok(entry.readable),
            _ => Err(CacheError::EditConflict(key.to_string())),
        }
    }
}

impl DiskLruCache {
    /// Open the cache in `directory`, creating it if needed.
    ///
    /// An existing journal is replayed to rebuild the index. Entries whose
    /// last edit never completed are discarded together with their files. A
    /// journal written by a different `cache_version` or `value_count`, or one
    /// that cannot be parsed, causes the whole directory to be cleared.
    pub fn open(
        directory: impl AsRef<Path>,
        cache_version: u32,
        value_count: usize,
        max_size: u64,
    ) -> Result<Self> {
        if max_size == 0 {
            return Err(CacheError::InvalidConfig(
                "max_size must be greater than zero".to_string(),
            ));
        }
        if value_count == 0 {
            return Err(CacheError::InvalidConfig(
                "value_count must be greater than zero".to_string(),
            ));
        }

        let directory = directory.as_ref().to_path_buf();
        let header = JournalHeader {
            cache_version,
            value_count,
        };
        fs::create_dir_all(&directory)?;

        let recovered = if directory.join(JOURNAL_FILE).exists() {
            match recover(&directory, &header) {
                Ok(state) => Some(state),
                Err(e) => {
                    warn!(
                        directory = ?directory,
                        error = %e,
                        "Discarding unusable cache journal, clearing cache"
                    );
                    layout::delete_contents(&directory)?;
                    None
                }
            }
        } else {
            None
        };

        let state = match recovered {
            Some(state) => state,
            None => {
                let index = EntryIndex::new();
                journal::rebuild(&directory, &header, &index)?;
                let journal = JournalWriter::open_append(&directory.join(JOURNAL_FILE))?;
                State::new(index, journal)
            }
        };

        info!(
            directory = ?directory,
            entries = state.index.len(),
            size = state.size,
            max_size,
            "Disk cache opened"
        );

        let shared = Arc::new_cyclic(|weak| Shared {
            directory,
            header,
            max_size,
            state: Mutex::new(state),
            compactor: Compactor::spawn(weak.clone()),
        });
        Ok(Self { shared })
    }

    /// Snapshot of the committed values for `key`, or `None` if there is no
    /// readable entry. A hit makes the entry the most recently used.
    pub fn get(&self, key: &str) -> Result<Option<Snapshot>> {
        self.shared.get(key)
    }

    /// Exclusive editor for `key`, or `None` if another edit is in progress
    pub fn edit(&self, key: &str) -> Result<Option<Editor>> {
        self.shared.edit(key, None)
    }

    /// Drop the entry for `key`. Returns false if there is no such entry or it
    /// is currently being edited.
    pub fn remove(&self, key: &str) -> Result<bool> {
        self.shared.remove_key(key)
    }

    /// Evict down to the size budget and push the journal to disk
    pub fn flush(&self) -> Result<()> {
        let mut state = self.shared.lock();
        state.check_open()?;
        self.shared.trim_to_size(&mut state)?;
        state.journal()?.sync()?;
        Ok(())
    }

    /// Abort live edits, evict down to the size budget and close the journal.
    /// Every later operation fails with [`CacheError::Closed`]. Closing an
    /// already closed cache does nothing.
    pub fn close(&self) -> Result<()> {
        let result = {
            let mut state = self.shared.lock();
            if state.journal.is_none() {
                return Ok(());
            }
            let result = self.shared.shutdown(&mut state);
            state.journal = None;
            result
        };

        self.shared.compactor.shutdown();
        info!(directory = ?self.shared.directory, "Disk cache closed");
        result
    }

    /// Close the cache and delete everything in its directory
    pub fn delete(&self) -> Result<()> {
        let closed = self.close();
        layout::delete_contents(&self.shared.directory)?;
        info!(directory = ?self.shared.directory, "Disk cache deleted");
        closed
    }

    pub fn directory(&self) -> &Path {
        &self.shared.directory
    }

    pub fn max_size(&self) -> u64 {
        self.shared.max_size
    }

    pub fn value_count(&self) -> usize {
        self.shared.header.value_count
    }

    /// Bytes currently stored. May exceed [`max_size`](Self::max_size) while
    /// an eviction is pending.
    pub fn size(&self) -> u64 {
        self.shared.lock().size
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().journal.is_none()
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.shared.lock();
        CacheStats {
            entries: state.index.len(),
            total_size: state.size,
            max_size: self.shared.max_size,
            redundant_ops: state.redundant_ops,
            hits: state.hits,
            misses: state.misses,
        }
    }
}

/// Rebuild the index from an existing journal and discard edits that never
/// finished.
fn recover(directory: &Path, header: &JournalHeader) -> Result<State> {
    let journal_path = directory.join(JOURNAL_FILE);
    let mut index = EntryIndex::new();
    let replay = journal::replay(&journal_path, header, &mut index)?;
    layout::delete_if_exists(&directory.join(JOURNAL_FILE_TMP))?;

    let dangling: Vec<String> = index
        .iter()
        .filter(|entry| entry.current_editor.is_some())
        .map(|entry| entry.key.clone())
        .collect();
    for key in &dangling {
        index.remove(key);
        for slot in 0..header.value_count {
            layout::delete_if_exists(&clean_file(directory, key, slot))?;
            layout::delete_if_exists(&dirty_file(directory, key, slot))?;
        }
        debug!(key = %key, "Discarded incomplete edit");
    }

    let redundant_ops = replay.records.saturating_sub(index.len());
    let redundant_ops = if replay.torn_tail || !dangling.is_empty() {
        journal::rebuild(directory, header, &index)?;
        0
    } else {
        redundant_ops
    };

    let journal = JournalWriter::open_append(&journal_path)?;
    let mut state = State::new(index, journal);
    state.redundant_ops = redundant_ops;
    Ok(state)
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn value_count(&self) -> usize {
        self.header.value_count
    }

    pub(crate) fn check_slot(&self, slot: usize) -> Result<()> {
        if slot >= self.value_count() {
            return Err(CacheError::InvalidSlot {
                slot,
                value_count: self.value_count(),
            });
        }
        Ok(())
    }

    fn get(self: &Arc<Self>, key: &str) -> Result<Option<Snapshot>> {
        validate_key(key)?;
        let mut guard = self.lock();
        let state = &mut *guard;
        state.check_open()?;

        let (sequence_number, lengths) = match state.index.get(key) {
            Some(entry) if entry.readable => (entry.sequence_number, entry.lengths.clone()),
            _ => {
                state.misses += 1;
                return Ok(None);
            }
        };

        // Open every slot now so the snapshot cannot mix values from two commits
        let mut files = Vec::with_capacity(self.value_count());
        for slot in 0..self.value_count() {
            match File::open(clean_file(&self.directory, key, slot)) {
                Ok(file) => files.push(file),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    warn!(key = %key, slot, "Cached value file is missing");
                    state.misses += 1;
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            }
        }

        state.index.touch(key);
        state.hits += 1;
        state.redundant_ops += 1;
        state.journal()?.append(&Record::Read {
            key: key.to_string(),
        })?;
        if journal::rebuild_required(state.redundant_ops, state.index.len()) {
            self.compactor.schedule();
        }

        Ok(Some(Snapshot::new(
            Arc::clone(self),
            key.to_string(),
            sequence_number,
            files,
            lengths,
        )))
    }

    fn remove_key(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        let mut guard = self.lock();
        let state = &mut *guard;
        state.check_open()?;

        let removed = self.remove_entry(state, key)?;
        if journal::rebuild_required(state.redundant_ops, state.index.len()) {
            self.compactor.schedule();
        }
        Ok(removed)
    }

    /// Start an edit of `key`. With `expected_sequence_number` set the edit is
    /// refused unless the entry is still at that commit.
    pub(crate) fn edit(
        self: &Arc<Self>,
        key: &str,
        expected_sequence_number: Option<u64>,
    ) -> Result<Option<Editor>> {
        validate_key(key)?;
        let mut guard = self.lock();
        let state = &mut *guard;
        state.check_open()?;

        let existing = state.index.get(key);
        if let Some(expected) = expected_sequence_number {
            if existing.map(|entry| entry.sequence_number) != Some(expected) {
                debug!(key = %key, "Snapshot is stale, refusing edit");
                return Ok(None);
            }
        }
        if existing.is_some_and(|entry| entry.current_editor.is_some()) {
            debug!(key = %key, "Edit already in progress");
            return Ok(None);
        }

        // The DIRTY record must be durable before any value file is created
        let journal = state.journal()?;
        journal.append(&Record::Dirty {
            key: key.to_string(),
        })?;
        journal.flush()?;

        let editor_id = state.next_editor_id;
        state.next_editor_id += 1;
        state
            .index
            .get_or_insert(key, self.header.value_count)
            .current_editor = Some(editor_id);

        Ok(Some(Editor::new(Arc::clone(self), key.to_string(), editor_id)))
    }

    /// Create the temp file for `slot`, provided `editor_id` still owns `key`
    pub(crate) fn create_dirty_file(&self, key: &str, editor_id: u64, slot: usize) -> Result<File> {
        self.check_slot(slot)?;
        let state = self.lock();
        state.check_open()?;
        state.check_owner(key, editor_id)?;
        Ok(File::create(dirty_file(&self.directory, key, slot))?)
    }

    /// Open the committed value of `slot`, `None` if `key` was never committed
    pub(crate) fn open_committed_file(
        &self,
        key: &str,
        editor_id: u64,
        slot: usize,
    ) -> Result<Option<File>> {
        self.check_slot(slot)?;
        let state = self.lock();
        state.check_open()?;
        if !state.check_owner(key, editor_id)? {
            return Ok(None);
        }
        Ok(Some(File::open(clean_file(&self.directory, key, slot))?))
    }

    /// Finish the edit of `key` held by `editor_id`, publishing its temp files
    /// when `success` is set and discarding them otherwise.
    pub(crate) fn complete_edit(&self, key: &str, editor_id: u64, success: bool) -> Result<()> {
        let mut guard = self.lock();
        let state = &mut *guard;
        state.check_open()?;
        let readable = state.check_owner(key, editor_id)?;

        // A first commit has to provide every slot
        if success && !readable {
            let missing =
                (0..self.value_count()).find(|&slot| !dirty_file(&self.directory, key, slot).exists());
            if let Some(slot) = missing {
                self.finish_edit(state, key, false)?;
                warn!(key = %key, slot, "Edit did not write every slot, aborted");
                return Err(CacheError::MissingSlot {
                    key: key.to_string(),
                    slot,
                });
            }
        }

        self.finish_edit(state, key, success)?;

        if state.size > self.max_size
            || journal::rebuild_required(state.redundant_ops, state.index.len())
        {
            self.compactor.schedule();
        }
        Ok(())
    }

    /// Abort the edit of `key` held by `editor_id` and drop whatever was
    /// committed before, under one lock so no other editor can claim the
    /// entry in between
    pub(crate) fn discard_edit(&self, key: &str, editor_id: u64) -> Result<()> {
        let mut guard = self.lock();
        let state = &mut *guard;
        state.check_open()?;
        state.check_owner(key, editor_id)?;

        self.finish_edit(state, key, false)?;
        self.remove_entry(state, key)?;

        if journal::rebuild_required(state.redundant_ops, state.index.len()) {
            self.compactor.schedule();
        }
        Ok(())
    }

    fn finish_edit(&self, state: &mut State, key: &str, success: bool) -> Result<()> {
        let mut torn = None;
        for slot in 0..self.value_count() {
            let dirty = dirty_file(&self.directory, key, slot);
            if !success {
                if let Err(e) = layout::delete_if_exists(&dirty) {
                    warn!(key = %key, slot, error = %e, "Failed to delete temp file");
                }
                continue;
            }
            if torn.is_some() || !dirty.exists() {
                let _ = layout::delete_if_exists(&dirty);
                continue;
            }

            let clean = clean_file(&self.directory, key, slot);
            match fs::rename(&dirty, &clean).and_then(|()| layout::file_len(&clean)) {
                Ok(new_length) => {
                    if let Some(entry) = state.index.get_mut(key) {
                        let old_length = std::mem::replace(&mut entry.lengths[slot], new_length);
                        state.size = state.size - old_length + new_length;
                    }
                }
                Err(e) => torn = Some(e),
            }
        }

        let Some(entry) = state.index.get_mut(key) else {
            return Ok(());
        };
        entry.current_editor = None;

        if let Some(e) = torn {
            // Some slots may already hold the new values, drop the whole entry
            warn!(key = %key, error = %e, "Failed to publish edit, removing entry");
            self.remove_entry(state, key)?;
            return Err(e.into());
        }

        state.redundant_ops += 1;
        if entry.readable || success {
            entry.readable = true;
            if success {
                entry.sequence_number = state.next_sequence_number;
                state.next_sequence_number += 1;
            }
            let record = Record::Clean {
                key: key.to_string(),
                lengths: entry.lengths.clone(),
            };
            state.journal()?.append(&record)?;
        } else {
            state.index.remove(key);
            state.journal()?.append(&Record::Remove {
                key: key.to_string(),
            })?;
        }
        Ok(())
    }

    /// Delete the files of `key` and drop it from the index. Entries being
    /// edited are left alone.
    fn remove_entry(&self, state: &mut State, key: &str) -> Result<bool> {
        let removable = state
            .index
            .get(key)
            .is_some_and(|entry| entry.current_editor.is_none());
        if !removable {
            return Ok(false);
        }
        let Some(entry) = state.index.remove(key) else {
            return Ok(false);
        };

        let mut failure = None;
        for slot in 0..self.value_count() {
            if let Err(e) = layout::delete_if_exists(&clean_file(&self.directory, key, slot)) {
                warn!(key = %key, slot, error = %e, "Failed to delete value file");
                failure.get_or_insert(e);
            }
        }

        state.size -= entry.total_length();
        state.redundant_ops += 1;
        state.journal()?.append(&Record::Remove {
            key: key.to_string(),
        })?;

        match failure {
            Some(e) => Err(e.into()),
            None => Ok(true),
        }
    }

    /// Evict least recently used entries until the size budget holds. Entries
    /// being edited are skipped, so the budget may stay exceeded until their
    /// editors finish.
    fn trim_to_size(&self, state: &mut State) -> Result<()> {
        while state.size > self.max_size {
            let key = match state.index.eviction_candidate() {
                Some(entry) => entry.key.clone(),
                None => {
                    debug!(size = state.size, "Every entry is being edited, trim deferred");
                    break;
                }
            };
            self.remove_entry(state, &key)?;
            debug!(key = %key, size = state.size, "Evicted least recently used entry");
        }
        Ok(())
    }

    fn rebuild_journal(&self, state: &mut State) -> Result<()> {
        state.journal()?.flush()?;
        journal::rebuild(&self.directory, &self.header, &state.index)?;
        let reopened = JournalWriter::open_append(&self.directory.join(JOURNAL_FILE));
        self.install_journal(state, reopened)
    }

    /// Switch to the appender of a freshly rebuilt journal. The old appender
    /// points at the replaced file, so if reopening failed the cache is closed
    /// rather than writing records nobody will replay.
    fn install_journal(&self, state: &mut State, reopened: io::Result<JournalWriter>) -> Result<()> {
        match reopened {
            Ok(journal) => {
                state.journal = Some(journal);
                state.redundant_ops = 0;
                Ok(())
            }
            Err(e) => {
                error!(
                    directory = ?self.directory,
                    error = %e,
                    "Failed to reopen rebuilt journal, closing cache"
                );
                state.journal = None;
                Err(e.into())
            }
        }
    }

    /// Background maintenance: trim to budget and compact the journal when it
    /// has grown redundant
    pub(crate) fn compact(&self) -> Result<()> {
        let mut guard = self.lock();
        let state = &mut *guard;
        if state.journal.is_none() {
            return Ok(());
        }

        self.trim_to_size(state)?;
        if journal::rebuild_required(state.redundant_ops, state.index.len()) {
            self.rebuild_journal(state)?;
        }
        Ok(())
    }

    /// Abort every live edit, trim and sync the journal ahead of closing
    fn shutdown(&self, state: &mut State) -> Result<()> {
        let editing: Vec<String> = state
            .index
            .iter()
            .filter(|entry| entry.current_editor.is_some())
            .map(|entry| entry.key.clone())
            .collect();

        let mut result = Ok(());
        for key in &editing {
            if let Err(e) = self.finish_edit(state, key, false) {
                warn!(key = %key, error = %e, "Failed to abort edit while closing");
                result = result.and(Err(e));
            }
        }

        let trimmed = self.trim_to_size(state).and_then(|()| Ok(state.journal()?.sync()?));
        result.and(trimmed)
    }
}
