//! Exclusive write transactions

use crate::cache::Shared;
use crate::error::{CacheError, Result};
use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::sync::Arc;
use tracing::warn;

/// Exclusive write handle for one entry.
///
/// Values are staged in temp files and only become visible to readers when
/// [`commit`](Editor::commit) succeeds. Dropping an editor without committing
/// aborts the edit.
pub struct Editor {
    shared: Arc<Shared>,
    key: String,
    id: u64,
    /// Set when any write, flush or close of a slot file failed
    has_errors: bool,
    completed: bool,
}

impl Editor {
    pub(crate) fn new(shared: Arc<Shared>, key: String, id: u64) -> Self {
        Self {
            shared,
            key,
            id,
            has_errors: false,
            completed: false,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// True once a write to one of the slot files has failed. A commit of
    /// such an edit is turned into an abort.
    pub fn has_errors(&self) -> bool {
        self.has_errors
    }

    /// Stream that replaces the value of `slot`.
    ///
    /// The stream never reports I/O errors; they are remembered by the editor
    /// and make [`commit`](Editor::commit) fail. It borrows the editor, so it
    /// has to be dropped (or [closed](SlotWriter::close)) before committing.
    pub fn new_output_stream(&mut self, slot: usize) -> Result<SlotWriter<'_>> {
        let file = match self.shared.create_dirty_file(&self.key, self.id, slot) {
            Ok(file) => Some(BufWriter::new(file)),
            Err(CacheError::Io(e)) => {
                warn!(key = %self.key, slot, error = %e, "Failed to create temp file");
                self.has_errors = true;
                None
            }
            Err(e) => return Err(e),
        };

        Ok(SlotWriter {
            file,
            has_errors: &mut self.has_errors,
        })
    }

    /// Replace the value of `slot` with `value` encoded as UTF-8
    pub fn set_string(&mut self, slot: usize, value: &str) -> Result<()> {
        let mut writer = self.new_output_stream(slot)?;
        writer.write_all(value.as_bytes())?;
        writer.close();
        Ok(())
    }

    /// Stream over the last committed value of `slot`, or `None` if the entry
    /// has never been committed
    pub fn new_input_stream(&self, slot: usize) -> Result<Option<File>> {
        self.shared.open_committed_file(&self.key, self.id, slot)
    }

    /// Last committed value of `slot` as a string
    pub fn get_string(&self, slot: usize) -> Result<Option<String>> {
        match self.new_input_stream(slot)? {
            Some(mut file) => {
                let mut value = String::new();
                file.read_to_string(&mut value)?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Publish the staged values and release the entry.
    ///
    /// Fails with [`CacheError::MissingSlot`] when a first commit did not
    /// write every slot, and with [`CacheError::IoFault`] when a write failed
    /// along the way. In both cases nothing is published and an entry that was
    /// never committed before is dropped; after an I/O fault the previous
    /// value is dropped as well.
    pub fn commit(mut self) -> Result<()> {
        self.completed = true;

        if self.has_errors {
            // Whatever was committed before is now stale as well
            self.shared.discard_edit(&self.key, self.id)?;
            warn!(key = %self.key, "Edit had write failures, aborted");
            return Err(CacheError::IoFault(self.key.clone()));
        }

        self.shared.complete_edit(&self.key, self.id, true)
    }

    /// Discard the staged values and release the entry
    pub fn abort(mut self) -> Result<()> {
        self.completed = true;
        self.shared.complete_edit(&self.key, self.id, false)
    }
}

impl Drop for Editor {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        match self.shared.complete_edit(&self.key, self.id, false) {
            Ok(()) | Err(CacheError::Closed) | Err(CacheError::EditConflict(_)) => {}
            Err(e) => warn!(key = %self.key, error = %e, "Failed to abort dropped editor"),
        }
    }
}

/// Output stream for one slot of an [`Editor`].
///
/// I/O failures are latched into the editor instead of being returned, and
/// the remaining bytes are discarded.
pub struct SlotWriter<'a> {
    file: Option<BufWriter<File>>,
    has_errors: &'a mut bool,
}

impl SlotWriter<'_> {
    /// Flush and close the underlying file
    pub fn close(mut self) {
        self.finish();
    }

    fn fail(&mut self, e: io::Error) {
        warn!(error = %e, "Write to cache temp file failed");
        *self.has_errors = true;
        self.file = None;
    }

    fn finish(&mut self) {
        if let Some(mut file) = self.file.take() {
            if let Err(e) = file.flush() {
                self.fail(e);
            }
        }
    }
}

impl Write for SlotWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(file) = self.file.as_mut() {
            if let Err(e) = file.write_all(buf) {
                self.fail(e);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Some(file) = self.file.as_mut() {
            if let Err(e) = file.flush() {
                self.fail(e);
            }
        }
        Ok(())
    }
}

impl Drop for SlotWriter<'_> {
    fn drop(&mut self) {
        self.finish();
    }
}
