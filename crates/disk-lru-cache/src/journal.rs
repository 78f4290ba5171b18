//! Append-only journal of entry state transitions
//!
//! The journal starts with a five line header:
//!
//! ```text
//! disk-lru-cache
//! 1
//! 100
//! 2
//!
//! ```
//!
//! holding the magic string, the journal format version, the owner's cache
//! version and the number of value slots per entry, followed by a blank line.
//! Each following line records one state transition:
//!
//! ```text
//! DIRTY 335c4c6028171cfddfbaae1a9c313c52
//! CLEAN 335c4c6028171cfddfbaae1a9c313c52 2342 13
//! REMOVE 335c4c6028171cfddfbaae1a9c313c52
//! DIRTY 1ab96a171faeeee38496d8b330771a7a
//! CLEAN 1ab96a171faeeee38496d8b330771a7a 1600 13
//! READ 335c4c6028171cfddfbaae1a9c313c52
//! ```
//!
//! A DIRTY line means an editor was opened for the key and must be followed
//! by a CLEAN or REMOVE for the same key, otherwise the entry is discarded on
//! the next open. CLEAN lines carry the committed length of every slot. READ
//! lines only refresh recency.

use crate::error::{CacheError, Result};
use crate::index::{EntryIndex, RECOVERED_EDITOR};
use crate::layout::{delete_if_exists, validate_key};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use tracing::debug;

pub const JOURNAL_FILE: &str = "journal";
pub const JOURNAL_FILE_TMP: &str = "journal.tmp";

const MAGIC: &str = "disk-lru-cache";
const FORMAT_VERSION: &str = "1";

/// Rebuild only once at least this many records are redundant
const REDUNDANT_OP_COMPACT_THRESHOLD: usize = 2000;

const CLEAN: &str = "CLEAN";
const DIRTY: &str = "DIRTY";
const REMOVE: &str = "REMOVE";
const READ: &str = "READ";

/// Identity of a journal: which cache version wrote it and how many slots
/// each entry has
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct JournalHeader {
    pub cache_version: u32,
    pub value_count: usize,
}

impl JournalHeader {
    fn write_to<W: Write>(&self, out: &mut W) -> io::Result<()> {
        writeln!(out, "{}", MAGIC)?;
        writeln!(out, "{}", FORMAT_VERSION)?;
        writeln!(out, "{}", self.cache_version)?;
        writeln!(out, "{}", self.value_count)?;
        writeln!(out)
    }

    fn verify(&self, lines: &[String]) -> Result<()> {
        let expected = [
            MAGIC.to_string(),
            FORMAT_VERSION.to_string(),
            self.cache_version.to_string(),
            self.value_count.to_string(),
            String::new(),
        ];
        if lines != expected {
            return Err(CacheError::Recovery(format!(
                "unexpected journal header: {:?}",
                lines
            )));
        }
        Ok(())
    }
}

/// One journal line
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Record {
    Clean { key: String, lengths: Vec<u64> },
    Dirty { key: String },
    Remove { key: String },
    Read { key: String },
}

impl Record {
    pub fn parse(line: &str, value_count: usize) -> Result<Self> {
        let unexpected = || CacheError::Recovery(format!("unexpected journal line: {:?}", line));

        let mut parts = line.split(' ');
        let kind = parts.next().ok_or_else(unexpected)?;
        let key = parts
            .next()
            .filter(|key| !key.is_empty())
            .ok_or_else(unexpected)?
            .to_string();
        // A corrupted key could name files outside the cache directory
        validate_key(&key).map_err(|_| unexpected())?;
        let rest: Vec<&str> = parts.collect();

        match (kind, rest.len()) {
            (CLEAN, n) if n == value_count => {
                let lengths = rest
                    .iter()
                    .map(|s| s.parse::<u64>())
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(|_| unexpected())?;
                Ok(Record::Clean { key, lengths })
            }
            (DIRTY, 0) => Ok(Record::Dirty { key }),
            (REMOVE, 0) => Ok(Record::Remove { key }),
            (READ, 0) => Ok(Record::Read { key }),
            _ => Err(unexpected()),
        }
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Record::Clean { key, lengths } => {
                write!(f, "{} {}", CLEAN, key)?;
                for length in lengths {
                    write!(f, " {}", length)?;
                }
                Ok(())
            }
            Record::Dirty { key } => write!(f, "{} {}", DIRTY, key),
            Record::Remove { key } => write!(f, "{} {}", REMOVE, key),
            Record::Read { key } => write!(f, "{} {}", READ, key),
        }
    }
}

/// Outcome of replaying a journal into an index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Replay {
    /// Complete records applied
    pub records: usize,
    /// The last line was cut short by a crash
    pub torn_tail: bool,
}

/// Read the journal at `path`, verify its header and apply every record to
/// `index` in order.
pub(crate) fn replay(path: &Path, header: &JournalHeader, index: &mut EntryIndex) -> Result<Replay> {
    let mut reader = BufReader::new(File::open(path)?);

    let mut header_lines = Vec::with_capacity(5);
    for _ in 0..5 {
        match read_line(&mut reader)? {
            Line::Complete(line) => header_lines.push(line),
            Line::Partial(_) | Line::Eof => {
                return Err(CacheError::Recovery("truncated journal header".to_string()))
            }
        }
    }
    header.verify(&header_lines)?;

    let mut records = 0;
    let torn_tail = loop {
        let line = match read_line(&mut reader)? {
            Line::Complete(line) => line,
            Line::Partial(line) => {
                debug!(line = %line, "Ignoring torn journal line");
                break true;
            }
            Line::Eof => break false,
        };

        match Record::parse(&line, header.value_count)? {
            Record::Clean { key, lengths } => {
                let entry = index.get_or_insert(&key, header.value_count);
                entry.readable = true;
                entry.current_editor = None;
                entry.lengths = lengths;
            }
            Record::Dirty { key } => {
                index.get_or_insert(&key, header.value_count).current_editor =
                    Some(RECOVERED_EDITOR);
            }
            Record::Remove { key } => {
                index.remove(&key);
            }
            Record::Read { key } => {
                index.touch(&key);
            }
        }
        records += 1;
    };

    Ok(Replay { records, torn_tail })
}

enum Line {
    Complete(String),
    Partial(String),
    Eof,
}

fn read_line<R: BufRead>(reader: &mut R) -> Result<Line> {
    let mut buf = Vec::new();
    if reader.read_until(b'\n', &mut buf)? == 0 {
        return Ok(Line::Eof);
    }

    let complete = buf.last() == Some(&b'\n');
    if complete {
        buf.pop();
    }
    let line = String::from_utf8(buf)
        .map_err(|_| CacheError::Recovery("journal is not valid UTF-8".to_string()))?;

    Ok(if complete {
        Line::Complete(line)
    } else {
        Line::Partial(line)
    })
}

/// Buffered appender for the active journal
#[derive(Debug)]
pub(crate) struct JournalWriter {
    writer: BufWriter<File>,
}

impl JournalWriter {
    pub fn open_append(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    pub fn append(&mut self, record: &Record) -> io::Result<()> {
        writeln!(self.writer, "{}", record)
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }

    /// Flush buffered records and push them to stable storage
    pub fn sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()
    }
}

/// Write a compacted journal for `index` to `journal.tmp` and atomically
/// move it over `journal`. On error the previous journal is left in place.
/// Appenders opened before a successful rebuild point at the replaced file
/// and must be reopened.
pub(crate) fn rebuild(dir: &Path, header: &JournalHeader, index: &EntryIndex) -> io::Result<()> {
    let tmp = dir.join(JOURNAL_FILE_TMP);
    let journal = dir.join(JOURNAL_FILE);

    if let Err(e) = write_compacted(&tmp, header, index) {
        let _ = delete_if_exists(&tmp);
        return Err(e);
    }
    if let Err(e) = fs::rename(&tmp, &journal) {
        let _ = delete_if_exists(&tmp);
        return Err(e);
    }

    debug!(entries = index.len(), "Rebuilt journal");
    Ok(())
}

fn write_compacted(path: &Path, header: &JournalHeader, index: &EntryIndex) -> io::Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    header.write_to(&mut out)?;

    for entry in index.iter() {
        let record = if entry.current_editor.is_some() {
            Record::Dirty {
                key: entry.key.clone(),
            }
        } else {
            Record::Clean {
                key: entry.key.clone(),
                lengths: entry.lengths.clone(),
            }
        };
        writeln!(out, "{}", record)?;
    }

    out.flush()?;
    out.get_ref().sync_all()
}

/// Rebuilding pays off once it would drop at least the threshold number of
/// records and at least halve the journal.
pub(crate) fn rebuild_required(redundant_ops: usize, live_entries: usize) -> bool {
    redundant_ops >= REDUNDANT_OP_COMPACT_THRESHOLD && redundant_ops >= live_entries
}
