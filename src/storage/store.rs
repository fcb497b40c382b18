//! Flat-File Record Store
//!
//! This module implements the record store: a keyed collection of records
//! kept in a single text file, one record per line.
//!
//! ## Design Decisions
//!
//! 1. **No cache**: The file is the single source of truth. Every operation
//!    re-reads it, and every destructive operation rewrites it completely.
//! 2. **Rewrite-and-rename**: Deletions write the retained lines to a sibling
//!    `.tmp` file, fsync it, then rename it over the original. The rename is
//!    the only commit point, so a crash never leaves a half-written file.
//! 3. **Serialized callers**: The store does no locking of its own. Mutating
//!    methods take `&mut self`; the [`Arbiter`](crate::arbiter::Arbiter)
//!    guarantees only one instruction touches the store at a time.
//!
//! ## File Layout
//!
//! ```text
//! name, score          <- optional header (line 0)
//! alice, 100
//! bob, 200
//! ```

use crate::codec::{decode, encode, CodecError, Record, RecordLayout};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Suffix of the temporary file used during a rewrite.
const TMP_SUFFIX: &str = ".tmp";

/// Errors surfaced by store operations.
///
/// A key that is not present is never an error: lookups return `Ok(None)`
/// or `Ok(false)`.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The filesystem refused a read, write, fsync or rename
    #[error("I/O failure on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A line in the file does not decode under the store's layout
    #[error("malformed record at line {line}: {source}")]
    Malformed {
        line: usize,
        #[source]
        source: CodecError,
    },

    /// A record handed to the store cannot be written
    #[error("invalid record: {0}")]
    InvalidRecord(#[from] CodecError),

    /// Append refused because the key is already present (strict mode only)
    #[error("duplicate key on append: {0}")]
    DuplicateKey(String),

    /// The arbiter serving this store has shut down
    #[error("arbiter is shut down")]
    Closed,

    /// The instruction panicked on the worker before producing a result
    #[error("instruction aborted by a panic on the worker")]
    WorkerLost,
}

impl StoreError {
    fn io(path: &Path, source: io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Configuration for a [`RecordStore`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Path of the backing file
    pub path: PathBuf,

    /// Key (and optional lifetime) field positions
    pub layout: RecordLayout,

    /// Header labels written on line 0 when the file is created
    pub header: Option<Record>,

    /// Refuse appends whose key is already present
    pub reject_duplicate_keys: bool,
}

impl StoreConfig {
    /// Configuration for `path`, keyed on field 0, no header, duplicates allowed.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            layout: RecordLayout::default(),
            header: None,
            reject_duplicate_keys: false,
        }
    }

    pub fn with_layout(mut self, layout: RecordLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_key_index(mut self, key_index: usize) -> Self {
        self.layout.key_index = key_index;
        self
    }

    /// Treats line 0 as a header with these labels.
    pub fn with_header(mut self, header: impl Into<Record>) -> Self {
        self.header = Some(header.into());
        self
    }

    pub fn reject_duplicate_keys(mut self, reject: bool) -> Self {
        self.reject_duplicate_keys = reject;
        self
    }
}

/// One line seen during a scan.
enum Line {
    Header,
    Record(Record),
}

/// A keyed record store backed by one flat text file.
///
/// # Example
///
/// ```
/// use flatkv::codec::Record;
/// use flatkv::storage::{RecordStore, StoreConfig};
///
/// let dir = tempfile::tempdir().unwrap();
/// let config = StoreConfig::new(dir.path().join("scores.txt")).with_header(["name", "score"]);
/// let mut store = RecordStore::open(config).unwrap();
///
/// store.append(Record::from(["alice", "100"])).unwrap();
/// store.append(Record::from(["bob", "200"])).unwrap();
/// assert_eq!(store.read("bob").unwrap(), Some(Record::from(["bob", "200"])));
///
/// store.delete("alice").unwrap();
/// assert_eq!(store.dump(false).unwrap(), vec![Record::from(["bob", "200"])]);
/// ```
#[derive(Debug)]
pub struct RecordStore {
    path: PathBuf,
    tmp_path: PathBuf,
    layout: RecordLayout,
    header: Option<Record>,
    reject_duplicate_keys: bool,

    /// Field count shared by every line, learned from the header or the first record
    arity: OnceLock<usize>,

    #[cfg(test)]
    fail_before_rename: bool,
}

impl RecordStore {
    /// Opens the store, creating the backing file (with its header) if absent.
    ///
    /// A `.tmp` file left behind by an interrupted rewrite is removed; the
    /// original file is authoritative.
    pub fn open(config: StoreConfig) -> StoreResult<Self> {
        let StoreConfig {
            path,
            layout,
            header,
            reject_duplicate_keys,
        } = config;

        let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
        tmp_name.push(TMP_SUFFIX);
        let tmp_path = path.with_file_name(tmp_name);

        let arity = OnceLock::new();
        if let Some(header) = &header {
            layout.validate(header)?;
            let _ = arity.set(header.len());
        }

        let store = Self {
            path,
            tmp_path,
            layout,
            header,
            reject_duplicate_keys,
            arity,
            #[cfg(test)]
            fail_before_rename: false,
        };

        if store.tmp_path.exists() {
            warn!(path = %store.tmp_path.display(), "Removing leftover rewrite file");
            fs::remove_file(&store.tmp_path).map_err(|e| StoreError::io(&store.tmp_path, e))?;
        }

        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&store.path)
            .map_err(|e| StoreError::io(&store.path, e))?;
        store.write_header_if_empty(&file)?;

        debug!(path = %store.path.display(), key_index = store.layout.key_index, "Record store opened");
        Ok(store)
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn layout(&self) -> RecordLayout {
        self.layout
    }

    /// Field count of every record, once known.
    pub fn arity(&self) -> Option<usize> {
        self.arity.get().copied()
    }

    /// Appends one record to the end of the file.
    ///
    /// The encoded line is written with a single `write_all` and synced, so
    /// a failed append leaves no partial line behind unless the failure
    /// happens mid-flush.
    pub fn append(&mut self, record: Record) -> StoreResult<()> {
        self.layout.validate(&record)?;
        if let Some(expected) = self.learn_arity()? {
            if expected != record.len() {
                return Err(StoreError::InvalidRecord(CodecError::ArityMismatch {
                    expected,
                    found: record.len(),
                }));
            }
        }

        let key = self.layout.key_of(&record)?.to_string();
        if self.reject_duplicate_keys && self.contains(&key)? {
            return Err(StoreError::DuplicateKey(key));
        }

        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&self.path)
            .map_err(|e| StoreError::io(&self.path, e))?;

        let mut buf = String::new();
        if self.write_header_if_empty(&file)? {
            trace!("Header restored before append");
        } else if !ends_with_newline(&mut file).map_err(|e| StoreError::io(&self.path, e))? {
            // Terminate a trailing line written without a newline
            buf.push('\n');
        }
        buf.push_str(&encode(&record));
        buf.push('\n');

        file.write_all(buf.as_bytes())
            .and_then(|()| file.sync_data())
            .map_err(|e| StoreError::io(&self.path, e))?;

        let _ = self.arity.set(record.len());
        trace!(key = %key, "Record appended");
        Ok(())
    }

    /// Deletes every record whose key equals `key` and returns how many were removed.
    ///
    /// Keys are expected to be unique; removing more than one record is
    /// logged as a warning.
    pub fn delete(&mut self, key: &str) -> StoreResult<usize> {
        let mut retained = Vec::new();
        let mut removed = 0;

        self.scan(|text, line| {
            match line {
                Line::Record(record) if self.layout.matches(&record, key) => removed += 1,
                _ => retained.push(text.to_string()),
            }
            ControlFlow::<()>::Continue(())
        })?;

        if removed == 0 {
            trace!(key = %key, "Delete matched nothing");
            return Ok(0);
        }
        if removed > 1 {
            warn!(key = %key, removed, "Duplicate key removed by delete");
        }

        self.rewrite(&retained)?;
        debug!(key = %key, removed, "Records deleted");
        Ok(removed)
    }

    /// Returns the first record whose key equals `key`.
    pub fn read(&self, key: &str) -> StoreResult<Option<Record>> {
        self.scan(|_, line| match line {
            Line::Record(record) if self.layout.matches(&record, key) => {
                ControlFlow::Break(record)
            }
            _ => ControlFlow::Continue(()),
        })
    }

    /// Returns `true` if any record has the key `key`.
    pub fn contains(&self, key: &str) -> StoreResult<bool> {
        self.scan(|_, line| match line {
            Line::Record(record) if self.layout.matches(&record, key) => ControlFlow::Break(()),
            _ => ControlFlow::Continue(()),
        })
        .map(|found| found.is_some())
    }

    /// Removes the record with key `key` and returns it, in one pass and one rewrite.
    ///
    /// The first matching record is returned. Any further records with the
    /// same key are removed as well.
    pub fn read_and_delete(&mut self, key: &str) -> StoreResult<Option<Record>> {
        let mut retained = Vec::new();
        let mut taken: Option<Record> = None;
        let mut removed = 0;

        self.scan(|text, line| {
            match line {
                Line::Record(record) if self.layout.matches(&record, key) => {
                    removed += 1;
                    taken.get_or_insert(record);
                }
                _ => retained.push(text.to_string()),
            }
            ControlFlow::<()>::Continue(())
        })?;

        if taken.is_none() {
            return Ok(None);
        }
        if removed > 1 {
            warn!(key = %key, removed, "Duplicate key removed by read-and-delete");
        }

        self.rewrite(&retained)?;
        debug!(key = %key, "Record taken");
        Ok(taken)
    }

    /// Returns every record in file order.
    ///
    /// When the store has a header, `include_header` decides whether it is
    /// returned as the first element.
    pub fn dump(&self, include_header: bool) -> StoreResult<Vec<Record>> {
        let mut records = Vec::new();

        self.scan(|text, line| {
            match line {
                Line::Record(record) => records.push(record),
                Line::Header if include_header => match decode(text, None) {
                    Ok(header) => records.push(header),
                    Err(source) => {
                        return ControlFlow::Break(StoreError::Malformed { line: 1, source })
                    }
                },
                Line::Header => {}
            }
            ControlFlow::Continue(())
        })?
        .map_or(Ok(records), Err)
    }

    /// Returns the arity, reading the first record of the file if it isn't known yet.
    ///
    /// `None` means the file holds no header and no records.
    fn learn_arity(&self) -> StoreResult<Option<usize>> {
        if let Some(arity) = self.arity() {
            return Ok(Some(arity));
        }
        self.scan(|_, line| match line {
            Line::Record(_) => ControlFlow::Break(()),
            Line::Header => ControlFlow::Continue(()),
        })?;
        Ok(self.arity())
    }

    /// Visits every non-blank line in order until `visit` breaks.
    fn scan<T>(&self, mut visit: impl FnMut(&str, Line) -> ControlFlow<T>) -> StoreResult<Option<T>> {
        let file = File::open(&self.path).map_err(|e| StoreError::io(&self.path, e))?;
        let reader = BufReader::new(file);

        for (index, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| StoreError::io(&self.path, e))?;
            let text = line.strip_suffix('\r').unwrap_or(&line);

            let parsed = if index == 0 && self.header.is_some() {
                Line::Header
            } else if text.trim().is_empty() {
                continue;
            } else {
                Line::Record(self.decode_line(index, text)?)
            };

            if let ControlFlow::Break(found) = visit(text, parsed) {
                return Ok(Some(found));
            }
        }

        Ok(None)
    }

    fn decode_line(&self, index: usize, text: &str) -> StoreResult<Record> {
        let malformed = |source| StoreError::Malformed {
            line: index + 1,
            source,
        };

        let record = decode(text, self.arity()).map_err(malformed)?;
        self.layout.key_of(&record).map_err(malformed)?;
        self.arity.get_or_init(|| record.len());
        Ok(record)
    }

    /// Writes `lines` to the temp file, syncs it, and renames it over the original.
    fn rewrite(&self, lines: &[String]) -> StoreResult<()> {
        let result = self.write_tmp(lines).and_then(|()| self.commit());
        if result.is_err() {
            let _ = fs::remove_file(&self.tmp_path);
        }
        result
    }

    fn write_tmp(&self, lines: &[String]) -> StoreResult<()> {
        let tmp_err = |e| StoreError::io(&self.tmp_path, e);

        let mut writer = BufWriter::new(File::create(&self.tmp_path).map_err(tmp_err)?);
        for line in lines {
            writer.write_all(line.as_bytes()).map_err(tmp_err)?;
            writer.write_all(b"\n").map_err(tmp_err)?;
        }
        let file = writer.into_inner().map_err(|e| tmp_err(e.into_error()))?;
        file.sync_all().map_err(tmp_err)
    }

    fn commit(&self) -> StoreResult<()> {
        #[cfg(test)]
        {
            if self.fail_before_rename {
                return Err(StoreError::io(
                    &self.path,
                    io::Error::other("injected failure before rename"),
                ));
            }
        }

        fs::rename(&self.tmp_path, &self.path).map_err(|e| StoreError::io(&self.path, e))?;
        trace!(path = %self.path.display(), "Rewrite committed");
        Ok(())
    }

    /// Writes the configured header into an empty file. Returns `true` if it did.
    fn write_header_if_empty(&self, file: &File) -> StoreResult<bool> {
        let Some(header) = &self.header else {
            return Ok(false);
        };

        let len = file
            .metadata()
            .map_err(|e| StoreError::io(&self.path, e))?
            .len();
        if len > 0 {
            return Ok(false);
        }

        let mut line = encode(header);
        line.push('\n');
        let mut file = file;
        file.write_all(line.as_bytes())
            .and_then(|()| file.sync_data())
            .map_err(|e| StoreError::io(&self.path, e))?;
        Ok(true)
    }
}

/// Returns `true` if the file is empty or its last byte is `\n`.
fn ends_with_newline(file: &mut File) -> io::Result<bool> {
    if file.metadata()?.len() == 0 {
        return Ok(true);
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::End(-1))?;
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}
