//! Position bookkeeping for tailed files.
//!
//! A [`PositionFile`] persists one cursor per tailed path so reading resumes
//! where it left off across restarts. Each line is
//! `path TAB offset-hex TAB inode-hex TAB device-hex`; the reader tolerates
//! blank lines and trailing whitespace, the writer always emits canonical
//! form and rewrites the whole file on flush.
//!
//! At most one process writes a given position file. Within a process the
//! [`PositionRegistry`] deduplicates instances by path, so every tail input
//! naming the same file shares one `PositionFile`. The registry is plain
//! injectable state; [`PositionRegistry::global`] exists for the common case
//! of one registry per process.
//!
//! Offset updates are persisted *before* the corresponding line is handed
//! upstream, giving at-least-once reading across restarts.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Seek, SeekFrom};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use thiserror::Error;

/// Position bookkeeping errors.
#[derive(Debug, Error)]
pub enum PositionError {
    /// Underlying file I/O failed.
    #[error("position I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Process-wide registry deduplicating [`PositionFile`] instances by path.
pub struct PositionRegistry {
    files: Mutex<HashMap<PathBuf, Arc<PositionFile>>>,
}

impl PositionRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            files: Mutex::new(HashMap::new()),
        }
    }

    /// The default per-process registry.
    pub fn global() -> Arc<PositionRegistry> {
        static GLOBAL: OnceLock<Arc<PositionRegistry>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(PositionRegistry::new())))
    }

    /// Open (or return the already-open) position file at `path`.
    pub fn open(&self, path: impl Into<PathBuf>) -> Result<Arc<PositionFile>, PositionError> {
        let path = path.into();
        let mut files = self.files.lock().unwrap();
        if let Some(existing) = files.get(&path) {
            return Ok(Arc::clone(existing));
        }
        let opened = PositionFile::open(path.clone())?;
        files.insert(path, Arc::clone(&opened));
        Ok(opened)
    }
}

impl Default for PositionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The persisted set of position entries backing one file on disk.
pub struct PositionFile {
    path: PathBuf,
    entries: Mutex<HashMap<PathBuf, Arc<PositionEntry>>>,
}

impl PositionFile {
    /// Load the position file at `path`, creating an empty set when the file
    /// does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Arc<Self>, PositionError> {
        let this = Arc::new(Self {
            path: path.into(),
            entries: Mutex::new(HashMap::new()),
        });
        this.load()?;
        Ok(this)
    }

    /// The entry for `path`, created at offset zero on first reference.
    ///
    /// Entries are identity-stable: repeated calls return the same `Arc`.
    pub fn get(self: &Arc<Self>, path: impl Into<PathBuf>) -> Arc<PositionEntry> {
        let path = path.into();
        let mut entries = self.entries.lock().unwrap();
        let entry = entries
            .entry(path.clone())
            .or_insert_with(|| Arc::new(PositionEntry::new(path, Arc::downgrade(self))));
        Arc::clone(entry)
    }

    fn load(self: &Arc<Self>) -> Result<(), PositionError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = self.entries.lock().unwrap();
        for line in content.lines() {
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            let mut fields = line.split('\t');
            let parsed = (|| {
                let path = fields.next()?;
                let offset = u64::from_str_radix(fields.next()?.trim(), 16).ok()?;
                let inode = u64::from_str_radix(fields.next()?.trim(), 16).ok()?;
                let device = u64::from_str_radix(fields.next()?.trim(), 16).ok()?;
                Some((PathBuf::from(path), offset, inode, device))
            })();
            let Some((path, offset, inode, device)) = parsed else {
                tracing::warn!(file = %self.path.display(), line, "skipping malformed position entry");
                continue;
            };
            let entry = PositionEntry::new(path.clone(), Arc::downgrade(self));
            *entry.state.lock().unwrap() = EntryState {
                device,
                inode,
                offset,
            };
            entries.insert(path, Arc::new(entry));
        }
        Ok(())
    }

    /// Rewrite the file from the current entry set, in canonical form.
    pub fn flush(&self) -> Result<(), PositionError> {
        let mut lines: Vec<String> = {
            let entries = self.entries.lock().unwrap();
            entries.values().map(|e| e.format_line()).collect()
        };
        lines.sort();

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(&self.path, lines.concat())?;
        Ok(())
    }
}

/// The persisted view of one entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct EntryState {
    device: u64,
    inode: u64,
    offset: u64,
}

/// The in-memory cursor for one tailed path.
///
/// Shared between the tail input (which configures it) and the watcher that
/// currently tails the path (which advances the offset). All mutation flows
/// through the owning [`PositionFile`] so every change hits disk.
pub struct PositionEntry {
    path: PathBuf,
    owner: Weak<PositionFile>,
    read_from_head: AtomicBool,
    state: Mutex<EntryState>,
}

impl PositionEntry {
    fn new(path: PathBuf, owner: Weak<PositionFile>) -> Self {
        Self {
            path,
            owner,
            read_from_head: AtomicBool::new(false),
            state: Mutex::new(EntryState::default()),
        }
    }

    /// The tailed path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current byte offset into the tailed file.
    pub fn offset(&self) -> u64 {
        self.state.lock().unwrap().offset
    }

    /// The recorded `(device, inode)` identity.
    pub fn identity(&self) -> (u64, u64) {
        let state = self.state.lock().unwrap();
        (state.device, state.inode)
    }

    /// Whether a first open starts at the head of the file.
    pub fn read_from_head(&self) -> bool {
        self.read_from_head.load(Ordering::Relaxed)
    }

    /// Set the head/tail policy for the first open.
    pub fn set_read_from_head(&self, value: bool) {
        self.read_from_head.store(value, Ordering::Relaxed);
    }

    /// Compare the path's current backing file against the recorded state.
    ///
    /// Returns `(rotated, truncated)`: rotated when the path now resolves to
    /// a different physical file (or to nothing), truncated when the
    /// identity is unchanged but the file is shorter than the recorded
    /// offset. A concurrent write that re-extends the file past the old
    /// offset between the actual truncation and this check goes undetected;
    /// the behavior is inherited and accepted.
    pub fn is_rotated(&self) -> (bool, bool) {
        let metadata = match fs::metadata(&self.path) {
            Ok(metadata) => metadata,
            Err(_) => return (true, false),
        };
        let state = self.state.lock().unwrap();
        if metadata.dev() != state.device || metadata.ino() != state.inode {
            (true, false)
        } else if metadata.len() < state.offset {
            (false, true)
        } else {
            (false, false)
        }
    }

    /// Reconcile the entry with the file a reader just opened.
    ///
    /// A fresh entry starts at the head or the end per `read_from_head`;
    /// a recorded identity that no longer matches (rotation while the entry
    /// was persisted, or a reopen onto the successor file) resets the offset
    /// to zero, as does a file shorter than the recorded offset.
    fn reconcile(&self, device: u64, inode: u64, len: u64) -> Result<(), PositionError> {
        let read_from_head = self.read_from_head();
        self.update(|state| {
            let fresh = *state == EntryState::default();
            if fresh {
                state.offset = if read_from_head { 0 } else { len };
            } else if state.device != device || state.inode != inode || len < state.offset {
                state.offset = 0;
            }
            state.device = device;
            state.inode = inode;
        })
    }

    /// Advance the offset past a consumed line and persist.
    fn advance(&self, consumed: u64) -> Result<(), PositionError> {
        self.update(|state| state.offset += consumed)
    }

    fn update(&self, f: impl FnOnce(&mut EntryState)) -> Result<(), PositionError> {
        {
            let mut state = self.state.lock().unwrap();
            f(&mut state);
        }
        match self.owner.upgrade() {
            Some(owner) => owner.flush(),
            // Position file already torn down; the in-memory state is still
            // coherent for the rest of this process's lifetime.
            None => Ok(()),
        }
    }

    fn format_line(&self) -> String {
        let state = self.state.lock().unwrap();
        format!(
            "{}\t{:016x}\t{:016x}\t{:016x}\n",
            self.path.display(),
            state.offset,
            state.inode,
            state.device,
        )
    }
}

/// Line-oriented reader bound to one position entry.
///
/// Seeks to the recorded offset on open (or the end of the file for a fresh
/// entry with `read_from_head` unset), returns complete newline-terminated
/// lines with the terminator stripped, and persists the advanced offset
/// through the position file before each line is returned. Partial trailing
/// data is retained for the next call.
pub struct PositionReader {
    entry: Arc<PositionEntry>,
    reader: BufReader<File>,
    pending: Vec<u8>,
}

impl PositionReader {
    /// Open the file at the entry's path.
    pub fn open(entry: Arc<PositionEntry>) -> Result<Self, PositionError> {
        let mut file = File::open(entry.path())?;
        let metadata = file.metadata()?;
        entry.reconcile(metadata.dev(), metadata.ino(), metadata.len())?;
        file.seek(SeekFrom::Start(entry.offset()))?;
        Ok(Self {
            entry,
            reader: BufReader::new(file),
            pending: Vec::new(),
        })
    }

    /// The next complete line, or `None` at end of input.
    pub fn read_line(&mut self) -> Result<Option<Vec<u8>>, PositionError> {
        let mut chunk = Vec::new();
        let n = self.reader.read_until(b'\n', &mut chunk)?;
        if chunk.last().copied() == Some(b'\n') {
            chunk.pop();
            let consumed = (self.pending.len() + n) as u64;
            let mut line = std::mem::take(&mut self.pending);
            line.extend_from_slice(&chunk);
            self.entry.advance(consumed)?;
            Ok(Some(line))
        } else {
            // No terminator yet; keep what we have for the next call.
            self.pending.extend_from_slice(&chunk);
            Ok(None)
        }
    }
}
