//! Durable JSON Lines store of [`JobRecord`]s.
//!
//! Appends go straight to the end of the file and are fsynced before returning.
//! Updates never edit bytes in place: the full ledger is written to
//! `<ledger>.tmp`, fsynced, and renamed over the canonical path, so a crash at any
//! point leaves either the old or the new ledger on disk.

use super::error::{DispatchError, DispatchResult};
use super::job::JobRecord;
use super::JobId;
use std::collections::HashMap;
use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

pub struct Ledger {
    path: PathBuf,
    records: Vec<JobRecord>,
    index: HashMap<JobId, usize>,
    _lock: LedgerLock,
}

impl Ledger {
    /// Read every record without taking the writer lock.
    ///
    /// A missing file is an empty ledger. A final line without its newline that
    /// does not parse is an append that never completed and is skipped. Any other
    /// line that does not parse fails the whole load with
    /// [`DispatchError::StoreCorrupt`].
    pub fn load(path: &Path) -> DispatchResult<Vec<JobRecord>> {
        Self::read(path).map(|(records, _)| records)
    }

    fn read(path: &Path) -> DispatchResult<(Vec<JobRecord>, Tail)> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok((Vec::new(), Tail::Clean)),
            Err(source) => {
                return Err(DispatchError::LedgerRead {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let mut records = Vec::new();
        let mut offset = 0usize;
        for (idx, chunk) in content.split_inclusive('\n').enumerate() {
            let line = chunk.trim();
            if !line.is_empty() {
                match serde_json::from_str::<JobRecord>(line) {
                    Ok(record) => records.push(record),
                    Err(source) if !chunk.ends_with('\n') => {
                        tracing::warn!(
                            "Ignoring incomplete last line {} of ledger {}: {}",
                            idx + 1,
                            path.display(),
                            source
                        );
                        return Ok((records, Tail::Torn(offset as u64)));
                    }
                    Err(source) => {
                        return Err(DispatchError::StoreCorrupt {
                            path: path.to_path_buf(),
                            line: idx + 1,
                            source,
                        })
                    }
                }
            }
            offset += chunk.len();
        }

        let tail = if content.is_empty() || content.ends_with('\n') {
            Tail::Clean
        } else {
            Tail::Unterminated
        };
        Ok((records, tail))
    }

    /// Open the ledger for writing: take the single-writer lock, then load.
    pub fn open(path: impl Into<PathBuf>) -> DispatchResult<Self> {
        let path = path.into();
        if let Some(parent) = non_empty_parent(&path) {
            std::fs::create_dir_all(parent).map_err(|source| DispatchError::LedgerWrite {
                path: path.clone(),
                source,
            })?;
        }

        let lock = LedgerLock::acquire(&path)?;
        let (records, tail) = Self::read(&path)?;
        repair_tail(&path, tail).map_err(|source| DispatchError::LedgerWrite {
            path: path.clone(),
            source,
        })?;

        let mut index = HashMap::with_capacity(records.len());
        for (pos, record) in records.iter().enumerate() {
            if index.insert(record.id, pos).is_some() {
                return Err(DispatchError::DuplicateId(record.id));
            }
        }

        tracing::info!(
            "Loaded {} job records from {}",
            records.len(),
            path.display()
        );

        Ok(Self {
            path,
            records,
            index,
            _lock: lock,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All records in ingestion order
    pub fn records(&self) -> &[JobRecord] {
        &self.records
    }

    pub fn get(&self, id: JobId) -> Option<&JobRecord> {
        self.index.get(&id).map(|&pos| &self.records[pos])
    }

    /// Next unused id. Records are never deleted, so ids are never reused.
    pub fn next_id(&self) -> JobId {
        self.records.iter().map(|r| r.id).max().unwrap_or(0) + 1
    }

    /// Append a new record and fsync before returning.
    pub fn append(&mut self, record: JobRecord) -> DispatchResult<()> {
        if self.index.contains_key(&record.id) {
            return Err(DispatchError::DuplicateId(record.id));
        }

        let mut line = serde_json::to_string(&record).map_err(|e| self.write_error(e.into()))?;
        line.push('\n');

        let created = !self.path.exists();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| self.write_error(e))?;
        file.write_all(line.as_bytes())
            .and_then(|_| file.sync_all())
            .map_err(|e| self.write_error(e))?;
        if created {
            sync_parent_dir(&self.path).map_err(|e| self.write_error(e))?;
        }

        tracing::debug!("Appended job {} to {}", record.id, self.path.display());
        self.index.insert(record.id, self.records.len());
        self.records.push(record);
        Ok(())
    }

    /// Apply `mutation` to a copy of record `id` and atomically persist the full ledger.
    ///
    /// If the mutation or the write fails, neither the file nor the in-memory
    /// copy changes.
    pub fn update<F>(&mut self, id: JobId, mutation: F) -> DispatchResult<&JobRecord>
    where
        F: FnOnce(&mut JobRecord) -> DispatchResult<()>,
    {
        let pos = *self.index.get(&id).ok_or(DispatchError::NotFound(id))?;

        let mut updated = self.records[pos].clone();
        mutation(&mut updated)?;
        debug_assert_eq!(updated.id, id, "mutation must not change the job id");

        let mut content = String::new();
        for (i, record) in self.records.iter().enumerate() {
            let record = if i == pos { &updated } else { record };
            let line = serde_json::to_string(record).map_err(|e| self.write_error(e.into()))?;
            content.push_str(&line);
            content.push('\n');
        }
        self.replace_file(content.as_bytes())?;

        self.records[pos] = updated;
        Ok(&self.records[pos])
    }

    fn replace_file(&self, bytes: &[u8]) -> DispatchResult<()> {
        let tmp_path = with_suffix(&self.path, "tmp");

        let write_tmp = || -> std::io::Result<()> {
            let mut file = File::create(&tmp_path)?;
            file.write_all(bytes)?;
            file.sync_all()
        };
        write_tmp().map_err(|source| DispatchError::LedgerWrite {
            path: tmp_path.clone(),
            source,
        })?;

        // Atomic rename
        std::fs::rename(&tmp_path, &self.path).map_err(|e| self.write_error(e))?;
        sync_parent_dir(&self.path).map_err(|e| self.write_error(e))?;

        tracing::debug!(
            "Rewrote ledger {} ({} records, {} bytes)",
            self.path.display(),
            self.records.len(),
            bytes.len()
        );
        Ok(())
    }

    fn write_error(&self, source: std::io::Error) -> DispatchError {
        DispatchError::LedgerWrite {
            path: self.path.clone(),
            source,
        }
    }
}

/// Exclusive advisory lock on `<ledger>.lock`, released when dropped.
struct LedgerLock {
    _file: File,
}

impl LedgerLock {
    fn acquire(ledger_path: &Path) -> DispatchResult<Self> {
        let lock_path = with_suffix(ledger_path, "lock");
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|source| DispatchError::LedgerWrite {
                path: lock_path.clone(),
                source,
            })?;

        // SAFETY: the descriptor is owned by `file` and stays open for the lock's lifetime.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
                return Err(DispatchError::LedgerLocked(ledger_path.to_path_buf()));
            }
            return Err(DispatchError::LedgerWrite {
                path: lock_path,
                source: err,
            });
        }
        Ok(Self { _file: file })
    }
}

/// State of the ledger's last line as found on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tail {
    Clean,
    /// Last line parsed but has no newline
    Unterminated,
    /// Last line is an incomplete append; the committed prefix is this many bytes
    Torn(u64),
}

/// Make sure the next append starts on a fresh line.
fn repair_tail(path: &Path, tail: Tail) -> std::io::Result<()> {
    match tail {
        Tail::Clean => Ok(()),
        Tail::Unterminated => {
            let mut file = OpenOptions::new().append(true).open(path)?;
            file.write_all(b"\n")?;
            file.sync_all()
        }
        Tail::Torn(len) => {
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(len)?;
            file.sync_all()
        }
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

fn non_empty_parent(path: &Path) -> Option<&Path> {
    path.parent().filter(|p| !p.as_os_str().is_empty())
}

fn sync_parent_dir(path: &Path) -> std::io::Result<()> {
    let dir = non_empty_parent(path).unwrap_or_else(|| Path::new("."));
    File::open(dir)?.sync_all()
}
