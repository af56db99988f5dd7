//! Newline-delimited JSON storage shared by the event log and the frame
//! index files.
//!
//! Writers are strict: every append is encoded, written, flushed and (by
//! default) synced before it returns. Readers are tolerant: a line that does
//! not decode is skipped with a warning and counted, never fatal.

use std::fs::File;
use std::fs::OpenOptions;
use std::io::BufRead;
use std::io::BufReader;
use std::io::BufWriter;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;
use std::marker::PhantomData;
use std::path::Path;
use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::error::LogError;

const TAIL_SCAN_CHUNK: usize = 8 * 1024;

/// How far an append is pushed before it reports success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncPolicy {
    /// `sync_data` after every append. Survives power loss.
    #[default]
    Data,
    /// Flush to the OS only. Survives a recorder crash, not a host crash;
    /// a power loss may drop a buffered tail, which the next open trims.
    Flush,
}

impl std::str::FromStr for SyncPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "data" | "fsync" | "sync" => Ok(SyncPolicy::Data),
            "flush" | "buffered" => Ok(SyncPolicy::Flush),
            other => Err(format!("unknown sync policy '{}'", other)),
        }
    }
}

/// Byte sink under a [`JsonlWriter`]: append-only, but able to cut back to
/// a known length when an append fails halfway.
pub(crate) trait AppendFile: Write {
    fn truncate_to(&mut self, len: u64) -> std::io::Result<()>;
    fn sync_data(&self) -> std::io::Result<()>;
    fn sync_all(&self) -> std::io::Result<()>;
}

impl AppendFile for File {
    fn truncate_to(&mut self, len: u64) -> std::io::Result<()> {
        self.set_len(len)
    }

    fn sync_data(&self) -> std::io::Result<()> {
        File::sync_data(self)
    }

    fn sync_all(&self) -> std::io::Result<()> {
        File::sync_all(self)
    }
}

/// Appends whole lines straight to the file, with no userspace buffer. A
/// failed append is rolled back to the last committed length, so a line is
/// either fully in the file and reported `Ok`, or absent and reported `Err`.
pub(crate) struct JsonlWriter<F: AppendFile = File> {
    path: PathBuf,
    file: F,
    committed: u64,
    broken: bool,
    policy: SyncPolicy,
}

impl JsonlWriter<File> {
    /// Opens `path` for appending, creating parent directories and trimming
    /// any torn trailing line left by a crash mid-append.
    pub fn open(path: &Path, policy: SyncPolicy) -> Result<Self, LogError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| LogError::io("create_dir", parent, e))?;
        }
        repair_torn_tail(path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| LogError::io("open", path, e))?;
        let committed = file
            .metadata()
            .map_err(|e| LogError::io("stat", path, e))?
            .len();
        Ok(Self::from_file(path, file, committed, policy))
    }
}

impl<F: AppendFile> JsonlWriter<F> {
    fn from_file(path: &Path, file: F, committed: u64, policy: SyncPolicy) -> Self {
        Self {
            path: path.to_path_buf(),
            file,
            committed,
            broken: false,
            policy,
        }
    }

    pub fn append<T: Serialize>(&mut self, record: &T) -> Result<(), LogError> {
        if self.broken {
            return Err(LogError::io(
                "append",
                &self.path,
                std::io::Error::other("an earlier failed append could not be rolled back"),
            ));
        }
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        if let Err(e) = self.file.write_all(&line).and_then(|()| self.file.flush()) {
            self.roll_back();
            return Err(LogError::io("append", &self.path, e));
        }
        if self.policy == SyncPolicy::Data {
            if let Err(e) = self.file.sync_data() {
                self.roll_back();
                return Err(LogError::io("sync", &self.path, e));
            }
        }
        self.committed += line.len() as u64;
        Ok(())
    }

    fn roll_back(&mut self) {
        if let Err(e) = self.file.truncate_to(self.committed) {
            warn!(
                path = %self.path.display(),
                committed = self.committed,
                error = %e,
                "Failed to roll back a partial append, refusing further writes"
            );
            self.broken = true;
        }
    }

    pub fn sync(&mut self) -> Result<(), LogError> {
        self.file
            .flush()
            .map_err(|e| LogError::io("flush", &self.path, e))?;
        self.file
            .sync_all()
            .map_err(|e| LogError::io("sync", &self.path, e))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Truncates bytes after the last newline. Returns how many were dropped.
pub(crate) fn repair_torn_tail(path: &Path) -> Result<u64, LogError> {
    let mut file = match OpenOptions::new().read(true).write(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(LogError::io("open", path, e)),
    };
    let len = file
        .metadata()
        .map_err(|e| LogError::io("stat", path, e))?
        .len();
    if len == 0 {
        return Ok(0);
    }

    let mut buf = vec![0u8; TAIL_SCAN_CHUNK];
    let mut end = len;
    let keep = loop {
        let start = end.saturating_sub(TAIL_SCAN_CHUNK as u64);
        let chunk = &mut buf[..(end - start) as usize];
        file.seek(SeekFrom::Start(start))
            .map_err(|e| LogError::io("seek", path, e))?;
        file.read_exact(chunk)
            .map_err(|e| LogError::io("read", path, e))?;
        if let Some(pos) = chunk.iter().rposition(|b| *b == b'\n') {
            break start + pos as u64 + 1;
        }
        if start == 0 {
            break 0;
        }
        end = start;
    };

    if keep < len {
        file.set_len(keep)
            .map_err(|e| LogError::io("truncate", path, e))?;
        file.sync_data()
            .map_err(|e| LogError::io("sync", path, e))?;
        warn!(
            path = %path.display(),
            dropped_bytes = len - keep,
            "Trimmed torn trailing record left by an interrupted append"
        );
    }
    Ok(len - keep)
}

/// Replaces `path` with `records` atomically (temp file + rename).
pub(crate) fn write_atomic<T: Serialize>(path: &Path, records: &[T]) -> Result<(), LogError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| LogError::io("create_dir", parent, e))?;
    }
    let temp_path = path.with_extension("jsonl.tmp");
    let file = File::create(&temp_path).map_err(|e| LogError::io("create_temp", &temp_path, e))?;
    let mut writer = BufWriter::new(file);
    for record in records {
        serde_json::to_writer(&mut writer, record)?;
        writer
            .write_all(b"\n")
            .map_err(|e| LogError::io("write", &temp_path, e))?;
    }
    let file = writer
        .into_inner()
        .map_err(|e| LogError::io("flush", &temp_path, e.into_error()))?;
    file.sync_all()
        .map_err(|e| LogError::io("sync", &temp_path, e))?;
    std::fs::rename(&temp_path, path).map_err(|e| LogError::io("rename", path, e))?;
    Ok(())
}

/// Lazy, tolerant reader over a JSONL file. A missing file reads as empty.
pub struct JsonlIter<T> {
    path: PathBuf,
    reader: Option<BufReader<File>>,
    buf: Vec<u8>,
    line_no: u64,
    skipped: u64,
    _marker: PhantomData<T>,
}

impl<T: DeserializeOwned> JsonlIter<T> {
    pub fn open(path: &Path) -> Result<Self, LogError> {
        let reader = match File::open(path) {
            Ok(file) => Some(BufReader::new(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(LogError::io("open", path, e)),
        };
        Ok(Self {
            path: path.to_path_buf(),
            reader,
            buf: Vec::new(),
            line_no: 0,
            skipped: 0,
            _marker: PhantomData,
        })
    }

    /// Lines skipped so far because they failed to decode.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    pub(crate) fn note_skipped(&mut self, reason: &str) {
        self.skipped += 1;
        warn!(
            path = %self.path.display(),
            line = self.line_no,
            reason,
            "Skipping unusable stored record"
        );
    }
}

impl<T: DeserializeOwned> Iterator for JsonlIter<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        loop {
            let reader = self.reader.as_mut()?;
            self.buf.clear();
            match reader.read_until(b'\n', &mut self.buf) {
                Ok(0) => {
                    self.reader = None;
                    return None;
                }
                Ok(_) => {
                    self.line_no += 1;
                    let line = trim_line(&self.buf);
                    if line.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }
                    match serde_json::from_slice::<T>(line) {
                        Ok(record) => return Some(record),
                        Err(e) => {
                            let reason = e.to_string();
                            self.note_skipped(&reason);
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        path = %self.path.display(),
                        line = self.line_no,
                        error = %e,
                        "Read failed, ending scan early"
                    );
                    self.reader = None;
                    return None;
                }
            }
        }
    }
}

fn trim_line(buf: &[u8]) -> &[u8] {
    let mut line = buf;
    if let Some(rest) = line.strip_suffix(b"\n") {
        line = rest;
    }
    if let Some(rest) = line.strip_suffix(b"\r") {
        line = rest;
    }
    line
}
