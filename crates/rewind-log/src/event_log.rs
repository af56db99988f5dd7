use std::ops::Range;
use std::path::Path;
use std::path::PathBuf;

use crate::error::LogError;
use crate::event::EventPayload;
use crate::event::EventRecord;
use crate::event::EventRecordRef;
use crate::event::TabId;
use crate::jsonl::JsonlIter;
use crate::jsonl::JsonlWriter;
use crate::jsonl::SyncPolicy;

/// Zero-based position of a record among the valid records of a log.
pub type RecordOffset = u64;

#[derive(Debug, Clone, PartialEq)]
pub struct LoggedEvent {
    pub offset: RecordOffset,
    pub record: EventRecord,
}

/// Append-only store of `{tabId, event}` records for one run.
pub struct EventLog {
    writer: JsonlWriter,
    len: u64,
}

impl EventLog {
    pub const FILE_NAME: &'static str = "events.jsonl";

    pub fn open(dir: &Path, policy: SyncPolicy) -> Result<Self, LogError> {
        let path = dir.join(Self::FILE_NAME);
        let writer = JsonlWriter::open(&path, policy)?;
        let len = EventIter::open(&path)?.count() as u64;
        Ok(Self { writer, len })
    }

    /// Appends one record. Call order is file order; the record is on disk
    /// (per the sync policy) before this returns.
    pub fn append(
        &mut self,
        tab_id: TabId,
        event: &EventPayload,
    ) -> Result<RecordOffset, LogError> {
        if event.timestamp().is_none() {
            return Err(LogError::MissingTimestamp);
        }
        self.writer.append(&EventRecordRef { tab_id, event })?;
        let offset = self.len;
        self.len += 1;
        Ok(offset)
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn path(&self) -> &Path {
        self.writer.path()
    }

    pub fn sync(&mut self) -> Result<(), LogError> {
        self.writer.sync()
    }

    /// Fresh lazy iterator over every valid record.
    pub fn iter(&self) -> Result<EventIter, LogError> {
        EventIter::open(self.path())
    }

    /// Records whose offsets fall in `range`. Reading stops at the end of
    /// the range, so a prefix never pays for the suffix.
    pub fn read(
        &self,
        range: Range<RecordOffset>,
    ) -> Result<impl Iterator<Item = LoggedEvent>, LogError> {
        let take = range.end.saturating_sub(range.start) as usize;
        Ok(self.iter()?.skip(range.start as usize).take(take))
    }

    /// The events of `tab` up to and including frame position `frame`.
    pub fn tab_prefix(&self, tab: TabId, frame: u64) -> Result<Vec<EventRecord>, LogError> {
        tab_prefix_at(self.path(), tab, frame)
    }
}

pub(crate) fn tab_prefix_at(
    path: &Path,
    tab: TabId,
    frame: u64,
) -> Result<Vec<EventRecord>, LogError> {
    let mut events = Vec::new();
    let mut next_frame = 0u64;
    for logged in EventIter::open(path)? {
        let record = logged.record;
        if !record.event.is_custom() {
            if next_frame > frame {
                break;
            }
            next_frame += 1;
        }
        if record.tab_id == tab {
            events.push(record);
        }
    }
    Ok(events)
}

/// Lazy iterator over valid records. Lines that fail to decode, or decode
/// without a timestamp, are skipped with a warning.
pub struct EventIter {
    inner: JsonlIter<EventRecord>,
    next_offset: RecordOffset,
    path: PathBuf,
}

impl EventIter {
    pub fn open(path: &Path) -> Result<Self, LogError> {
        Ok(Self {
            inner: JsonlIter::open(path)?,
            next_offset: 0,
            path: path.to_path_buf(),
        })
    }

    pub fn skipped(&self) -> u64 {
        self.inner.skipped()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Iterator for EventIter {
    type Item = LoggedEvent;

    fn next(&mut self) -> Option<LoggedEvent> {
        loop {
            let record = self.inner.next()?;
            if record.event.timestamp().is_none() {
                self.inner.note_skipped("record has no timestamp");
                continue;
            }
            let offset = self.next_offset;
            self.next_offset += 1;
            return Some(LoggedEvent { offset, record });
        }
    }
}
