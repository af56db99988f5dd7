use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;

use rewind_common::mutex_lock_or_recover;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::info;

use crate::error::LogError;
use crate::event::EventPayload;
use crate::event::EventRecord;
use crate::event::TabId;
use crate::event_log::EventLog;
use crate::event_log::RecordOffset;
use crate::frame::FrameEntry;
use crate::index::FrameIndex;
use crate::indexer::FrameIndexer;
use crate::jsonl::SyncPolicy;
use crate::locator::Locator;
use crate::recovery::reconcile;
use crate::resolver::Resolution;
use crate::resolver::Resolver;
use crate::store::FrameStore;

/// Outcome of a single append: where the record landed and, unless it was
/// a custom marker, the frame it became.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Appended {
    pub offset: RecordOffset,
    pub frame: Option<FrameEntry>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecorderStats {
    pub records: u64,
    pub frames: u64,
    pub tabs: u64,
    /// Log lines that could not be used when the run was opened.
    pub skipped_on_open: u64,
    /// Frames re-derived from the log because the stored index lagged.
    pub recovered_frames: u64,
}

struct RecorderInner {
    log: EventLog,
    indexer: FrameIndexer,
    index: FrameIndex,
    store: FrameStore,
}

/// Event log plus frame index for one run directory.
///
/// `append` serialises the log write and the index update under one lock,
/// so after a crash the index can only trail the log, never lead it.
pub struct Recorder {
    dir: PathBuf,
    inner: Mutex<RecorderInner>,
    skipped_on_open: u64,
    recovered_frames: u64,
}

impl Recorder {
    pub fn open(dir: &Path, policy: SyncPolicy) -> Result<Self, LogError> {
        std::fs::create_dir_all(dir).map_err(|e| LogError::io("create_dir", dir, e))?;
        let log = EventLog::open(dir, policy)?;
        let reconciled = reconcile(dir, policy)?;
        let store = FrameStore::open(dir, policy)?;

        let indexer = FrameIndexer::resume(&reconciled.entries);
        let index = FrameIndex::from_entries(reconciled.entries);
        info!(
            dir = %dir.display(),
            records = log.len(),
            frames = index.len(),
            recovered_frames = reconciled.recovered_frames,
            "Opened recording"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            inner: Mutex::new(RecorderInner {
                log,
                indexer,
                index,
                store,
            }),
            skipped_on_open: reconciled.skipped_records,
            recovered_frames: reconciled.recovered_frames,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Appends to the log, then indexes. A failed index write still leaves
    /// the frame in memory; the next open re-derives it from the log.
    pub fn append(&self, tab_id: TabId, event: &EventPayload) -> Result<Appended, LogError> {
        let mut inner = mutex_lock_or_recover(&self.inner);
        let offset = inner.log.append(tab_id, event)?;
        let Some(frame) = inner.indexer.on_event(tab_id, event) else {
            debug!(tab = %tab_id, offset, "Logged custom marker");
            return Ok(Appended {
                offset,
                frame: None,
            });
        };
        inner.index.insert(frame);
        inner.store.append(&frame)?;
        Ok(Appended {
            offset,
            frame: Some(frame),
        })
    }

    pub fn resolve(&self, locator: &Locator, tab: Option<TabId>) -> Result<Resolution, LogError> {
        let inner = mutex_lock_or_recover(&self.inner);
        Resolver::new(&inner.index).resolve(locator, tab)
    }

    /// The events to replay for `resolution`, read from the log on disk.
    pub fn replay_slice(&self, resolution: &Resolution) -> Result<Vec<EventRecord>, LogError> {
        self.tab_prefix(resolution.tab, resolution.frame.i)
    }

    pub fn tab_prefix(&self, tab: TabId, frame: u64) -> Result<Vec<EventRecord>, LogError> {
        // The log path is fixed; reading happens outside the lock.
        let path = {
            let inner = mutex_lock_or_recover(&self.inner);
            inner.log.path().to_path_buf()
        };
        crate::event_log::tab_prefix_at(&path, tab, frame)
    }

    pub fn frames(&self) -> Vec<FrameEntry> {
        mutex_lock_or_recover(&self.inner).index.entries().to_vec()
    }

    pub fn stats(&self) -> RecorderStats {
        let inner = mutex_lock_or_recover(&self.inner);
        RecorderStats {
            records: inner.log.len(),
            frames: inner.index.len(),
            tabs: inner.index.tabs().count() as u64,
            skipped_on_open: self.skipped_on_open,
            recovered_frames: self.recovered_frames,
        }
    }

    /// Pushes everything written so far to stable storage.
    pub fn sync(&self) -> Result<(), LogError> {
        let mut inner = mutex_lock_or_recover(&self.inner);
        inner.log.sync()?;
        inner.store.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::verify_index;
    use serde_json::json;
    use tempfile::TempDir;

    fn event(ts: i64, kind: u64) -> EventPayload {
        EventPayload::new(json!({"type": kind, "timestamp": ts}))
    }

    #[test]
    fn test_append_indexes_non_custom_events() {
        let dir = TempDir::new().unwrap();
        let recorder = Recorder::open(dir.path(), SyncPolicy::Flush).unwrap();
        let a = recorder.append(TabId(0), &event(1000, 2)).unwrap();
        let marker = recorder.append(TabId(0), &event(1000, 5)).unwrap();
        let b = recorder.append(TabId(0), &event(1000, 3)).unwrap();

        assert_eq!(a.frame.map(|f| (f.k, f.i)), Some((0, 0)));
        assert_eq!((marker.offset, marker.frame), (1, None));
        assert_eq!(b.frame.map(|f| (f.k, f.i)), Some((1, 1)));

        let stats = recorder.stats();
        assert_eq!((stats.records, stats.frames, stats.tabs), (3, 2, 1));
    }

    #[test]
    fn test_rejected_event_leaves_no_trace() {
        let dir = TempDir::new().unwrap();
        let recorder = Recorder::open(dir.path(), SyncPolicy::Flush).unwrap();
        let err = recorder
            .append(TabId(0), &EventPayload::new(json!({"type": 3})))
            .unwrap_err();
        assert!(matches!(err, LogError::MissingTimestamp));
        assert_eq!(recorder.stats().records, 0);
        assert_eq!(recorder.stats().frames, 0);
    }

    #[test]
    fn test_reopen_resumes_counters() {
        let dir = TempDir::new().unwrap();
        {
            let recorder = Recorder::open(dir.path(), SyncPolicy::Data).unwrap();
            recorder.append(TabId(0), &event(1000, 2)).unwrap();
            recorder.append(TabId(1), &event(1000, 2)).unwrap();
        }
        let recorder = Recorder::open(dir.path(), SyncPolicy::Data).unwrap();
        let next = recorder.append(TabId(0), &event(1000, 3)).unwrap();
        assert_eq!(next.frame.map(|f| (f.k, f.i)), Some((2, 2)));
        assert_eq!(recorder.stats().recovered_frames, 0);
        assert!(verify_index(dir.path()).unwrap().is_consistent());
    }

    #[test]
    fn test_reopen_indexes_unindexed_tail() {
        let dir = TempDir::new().unwrap();
        {
            let recorder = Recorder::open(dir.path(), SyncPolicy::Flush).unwrap();
            recorder.append(TabId(0), &event(1, 2)).unwrap();
        }
        // Simulate a crash between the log append and the index append.
        let mut log = EventLog::open(dir.path(), SyncPolicy::Flush).unwrap();
        log.append(TabId(0), &event(2, 3)).unwrap();
        drop(log);

        let recorder = Recorder::open(dir.path(), SyncPolicy::Flush).unwrap();
        assert_eq!(recorder.stats().recovered_frames, 1);
        assert_eq!(recorder.stats().frames, 2);
        assert!(verify_index(dir.path()).unwrap().is_consistent());
    }

    #[test]
    fn test_resolve_and_replay_slice() {
        let dir = TempDir::new().unwrap();
        let recorder = Recorder::open(dir.path(), SyncPolicy::Flush).unwrap();
        recorder.append(TabId(0), &event(1000, 4)).unwrap();
        recorder.append(TabId(1), &event(1100, 4)).unwrap();
        recorder.append(TabId(0), &event(1200, 3)).unwrap();
        recorder.append(TabId(0), &event(1300, 3)).unwrap();

        let resolution = recorder.resolve(&Locator::Timestamp(1250), None).unwrap();
        assert_eq!((resolution.frame.i, resolution.tab), (2, TabId(0)));

        let slice = recorder.replay_slice(&resolution).unwrap();
        let stamps: Vec<_> = slice.iter().map(|r| r.event.timestamp().unwrap()).collect();
        assert_eq!(stamps, vec![1000, 1200]);
        recorder.sync().unwrap();
    }
}
