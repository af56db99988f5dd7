//! Keeps the frame files consistent with the event log.
//!
//! The log is the source of truth. The index is re-derived from it on every
//! open and the stored files are brought in line: an exact match is left
//! alone, a stored prefix gets the missing tail appended, anything else is
//! rewritten atomically.

use std::collections::BTreeSet;
use std::path::Path;
use std::path::PathBuf;

use serde::Serialize;
use tracing::info;
use tracing::warn;

use crate::error::LogError;
use crate::event::EventRecord;
use crate::event::TabId;
use crate::event_log::EventIter;
use crate::event_log::EventLog;
use crate::frame::FrameEntry;
use crate::indexer::FrameIndexer;
use crate::jsonl::SyncPolicy;
use crate::store::FrameStore;

/// Pure re-derivation of the frame index from records in log order.
pub fn derive_index(records: impl IntoIterator<Item = EventRecord>) -> Vec<FrameEntry> {
    let mut indexer = FrameIndexer::new();
    records
        .into_iter()
        .filter_map(|record| indexer.on_event(record.tab_id, &record.event))
        .collect()
}

/// Result of comparing stored frame files with the log-derived index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexVerification {
    pub derived_frames: u64,
    pub stored_frames: u64,
    /// Derived frames the stored global file lacks, when it is a prefix.
    pub missing_tail: u64,
    /// First line (zero-based) of the global file that differs.
    pub first_mismatch: Option<u64>,
    /// Tabs whose per-tab file differs from the derived index.
    pub tab_mismatches: Vec<TabId>,
}

impl IndexVerification {
    pub fn is_consistent(&self) -> bool {
        self.first_mismatch.is_none() && self.missing_tail == 0 && self.tab_mismatches.is_empty()
    }
}

#[derive(Debug, Default)]
pub(crate) struct Reconciled {
    pub entries: Vec<FrameEntry>,
    pub skipped_records: u64,
    pub recovered_frames: u64,
}

fn derive_from_log(dir: &Path) -> Result<(Vec<FrameEntry>, u64), LogError> {
    let mut iter = EventIter::open(&dir.join(EventLog::FILE_NAME))?;
    let entries = derive_index(iter.by_ref().map(|logged| logged.record));
    Ok((entries, iter.skipped()))
}

fn encode(entries: &[FrameEntry]) -> Result<Vec<u8>, LogError> {
    let mut bytes = Vec::new();
    for entry in entries {
        serde_json::to_writer(&mut bytes, entry)?;
        bytes.push(b'\n');
    }
    Ok(bytes)
}

fn read_bytes(path: &Path) -> Result<Vec<u8>, LogError> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(LogError::io("read", path, e)),
    }
}

fn tab_slice(entries: &[FrameEntry], tab: TabId) -> Vec<FrameEntry> {
    entries.iter().filter(|e| e.tab_id == tab).copied().collect()
}

fn all_tabs(dir: &Path, entries: &[FrameEntry]) -> Result<BTreeSet<TabId>, LogError> {
    let mut tabs: BTreeSet<TabId> = entries.iter().map(|e| e.tab_id).collect();
    tabs.extend(FrameStore::tab_files(dir)?);
    Ok(tabs)
}

#[derive(Debug, PartialEq, Eq)]
enum FileRepair {
    Intact,
    AppendedTail(u64),
    Rewritten,
    Removed,
}

fn repair_file(
    path: &Path,
    expected: &[FrameEntry],
    policy: SyncPolicy,
) -> Result<FileRepair, LogError> {
    let stored = FrameStore::load(path)?;
    if stored.skipped == 0 && stored.entries == expected {
        return Ok(FileRepair::Intact);
    }
    if expected.is_empty() {
        std::fs::remove_file(path).map_err(|e| LogError::io("remove", path, e))?;
        return Ok(FileRepair::Removed);
    }
    if stored.skipped == 0 && expected.starts_with(&stored.entries) {
        let tail = &expected[stored.entries.len()..];
        FrameStore::extend(path, tail, policy)?;
        return Ok(FileRepair::AppendedTail(tail.len() as u64));
    }
    FrameStore::rewrite(path, expected)?;
    Ok(FileRepair::Rewritten)
}

fn log_repair(path: &Path, repair: &FileRepair) {
    match repair {
        FileRepair::Intact => {}
        FileRepair::AppendedTail(n) => info!(
            path = %path.display(),
            frames = n,
            "Indexed unindexed tail of the event log"
        ),
        FileRepair::Rewritten => warn!(
            path = %path.display(),
            "Frame file disagreed with the event log, rewrote it"
        ),
        FileRepair::Removed => warn!(
            path = %path.display(),
            "Removed frame file for a tab with no logged frames"
        ),
    }
}

/// Brings every frame file under `dir` in line with the event log. Must run
/// before a [`FrameStore`] is opened on `dir`.
pub(crate) fn reconcile(dir: &Path, policy: SyncPolicy) -> Result<Reconciled, LogError> {
    let (entries, skipped_records) = derive_from_log(dir)?;

    let global = FrameStore::global_path(dir);
    let repair = repair_file(&global, &entries, policy)?;
    log_repair(&global, &repair);
    let recovered_frames = match repair {
        FileRepair::AppendedTail(n) => n,
        FileRepair::Rewritten | FileRepair::Removed => entries.len() as u64,
        FileRepair::Intact => 0,
    };

    for tab in all_tabs(dir, &entries)? {
        let path = FrameStore::tab_path(dir, tab);
        let repair = repair_file(&path, &tab_slice(&entries, tab), policy)?;
        log_repair(&path, &repair);
    }

    Ok(Reconciled {
        entries,
        skipped_records,
        recovered_frames,
    })
}

/// Byte-for-byte comparison of the stored frame files with a fresh
/// derivation from the event log. Never writes.
pub fn verify_index(dir: &Path) -> Result<IndexVerification, LogError> {
    let (entries, _) = derive_from_log(dir)?;
    let expected = encode(&entries)?;
    let stored = read_bytes(&FrameStore::global_path(dir))?;
    let stored_frames = FrameStore::load(&FrameStore::global_path(dir))?.entries.len() as u64;

    let mut verification = IndexVerification {
        derived_frames: entries.len() as u64,
        stored_frames,
        ..Default::default()
    };

    if stored != expected {
        if expected.starts_with(&stored) && (stored.is_empty() || stored.ends_with(b"\n")) {
            verification.missing_tail = verification.derived_frames - stored_frames;
        } else {
            verification.first_mismatch = Some(first_differing_line(&stored, &expected));
        }
    }

    for tab in all_tabs(dir, &entries)? {
        let expected = encode(&tab_slice(&entries, tab))?;
        if read_bytes(&FrameStore::tab_path(dir, tab))? != expected {
            verification.tab_mismatches.push(tab);
        }
    }
    Ok(verification)
}

fn first_differing_line(a: &[u8], b: &[u8]) -> u64 {
    let mut lines_a = a.split(|c| *c == b'\n');
    let mut lines_b = b.split(|c| *c == b'\n');
    let mut line = 0;
    loop {
        match (lines_a.next(), lines_b.next()) {
            (Some(x), Some(y)) if x == y => line += 1,
            _ => return line,
        }
    }
}

/// Re-derives the frame files of a run from its event log, rewriting any
/// that differ. Returns what was found before the rewrite.
pub fn reindex(dir: &Path, policy: SyncPolicy) -> Result<IndexVerification, LogError> {
    let before = verify_index(dir)?;
    if before.is_consistent() {
        return Ok(before);
    }
    let (entries, _) = derive_from_log(dir)?;
    let mut rewritten: Vec<PathBuf> = Vec::new();
    let global = FrameStore::global_path(dir);
    FrameStore::rewrite(&global, &entries)?;
    rewritten.push(global);
    for tab in all_tabs(dir, &entries)? {
        let path = FrameStore::tab_path(dir, tab);
        let repair = repair_file(&path, &tab_slice(&entries, tab), policy)?;
        if repair != FileRepair::Intact {
            rewritten.push(path);
        }
    }
    info!(
        dir = %dir.display(),
        frames = entries.len(),
        files = rewritten.len(),
        "Rebuilt frame index from event log"
    );
    Ok(before)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventPayload;
    use serde_json::json;
    use tempfile::TempDir;

    fn write_log(dir: &Path, events: &[(u32, i64, u64)]) {
        let mut log = EventLog::open(dir, SyncPolicy::Flush).unwrap();
        for (tab, ts, kind) in events {
            log.append(
                TabId(*tab),
                &EventPayload::new(json!({"type": kind, "timestamp": ts})),
            )
            .unwrap();
        }
    }

    const EVENTS: &[(u32, i64, u64)] = &[(0, 10, 2), (1, 10, 2), (0, 11, 5), (0, 12, 3), (1, 13, 3)];

    #[test]
    fn test_derive_index_skips_markers() {
        let records = EVENTS.iter().map(|(tab, ts, kind)| {
            EventRecord::new(
                TabId(*tab),
                EventPayload::new(json!({"type": kind, "timestamp": ts})),
            )
        });
        let entries = derive_index(records);
        let keys: Vec<_> = entries.iter().map(|e| (e.ts, e.k, e.i)).collect();
        assert_eq!(keys, vec![(10, 0, 0), (10, 1, 1), (12, 0, 2), (13, 0, 3)]);
    }

    #[test]
    fn test_reconcile_builds_missing_files() {
        let dir = TempDir::new().unwrap();
        write_log(dir.path(), EVENTS);
        let reconciled = reconcile(dir.path(), SyncPolicy::Flush).unwrap();
        assert_eq!(reconciled.recovered_frames, 4);
        assert!(verify_index(dir.path()).unwrap().is_consistent());
    }

    #[test]
    fn test_reconcile_appends_tail_to_stored_prefix() {
        let dir = TempDir::new().unwrap();
        write_log(dir.path(), EVENTS);
        reconcile(dir.path(), SyncPolicy::Flush).unwrap();

        let global = FrameStore::global_path(dir.path());
        let text = std::fs::read_to_string(&global).unwrap();
        let kept: String = text.lines().take(2).map(|l| format!("{}\n", l)).collect();
        std::fs::write(&global, kept).unwrap();

        let verification = verify_index(dir.path()).unwrap();
        assert_eq!(verification.missing_tail, 2);
        assert_eq!(verification.first_mismatch, None);

        let reconciled = reconcile(dir.path(), SyncPolicy::Flush).unwrap();
        assert_eq!(reconciled.recovered_frames, 2);
        assert_eq!(std::fs::read_to_string(&global).unwrap(), text);
    }

    #[test]
    fn test_reconcile_rewrites_index_ahead_of_log() {
        let dir = TempDir::new().unwrap();
        write_log(dir.path(), EVENTS);
        reconcile(dir.path(), SyncPolicy::Flush).unwrap();

        let global = FrameStore::global_path(dir.path());
        let mut text = std::fs::read_to_string(&global).unwrap();
        text.push_str("{\"ts\":99,\"k\":0,\"i\":4,\"tabId\":7}\n");
        std::fs::write(&global, text).unwrap();
        std::fs::write(FrameStore::tab_path(dir.path(), TabId(7)), "{}\n").unwrap();

        let verification = verify_index(dir.path()).unwrap();
        assert_eq!(verification.first_mismatch, Some(4));
        assert_eq!(verification.tab_mismatches, vec![TabId(7)]);

        reconcile(dir.path(), SyncPolicy::Flush).unwrap();
        assert!(verify_index(dir.path()).unwrap().is_consistent());
        assert!(!FrameStore::tab_path(dir.path(), TabId(7)).exists());
    }

    #[test]
    fn test_reindex_reports_prior_state_and_repairs() {
        let dir = TempDir::new().unwrap();
        write_log(dir.path(), EVENTS);
        let before = reindex(dir.path(), SyncPolicy::Data).unwrap();
        assert_eq!(before.missing_tail, 4);
        assert_eq!(before.stored_frames, 0);

        let after = reindex(dir.path(), SyncPolicy::Data).unwrap();
        assert!(after.is_consistent());
        assert_eq!(after.derived_frames, 4);
    }
}
