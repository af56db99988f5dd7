use std::path::Path;

use rewind_log::reindex;
use rewind_log::verify_index;
use rewind_log::EventLog;
use rewind_log::EventPayload;
use rewind_log::FrameStore;
use rewind_log::LogError;
use rewind_log::Locator;
use rewind_log::Recorder;
use rewind_log::SyncPolicy;
use rewind_log::TabId;
use serde_json::json;
use tempfile::TempDir;

fn event(ts: i64, kind: u64) -> EventPayload {
    EventPayload::new(json!({"type": kind, "timestamp": ts, "data": {}}))
}

fn resolve(recorder: &Recorder, locator: &str) -> Result<(i64, u32), LogError> {
    let locator: Locator = locator.parse()?;
    recorder
        .resolve(&locator, None)
        .map(|r| (r.frame.ts, r.frame.k))
}

#[test]
fn test_round_down_scenario_on_disk() {
    let dir = TempDir::new().unwrap();
    let recorder = Recorder::open(dir.path(), SyncPolicy::Data).unwrap();
    recorder.append(TabId::PRIMARY, &event(1000, 2)).unwrap();
    recorder.append(TabId::PRIMARY, &event(1000, 3)).unwrap();
    recorder.append(TabId::PRIMARY, &event(1500, 3)).unwrap();

    assert_eq!(resolve(&recorder, "@1200").unwrap(), (1000, 1));
    assert!(matches!(
        resolve(&recorder, "@900"),
        Err(LogError::NotFound(_))
    ));
    assert_eq!(resolve(&recorder, "@1500").unwrap(), (1500, 0));
    assert_eq!(resolve(&recorder, "+200").unwrap(), (1000, 1));
    assert_eq!(resolve(&recorder, "1000#0").unwrap(), (1000, 0));
}

#[test]
fn test_live_index_equals_rederived_index_byte_for_byte() {
    let dir = TempDir::new().unwrap();
    {
        let recorder = Recorder::open(dir.path(), SyncPolicy::Flush).unwrap();
        for n in 0..50i64 {
            let tab = TabId((n % 3) as u32);
            let kind = if n % 7 == 0 { 5 } else { 3 };
            recorder.append(tab, &event(1_000 + n / 2, kind)).unwrap();
        }
    }
    let live_global = std::fs::read(FrameStore::global_path(dir.path())).unwrap();
    let live_tab = std::fs::read(FrameStore::tab_path(dir.path(), TabId(1))).unwrap();

    let verification = verify_index(dir.path()).unwrap();
    assert!(verification.is_consistent(), "{:?}", verification);

    copy_log_only(dir.path(), |rebuilt| {
        reindex(rebuilt, SyncPolicy::Data).unwrap();
        assert_eq!(
            std::fs::read(FrameStore::global_path(rebuilt)).unwrap(),
            live_global
        );
        assert_eq!(
            std::fs::read(FrameStore::tab_path(rebuilt, TabId(1))).unwrap(),
            live_tab
        );
    });
}

fn copy_log_only(src: &Path, check: impl FnOnce(&Path)) {
    let other = TempDir::new().unwrap();
    std::fs::copy(
        src.join(EventLog::FILE_NAME),
        other.path().join(EventLog::FILE_NAME),
    )
    .unwrap();
    check(other.path());
}

#[test]
fn test_crash_with_torn_log_tail_recovers_cleanly() {
    let dir = TempDir::new().unwrap();
    {
        let recorder = Recorder::open(dir.path(), SyncPolicy::Data).unwrap();
        recorder.append(TabId(0), &event(10, 2)).unwrap();
        recorder.append(TabId(0), &event(20, 3)).unwrap();
    }
    let log_path = dir.path().join(EventLog::FILE_NAME);
    let mut bytes = std::fs::read(&log_path).unwrap();
    bytes.extend_from_slice(b"{\"tabId\":0,\"event\":{\"type\":3,\"times");
    std::fs::write(&log_path, bytes).unwrap();

    let recorder = Recorder::open(dir.path(), SyncPolicy::Data).unwrap();
    assert_eq!(recorder.stats().records, 2);
    let appended = recorder.append(TabId(0), &event(30, 3)).unwrap();
    assert_eq!(appended.offset, 2);
    assert_eq!(appended.frame.map(|f| f.i), Some(2));
    assert!(verify_index(dir.path()).unwrap().is_consistent());
}

#[test]
fn test_concurrent_appends_keep_index_consistent() {
    let dir = TempDir::new().unwrap();
    let recorder = std::sync::Arc::new(Recorder::open(dir.path(), SyncPolicy::Flush).unwrap());
    let handles: Vec<_> = (0..4u32)
        .map(|tab| {
            let recorder = recorder.clone();
            std::thread::spawn(move || {
                for n in 0..25i64 {
                    recorder.append(TabId(tab), &event(n, 3)).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let frames = recorder.frames();
    assert_eq!(frames.len(), 100);
    assert!(frames.iter().enumerate().all(|(pos, f)| f.i == pos as u64));
    drop(recorder);
    assert!(verify_index(dir.path()).unwrap().is_consistent());
}
