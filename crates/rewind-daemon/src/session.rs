//! Run metadata, the tab table and the on-disk pointer to the current run.

use std::collections::BTreeMap;
use std::fs;
use std::fs::File;
use std::io::BufReader;
use std::io::BufWriter;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::RwLock;

use chrono::DateTime;
use chrono::Utc;
use rewind_common::rwlock_read_or_recover;
use rewind_common::rwlock_write_or_recover;
use rewind_log::EventPayload;
use rewind_log::RecorderStats;
use rewind_log::TabId;
use rewind_log::Timestamp;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use crate::error::LifecycleError;
use crate::ingest::IngestStats;

pub const MARKER_FILE: &str = "current.json";
pub const RUN_FILE: &str = "run.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
        }
    }
}

impl std::str::FromStr for Viewport {
    type Err = String;

    /// `WIDTHxHEIGHT`, e.g. `1280x720`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .trim()
            .split_once(['x', 'X'])
            .ok_or_else(|| format!("expected WIDTHxHEIGHT, got '{}'", s))?;
        let width = w.trim().parse().map_err(|_| format!("bad width '{}'", w))?;
        let height = h.trim().parse().map_err(|_| format!("bad height '{}'", h))?;
        if width == 0 || height == 0 {
            return Err("viewport dimensions must be positive".to_string());
        }
        Ok(Self { width, height })
    }
}

/// `YYYYMMDD-HHMMSS-<8 hex>`; sorts by start time.
pub fn new_run_id(now: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", now.format("%Y%m%d-%H%M%S"), &suffix[..8])
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunInfo {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub url: Option<String>,
    pub viewport: Viewport,
    pub active: bool,
}

impl RunInfo {
    pub fn new(url: Option<String>, viewport: Viewport) -> Self {
        let started_at = Utc::now();
        Self {
            run_id: new_run_id(started_at),
            started_at,
            url,
            viewport,
            active: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabInfo {
    pub tab_id: TabId,
    pub url: Option<String>,
    pub last_seen_at: Timestamp,
}

/// Tabs seen in the current run. Created on first event, never removed.
#[derive(Debug, Default)]
pub struct TabTable {
    tabs: RwLock<BTreeMap<TabId, TabInfo>>,
}

impl TabTable {
    pub fn from_tabs(tabs: impl IntoIterator<Item = TabInfo>) -> Self {
        Self {
            tabs: RwLock::new(tabs.into_iter().map(|t| (t.tab_id, t)).collect()),
        }
    }

    pub fn observe(&self, tab: TabId, event: &EventPayload) {
        let ts = event.timestamp().unwrap_or_default();
        let mut tabs = rwlock_write_or_recover(&self.tabs);
        let info = tabs.entry(tab).or_insert_with(|| TabInfo {
            tab_id: tab,
            url: None,
            last_seen_at: ts,
        });
        info.last_seen_at = info.last_seen_at.max(ts);
        if let Some(href) = event.href() {
            info.url = Some(href.to_string());
        }
    }

    pub fn get(&self, tab: TabId) -> Option<TabInfo> {
        rwlock_read_or_recover(&self.tabs).get(&tab).cloned()
    }

    pub fn list(&self) -> Vec<TabInfo> {
        rwlock_read_or_recover(&self.tabs).values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        rwlock_read_or_recover(&self.tabs).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Contents of `run.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub run: RunInfo,
    pub tabs: Vec<TabInfo>,
    pub stats: RecorderStats,
    #[serde(default)]
    pub ingest: IngestStats,
    pub updated_at: DateTime<Utc>,
}

impl RunRecord {
    pub fn path(run_dir: &Path) -> PathBuf {
        run_dir.join(RUN_FILE)
    }

    pub fn save(&self, run_dir: &Path) -> Result<(), LifecycleError> {
        write_json_atomic(&Self::path(run_dir), self)
    }

    pub fn load(run_dir: &Path) -> Result<Self, LifecycleError> {
        read_json(&Self::path(run_dir))
    }
}

/// Contents of `current.json`: which run is live and what to reap if the
/// process that wrote it is gone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Marker {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub recorder_pid: u32,
    #[serde(default)]
    pub child_pids: Vec<u32>,
    pub socket_path: PathBuf,
}

/// The state directory: marker plus `runs/`.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn marker_path(&self) -> PathBuf {
        self.dir.join(MARKER_FILE)
    }

    /// A marker that cannot be read is treated as absent.
    pub fn load_marker(&self) -> Option<Marker> {
        let path = self.marker_path();
        if !path.exists() {
            return None;
        }
        match read_json(&path) {
            Ok(marker) => Some(marker),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable session marker");
                None
            }
        }
    }

    pub fn save_marker(&self, marker: &Marker) -> Result<(), LifecycleError> {
        write_json_atomic(&self.marker_path(), marker)
    }

    /// Returns whether a marker was present.
    pub fn clear_marker(&self) -> Result<bool, LifecycleError> {
        let path = self.marker_path();
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(LifecycleError::persistence("remove_marker", path, e)),
        }
    }

    /// Run directories, oldest first.
    pub fn list_runs(&self) -> Result<Vec<PathBuf>, LifecycleError> {
        let runs = self.dir.join("runs");
        let entries = match fs::read_dir(&runs) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(LifecycleError::persistence("list_runs", runs, e)),
        };
        let mut dirs: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .collect();
        dirs.sort();
        Ok(dirs)
    }
}

/// Writes `value` to a temp sibling, then renames it over `path`, so a
/// reader sees either the old or the new document.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), LifecycleError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| LifecycleError::persistence("create_dir", parent, e))?;
    }
    let temp_path = path.with_extension("json.tmp");

    let file = File::create(&temp_path)
        .map_err(|e| LifecycleError::persistence("create_temp", &temp_path, e))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value)?;
    writer
        .flush()
        .map_err(|e| LifecycleError::persistence("write_json", &temp_path, e))?;
    drop(writer);

    fs::rename(&temp_path, path).map_err(|e| LifecycleError::persistence("rename", path, e))?;
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, LifecycleError> {
    let file = File::open(path).map_err(|e| LifecycleError::persistence("open", path, e))?;
    Ok(serde_json::from_reader(BufReader::new(file))?)
}
