use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;

use crate::error::LogError;
use crate::event::TabId;
use crate::frame::FrameEntry;
use crate::jsonl::write_atomic;
use crate::jsonl::JsonlIter;
use crate::jsonl::JsonlWriter;
use crate::jsonl::SyncPolicy;

/// On-disk frame index: one global file plus one file per tab.
pub struct FrameStore {
    dir: PathBuf,
    policy: SyncPolicy,
    global: JsonlWriter,
    tabs: BTreeMap<TabId, JsonlWriter>,
}

/// Entries read back from a frame file, with the count of unusable lines.
#[derive(Debug, Default)]
pub(crate) struct Loaded {
    pub entries: Vec<FrameEntry>,
    pub skipped: u64,
}

impl FrameStore {
    pub const GLOBAL_FILE: &'static str = "frames.jsonl";
    pub const TAB_DIR: &'static str = "frames";

    pub fn global_path(dir: &Path) -> PathBuf {
        dir.join(Self::GLOBAL_FILE)
    }

    pub fn tab_path(dir: &Path, tab: TabId) -> PathBuf {
        dir.join(Self::TAB_DIR).join(format!("tab-{}.jsonl", tab))
    }

    pub fn open(dir: &Path, policy: SyncPolicy) -> Result<Self, LogError> {
        Ok(Self {
            dir: dir.to_path_buf(),
            policy,
            global: JsonlWriter::open(&Self::global_path(dir), policy)?,
            tabs: BTreeMap::new(),
        })
    }

    /// Writes `entry` to the global file, then to its tab's file.
    pub fn append(&mut self, entry: &FrameEntry) -> Result<(), LogError> {
        self.global.append(entry)?;
        let writer = match self.tabs.entry(entry.tab_id) {
            std::collections::btree_map::Entry::Occupied(slot) => slot.into_mut(),
            std::collections::btree_map::Entry::Vacant(slot) => slot.insert(JsonlWriter::open(
                &Self::tab_path(&self.dir, entry.tab_id),
                self.policy,
            )?),
        };
        writer.append(entry)
    }

    pub fn sync(&mut self) -> Result<(), LogError> {
        self.global.sync()?;
        for writer in self.tabs.values_mut() {
            writer.sync()?;
        }
        Ok(())
    }

    pub(crate) fn load(path: &Path) -> Result<Loaded, LogError> {
        let mut iter = JsonlIter::<FrameEntry>::open(path)?;
        let entries: Vec<FrameEntry> = iter.by_ref().collect();
        Ok(Loaded {
            entries,
            skipped: iter.skipped(),
        })
    }

    /// Tabs that have a per-tab file on disk.
    pub(crate) fn tab_files(dir: &Path) -> Result<Vec<TabId>, LogError> {
        let tab_dir = dir.join(Self::TAB_DIR);
        let read_dir = match std::fs::read_dir(&tab_dir) {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(LogError::io("read_dir", &tab_dir, e)),
        };
        let mut tabs = Vec::new();
        for entry in read_dir {
            let entry = entry.map_err(|e| LogError::io("read_dir", &tab_dir, e))?;
            let name = entry.file_name();
            let tab = name
                .to_str()
                .and_then(|n| n.strip_prefix("tab-"))
                .and_then(|n| n.strip_suffix(".jsonl"))
                .and_then(|n| n.parse::<TabId>().ok());
            if let Some(tab) = tab {
                tabs.push(tab);
            }
        }
        tabs.sort();
        Ok(tabs)
    }

    /// Replaces a frame file wholesale. Must not run while a writer holds it.
    pub(crate) fn rewrite(path: &Path, entries: &[FrameEntry]) -> Result<(), LogError> {
        write_atomic(path, entries)
    }

    /// Appends `entries` to an existing frame file outside of a live store.
    pub(crate) fn extend(
        path: &Path,
        entries: &[FrameEntry],
        policy: SyncPolicy,
    ) -> Result<(), LogError> {
        let mut writer = JsonlWriter::open(path, policy)?;
        for entry in entries {
            writer.append(entry)?;
        }
        Ok(())
    }
}
