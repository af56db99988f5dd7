use std::collections::BTreeMap;

use crate::event::TabId;
use crate::event::Timestamp;
use crate::frame::FrameEntry;

/// In-memory frame index with three views over the same entries:
/// arrival order (`i`), global time order, and per-tab time order.
#[derive(Debug, Default, Clone)]
pub struct FrameIndex {
    by_index: Vec<FrameEntry>,
    by_time: Vec<FrameEntry>,
    by_tab: BTreeMap<TabId, Vec<FrameEntry>>,
}

impl FrameIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the index from entries in arrival order.
    pub fn from_entries(entries: impl IntoIterator<Item = FrameEntry>) -> Self {
        let mut index = Self::new();
        for entry in entries {
            index.insert(entry);
        }
        index
    }

    pub fn insert(&mut self, entry: FrameEntry) {
        self.by_index.push(entry);
        insert_sorted(&mut self.by_time, entry);
        insert_sorted(self.by_tab.entry(entry.tab_id).or_default(), entry);
    }

    pub fn len(&self) -> u64 {
        self.by_index.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.by_index.is_empty()
    }

    pub fn get(&self, i: u64) -> Option<&FrameEntry> {
        self.by_index.get(usize::try_from(i).ok()?)
    }

    /// Entries in arrival order.
    pub fn entries(&self) -> &[FrameEntry] {
        &self.by_index
    }

    pub fn tab_entries(&self, tab: TabId) -> &[FrameEntry] {
        self.by_tab.get(&tab).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn tabs(&self) -> impl Iterator<Item = TabId> + '_ {
        self.by_tab.keys().copied()
    }

    pub fn first_timestamp(&self) -> Option<Timestamp> {
        self.by_time.first().map(|e| e.ts)
    }

    pub fn last(&self) -> Option<&FrameEntry> {
        self.by_index.last()
    }

    pub fn find_exact(&self, ts: Timestamp, k: u32, tab: Option<TabId>) -> Option<&FrameEntry> {
        let view = self.view(tab);
        let pos = view.partition_point(|e| e.key() < (ts, k));
        view.get(pos).filter(|e| e.key() == (ts, k))
    }

    /// Rightmost entry with `ts <= target`; among equal timestamps that is
    /// the highest ordinal.
    pub fn floor(&self, target: Timestamp, tab: Option<TabId>) -> Option<&FrameEntry> {
        let view = self.view(tab);
        let pos = view.partition_point(|e| e.ts <= target);
        pos.checked_sub(1).and_then(|p| view.get(p))
    }

    fn view(&self, tab: Option<TabId>) -> &[FrameEntry] {
        match tab {
            Some(tab) => self.tab_entries(tab),
            None => &self.by_time,
        }
    }
}

fn insert_sorted(view: &mut Vec<FrameEntry>, entry: FrameEntry) {
    let pos = view.partition_point(|e| e.key() <= entry.key());
    view.insert(pos, entry);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(ts: i64, k: u32, i: u64, tab: u32) -> FrameEntry {
        FrameEntry {
            ts,
            k,
            i,
            tab_id: TabId(tab),
        }
    }

    fn scenario() -> FrameIndex {
        FrameIndex::from_entries([entry(1000, 0, 0, 0), entry(1000, 1, 1, 0), entry(1500, 0, 2, 0)])
    }

    #[test]
    fn test_floor_rounds_down_to_latest_ordinal() {
        let index = scenario();
        assert_eq!(index.floor(1200, None).map(|e| e.key()), Some((1000, 1)));
        assert_eq!(index.floor(1000, None).map(|e| e.key()), Some((1000, 1)));
        assert_eq!(index.floor(1500, None).map(|e| e.key()), Some((1500, 0)));
        assert_eq!(index.floor(99_999, None).map(|e| e.i), Some(2));
        assert!(index.floor(900, None).is_none());
    }

    #[test]
    fn test_floor_with_tab_filter() {
        let index = FrameIndex::from_entries([
            entry(10, 0, 0, 0),
            entry(20, 0, 1, 1),
            entry(30, 0, 2, 0),
        ]);
        assert_eq!(index.floor(25, Some(TabId(0))).map(|e| e.i), Some(0));
        assert_eq!(index.floor(25, None).map(|e| e.i), Some(1));
        assert!(index.floor(15, Some(TabId(1))).is_none());
        assert!(index.floor(100, Some(TabId(9))).is_none());
    }

    #[test]
    fn test_find_exact() {
        let index = scenario();
        assert_eq!(index.find_exact(1000, 1, None).map(|e| e.i), Some(1));
        assert!(index.find_exact(1000, 2, None).is_none());
        assert!(index.find_exact(1000, 0, Some(TabId(1))).is_none());
    }

    #[test]
    fn test_interleaved_tabs_keep_time_view_sorted() {
        let index = FrameIndex::from_entries([
            entry(50, 0, 0, 1),
            entry(40, 0, 1, 0),
            entry(60, 0, 2, 1),
        ]);
        let times: Vec<_> = index.by_time.iter().map(|e| e.ts).collect();
        assert_eq!(times, vec![40, 50, 60]);
        assert_eq!(index.first_timestamp(), Some(40));
        assert_eq!(index.get(1).map(|e| e.ts), Some(40));
        assert_eq!(index.last().map(|e| e.i), Some(2));
        assert_eq!(index.tabs().collect::<Vec<_>>(), vec![TabId(0), TabId(1)]);
        assert_eq!(index.tab_entries(TabId(1)).len(), 2);
    }

    #[test]
    fn test_empty_index() {
        let index = FrameIndex::new();
        assert!(index.is_empty());
        assert!(index.first_timestamp().is_none());
        assert!(index.floor(i64::MAX, None).is_none());
        assert!(index.tab_entries(TabId::PRIMARY).is_empty());
    }
}
