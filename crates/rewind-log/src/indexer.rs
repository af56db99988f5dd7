use std::collections::BTreeMap;

use crate::event::EventPayload;
use crate::event::TabId;
use crate::event::Timestamp;
use crate::frame::FrameEntry;

/// How far behind the newest timestamp ordinal counters are kept.
pub const ORDINAL_HORIZON_MS: i64 = 60_000;

/// Assigns `(ts, k, i)` to events in arrival order.
///
/// Ordinals are counted per timestamp across all tabs, so two tabs emitting
/// at the same millisecond get distinct ordinals and `(ts, k)` names one
/// frame run-wide. Counters older than the horizon are dropped; an event
/// that arrives that late starts above every dropped counter, which keeps
/// `(ts, k)` unique at the cost of a non-zero first ordinal.
#[derive(Debug, Clone)]
pub struct FrameIndexer {
    next_i: u64,
    ordinals: BTreeMap<Timestamp, u32>,
    newest: Option<Timestamp>,
    /// Highest next-ordinal among dropped counters.
    ceiling: u32,
    horizon: i64,
}

impl Default for FrameIndexer {
    fn default() -> Self {
        Self {
            next_i: 0,
            ordinals: BTreeMap::new(),
            newest: None,
            ceiling: 0,
            horizon: ORDINAL_HORIZON_MS,
        }
    }
}

impl FrameIndexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds counter state from entries already on disk, in arrival order.
    pub fn resume(entries: &[FrameEntry]) -> Self {
        Self::new().replay(entries)
    }

    fn replay(mut self, entries: &[FrameEntry]) -> Self {
        for entry in entries {
            self.commit(entry.ts, entry.k);
            self.next_i = self.next_i.max(entry.i + 1);
        }
        self
    }

    /// `None` for custom markers and payloads without a timestamp.
    pub fn on_event(&mut self, tab_id: TabId, event: &EventPayload) -> Option<FrameEntry> {
        if event.is_custom() {
            return None;
        }
        let ts = event.timestamp()?;
        let k = self.next_ordinal(ts);
        self.commit(ts, k);
        let i = self.next_i;
        self.next_i += 1;
        Some(FrameEntry { ts, k, i, tab_id })
    }

    pub fn next_index(&self) -> u64 {
        self.next_i
    }

    fn cutoff(&self) -> Option<Timestamp> {
        self.newest.map(|newest| newest.saturating_sub(self.horizon))
    }

    fn next_ordinal(&self, ts: Timestamp) -> u32 {
        match self.ordinals.get(&ts) {
            Some(next) => *next,
            None if self.cutoff().is_some_and(|cutoff| ts < cutoff) => self.ceiling,
            None => 0,
        }
    }

    fn commit(&mut self, ts: Timestamp, k: u32) {
        let next = self.ordinals.entry(ts).or_insert(0);
        *next = (*next).max(k + 1);
        self.newest = Some(self.newest.map_or(ts, |newest| newest.max(ts)));
        if let Some(cutoff) = self.cutoff() {
            let kept = self.ordinals.split_off(&cutoff);
            let dropped = std::mem::replace(&mut self.ordinals, kept);
            if let Some(max) = dropped.values().max() {
                self.ceiling = self.ceiling.max(*max);
            }
        }
    }

    #[cfg(test)]
    fn with_horizon(mut self, horizon: i64) -> Self {
        self.horizon = horizon;
        self
    }
}
