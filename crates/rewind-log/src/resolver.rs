use serde::Serialize;

use crate::error::LogError;
use crate::event::TabId;
use crate::frame::FrameEntry;
use crate::index::FrameIndex;
use crate::locator::Locator;

/// A locator pinned to one frame and the tab whose stream replays it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    pub frame: FrameEntry,
    pub tab: TabId,
}

impl Resolution {
    /// Canonical `ts#k` form; resolving it again yields the same frame.
    pub fn locator(&self) -> Locator {
        Locator::Frame {
            ts: self.frame.ts,
            k: self.frame.k,
        }
    }
}

pub struct Resolver<'a> {
    index: &'a FrameIndex,
}

impl<'a> Resolver<'a> {
    pub fn new(index: &'a FrameIndex) -> Self {
        Self { index }
    }

    pub fn resolve(&self, locator: &Locator, tab: Option<TabId>) -> Result<Resolution, LogError> {
        if self.index.is_empty() {
            return Err(LogError::NotFound(format!("{} (no frames recorded)", locator)));
        }
        match *locator {
            Locator::Index(i) => {
                let frame = *self.index.get(i).ok_or_else(|| {
                    LogError::NotFound(format!(
                        "{} (run has {} frames)",
                        locator,
                        self.index.len()
                    ))
                })?;
                if let Some(tab) = tab.filter(|t| *t != frame.tab_id) {
                    return Err(LogError::NotFound(format!(
                        "{} on tab {} (frame belongs to tab {})",
                        locator, tab, frame.tab_id
                    )));
                }
                Ok(Resolution {
                    frame,
                    tab: frame.tab_id,
                })
            }
            Locator::Frame { ts, k } => {
                let frame = *self
                    .index
                    .find_exact(ts, k, tab)
                    .ok_or_else(|| LogError::NotFound(locator.to_string()))?;
                Ok(Resolution {
                    frame,
                    tab: frame.tab_id,
                })
            }
            Locator::Timestamp(target) => self.floor(locator, target, tab),
            Locator::Offset(ms) => {
                let first = self
                    .index
                    .first_timestamp()
                    .ok_or_else(|| LogError::NotFound(locator.to_string()))?;
                let target = first.saturating_add(ms);
                self.floor(locator, target, tab)
            }
            Locator::WallClock(dt) => self.floor(locator, dt.timestamp_millis(), tab),
        }
    }

    fn floor(
        &self,
        locator: &Locator,
        target: i64,
        tab: Option<TabId>,
    ) -> Result<Resolution, LogError> {
        let not_found = || LogError::NotFound(format!("{} (before the first frame)", locator));
        let matched = *self.index.floor(target, tab).ok_or_else(not_found)?;
        let tab = tab.unwrap_or(matched.tab_id);
        // Re-resolve against the inferred tab's own stream.
        let frame = *self.index.floor(target, Some(tab)).ok_or_else(not_found)?;
        Ok(Resolution { frame, tab })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono::Utc;

    fn entry(ts: i64, k: u32, i: u64, tab: u32) -> FrameEntry {
        FrameEntry {
            ts,
            k,
            i,
            tab_id: TabId(tab),
        }
    }

    fn scenario() -> FrameIndex {
        FrameIndex::from_entries([
            entry(1000, 0, 0, 0),
            entry(1000, 1, 1, 0),
            entry(1500, 0, 2, 0),
        ])
    }

    fn resolve(index: &FrameIndex, loc: &str) -> Result<Resolution, LogError> {
        Resolver::new(index).resolve(&loc.parse().unwrap(), None)
    }

    #[test]
    fn test_round_down_scenario() {
        let index = scenario();
        assert_eq!(resolve(&index, "@1200").unwrap().frame.key(), (1000, 1));
        assert!(matches!(
            resolve(&index, "@900"),
            Err(LogError::NotFound(_))
        ));
        assert_eq!(resolve(&index, "@1500").unwrap().frame.key(), (1500, 0));
        assert_eq!(resolve(&index, "@9000").unwrap().frame.i, 2);
    }

    #[test]
    fn test_index_is_pass_through_with_bounds() {
        let index = scenario();
        assert_eq!(resolve(&index, "1").unwrap().frame.i, 1);
        assert!(matches!(resolve(&index, "3"), Err(LogError::NotFound(_))));
    }

    #[test]
    fn test_index_on_another_tab_is_rejected() {
        let index = FrameIndex::from_entries([entry(1000, 0, 0, 0), entry(1100, 0, 1, 1)]);
        let resolver = Resolver::new(&index);
        let own = resolver.resolve(&Locator::Index(1), Some(TabId(1))).unwrap();
        assert_eq!(own.tab, TabId(1));
        let err = resolver
            .resolve(&Locator::Index(1), Some(TabId(0)))
            .unwrap_err();
        assert!(matches!(err, LogError::NotFound(_)));
        assert!(err.to_string().contains("belongs to tab 1"), "{}", err);
    }

    #[test]
    fn test_exact_frame() {
        let index = scenario();
        assert_eq!(resolve(&index, "1000#1").unwrap().frame.i, 1);
        assert!(resolve(&index, "1000#2").is_err());
    }

    #[test]
    fn test_offset_from_first_frame() {
        let index = scenario();
        assert_eq!(resolve(&index, "+499").unwrap().frame.key(), (1000, 1));
        assert_eq!(resolve(&index, "+500ms").unwrap().frame.key(), (1500, 0));
    }

    #[test]
    fn test_wall_clock() {
        let base = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let ms = base.timestamp_millis();
        let index = FrameIndex::from_entries([entry(ms, 0, 0, 0), entry(ms + 2000, 0, 1, 0)]);
        assert_eq!(resolve(&index, "2024-05-01T12:00:01Z").unwrap().frame.i, 0);
        assert_eq!(resolve(&index, "2024-05-01T12:00:02Z").unwrap().frame.i, 1);
    }

    #[test]
    fn test_tab_inference_and_filter() {
        let index = FrameIndex::from_entries([
            entry(10, 0, 0, 0),
            entry(20, 0, 1, 1),
            entry(30, 0, 2, 0),
        ]);
        let inferred = resolve(&index, "@25").unwrap();
        assert_eq!((inferred.frame.i, inferred.tab), (1, TabId(1)));

        let filtered = Resolver::new(&index)
            .resolve(&Locator::Timestamp(25), Some(TabId(0)))
            .unwrap();
        assert_eq!((filtered.frame.i, filtered.tab), (0, TabId(0)));

        assert!(Resolver::new(&index)
            .resolve(&Locator::Timestamp(15), Some(TabId(1)))
            .is_err());
    }

    #[test]
    fn test_canonical_locator_is_idempotent() {
        let index = scenario();
        for i in 0..3 {
            let first = resolve(&index, &i.to_string()).unwrap();
            let again = Resolver::new(&index).resolve(&first.locator(), None).unwrap();
            assert_eq!(again.frame, first.frame);
        }
    }

    #[test]
    fn test_empty_index_is_not_found() {
        let index = FrameIndex::new();
        for loc in ["0", "@5", "5#0", "+0", "2024-05-01T12:00:00Z"] {
            assert!(matches!(resolve(&index, loc), Err(LogError::NotFound(_))));
        }
    }
}
