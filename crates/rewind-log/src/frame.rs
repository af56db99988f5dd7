use serde::Deserialize;
use serde::Serialize;

use crate::event::TabId;
use crate::event::Timestamp;

/// One indexed, replayable point of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameEntry {
    pub ts: Timestamp,
    /// Arrival-order ordinal among frames sharing `ts`.
    pub k: u32,
    /// Gapless position over all non-custom events of the run.
    pub i: u64,
    #[serde(rename = "tabId")]
    pub tab_id: TabId,
}

impl FrameEntry {
    /// Sort key of the time-ordered views.
    pub fn key(&self) -> (Timestamp, u32) {
        (self.ts, self.k)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape() {
        let entry = FrameEntry {
            ts: 1000,
            k: 1,
            i: 7,
            tab_id: TabId(2),
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert_eq!(json, r#"{"ts":1000,"k":1,"i":7,"tabId":2}"#);
        assert_eq!(serde_json::from_str::<FrameEntry>(&json).unwrap(), entry);
    }
}
