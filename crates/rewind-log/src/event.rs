use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

/// Epoch milliseconds as carried by captured events.
pub type Timestamp = i64;

/// `type` discriminant the capture library uses for out-of-band markers.
pub const CUSTOM_EVENT_TYPE: u64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TabId(pub u32);

impl TabId {
    /// The page the session was started on.
    pub const PRIMARY: TabId = TabId(0);

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for TabId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TabId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(TabId)
    }
}

impl From<u32> for TabId {
    fn from(value: u32) -> Self {
        TabId(value)
    }
}

/// A captured event. The log never looks inside it beyond `timestamp`,
/// `type` and, for tab bookkeeping, `data.href`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventPayload(Value);

impl EventPayload {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn timestamp(&self) -> Option<Timestamp> {
        let ts = self.0.get("timestamp")?;
        ts.as_i64().or_else(|| ts.as_f64().map(|f| f.floor() as i64))
    }

    pub fn event_type(&self) -> Option<&Value> {
        self.0.get("type")
    }

    pub fn is_custom(&self) -> bool {
        match self.event_type() {
            Some(Value::Number(n)) => n.as_u64() == Some(CUSTOM_EVENT_TYPE),
            Some(Value::String(s)) => s == "custom",
            _ => false,
        }
    }

    /// Page URL announced by meta events.
    pub fn href(&self) -> Option<&str> {
        self.0.get("data")?.get("href")?.as_str()
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

impl From<Value> for EventPayload {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub tab_id: TabId,
    pub event: EventPayload,
}

impl EventRecord {
    pub fn new(tab_id: TabId, event: EventPayload) -> Self {
        Self { tab_id, event }
    }
}

/// Borrowed form used on the append path to avoid cloning payloads.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct EventRecordRef<'a> {
    pub tab_id: TabId,
    pub event: &'a EventPayload,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_timestamp_accepts_integers_and_floats() {
        assert_eq!(
            EventPayload::new(json!({"timestamp": 1000, "type": 3})).timestamp(),
            Some(1000)
        );
        assert_eq!(
            EventPayload::new(json!({"timestamp": 1000.9})).timestamp(),
            Some(1000)
        );
        assert_eq!(EventPayload::new(json!({"type": 3})).timestamp(), None);
        assert_eq!(
            EventPayload::new(json!({"timestamp": "1000"})).timestamp(),
            None
        );
    }

    #[test]
    fn test_custom_detection() {
        assert!(EventPayload::new(json!({"type": 5, "timestamp": 1})).is_custom());
        assert!(EventPayload::new(json!({"type": "custom", "timestamp": 1})).is_custom());
        assert!(!EventPayload::new(json!({"type": 2, "timestamp": 1})).is_custom());
        assert!(!EventPayload::new(json!({"timestamp": 1})).is_custom());
    }

    #[test]
    fn test_href_from_meta_event() {
        let meta = EventPayload::new(json!({
            "type": 4,
            "timestamp": 1,
            "data": {"href": "https://example.com/", "width": 1280}
        }));
        assert_eq!(meta.href(), Some("https://example.com/"));
    }

    #[test]
    fn test_record_wire_shape() {
        let record = EventRecord::new(TabId(2), EventPayload::new(json!({"timestamp": 5})));
        let json = serde_json::to_string(&record).unwrap();
        assert_eq!(json, r#"{"tabId":2,"event":{"timestamp":5}}"#);

        let borrowed = EventRecordRef {
            tab_id: record.tab_id,
            event: &record.event,
        };
        assert_eq!(serde_json::to_string(&borrowed).unwrap(), json);
    }

    #[test]
    fn test_tab_id_parse() {
        assert_eq!(" 3 ".parse::<TabId>().unwrap(), TabId(3));
        assert!("-1".parse::<TabId>().is_err());
    }
}
