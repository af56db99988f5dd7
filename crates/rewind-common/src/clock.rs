use std::time::SystemTime;
use std::time::UNIX_EPOCH;

/// Wall-clock time in epoch milliseconds, saturating instead of failing.
pub fn now_millis() -> i64 {
    let Ok(duration) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}
