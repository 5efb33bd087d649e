//! Wall-clock helpers

use chrono::{DateTime, Duration, Utc};

pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Current time, bumped so it is strictly later than `previous`
pub fn now_after(previous: DateTime<Utc>) -> DateTime<Utc> {
    let current = Utc::now();
    if current > previous {
        current
    } else {
        previous + Duration::milliseconds(1)
    }
}
