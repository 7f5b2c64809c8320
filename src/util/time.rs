use chrono::Utc;

/// Current wall-clock time as a unix timestamp in seconds.
#[must_use]
pub fn now_unix() -> i64 {
    Utc::now().timestamp()
}
