use std::time::Duration;

use time::OffsetDateTime;

/// Current wall-clock time as unix seconds.
pub fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

/// Unix seconds `ttl` from now.
pub fn unix_after(ttl: Duration) -> i64 {
    now_unix().saturating_add(i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_after_adds_whole_seconds() {
        let before = now_unix();
        let later = unix_after(Duration::from_secs(300));
        assert!(later - before >= 300);
        assert!(later - before <= 301);
    }
}
