//! Cache key construction
//!
//! Keys follow a colon hierarchy so pattern invalidation can target a whole
//! family: `task:<id>` is a single entity, `tasks:calendar:*` every derived
//! calendar range. All key spelling lives here.

use chrono::{Datelike, Duration, NaiveDate, Utc};

use crate::domain::EntityKind;

/// Prefix shared by all derived calendar range keys
pub const CALENDAR_PREFIX: &str = "tasks:calendar:";

/// Days before today covered by the hot calendar window
pub const HOT_WINDOW_PAST_DAYS: i64 = 30;

/// Days after today covered by the hot calendar window
pub const HOT_WINDOW_FUTURE_DAYS: i64 = 60;

/// Key for a single cached entity
pub fn entity_key(kind: EntityKind, id: &str) -> String {
    format!("{}:{}", kind.prefix(), id)
}

/// Key for the cached full listing of a kind
pub fn list_key(kind: EntityKind) -> String {
    format!("{}:list", kind.prefix())
}

/// Derived key for a calendar range query
pub fn calendar_range_key(start: NaiveDate, end: NaiveDate) -> String {
    format!(
        "{}start={:04}-{:02}-{:02}:end={:04}-{:02}-{:02}",
        CALENDAR_PREFIX,
        start.year(),
        start.month(),
        start.day(),
        end.year(),
        end.month(),
        end.day()
    )
}

/// The hot calendar window the warmup keeps populated
pub fn hot_calendar_window() -> (NaiveDate, NaiveDate) {
    let today = Utc::now().date_naive();
    (
        today - Duration::days(HOT_WINDOW_PAST_DAYS),
        today + Duration::days(HOT_WINDOW_FUTURE_DAYS),
    )
}

/// Key of the hot calendar window
pub fn hot_calendar_key() -> String {
    let (start, end) = hot_calendar_window();
    calendar_range_key(start, end)
}

/// Invalidation pattern matching every cached entity of a kind
pub fn kind_pattern(kind: EntityKind) -> String {
    format!("{}:*", kind.prefix())
}

/// Invalidation pattern matching every derived calendar key
pub fn calendar_pattern() -> String {
    format!("{}*", CALENDAR_PREFIX)
}

/// Hourly bucket key for persisted latency snapshots
pub fn latency_bucket_key(at: chrono::DateTime<Utc>) -> String {
    format!("metrics:latency:{}", at.format("%Y-%m-%dT%H"))
}

/// First segment of a key, used to group metrics
pub fn key_prefix(key: &str) -> &str {
    key.split(':').next().unwrap_or(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_shapes() {
        assert_eq!(entity_key(EntityKind::Task, "abc"), "task:abc");
        assert_eq!(list_key(EntityKind::Member), "member:list");
        let key = calendar_range_key(
            NaiveDate::from_ymd_opt(2025, 8, 26).unwrap(),
            NaiveDate::from_ymd_opt(2025, 10, 25).unwrap(),
        );
        assert_eq!(key, "tasks:calendar:start=2025-08-26:end=2025-10-25");
    }

    #[test]
    fn test_prefix_extraction() {
        assert_eq!(key_prefix("task:abc"), "task");
        assert_eq!(key_prefix("tasks:calendar:start=x"), "tasks");
        assert_eq!(key_prefix("plain"), "plain");
    }

    #[test]
    fn test_latency_bucket_key_shape() {
        let at = "2025-09-01T14:30:00Z".parse().unwrap();
        assert_eq!(latency_bucket_key(at), "metrics:latency:2025-09-01T14");
    }

    #[test]
    fn test_hot_window_span() {
        let (start, end) = hot_calendar_window();
        assert_eq!((end - start).num_days(), HOT_WINDOW_PAST_DAYS + HOT_WINDOW_FUTURE_DAYS);
    }
}
