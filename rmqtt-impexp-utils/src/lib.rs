//! Utilities shared by the export/import engine crates
//!
//! ## Core Features:
//! - **Duration Conversion**: String-to-Duration parsing supporting multiple time units
//! - **Timestamp Utilities**: Millisecond timestamps and formatting
//! - **Counters**: Active-request [`Counter`] and the lock-free "last one out" [`TaskCounter`]
//! - **Deferred Completion**: [`deferred()`] one-shot slots whose continuation runs on the completing thread
//!
//! ## Usage Examples:
//! ```rust
//! use rmqtt_impexp_utils::{to_duration, TaskCounter};
//!
//! let duration = to_duration("1h30m15s");
//! assert_eq!(duration.as_secs(), 5415);
//!
//! let tasks = TaskCounter::new();
//! tasks.start();
//! assert!(!tasks.finish());
//! assert!(tasks.finish());
//! ```

#![deny(unsafe_code)]

use std::time::Duration;

use serde::{de, Deserialize, Deserializer};

mod counter;
mod deferred;

pub use counter::{Counter, TaskCounter};
pub use deferred::{deferred, Canceled, Completer, Deferred};

/// Timestamp in seconds
pub type Timestamp = i64;

/// Timestamp in milliseconds
pub type TimestampMillis = i64;

/// Deserialize Duration from human-readable string format
#[inline]
pub fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let v = String::deserialize(deserializer)?;
    let d = to_duration(&v);
    if d.is_zero() && !v.trim().starts_with('0') {
        return Err(de::Error::custom(format!("invalid duration '{v}'")));
    }
    Ok(d)
}

/// Convert human-readable duration string to Duration
///
/// # Supported units:
/// - ms: milliseconds
/// - s: seconds
/// - m: minutes
/// - h: hours
/// - d: days
/// - w: weeks
///
/// # Example:
/// ```
/// let duration = rmqtt_impexp_utils::to_duration("2m500ms");
/// assert_eq!(duration.as_millis(), 120_500);
/// ```
#[inline]
pub fn to_duration(text: &str) -> Duration {
    let text = text.to_lowercase().replace("ms", "Y");
    let ms: u64 = text
        .split_inclusive(['s', 'm', 'h', 'd', 'w', 'Y'])
        .map(|x| {
            let mut chars = x.chars();
            let u = match chars.nth_back(0) {
                None => return 0,
                Some(u) => u,
            };
            let v = match chars.as_str().trim().parse::<u64>() {
                Err(_e) => return 0,
                Ok(v) => v,
            };
            match u {
                'Y' => v,
                's' => v * 1000,
                'm' => v * 60000,
                'h' => v * 3600000,
                'd' => v * 86400000,
                'w' => v * 604800000,
                _ => 0,
            }
        })
        .sum();
    Duration::from_millis(ms)
}

/// Get current timestamp in seconds
#[inline]
pub fn timestamp_secs() -> Timestamp {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|t| t.as_secs() as i64)
        .unwrap_or_else(|_| chrono::Local::now().timestamp())
}

/// Get current timestamp in milliseconds
///
/// # Example:
/// ```
/// let ts = rmqtt_impexp_utils::timestamp_millis();
/// assert!(ts > 0);
/// ```
#[inline]
pub fn timestamp_millis() -> TimestampMillis {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|t| t.as_millis() as i64)
        .unwrap_or_else(|_| chrono::Local::now().timestamp_millis())
}

/// Format millisecond timestamp to an ISO-8601 UTC string, empty for non-positive input
#[inline]
pub fn format_timestamp_millis(t: TimestampMillis) -> String {
    if t <= 0 {
        "".into()
    } else {
        use chrono::TimeZone;
        if let chrono::LocalResult::Single(t) = chrono::Utc.timestamp_millis_opt(t) {
            t.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
        } else {
            "".into()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Deserialize)]
    struct Pause {
        #[serde(deserialize_with = "deserialize_duration")]
        pause: Duration,
    }

    #[test]
    fn test_to_duration() {
        assert_eq!(to_duration("20ms"), Duration::from_millis(20));
        assert_eq!(to_duration("5s"), Duration::from_secs(5));
        assert_eq!(to_duration("1h30m15s").as_secs(), 5415);
        assert_eq!(to_duration("1m500ms").as_millis(), 60_500);
        assert_eq!(to_duration("bogus"), Duration::ZERO);
    }

    #[test]
    fn test_deserialize_duration() {
        let p: Pause = serde_json::from_str(r#"{"pause":"500ms"}"#).unwrap();
        assert_eq!(p.pause, Duration::from_millis(500));
        let p: Pause = serde_json::from_str(r#"{"pause":"0s"}"#).unwrap();
        assert_eq!(p.pause, Duration::ZERO);
        assert!(serde_json::from_str::<Pause>(r#"{"pause":"soon"}"#).is_err());
    }

    #[test]
    fn test_format_timestamp_millis() {
        assert_eq!(format_timestamp_millis(0), "");
        assert_eq!(format_timestamp_millis(1_000), "1970-01-01T00:00:01.000Z");
    }
}
