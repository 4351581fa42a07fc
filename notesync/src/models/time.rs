//! Epoch timestamps tolerant of seconds, milliseconds and RFC 3339 input.

use std::fmt;

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Anything below this is treated as epoch seconds (year 5138 in millis).
const SECONDS_CUTOFF: f64 = 100_000_000_000.0;

/// Milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Current wall-clock time.
    pub fn now() -> Self {
        Self(Utc::now().timestamp_millis())
    }

    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    pub const fn as_millis(self) -> i64 {
        self.0
    }

    /// Interpret a bare number the way the backend and browser mix them:
    /// small values are seconds, large values are milliseconds.
    #[allow(clippy::cast_possible_truncation)]
    pub fn from_epoch_number(value: f64) -> Self {
        if value.abs() < SECONDS_CUTOFF {
            Self((value * 1000.0).round() as i64)
        } else {
            Self(value.round() as i64)
        }
    }

    /// Parse a timestamp string flexibly from various formats.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if let Ok(n) = s.parse::<f64>() {
            return Some(Self::from_epoch_number(n));
        }
        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Some(Self(dt.timestamp_millis()));
        }
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
            return Some(Self(naive.and_utc().timestamp_millis()));
        }
        None
    }

    /// Smallest timestamp strictly after `self` and not before `now`.
    #[must_use]
    pub fn advance_to(self, now: Self) -> Self {
        if now.0 > self.0 {
            now
        } else {
            Self(self.0.saturating_add(1))
        }
    }

    /// Milliseconds elapsed from `earlier` to `self`, clamped at zero.
    pub fn millis_since(self, earlier: Self) -> u64 {
        u64::try_from(self.0.saturating_sub(earlier.0)).unwrap_or(0)
    }

    pub fn to_utc(self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.0)
            .single()
            .unwrap_or_default()
    }

    pub fn to_local(self) -> DateTime<Local> {
        self.to_utc().with_timezone(&Local)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_utc().to_rfc3339())
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.0)
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(TimestampVisitor)
    }
}

struct TimestampVisitor;

impl Visitor<'_> for TimestampVisitor {
    type Value = Timestamp;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("epoch seconds, epoch milliseconds or an RFC 3339 string")
    }

    #[allow(clippy::cast_precision_loss)]
    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Timestamp, E> {
        Ok(Timestamp::from_epoch_number(v as f64))
    }

    #[allow(clippy::cast_precision_loss)]
    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Timestamp, E> {
        Ok(Timestamp::from_epoch_number(v as f64))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Timestamp, E> {
        Ok(Timestamp::from_epoch_number(v))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Timestamp, E> {
        Timestamp::parse(v).ok_or_else(|| E::custom(format!("invalid timestamp: {v}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_saturates_at_the_far_future() {
        let far: Timestamp = serde_json::from_str("1e300").unwrap();
        assert_eq!(far.as_millis(), i64::MAX);
        assert_eq!(far.advance_to(Timestamp::from_millis(0)), far);
        assert_eq!(far.millis_since(Timestamp::from_millis(-5)), i64::MAX as u64);
    }

    #[test]
    fn seconds_and_millis_agree() {
        let secs: Timestamp = serde_json::from_str("1700000000.5").unwrap();
        let millis: Timestamp = serde_json::from_str("1700000000500").unwrap();
        assert_eq!(secs, millis);
        assert_eq!(millis.as_millis(), 1_700_000_000_500);
    }

    #[test]
    fn parses_rfc3339_and_numeric_strings() {
        let a = Timestamp::parse("2024-01-02T03:04:05Z").unwrap();
        let b = Timestamp::parse("1704164645").unwrap();
        assert_eq!(a, b);
        assert!(Timestamp::parse("yesterday").is_none());
    }

    #[test]
    fn serializes_as_millis() {
        let ts = Timestamp::from_millis(42_000);
        assert_eq!(serde_json::to_string(&ts).unwrap(), "42000");
    }

    #[test]
    fn advance_is_strictly_monotonic() {
        let t = Timestamp::from_millis(1_000);
        assert_eq!(t.advance_to(Timestamp::from_millis(500)).as_millis(), 1_001);
        assert_eq!(t.advance_to(Timestamp::from_millis(2_000)).as_millis(), 2_000);
    }
}
