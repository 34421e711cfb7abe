use std::cmp::Ordering;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, SecondsFormat, Utc};

use serde::{Deserialize, Serialize};

use crate::firestore::error::{invalid_argument, FirestoreResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    pub seconds: i64,
    pub nanos: i32,
}

impl Timestamp {
    pub fn new(seconds: i64, nanos: i32) -> Self {
        let mut timestamp = Self { seconds, nanos };
        timestamp.normalize();
        timestamp
    }

    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_else(|_| Duration::from_secs(0));
        Self {
            seconds: duration.as_secs() as i64,
            nanos: duration.subsec_nanos() as i32,
        }
    }

    pub fn from_millis(millis: i64) -> Self {
        Self::new(millis.div_euclid(1_000), (millis.rem_euclid(1_000) * 1_000_000) as i32)
    }

    pub fn to_millis(&self) -> i64 {
        self.seconds * 1_000 + i64::from(self.nanos) / 1_000_000
    }

    /// Parses the RFC 3339 strings used on the wire.
    pub fn from_rfc3339(value: &str) -> FirestoreResult<Self> {
        let parsed = DateTime::parse_from_rfc3339(value)
            .map_err(|err| invalid_argument(format!("Invalid timestamp '{value}': {err}")))?;
        let utc = parsed.with_timezone(&Utc);
        Ok(Self::new(utc.timestamp(), utc.timestamp_subsec_nanos() as i32))
    }

    pub fn to_rfc3339(&self) -> String {
        match DateTime::<Utc>::from_timestamp(self.seconds, self.nanos as u32) {
            Some(datetime) => datetime.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            None => "1970-01-01T00:00:00Z".to_string(),
        }
    }

    fn normalize(&mut self) {
        let extra_seconds = self.nanos.div_euclid(1_000_000_000);
        self.seconds += extra_seconds as i64;
        self.nanos = self.nanos.rem_euclid(1_000_000_000);
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.seconds.cmp(&other.seconds) {
            Ordering::Equal => self.nanos.cmp(&other.nanos),
            ordering => ordering,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_nanoseconds() {
        let timestamp = Timestamp::new(1, 1_500_000_000);
        assert_eq!(timestamp.seconds, 2);
        assert_eq!(timestamp.nanos, 500_000_000);
    }

    #[test]
    fn rfc3339_roundtrip() {
        let timestamp = Timestamp::from_rfc3339("2024-05-01T10:00:00.250Z").unwrap();
        assert_eq!(timestamp.nanos, 250_000_000);
        assert_eq!(timestamp.to_rfc3339(), "2024-05-01T10:00:00.250Z");
    }

    #[test]
    fn millis_conversion() {
        let timestamp = Timestamp::from_millis(1_500);
        assert_eq!((timestamp.seconds, timestamp.nanos), (1, 500_000_000));
        assert_eq!(timestamp.to_millis(), 1_500);
    }
}
