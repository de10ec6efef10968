//! UTC time model for the key exchange protocol.
//!
//! The protocol's native time unit is the 10-minute interval since the Unix
//! epoch. Everything here is unambiguously UTC; no local-zone or DST
//! arithmetic ever happens.

use std::fmt;
use std::ops::{Add, Sub};

use chrono::{DateTime, Duration, NaiveDate, Utc};

/// Length of one protocol interval (10 minutes).
pub const INTERVAL_SECS: i64 = 600;

/// Error for malformed ISO date strings.
#[derive(Debug, thiserror::Error)]
#[error("invalid date string: {0}")]
pub struct ParseError(#[from] chrono::ParseError);

/// An absolute point in time, always UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UtcInstant(DateTime<Utc>);

impl UtcInstant {
    pub fn now() -> Self {
        UtcInstant(Utc::now())
    }

    /// Midnight UTC of the current day.
    pub fn today() -> Self {
        Self::now().midnight()
    }

    /// Parse an ISO-8601 calendar date (`2020-06-27`) as midnight UTC.
    pub fn parse_date(s: &str) -> Result<Self, ParseError> {
        let date = NaiveDate::parse_from_str(s, "%Y-%m-%d")?;
        Ok(Self::from_date(date))
    }

    pub fn from_date(date: NaiveDate) -> Self {
        // and_hms_opt(0, 0, 0) cannot fail for midnight
        UtcInstant(date.and_hms_opt(0, 0, 0).unwrap().and_utc())
    }

    pub fn from_timestamp_millis(millis: i64) -> Option<Self> {
        DateTime::<Utc>::from_timestamp_millis(millis).map(UtcInstant)
    }

    pub fn timestamp_millis(&self) -> i64 {
        self.0.timestamp_millis()
    }

    /// Convert from the protocol-native unit: 10-minute intervals since epoch.
    pub fn from_interval_number(interval: i64) -> Self {
        // in-range for any plausible interval number
        UtcInstant(DateTime::<Utc>::from_timestamp(interval * INTERVAL_SECS, 0).unwrap())
    }

    /// Convert to the protocol-native unit, truncating towards zero.
    pub fn interval_number(&self) -> i64 {
        self.0.timestamp() / INTERVAL_SECS
    }

    /// Truncate to calendar midnight UTC.
    pub fn midnight(&self) -> Self {
        Self::from_date(self.0.date_naive())
    }

    pub fn date(&self) -> NaiveDate {
        self.0.date_naive()
    }

    pub fn is_midnight(&self) -> bool {
        *self == self.midnight()
    }

    /// Start of the release bucket containing this instant.
    pub fn round_down_to_bucket(&self, bucket: Duration) -> Self {
        let bucket_millis = bucket.num_milliseconds();
        let millis = self.timestamp_millis();
        Self::from_timestamp_millis(millis - millis.rem_euclid(bucket_millis)).unwrap()
    }

    /// Start of the release bucket *after* the one containing this instant.
    /// Always advances, even when the instant already sits on a boundary.
    pub fn round_up_to_next_bucket(&self, bucket: Duration) -> Self {
        self.round_down_to_bucket(bucket) + bucket
    }

    pub fn is_bucket_aligned(&self, bucket: Duration) -> bool {
        self.timestamp_millis() % bucket.num_milliseconds() == 0
    }

    /// Whole calendar days from `other`'s date to this instant's date.
    pub fn days_since(&self, other: UtcInstant) -> i64 {
        self.date().signed_duration_since(other.date()).num_days()
    }

    /// RFC 1123 formatting for HTTP `Expires` headers.
    pub fn http_date(&self) -> String {
        self.0.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
    }
}

impl Add<Duration> for UtcInstant {
    type Output = UtcInstant;

    fn add(self, rhs: Duration) -> UtcInstant {
        UtcInstant(self.0 + rhs)
    }
}

impl Sub<Duration> for UtcInstant {
    type Output = UtcInstant;

    fn sub(self, rhs: Duration) -> UtcInstant {
        UtcInstant(self.0 - rhs)
    }
}

impl Sub<UtcInstant> for UtcInstant {
    type Output = Duration;

    fn sub(self, rhs: UtcInstant) -> Duration {
        self.0 - rhs.0
    }
}

impl fmt::Display for UtcInstant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_date_midnight_utc() {
        let t = UtcInstant::parse_date("2020-06-27").unwrap();
        assert_eq!(t.timestamp_millis(), 1593216000000);
        assert!(t.is_midnight());
    }

    #[test]
    fn test_parse_date_rejects_garbage() {
        assert!(UtcInstant::parse_date("27.06.2020").is_err());
        assert!(UtcInstant::parse_date("not-a-date").is_err());
    }

    #[test]
    fn test_interval_number_roundtrip() {
        let t = UtcInstant::parse_date("2020-06-27").unwrap();
        let interval = t.interval_number();
        // midnight is always a whole number of 10-minute intervals
        assert_eq!(UtcInstant::from_interval_number(interval), t);
        assert_eq!(interval, 1593216000 / 600);
    }

    #[test]
    fn test_interval_number_truncates() {
        let t = UtcInstant::from_timestamp_millis(599_999).unwrap();
        assert_eq!(t.interval_number(), 0);
        let t = UtcInstant::from_timestamp_millis(600_000).unwrap();
        assert_eq!(t.interval_number(), 1);
    }

    #[test]
    fn test_round_down_to_bucket() {
        let bucket = Duration::hours(2);
        let t = UtcInstant::parse_date("2020-06-27").unwrap() + Duration::minutes(75);
        assert_eq!(
            t.round_down_to_bucket(bucket),
            UtcInstant::parse_date("2020-06-27").unwrap()
        );
        let t2 = UtcInstant::parse_date("2020-06-27").unwrap() + Duration::hours(3);
        assert_eq!(
            t2.round_down_to_bucket(bucket),
            UtcInstant::parse_date("2020-06-27").unwrap() + Duration::hours(2)
        );
    }

    #[test]
    fn test_round_up_advances_on_boundary() {
        let bucket = Duration::hours(2);
        let boundary = UtcInstant::parse_date("2020-06-27").unwrap();
        assert_eq!(boundary.round_up_to_next_bucket(bucket), boundary + bucket);
    }

    #[test]
    fn test_bucket_alignment() {
        let bucket = Duration::hours(2);
        let aligned = UtcInstant::parse_date("2020-06-27").unwrap();
        assert!(aligned.is_bucket_aligned(bucket));
        assert!(!(aligned + Duration::minutes(1)).is_bucket_aligned(bucket));
    }

    #[test]
    fn test_days_since() {
        let onset = UtcInstant::parse_date("2020-06-25").unwrap();
        let key_date = UtcInstant::parse_date("2020-06-27").unwrap();
        assert_eq!(key_date.days_since(onset), 2);
        assert_eq!(onset.days_since(key_date), -2);
        // sub-day offsets do not change the whole-day difference
        assert_eq!((key_date + Duration::hours(23)).days_since(onset), 2);
    }

    #[test]
    fn test_http_date_format() {
        let t = UtcInstant::parse_date("2020-06-27").unwrap();
        assert_eq!(t.http_date(), "Sat, 27 Jun 2020 00:00:00 GMT");
    }
}
