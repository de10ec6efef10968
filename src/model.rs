//! Wire and domain models for temporary exposure keys.

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::clock::UtcInstant;

/// Raw length of a temporary exposure key in bytes.
pub const KEY_LENGTH: usize = 16;

/// Base64 length of a 16-byte key.
pub const KEY_LENGTH_BASE64: usize = 24;

/// Default validity of a key in 10-minute intervals (24 hours).
pub const DEFAULT_ROLLING_PERIOD: i32 = 144;

/// A temporary exposure key as uploaded by a client. To protect against
/// timing attacks a client may mark a key with `fake = 1`; such keys are
/// discarded before storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExposureKey {
    /// The 16-byte key, base64 encoded (exactly 24 characters).
    pub key_data: String,
    /// Validity start as 10-minute intervals since the Unix epoch.
    pub rolling_start_number: i32,
    /// Number of 10-minute intervals the key stays valid.
    #[serde(default)]
    pub rolling_period: i32,
    /// Legacy risk value, 0..=4096. Always 0 in the current protocol.
    #[serde(default)]
    pub transmission_risk_level: i32,
    /// 1 marks a decoy key that must never be persisted.
    #[serde(default)]
    pub fake: i32,
    #[serde(default)]
    pub country_origin: Option<String>,
    #[serde(default)]
    pub report_type: Option<i32>,
    #[serde(default)]
    pub days_since_onset_of_symptoms: Option<i64>,
    #[serde(default)]
    pub efgs_sharing: Option<bool>,
    /// Countries this key should additionally be distributed to.
    #[serde(default)]
    pub visited_countries: Vec<String>,
}

impl ExposureKey {
    /// Start of the key's validity window.
    pub fn start_time(&self) -> UtcInstant {
        UtcInstant::from_interval_number(self.rolling_start_number as i64)
    }

    /// Midnight UTC of the key's validity start.
    pub fn key_date(&self) -> UtcInstant {
        self.start_time().midnight()
    }

    /// When the key stops being valid, plus the clock-drift grace period.
    /// Computed once at storage time and persisted.
    pub fn expiry(&self, time_skew: Duration) -> UtcInstant {
        UtcInstant::from_interval_number(
            self.rolling_start_number as i64 + self.rolling_period as i64,
        ) + time_skew
    }
}

/// Upload request body: a fixed-size batch of keys plus the date the client
/// will submit its final key for (see the second-day endpoint).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyUploadRequest {
    pub gaen_keys: Vec<ExposureKey>,
    /// Claimed date of the delayed key, in 10-minute intervals since epoch.
    pub delayed_key_date: i32,
}

/// Second-day upload body: exactly one key bound to the prior upload's token.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecondDayUploadRequest {
    pub delayed_key: ExposureKey,
}

/// Release bucket listing for one calendar day.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DayBuckets {
    /// Midnight of the day in milliseconds since the Unix epoch.
    pub day_timestamp: i64,
    /// The day as given in the request path.
    pub day: String,
    /// Relative URLs for the release buckets that have already elapsed.
    pub relative_urls: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn key(rolling_start_number: i32, rolling_period: i32) -> ExposureKey {
        ExposureKey {
            key_data: "MTIzNDU2Nzg5MGFiY2RlZg==".to_string(),
            rolling_start_number,
            rolling_period,
            transmission_risk_level: 0,
            fake: 0,
            country_origin: None,
            report_type: None,
            days_since_onset_of_symptoms: None,
            efgs_sharing: None,
            visited_countries: Vec::new(),
        }
    }

    #[test]
    fn test_expiry_monotonic_in_rolling_start() {
        let skew = Duration::hours(2);
        let mut last = key(1000, 144).expiry(skew);
        for start in 1001..1100 {
            let next = key(start, 144).expiry(skew);
            assert!(next > last);
            last = next;
        }
    }

    #[test]
    fn test_expiry_includes_skew() {
        let k = key(144, 144);
        let expiry = k.expiry(Duration::hours(2));
        let end_of_validity = UtcInstant::from_interval_number(288);
        assert_eq!(expiry, end_of_validity + Duration::hours(2));
    }

    #[test]
    fn test_wire_names_are_camel_case() {
        let json = serde_json::to_value(key(100, 144)).unwrap();
        assert!(json.get("keyData").is_some());
        assert!(json.get("rollingStartNumber").is_some());
        assert!(json.get("transmissionRiskLevel").is_some());
    }

    #[test]
    fn test_upload_request_defaults() {
        let req: KeyUploadRequest = serde_json::from_str(
            r#"{"gaenKeys":[{"keyData":"MTIzNDU2Nzg5MGFiY2RlZg==","rollingStartNumber":100}],"delayedKeyDate":2655360}"#,
        )
        .unwrap();
        assert_eq!(req.gaen_keys[0].rolling_period, 0);
        assert_eq!(req.gaen_keys[0].fake, 0);
        assert!(req.gaen_keys[0].visited_countries.is_empty());
    }
}
