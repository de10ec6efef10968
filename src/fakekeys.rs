//! Fake-key padding: keeps every historical day's key population above a
//! configured minimum so observers cannot infer real upload volume, and tops
//! up thin result sets at read time.
//!
//! The service owns its RNG explicitly; regeneration is an explicit operation
//! invoked at startup or on demand, never a side effect of construction.

use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Duration;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use crate::clock::UtcInstant;
use crate::model::{ExposureKey, DEFAULT_ROLLING_PERIOD};
use crate::storage::{KeyStore, StorageError};

/// Onset offset stamped on generated keys.
const FAKE_DAYS_SINCE_ONSET: i64 = 1;

pub struct FakeKeyServiceConfig {
    pub enabled: bool,
    pub min_num_of_keys: usize,
    pub key_size: usize,
    pub retention: Duration,
    pub country_origin: String,
    pub report_type: i32,
}

pub struct FakeKeyService {
    store: Arc<dyn KeyStore>,
    rng: Mutex<StdRng>,
    enabled: bool,
    min_num_of_keys: usize,
    key_size: usize,
    retention: Duration,
    country_origin: String,
    report_type: i32,
}

impl FakeKeyService {
    pub fn new(store: Arc<dyn KeyStore>, config: FakeKeyServiceConfig) -> Self {
        FakeKeyService {
            store,
            rng: Mutex::new(StdRng::from_os_rng()),
            enabled: config.enabled,
            min_num_of_keys: config.min_num_of_keys,
            key_size: config.key_size,
            retention: config.retention,
            country_origin: config.country_origin,
            report_type: config.report_type,
        }
    }

    /// Wipe the stored population and refill every day in
    /// `[today - retention, today)` up to the configured minimum. The upsert
    /// goes through the normal path, so generated keys get a fresh
    /// `received_at` regardless of their nominal key date. Returns the number
    /// of keys created.
    pub fn regenerate(&self, now: UtcInstant) -> Result<usize, StorageError> {
        if !self.enabled {
            return Ok(0);
        }
        self.store.clean(Duration::zero(), now)?;

        let today = now.midnight();
        let mut day = today - self.retention;
        let mut created = 0;
        tracing::debug!("filling fake keys from {} to {}", day, today);
        while day < today {
            let existing = self.store.count_for_day(day)? as usize;
            if existing < self.min_num_of_keys {
                let missing = self.min_num_of_keys - existing;
                let keys: Vec<ExposureKey> = {
                    let mut rng = self.rng.lock().expect("fake key RNG lock");
                    (0..missing).map(|_| self.random_key(&mut rng, day)).collect()
                };
                self.store.upsert(&keys, now)?;
                created += missing;
            }
            day = day + Duration::days(1);
        }
        Ok(created)
    }

    /// Top up a read result for a historical day with the day's available
    /// keys, bounded above by tomorrow's start. Today's bucket is never
    /// padded: it is not a historical day.
    pub fn fill_up_keys(
        &self,
        mut keys: Vec<ExposureKey>,
        published_after: Option<UtcInstant>,
        key_date: UtcInstant,
        now: UtcInstant,
    ) -> Result<Vec<ExposureKey>, StorageError> {
        if !self.enabled {
            return Ok(keys);
        }
        let today = now.midnight();
        if key_date.midnight() == today {
            return Ok(keys);
        }
        let tomorrow = today + Duration::days(1);
        let fakes = self
            .store
            .keys_for_date(key_date, published_after, tomorrow, now)?;
        keys.extend(fakes);
        Ok(keys)
    }

    fn random_key(&self, rng: &mut StdRng, day: UtcInstant) -> ExposureKey {
        let mut raw = vec![0u8; self.key_size];
        rng.fill_bytes(&mut raw);
        ExposureKey {
            key_data: BASE64.encode(&raw),
            rolling_start_number: day.interval_number() as i32,
            rolling_period: DEFAULT_ROLLING_PERIOD,
            transmission_risk_level: 0,
            fake: 0,
            country_origin: Some(self.country_origin.clone()),
            report_type: Some(self.report_type),
            days_since_onset_of_symptoms: Some(FAKE_DAYS_SINCE_ONSET),
            efgs_sharing: Some(false),
            visited_countries: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::sqlite::tests::{memory_pool, test_key};
    use crate::storage::SqliteKeyStore;

    fn service(enabled: bool, retention_days: i64) -> (FakeKeyService, Arc<dyn KeyStore>) {
        let store: Arc<dyn KeyStore> = Arc::new(SqliteKeyStore::new(
            memory_pool(),
            Duration::hours(2),
            Duration::hours(2),
        ));
        let service = FakeKeyService::new(
            store.clone(),
            FakeKeyServiceConfig {
                enabled,
                min_num_of_keys: 10,
                key_size: 16,
                retention: Duration::days(retention_days),
                country_origin: "ES".to_string(),
                report_type: 1,
            },
        );
        (service, store)
    }

    #[test]
    fn test_every_historical_day_reaches_minimum() {
        let (service, store) = service(true, 21);
        let now = UtcInstant::now();
        let created = service.regenerate(now).unwrap();
        assert_eq!(created, 21 * 10);

        let today = now.midnight();
        let mut day = today - Duration::days(21);
        while day < today {
            assert!(store.count_for_day(day).unwrap() >= 10);
            day = day + Duration::days(1);
        }
        // today's bucket gets nothing
        assert_eq!(store.count_for_day(today).unwrap(), 0);
    }

    #[test]
    fn test_regenerate_disabled_is_noop() {
        let (service, store) = service(false, 21);
        let now = UtcInstant::now();
        assert_eq!(service.regenerate(now).unwrap(), 0);
        assert_eq!(store.count_for_day(now.midnight() - Duration::days(1)).unwrap(), 0);
    }

    #[test]
    fn test_fill_up_keys_skips_today() {
        let (service, _store) = service(true, 21);
        let now = UtcInstant::now();
        service.regenerate(now).unwrap();
        let keys = service
            .fill_up_keys(Vec::new(), None, now.midnight(), now)
            .unwrap();
        assert!(keys.is_empty());
    }

    #[test]
    fn test_fill_up_keys_pads_historical_day() {
        let (service, _store) = service(true, 21);
        let now = UtcInstant::now();
        service.regenerate(now).unwrap();
        // generated keys were received in the current bucket, which the
        // regular publication window excludes; the fill-up window reaches
        // until tomorrow and picks them up
        let day = now.midnight() - Duration::days(3);
        let keys = service.fill_up_keys(Vec::new(), None, day, now).unwrap();
        assert_eq!(keys.len(), 10);
    }

    #[test]
    fn test_fill_up_keys_appends_to_real_keys() {
        let (service, store) = service(true, 21);
        let now = UtcInstant::now();
        let day = now.midnight() - Duration::days(3);
        let real = vec![test_key(42, day, 144)];
        store
            .upsert_delayed(&real, Some(now - Duration::days(2)), now)
            .unwrap();
        service.regenerate(now).unwrap();

        let filled = service.fill_up_keys(real.clone(), None, day, now).unwrap();
        // the real key plus the day's stored population
        assert!(filled.len() > real.len());
    }

    #[test]
    fn test_fill_up_disabled_returns_input_unchanged() {
        let (service, _store) = service(false, 21);
        let now = UtcInstant::now();
        let day = now.midnight() - Duration::days(3);
        let input = vec![test_key(7, day, 144)];
        let out = service.fill_up_keys(input.clone(), None, day, now).unwrap();
        assert_eq!(out, input);
    }

    #[test]
    fn test_regenerate_tops_up_instead_of_stacking() {
        let (service, store) = service(true, 5);
        let now = UtcInstant::now();
        service.regenerate(now).unwrap();
        // second run wipes and refills; population stays at the minimum
        service.regenerate(now).unwrap();
        let day = now.midnight() - Duration::days(2);
        assert_eq!(store.count_for_day(day).unwrap(), 10);
    }
}
