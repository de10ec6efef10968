//! Baseline SQLite key store.

use chrono::Duration;
use rusqlite::params;

use crate::clock::UtcInstant;
use crate::model::ExposureKey;
use crate::storage::{batch_received_at, key_from_row, DbPool, KeyStore, StorageError, KEY_COLUMNS};

pub struct SqliteKeyStore {
    db: DbPool,
    release_bucket: Duration,
    time_skew: Duration,
}

impl SqliteKeyStore {
    pub fn new(db: DbPool, release_bucket: Duration, time_skew: Duration) -> Self {
        SqliteKeyStore {
            db,
            release_bucket,
            time_skew,
        }
    }

    pub(crate) fn db(&self) -> &DbPool {
        &self.db
    }

    pub(crate) fn release_bucket(&self) -> Duration {
        self.release_bucket
    }

    pub(crate) fn time_skew(&self) -> Duration {
        self.time_skew
    }
}

impl KeyStore for SqliteKeyStore {
    fn upsert_delayed(
        &self,
        keys: &[ExposureKey],
        delayed_received_at: Option<UtcInstant>,
        now: UtcInstant,
    ) -> Result<(), StorageError> {
        let received_at = batch_received_at(now, delayed_received_at, self.release_bucket);
        let mut conn = self.db.lock().map_err(|_| StorageError::LockPoisoned)?;
        let tx = conn.transaction()?;
        for key in keys {
            let expiry = key.expiry(self.time_skew);
            tx.execute(
                "INSERT OR IGNORE INTO exposed_keys
                     (key_data, rolling_start_number, rolling_period,
                      transmission_risk_level, received_at, country_origin,
                      report_type, days_since_onset, efgs_sharing, expiry)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    key.key_data,
                    key.rolling_start_number,
                    key.rolling_period,
                    key.transmission_risk_level,
                    received_at.timestamp_millis(),
                    key.country_origin,
                    key.report_type,
                    key.days_since_onset_of_symptoms,
                    key.efgs_sharing,
                    expiry.timestamp_millis(),
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn keys_for_date(
        &self,
        key_date: UtcInstant,
        published_after: Option<UtcInstant>,
        published_until: UtcInstant,
        now: UtcInstant,
    ) -> Result<Vec<ExposureKey>, StorageError> {
        let start = key_date.interval_number();
        let end = (key_date + Duration::days(1)).interval_number();
        // The gate releases a key only once rolling_start + rolling_period +
        // time_skew lies before the current bucket start, so a key stays
        // embargoed for its whole declared validity plus the drift grace.
        let max_allowed_start = (now.round_down_to_bucket(self.release_bucket) - self.time_skew)
            .interval_number();

        let conn = self.db.lock().map_err(|_| StorageError::LockPoisoned)?;
        let mut sql = format!(
            "SELECT {KEY_COLUMNS} FROM exposed_keys
             WHERE rolling_start_number >= ?1 AND rolling_start_number < ?2
               AND received_at < ?3
               AND rolling_start_number + rolling_period < ?4"
        );
        let keys = if let Some(after) = published_after {
            sql.push_str(" AND received_at >= ?5 ORDER BY pk_exposed_id DESC");
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                params![
                    start,
                    end,
                    published_until.timestamp_millis(),
                    max_allowed_start,
                    after.timestamp_millis()
                ],
                |row| key_from_row(row, 0),
            )?;
            rows.collect::<Result<Vec<_>, _>>()?
        } else {
            sql.push_str(" ORDER BY pk_exposed_id DESC");
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                params![
                    start,
                    end,
                    published_until.timestamp_millis(),
                    max_allowed_start
                ],
                |row| key_from_row(row, 0),
            )?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        Ok(keys)
    }

    fn keys_since(
        &self,
        since: UtcInstant,
        now: UtcInstant,
        _visited_countries: &[String],
        _origin_countries: &[String],
    ) -> Result<Vec<ExposureKey>, StorageError> {
        // The baseline store has no country relation; filters only apply to
        // the federation-aware store.
        let max_bucket = now.round_down_to_bucket(self.release_bucket);
        let conn = self.db.lock().map_err(|_| StorageError::LockPoisoned)?;
        let sql = format!(
            "SELECT {KEY_COLUMNS} FROM exposed_keys
             WHERE ((expiry <= received_at AND received_at >= ?1 AND received_at < ?2)
                 OR (expiry > received_at AND expiry >= ?1 AND expiry < ?2))
             ORDER BY pk_exposed_id DESC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![since.timestamp_millis(), max_bucket.timestamp_millis()],
            |row| key_from_row(row, 0),
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn count_for_day(&self, key_date: UtcInstant) -> Result<i64, StorageError> {
        let start = key_date.midnight().interval_number();
        let end = (key_date.midnight() + Duration::days(1)).interval_number();
        let conn = self.db.lock().map_err(|_| StorageError::LockPoisoned)?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM exposed_keys
             WHERE rolling_start_number >= ?1 AND rolling_start_number < ?2",
            params![start, end],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn clean(&self, retention: Duration, now: UtcInstant) -> Result<usize, StorageError> {
        let conn = self.db.lock().map_err(|_| StorageError::LockPoisoned)?;
        let removed = if retention.is_zero() {
            // destructive erase-all, used before regenerating fake keys
            conn.execute("DELETE FROM exposed_keys", [])?
        } else {
            let horizon = (now - retention).timestamp_millis();
            conn.execute(
                "DELETE FROM exposed_keys WHERE received_at < ?1",
                params![horizon],
            )?
        };
        conn.execute(
            "DELETE FROM used_tokens WHERE expires_at < ?1",
            params![now.timestamp_millis()],
        )?;
        Ok(removed)
    }

    fn redeem_token(&self, jti: &str, expires_at: UtcInstant) -> Result<bool, StorageError> {
        let conn = self.db.lock().map_err(|_| StorageError::LockPoisoned)?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO used_tokens (jti, expires_at) VALUES (?1, ?2)",
            params![jti, expires_at.timestamp_millis()],
        )?;
        Ok(inserted == 1)
    }
}
