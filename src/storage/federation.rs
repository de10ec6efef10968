//! Federation-aware key store: persists the key → visited-countries relation
//! and applies origin/visited allowlists to the since-queries that feed a
//! federation gateway. Everything else delegates to the baseline store.

use chrono::Duration;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, OptionalExtension};

use crate::clock::UtcInstant;
use crate::model::ExposureKey;
use crate::storage::{
    batch_received_at, key_from_row, DbPool, KeyStore, SqliteKeyStore, StorageError, KEY_COLUMNS,
};

pub struct FederationKeyStore {
    base: SqliteKeyStore,
}

impl FederationKeyStore {
    pub fn new(db: DbPool, release_bucket: Duration, time_skew: Duration) -> Self {
        FederationKeyStore {
            base: SqliteKeyStore::new(db, release_bucket, time_skew),
        }
    }
}

impl KeyStore for FederationKeyStore {
    fn upsert_delayed(
        &self,
        keys: &[ExposureKey],
        delayed_received_at: Option<UtcInstant>,
        now: UtcInstant,
    ) -> Result<(), StorageError> {
        let received_at = batch_received_at(now, delayed_received_at, self.base.release_bucket());
        let mut conn = self
            .base
            .db()
            .lock()
            .map_err(|_| StorageError::LockPoisoned)?;
        let tx = conn.transaction()?;
        for key in keys {
            let expiry = key.expiry(self.base.time_skew());
            // RETURNING yields no row for an ignored duplicate, so the
            // visited-countries relation is only written for fresh rows.
            let new_id: Option<i64> = tx
                .query_row(
                    "INSERT OR IGNORE INTO exposed_keys
                         (key_data, rolling_start_number, rolling_period,
                          transmission_risk_level, received_at, country_origin,
                          report_type, days_since_onset, efgs_sharing, expiry)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                     RETURNING pk_exposed_id",
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
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(id) = new_id {
                for country in &key.visited_countries {
                    tx.execute(
                        "INSERT OR IGNORE INTO visited_countries (pfk_exposed_id, country)
                         VALUES (?1, ?2)",
                        params![id, country],
                    )?;
                }
            }
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
        self.base
            .keys_for_date(key_date, published_after, published_until, now)
    }

    fn keys_since(
        &self,
        since: UtcInstant,
        now: UtcInstant,
        visited_countries: &[String],
        origin_countries: &[String],
    ) -> Result<Vec<ExposureKey>, StorageError> {
        let max_bucket = now.round_down_to_bucket(self.base.release_bucket());

        // DISTINCT because the visited join can multiply rows; SQLite then
        // requires the ordering column in the select list.
        let mut sql = format!("SELECT DISTINCT keys.pk_exposed_id, {KEY_COLUMNS} ");
        sql.push_str("FROM exposed_keys AS keys ");
        if !visited_countries.is_empty() {
            sql.push_str(
                "INNER JOIN visited_countries AS visited \
                 ON keys.pk_exposed_id = visited.pfk_exposed_id ",
            );
        }
        sql.push_str(
            "WHERE ((keys.expiry <= keys.received_at AND keys.received_at >= ?1 \
                     AND keys.received_at < ?2) \
                 OR (keys.expiry > keys.received_at AND keys.expiry >= ?1 \
                     AND keys.expiry < ?2)) ",
        );

        let mut values: Vec<Value> = vec![
            Value::Integer(since.timestamp_millis()),
            Value::Integer(max_bucket.timestamp_millis()),
        ];
        let mut next_param = 3;
        if !origin_countries.is_empty() {
            let placeholders = placeholder_list(&mut next_param, origin_countries.len());
            sql.push_str(&format!("AND keys.country_origin IN ({placeholders}) "));
            values.extend(origin_countries.iter().cloned().map(Value::Text));
        }
        if !visited_countries.is_empty() {
            let placeholders = placeholder_list(&mut next_param, visited_countries.len());
            sql.push_str(&format!("AND visited.country IN ({placeholders}) "));
            values.extend(visited_countries.iter().cloned().map(Value::Text));
        }
        sql.push_str("ORDER BY keys.pk_exposed_id DESC");

        let conn = self
            .base
            .db()
            .lock()
            .map_err(|_| StorageError::LockPoisoned)?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), |row| key_from_row(row, 1))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn count_for_day(&self, key_date: UtcInstant) -> Result<i64, StorageError> {
        self.base.count_for_day(key_date)
    }

    fn clean(&self, retention: Duration, now: UtcInstant) -> Result<usize, StorageError> {
        self.base.clean(retention, now)
    }

    fn redeem_token(&self, jti: &str, expires_at: UtcInstant) -> Result<bool, StorageError> {
        self.base.redeem_token(jti, expires_at)
    }
}

fn placeholder_list(next_param: &mut usize, count: usize) -> String {
    let placeholders: Vec<String> = (0..count)
        .map(|_| {
            let p = format!("?{next_param}");
            *next_param += 1;
            p
        })
        .collect();
    placeholders.join(", ")
}
