//! Persistence for exposure keys: upsert-or-ignore storage with
//! time-obscured receipt timestamps, release-gated queries, and retention.
//!
//! Two [`KeyStore`] implementations exist, selected by configuration at
//! startup: the baseline store and a federation-aware one that additionally
//! tracks visited countries.

pub mod federation;
pub mod migrations;
pub mod sqlite;

pub use federation::FederationKeyStore;
pub use sqlite::SqliteKeyStore;

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::Duration;
use rusqlite::Connection;

use crate::clock::UtcInstant;
use crate::model::ExposureKey;

/// Type alias for the shared database connection.
/// rusqlite is synchronous — we wrap in Arc<Mutex> for thread safety
/// with tokio::task::spawn_blocking for DB operations.
pub type DbPool = Arc<Mutex<Connection>>;

/// Initialize the SQLite database: create the data directory if needed,
/// open (or create) the database file, enable WAL mode, and run migrations.
pub fn init_db(data_dir: &str) -> Result<DbPool, Box<dyn std::error::Error>> {
    std::fs::create_dir_all(data_dir)?;

    let db_path = Path::new(data_dir).join("tekrelay.db");
    let mut conn = Connection::open(&db_path)?;

    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    migrations::migrations().to_latest(&mut conn)?;

    tracing::info!("Database initialized at {}", db_path.display());

    Ok(Arc::new(Mutex::new(conn)))
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("database lock poisoned")]
    LockPoisoned,
}

/// The storage engine owns persisted key rows exclusively; rows are immutable
/// once written and only ever removed by the retention sweep.
pub trait KeyStore: Send + Sync {
    /// Insert a batch with the regular receipt-time diffusion.
    fn upsert(&self, keys: &[ExposureKey], now: UtcInstant) -> Result<(), StorageError> {
        self.upsert_delayed(keys, None, now)
    }

    /// Insert a batch. The whole batch shares one `received_at`: the supplied
    /// delayed value (second-day uploads carry the original upload's bucket
    /// timing), or the end of the current release bucket, so that two keys
    /// uploaded seconds apart become indistinguishable. Duplicate key bytes
    /// are silently ignored; clients may legitimately retry.
    fn upsert_delayed(
        &self,
        keys: &[ExposureKey],
        delayed_received_at: Option<UtcInstant>,
        now: UtcInstant,
    ) -> Result<(), StorageError>;

    /// Keys whose validity starts on `key_date`, received inside the given
    /// publication window and past the release gate as of `now`. Ordered
    /// most-recently-inserted first.
    fn keys_for_date(
        &self,
        key_date: UtcInstant,
        published_after: Option<UtcInstant>,
        published_until: UtcInstant,
        now: UtcInstant,
    ) -> Result<Vec<ExposureKey>, StorageError>;

    /// Keys that became releasable in `[since, bucket_start(now))`. A key
    /// received already-expired is releasable at receipt; one still valid at
    /// receipt waits for its expiry. Whichever of the two is later anchors
    /// the window check. Optional origin/visited country allowlists.
    fn keys_since(
        &self,
        since: UtcInstant,
        now: UtcInstant,
        visited_countries: &[String],
        origin_countries: &[String],
    ) -> Result<Vec<ExposureKey>, StorageError>;

    /// Number of stored keys whose validity starts on the given day.
    fn count_for_day(&self, key_date: UtcInstant) -> Result<i64, StorageError>;

    /// Delete rows received before `now - retention` and expired replay
    /// tokens. A zero retention erases everything (used before regenerating
    /// the fake-key population). Returns the number of key rows removed.
    fn clean(&self, retention: Duration, now: UtcInstant) -> Result<usize, StorageError>;

    /// Accept-once redemption of a token identifier. Returns false when the
    /// identifier was already used.
    fn redeem_token(&self, jti: &str, expires_at: UtcInstant) -> Result<bool, StorageError>;
}

/// The `received_at` shared by one upserted batch: the delayed value, or the
/// last millisecond of the current release bucket. Rounding up and stepping
/// back 1ms places the receipt at the boundary of the *following* bucket,
/// diffusing the true upload instant.
pub(crate) fn batch_received_at(
    now: UtcInstant,
    delayed_received_at: Option<UtcInstant>,
    bucket: Duration,
) -> UtcInstant {
    delayed_received_at
        .unwrap_or_else(|| now.round_up_to_next_bucket(bucket) - Duration::milliseconds(1))
}

/// Map a result row to a key. `base` is the index of the `key_data` column,
/// letting callers prepend bookkeeping columns to the select list.
pub(crate) fn key_from_row(
    row: &rusqlite::Row<'_>,
    base: usize,
) -> rusqlite::Result<ExposureKey> {
    Ok(ExposureKey {
        key_data: row.get(base)?,
        rolling_start_number: row.get(base + 1)?,
        rolling_period: row.get(base + 2)?,
        transmission_risk_level: row.get(base + 3)?,
        fake: 0,
        country_origin: row.get(base + 4)?,
        report_type: row.get(base + 5)?,
        days_since_onset_of_symptoms: row.get(base + 6)?,
        efgs_sharing: row.get(base + 7)?,
        visited_countries: Vec::new(),
    })
}

/// Columns every key query selects, in `key_from_row` order.
pub(crate) const KEY_COLUMNS: &str = "key_data, rolling_start_number, rolling_period, \
     transmission_risk_level, country_origin, report_type, days_since_onset, efgs_sharing";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_received_at_hides_upload_instant() {
        let bucket = Duration::hours(2);
        let base = UtcInstant::parse_date("2020-06-27").unwrap();
        let first = base + Duration::minutes(3);
        let second = base + Duration::minutes(118);
        // both uploads land on the same boundary minus 1ms
        assert_eq!(
            batch_received_at(first, None, bucket),
            batch_received_at(second, None, bucket)
        );
        assert_eq!(
            batch_received_at(first, None, bucket),
            base + Duration::hours(2) - Duration::milliseconds(1)
        );
    }

    #[test]
    fn test_batch_received_at_prefers_delayed_value() {
        let bucket = Duration::hours(2);
        let now = UtcInstant::now();
        let delayed = UtcInstant::parse_date("2020-06-27").unwrap();
        assert_eq!(batch_received_at(now, Some(delayed), bucket), delayed);
    }
}
