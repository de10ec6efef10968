use rusqlite_migration::{Migrations, M};

/// Define all schema migrations.
/// Uses SQLite user_version pragma for tracking — no migration table needed.
pub fn migrations() -> Migrations<'static> {
    Migrations::new(vec![M::up(
        "-- Migration 1: exposure key storage

CREATE TABLE exposed_keys (
    pk_exposed_id INTEGER PRIMARY KEY AUTOINCREMENT,
    key_data TEXT NOT NULL UNIQUE,
    rolling_start_number INTEGER NOT NULL,
    rolling_period INTEGER NOT NULL,
    transmission_risk_level INTEGER NOT NULL DEFAULT 0,
    received_at INTEGER NOT NULL,
    country_origin TEXT,
    report_type INTEGER,
    days_since_onset INTEGER,
    efgs_sharing INTEGER,
    expiry INTEGER NOT NULL
);

CREATE INDEX idx_exposed_rolling_start ON exposed_keys(rolling_start_number);
CREATE INDEX idx_exposed_received_at ON exposed_keys(received_at);

CREATE TABLE visited_countries (
    pfk_exposed_id INTEGER NOT NULL,
    country TEXT NOT NULL,
    PRIMARY KEY (pfk_exposed_id, country),
    FOREIGN KEY (pfk_exposed_id) REFERENCES exposed_keys(pk_exposed_id) ON DELETE CASCADE
);

CREATE TABLE used_tokens (
    jti TEXT PRIMARY KEY,
    expires_at INTEGER NOT NULL
);

CREATE INDEX idx_used_tokens_expiry ON used_tokens(expires_at);
",
    )])
}
