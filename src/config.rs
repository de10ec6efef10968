use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// tekrelay key server
#[derive(Parser, Serialize, Deserialize, Clone, Debug)]
#[command(name = "tekrelay-server", version, about = "Exposure-notification key relay server")]
pub struct Config {
    /// Port to listen on
    #[arg(long, env = "TEKRELAY_PORT", default_value = "8113")]
    pub port: u16,

    /// Bind address
    #[arg(long, env = "TEKRELAY_BIND_ADDRESS", default_value = "0.0.0.0")]
    pub bind_address: String,

    /// Path to TOML config file
    #[arg(long, default_value = "./tekrelay.toml")]
    pub config: String,

    /// Enable structured JSON logging (for Docker/production)
    #[arg(long, env = "TEKRELAY_JSON_LOGS")]
    pub json_logs: bool,

    /// Output a commented TOML config template and exit
    #[arg(long)]
    pub generate_config: bool,

    /// Data directory for persistent state (DB, signing keys)
    #[arg(long, env = "TEKRELAY_DATA_DIR", default_value = "./data")]
    pub data_dir: String,

    /// Width of one release bucket in seconds; only completed buckets are
    /// ever published (default: 7200 = 2 hours)
    #[arg(long, env = "TEKRELAY_RELEASE_BUCKET_SECS", default_value = "7200")]
    pub release_bucket_secs: i64,

    /// Grace period after a key's nominal expiry before release, covering
    /// client clock drift (default: 7200 = 2 hours)
    #[arg(long, env = "TEKRELAY_TIME_SKEW_SECS", default_value = "7200")]
    pub time_skew_secs: i64,

    /// Days to keep stored keys before the retention sweep removes them
    #[arg(long, env = "TEKRELAY_RETENTION_DAYS", default_value = "21")]
    pub retention_days: i64,

    /// Minimum handler latency for upload endpoints in milliseconds; pads
    /// cheap decoy paths against timing side-channels
    #[arg(long, env = "TEKRELAY_REQUEST_TIME_MS", default_value = "1500")]
    pub request_time_ms: u64,

    /// Interval in seconds between retention sweep runs (default: 3600)
    #[arg(long, env = "TEKRELAY_CLEANUP_INTERVAL_SECS", default_value = "3600")]
    pub cleanup_interval_secs: u64,

    /// Accept uploads without verifying the TAN claim against the external
    /// validation service
    #[arg(long, env = "TEKRELAY_TAN_VALIDATION_DISABLED")]
    pub tan_validation_disabled: bool,

    /// Fake-key padding configuration (loaded from [fake_keys] in TOML)
    #[arg(skip)]
    #[serde(default)]
    pub fake_keys: Option<FakeKeysConfig>,

    /// Federation configuration (loaded from [federation] in TOML)
    #[arg(skip)]
    #[serde(default)]
    pub federation: Option<FederationConfig>,

    /// Export signature configuration (loaded from [signature] in TOML)
    #[arg(skip)]
    #[serde(default)]
    pub signature: Option<SignatureConfig>,
}

/// Configuration for the fake-key padding service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FakeKeysConfig {
    /// Whether fake-key padding is active (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Minimum key population per historical day (default: 10)
    #[serde(default = "default_min_num_of_keys")]
    pub min_num_of_keys: usize,

    /// Raw key length in bytes (default: 16)
    #[serde(default = "default_key_size")]
    pub key_size: usize,
}

impl Default for FakeKeysConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_num_of_keys: 10,
            key_size: 16,
        }
    }
}

/// Configuration for the federation-aware deployment variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederationConfig {
    /// Use the federation-aware store and enrichment stage (default: false)
    #[serde(default)]
    pub enabled: bool,

    /// ISO country code stamped onto accepted keys (default: "ES")
    #[serde(default = "default_country_origin")]
    pub country_origin: String,

    /// Report type stamped onto accepted keys (default: 1 = confirmed test)
    #[serde(default = "default_report_type")]
    pub report_type: i32,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            country_origin: default_country_origin(),
            report_type: default_report_type(),
        }
    }
}

/// Configuration for the export signer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureConfig {
    /// OID of the signature algorithm (default: ECDSA with SHA-256)
    #[serde(default = "default_algorithm")]
    pub algorithm: String,

    /// iOS bundle identifier embedded in v1 signature info
    #[serde(default = "default_app_id")]
    pub app_bundle_id: String,

    /// Android package name embedded in v1 signature info
    #[serde(default = "default_app_id")]
    pub apk_package: String,

    /// Version of the verification key pair
    #[serde(default = "default_key_version")]
    pub key_version: String,

    /// Identifier clients use to select the matching public key
    #[serde(default = "default_key_verification_id")]
    pub key_verification_id: String,

    /// Region embedded in the export header
    #[serde(default = "default_country_origin")]
    pub region: String,
}

impl Default for SignatureConfig {
    fn default() -> Self {
        Self {
            algorithm: default_algorithm(),
            app_bundle_id: default_app_id(),
            apk_package: default_app_id(),
            key_version: default_key_version(),
            key_verification_id: default_key_verification_id(),
            region: default_country_origin(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_min_num_of_keys() -> usize {
    10
}

fn default_key_size() -> usize {
    16
}

fn default_country_origin() -> String {
    "ES".to_string()
}

fn default_report_type() -> i32 {
    1
}

fn default_algorithm() -> String {
    crate::export::OID_ECDSA_SHA256.to_string()
}

fn default_app_id() -> String {
    "org.example.exposure".to_string()
}

fn default_key_version() -> String {
    "v1".to_string()
}

fn default_key_verification_id() -> String {
    "228".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8113,
            bind_address: "0.0.0.0".to_string(),
            config: "./tekrelay.toml".to_string(),
            json_logs: false,
            generate_config: false,
            data_dir: "./data".to_string(),
            release_bucket_secs: 7200,
            time_skew_secs: 7200,
            retention_days: 21,
            request_time_ms: 1500,
            cleanup_interval_secs: 3600,
            tan_validation_disabled: false,
            fake_keys: None,
            federation: None,
            signature: None,
        }
    }
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < TOML file < env vars (TEKRELAY_*) < CLI args
    pub fn load() -> Result<Self, figment::Error> {
        let cli = Config::parse();
        let config_path = cli.config.clone();

        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_path))
            .merge(Env::prefixed("TEKRELAY_"))
            .merge(Serialized::defaults(cli))
            .extract()
    }
}

/// Generate a commented TOML config template
pub fn generate_config_template() -> String {
    r#"# tekrelay Key Server Configuration
# Place this file at ./tekrelay.toml or specify with --config <path>
# All settings can be overridden via environment variables (TEKRELAY_PORT, etc.)
# or CLI flags (--port, etc.)

# Server port (default: 8113)
# port = 8113

# Bind address (default: 0.0.0.0 — all interfaces)
# bind_address = "0.0.0.0"

# Enable structured JSON logging for Docker/production
# json_logs = false

# Data directory for the SQLite database and signing keys
# data_dir = "./data"

# Release bucket width in seconds. The current bucket is never published,
# only completed past buckets. (default: 7200 = 2 hours)
# release_bucket_secs = 7200

# Grace period after a key's nominal expiry before it may be released,
# accounting for client clock drift (default: 7200 = 2 hours)
# time_skew_secs = 7200

# Days to keep stored keys before the retention sweep removes them
# retention_days = 21

# Minimum upload-handler latency in milliseconds (timing side-channel padding)
# request_time_ms = 1500

# Interval in seconds between retention sweep runs (default: 3600 = 1 hour)
# cleanup_interval_secs = 3600

# Skip the external TAN verification call (local/testing setups)
# tan_validation_disabled = false

# ---- Fake-Key Padding ----
# [fake_keys]

# enabled = true
# min_num_of_keys = 10
# key_size = 16

# ---- Federation (EFGS) ----
# [federation]

# enabled = false
# country_origin = "ES"
# report_type = 1

# ---- Export Signature ----
# [signature]

# algorithm = "1.2.840.10045.4.3.2"   # ECDSA with SHA-256
# app_bundle_id = "org.example.exposure"
# apk_package = "org.example.exposure"
# key_version = "v1"
# key_verification_id = "228"
# region = "ES"
"#
    .to_string()
}
