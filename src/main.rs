use std::net::SocketAddr;
use std::sync::Arc;

use chrono::Duration;
use tokio::net::TcpListener;

use tekrelay_server::auth::{self, AcceptAllTanValidator, RequireTanValidator, TanValidator};
use tekrelay_server::clock::UtcInstant;
use tekrelay_server::config::{generate_config_template, Config};
use tekrelay_server::export::{load_or_generate_signing_key, BatchSigner, SignerConfig};
use tekrelay_server::fakekeys::{FakeKeyService, FakeKeyServiceConfig};
use tekrelay_server::insertion::{FederationStamp, InsertionPipeline};
use tekrelay_server::maintenance;
use tekrelay_server::routes;
use tekrelay_server::state::{AppState, ReleaseSettings};
use tekrelay_server::storage::{self, FederationKeyStore, KeyStore, SqliteKeyStore};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load config with layered precedence: defaults < TOML < env < CLI
    let config = Config::load()?;

    // Handle --generate-config: print template and exit
    if config.generate_config {
        print!("{}", generate_config_template());
        return Ok(());
    }

    // Initialize tracing/logging
    if config.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "tekrelay_server=info".parse().unwrap()),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "tekrelay_server=info".parse().unwrap()),
            )
            .init();
    }

    tracing::info!("tekrelay server v{} starting", env!("CARGO_PKG_VERSION"));

    // Initialize SQLite database
    let db = storage::init_db(&config.data_dir)?;

    // Key material: HS256 token secret and the P-256 export signing key
    let jwt_secret = auth::jwt::load_or_generate_jwt_secret(&config.data_dir)?;
    let signing_key = load_or_generate_signing_key(&config.data_dir)?;

    let bucket = Duration::seconds(config.release_bucket_secs);
    let time_skew = Duration::seconds(config.time_skew_secs);
    let retention = Duration::days(config.retention_days);

    // Storage engine: the federation-aware store also tracks visited countries
    let federation = config.federation.clone().unwrap_or_default();
    let store: Arc<dyn KeyStore> = if federation.enabled {
        tracing::info!("Federation-aware storage enabled ({})", federation.country_origin);
        Arc::new(FederationKeyStore::new(db, bucket, time_skew))
    } else {
        Arc::new(SqliteKeyStore::new(db, bucket, time_skew))
    };

    let stamp = federation.enabled.then(|| FederationStamp {
        country_origin: federation.country_origin.clone(),
        report_type: federation.report_type,
    });
    let pipeline = Arc::new(InsertionPipeline::new(retention, stamp));

    let signature = config.signature.clone().unwrap_or_default();
    let signer = Arc::new(BatchSigner::new(
        SignerConfig {
            algorithm: signature.algorithm,
            app_bundle_id: signature.app_bundle_id,
            apk_package: signature.apk_package,
            key_version: signature.key_version,
            key_verification_id: signature.key_verification_id,
            region: signature.region,
        },
        signing_key,
        bucket,
    )?);

    let fake_config = config.fake_keys.clone().unwrap_or_default();
    let fake_keys = Arc::new(FakeKeyService::new(
        store.clone(),
        FakeKeyServiceConfig {
            enabled: fake_config.enabled,
            min_num_of_keys: fake_config.min_num_of_keys,
            key_size: fake_config.key_size,
            retention,
            country_origin: federation.country_origin.clone(),
            report_type: federation.report_type,
        },
    ));

    // Refresh the fake-key population at startup; failure is logged, not fatal
    {
        let fake_keys = fake_keys.clone();
        match tokio::task::spawn_blocking(move || fake_keys.regenerate(UtcInstant::now())).await? {
            Ok(count) => tracing::info!("Fake key population refreshed ({} keys)", count),
            Err(e) => tracing::error!("Fake key refresh failed: {}", e),
        }
    }

    let tan: Arc<dyn TanValidator> = if config.tan_validation_disabled {
        tracing::warn!("TAN validation disabled");
        Arc::new(AcceptAllTanValidator)
    } else {
        Arc::new(RequireTanValidator)
    };

    // Periodic retention sweep
    maintenance::spawn_retention_sweep(store.clone(), retention, config.cleanup_interval_secs);

    // Build application state
    let app_state = AppState {
        store,
        pipeline,
        fake_keys,
        signer,
        tan,
        jwt_secret,
        release: ReleaseSettings {
            bucket,
            time_skew,
            retention,
            request_time: std::time::Duration::from_millis(config.request_time_ms),
        },
    };

    // Build router
    let app = routes::build_router(app_state);

    // Bind and serve
    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
