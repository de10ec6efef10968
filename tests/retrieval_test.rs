//! Integration tests for key retrieval: parameter validation, release
//! headers, the signed zip payload, bucket listings, and fake-key padding.

use std::io::Read;
use std::net::SocketAddr;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Duration;
use p256::ecdsa::signature::Verifier;
use p256::ecdsa::{Signature, VerifyingKey};
use p256::pkcs8::DecodePublicKey;
use prost::Message;
use tokio::net::TcpListener;

use tekrelay_server::auth::AcceptAllTanValidator;
use tekrelay_server::clock::UtcInstant;
use tekrelay_server::export::proto::v1;
use tekrelay_server::export::{
    load_or_generate_signing_key, BatchSigner, SignerConfig, EXPORT_MAGIC, OID_ECDSA_SHA256,
};
use tekrelay_server::fakekeys::{FakeKeyService, FakeKeyServiceConfig};
use tekrelay_server::insertion::InsertionPipeline;
use tekrelay_server::model::ExposureKey;
use tekrelay_server::state::{AppState, ReleaseSettings};
use tekrelay_server::storage::{self, KeyStore, SqliteKeyStore};

fn bucket() -> Duration {
    Duration::hours(2)
}

struct TestServer {
    base_url: String,
    store: Arc<dyn KeyStore>,
    public_key_der: Vec<u8>,
    _tmp_dir: tempfile::TempDir,
}

/// Start the server on a random port. `min_fake_keys` > 0 enables padding
/// with that minimum and pre-populates the fake-key store.
async fn start_test_server(min_fake_keys: usize) -> TestServer {
    let tmp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let data_dir = tmp_dir.path().to_str().unwrap().to_string();

    let db = storage::init_db(&data_dir).expect("Failed to init DB");
    let jwt_secret = tekrelay_server::auth::jwt::load_or_generate_jwt_secret(&data_dir)
        .expect("Failed to generate JWT secret");
    let signing_key =
        load_or_generate_signing_key(&data_dir).expect("Failed to generate signing key");

    let time_skew = Duration::hours(2);
    let retention = Duration::days(21);

    let store: Arc<dyn KeyStore> = Arc::new(SqliteKeyStore::new(db, bucket(), time_skew));
    let signer = Arc::new(
        BatchSigner::new(
            SignerConfig {
                algorithm: OID_ECDSA_SHA256.to_string(),
                app_bundle_id: "org.example.exposure".to_string(),
                apk_package: "org.example.exposure".to_string(),
                key_version: "v1".to_string(),
                key_verification_id: "228".to_string(),
                region: "ES".to_string(),
            },
            signing_key,
            bucket(),
        )
        .unwrap(),
    );
    let public_key_der = signer.public_key_der().to_vec();

    let fake_keys = Arc::new(FakeKeyService::new(
        store.clone(),
        FakeKeyServiceConfig {
            enabled: min_fake_keys > 0,
            min_num_of_keys: min_fake_keys,
            key_size: 16,
            retention,
            country_origin: "ES".to_string(),
            report_type: 1,
        },
    ));
    if min_fake_keys > 0 {
        fake_keys.regenerate(UtcInstant::now()).unwrap();
    }

    let state = AppState {
        store: store.clone(),
        pipeline: Arc::new(InsertionPipeline::new(retention, None)),
        fake_keys,
        signer,
        tan: Arc::new(AcceptAllTanValidator),
        jwt_secret,
        release: ReleaseSettings {
            bucket: bucket(),
            time_skew,
            retention,
            request_time: std::time::Duration::from_millis(10),
        },
    };

    let app = tekrelay_server::routes::build_router(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    TestServer {
        base_url: format!("http://{}", addr),
        store,
        public_key_der,
        _tmp_dir: tmp_dir,
    }
}

fn stored_key(seed: u8, day: UtcInstant) -> ExposureKey {
    ExposureKey {
        key_data: BASE64.encode([seed; 16]),
        rolling_start_number: day.interval_number() as i32,
        rolling_period: 144,
        transmission_risk_level: 0,
        fake: 0,
        country_origin: Some("ES".to_string()),
        report_type: Some(1),
        days_since_onset_of_symptoms: Some(-1),
        efgs_sharing: Some(false),
        visited_countries: Vec::new(),
    }
}

fn unzip_entry(archive: &[u8], name: &str) -> Vec<u8> {
    let mut zip = zip::ZipArchive::new(std::io::Cursor::new(archive.to_vec())).unwrap();
    let mut entry = zip.by_name(name).unwrap();
    let mut buf = Vec::new();
    entry.read_to_end(&mut buf).unwrap();
    buf
}

#[tokio::test]
async fn test_key_date_must_be_midnight() {
    let server = start_test_server(0).await;
    let not_midnight = (UtcInstant::today() - Duration::days(3)) + Duration::hours(3);
    let resp = reqwest::get(format!(
        "{}/v1/gaen/exposed/{}",
        server.base_url,
        not_midnight.timestamp_millis()
    ))
    .await
    .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn test_published_after_must_align_to_bucket() {
    let server = start_test_server(0).await;
    let day = UtcInstant::today() - Duration::days(3);
    let misaligned = day.timestamp_millis() + 60_000;
    let resp = reqwest::get(format!(
        "{}/v1/gaen/exposed/{}?publishedafter={}",
        server.base_url,
        day.timestamp_millis(),
        misaligned
    ))
    .await
    .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn test_empty_day_answers_204_with_cutoff_headers() {
    let server = start_test_server(0).await;
    let day = UtcInstant::today() - Duration::days(3);
    let resp = reqwest::get(format!(
        "{}/v1/gaen/exposed/{}",
        server.base_url,
        day.timestamp_millis()
    ))
    .await
    .unwrap();
    assert_eq!(resp.status(), 204);

    let published_until: i64 = resp
        .headers()
        .get("x-published-until")
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    // the cutoff is always a completed bucket boundary
    assert_eq!(published_until % bucket().num_milliseconds(), 0);
    let expires = resp.headers().get("expires").unwrap().to_str().unwrap();
    assert!(expires.ends_with("GMT"));
}

#[tokio::test]
async fn test_signed_batch_roundtrip() {
    let server = start_test_server(0).await;
    let now = UtcInstant::now();
    let day = now.midnight() - Duration::days(3);

    let keys: Vec<ExposureKey> = (1..=6).map(|i| stored_key(i, day)).collect();
    server
        .store
        .upsert_delayed(&keys, Some(now - Duration::days(1)), now)
        .unwrap();

    let resp = reqwest::get(format!(
        "{}/v1/gaen/exposed/{}",
        server.base_url,
        day.timestamp_millis()
    ))
    .await
    .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers().get("content-type").unwrap().to_str().unwrap(),
        "application/zip"
    );
    let archive = resp.bytes().await.unwrap();

    let export_bin = unzip_entry(&archive, "export.bin");
    assert_eq!(&export_bin[..16], &EXPORT_MAGIC);
    let export = v1::TemporaryExposureKeyExport::decode(&export_bin[16..]).unwrap();
    assert_eq!(export.keys.len(), keys.len());

    // upload order must not be recoverable from the wire; compare as sets
    let sent: std::collections::HashSet<Vec<u8>> = keys
        .iter()
        .map(|k| BASE64.decode(&k.key_data).unwrap())
        .collect();
    let received: std::collections::HashSet<Vec<u8>> = export
        .keys
        .iter()
        .map(|k| k.key_data.clone().unwrap())
        .collect();
    assert_eq!(sent, received);

    // the detached signature must verify against export.bin
    let export_sig = unzip_entry(&archive, "export.sig");
    let list = v1::TekSignatureList::decode(export_sig.as_slice()).unwrap();
    let verifying_key = VerifyingKey::from_public_key_der(&server.public_key_der).unwrap();
    let signature =
        Signature::from_der(list.signatures[0].signature.as_deref().unwrap()).unwrap();
    verifying_key.verify(&export_bin, &signature).unwrap();
}

#[tokio::test]
async fn test_buckets_listing_counts_elapsed_buckets() {
    let server = start_test_server(0).await;
    let today = UtcInstant::today();
    let day = today.date().to_string();
    let before = UtcInstant::now();
    let resp = reqwest::get(format!("{}/v1/gaen/buckets/{}", server.base_url, day))
        .await
        .unwrap();
    let after = UtcInstant::now();
    assert_eq!(resp.status(), 200);
    let buckets: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(buckets["dayTimestamp"], today.timestamp_millis());
    assert_eq!(buckets["day"], day);

    // one URL per bucket boundary that lay before the server's "now"
    let elapsed_buckets = |now: UtcInstant| {
        let mut count = 0;
        let mut boundary = today;
        while boundary < now {
            count += 1;
            boundary = boundary + bucket();
        }
        count
    };
    let urls = buckets["relativeUrls"].as_array().unwrap();
    assert!(urls.len() >= elapsed_buckets(before));
    assert!(urls.len() <= elapsed_buckets(after));
    for url in urls {
        assert!(url.as_str().unwrap().starts_with("/v1/gaen/exposed/"));
    }
}

#[tokio::test]
async fn test_buckets_rejects_bad_and_out_of_range_dates() {
    let server = start_test_server(0).await;
    let resp = reqwest::get(format!("{}/v1/gaen/buckets/yesterday", server.base_url))
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let ancient = (UtcInstant::today() - Duration::days(40)).date().to_string();
    let resp = reqwest::get(format!("{}/v1/gaen/buckets/{}", server.base_url, ancient))
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn test_historical_day_padded_with_fake_keys() {
    let server = start_test_server(5).await;
    let day = UtcInstant::today() - Duration::days(3);
    let resp = reqwest::get(format!(
        "{}/v1/gaen/exposed/{}",
        server.base_url,
        day.timestamp_millis()
    ))
    .await
    .unwrap();
    // no real keys, but padding fills the batch
    assert_eq!(resp.status(), 200);
    let archive = resp.bytes().await.unwrap();
    let export_bin = unzip_entry(&archive, "export.bin");
    let export = v1::TemporaryExposureKeyExport::decode(&export_bin[16..]).unwrap();
    assert!(export.keys.len() >= 5);
}

#[tokio::test]
async fn test_today_is_never_padded() {
    let server = start_test_server(5).await;
    let today = UtcInstant::today();
    let resp = reqwest::get(format!(
        "{}/v1/gaen/exposed/{}",
        server.base_url,
        today.timestamp_millis()
    ))
    .await
    .unwrap();
    assert_eq!(resp.status(), 204);
}
