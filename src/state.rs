use std::sync::Arc;

use chrono::Duration;

use crate::auth::TanValidator;
use crate::export::BatchSigner;
use crate::fakekeys::FakeKeyService;
use crate::insertion::InsertionPipeline;
use crate::storage::KeyStore;

/// Release timing knobs shared by handlers.
#[derive(Debug, Clone, Copy)]
pub struct ReleaseSettings {
    /// Width of one release bucket.
    pub bucket: Duration,
    /// Grace period after a key's nominal expiry.
    pub time_skew: Duration,
    /// Retention horizon for stored keys.
    pub retention: Duration,
    /// Minimum latency for upload handlers.
    pub request_time: std::time::Duration,
}

/// Shared application state passed to all handlers via axum State extractor.
#[derive(Clone)]
pub struct AppState {
    /// Storage engine (baseline or federation-aware, selected by config)
    pub store: Arc<dyn KeyStore>,
    /// Filter chain applied to every uploaded batch
    pub pipeline: Arc<InsertionPipeline>,
    /// Fake-key padding service
    pub fake_keys: Arc<FakeKeyService>,
    /// Export encoder and signer
    pub signer: Arc<BatchSigner>,
    /// External TAN verification
    pub tan: Arc<dyn TanValidator>,
    /// HS256 secret for upload and second-day tokens
    pub jwt_secret: Vec<u8>,
    /// Release timing knobs
    pub release: ReleaseSettings,
}
