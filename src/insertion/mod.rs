//! The insertion pipeline: an ordered chain of validating and rewriting
//! filters applied to every uploaded key batch before storage.
//!
//! The chain is composed once at startup from configuration. Running it is a
//! pure transformation: same inputs, same outputs, no I/O.

pub mod filters;

use chrono::Duration;

use crate::auth::Principal;
use crate::clock::UtcInstant;
use crate::model::ExposureKey;

pub use filters::{FilterContext, KeyFilter};

/// Hard failures that reject the entire upload.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum InsertError {
    #[error("no valid base64 key")]
    InvalidEncoding,
    #[error("rolling period must not be negative")]
    NegativeRollingPeriod,
}

/// Federation metadata stamped onto accepted keys (regional deployments).
#[derive(Debug, Clone)]
pub struct FederationStamp {
    pub country_origin: String,
    pub report_type: i32,
}

pub struct InsertionPipeline {
    filters: Vec<KeyFilter>,
    retention: Duration,
    federation: Option<FederationStamp>,
}

impl InsertionPipeline {
    /// Compose the stage list. The enrichment stage only runs for
    /// federation-aware deployments.
    pub fn new(retention: Duration, federation: Option<FederationStamp>) -> Self {
        let mut filters = vec![
            KeyFilter::Base64Format,
            KeyFilter::RejectFuture,
            KeyFilter::EnforceRetention,
            KeyFilter::DropFake,
            KeyFilter::NormalizeRollingPeriod,
        ];
        if federation.is_some() {
            filters.push(KeyFilter::EnrichFederation);
        }
        InsertionPipeline {
            filters,
            retention,
            federation,
        }
    }

    /// Run every stage in order. Returns the accepted, normalized keys or the
    /// first hard failure. Dropped keys are not an error: the batch shrinks
    /// and the upload still succeeds.
    pub fn validate_and_normalize(
        &self,
        now: UtcInstant,
        keys: Vec<ExposureKey>,
        principal: &Principal,
        user_agent: &str,
    ) -> Result<Vec<ExposureKey>, InsertError> {
        let ctx = FilterContext {
            now,
            principal,
            user_agent,
            retention: self.retention,
            federation: self.federation.as_ref(),
        };
        let mut keys = keys;
        for filter in &self.filters {
            keys = filter.apply(&ctx, keys)?;
        }
        Ok(keys)
    }
}
