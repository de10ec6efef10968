//! The individual validation/rewrite stages of the insertion pipeline.
//!
//! Every stage is stateless; per-request inputs travel in [`FilterContext`].
//! A stage either fails the whole batch (hard error) or drops/rewrites
//! individual keys and passes the rest along.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Duration;

use crate::auth::Principal;
use crate::clock::UtcInstant;
use crate::insertion::{FederationStamp, InsertError};
use crate::model::{ExposureKey, DEFAULT_ROLLING_PERIOD, KEY_LENGTH};

/// Per-request inputs shared by all stages.
pub struct FilterContext<'a> {
    pub now: UtcInstant,
    pub principal: &'a Principal,
    pub user_agent: &'a str,
    pub retention: Duration,
    pub federation: Option<&'a FederationStamp>,
}

/// One stage of the insertion pipeline. Order matters; the pipeline composes
/// these once at startup and applies them to every upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFilter {
    /// Key data must decode to exactly 16 bytes; violation rejects the batch.
    Base64Format,
    /// A key whose validity starts after "now" cannot be valid yet.
    RejectFuture,
    /// Keys older than the retention horizon are dropped.
    EnforceRetention,
    /// Decoy keys and keys from decoy requests must leave no trace.
    DropFake,
    /// 0 means "unset" and becomes the protocol default; negative rejects.
    NormalizeRollingPeriod,
    /// Stamp federation metadata and compute the onset offset.
    EnrichFederation,
}

impl KeyFilter {
    pub(crate) fn apply(
        &self,
        ctx: &FilterContext<'_>,
        keys: Vec<ExposureKey>,
    ) -> Result<Vec<ExposureKey>, InsertError> {
        match self {
            KeyFilter::Base64Format => base64_format(keys),
            KeyFilter::RejectFuture => reject_future(ctx, keys),
            KeyFilter::EnforceRetention => enforce_retention(ctx, keys),
            KeyFilter::DropFake => drop_fake(ctx, keys),
            KeyFilter::NormalizeRollingPeriod => normalize_rolling_period(ctx, keys),
            KeyFilter::EnrichFederation => enrich_federation(ctx, keys),
        }
    }
}

fn base64_format(keys: Vec<ExposureKey>) -> Result<Vec<ExposureKey>, InsertError> {
    for key in &keys {
        match BASE64.decode(&key.key_data) {
            Ok(raw) if raw.len() == KEY_LENGTH => {}
            _ => return Err(InsertError::InvalidEncoding),
        }
    }
    Ok(keys)
}

fn reject_future(
    ctx: &FilterContext<'_>,
    mut keys: Vec<ExposureKey>,
) -> Result<Vec<ExposureKey>, InsertError> {
    let now_interval = ctx.now.interval_number();
    keys.retain(|key| {
        let in_future = key.rolling_start_number as i64 > now_interval;
        if in_future {
            tracing::warn!(
                rolling_start_number = key.rolling_start_number,
                "dropping key with validity start in the future"
            );
        }
        !in_future
    });
    Ok(keys)
}

fn enforce_retention(
    ctx: &FilterContext<'_>,
    mut keys: Vec<ExposureKey>,
) -> Result<Vec<ExposureKey>, InsertError> {
    let horizon = ctx.now - ctx.retention;
    keys.retain(|key| key.start_time() >= horizon);
    Ok(keys)
}

fn drop_fake(
    ctx: &FilterContext<'_>,
    mut keys: Vec<ExposureKey>,
) -> Result<Vec<ExposureKey>, InsertError> {
    keys.retain(|key| !ctx.principal.is_fake_request(key));
    Ok(keys)
}

fn normalize_rolling_period(
    ctx: &FilterContext<'_>,
    mut keys: Vec<ExposureKey>,
) -> Result<Vec<ExposureKey>, InsertError> {
    for key in &mut keys {
        if key.rolling_period < 0 {
            return Err(InsertError::NegativeRollingPeriod);
        }
        if key.rolling_period == 0 {
            // Only Android is known to send 0; a 0 from iOS points at a
            // client bug worth surfacing.
            if ctx.user_agent.to_lowercase().contains("ios") {
                tracing::error!("received a rolling period of 0 from an iOS user agent");
            }
            key.rolling_period = DEFAULT_ROLLING_PERIOD;
        }
    }
    Ok(keys)
}

fn enrich_federation(
    ctx: &FilterContext<'_>,
    mut keys: Vec<ExposureKey>,
) -> Result<Vec<ExposureKey>, InsertError> {
    let Some(stamp) = ctx.federation else {
        return Ok(keys);
    };
    let efgs_sharing = ctx
        .principal
        .claims()
        .and_then(|c| c.efgs)
        .unwrap_or(false);
    let onset = ctx.principal.onset_date().unwrap_or_else(|| ctx.now.midnight());
    for key in &mut keys {
        key.country_origin = Some(stamp.country_origin.clone());
        key.report_type = Some(stamp.report_type);
        key.efgs_sharing = Some(efgs_sharing);
        key.days_since_onset_of_symptoms = Some(onset.days_since(key.key_date()));
        if !key.visited_countries.contains(&stamp.country_origin) {
            key.visited_countries.push(stamp.country_origin.clone());
        }
    }
    Ok(keys)
}
