//! Key retrieval endpoints: the signed batch download and the bucket listing.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Duration;
use serde::Deserialize;

use crate::api::internal_error;
use crate::clock::UtcInstant;
use crate::model::DayBuckets;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ExposedQuery {
    /// Restrict the batch to keys received at or after this bucket boundary,
    /// in milliseconds since the Unix epoch.
    pub publishedafter: Option<i64>,
}

/// GET /v1/gaen/exposed/{key_date}
///
/// The signed zip of all releasable keys whose validity starts on the given
/// day, topped up with the day's fake keys. Empty batches answer 204; both
/// answers expose the publication cutoff via headers.
pub async fn get_exposed_keys(
    State(state): State<AppState>,
    Path(key_date_millis): Path<i64>,
    Query(query): Query<ExposedQuery>,
) -> Result<Response, (StatusCode, String)> {
    let now = UtcInstant::now();
    let bucket = state.release.bucket;

    let key_date = UtcInstant::from_timestamp_millis(key_date_millis)
        .filter(|date| date.is_midnight())
        .ok_or((
            StatusCode::BAD_REQUEST,
            "key date must point to midnight UTC".to_string(),
        ))?;

    let published_after = match query.publishedafter {
        Some(millis) => {
            let after = UtcInstant::from_timestamp_millis(millis)
                .filter(|after| after.is_bucket_aligned(bucket))
                .ok_or((
                    StatusCode::BAD_REQUEST,
                    "publishedAfter must align to a release bucket boundary".to_string(),
                ))?;
            Some(after)
        }
        None => None,
    };

    // Only completed buckets are ever published.
    let published_until = now.round_down_to_bucket(bucket);
    let expires = published_until + bucket - Duration::milliseconds(1);
    let cutoff_headers = [
        (
            "x-published-until",
            published_until.timestamp_millis().to_string(),
        ),
        ("expires", expires.http_date()),
    ];

    let store = state.store.clone();
    let fake_keys = state.fake_keys.clone();
    let keys = tokio::task::spawn_blocking(move || {
        let keys = store.keys_for_date(key_date, published_after, published_until, now)?;
        fake_keys.fill_up_keys(keys, published_after, key_date, now)
    })
    .await
    .map_err(internal_error)?
    .map_err(internal_error)?;

    if keys.is_empty() {
        return Ok((StatusCode::NO_CONTENT, cutoff_headers).into_response());
    }

    // A signing failure would mean shipping an unverifiable batch; that is a
    // security incident, never silently swallowed.
    let batch = state.signer.encode(keys).map_err(internal_error)?;

    Ok((StatusCode::OK, [
        ("content-type", "application/zip".to_string()),
        (
            "x-published-until",
            published_until.timestamp_millis().to_string(),
        ),
        ("expires", expires.http_date()),
    ], batch.zip)
        .into_response())
}

/// GET /v1/gaen/buckets/{day}
///
/// Lists the retrieval URLs for every release bucket of the day that has
/// already elapsed.
pub async fn get_buckets(
    State(state): State<AppState>,
    Path(day): Path<String>,
) -> Result<Json<DayBuckets>, (StatusCode, String)> {
    let now = UtcInstant::now();
    let start_of_day = UtcInstant::parse_date(&day)
        .map_err(|err| (StatusCode::BAD_REQUEST, err.to_string()))?;

    let today = now.midnight();
    if start_of_day < today - state.release.retention || start_of_day > today {
        return Err((
            StatusCode::BAD_REQUEST,
            "date outside the retention window".to_string(),
        ));
    }

    let end_of_day = start_of_day + Duration::days(1);
    let mut relative_urls = Vec::new();
    let mut boundary = start_of_day;
    while boundary < now.min(end_of_day) {
        relative_urls.push(format!("/v1/gaen/exposed/{}", boundary.timestamp_millis()));
        boundary = boundary + state.release.bucket;
    }

    Ok(Json(DayBuckets {
        day_timestamp: start_of_day.timestamp_millis(),
        day,
        relative_urls,
    }))
}
