//! Key upload endpoints: the initial batch upload and the second-day upload
//! of the final key.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Duration;

use crate::api::{internal_error, pad_request_time};
use crate::auth::{jwt, Principal, SCOPE_EXPOSED, SCOPE_NEXT_DAY};
use crate::clock::UtcInstant;
use crate::model::{
    KeyUploadRequest, SecondDayUploadRequest, DEFAULT_ROLLING_PERIOD, KEY_LENGTH,
};
use crate::state::AppState;

/// POST /v1/gaen/exposed
///
/// Validates and stores an uploaded key batch, then answers with a token for
/// the next day's delayed key. Decoy requests take the same path and the same
/// time but leave nothing behind.
pub async fn add_exposed(
    State(state): State<AppState>,
    headers: HeaderMap,
    principal: Principal,
    Json(request): Json<KeyUploadRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let started = tokio::time::Instant::now();
    let now = UtcInstant::now();

    let Principal::Token(claims) = &principal else {
        return Err((StatusCode::FORBIDDEN, "authentication failed".to_string()));
    };
    if !principal.is_valid_scope(SCOPE_EXPOSED, state.tan.as_ref()) {
        return Err((StatusCode::FORBIDDEN, "authentication failed".to_string()));
    }

    redeem_token_once(&state, claims, now).await?;

    // The client commits to the date of its delayed key up front.
    let delayed_key_day =
        UtcInstant::from_interval_number(request.delayed_key_date as i64).midnight();
    let today = now.midnight();
    if delayed_key_day < today - Duration::days(1) || delayed_key_day > today + Duration::days(1) {
        return Err((
            StatusCode::BAD_REQUEST,
            "delayedKeyDate date must be between yesterday and tomorrow".to_string(),
        ));
    }

    let user_agent = headers
        .get("User-Agent")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let accepted = state
        .pipeline
        .validate_and_normalize(now, request.gaen_keys, &principal, user_agent)
        .map_err(|err| (StatusCode::BAD_REQUEST, err.to_string()))?;

    if principal.is_fake() && !accepted.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "claim is fake but list contains non fake keys".to_string(),
        ));
    }

    if !accepted.is_empty() {
        let store = state.store.clone();
        tokio::task::spawn_blocking(move || store.upsert(&accepted, now))
            .await
            .map_err(internal_error)?
            .map_err(internal_error)?;
    }

    let token = jwt::issue_second_day_token(&state.jwt_secret, claims, request.delayed_key_date)
        .map_err(internal_error)?;
    let bearer = format!("Bearer {token}");

    pad_request_time(started, state.release.request_time).await;
    Ok((
        [
            ("authorization", bearer.clone()),
            ("x-exposed-token", bearer),
        ],
        "OK",
    ))
}

/// POST /v1/gaen/exposednextday
///
/// Accepts exactly one key bound to a token issued by the first upload. The
/// key's declared date must match the token's claim, and the token is good
/// for one redemption only.
pub async fn add_exposed_second(
    State(state): State<AppState>,
    headers: HeaderMap,
    principal: Principal,
    Json(request): Json<SecondDayUploadRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let started = tokio::time::Instant::now();
    let now = UtcInstant::now();
    let mut key = request.delayed_key;

    match BASE64.decode(&key.key_data) {
        Ok(raw) if raw.len() == KEY_LENGTH => {}
        _ => return Err((StatusCode::BAD_REQUEST, "no valid base64 key".to_string())),
    }

    let Principal::Token(claims) = &principal else {
        return Err((StatusCode::FORBIDDEN, "authentication failed".to_string()));
    };
    if claims.scope != SCOPE_NEXT_DAY {
        return Err((StatusCode::FORBIDDEN, "authentication failed".to_string()));
    }
    let Some(claim_key_date) = claims.delayed_key_date else {
        return Err((
            StatusCode::FORBIDDEN,
            "claim does not contain delayedKeyDate".to_string(),
        ));
    };
    if key.rolling_start_number != claim_key_date {
        return Err((
            StatusCode::BAD_REQUEST,
            "keyDate does not match claim keyDate".to_string(),
        ));
    }

    redeem_token_once(&state, claims, now).await?;

    if !principal.is_fake_request(&key) {
        if key.rolling_period < 0 {
            return Err((
                StatusCode::BAD_REQUEST,
                "rolling period must not be negative".to_string(),
            ));
        }
        if key.rolling_period == 0 {
            let user_agent = headers
                .get("User-Agent")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            if user_agent.to_lowercase().contains("ios") {
                tracing::error!("received a rolling period of 0 from an iOS user agent");
            }
            key.rolling_period = DEFAULT_ROLLING_PERIOD;
        }

        // The delayed key must carry the original upload's bucket timing;
        // the issuing time of the token is the original upload instant.
        let original_upload = UtcInstant::from_timestamp_millis(claims.iat * 1000)
            .unwrap_or(now);
        let delayed_received_at =
            original_upload.round_up_to_next_bucket(state.release.bucket)
                - Duration::milliseconds(1);

        let store = state.store.clone();
        tokio::task::spawn_blocking(move || {
            store.upsert_delayed(&[key], Some(delayed_received_at), now)
        })
        .await
        .map_err(internal_error)?
        .map_err(internal_error)?;
    }

    pad_request_time(started, state.release.request_time).await;
    Ok("OK")
}

/// Accept-once redemption of the token identifier; a replay is an
/// authorization failure, not a validation one.
async fn redeem_token_once(
    state: &AppState,
    claims: &crate::auth::TokenClaims,
    now: UtcInstant,
) -> Result<(), (StatusCode, String)> {
    let expires_at = UtcInstant::from_timestamp_millis(claims.exp * 1000)
        .unwrap_or(now + Duration::days(2));
    let store = state.store.clone();
    let jti = claims.jti.clone();
    let redeemed = tokio::task::spawn_blocking(move || store.redeem_token(&jti, expires_at))
        .await
        .map_err(internal_error)?
        .map_err(internal_error)?;
    if !redeemed {
        return Err((
            StatusCode::FORBIDDEN,
            "token has already been used".to_string(),
        ));
    }
    Ok(())
}
