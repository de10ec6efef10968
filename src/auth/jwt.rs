use std::path::Path;

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use rand::Rng;
use uuid::Uuid;

use crate::auth::{TokenClaims, SCOPE_NEXT_DAY};
use crate::clock::UtcInstant;

/// Validity of a second-day token beyond its claimed key date.
const NEXT_DAY_TOKEN_LIFETIME_HOURS: i64 = 48;

/// Load or generate the JWT secret (256-bit random, stored as raw bytes in
/// `data_dir/jwt_secret`). The upload-token issuer must share this secret.
pub fn load_or_generate_jwt_secret(data_dir: &str) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    let key_path = Path::new(data_dir).join("jwt_secret");

    if key_path.exists() {
        let key = std::fs::read(&key_path)?;
        if key.len() == 32 {
            tracing::info!("JWT secret loaded from {}", key_path.display());
            return Ok(key);
        }
        tracing::warn!("JWT secret file has wrong size ({}), regenerating", key.len());
    }

    let key: [u8; 32] = rand::rng().random();
    std::fs::write(&key_path, key)?;
    tracing::info!("JWT secret generated at {}", key_path.display());
    Ok(key.to_vec())
}

/// Decode and verify an upload authorization token (HS256, expiry enforced).
pub fn decode_claims(
    secret: &[u8],
    token: &str,
) -> Result<TokenClaims, jsonwebtoken::errors::Error> {
    let validation = Validation::new(jsonwebtoken::Algorithm::HS256);
    let data = decode::<TokenClaims>(token, &DecodingKey::from_secret(secret), &validation)?;
    Ok(data.claims)
}

/// Issue the token that authorizes one delayed key upload on the following
/// day. Scope is pinned to the second-day endpoint, expiry is the claimed key
/// date plus 48 hours, and a decoy marker on the original token is carried
/// over so the whole decoy conversation stays fake end to end.
pub fn issue_second_day_token(
    secret: &[u8],
    prior: &TokenClaims,
    delayed_key_date: i32,
) -> Result<String, jsonwebtoken::errors::Error> {
    let key_day = UtcInstant::from_interval_number(delayed_key_date as i64).midnight();
    let claims = TokenClaims {
        jti: Uuid::new_v4().to_string(),
        iss: Some("tekrelay-server".to_string()),
        sub: prior.sub.clone(),
        iat: Utc::now().timestamp(),
        exp: (key_day + Duration::hours(NEXT_DAY_TOKEN_LIFETIME_HOURS)).timestamp_millis() / 1000,
        scope: SCOPE_NEXT_DAY.to_string(),
        onset: None,
        fake: prior.fake.clone(),
        tan: None,
        efgs: None,
        delayed_key_date: Some(delayed_key_date),
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret))
}
