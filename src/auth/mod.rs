//! Request authentication: typed principal, claims, and token helpers.
//!
//! Token decoding happens once at the request boundary (the axum extractor
//! below); everything downstream works with the typed [`Principal`] and never
//! touches the raw JWT again.

pub mod jwt;

use axum::{
    extract::FromRequestParts,
    http::request::Parts,
};
use serde::{Deserialize, Serialize};

use crate::clock::UtcInstant;
use crate::model::ExposureKey;

/// Scope claim required for the initial key upload.
pub const SCOPE_EXPOSED: &str = "exposed";

/// Scope claim carried by server-issued second-day tokens.
pub const SCOPE_NEXT_DAY: &str = "currentDayExposed";

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("token missing required claim: {0}")]
    MissingClaim(&'static str),
    #[error("malformed claim: {0}")]
    InvalidClaim(&'static str),
    #[error("key date precedes declared onset")]
    ClaimBeforeOnset,
    #[error("token has already been used")]
    TokenReplayed,
}

/// Claims of an upload authorization token.
///
/// The first-upload token comes from the external health-authority issuer;
/// second-day tokens are issued by this server. Both decode into this struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    pub jti: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    pub iat: i64,
    pub exp: i64,
    pub scope: String,
    /// Declared onset date of symptoms, ISO calendar date.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub onset: Option<String>,
    /// "1" marks a decoy request that must leave no trace in storage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fake: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tan: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub efgs: Option<bool>,
    /// Key date the client committed to for its second-day upload,
    /// in 10-minute intervals since epoch.
    #[serde(
        default,
        rename = "delayedKeyDate",
        skip_serializing_if = "Option::is_none"
    )]
    pub delayed_key_date: Option<i32>,
}

/// External TAN verification, owned outside the core. Implementations are
/// expected to handle retries/backoff themselves and report only the verdict.
pub trait TanValidator: Send + Sync {
    fn validate(&self, tan: &str) -> bool;
}

/// Stand-in used when external TAN validation is disabled by configuration.
pub struct AcceptAllTanValidator;

impl TanValidator for AcceptAllTanValidator {
    fn validate(&self, _tan: &str) -> bool {
        true
    }
}

/// Gate on a present, numeric TAN claim. Deployments wire the networked
/// verification client in behind the same trait.
pub struct RequireTanValidator;

impl TanValidator for RequireTanValidator {
    fn validate(&self, tan: &str) -> bool {
        !tan.is_empty() && tan.chars().all(|c| c.is_ascii_digit())
    }
}

/// The authenticated identity of a request, resolved once at the boundary.
#[derive(Debug, Clone)]
pub enum Principal {
    Token(TokenClaims),
    Unauthenticated,
}

impl Principal {
    pub fn claims(&self) -> Option<&TokenClaims> {
        match self {
            Principal::Token(claims) => Some(claims),
            Principal::Unauthenticated => None,
        }
    }

    /// Whether the token authorizes the given scope, including the TAN check.
    pub fn is_valid_scope(&self, scope: &str, tan: &dyn TanValidator) -> bool {
        match self {
            Principal::Token(claims) => {
                claims.scope == scope && tan.validate(claims.tan.as_deref().unwrap_or(""))
            }
            Principal::Unauthenticated => false,
        }
    }

    /// Whether the whole request is a decoy.
    pub fn is_fake(&self) -> bool {
        matches!(self, Principal::Token(c) if c.fake.as_deref() == Some("1"))
    }

    /// A key must be discarded without trace when the token is a decoy, the
    /// key flags itself as fake, or (compatibility with older clients) the
    /// key is dated a full day or more before the declared onset.
    pub fn is_fake_request(&self, key: &ExposureKey) -> bool {
        if self.is_fake() || key.fake == 1 {
            return true;
        }
        if let Some(onset) = self.onset_date() {
            return onset.days_since(key.key_date()) >= 1;
        }
        false
    }

    /// The declared onset date, if present and well-formed.
    pub fn onset_date(&self) -> Option<UtcInstant> {
        self.claims()
            .and_then(|c| c.onset.as_deref())
            .and_then(|s| UtcInstant::parse_date(s).ok())
    }

    /// Validate the key against the declared onset date and return it.
    pub fn validated_onset_date(&self, key: &ExposureKey) -> Result<UtcInstant, AuthError> {
        let claims = self.claims().ok_or(AuthError::MissingClaim("onset"))?;
        let onset = claims.onset.as_deref().ok_or(AuthError::MissingClaim("onset"))?;
        let onset = UtcInstant::parse_date(onset).map_err(|_| AuthError::InvalidClaim("onset"))?;
        if key.key_date() < onset {
            return Err(AuthError::ClaimBeforeOnset);
        }
        Ok(onset)
    }
}

/// JWT secret stored in request extensions for the Principal extractor.
#[derive(Clone)]
pub struct JwtSecret(pub Vec<u8>);

impl<S> FromRequestParts<S> for Principal
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        // A missing or invalid bearer token is not a transport error: the
        // scope check downstream turns it into a 403. Decoy traffic relies
        // on this path behaving exactly like the authenticated one.
        let Some(secret) = parts.extensions.get::<JwtSecret>() else {
            return Ok(Principal::Unauthenticated);
        };
        let token = parts
            .headers
            .get("Authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        match token {
            Some(token) => match jwt::decode_claims(&secret.0, token) {
                Ok(claims) => Ok(Principal::Token(claims)),
                Err(_) => Ok(Principal::Unauthenticated),
            },
            None => Ok(Principal::Unauthenticated),
        }
    }
}
