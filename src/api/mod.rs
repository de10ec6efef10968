//! HTTP handlers for the mobile-client API.

pub mod download;
pub mod upload;

use axum::http::StatusCode;

/// Pad handler latency to the configured minimum so cheap decoy paths are
/// indistinguishable from real uploads. Only this handler's task sleeps.
pub(crate) async fn pad_request_time(
    started: tokio::time::Instant,
    minimum: std::time::Duration,
) {
    let elapsed = started.elapsed();
    if let Some(remaining) = minimum.checked_sub(elapsed) {
        tokio::time::sleep(remaining).await;
    }
}

/// Log the real failure, answer with an opaque 500.
pub(crate) fn internal_error<E: std::fmt::Display>(err: E) -> (StatusCode, String) {
    tracing::error!("internal error: {}", err);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "internal error".to_string(),
    )
}
