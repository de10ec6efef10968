use axum::{middleware, Router};

use crate::api::{download, upload};
use crate::auth::JwtSecret;
use crate::state::AppState;

/// Inject the JWT secret into request extensions so the Principal extractor
/// can find it.
async fn inject_jwt_secret(
    axum::extract::State(state): axum::extract::State<AppState>,
    mut req: axum::http::Request<axum::body::Body>,
    next: middleware::Next,
) -> axum::response::Response {
    req.extensions_mut()
        .insert(JwtSecret(state.jwt_secret.clone()));
    next.run(req).await
}

/// Build the full axum Router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let gaen_routes = Router::new()
        .route(
            "/v1/gaen/exposed",
            axum::routing::post(upload::add_exposed),
        )
        .route(
            "/v1/gaen/exposednextday",
            axum::routing::post(upload::add_exposed_second),
        )
        .route(
            "/v1/gaen/exposed/{key_date}",
            axum::routing::get(download::get_exposed_keys),
        )
        .route(
            "/v1/gaen/buckets/{day}",
            axum::routing::get(download::get_buckets),
        );

    // Health check
    let health = Router::new().route("/health", axum::routing::get(health_check));

    Router::new()
        .merge(gaen_routes)
        .merge(health)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            inject_jwt_secret,
        ))
        .with_state(state)
}

/// Basic health check endpoint
async fn health_check() -> &'static str {
    "ok"
}
