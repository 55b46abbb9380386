//! Service wiring: database pool, quota subsystem and the axum app.
//!
//! The quota enforcer is constructed here and shared through [`AppState`];
//! resource-creation handlers call [`crate::quota::QuotaEnforcer::reserve`]
//! in-process, it is deliberately not a network endpoint.

pub mod handlers;

use crate::quota::{
    self, DistributedLock, LockConfig, PgLockStore, PgQuotaProvider, PgUsageStore, QuotaEnforcer,
};
use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::MatchedPath,
    http::{HeaderName, HeaderValue, Request},
    routing::get,
    Extension, Router,
};
use sqlx::postgres::PgPoolOptions;
use std::{sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    request_id::PropagateRequestIdLayer, set_header::SetRequestHeaderLayer, trace::TraceLayer,
};
use tracing::{info, info_span, Span};
use ulid::Ulid;

/// Shared state handed to request handlers.
#[derive(Clone)]
pub struct AppState {
    pub enforcer: Arc<QuotaEnforcer>,
    pub invitation_expiry: Duration,
}

/// Start the server
/// # Errors
/// Return error if failed to start the server
pub async fn new(
    port: u16,
    dsn: String,
    lock_config: LockConfig,
    invitation_expiry: Duration,
) -> Result<()> {
    // Connect to database
    let pool = PgPoolOptions::new()
        .min_connections(1)
        .max_connections(5)
        .test_before_acquire(true)
        .connect(&dsn)
        .await
        .context("Failed to connect to database")?;

    quota::store::ensure_schema(&pool)
        .await
        .context("Failed to apply quota schema")?;

    let lock = DistributedLock::new(Arc::new(PgLockStore::new(pool.clone())), lock_config);
    let enforcer = Arc::new(QuotaEnforcer::new(
        lock,
        Arc::new(PgUsageStore::new(pool.clone())),
        Arc::new(PgQuotaProvider::new(pool)),
    ));

    let state = AppState {
        enforcer,
        invitation_expiry,
    };

    let app = router(state);

    let listener = TcpListener::bind(format!("::0:{port}")).await?;

    info!("Listening on [::]:{}", port);

    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}

/// Build the app router with tracing and request-id layers.
#[must_use]
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::if_not_present(
                    HeaderName::from_static("x-request-id"),
                    |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    "x-request-id",
                )))
                .layer(TraceLayer::new_for_http().make_span_with(make_span)),
        )
        .layer(Extension(state))
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}
