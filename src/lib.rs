//! lastseen authenticates users and keeps a short, bounded history of where
//! they connected from.

#![forbid(unsafe_code)]
mod clock;
pub mod config;
mod crypto;
pub mod database;
pub mod error;
pub mod history;
mod middleware;
mod router;
pub mod seed;
pub mod telemetry;
mod token;
pub mod user;

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::http::{Method, StatusCode, header};
use axum::routing::{get, post};
use axum::{Router, middleware as AxumMiddleware};
use error::ServerError;
use metrics_exporter_prometheus::PrometheusHandle;
use tower::ServiceBuilder;
use tower_http::LatencyUnit;
use tower_http::cors::{Any, CorsLayer};
use tower_http::sensitive_headers::SetSensitiveHeadersLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{
    DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer,
};

use crate::history::{HistoryService, HistoryStore, PgHistoryStore};
use crate::user::{PgUserRepository, UserRepository};

/// MUST NEVER be used in production.
#[cfg(test)]
pub async fn make_request(
    token: Option<String>,
    app: Router,
    method: Method,
    path: &str,
    body: String,
) -> axum::http::Response<axum::body::Body> {
    use axum::extract::Request;
    use tower::util::ServiceExt;

    let mut request = Request::builder()
        .method(method)
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        request = request.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }

    app.oneshot(request.body(axum::body::Body::from(body)).unwrap())
        .await
        .unwrap()
}

/// State sharing between routes.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<config::Configuration>,
    /// `None` when running on the in-memory store.
    pub db: Option<database::Database>,
    pub users: Arc<dyn UserRepository>,
    pub history: HistoryService,
    pub pwd: crypto::PasswordManager,
    pub token: token::TokenManager,
    pub metrics: Option<PrometheusHandle>,
}

/// Create router.
pub fn app(state: AppState) -> Router {
    let middleware = ServiceBuilder::new()
        // Add high level tracing/logging to all requests.
        .layer(
            TraceLayer::new_for_http()
                .on_body_chunk(|chunk: &Bytes, latency: Duration, _span: &tracing::Span| {
                    tracing::trace!(size_bytes = chunk.len(), latency = ?latency, "sending body chunk")
                })
                .make_span_with(DefaultMakeSpan::new().include_headers(true).level(tracing::Level::INFO))
                .on_request(DefaultOnRequest::new())
                .on_response(DefaultOnResponse::new().include_headers(true).latency_unit(LatencyUnit::Micros)),
        )
        // Set a timeout, above the history deadline.
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            state.config.history.timeout() + Duration::from_secs(5),
        ))
        // Remove sensitive headers from trace.
        .layer(SetSensitiveHeadersLayer::new([header::AUTHORIZATION, header::COOKIE]))
        // Add CORS preflight support.
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
                .allow_headers(Any)
                .vary([header::AUTHORIZATION]),
        );

    let api = Router::new()
        // `GET /api/health` goes to `health`.
        .route("/health", get(router::status::health))
        // `POST /api/login` goes to `login`.
        .route("/login", post(router::login::handler))
        .nest("/history", router::history::router(state.clone()));

    let mut router = Router::new().nest("/api", api);
    if state.metrics.is_some() {
        // `GET /metrics` goes to Prometheus.
        router = router.route("/metrics", get(telemetry::render));
    }

    router
        .fallback(|| async { ServerError::NotFound })
        .with_state(state)
        .route_layer(AxumMiddleware::from_fn(telemetry::track))
        .layer(middleware)
}

/// Initialize the application state.
pub async fn initialize_state(
    config: Arc<config::Configuration>,
    metrics: Option<PrometheusHandle>,
) -> Result<AppState, Box<dyn std::error::Error + Send + Sync>> {
    let (db, users, store): (
        Option<database::Database>,
        Arc<dyn UserRepository>,
        Arc<dyn HistoryStore>,
    ) = match config.postgres {
        Some(ref config) => {
            let db = database::Database::from_config(config).await?;

            // execute migrations scripts on start.
            db.migrate().await?;

            let users: Arc<dyn UserRepository> =
                Arc::new(PgUserRepository::new(db.postgres.clone()));
            let store: Arc<dyn HistoryStore> =
                Arc::new(PgHistoryStore::new(db.postgres.clone()));
            (Some(db), users, store)
        },
        None => {
            tracing::warn!(
                "missing `postgres` entry on `config.yaml` file, data is kept in memory"
            );
            let store = database::MemoryStore::new();
            let users: Arc<dyn UserRepository> = Arc::new(store.clone());
            let store: Arc<dyn HistoryStore> = Arc::new(store);
            (None, users, store)
        },
    };

    let pwd = crypto::PasswordManager::new(config.argon2.clone())?;

    // handle jwt.
    let secret = std::env::var("JWT_SECRET")
        .ok()
        .filter(|secret| !secret.is_empty())
        .or_else(|| config.token.as_ref().and_then(|t| t.secret.clone()))
        .ok_or(token::TokenError::MissingSecret)?;
    let mut token = token::TokenManager::new(&config.url, &secret)?;
    if let Some(audience) =
        config.token.as_ref().and_then(|t| t.audience.as_ref())
    {
        token.audience(audience);
    }

    let history = HistoryService::new(
        store,
        Arc::new(clock::SystemClock),
        config.history.timeout(),
    );

    Ok(AppState {
        config,
        db,
        users,
        history,
        pwd,
        token,
        metrics,
    })
}
