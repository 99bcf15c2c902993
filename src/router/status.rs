//! Liveness probe.

use axum::Json;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct Health {
    status: &'static str,
}

/// Always `{"status":"ok"}` while the process serves requests.
pub async fn health() -> Json<Health> {
    Json(Health { status: "ok" })
}
