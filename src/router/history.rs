//! Connection history HTTP API. Authorization required.

use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{delete, get};
use axum::{Extension, Json, Router, middleware};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::AppState;
use crate::error::Result;
use crate::history::{Entry, NewEntry};
use crate::middleware::{AuthenticatedUser, authenticate};
use crate::router::Valid;

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    /// Kept raw: anything that is not a positive integer means "default".
    limit: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct DeleteBody {
    #[validate(length(min = 1, message = "At least one IP address is required."))]
    ips: Vec<String>,
}

pub fn router(state: AppState) -> Router<AppState> {
    Router::new()
        // `GET /history` goes to `list`, `POST` to `upsert`, `DELETE` to
        // `delete_by_ips`.
        .route("/", get(list).post(upsert).delete(delete_by_ips))
        // `DELETE /history/all` goes to `delete_all`.
        .route("/all", delete(delete_all))
        .route_layer(middleware::from_fn_with_state(state, authenticate))
}

/// List the most recent entries of the caller.
async fn list(
    State(state): State<AppState>,
    Extension(AuthenticatedUser(user_id)): Extension<AuthenticatedUser>,
    query: std::result::Result<Query<ListQuery>, QueryRejection>,
) -> Result<Json<Vec<Entry>>> {
    // A query string that cannot be read falls back to the default too.
    let limit = query
        .ok()
        .and_then(|Query(query)| query.limit)
        .and_then(|limit| limit.trim().parse::<i64>().ok());

    Ok(Json(state.history.list(user_id, limit).await?))
}

/// Record a connection of the caller.
async fn upsert(
    State(state): State<AppState>,
    Extension(AuthenticatedUser(user_id)): Extension<AuthenticatedUser>,
    Valid(body): Valid<NewEntry>,
) -> Result<Json<Entry>> {
    Ok(Json(state.history.upsert(user_id, body).await?))
}

async fn delete_by_ips(
    State(state): State<AppState>,
    Extension(AuthenticatedUser(user_id)): Extension<AuthenticatedUser>,
    Valid(body): Valid<DeleteBody>,
) -> Result<StatusCode> {
    state.history.delete_by_ips(user_id, &body.ips).await?;

    Ok(StatusCode::NO_CONTENT)
}

async fn delete_all(
    State(state): State<AppState>,
    Extension(AuthenticatedUser(user_id)): Extension<AuthenticatedUser>,
) -> Result<StatusCode> {
    state.history.delete_all(user_id).await?;

    Ok(StatusCode::NO_CONTENT)
}
