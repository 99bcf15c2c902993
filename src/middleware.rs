//! Middlewares for routes.

use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::Response;
use uuid::Uuid;

use crate::AppState;
use crate::error::{Result, ServerError};

const BEARER: &str = "Bearer ";

/// Identity proven by the request's bearer token.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AuthenticatedUser(pub Uuid);

/// Custom middleware for authentification.
///
/// Inserts an [`AuthenticatedUser`] extension, or answers 401.
pub async fn authenticate(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response> {
    let user_id = {
        let token = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|header| header.to_str().ok())
            .and_then(|header| header.strip_prefix(BEARER))
            .ok_or(ServerError::Unauthorized)?;

        let claims = state.token.decode(token.trim()).map_err(|err| {
            tracing::debug!(error = %err, "token rejected");
            ServerError::Unauthorized
        })?;

        Uuid::parse_str(&claims.sub).map_err(|_| ServerError::Unauthorized)?
    };

    req.extensions_mut().insert(AuthenticatedUser(user_id));
    Ok(next.run(req).await)
}
