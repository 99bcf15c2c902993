use axum::{Json, extract::State};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::AppState;
use crate::error::{Result, ServerError};
use crate::router::Valid;

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct Body {
    #[validate(email(message = "Email must be formatted."))]
    email: String,
    #[validate(length(min = 1, message = "Password is required."))]
    password: String,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub token: String,
    pub user: LoggedUser,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct LoggedUser {
    pub id: Uuid,
    pub email: String,
    pub name: String,
}

/// Handler to log in a user.
pub async fn handler(
    State(state): State<AppState>,
    Valid(body): Valid<Body>,
) -> Result<Json<Response>> {
    let Some(user) = state.users.find_by_email(&body.email).await? else {
        return Err(ServerError::InvalidCredentials);
    };

    state.pwd.verify_password(&body.password, &user.password)?;
    let token = state.token.create(&user.id.to_string())?;

    tracing::info!(user_id = %user.id, "user logged in");

    Ok(Json(Response {
        token,
        user: LoggedUser {
            id: user.id,
            email: user.email,
            name: user.name,
        },
    }))
}
