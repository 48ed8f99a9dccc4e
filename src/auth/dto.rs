use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::users::model::User;

/// Request body for login.
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

/// Response returned after a password or OAuth login.
#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub access_token: String,
    pub token_type: &'static str,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    pub user: User,
}

/// Query string GitHub appends to the redirect back to us.
#[derive(Debug, Deserialize)]
pub struct OAuthCallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

/// JSON body for clients that forward the code themselves.
#[derive(Debug, Deserialize)]
pub struct OAuthCodeRequest {
    pub code: String,
}
