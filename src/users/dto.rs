use serde::{Deserialize, Serialize};

use crate::users::model::User;

/// Request body for local signup.
#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub firstname: String,
    #[serde(default)]
    pub lastname: String,
    pub email: String,
    pub password: String,
    pub handle: Option<String>,
    #[serde(default)]
    pub about: String,
    #[serde(default)]
    pub profile_image: String,
}

/// Request body for a password change.
#[derive(Debug, Deserialize)]
pub struct ChangePasswordRequest {
    pub current_password: Option<String>,
    pub new_password: String,
}

/// User with the articles the content service holds for them.
#[derive(Debug, Serialize)]
pub struct UserDetails {
    #[serde(flatten)]
    pub user: User,
    pub contents: Vec<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
