use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, put},
    Json, Router,
};
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::{
    auth::extractors::AuthUser,
    error::AppResult,
    state::AppState,
    users::{
        dto::{ChangePasswordRequest, CreateUserRequest, MessageResponse, UserDetails},
        model::{User, UserPatch},
    },
};

// --- public routers ---

pub fn read_routes() -> Router<AppState> {
    Router::new()
        .route("/users", get(list_users).post(create_user))
        .route("/users/:id", get(get_user))
        .route("/users/email/:email", get(get_user_by_email))
}

pub fn write_routes() -> Router<AppState> {
    Router::new()
        .route("/users", delete(delete_all_users))
        .route("/users/:id", put(update_user).delete(delete_user))
        .route("/users/:id/password", put(change_password))
}

// --- handlers ---

#[instrument(skip(state, payload))]
pub async fn create_user(
    State(state): State<AppState>,
    Json(payload): Json<CreateUserRequest>,
) -> AppResult<(StatusCode, Json<User>)> {
    let user = state.users.signup(payload).await?;
    Ok((StatusCode::CREATED, Json(user)))
}

#[instrument(skip(state))]
pub async fn list_users(State(state): State<AppState>) -> AppResult<Json<Vec<User>>> {
    Ok(Json(state.users.list().await?))
}

/// The user with whatever the content service holds for them.
#[instrument(skip(state))]
pub async fn get_user(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<UserDetails>> {
    let user = state.users.get(id).await?;
    let contents = state.content.by_author(user.id).await;
    Ok(Json(UserDetails { user, contents }))
}

#[instrument(skip(state))]
pub async fn get_user_by_email(
    State(state): State<AppState>,
    Path(email): Path<String>,
) -> AppResult<Json<User>> {
    Ok(Json(state.users.get_by_email(&email).await?))
}

#[instrument(skip(state, patch))]
pub async fn update_user(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    Path(id): Path<Uuid>,
    Json(patch): Json<UserPatch>,
) -> AppResult<Json<User>> {
    if caller != id {
        warn!(%caller, %id, "updating another user's profile");
    }
    Ok(Json(state.users.update_profile(id, patch).await?))
}

#[instrument(skip(state, payload))]
pub async fn change_password(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<ChangePasswordRequest>,
) -> AppResult<Json<MessageResponse>> {
    state
        .users
        .change_password(
            caller,
            id,
            payload.current_password.as_deref(),
            &payload.new_password,
        )
        .await?;
    Ok(Json(MessageResponse::new("password updated")))
}

#[instrument(skip(state))]
pub async fn delete_user(
    State(state): State<AppState>,
    AuthUser(_caller): AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<StatusCode> {
    state.users.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip(state))]
pub async fn delete_all_users(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
) -> AppResult<StatusCode> {
    warn!(%caller, "bulk delete requested");
    state.users.delete_all().await?;
    Ok(StatusCode::NO_CONTENT)
}
