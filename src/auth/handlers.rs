use axum::{
    extract::{Query, State},
    http::{header, HeaderMap},
    response::{AppendHeaders, IntoResponse, Redirect},
    routing::{get, post},
    Json, Router,
};
use tracing::{info, instrument, warn};

use crate::{
    auth::{
        dto::{LoginRequest, LoginResponse, OAuthCallbackQuery, OAuthCodeRequest},
        extractors::{cookie_value, TOKEN_COOKIE},
        jwt::IssuedToken,
        oauth::{complete_login, new_state},
    },
    error::{AppError, AppResult},
    state::AppState,
    users::{dto::MessageResponse, model::User},
};

pub const OAUTH_STATE_COOKIE: &str = "oauth_state";
const SESSION_COOKIE_MAX_AGE: i64 = 30 * 24 * 60 * 60;
const OAUTH_STATE_MAX_AGE: i64 = 10 * 60;

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/login", post(login))
        .route("/auth/logout", post(logout))
        .route("/auth/github/login", get(github_login))
        .route(
            "/auth/github/callback",
            get(github_callback).post(github_callback_code),
        )
}

/// `Set-Cookie` value. A `max_age` of 0 clears the cookie.
pub fn cookie(name: &str, value: &str, max_age: i64, secure: bool) -> String {
    let mut c = format!("{name}={value}; HttpOnly; SameSite=Lax; Path=/; Max-Age={max_age}");
    if secure {
        c.push_str("; Secure");
    }
    c
}

/// Session cookie plus the JSON login body.
fn session_response(
    state: &AppState,
    user: User,
    issued: IssuedToken,
    extra_cookies: Vec<String>,
) -> impl IntoResponse {
    let mut cookies = vec![cookie(
        TOKEN_COOKIE,
        &issued.token,
        SESSION_COOKIE_MAX_AGE,
        state.config.cookie_secure,
    )];
    cookies.extend(extra_cookies);

    let headers: Vec<_> = cookies.into_iter().map(|c| (header::SET_COOKIE, c)).collect();
    (
        AppendHeaders(headers),
        Json(LoginResponse {
            access_token: issued.token,
            token_type: "Bearer",
            expires_at: issued.expires_at,
            user,
        }),
    )
}

#[instrument(skip(state, payload))]
pub async fn login(
    State(state): State<AppState>,
    Json(payload): Json<LoginRequest>,
) -> AppResult<impl IntoResponse> {
    let session = state.users.login(&payload.email, &payload.password).await?;
    Ok(session_response(&state, session.user, session.token, Vec::new()))
}

#[instrument(skip(state))]
pub async fn logout(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(
            header::SET_COOKIE,
            cookie(TOKEN_COOKIE, "", 0, state.config.cookie_secure),
        )],
        Json(MessageResponse::new("logged out")),
    )
}

#[instrument(skip(state))]
pub async fn github_login(State(state): State<AppState>) -> AppResult<impl IntoResponse> {
    let oauth_state = new_state();
    let url = state.oauth.authorize_url(&oauth_state)?;
    let cookie = cookie(
        OAUTH_STATE_COOKIE,
        &oauth_state,
        OAUTH_STATE_MAX_AGE,
        state.config.cookie_secure,
    );
    Ok(([(header::SET_COOKIE, cookie)], Redirect::to(&url)))
}

/// Redirect target. The `state` parameter must match the cookie set on login.
#[instrument(skip(state, headers, query))]
pub async fn github_callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<OAuthCallbackQuery>,
) -> AppResult<impl IntoResponse> {
    if let Some(error) = query.error {
        warn!(error = %error, "provider denied authorization");
        return Err(AppError::Auth("authorization denied".into()));
    }

    let expected = cookie_value(&headers, OAUTH_STATE_COOKIE);
    match (expected.as_deref(), query.state.as_deref()) {
        (Some(expected), Some(got)) if !expected.is_empty() && expected == got => {}
        _ => {
            warn!("oauth state mismatch");
            return Err(AppError::Auth("invalid oauth state".into()));
        }
    }

    let code = query.code.unwrap_or_default();
    let user = complete_login(state.oauth.as_ref(), &state.users, &code).await?;
    info!(user_id = %user.id, "github login");

    let issued = state.users.issue_token(&user)?;
    let clear_state = cookie(OAUTH_STATE_COOKIE, "", 0, state.config.cookie_secure);
    Ok(session_response(&state, user, issued, vec![clear_state]))
}

/// Code forwarded by a client that handled the redirect itself.
#[instrument(skip(state, payload))]
pub async fn github_callback_code(
    State(state): State<AppState>,
    Json(payload): Json<OAuthCodeRequest>,
) -> AppResult<impl IntoResponse> {
    let user = complete_login(state.oauth.as_ref(), &state.users, &payload.code).await?;
    info!(user_id = %user.id, "github login");
    let issued = state.users.issue_token(&user)?;
    Ok(session_response(&state, user, issued, Vec::new()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_cookie_attributes() {
        let c = cookie(TOKEN_COOKIE, "abc", SESSION_COOKIE_MAX_AGE, false);
        assert_eq!(c, "token=abc; HttpOnly; SameSite=Lax; Path=/; Max-Age=2592000");
        assert!(cookie(TOKEN_COOKIE, "abc", 10, true).ends_with("; Secure"));
    }

    #[test]
    fn clearing_cookie_has_zero_max_age() {
        assert!(cookie(TOKEN_COOKIE, "", 0, false).contains("Max-Age=0"));
    }
}
