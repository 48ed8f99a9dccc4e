//! Account provisioning from an external identity provider (GitHub).
//!
//! Authorization-code grant: redirect to the provider, exchange the returned
//! code for a provider token, fetch the profile, then find-or-create the
//! local user. Nothing is written before the profile has been fetched.

use std::time::Duration;

use async_trait::async_trait;
use rand::{rngs::OsRng, RngCore};
use reqwest::Url;
use serde::Deserialize;
use time::OffsetDateTime;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::GithubConfig;
use crate::error::{AppError, AppResult};
use crate::users::{
    model::{default_handle, ExternalIdentity, User},
    services::UserService,
};

pub const GITHUB_PROVIDER: &str = "github";
const GITHUB_AUTHORIZE_URL: &str = "https://github.com/login/oauth/authorize";
const GITHUB_TOKEN_URL: &str = "https://github.com/login/oauth/access_token";
const GITHUB_PROFILE_URL: &str = "https://api.github.com/user";
const GITHUB_SCOPE: &str = "read:user";

/// Profile returned by an identity provider, already normalised.
#[derive(Debug, Clone)]
pub struct ExternalProfile {
    pub provider: String,
    pub provider_user_id: String,
    pub display_name: Option<String>,
    pub login: String,
    pub email: String,
    pub avatar_url: String,
    pub bio: String,
}

/// Splits a display name into first and last name.
///
/// The first whitespace-separated token is the first name and the rest is
/// the last name. A single token leaves the last name empty; an empty name
/// falls back to the provider login.
pub fn split_display_name(name: Option<&str>, login: &str) -> (String, String) {
    let mut parts = name.unwrap_or_default().split_whitespace();
    match parts.next() {
        Some(first) => (first.to_string(), parts.collect::<Vec<_>>().join(" ")),
        None => (login.to_string(), String::new()),
    }
}

impl ExternalProfile {
    /// Builds a local user with no password hash.
    pub fn into_user(self, service: &str) -> User {
        let (firstname, lastname) = split_display_name(self.display_name.as_deref(), &self.login);
        let now = OffsetDateTime::now_utc();
        User {
            id: Uuid::new_v4(),
            handle: default_handle(&firstname, service),
            firstname,
            lastname,
            email: self.email.trim().to_lowercase(),
            password_hash: None,
            external_identity: Some(ExternalIdentity {
                provider: self.provider,
                provider_user_id: self.provider_user_id,
            }),
            about: self.bio,
            profile_image: self.avatar_url,
            following: 0,
            followers: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Server-side half of an authorization-code flow.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    fn name(&self) -> &'static str;
    fn authorize_url(&self, state: &str) -> AppResult<String>;
    async fn exchange_code(&self, code: &str) -> AppResult<String>;
    async fn fetch_profile(&self, access_token: &str) -> AppResult<ExternalProfile>;
}

/// Random opaque value for the `state` parameter.
pub fn new_state() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[derive(Debug, Deserialize)]
struct GithubTokenResponse {
    access_token: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GithubUser {
    id: u64,
    login: String,
    name: Option<String>,
    email: Option<String>,
    avatar_url: Option<String>,
    bio: Option<String>,
}

impl From<GithubUser> for ExternalProfile {
    fn from(u: GithubUser) -> Self {
        let email = match u.email.filter(|e| !e.trim().is_empty()) {
            Some(e) => e,
            // Private emails: GitHub's own noreply form is unique per account.
            None => format!("{}+{}@users.noreply.github.com", u.id, u.login),
        };
        Self {
            provider: GITHUB_PROVIDER.to_string(),
            provider_user_id: u.id.to_string(),
            display_name: u.name,
            login: u.login,
            email,
            avatar_url: u.avatar_url.unwrap_or_default(),
            bio: u.bio.unwrap_or_default(),
        }
    }
}

pub struct GithubOAuth {
    client: reqwest::Client,
    client_id: String,
    client_secret: String,
    redirect_url: String,
}

impl GithubOAuth {
    pub fn new(cfg: &GithubConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            client_id: cfg.client_id.clone(),
            client_secret: cfg.client_secret.clone(),
            redirect_url: cfg.redirect_url.clone(),
        })
    }
}

#[async_trait]
impl IdentityProvider for GithubOAuth {
    fn name(&self) -> &'static str {
        GITHUB_PROVIDER
    }

    fn authorize_url(&self, state: &str) -> AppResult<String> {
        let url = Url::parse_with_params(
            GITHUB_AUTHORIZE_URL,
            &[
                ("client_id", self.client_id.as_str()),
                ("redirect_uri", self.redirect_url.as_str()),
                ("scope", GITHUB_SCOPE),
                ("state", state),
            ],
        )
        .map_err(AppError::internal)?;
        Ok(url.into())
    }

    #[instrument(skip(self, code))]
    async fn exchange_code(&self, code: &str) -> AppResult<String> {
        let params = [
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("code", code),
            ("redirect_uri", self.redirect_url.as_str()),
        ];
        let response = self
            .client
            .post(GITHUB_TOKEN_URL)
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&params)
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, "github token request failed");
                AppError::Upstream("failed to exchange code for token".into())
            })?;

        if !response.status().is_success() {
            warn!(status = %response.status(), "github token endpoint returned error status");
            return Err(AppError::Upstream("failed to exchange code for token".into()));
        }

        let body: GithubTokenResponse = response.json().await.map_err(|e| {
            warn!(error = %e, "github token response unreadable");
            AppError::Upstream("invalid token response from provider".into())
        })?;

        match (body.access_token, body.error) {
            (Some(token), None) if !token.is_empty() => Ok(token),
            (_, error) => {
                warn!(
                    error = ?error,
                    description = ?body.error_description,
                    "github rejected authorization code"
                );
                Err(AppError::Upstream("failed to exchange code for token".into()))
            }
        }
    }

    #[instrument(skip(self, access_token))]
    async fn fetch_profile(&self, access_token: &str) -> AppResult<ExternalProfile> {
        let response = self
            .client
            .get(GITHUB_PROFILE_URL)
            .bearer_auth(access_token)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, "github profile request failed");
                AppError::Upstream("failed to fetch user details".into())
            })?;

        if !response.status().is_success() {
            warn!(status = %response.status(), "github profile endpoint returned error status");
            return Err(AppError::Upstream("failed to fetch user details".into()));
        }

        let user: GithubUser = response.json().await.map_err(|e| {
            warn!(error = %e, "github profile unreadable");
            AppError::Upstream("invalid profile from provider".into())
        })?;
        Ok(user.into())
    }
}

/// Callback path: exchange, fetch, then find-or-create.
#[instrument(skip(provider, users, code), fields(provider = provider.name()))]
pub async fn complete_login(
    provider: &dyn IdentityProvider,
    users: &UserService,
    code: &str,
) -> AppResult<User> {
    if code.trim().is_empty() {
        return Err(AppError::Validation("missing authorization code".into()));
    }
    let access_token = provider.exchange_code(code).await?;
    let profile = provider.fetch_profile(&access_token).await?;
    let user = users.find_or_create_external(profile).await?;
    info!(user_id = %user.id, "external login completed");
    Ok(user)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Provider double that counts calls and can fail at either step.
    pub struct FakeProvider {
        pub profile: ExternalProfile,
        pub fail_exchange: bool,
        pub fail_profile: bool,
    }

    impl FakeProvider {
        pub fn github(id: &str, name: Option<&str>) -> Self {
            Self {
                profile: ExternalProfile {
                    provider: GITHUB_PROVIDER.into(),
                    provider_user_id: id.into(),
                    display_name: name.map(Into::into),
                    login: "octocat".into(),
                    email: format!("{id}+octocat@users.noreply.github.com"),
                    avatar_url: "https://avatars.example/octocat.png".into(),
                    bio: String::new(),
                },
                fail_exchange: false,
                fail_profile: false,
            }
        }
    }

    #[async_trait]
    impl IdentityProvider for FakeProvider {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn authorize_url(&self, state: &str) -> AppResult<String> {
            Ok(format!("https://provider.example/authorize?state={state}"))
        }

        async fn exchange_code(&self, _code: &str) -> AppResult<String> {
            if self.fail_exchange {
                return Err(AppError::Upstream("exchange failed".into()));
            }
            Ok("provider-token".into())
        }

        async fn fetch_profile(&self, _access_token: &str) -> AppResult<ExternalProfile> {
            if self.fail_profile {
                return Err(AppError::Upstream("profile failed".into()));
            }
            Ok(self.profile.clone())
        }
    }
}
