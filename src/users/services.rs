use std::sync::Arc;

use lazy_static::lazy_static;
use regex::Regex;
use time::OffsetDateTime;
use tokio::sync::OnceCell;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::auth::{
    jwt::{IssuedToken, JwtKeys},
    oauth::ExternalProfile,
    password,
};
use crate::error::{AppError, AppResult};
use crate::users::{
    dto::CreateUserRequest,
    model::{default_handle, User, UserPatch},
    repo::{RepoError, UserRepository},
};

lazy_static! {
    static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
}

pub(crate) fn is_valid_email(email: &str) -> bool {
    EMAIL_RE.is_match(email)
}

pub(crate) fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// A successful login: the user and the token issued for them.
#[derive(Debug)]
pub struct Session {
    pub user: User,
    pub token: IssuedToken,
}

/// Orchestrates credentials, tokens and storage for user identities.
pub struct UserService {
    repo: Arc<dyn UserRepository>,
    keys: JwtKeys,
    service_name: String,
    // Verified against when the email is unknown so both login failures cost the same.
    dummy_hash: OnceCell<Option<String>>,
}

async fn hash_blocking(plain: String) -> AppResult<String> {
    tokio::task::spawn_blocking(move || password::hash_password(&plain))
        .await
        .map_err(AppError::internal)?
        .map_err(|e| {
            error!(error = %e, "hash_password failed");
            AppError::Internal(e)
        })
}

async fn verify_blocking(hash: String, plain: String) -> AppResult<bool> {
    tokio::task::spawn_blocking(move || password::verify_password(&hash, &plain))
        .await
        .map_err(AppError::internal)
}

impl UserService {
    pub fn new(repo: Arc<dyn UserRepository>, keys: JwtKeys, service_name: impl Into<String>) -> Self {
        Self {
            repo,
            keys,
            service_name: service_name.into(),
            dummy_hash: OnceCell::new(),
        }
    }

    async fn dummy_hash(&self) -> Option<String> {
        self.dummy_hash
            .get_or_init(|| async {
                hash_blocking("dummy-password".to_string()).await.ok()
            })
            .await
            .clone()
    }

    #[instrument(skip(self, input), fields(email = %input.email))]
    pub async fn signup(&self, input: CreateUserRequest) -> AppResult<User> {
        let email = normalize_email(&input.email);
        let firstname = input.firstname.trim().to_string();

        if firstname.is_empty() {
            return Err(AppError::Validation("firstname is required".into()));
        }
        if !is_valid_email(&email) {
            warn!(email = %email, "invalid email");
            return Err(AppError::Validation("invalid email".into()));
        }
        if input.password.is_empty() {
            return Err(AppError::Validation("password is required".into()));
        }

        let handle = match input.handle.map(|h| h.trim().to_string()) {
            Some(h) if !h.is_empty() => h,
            _ => default_handle(&firstname, &self.service_name),
        };
        let password_hash = hash_blocking(input.password).await?;

        let now = OffsetDateTime::now_utc();
        let user = User {
            id: Uuid::new_v4(),
            firstname,
            lastname: input.lastname.trim().to_string(),
            email,
            password_hash: Some(password_hash),
            external_identity: None,
            handle,
            about: input.about,
            profile_image: input.profile_image,
            following: 0,
            followers: 0,
            created_at: now,
            updated_at: now,
        };

        let user = self.repo.create(user).await.map_err(|e| {
            if matches!(e, RepoError::Conflict(_)) {
                warn!("email already registered");
            }
            AppError::from(e)
        })?;
        info!(user_id = %user.id, "user registered");
        Ok(user)
    }

    /// Any failure to match email and password yields the same error.
    #[instrument(skip(self, password))]
    pub async fn login(&self, email: &str, password: &str) -> AppResult<Session> {
        let email = normalize_email(email);
        if email.is_empty() || password.is_empty() {
            return Err(AppError::Validation("email and password are required".into()));
        }

        let user = match self.repo.find_by_email(&email).await {
            Ok(u) => Some(u),
            Err(RepoError::NotFound) => None,
            Err(e) => return Err(e.into()),
        };

        let stored = match user.as_ref().and_then(|u| u.password_hash.clone()) {
            Some(hash) => Some(hash),
            None => self.dummy_hash().await,
        };
        let ok = match stored {
            Some(hash) => verify_blocking(hash, password.to_string()).await?,
            None => false,
        };

        let user = match user {
            Some(u) if ok && u.password_hash.is_some() => u,
            _ => {
                warn!(email = %email, "login rejected");
                return Err(AppError::invalid_credentials());
            }
        };

        let token = self.issue_token(&user)?;
        info!(user_id = %user.id, "user logged in");
        Ok(Session { user, token })
    }

    pub fn issue_token(&self, user: &User) -> AppResult<IssuedToken> {
        self.keys.sign(user.id).map_err(|e| {
            error!(error = %e, "jwt sign failed");
            AppError::Internal(e)
        })
    }

    /// Resolves a bearer token to the user id it was issued for.
    pub fn authorize(&self, token: &str) -> AppResult<Uuid> {
        self.keys
            .verify(token)
            .map(|claims| claims.sub)
            .map_err(|_| AppError::unauthorized())
    }

    #[instrument(skip(self))]
    pub async fn get(&self, id: Uuid) -> AppResult<User> {
        Ok(self.repo.find_by_id(id).await?)
    }

    #[instrument(skip(self))]
    pub async fn get_by_email(&self, email: &str) -> AppResult<User> {
        Ok(self.repo.find_by_email(&normalize_email(email)).await?)
    }

    #[instrument(skip(self))]
    pub async fn list(&self) -> AppResult<Vec<User>> {
        Ok(self.repo.list().await?)
    }

    #[instrument(skip(self, patch))]
    pub async fn update_profile(&self, id: Uuid, mut patch: UserPatch) -> AppResult<User> {
        let mut user = self.repo.find_by_id(id).await?;

        if let Some(email) = &patch.email {
            if normalize_email(email) != user.email {
                return Err(AppError::Validation("email cannot be changed".into()));
            }
        }
        patch.firstname = patch.firstname.map(|f| f.trim().to_string());
        patch.lastname = patch.lastname.map(|l| l.trim().to_string());
        if patch.firstname.as_deref().is_some_and(str::is_empty) {
            return Err(AppError::Validation("firstname must not be empty".into()));
        }
        patch.handle = match patch.handle.map(|h| h.trim().to_string()) {
            Some(h) if h.is_empty() => {
                let firstname = patch.firstname.as_deref().unwrap_or(&user.firstname);
                Some(default_handle(firstname, &self.service_name))
            }
            other => other,
        };

        patch.apply(&mut user);
        let user = self.repo.update(user).await?;
        info!(user_id = %user.id, "user updated");
        Ok(user)
    }

    /// Only the account owner may change its password. Users created through
    /// an identity provider may set a first password without `current`.
    #[instrument(skip(self, current, new_password))]
    pub async fn change_password(
        &self,
        caller: Uuid,
        id: Uuid,
        current: Option<&str>,
        new_password: &str,
    ) -> AppResult<()> {
        if caller != id {
            warn!(%caller, user_id = %id, "password change for another user rejected");
            return Err(AppError::Auth("cannot change another user's password".into()));
        }
        if new_password.is_empty() {
            return Err(AppError::Validation("new password is required".into()));
        }
        let mut user = self.repo.find_by_id(id).await?;

        if let Some(hash) = user.password_hash.clone() {
            let current = current.unwrap_or_default().to_string();
            if !verify_blocking(hash, current).await? {
                warn!(user_id = %id, "password change with wrong current password");
                return Err(AppError::invalid_credentials());
            }
        }

        user.password_hash = Some(hash_blocking(new_password.to_string()).await?);
        self.repo.update(user).await?;
        info!(user_id = %id, "password changed");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, id: Uuid) -> AppResult<()> {
        self.repo.find_by_id(id).await?;
        self.repo.delete(id).await?;
        info!(user_id = %id, "user deleted");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn delete_all(&self) -> AppResult<()> {
        self.repo.delete_all().await?;
        warn!("all users deleted");
        Ok(())
    }

    /// Returns the user linked to the external identity, creating it on first
    /// sight. When a concurrent first login wins the create, its record is
    /// returned; any other conflict is reported.
    #[instrument(skip(self, profile), fields(provider = %profile.provider))]
    pub async fn find_or_create_external(&self, profile: ExternalProfile) -> AppResult<User> {
        let provider = profile.provider.clone();
        let provider_user_id = profile.provider_user_id.clone();

        match self
            .repo
            .find_by_external_identity(&provider, &provider_user_id)
            .await
        {
            Ok(user) => return Ok(user),
            Err(RepoError::NotFound) => {}
            Err(e) => return Err(e.into()),
        }

        let user = profile.into_user(&self.service_name);
        match self.repo.create(user).await {
            Ok(user) => {
                info!(user_id = %user.id, "user provisioned from external identity");
                Ok(user)
            }
            Err(RepoError::Conflict(kind)) => {
                match self
                    .repo
                    .find_by_external_identity(&provider, &provider_user_id)
                    .await
                {
                    Ok(user) => {
                        info!(user_id = %user.id, "external identity provisioned concurrently");
                        Ok(user)
                    }
                    Err(RepoError::NotFound) => Err(RepoError::Conflict(kind).into()),
                    Err(e) => Err(e.into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::jwt::TokenError;
    use crate::config::JwtConfig;
    use crate::users::repo::{InMemoryUserRepository, RepoResult};

    fn keys(secret: &str) -> JwtKeys {
        JwtKeys::new(&JwtConfig {
            secret: secret.into(),
            issuer: "notelify-users".into(),
            audience: "notelify".into(),
            ttl_minutes: 30,
        })
    }

    fn service() -> UserService {
        UserService::new(Arc::new(InMemoryUserRepository::new()), keys("test-secret"), "notelify")
    }

    fn ada() -> CreateUserRequest {
        CreateUserRequest {
            firstname: "Ada".into(),
            lastname: String::new(),
            email: "ada@example.com".into(),
            password: "hunter2".into(),
            handle: None,
            about: String::new(),
            profile_image: String::new(),
        }
    }

    #[tokio::test]
    async fn signup_then_login_scenario() {
        let svc = service();
        let user = svc.signup(ada()).await.unwrap();
        assert_eq!(user.handle, "Ada@notelify");
        assert!(!user.id.is_nil());
        let hash = user.password_hash.clone().unwrap();
        assert_ne!(hash, "hunter2");
        assert!(password::verify_password(&hash, "hunter2"));

        let session = svc.login("ada@example.com", "hunter2").await.unwrap();
        assert_eq!(session.user.id, user.id);
        assert_eq!(svc.authorize(&session.token.token).unwrap(), user.id);

        let err = svc.login("ada@example.com", "wrong").await.unwrap_err();
        assert!(matches!(err, AppError::Auth(_)));
    }

    #[tokio::test]
    async fn login_failures_are_indistinguishable() {
        let svc = service();
        svc.signup(ada()).await.unwrap();
        let wrong_password = svc.login("ada@example.com", "nope").await.unwrap_err();
        let unknown_email = svc.login("nobody@example.com", "hunter2").await.unwrap_err();
        assert_eq!(wrong_password.to_string(), unknown_email.to_string());
        assert!(matches!(unknown_email, AppError::Auth(_)));
    }

    #[tokio::test]
    async fn login_is_case_insensitive_on_email() {
        let svc = service();
        svc.signup(ada()).await.unwrap();
        assert!(svc.login("  ADA@Example.com ", "hunter2").await.is_ok());
    }

    #[tokio::test]
    async fn signup_keeps_supplied_handle() {
        let svc = service();
        let mut input = ada();
        input.handle = Some("countess".into());
        assert_eq!(svc.signup(input).await.unwrap().handle, "countess");
    }

    #[tokio::test]
    async fn signup_validates_input() {
        let svc = service();

        let mut no_name = ada();
        no_name.firstname = "  ".into();
        assert!(matches!(svc.signup(no_name).await, Err(AppError::Validation(_))));

        let mut bad_email = ada();
        bad_email.email = "not-an-email".into();
        assert!(matches!(svc.signup(bad_email).await, Err(AppError::Validation(_))));

        let mut no_password = ada();
        no_password.password = String::new();
        assert!(matches!(svc.signup(no_password).await, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn duplicate_email_conflicts_regardless_of_case() {
        let svc = service();
        svc.signup(ada()).await.unwrap();
        let mut again = ada();
        again.email = "Ada@Example.COM".into();
        assert!(matches!(svc.signup(again).await, Err(AppError::Conflict(_))));
    }

    #[tokio::test]
    async fn concurrent_signups_with_same_email_have_one_winner() {
        let svc = Arc::new(service());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let svc = svc.clone();
                tokio::spawn(async move { svc.signup(ada()).await })
            })
            .collect();

        let mut ok = 0;
        let mut conflicts = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(_) => ok += 1,
                Err(AppError::Conflict(_)) => conflicts += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(conflicts, 7);
    }

    #[tokio::test]
    async fn token_from_other_secret_is_unauthorized() {
        let svc = service();
        let user = svc.signup(ada()).await.unwrap();
        let forged = keys("other-secret").sign(user.id).unwrap();
        assert!(matches!(svc.authorize(&forged.token), Err(AppError::Auth(_))));
    }

    #[tokio::test]
    async fn login_token_expires_after_thirty_minutes() {
        let svc = service();
        let user = svc.signup(ada()).await.unwrap();
        let session = svc.login("ada@example.com", "hunter2").await.unwrap();
        let k = keys("test-secret");
        let claims = k.verify(&session.token.token).unwrap();
        assert_eq!(claims.sub, user.id);
        assert_eq!(claims.exp - claims.iat, 30 * 60);
        assert_eq!(
            k.verify_at(&session.token.token, session.token.expires_at).unwrap_err(),
            TokenError::Expired
        );
    }

    #[tokio::test]
    async fn delete_then_get_is_not_found() {
        let svc = service();
        let user = svc.signup(ada()).await.unwrap();
        svc.delete(user.id).await.unwrap();
        assert!(matches!(svc.get(user.id).await, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn mutating_missing_user_is_not_found() {
        let svc = service();
        let id = Uuid::new_v4();
        assert!(matches!(svc.delete(id).await, Err(AppError::NotFound(_))));
        assert!(matches!(
            svc.update_profile(id, UserPatch::default()).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn update_profile_rejects_email_change() {
        let svc = service();
        let user = svc.signup(ada()).await.unwrap();
        let patch = UserPatch {
            email: Some("new@example.com".into()),
            ..Default::default()
        };
        assert!(matches!(
            svc.update_profile(user.id, patch).await,
            Err(AppError::Validation(_))
        ));

        let same = UserPatch {
            email: Some("ADA@example.com".into()),
            about: Some("first programmer".into()),
            ..Default::default()
        };
        let updated = svc.update_profile(user.id, same).await.unwrap();
        assert_eq!(updated.about, "first programmer");
        assert_eq!(updated.id, user.id);
    }

    #[tokio::test]
    async fn change_password_requires_current_one() {
        let svc = service();
        let user = svc.signup(ada()).await.unwrap();
        assert!(matches!(
            svc.change_password(user.id, user.id, Some("wrong"), "correct horse").await,
            Err(AppError::Auth(_))
        ));
        svc.change_password(user.id, user.id, Some("hunter2"), "correct horse")
            .await
            .unwrap();
        assert!(svc.login("ada@example.com", "hunter2").await.is_err());
        assert!(svc.login("ada@example.com", "correct horse").await.is_ok());
    }

    #[tokio::test]
    async fn get_by_email_and_list() {
        let svc = service();
        let user = svc.signup(ada()).await.unwrap();
        assert_eq!(svc.get_by_email("ADA@example.com").await.unwrap().id, user.id);
        assert_eq!(svc.list().await.unwrap().len(), 1);
        svc.delete_all().await.unwrap();
        assert!(svc.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn oauth_only_user_cannot_password_login() {
        let svc = service();
        let profile = ExternalProfile {
            provider: "github".into(),
            provider_user_id: "77".into(),
            display_name: Some("Ada".into()),
            login: "ada".into(),
            email: "ada@example.com".into(),
            avatar_url: String::new(),
            bio: String::new(),
        };
        let user = svc.find_or_create_external(profile).await.unwrap();
        assert!(user.password_hash.is_none());
        assert!(matches!(
            svc.login("ada@example.com", "anything").await,
            Err(AppError::Auth(_))
        ));

        svc.change_password(user.id, user.id, None, "first-password").await.unwrap();
        assert!(svc.login("ada@example.com", "first-password").await.is_ok());
    }

    #[tokio::test]
    async fn external_email_clash_with_local_user_conflicts() {
        let svc = service();
        svc.signup(ada()).await.unwrap();
        let profile = ExternalProfile {
            provider: "github".into(),
            provider_user_id: "78".into(),
            display_name: None,
            login: "ada".into(),
            email: "ada@example.com".into(),
            avatar_url: String::new(),
            bio: String::new(),
        };
        assert!(matches!(
            svc.find_or_create_external(profile).await,
            Err(AppError::Conflict(_))
        ));
    }

    fn github_profile(id: &str, email: &str) -> ExternalProfile {
        ExternalProfile {
            provider: "github".into(),
            provider_user_id: id.into(),
            display_name: Some("Grace Hopper".into()),
            login: "grace".into(),
            email: email.into(),
            avatar_url: String::new(),
            bio: String::new(),
        }
    }

    /// Misses the first external-identity lookup, like a read that ran
    /// before a concurrent create committed.
    #[derive(Default)]
    struct StaleFirstLookup {
        inner: InMemoryUserRepository,
        missed: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl UserRepository for StaleFirstLookup {
        async fn create(&self, user: User) -> RepoResult<User> {
            self.inner.create(user).await
        }
        async fn find_by_id(&self, id: Uuid) -> RepoResult<User> {
            self.inner.find_by_id(id).await
        }
        async fn find_by_email(&self, email: &str) -> RepoResult<User> {
            self.inner.find_by_email(email).await
        }
        async fn find_by_external_identity(
            &self,
            provider: &str,
            provider_user_id: &str,
        ) -> RepoResult<User> {
            if !self.missed.swap(true, std::sync::atomic::Ordering::SeqCst) {
                return Err(RepoError::NotFound);
            }
            self.inner
                .find_by_external_identity(provider, provider_user_id)
                .await
        }
        async fn list(&self) -> RepoResult<Vec<User>> {
            self.inner.list().await
        }
        async fn update(&self, user: User) -> RepoResult<User> {
            self.inner.update(user).await
        }
        async fn delete(&self, id: Uuid) -> RepoResult<()> {
            self.inner.delete(id).await
        }
        async fn delete_all(&self) -> RepoResult<()> {
            self.inner.delete_all().await
        }
    }

    #[tokio::test]
    async fn losing_a_first_login_race_returns_the_winner() {
        let repo = Arc::new(StaleFirstLookup::default());
        let profile = github_profile("77", "77+grace@users.noreply.github.com");
        let winner = repo
            .inner
            .create(profile.clone().into_user("notelify"))
            .await
            .unwrap();

        let svc = UserService::new(repo.clone(), keys("test-secret"), "notelify");
        let user = svc.find_or_create_external(profile).await.unwrap();
        assert_eq!(user.id, winner.id);
        assert_eq!(svc.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_first_logins_share_one_user() {
        let svc = Arc::new(service());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let svc = svc.clone();
                tokio::spawn(async move {
                    svc.find_or_create_external(github_profile("88", "grace@example.com"))
                        .await
                })
            })
            .collect();

        let mut ids = Vec::new();
        for h in handles {
            ids.push(h.await.unwrap().unwrap().id);
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(svc.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cannot_set_password_on_someone_elses_account() {
        let svc = service();
        let victim = svc
            .find_or_create_external(github_profile("99", "victim@example.com"))
            .await
            .unwrap();
        let eve = svc.signup(ada()).await.unwrap();

        assert!(matches!(
            svc.change_password(eve.id, victim.id, None, "owned").await,
            Err(AppError::Auth(_))
        ));
        assert!(svc.get(victim.id).await.unwrap().password_hash.is_none());
        assert!(svc.login("victim@example.com", "owned").await.is_err());
    }

    #[tokio::test]
    async fn update_profile_trims_and_defaults_blank_handle() {
        let svc = service();
        let user = svc.signup(ada()).await.unwrap();
        let patch = UserPatch {
            firstname: Some("  Augusta ".into()),
            handle: Some("   ".into()),
            ..Default::default()
        };
        let updated = svc.update_profile(user.id, patch).await.unwrap();
        assert_eq!(updated.firstname, "Augusta");
        assert_eq!(updated.handle, "Augusta@notelify");

        let blank = UserPatch {
            firstname: Some("  ".into()),
            ..Default::default()
        };
        assert!(matches!(
            svc.update_profile(user.id, blank).await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn dummy_hash_is_built_once_off_the_runtime() {
        let svc = service();
        assert!(svc.dummy_hash.get().is_none());
        let first = svc.dummy_hash().await.unwrap();
        let second = svc.dummy_hash().await.unwrap();
        assert_eq!(first, second);
        assert!(password::verify_password(&first, "dummy-password"));
    }
}
