use anyhow::Context;
use async_trait::async_trait;
use sqlx::{FromRow, PgPool};
use time::OffsetDateTime;
use tracing::warn;
use uuid::Uuid;

use super::{ConflictKind, RepoError, RepoResult, UserRepository};
use crate::users::model::{ExternalIdentity, User};

const USER_COLUMNS: &str = "id, firstname, lastname, email, password_hash, external_provider, \
     external_id, handle, about, profile_image, following, followers, created_at, updated_at";

/// Row shape of the `users` table.
#[derive(Debug, FromRow)]
struct UserRow {
    id: Uuid,
    firstname: String,
    lastname: String,
    email: String,
    password_hash: Option<String>,
    external_provider: Option<String>,
    external_id: Option<String>,
    handle: String,
    about: String,
    profile_image: String,
    following: i32,
    followers: i32,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl From<UserRow> for User {
    fn from(r: UserRow) -> Self {
        let external_identity = match (r.external_provider, r.external_id) {
            (Some(provider), Some(provider_user_id)) => Some(ExternalIdentity {
                provider,
                provider_user_id,
            }),
            _ => None,
        };
        Self {
            id: r.id,
            firstname: r.firstname,
            lastname: r.lastname,
            email: r.email,
            password_hash: r.password_hash,
            external_identity,
            handle: r.handle,
            about: r.about,
            profile_image: r.profile_image,
            following: r.following,
            followers: r.followers,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

/// Relational backend over a shared connection pool.
#[derive(Clone)]
pub struct PgUserRepository {
    db: PgPool,
}

impl PgUserRepository {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

/// Translates driver errors, keeping only what the service may act on.
fn map_sqlx(e: sqlx::Error, what: &'static str) -> RepoError {
    match e {
        sqlx::Error::RowNotFound => RepoError::NotFound,
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            let kind = match db.constraint() {
                Some("users_email_lower_key") => ConflictKind::Email,
                Some("users_external_identity_key") => ConflictKind::ExternalIdentity,
                Some("users_pkey") => ConflictKind::Id,
                other => {
                    warn!(constraint = ?other, "unexpected unique violation");
                    ConflictKind::Email
                }
            };
            RepoError::Conflict(kind)
        }
        other => RepoError::Backend(anyhow::Error::new(other).context(what)),
    }
}

fn split_identity(user: &User) -> (Option<&str>, Option<&str>) {
    match &user.external_identity {
        Some(e) => (Some(e.provider.as_str()), Some(e.provider_user_id.as_str())),
        None => (None, None),
    }
}

#[async_trait]
impl UserRepository for PgUserRepository {
    async fn create(&self, user: User) -> RepoResult<User> {
        let (provider, external_id) = split_identity(&user);
        let sql = format!(
            r#"
            INSERT INTO users (id, firstname, lastname, email, password_hash, external_provider,
                               external_id, handle, about, profile_image, following, followers,
                               created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            RETURNING {USER_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, UserRow>(&sql)
            .bind(user.id)
            .bind(&user.firstname)
            .bind(&user.lastname)
            .bind(&user.email)
            .bind(&user.password_hash)
            .bind(provider)
            .bind(external_id)
            .bind(&user.handle)
            .bind(&user.about)
            .bind(&user.profile_image)
            .bind(user.following)
            .bind(user.followers)
            .bind(user.created_at)
            .bind(user.updated_at)
            .fetch_one(&self.db)
            .await
            .map_err(|e| map_sqlx(e, "insert user"))?;
        Ok(row.into())
    }

    async fn find_by_id(&self, id: Uuid) -> RepoResult<User> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
        let row = sqlx::query_as::<_, UserRow>(&sql)
            .bind(id)
            .fetch_optional(&self.db)
            .await
            .map_err(|e| map_sqlx(e, "select user by id"))?;
        row.map(User::from).ok_or(RepoError::NotFound)
    }

    async fn find_by_email(&self, email: &str) -> RepoResult<User> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE lower(email) = lower($1)");
        let row = sqlx::query_as::<_, UserRow>(&sql)
            .bind(email)
            .fetch_optional(&self.db)
            .await
            .map_err(|e| map_sqlx(e, "select user by email"))?;
        row.map(User::from).ok_or(RepoError::NotFound)
    }

    async fn find_by_external_identity(
        &self,
        provider: &str,
        provider_user_id: &str,
    ) -> RepoResult<User> {
        let sql = format!(
            "SELECT {USER_COLUMNS} FROM users WHERE external_provider = $1 AND external_id = $2"
        );
        let row = sqlx::query_as::<_, UserRow>(&sql)
            .bind(provider)
            .bind(provider_user_id)
            .fetch_optional(&self.db)
            .await
            .map_err(|e| map_sqlx(e, "select user by external identity"))?;
        row.map(User::from).ok_or(RepoError::NotFound)
    }

    async fn list(&self) -> RepoResult<Vec<User>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users ORDER BY created_at ASC");
        let rows = sqlx::query_as::<_, UserRow>(&sql)
            .fetch_all(&self.db)
            .await
            .map_err(|e| map_sqlx(e, "list users"))?;
        Ok(rows.into_iter().map(User::from).collect())
    }

    async fn update(&self, user: User) -> RepoResult<User> {
        let (provider, external_id) = split_identity(&user);
        // id and email are never written here.
        let sql = format!(
            r#"
            UPDATE users
               SET firstname = $2,
                   lastname = $3,
                   password_hash = $4,
                   external_provider = $5,
                   external_id = $6,
                   handle = $7,
                   about = $8,
                   profile_image = $9,
                   following = $10,
                   followers = $11,
                   updated_at = now()
             WHERE id = $1
            RETURNING {USER_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, UserRow>(&sql)
            .bind(user.id)
            .bind(&user.firstname)
            .bind(&user.lastname)
            .bind(&user.password_hash)
            .bind(provider)
            .bind(external_id)
            .bind(&user.handle)
            .bind(&user.about)
            .bind(&user.profile_image)
            .bind(user.following)
            .bind(user.followers)
            .fetch_optional(&self.db)
            .await
            .map_err(|e| map_sqlx(e, "update user"))?;
        row.map(User::from).ok_or(RepoError::NotFound)
    }

    async fn delete(&self, id: Uuid) -> RepoResult<()> {
        sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(id)
            .execute(&self.db)
            .await
            .map_err(|e| map_sqlx(e, "delete user"))?;
        Ok(())
    }

    async fn delete_all(&self) -> RepoResult<()> {
        let mut tx = self
            .db
            .begin()
            .await
            .context("begin tx")
            .map_err(RepoError::Backend)?;
        sqlx::query("DELETE FROM users")
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx(e, "delete all users"))?;
        tx.commit()
            .await
            .context("commit tx")
            .map_err(RepoError::Backend)?;
        Ok(())
    }
}
