//! Storage port for users and the backends that implement it.
//!
//! Every backend enforces email and external-identity uniqueness itself, so
//! concurrent creates race safely without locks in the service layer.

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::users::model::User;

pub mod dynamo;
pub mod memory;
pub mod postgres;

pub use dynamo::DynamoUserRepository;
pub use memory::InMemoryUserRepository;
pub use postgres::PgUserRepository;

/// Which uniqueness constraint a create or update violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConflictKind {
    #[error("email already registered")]
    Email,
    #[error("external identity already linked")]
    ExternalIdentity,
    #[error("user id already exists")]
    Id,
}

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("user not found")]
    NotFound,
    #[error("{0}")]
    Conflict(ConflictKind),
    #[error("storage backend error")]
    Backend(#[source] anyhow::Error),
}

pub type RepoResult<T> = Result<T, RepoError>;

/// Backend-agnostic user persistence.
///
/// Emails reach the port already normalised (trimmed, lower-cased).
/// `delete` of a missing id succeeds; the service checks existence first
/// when it needs to report `NotFound`.
#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn create(&self, user: User) -> RepoResult<User>;
    async fn find_by_id(&self, id: Uuid) -> RepoResult<User>;
    async fn find_by_email(&self, email: &str) -> RepoResult<User>;
    async fn find_by_external_identity(
        &self,
        provider: &str,
        provider_user_id: &str,
    ) -> RepoResult<User>;
    async fn list(&self) -> RepoResult<Vec<User>>;
    /// Replaces every mutable column of the row keyed by `user.id`.
    async fn update(&self, user: User) -> RepoResult<User>;
    async fn delete(&self, id: Uuid) -> RepoResult<()>;
    async fn delete_all(&self) -> RepoResult<()>;
}
