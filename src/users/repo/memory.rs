use std::collections::HashMap;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{ConflictKind, RepoError, RepoResult, UserRepository};
use crate::users::model::User;

#[derive(Default)]
struct Tables {
    users: HashMap<Uuid, User>,
    emails: HashMap<String, Uuid>,
    external: HashMap<(String, String), Uuid>,
}

/// Key-value backend held in process memory, keyed by user id.
///
/// Secondary indexes for email and external identity are updated under the
/// same write lock as the primary map.
#[derive(Default)]
pub struct InMemoryUserRepository {
    tables: RwLock<Tables>,
}

impl InMemoryUserRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

fn external_key(provider: &str, provider_user_id: &str) -> (String, String) {
    (provider.to_string(), provider_user_id.to_string())
}

#[async_trait]
impl UserRepository for InMemoryUserRepository {
    async fn create(&self, user: User) -> RepoResult<User> {
        if !user.has_credentials() {
            return Err(RepoError::Backend(anyhow::anyhow!("user has no login method")));
        }
        let mut t = self.tables.write().await;
        if t.users.contains_key(&user.id) {
            return Err(RepoError::Conflict(ConflictKind::Id));
        }
        if t.emails.contains_key(&user.email) {
            return Err(RepoError::Conflict(ConflictKind::Email));
        }
        let ext = user
            .external_identity
            .as_ref()
            .map(|e| external_key(&e.provider, &e.provider_user_id));
        if let Some(key) = &ext {
            if t.external.contains_key(key) {
                return Err(RepoError::Conflict(ConflictKind::ExternalIdentity));
            }
        }

        t.emails.insert(user.email.clone(), user.id);
        if let Some(key) = ext {
            t.external.insert(key, user.id);
        }
        t.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn find_by_id(&self, id: Uuid) -> RepoResult<User> {
        let t = self.tables.read().await;
        t.users.get(&id).cloned().ok_or(RepoError::NotFound)
    }

    async fn find_by_email(&self, email: &str) -> RepoResult<User> {
        let t = self.tables.read().await;
        t.emails
            .get(email)
            .and_then(|id| t.users.get(id))
            .cloned()
            .ok_or(RepoError::NotFound)
    }

    async fn find_by_external_identity(
        &self,
        provider: &str,
        provider_user_id: &str,
    ) -> RepoResult<User> {
        let t = self.tables.read().await;
        t.external
            .get(&external_key(provider, provider_user_id))
            .and_then(|id| t.users.get(id))
            .cloned()
            .ok_or(RepoError::NotFound)
    }

    async fn list(&self) -> RepoResult<Vec<User>> {
        let t = self.tables.read().await;
        let mut users: Vec<User> = t.users.values().cloned().collect();
        users.sort_by_key(|u| u.created_at);
        Ok(users)
    }

    async fn update(&self, mut user: User) -> RepoResult<User> {
        let mut t = self.tables.write().await;
        let Some(current) = t.users.get(&user.id).cloned() else {
            return Err(RepoError::NotFound);
        };

        let old_ext = current
            .external_identity
            .as_ref()
            .map(|e| external_key(&e.provider, &e.provider_user_id));
        let new_ext = user
            .external_identity
            .as_ref()
            .map(|e| external_key(&e.provider, &e.provider_user_id));
        if let Some(key) = &new_ext {
            if t.external.get(key).is_some_and(|owner| *owner != user.id) {
                return Err(RepoError::Conflict(ConflictKind::ExternalIdentity));
            }
        }
        if old_ext != new_ext {
            if let Some(key) = old_ext {
                t.external.remove(&key);
            }
            if let Some(key) = new_ext {
                t.external.insert(key, user.id);
            }
        }

        user.email = current.email;
        user.created_at = current.created_at;
        user.updated_at = OffsetDateTime::now_utc();
        t.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn delete(&self, id: Uuid) -> RepoResult<()> {
        let mut t = self.tables.write().await;
        if let Some(user) = t.users.remove(&id) {
            t.emails.remove(&user.email);
            if let Some(e) = user.external_identity {
                t.external.remove(&external_key(&e.provider, &e.provider_user_id));
            }
        }
        Ok(())
    }

    async fn delete_all(&self) -> RepoResult<()> {
        let mut t = self.tables.write().await;
        *t = Tables::default();
        Ok(())
    }
}
