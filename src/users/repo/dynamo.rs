use std::collections::HashMap;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use aws_config::{defaults, BehaviorVersion};
use aws_credential_types::Credentials;
use aws_sdk_dynamodb::{
    config::Region,
    operation::transact_write_items::TransactWriteItemsError,
    types::{AttributeValue, Delete, Put, TransactWriteItem},
    Client,
};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tracing::debug;
use uuid::Uuid;

use super::{ConflictKind, RepoError, RepoResult, UserRepository};
use crate::config::DynamoConfig;
use crate::users::model::{ExternalIdentity, User};

type Item = HashMap<String, AttributeValue>;

const PK: &str = "pk";
const USER_PREFIX: &str = "USER#";
const EMAIL_PREFIX: &str = "EMAIL#";
const EXT_PREFIX: &str = "EXT#";

fn user_key(id: Uuid) -> String {
    format!("{USER_PREFIX}{id}")
}

fn email_key(email: &str) -> String {
    format!("{EMAIL_PREFIX}{email}")
}

fn ext_key(provider: &str, provider_user_id: &str) -> String {
    format!("{EXT_PREFIX}{provider}#{provider_user_id}")
}

/// Key-value backend on a single DynamoDB table keyed by `pk`.
///
/// Besides the `USER#{id}` record, each user owns guard items
/// `EMAIL#{email}` and `EXT#{provider}#{id}` that are written in the same
/// transaction under `attribute_not_exists(pk)`, which makes the table itself
/// reject duplicate emails and identities.
#[derive(Clone)]
pub struct DynamoUserRepository {
    client: Client,
    table: String,
}

impl DynamoUserRepository {
    pub async fn new(cfg: &DynamoConfig) -> anyhow::Result<Self> {
        let mut loader = defaults(BehaviorVersion::latest()).region(Region::new(cfg.region.clone()));
        if let (Some(key), Some(secret)) = (&cfg.access_key_id, &cfg.secret_access_key) {
            loader = loader.credentials_provider(Credentials::new(
                key, secret, None, None, "static",
            ));
        }
        if let Some(endpoint) = &cfg.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let shared = loader.load().await;

        Ok(Self {
            client: Client::new(&shared),
            table: cfg.table.clone(),
        })
    }

    fn guard_put(&self, pk: String, id: Uuid) -> anyhow::Result<TransactWriteItem> {
        let put = Put::builder()
            .table_name(&self.table)
            .item(PK, AttributeValue::S(pk))
            .item("user_id", AttributeValue::S(id.to_string()))
            .condition_expression("attribute_not_exists(pk)")
            .build()
            .context("build guard put")?;
        Ok(TransactWriteItem::builder().put(put).build())
    }

    fn delete_of(&self, pk: String) -> anyhow::Result<TransactWriteItem> {
        let delete = Delete::builder()
            .table_name(&self.table)
            .key(PK, AttributeValue::S(pk))
            .build()
            .context("build delete")?;
        Ok(TransactWriteItem::builder().delete(delete).build())
    }

    async fn get(&self, pk: String) -> RepoResult<Option<Item>> {
        let out = self
            .client
            .get_item()
            .table_name(&self.table)
            .key(PK, AttributeValue::S(pk))
            .consistent_read(true)
            .send()
            .await
            .context("dynamodb get_item")
            .map_err(RepoError::Backend)?;
        Ok(out.item().cloned())
    }

    /// Follows a guard item to the user record it points at.
    async fn get_via_guard(&self, pk: String) -> RepoResult<User> {
        let guard = self.get(pk).await?.ok_or(RepoError::NotFound)?;
        let id = guard
            .get("user_id")
            .and_then(|v| v.as_s().ok())
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| RepoError::Backend(anyhow!("guard item without user_id")))?;
        self.find_by_id(id).await
    }

    /// Runs a transaction; a cancellation blamed on one of `items` goes
    /// through `conflict`.
    async fn transact(
        &self,
        items: Vec<TransactWriteItem>,
        conflict: impl Fn(Cancellation) -> RepoError,
    ) -> RepoResult<()> {
        let result = self
            .client
            .transact_write_items()
            .set_transact_items(Some(items))
            .send()
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) => match e.into_service_error() {
                TransactWriteItemsError::TransactionCanceledException(cancel) => {
                    let reason = classify_cancellation(
                        cancel.cancellation_reasons().iter().map(|r| r.code()),
                    );
                    match reason {
                        Some(reason) => Err(conflict(reason)),
                        None => Err(RepoError::Backend(anyhow!(cancel))),
                    }
                }
                other => Err(RepoError::Backend(
                    anyhow::Error::new(other).context("dynamodb transact_write_items"),
                )),
            },
        }
    }

    async fn scan_keys(&self) -> RepoResult<Vec<Item>> {
        let mut items = Vec::new();
        let mut start: Option<Item> = None;
        loop {
            let out = self
                .client
                .scan()
                .table_name(&self.table)
                .set_exclusive_start_key(start.take())
                .send()
                .await
                .context("dynamodb scan")
                .map_err(RepoError::Backend)?;
            items.extend(out.items().iter().cloned());
            match out.last_evaluated_key() {
                Some(key) if !key.is_empty() => start = Some(key.clone()),
                _ => break,
            }
        }
        Ok(items)
    }
}

fn user_to_item(user: &User) -> Item {
    let mut item = Item::new();
    item.insert(PK.into(), AttributeValue::S(user_key(user.id)));
    item.insert("id".into(), AttributeValue::S(user.id.to_string()));
    item.insert("firstname".into(), AttributeValue::S(user.firstname.clone()));
    item.insert("lastname".into(), AttributeValue::S(user.lastname.clone()));
    item.insert("email".into(), AttributeValue::S(user.email.clone()));
    if let Some(hash) = &user.password_hash {
        item.insert("password_hash".into(), AttributeValue::S(hash.clone()));
    }
    if let Some(ext) = &user.external_identity {
        item.insert("external_provider".into(), AttributeValue::S(ext.provider.clone()));
        item.insert("external_id".into(), AttributeValue::S(ext.provider_user_id.clone()));
    }
    item.insert("handle".into(), AttributeValue::S(user.handle.clone()));
    item.insert("about".into(), AttributeValue::S(user.about.clone()));
    item.insert("profile_image".into(), AttributeValue::S(user.profile_image.clone()));
    item.insert("following".into(), AttributeValue::N(user.following.to_string()));
    item.insert("followers".into(), AttributeValue::N(user.followers.to_string()));
    // Rfc3339 formatting of a UTC timestamp cannot fail.
    let fmt = |t: OffsetDateTime| t.format(&Rfc3339).unwrap_or_default();
    item.insert("created_at".into(), AttributeValue::S(fmt(user.created_at)));
    item.insert("updated_at".into(), AttributeValue::S(fmt(user.updated_at)));
    item
}

fn item_to_user(item: &Item) -> anyhow::Result<User> {
    let s = |k: &str| -> anyhow::Result<String> {
        item.get(k)
            .and_then(|v| v.as_s().ok())
            .cloned()
            .ok_or_else(|| anyhow!("missing string attribute {k}"))
    };
    let opt = |k: &str| item.get(k).and_then(|v| v.as_s().ok()).cloned();
    let n = |k: &str| -> anyhow::Result<i32> {
        item.get(k)
            .and_then(|v| v.as_n().ok())
            .ok_or_else(|| anyhow!("missing number attribute {k}"))?
            .parse::<i32>()
            .with_context(|| format!("parse {k}"))
    };
    let ts = |k: &str| -> anyhow::Result<OffsetDateTime> {
        OffsetDateTime::parse(&s(k)?, &Rfc3339).with_context(|| format!("parse {k}"))
    };

    let external_identity = match (opt("external_provider"), opt("external_id")) {
        (Some(provider), Some(provider_user_id)) => Some(ExternalIdentity {
            provider,
            provider_user_id,
        }),
        _ => None,
    };

    Ok(User {
        id: Uuid::parse_str(&s("id")?).context("parse id")?,
        firstname: s("firstname")?,
        lastname: s("lastname")?,
        email: s("email")?,
        password_hash: opt("password_hash"),
        external_identity,
        handle: s("handle")?,
        about: s("about")?,
        profile_image: s("profile_image")?,
        following: n("following")?,
        followers: n("followers")?,
        created_at: ts("created_at")?,
        updated_at: ts("updated_at")?,
    })
}

/// Why a transaction was cancelled, with the index of the item blamed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cancellation {
    /// The item's condition expression failed.
    Condition(usize),
    /// Another in-flight transaction was writing the same key.
    Contention(usize),
}

/// Picks the reason to report from per-item cancellation codes. A failed
/// condition wins over contention; other codes are not ours to map.
fn classify_cancellation<'a>(
    codes: impl IntoIterator<Item = Option<&'a str>>,
) -> Option<Cancellation> {
    let mut contention = None;
    for (idx, code) in codes.into_iter().enumerate() {
        match code {
            Some("ConditionalCheckFailed") => return Some(Cancellation::Condition(idx)),
            Some("TransactionConflict") if contention.is_none() => {
                contention = Some(Cancellation::Contention(idx))
            }
            _ => {}
        }
    }
    contention
}

/// Maps a cancelled create onto the uniqueness constraint of the blamed item.
fn create_conflict(reason: Cancellation) -> RepoError {
    let (Cancellation::Condition(idx) | Cancellation::Contention(idx)) = reason;
    match idx {
        0 => RepoError::Conflict(ConflictKind::Id),
        1 => RepoError::Conflict(ConflictKind::Email),
        _ => RepoError::Conflict(ConflictKind::ExternalIdentity),
    }
}

fn update_conflict(reason: Cancellation) -> RepoError {
    match reason {
        Cancellation::Condition(0) => RepoError::NotFound,
        Cancellation::Contention(0) => {
            RepoError::Backend(anyhow!("user record is being written concurrently"))
        }
        _ => RepoError::Conflict(ConflictKind::ExternalIdentity),
    }
}

fn delete_conflict(reason: Cancellation) -> RepoError {
    match reason {
        Cancellation::Condition(_) => RepoError::NotFound,
        Cancellation::Contention(_) => {
            RepoError::Backend(anyhow!("user is being written concurrently"))
        }
    }
}

#[async_trait]
impl UserRepository for DynamoUserRepository {
    async fn create(&self, user: User) -> RepoResult<User> {
        if !user.has_credentials() {
            return Err(RepoError::Backend(anyhow!("user has no login method")));
        }
        let record = Put::builder()
            .table_name(&self.table)
            .set_item(Some(user_to_item(&user)))
            .condition_expression("attribute_not_exists(pk)")
            .build()
            .context("build user put")
            .map_err(RepoError::Backend)?;

        let mut items = vec![
            TransactWriteItem::builder().put(record).build(),
            self.guard_put(email_key(&user.email), user.id)
                .map_err(RepoError::Backend)?,
        ];
        if let Some(ext) = &user.external_identity {
            items.push(
                self.guard_put(ext_key(&ext.provider, &ext.provider_user_id), user.id)
                    .map_err(RepoError::Backend)?,
            );
        }

        self.transact(items, create_conflict).await?;
        debug!(user_id = %user.id, "dynamodb user created");
        Ok(user)
    }

    async fn find_by_id(&self, id: Uuid) -> RepoResult<User> {
        let item = self.get(user_key(id)).await?.ok_or(RepoError::NotFound)?;
        item_to_user(&item).map_err(RepoError::Backend)
    }

    async fn find_by_email(&self, email: &str) -> RepoResult<User> {
        self.get_via_guard(email_key(email)).await
    }

    async fn find_by_external_identity(
        &self,
        provider: &str,
        provider_user_id: &str,
    ) -> RepoResult<User> {
        self.get_via_guard(ext_key(provider, provider_user_id)).await
    }

    async fn list(&self) -> RepoResult<Vec<User>> {
        let mut users = self
            .scan_keys()
            .await?
            .iter()
            .filter(|item| {
                item.get(PK)
                    .and_then(|v| v.as_s().ok())
                    .is_some_and(|pk| pk.starts_with(USER_PREFIX))
            })
            .map(item_to_user)
            .collect::<anyhow::Result<Vec<_>>>()
            .map_err(RepoError::Backend)?;
        users.sort_by_key(|u| u.created_at);
        Ok(users)
    }

    async fn update(&self, mut user: User) -> RepoResult<User> {
        let current = self.find_by_id(user.id).await?;
        user.email = current.email.clone();
        user.created_at = current.created_at;
        user.updated_at = OffsetDateTime::now_utc();

        let record = Put::builder()
            .table_name(&self.table)
            .set_item(Some(user_to_item(&user)))
            .condition_expression("attribute_exists(pk)")
            .build()
            .context("build user put")
            .map_err(RepoError::Backend)?;
        let mut items = vec![TransactWriteItem::builder().put(record).build()];

        if current.external_identity != user.external_identity {
            if let Some(old) = &current.external_identity {
                items.push(
                    self.delete_of(ext_key(&old.provider, &old.provider_user_id))
                        .map_err(RepoError::Backend)?,
                );
            }
            if let Some(new) = &user.external_identity {
                items.push(
                    self.guard_put(ext_key(&new.provider, &new.provider_user_id), user.id)
                        .map_err(RepoError::Backend)?,
                );
            }
        }

        self.transact(items, update_conflict).await?;
        Ok(user)
    }

    async fn delete(&self, id: Uuid) -> RepoResult<()> {
        let user = match self.find_by_id(id).await {
            Ok(u) => u,
            Err(RepoError::NotFound) => return Ok(()),
            Err(e) => return Err(e),
        };
        let mut items = vec![
            self.delete_of(user_key(id)).map_err(RepoError::Backend)?,
            self.delete_of(email_key(&user.email))
                .map_err(RepoError::Backend)?,
        ];
        if let Some(ext) = &user.external_identity {
            items.push(
                self.delete_of(ext_key(&ext.provider, &ext.provider_user_id))
                    .map_err(RepoError::Backend)?,
            );
        }
        self.transact(items, delete_conflict).await
    }

    async fn delete_all(&self) -> RepoResult<()> {
        for item in self.scan_keys().await? {
            let Some(pk) = item.get(PK).cloned() else {
                continue;
            };
            self.client
                .delete_item()
                .table_name(&self.table)
                .key(PK, pk)
                .send()
                .await
                .context("dynamodb delete_item")
                .map_err(RepoError::Backend)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::users::model::sample_user;

    #[test]
    fn item_encoding_preserves_user() {
        let mut user = sample_user("ada@example.com");
        user.external_identity = Some(ExternalIdentity {
            provider: "github".into(),
            provider_user_id: "583231".into(),
        });
        user.followers = 12;
        let item = user_to_item(&user);
        assert_eq!(
            item.get(PK).and_then(|v| v.as_s().ok()).map(String::as_str),
            Some(user_key(user.id).as_str())
        );

        let back = item_to_user(&item).unwrap();
        assert_eq!(back.id, user.id);
        assert_eq!(back.email, user.email);
        assert_eq!(back.password_hash, user.password_hash);
        assert_eq!(back.external_identity, user.external_identity);
        assert_eq!(back.followers, 12);
        assert_eq!(back.created_at.unix_timestamp(), user.created_at.unix_timestamp());
    }

    #[test]
    fn oauth_only_user_has_no_hash_attribute() {
        let mut user = sample_user("gh@example.com");
        user.password_hash = None;
        let item = user_to_item(&user);
        assert!(!item.contains_key("password_hash"));
        assert!(item_to_user(&item).unwrap().password_hash.is_none());
    }

    #[test]
    fn guard_keys_are_namespaced() {
        assert_eq!(email_key("a@b.c"), "EMAIL#a@b.c");
        assert_eq!(ext_key("github", "1"), "EXT#github#1");
        assert!(user_key(Uuid::nil()).starts_with(USER_PREFIX));
    }

    #[test]
    fn item_missing_fields_is_an_error() {
        let mut item = Item::new();
        item.insert("id".into(), AttributeValue::S(Uuid::new_v4().to_string()));
        assert!(item_to_user(&item).is_err());
    }

    #[test]
    fn failed_condition_is_blamed_on_its_item() {
        let codes = [Some("None"), Some("ConditionalCheckFailed"), Some("None")];
        assert_eq!(classify_cancellation(codes), Some(Cancellation::Condition(1)));
        assert!(matches!(
            create_conflict(Cancellation::Condition(1)),
            RepoError::Conflict(ConflictKind::Email)
        ));
    }

    #[test]
    fn contended_guard_is_a_conflict() {
        let codes = [None, Some("TransactionConflict")];
        let reason = classify_cancellation(codes).unwrap();
        assert_eq!(reason, Cancellation::Contention(1));
        assert!(matches!(
            create_conflict(reason),
            RepoError::Conflict(ConflictKind::Email)
        ));

        let reason = classify_cancellation([None, None, Some("TransactionConflict")]).unwrap();
        assert!(matches!(
            create_conflict(reason),
            RepoError::Conflict(ConflictKind::ExternalIdentity)
        ));
    }

    #[test]
    fn failed_condition_wins_over_contention() {
        let codes = [Some("TransactionConflict"), Some("ConditionalCheckFailed")];
        assert_eq!(classify_cancellation(codes), Some(Cancellation::Condition(1)));
    }

    #[test]
    fn unrelated_cancellations_are_not_classified() {
        assert_eq!(classify_cancellation([None, Some("ThrottlingError")]), None);
        assert_eq!(classify_cancellation(std::iter::empty::<Option<&str>>()), None);
    }

    #[test]
    fn update_and_delete_cancellations() {
        assert!(matches!(update_conflict(Cancellation::Condition(0)), RepoError::NotFound));
        assert!(matches!(update_conflict(Cancellation::Contention(0)), RepoError::Backend(_)));
        assert!(matches!(
            update_conflict(Cancellation::Contention(2)),
            RepoError::Conflict(ConflictKind::ExternalIdentity)
        ));
        assert!(matches!(delete_conflict(Cancellation::Condition(0)), RepoError::NotFound));
        assert!(matches!(delete_conflict(Cancellation::Contention(1)), RepoError::Backend(_)));
    }
}
