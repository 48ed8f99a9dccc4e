use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Link between a local user and an account at an external identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalIdentity {
    pub provider: String,
    pub provider_user_id: String,
}

/// User record as stored by every repository backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub firstname: String,
    pub lastname: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: Option<String>, // argon2 PHC string, never plaintext
    pub external_identity: Option<ExternalIdentity>,
    pub handle: String,
    pub about: String,
    pub profile_image: String,
    pub following: i32,
    pub followers: i32,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl User {
    /// A record must be reachable by at least one login method.
    pub fn has_credentials(&self) -> bool {
        self.password_hash.is_some() || self.external_identity.is_some()
    }
}

/// Default handle when the caller supplies none.
pub fn default_handle(firstname: &str, service: &str) -> String {
    format!("{}@{}", firstname, service)
}

/// Profile fields a caller may change after creation.
///
/// `email` is accepted only so the service can reject attempts to change it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserPatch {
    pub firstname: Option<String>,
    pub lastname: Option<String>,
    pub email: Option<String>,
    pub handle: Option<String>,
    pub about: Option<String>,
    pub profile_image: Option<String>,
    pub following: Option<i32>,
    pub followers: Option<i32>,
}

impl UserPatch {
    pub fn apply(self, user: &mut User) {
        if let Some(v) = self.firstname {
            user.firstname = v;
        }
        if let Some(v) = self.lastname {
            user.lastname = v;
        }
        if let Some(v) = self.handle {
            user.handle = v;
        }
        if let Some(v) = self.about {
            user.about = v;
        }
        if let Some(v) = self.profile_image {
            user.profile_image = v;
        }
        if let Some(v) = self.following {
            user.following = v;
        }
        if let Some(v) = self.followers {
            user.followers = v;
        }
    }
}

#[cfg(test)]
pub(crate) fn sample_user(email: &str) -> User {
    let now = OffsetDateTime::now_utc();
    User {
        id: Uuid::new_v4(),
        firstname: "Ada".into(),
        lastname: "Lovelace".into(),
        email: email.into(),
        password_hash: Some("$argon2id$v=19$m=19456,t=2,p=1$c2FsdA$aGFzaA".into()),
        external_identity: None,
        handle: "Ada@notelify".into(),
        about: String::new(),
        profile_image: String::new(),
        following: 0,
        followers: 0,
        created_at: now,
        updated_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_handle_joins_firstname_and_service() {
        assert_eq!(default_handle("Ada", "notelify"), "Ada@notelify");
    }

    #[test]
    fn patch_leaves_unset_fields_alone() {
        let mut user = sample_user("ada@example.com");
        UserPatch {
            about: Some("mathematician".into()),
            followers: Some(3),
            ..Default::default()
        }
        .apply(&mut user);
        assert_eq!(user.about, "mathematician");
        assert_eq!(user.followers, 3);
        assert_eq!(user.firstname, "Ada");
        assert_eq!(user.email, "ada@example.com");
    }

    #[test]
    fn password_hash_is_never_serialized() {
        let user = sample_user("ada@example.com");
        let json = serde_json::to_string(&user).unwrap();
        assert!(!json.contains("password_hash"));
        assert!(!json.contains("argon2"));
    }

    #[test]
    fn credentials_require_hash_or_identity() {
        let mut user = sample_user("ada@example.com");
        assert!(user.has_credentials());
        user.password_hash = None;
        assert!(!user.has_credentials());
        user.external_identity = Some(ExternalIdentity {
            provider: "github".into(),
            provider_user_id: "42".into(),
        });
        assert!(user.has_credentials());
    }
}
