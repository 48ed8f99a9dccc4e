use crate::auth::{
    jwt::JwtKeys,
    oauth::{GithubOAuth, IdentityProvider},
};
use crate::config::{AppConfig, StorageBackend};
use crate::users::{
    content::ContentClient,
    repo::{DynamoUserRepository, InMemoryUserRepository, PgUserRepository, UserRepository},
    services::UserService,
};
use std::{sync::Arc, time::Duration};
use tracing::{info, warn};

const CONTENT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub users: Arc<UserService>,
    pub oauth: Arc<dyn IdentityProvider>,
    pub content: Arc<ContentClient>,
}

async fn connect_repository(config: &AppConfig) -> anyhow::Result<Arc<dyn UserRepository>> {
    let repo: Arc<dyn UserRepository> = match config.backend {
        StorageBackend::Postgres => {
            let db = sqlx::postgres::PgPoolOptions::new()
                .max_connections(config.database.max_connections)
                .connect_with(config.database.connect_options()?)
                .await?;

            // Run migrations if present
            if let Err(e) = sqlx::migrate!("./migrations").run(&db).await {
                warn!(error = %e, "migrations folder not found or migration failed; continuing");
            }
            Arc::new(PgUserRepository::new(db))
        }
        StorageBackend::Dynamodb => Arc::new(DynamoUserRepository::new(&config.dynamo).await?),
        StorageBackend::Memory => {
            warn!("in-memory storage: users are lost on restart");
            Arc::new(InMemoryUserRepository::new())
        }
    };
    info!(backend = ?config.backend, "user repository ready");
    Ok(repo)
}

impl AppState {
    pub async fn init() -> anyhow::Result<Self> {
        let config = Arc::new(AppConfig::from_env()?);

        let repo = connect_repository(&config).await?;
        let oauth = Arc::new(GithubOAuth::new(&config.github)?) as Arc<dyn IdentityProvider>;
        let content = ContentClient::new(config.content_service_url.clone(), CONTENT_TIMEOUT)?;

        Ok(Self::from_parts(config, repo, oauth, content))
    }

    pub fn from_parts(
        config: Arc<AppConfig>,
        repo: Arc<dyn UserRepository>,
        oauth: Arc<dyn IdentityProvider>,
        content: ContentClient,
    ) -> Self {
        let keys = JwtKeys::new(&config.jwt);
        let users = Arc::new(UserService::new(repo, keys, config.service_name.clone()));
        Self {
            config,
            users,
            oauth,
            content: Arc::new(content),
        }
    }

    /// In-memory state with a fake identity provider.
    #[cfg(test)]
    pub fn fake() -> Self {
        use crate::auth::oauth::testing::FakeProvider;
        use crate::config::{DatabaseConfig, DynamoConfig, GithubConfig, JwtConfig};

        let config = Arc::new(AppConfig {
            service_name: "notelify".into(),
            backend: StorageBackend::Memory,
            database: DatabaseConfig {
                url: None,
                host: "localhost".into(),
                port: 5432,
                name: "users".into(),
                user: "postgres".into(),
                password: String::new(),
                ssl_mode: "disable".into(),
                max_connections: 1,
            },
            dynamo: DynamoConfig {
                region: "us-east-1".into(),
                table: "users".into(),
                endpoint: None,
                access_key_id: None,
                secret_access_key: None,
            },
            jwt: JwtConfig {
                secret: "test".into(),
                issuer: "test".into(),
                audience: "test".into(),
                ttl_minutes: 30,
            },
            github: GithubConfig {
                client_id: "test".into(),
                client_secret: "test".into(),
                redirect_url: "http://localhost/v1/auth/github/callback".into(),
                timeout_secs: 1,
            },
            cookie_secure: false,
            content_service_url: None,
        });

        Self::from_parts(
            config,
            Arc::new(InMemoryUserRepository::new()),
            Arc::new(FakeProvider::github("4242", Some("Grace Hopper"))),
            ContentClient::disabled(),
        )
    }
}
