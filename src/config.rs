use anyhow::Context;
use serde::Deserialize;
use sqlx::postgres::{PgConnectOptions, PgSslMode};

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    pub issuer: String,
    pub audience: String,
    pub ttl_minutes: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: String,
    pub ssl_mode: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DynamoConfig {
    pub region: String,
    pub table: String,
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GithubConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_url: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Postgres,
    Dynamodb,
    Memory,
}

impl std::str::FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "dynamodb" | "dynamo" => Ok(Self::Dynamodb),
            "memory" => Ok(Self::Memory),
            other => anyhow::bail!("unknown STORAGE_BACKEND {other:?}"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub service_name: String,
    pub backend: StorageBackend,
    pub database: DatabaseConfig,
    pub dynamo: DynamoConfig,
    pub jwt: JwtConfig,
    pub github: GithubConfig,
    pub cookie_secure: bool,
    pub content_service_url: Option<String>,
}

fn var_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.into())
}

fn parsed_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let backend = var_or("STORAGE_BACKEND", "postgres").parse()?;

        let database = DatabaseConfig {
            url: std::env::var("DATABASE_URL").ok(),
            host: var_or("DATABASE_HOST", "localhost"),
            port: parsed_or("DATABASE_PORT", 5432),
            name: var_or("DATABASE_NAME", "users"),
            user: var_or("DATABASE_USER", "postgres"),
            password: var_or("DATABASE_PASSWORD", ""),
            ssl_mode: var_or("DATABASE_SSLMODE", "prefer"),
            max_connections: parsed_or("DATABASE_MAX_CONNECTIONS", 10),
        };

        let dynamo = DynamoConfig {
            region: var_or("AWS_DEFAULT_REGION", "us-east-1"),
            table: var_or("USERS_TABLE", "users"),
            endpoint: std::env::var("DYNAMODB_ENDPOINT").ok(),
            access_key_id: std::env::var("AWS_ACCESS_KEY_ID").ok(),
            secret_access_key: std::env::var("AWS_SECRET_ACCESS_KEY").ok(),
        };

        let secret = std::env::var("JWT_SECRET").context("JWT_SECRET must be set")?;
        anyhow::ensure!(!secret.is_empty(), "JWT_SECRET must not be empty");
        let jwt = JwtConfig {
            secret,
            issuer: var_or("JWT_ISSUER", "notelify-users"),
            audience: var_or("JWT_AUDIENCE", "notelify"),
            ttl_minutes: parsed_or("JWT_TTL_MINUTES", 30),
        };

        let github = GithubConfig {
            client_id: var_or("GITHUB_CLIENT_ID", ""),
            client_secret: var_or("GITHUB_CLIENT_SECRET", ""),
            redirect_url: var_or("GITHUB_REDIRECT_URL", ""),
            timeout_secs: parsed_or("OAUTH_TIMEOUT_SECS", 10),
        };

        Ok(Self {
            service_name: var_or("SERVICE_NAME", "notelify"),
            backend,
            database,
            dynamo,
            jwt,
            github,
            cookie_secure: parsed_or("COOKIE_SECURE", false),
            content_service_url: std::env::var("CONTENT_SERVICE_URL").ok(),
        })
    }
}

impl DatabaseConfig {
    /// `DATABASE_URL` wins over the individual parts when both are present.
    pub fn connect_options(&self) -> anyhow::Result<PgConnectOptions> {
        if let Some(url) = &self.url {
            return url.parse().context("parse DATABASE_URL");
        }
        let ssl_mode = match self.ssl_mode.as_str() {
            "disable" => PgSslMode::Disable,
            "allow" => PgSslMode::Allow,
            "prefer" => PgSslMode::Prefer,
            "require" => PgSslMode::Require,
            "verify-ca" => PgSslMode::VerifyCa,
            "verify-full" => PgSslMode::VerifyFull,
            other => anyhow::bail!("unknown DATABASE_SSLMODE {other:?}"),
        };
        Ok(PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.name)
            .username(&self.user)
            .password(&self.password)
            .ssl_mode(ssl_mode))
    }
}
