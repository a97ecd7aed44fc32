use std::{env, fmt::Display, fs::read_to_string, str::FromStr, time::Duration};

use anyhow::{Context, Result, anyhow, bail};
use tracing::{info, warn};

use crate::auth::JwtKey;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageBackend {
    Redis,
    Memory,
}

impl FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "redis" => Ok(StorageBackend::Redis),
            "memory" => Ok(StorageBackend::Memory),
            other => Err(format!("unknown storage backend {other}")),
        }
    }
}

#[derive(Clone, Debug)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub redis_url: String,
    pub timeout: Duration,
}

impl StorageConfig {
    /// Storage settings only, for tools that never serve requests.
    pub fn load() -> Result<Self> {
        Ok(Self {
            backend: try_load("STORAGE", "redis")?,
            redis_url: try_load("REDIS_URL", "redis://redis:6379")?,
            timeout: Duration::from_millis(try_load("STORAGE_TIMEOUT_MS", "3000")?),
        })
    }
}

#[derive(Clone, Debug)]
pub struct MessengerConfig {
    pub endpoint: String,
    pub receipt_destination: String,
    pub discord_destination: Option<String>,
    pub slack_destination: Option<String>,
    pub timeout: Duration,
    pub admin_review_base_url: Option<String>,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub storage: StorageConfig,
    pub allowed_origins: Vec<String>,
    pub voter_secret: String,
    pub cookie_secure: bool,
    pub admin_token: String,
    pub jwt_keys: Vec<JwtKey>,
    pub jwt_audience: Option<String>,
    pub require_moderation: bool,
    pub messenger: Option<MessengerConfig>,
}

impl Config {
    pub fn load() -> Result<Self> {
        let jwt_keys = match read_optional_secret("AUTH_JWT_SECRET") {
            Some(secret) => vec![JwtKey {
                issuer: try_load("AUTH_JWT_ISSUER", "line")?,
                secret,
            }],
            None => Vec::new(),
        };

        let messenger = match optional("MESSENGER_GATEWAY_URL") {
            Some(endpoint) => Some(MessengerConfig {
                endpoint,
                receipt_destination: try_load("MESSENGER_RECEIPT_DESTINATION", "line")?,
                discord_destination: optional("MESSENGER_DISCORD_DESTINATION"),
                slack_destination: optional("MESSENGER_SLACK_DESTINATION"),
                timeout: Duration::from_millis(try_load("MESSENGER_TIMEOUT_MS", "5000")?),
                admin_review_base_url: optional("ADMIN_REVIEW_BASE_URL"),
            }),
            None => None,
        };

        let allowed_origins: String = try_load("API_ALLOWED_ORIGINS", "http://localhost:5173")?;

        Ok(Self {
            port: try_load("RUST_PORT", "8080")?,
            storage: StorageConfig::load()?,
            allowed_origins: parse_origins(&allowed_origins)?,
            voter_secret: read_secret("HELPFUL_VOTER_SECRET")?,
            cookie_secure: try_load("HELPFUL_COOKIE_SECURE", "true")?,
            admin_token: read_secret("ADMIN_TOKEN")?,
            jwt_keys,
            jwt_audience: optional("AUTH_JWT_AUDIENCE"),
            require_moderation: try_load("REQUIRE_MODERATION", "false")?,
            messenger,
        })
    }
}

/// Credentialed CORS needs explicit origins, a wildcard is refused.
fn parse_origins(raw: &str) -> Result<Vec<String>> {
    let origins: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .map(str::to_string)
        .collect();

    if origins.iter().any(|origin| origin == "*") {
        bail!("API_ALLOWED_ORIGINS must list origins explicitly, `*` is not allowed with credentials");
    }

    Ok(origins)
}

fn var(key: &str) -> Result<String, ()> {
    env::var(key).map_err(|_| {
        warn!("Environment variable {key} not found, using default");
    })
}

fn optional(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn try_load<T: FromStr>(key: &str, default: &str) -> Result<T>
where
    T::Err: Display,
{
    var(key)
        .unwrap_or_else(|_| {
            info!("{key} not set, using default: {default}");
            default.to_string()
        })
        .trim()
        .parse()
        .map_err(|e| anyhow!("Invalid {key} value: {e}"))
}

/// `/run/secrets/<name>` first, then the environment variable of the same name.
fn read_optional_secret(secret_name: &str) -> Option<String> {
    let path = format!("/run/secrets/{secret_name}");

    match read_to_string(&path) {
        Ok(secret) => Some(secret.trim().to_string()).filter(|s| !s.is_empty()),
        Err(e) => {
            info!("Failed to read {secret_name} from file ({e}), trying environment");
            optional(secret_name)
        }
    }
}

fn read_secret(secret_name: &str) -> Result<String> {
    read_optional_secret(secret_name)
        .with_context(|| format!("Secret {secret_name} is not configured"))
}
