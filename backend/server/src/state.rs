use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use super::{
    auth::TokenVerifier,
    commands::SurveyCommands,
    config::{Config, StorageBackend, StorageConfig},
    database::{RedisRepository, init_redis},
    memory::MemoryRepository,
    notify::{GatewayTransport, MessengerNotifier, NoopNotifier, Notifier},
    repository::Repository,
    voter::VoterProtocol,
};

pub struct AppState {
    pub config: Config,
    pub repository: Arc<dyn Repository>,
    pub commands: SurveyCommands,
    pub voters: VoterProtocol,
    /// `None` when submissions are anonymous.
    pub verifier: Option<TokenVerifier>,
}

pub async fn init_repository(storage: &StorageConfig) -> Result<Arc<dyn Repository>> {
    Ok(match storage.backend {
        StorageBackend::Redis => {
            let connection = init_redis(&storage.redis_url, storage.timeout)
                .await
                .context("Failed to connect to redis")?;
            Arc::new(RedisRepository::new(connection))
        }
        StorageBackend::Memory => {
            info!("Using in-memory storage, data is lost on restart");
            Arc::new(MemoryRepository::new())
        }
    })
}

impl AppState {
    pub async fn new(config: Config) -> Result<Arc<Self>> {
        let repository = init_repository(&config.storage).await?;

        let notifier: Arc<dyn Notifier> = match &config.messenger {
            Some(messenger) => {
                let transport = GatewayTransport::new(&messenger.endpoint, messenger.timeout)
                    .context("Failed to build messenger client")?;
                Arc::new(MessengerNotifier::new(
                    Arc::new(transport),
                    messenger.clone(),
                    repository.clone(),
                ))
            }
            None => {
                info!("MESSENGER_GATEWAY_URL not set, notifications disabled");
                Arc::new(NoopNotifier)
            }
        };

        Self::with_parts(config, repository, notifier)
    }

    pub fn with_parts(
        config: Config,
        repository: Arc<dyn Repository>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Arc<Self>> {
        let voters = VoterProtocol::new(config.voter_secret.as_bytes(), config.cookie_secure)
            .context("Invalid HELPFUL_VOTER_SECRET")?;

        let verifier = (!config.jwt_keys.is_empty())
            .then(|| TokenVerifier::new(&config.jwt_keys, config.jwt_audience.as_deref()));

        let commands = SurveyCommands::new(repository.clone(), notifier, config.require_moderation);

        Ok(Arc::new(Self {
            config,
            repository,
            commands,
            voters,
            verifier,
        }))
    }
}
