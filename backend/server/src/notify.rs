//! # Notifications
//!
//! Fire-and-forget messages sent after a survey submission. Nothing here can
//! fail a request: [`crate::commands`] spawns [`Notifier::survey_submitted`]
//! on its own task.
//!
//! Order of delivery:
//! 1. Receipt to the submitter when the survey is attributed.
//! 2. Admin channel: Discord with retries, then Slack once.
//! 3. If neither admin channel accepted the message, a
//!    [`NotificationFailure`] is appended to the failure log.
use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde_json::json;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::{
    config::MessengerConfig,
    models::{NotificationFailure, StoreId, Submitter, SurveyId},
    repository::Repository,
};

const DISCORD_ATTEMPTS: u32 = 3;
const DISCORD_DELAY: Duration = Duration::from_millis(200);
const SLACK_ATTEMPTS: u32 = 1;

#[derive(Clone, Debug)]
pub struct SubmissionNotice {
    pub survey_id: SurveyId,
    pub store_id: StoreId,
    pub store_name: String,
    pub branch_name: Option<String>,
    pub region: String,
    pub period: String,
    pub taxonomy: Vec<String>,
    pub age: Option<u32>,
    pub rating: f64,
    pub comment: String,
    pub submitter: Option<Submitter>,
}

impl SubmissionNotice {
    fn reviewer(&self) -> &str {
        self.submitter
            .as_ref()
            .map(Submitter::display_name)
            .unwrap_or("anonymous")
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn survey_submitted(&self, notice: SubmissionNotice);
}

pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn survey_submitted(&self, notice: SubmissionNotice) {
        info!("Survey {} submitted, notifications disabled", notice.survey_id);
    }
}

#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Gateway returned {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Gateway delivery failed: {0}")]
    Other(String),
}

/// One message to one destination.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, destination: &str, user_id: &str, text: &str) -> Result<(), DeliveryError>;
}

/// `POST {endpoint}/messages` on the messenger gateway.
pub struct GatewayTransport {
    client: Client,
    endpoint: String,
}

impl GatewayTransport {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, DeliveryError> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            endpoint: format!("{}/messages", endpoint.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl Transport for GatewayTransport {
    async fn send(&self, destination: &str, user_id: &str, text: &str) -> Result<(), DeliveryError> {
        let payload = json!({
            "userId": user_id,
            "text": text,
            "destination": destination,
        });

        let res = self.client.post(&self.endpoint).json(&payload).send().await?;

        let status = res.status();
        if status.is_client_error() || status.is_server_error() {
            let body = res.text().await.unwrap_or_default();
            return Err(DeliveryError::Rejected {
                status: status.as_u16(),
                body: body.chars().take(512).collect(),
            });
        }

        Ok(())
    }
}

pub struct MessengerNotifier {
    transport: Arc<dyn Transport>,
    config: MessengerConfig,
    failures: Arc<dyn Repository>,
}

impl MessengerNotifier {
    pub fn new(
        transport: Arc<dyn Transport>,
        config: MessengerConfig,
        failures: Arc<dyn Repository>,
    ) -> Self {
        Self {
            transport,
            config,
            failures,
        }
    }

    async fn send_with_retry(
        &self,
        destination: &str,
        identifier: &str,
        text: &str,
        attempts: u32,
        delay: Duration,
    ) -> Result<(), DeliveryError> {
        let mut last = DeliveryError::Other("no attempt made".to_string());

        for attempt in 1..=attempts {
            match self.transport.send(destination, identifier, text).await {
                Ok(()) => return Ok(()),
                Err(e) => last = e,
            }

            if attempt < attempts && !delay.is_zero() {
                sleep(delay).await;
            }
        }

        Err(last)
    }

    async fn send_receipt(&self, notice: &SubmissionNotice) {
        let Some(submitter) = &notice.submitter else {
            return;
        };

        let text = receipt_message(notice);
        if let Err(e) = self
            .transport
            .send(&self.config.receipt_destination, &submitter.id, &text)
            .await
        {
            warn!("Receipt for survey {} not delivered: {e}", notice.survey_id);
        }
    }

    async fn notify_admins(&self, notice: &SubmissionNotice) {
        let discord = self.config.discord_destination.as_deref();
        let slack = self.config.slack_destination.as_deref();
        if discord.is_none() && slack.is_none() {
            return;
        }

        let base_url = self.config.admin_review_base_url.as_deref();
        let identifier = notice.survey_id.to_string();
        let mut errors = Vec::new();
        let mut attempts = 0;

        if let Some(destination) = discord {
            let text = discord_message(notice, base_url);
            attempts += DISCORD_ATTEMPTS;
            match self
                .send_with_retry(destination, &identifier, &text, DISCORD_ATTEMPTS, DISCORD_DELAY)
                .await
            {
                Ok(()) => return,
                Err(e) => {
                    warn!("Discord notification for survey {identifier} failed: {e}");
                    errors.push(e.to_string());
                }
            }
        }

        if let Some(destination) = slack {
            let text = slack_message(notice, base_url);
            attempts += SLACK_ATTEMPTS;
            match self
                .send_with_retry(destination, &identifier, &text, SLACK_ATTEMPTS, Duration::ZERO)
                .await
            {
                Ok(()) => return,
                Err(e) => {
                    warn!("Slack notification for survey {identifier} failed: {e}");
                    errors.push(e.to_string());
                }
            }
        }

        let failure = NotificationFailure {
            survey_id: notice.survey_id,
            store_id: notice.store_id,
            store_name: notice.store_name.clone(),
            identifier,
            error: errors.join("; "),
            attempts,
            created_at: Utc::now(),
        };

        if let Err(e) = self.failures.record_failure(&failure).await {
            warn!("Could not record failed notification: {e}");
        }
    }
}

#[async_trait]
impl Notifier for MessengerNotifier {
    async fn survey_submitted(&self, notice: SubmissionNotice) {
        self.send_receipt(&notice).await;
        self.notify_admins(&notice).await;
    }
}

fn admin_link(notice: &SubmissionNotice, base_url: Option<&str>) -> Option<String> {
    base_url
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(|url| format!("{}/{}", url.trim_end_matches('/'), notice.survey_id))
}

pub fn receipt_message(notice: &SubmissionNotice) -> String {
    let mut sections: Vec<(&str, String)> = vec![
        ("Store", notice.store_name.clone()),
        ("Branch", notice.branch_name.clone().unwrap_or_default()),
        ("Region", notice.region.clone()),
        ("Period", notice.period.clone()),
        ("Category", notice.taxonomy.join(" / ")),
    ];
    if let Some(age) = notice.age {
        sections.push(("Age", age.to_string()));
    }
    sections.push(("Comment", notice.comment.clone()));

    let mut text = String::from("Thank you for your survey!\n");
    for (title, value) in sections {
        let value = value.trim();
        if !value.is_empty() {
            text.push_str(&format!("**{title}**\n> {value}\n"));
        }
    }

    text
}

pub fn discord_message(notice: &SubmissionNotice, base_url: Option<&str>) -> String {
    let mut text = format!("**{}** submitted a new survey.\n", notice.reviewer());
    text.push_str(&format!("- Store: {} ({})\n", notice.store_name, notice.region));
    text.push_str(&format!("- Period: {}\n", notice.period));
    text.push_str(&format!("- Rating: {:.1} / 5\n", notice.rating));
    text.push_str(&format!("- Comment: {}\n", notice.comment));
    if let Some(link) = admin_link(notice, base_url) {
        text.push_str(&format!("[Review in admin]({link})\n"));
    }

    text
}

pub fn slack_message(notice: &SubmissionNotice, base_url: Option<&str>) -> String {
    let mut text = format!(":warning: {} submitted a new survey.\n", notice.reviewer());
    text.push_str(&format!("Store: {} ({})\n", notice.store_name, notice.region));
    text.push_str(&format!("Period: {}\n", notice.period));
    text.push_str(&format!("Rating: {:.1} / 5\n", notice.rating));
    if !notice.comment.trim().is_empty() {
        text.push_str(&format!("Comment: {}\n", notice.comment));
    }
    if let Some(link) = admin_link(notice, base_url) {
        text.push_str(&format!("Admin: {link}\n"));
    }

    text
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::memory::MemoryRepository;

    /// Fails every send to the destinations listed in `failing`.
    struct Scripted {
        failing: Vec<&'static str>,
        sent: Mutex<Vec<(String, String)>>,
    }

    impl Scripted {
        fn new(failing: Vec<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                failing,
                sent: Mutex::new(Vec::new()),
            })
        }

        fn destinations(&self) -> Vec<String> {
            self.sent.lock().iter().map(|(d, _)| d.clone()).collect()
        }
    }

    #[async_trait]
    impl Transport for Scripted {
        async fn send(&self, destination: &str, user_id: &str, _text: &str) -> Result<(), DeliveryError> {
            self.sent
                .lock()
                .push((destination.to_string(), user_id.to_string()));

            if self.failing.iter().any(|f| *f == destination) {
                return Err(DeliveryError::Other(format!("{destination} down")));
            }

            Ok(())
        }
    }

    fn config() -> MessengerConfig {
        MessengerConfig {
            endpoint: "http://gateway".to_string(),
            receipt_destination: "line".to_string(),
            discord_destination: Some("discord".to_string()),
            slack_destination: Some("slack".to_string()),
            timeout: Duration::from_secs(1),
            admin_review_base_url: Some("https://admin.example/surveys/".to_string()),
        }
    }

    fn notice(submitter: Option<Submitter>) -> SubmissionNotice {
        SubmissionNotice {
            survey_id: SurveyId::generate(),
            store_id: StoreId::generate(),
            store_name: "Luna".to_string(),
            branch_name: None,
            region: "東京都".to_string(),
            period: "2024-05".to_string(),
            taxonomy: vec!["ソープ".to_string()],
            age: Some(24),
            rating: 4.5,
            comment: "good".to_string(),
            submitter,
        }
    }

    #[tokio::test]
    async fn test_discord_success_skips_slack() {
        let transport = Scripted::new(vec![]);
        let repo = Arc::new(MemoryRepository::new());
        let notifier = MessengerNotifier::new(transport.clone(), config(), repo.clone());

        let submitter = Submitter {
            id: "u-1".to_string(),
            name: Some("Mika".to_string()),
            username: None,
            picture: None,
        };
        notifier.survey_submitted(notice(Some(submitter))).await;

        assert_eq!(transport.destinations(), vec!["line", "discord"]);
        assert!(repo.failures().is_empty());
    }

    #[tokio::test]
    async fn test_falls_back_to_slack() {
        let transport = Scripted::new(vec!["discord"]);
        let repo = Arc::new(MemoryRepository::new());
        let notifier = MessengerNotifier::new(transport.clone(), config(), repo.clone());

        notifier.survey_submitted(notice(None)).await;

        assert_eq!(
            transport.destinations(),
            vec!["discord", "discord", "discord", "slack"]
        );
        assert!(repo.failures().is_empty());
    }

    #[tokio::test]
    async fn test_records_failure_when_all_channels_fail() {
        let transport = Scripted::new(vec!["discord", "slack"]);
        let repo = Arc::new(MemoryRepository::new());
        let notifier = MessengerNotifier::new(transport.clone(), config(), repo.clone());
        let notice = notice(None);

        notifier.survey_submitted(notice.clone()).await;

        let failures = repo.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].survey_id, notice.survey_id);
        assert_eq!(failures[0].attempts, 4);
        assert!(failures[0].error.contains("discord down"));
        assert!(failures[0].error.contains("slack down"));
    }

    #[test]
    fn test_messages() {
        let notice = notice(None);
        let base = Some("https://admin.example/surveys/");

        let discord = discord_message(&notice, base);
        assert!(discord.starts_with("**anonymous**"));
        assert!(discord.contains("Luna (東京都)"));
        assert!(discord.contains("4.5 / 5"));
        assert!(discord.contains(&format!("https://admin.example/surveys/{}", notice.survey_id)));

        let slack = slack_message(&notice, None);
        assert!(!slack.contains("Admin:"));

        let receipt = receipt_message(&notice);
        assert!(receipt.contains("**Age**\n> 24"));
        assert!(!receipt.contains("Branch"));
    }
}
