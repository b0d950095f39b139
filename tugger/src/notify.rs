//! Best-effort alerting through an incoming-webhook endpoint (Slack style)
//!
//! Many admission requests tend to fail for the same reason at once, so each
//! message is remembered for a short window and repeats inside that window
//! are dropped. Delivery runs in the background; its problems are logged and
//! never reach the caller.

use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Sends an alert about a policy outcome
#[async_trait]
pub trait Notify: Send + Sync {
    async fn notify(&self, message: &str);
}

/// Recently sent messages
///
/// The check and the insert happen as one cache operation, so two concurrent
/// identical messages cannot both get through.
#[derive(Debug, Clone)]
pub struct SentMessages {
    cache: Cache<String, ()>,
}

impl SentMessages {
    pub fn new(window: Duration) -> Self {
        Self {
            cache: Cache::builder().time_to_live(window).build(),
        }
    }

    /// Records `message` and returns true unless it was already recorded
    /// within the window
    pub async fn first_sighting(&self, message: &str) -> bool {
        self.cache
            .entry_by_ref(message)
            .or_insert(())
            .await
            .is_fresh()
    }
}

#[derive(Serialize)]
struct NotificationBody<'a> {
    text: &'a str,
}

#[derive(Error, Debug)]
enum DeliveryError {
    #[error("got error from webhook: {0}")]
    Http(#[from] reqwest::Error),
    #[error("non-ok response returned from webhook: {status} {body:?}")]
    Rejected {
        status: reqwest::StatusCode,
        body: String,
    },
}

/// Notifier settings
#[derive(Debug, Clone, Default)]
pub struct NotifierConfig {
    /// Endpoint to post to; without one nothing is sent
    pub webhook_url: Option<String>,
    /// Tag prefixed to every message as `[tag]`
    pub environment: Option<String>,
    /// Suppression window; `None` disables deduplication
    pub dedup_window: Option<Duration>,
    pub timeout: Duration,
}

/// Posts `{"text": ...}` to the configured webhook
#[derive(Debug, Clone)]
pub struct Notifier {
    webhook_url: Option<String>,
    environment: Option<String>,
    client: reqwest::Client,
    sent: Option<SentMessages>,
}

impl Notifier {
    pub fn new(config: &NotifierConfig) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            webhook_url: config.webhook_url.clone(),
            environment: config.environment.clone(),
            client,
            sent: config.dedup_window.map(SentMessages::new),
        })
    }

    fn format(&self, message: &str) -> String {
        match &self.environment {
            Some(env) => format!("[{env}] {message}"),
            None => message.to_string(),
        }
    }

    async fn deliver(&self, url: &str, text: &str) -> Result<(), DeliveryError> {
        let response = self
            .client
            .post(url)
            .json(&NotificationBody { text })
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() || body != "ok" {
            return Err(DeliveryError::Rejected { status, body });
        }

        Ok(())
    }

    /// Deduplicates `message` and hands delivery to a background task
    ///
    /// Returns the delivery task, or `None` when nothing is sent.
    pub async fn dispatch(&self, message: &str) -> Option<JoinHandle<()>> {
        let Some(url) = self.webhook_url.clone() else {
            debug!("notification webhook url is not provided");
            return None;
        };

        if let Some(sent) = &self.sent
            && !sent.first_sighting(message).await
        {
            debug!(message = %message, "suppressing duplicate notification");
            return None;
        }

        let text = self.format(message);
        let notifier = self.clone();
        Some(tokio::spawn(async move {
            match notifier.deliver(&url, &text).await {
                Ok(()) => info!(message = %text, "sent notification"),
                Err(err) => warn!(error = %err, message = %text, "notification failed"),
            }
        }))
    }
}

#[async_trait]
impl Notify for Notifier {
    /// Returns once the message is queued; delivery never delays the caller
    async fn notify(&self, message: &str) {
        self.dispatch(message).await;
    }
}
