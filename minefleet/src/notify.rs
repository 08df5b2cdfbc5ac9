//! Notification sinks.
//!
//! Sends are fire-and-forget from the control loop's point of view:
//! [`crate::context::FleetContext::notify`] spawns them and logs failures.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::tracing::prelude::*;
use crate::types::{EventCategory, Severity};

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(
        &self,
        message: &str,
        severity: Severity,
        category: EventCategory,
    ) -> anyhow::Result<()>;
}

/// Writes notifications to the log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(
        &self,
        message: &str,
        severity: Severity,
        category: EventCategory,
    ) -> anyhow::Result<()> {
        match severity {
            Severity::Critical => error!(%category, "{message}"),
            Severity::Warning => warn!(%category, "{message}"),
            Severity::Info => info!(%category, "{message}"),
        }
        Ok(())
    }
}

/// POSTs `{message, severity, category}` as JSON.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(
        &self,
        message: &str,
        severity: Severity,
        category: EventCategory,
    ) -> anyhow::Result<()> {
        self.client
            .post(&self.url)
            .json(&json!({
                "message": message,
                "severity": severity,
                "category": category,
            }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum NotifierConfig {
    #[default]
    Log,
    Webhook {
        url: String,
        #[serde(default = "default_timeout_ms")]
        timeout_ms: u64,
    },
}

fn default_timeout_ms() -> u64 {
    5_000
}

impl NotifierConfig {
    pub fn build(&self) -> anyhow::Result<Arc<dyn Notifier>> {
        let notifier: Arc<dyn Notifier> = match self {
            NotifierConfig::Log => Arc::new(LogNotifier),
            NotifierConfig::Webhook { url, timeout_ms } => Arc::new(WebhookNotifier::new(
                url.clone(),
                Duration::from_millis(*timeout_ms),
            )?),
        };
        Ok(notifier)
    }
}
