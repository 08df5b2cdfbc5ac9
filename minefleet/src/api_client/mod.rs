//! HTTP client for the daemon's v0 API.

pub mod types;

use anyhow::{Result, bail};
use reqwest::Response;
use serde::de::DeserializeOwned;

use crate::rules::AutomationRule;
use types::{
    DeviceState, EventRecord, FailoverResult, JobState, PoolState, RulePatch, SettingsPatch,
    SettingsState,
};

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:7785";

pub struct Client {
    http: reqwest::Client,
    base_url: String,
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Client {
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    pub fn with_base_url(url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v0{path}", self.base_url)
    }

    /// Turn a non-success status into an error carrying the body text.
    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if body.is_empty() {
                bail!("{status}");
            }
            bail!("{status}: {body}");
        }
        Ok(response.json().await?)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        Self::decode(self.http.get(self.url(path)).send().await?).await
    }

    pub async fn health(&self) -> Result<String> {
        let response = self.http.get(self.url("/health")).send().await?;
        Ok(response.error_for_status()?.text().await?)
    }

    pub async fn get_devices(&self) -> Result<Vec<DeviceState>> {
        self.get("/devices").await
    }

    pub async fn get_events(&self, limit: usize) -> Result<Vec<EventRecord>> {
        self.get(&format!("/events?limit={limit}")).await
    }

    pub async fn get_pools(&self) -> Result<Vec<PoolState>> {
        self.get("/pools").await
    }

    pub async fn get_jobs(&self) -> Result<Vec<JobState>> {
        self.get("/jobs").await
    }

    pub async fn run_job(&self, name: &str) -> Result<JobState> {
        let response = self
            .http
            .post(self.url(&format!("/jobs/{name}/run")))
            .send()
            .await?;
        Self::decode(response).await
    }

    pub async fn failover(&self, device: &str) -> Result<FailoverResult> {
        let response = self
            .http
            .post(self.url(&format!("/devices/{device}/failover")))
            .send()
            .await?;
        Self::decode(response).await
    }

    pub async fn restart(&self, device: &str) -> Result<()> {
        let response = self
            .http
            .post(self.url(&format!("/devices/{device}/restart")))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            bail!("{status}: {}", response.text().await.unwrap_or_default());
        }
        Ok(())
    }

    pub async fn get_settings(&self) -> Result<SettingsState> {
        self.get("/settings").await
    }

    pub async fn patch_settings(&self, patch: &SettingsPatch) -> Result<SettingsState> {
        let response = self
            .http
            .patch(self.url("/settings"))
            .json(patch)
            .send()
            .await?;
        Self::decode(response).await
    }

    pub async fn get_rules(&self) -> Result<Vec<AutomationRule>> {
        self.get("/rules").await
    }

    pub async fn create_rule(&self, rule: &AutomationRule) -> Result<AutomationRule> {
        let response = self
            .http
            .post(self.url("/rules"))
            .json(rule)
            .send()
            .await?;
        Self::decode(response).await
    }

    pub async fn patch_rule(&self, name: &str, patch: &RulePatch) -> Result<AutomationRule> {
        let response = self
            .http
            .patch(self.url(&format!("/rules/{name}")))
            .json(patch)
            .send()
            .await?;
        Self::decode(response).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::api::{SharedState, build_router};
    use crate::scheduler::Scheduler;
    use crate::testing::Harness;
    use crate::types::DeviceType;

    async fn serve(harness: &Harness) -> Client {
        let ctx = harness.ctx();
        let state = SharedState {
            scheduler: Arc::new(Scheduler::new(ctx.store().clone())),
            ctx,
        };
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, build_router(state)).await });
        Client::with_base_url(format!("http://{addr}/"))
    }

    #[tokio::test]
    async fn client_round_trips_through_the_api() {
        let harness = Harness::new();
        harness.add_device("rig-1", DeviceType::NerdQaxe);
        let client = serve(&harness).await;

        assert_eq!(client.health().await.unwrap(), "OK");
        let devices = client.get_devices().await.unwrap();
        assert_eq!(devices[0].device_type, "nerd-qaxe");

        let settings = client
            .patch_settings(&SettingsPatch {
                auto_optimize: Some(true),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(settings.auto_optimize);
        assert!(client.get_settings().await.unwrap().auto_optimize);
    }

    #[tokio::test]
    async fn error_status_carries_the_message() {
        let harness = Harness::new();
        let client = serve(&harness).await;

        let err = client.run_job("nope").await.unwrap_err().to_string();
        assert!(err.starts_with("404"), "{err}");
        assert!(err.contains("nope"), "{err}");
    }
}
