//! Energy price sources.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[async_trait]
pub trait PriceSource: Send + Sync {
    /// Current energy price in the site's unit (e.g. ct/kWh).
    async fn current_price(&self) -> anyhow::Result<f64>;
}

/// A price set by configuration or by hand.
pub struct FixedPrice {
    price: Mutex<f64>,
}

impl FixedPrice {
    pub fn new(price: f64) -> Self {
        Self {
            price: Mutex::new(price),
        }
    }

    pub fn set(&self, price: f64) {
        *self.price.lock() = price;
    }
}

#[async_trait]
impl PriceSource for FixedPrice {
    async fn current_price(&self) -> anyhow::Result<f64> {
        Ok(*self.price.lock())
    }
}

/// Reads the price from a JSON HTTP endpoint.
///
/// `pointer` is an RFC 6901 JSON pointer to the numeric field, e.g.
/// `/data/0/price`. Numbers encoded as strings are accepted.
pub struct HttpPriceSource {
    client: reqwest::Client,
    url: String,
    pointer: String,
}

impl HttpPriceSource {
    pub fn new(
        url: impl Into<String>,
        pointer: impl Into<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
            url: url.into(),
            pointer: pointer.into(),
        })
    }
}

fn extract_price(body: &Value, pointer: &str) -> anyhow::Result<f64> {
    let field = body
        .pointer(pointer)
        .ok_or_else(|| anyhow!("no field at {pointer:?}"))?;
    match field {
        Value::Number(n) => n.as_f64().ok_or_else(|| anyhow!("price {n} is not finite")),
        Value::String(s) => s
            .trim()
            .parse()
            .with_context(|| format!("price {s:?} is not a number")),
        other => Err(anyhow!("price field is {other}, expected a number")),
    }
}

#[async_trait]
impl PriceSource for HttpPriceSource {
    async fn current_price(&self) -> anyhow::Result<f64> {
        let body: Value = self
            .client
            .get(&self.url)
            .send()
            .await
            .with_context(|| format!("fetching {}", self.url))?
            .error_for_status()?
            .json()
            .await?;
        extract_price(&body, &self.pointer)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum PriceConfig {
    /// No price feed; energy optimization and price rules stay idle.
    #[default]
    None,
    Fixed {
        price: f64,
    },
    Http {
        url: String,
        #[serde(default = "default_pointer")]
        pointer: String,
        #[serde(default = "default_timeout_ms")]
        timeout_ms: u64,
    },
}

fn default_pointer() -> String {
    "/price".to_string()
}

fn default_timeout_ms() -> u64 {
    5_000
}

impl PriceConfig {
    pub fn build(&self) -> anyhow::Result<Option<Arc<dyn PriceSource>>> {
        let source: Arc<dyn PriceSource> = match self {
            PriceConfig::None => return Ok(None),
            PriceConfig::Fixed { price } => Arc::new(FixedPrice::new(*price)),
            PriceConfig::Http {
                url,
                pointer,
                timeout_ms,
            } => Arc::new(HttpPriceSource::new(
                url.clone(),
                pointer.clone(),
                Duration::from_millis(*timeout_ms),
            )?),
        };
        Ok(Some(source))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Json, Router, routing::get};
    use serde_json::json;
    use test_case::test_case;

    #[test_case(json!({"price": 21.5}), "/price", Some(21.5); "number")]
    #[test_case(json!({"data": [{"price": "7.25"}]}), "/data/0/price", Some(7.25); "nested string")]
    #[test_case(json!({"price": null}), "/price", None; "null")]
    #[test_case(json!({"cost": 1.0}), "/price", None; "missing")]
    fn extracts_price(body: Value, pointer: &str, expected: Option<f64>) {
        assert_eq!(extract_price(&body, pointer).ok(), expected);
    }

    #[tokio::test]
    async fn fixed_price_can_be_updated() {
        let source = FixedPrice::new(12.0);
        assert_eq!(source.current_price().await.unwrap(), 12.0);
        source.set(30.0);
        assert_eq!(source.current_price().await.unwrap(), 30.0);
    }

    #[tokio::test]
    async fn http_source_reads_endpoint() {
        let app = Router::new().route(
            "/spot",
            get(|| async { Json(json!({"market": {"price": 18.4}})) }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });

        let source = HttpPriceSource::new(
            format!("http://{addr}/spot"),
            "/market/price",
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(source.current_price().await.unwrap(), 18.4);
    }
}
