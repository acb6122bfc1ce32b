//! Polls `GET <baseURL>/products` on an interval and publishes the parsed
//! catalog through an atomic snapshot mux.
//!
//! Grounded on `integration-gateway/src/config.rs`'s validated-config
//! shape (the refresh-rate floor is rejected at construction the same way
//! `GatewayConfig` floors its durations) and `usage.rs`'s ticker loop,
//! swapped here for `runtime_util::Looper` to get backoff for free.

use std::sync::Mutex;
use std::time::Duration;

use reqwest::header::{HeaderValue, ETAG, IF_NONE_MATCH};
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use runtime_util::looper::{BackoffPolicy, Looper};
use runtime_util::{registry, RegistryReader, RegistryWriter};

use crate::catalog::{parse_snapshot, ProductSnapshot};
use crate::error::{ProductError, ProductResult};

pub const MIN_REFRESH_RATE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct ProductConfig {
    pub base_url: String,
    pub refresh_rate: Duration,
}

impl ProductConfig {
    pub fn new(base_url: impl Into<String>, refresh_rate: Duration) -> ProductResult<Self> {
        if refresh_rate < MIN_REFRESH_RATE {
            return Err(ProductError::RefreshRateTooLow {
                requested: refresh_rate,
                minimum: MIN_REFRESH_RATE,
            });
        }
        Ok(Self {
            base_url: base_url.into(),
            refresh_rate,
        })
    }
}

pub struct ProductPoller {
    config: ProductConfig,
    client: Client,
    writer: RegistryWriter<ProductSnapshot>,
    etag: Mutex<Option<String>>,
}

impl ProductPoller {
    pub fn new(config: ProductConfig, client: Client) -> (Self, RegistryReader<ProductSnapshot>) {
        let (writer, reader) = registry(ProductSnapshot::empty());
        (
            Self {
                config,
                client,
                writer,
                etag: Mutex::new(None),
            },
            reader,
        )
    }

    pub fn spawn(self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let poller = std::sync::Arc::new(self);
        Looper::spawn(
            poller.config.refresh_rate,
            BackoffPolicy::default(),
            cancel,
            move || {
                let poller = poller.clone();
                async move { poller.poll_once().await }
            },
            |_err: &ProductError| false,
        )
    }

    async fn poll_once(&self) -> ProductResult<()> {
        let url = format!("{}/products", self.config.base_url.trim_end_matches('/'));
        let mut request = self.client.get(&url);
        if let Some(etag) = self.etag.lock().expect("etag mutex poisoned").clone() {
            if let Ok(value) = HeaderValue::from_str(&etag) {
                request = request.header(IF_NONE_MATCH, value);
            }
        }

        let response = request.send().await.map_err(|err| ProductError::Fetch(err.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_MODIFIED {
            debug!(url, "product catalog not modified");
            return Ok(());
        }
        if !response.status().is_success() {
            return Err(ProductError::Fetch(format!("HTTP {} from {url}", response.status())));
        }

        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.text().await.map_err(|err| ProductError::Fetch(err.to_string()))?;
        let snapshot = parse_snapshot(&body).map_err(|err| ProductError::Decode(err.to_string()))?;

        info!(url, products = snapshot.len(), "refreshed product catalog");
        self.writer.publish(snapshot);
        if let Some(etag) = etag {
            *self.etag.lock().expect("etag mutex poisoned") = Some(etag);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::MockServer;

    #[tokio::test]
    async fn refresh_rate_floor_is_enforced() {
        let err = ProductConfig::new("http://example.com", Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, ProductError::RefreshRateTooLow { .. }));
    }

    #[tokio::test]
    async fn poll_publishes_snapshot_and_sends_etag_on_next_request() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(httpmock::Method::GET).path("/products");
            then.status(200)
                .header("ETag", "v1")
                .json_body(serde_json::json!({ "apiProduct": [{ "name": "p" }] }));
        });

        let config = ProductConfig::new(server.base_url(), MIN_REFRESH_RATE).unwrap();
        let (poller, reader) = ProductPoller::new(config, Client::new());
        poller.poll_once().await.unwrap();
        mock.assert_hits(1);
        assert_eq!(reader.get().len(), 1);

        let not_modified = server.mock(|when, then| {
            when.method(httpmock::Method::GET)
                .path("/products")
                .header("If-None-Match", "v1");
            then.status(304);
        });
        poller.poll_once().await.unwrap();
        not_modified.assert_hits(1);
    }
}
