//! Per-URL keyset cache with single-flight fetch and a background
//! refresher, per the verifier's JWKS-cache component.
//!
//! Grounded on `runtime_util::looper` for the periodic refresh and on the
//! single-flight-per-key shape used by `runtime_util::lru_cache`'s
//! expiring entries; the in-flight-guard map itself has no teacher
//! equivalent and is new.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use jsonwebtoken::DecodingKey;
use reqwest::Client;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use runtime_util::looper::{BackoffPolicy, Looper};
use runtime_util::lru_cache::ExpiringLru;

use crate::config::Provider;
use crate::error::AuthError;
use crate::jwks::JwksFetcher;

pub type Keyset = Arc<Vec<(String, DecodingKey)>>;
type CacheEntry = Result<Keyset, AuthError>;

/// Never expires an entry on its own; replaced only by explicit refresh.
const ENTRY_TTL: Duration = Duration::from_secs(24 * 60 * 60);

pub struct JwksCache {
    client: Client,
    cache: ExpiringLru<String, CacheEntry>,
    inflight: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl JwksCache {
    pub fn new(client: Client, capacity: usize) -> Self {
        Self {
            client,
            cache: ExpiringLru::new(capacity, ENTRY_TTL),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    fn inflight_guard(&self, url: &str) -> Arc<AsyncMutex<()>> {
        let mut guards = self.inflight.lock().expect("jwks inflight mutex poisoned");
        guards
            .entry(url.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Returns the cached keyset (or cached error) for `url`, fetching it
    /// exactly once across any concurrently-racing callers.
    pub async fn get(&self, url: &str) -> CacheEntry {
        if let Some(entry) = self.cache.get(&url.to_string()) {
            return entry;
        }

        let guard = self.inflight_guard(url);
        let _permit = guard.lock().await;

        if let Some(entry) = self.cache.get(&url.to_string()) {
            return entry;
        }

        let result = self.fetch(url).await;
        self.cache.set(url.to_string(), result.clone());
        result
    }

    async fn fetch(&self, url: &str) -> CacheEntry {
        let fetcher = JwksFetcher::with_client(self.client.clone(), url);
        match fetcher.fetch().await {
            Ok(keys) => {
                debug!(url, count = keys.len(), "fetched JWKS");
                Ok(Arc::new(keys))
            }
            Err(err) => {
                warn!(url, error = %err, "JWKS fetch failed");
                Err(err)
            }
        }
    }

    /// Forces a refresh of `url`'s entry. A successful fetch always
    /// replaces the cached entry; a failed one only replaces an existing
    /// *error* entry, so a transient outage never evicts a keyset that is
    /// still good.
    pub async fn refresh(&self, url: &str) {
        let result = self.fetch(url).await;
        if result.is_ok() || self.cache.get(&url.to_string()).map(|e| e.is_err()).unwrap_or(true) {
            self.cache.set(url.to_string(), result);
        }
    }

    /// Spawns a looper that refreshes every provider's keyset at
    /// `interval` until `cancel` fires.
    pub fn spawn_refresh_loop(
        self: Arc<Self>,
        providers: Vec<Provider>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        Looper::spawn(
            interval,
            BackoffPolicy::default(),
            cancel,
            move || {
                let this = self.clone();
                let providers = providers.clone();
                async move {
                    for provider in &providers {
                        this.refresh(&provider.jwks_url).await;
                    }
                    Ok::<(), AuthError>(())
                }
            },
            |_err: &AuthError| false,
        )
    }
}
