use std::time::Duration;

/// One upstream token issuer: where to fetch its keyset and how often.
#[derive(Debug, Clone)]
pub struct Provider {
    /// `JWKS` endpoint (`GET <remoteServiceAPI>/certs`).
    pub jwks_url: String,
    /// Caller's preferred refresh interval; the cache enforces a floor of
    /// [`MIN_ALLOWED_REFRESH`].
    pub refresh: Duration,
}

impl Provider {
    pub fn new(jwks_url: impl Into<String>, refresh: Duration) -> Self {
        Self {
            jwks_url: jwks_url.into(),
            refresh,
        }
    }
}

/// The slowest refresh rate the JWKS cache will ever use, regardless of how
/// aggressively a provider asks to be polled.
pub const MIN_ALLOWED_REFRESH: Duration = Duration::from_secs(600);

/// Runtime configuration for JWT verification.
#[derive(Debug, Clone)]
pub struct JwtConfig {
    pub providers: Vec<Provider>,
    /// Default claims-cache TTL when `exp` is absent or would exceed it.
    pub cache_ttl: Duration,
    /// How often the good/bad LRUs sweep for expired entries.
    pub cache_eviction_interval: Duration,
    /// Capacity of the good-claims and known-bad LRUs.
    pub max_cached_entries: usize,
    /// TTL applied to entries in the known-bad cache.
    pub known_bad_ttl: Duration,
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            providers: Vec::new(),
            cache_ttl: Duration::from_secs(30 * 60),
            cache_eviction_interval: Duration::from_secs(10),
            max_cached_entries: 10_000,
            known_bad_ttl: Duration::from_secs(30),
        }
    }
}

impl JwtConfig {
    pub fn new(providers: Vec<Provider>) -> Self {
        Self {
            providers,
            ..Self::default()
        }
    }

    /// The refresh rate the JWKS cache should actually run at: the fastest
    /// of the configured providers, floored at [`MIN_ALLOWED_REFRESH`].
    pub fn effective_refresh(&self) -> Duration {
        self.providers
            .iter()
            .map(|p| p.refresh)
            .min()
            .unwrap_or(MIN_ALLOWED_REFRESH)
            .max(MIN_ALLOWED_REFRESH)
    }

    pub fn provider_for(&self, jwks_url: &str) -> Option<&Provider> {
        self.providers.iter().find(|p| p.jwks_url == jwks_url)
    }
}
