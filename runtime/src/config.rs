//! Top-level configuration a gateway filter assembles once at startup,
//! bundling each component's own config struct. Mirrors the nesting the
//! teacher's `GatewayConfig` uses to group unrelated concerns (rate
//! limiting, usage flushing, alerting) under one type.

use std::time::Duration;

use reqwest::Client;
use runtime_analytics::{AnalyticsConfig, FluentdTlsConfig};
use runtime_auth::JwtConfig;
use runtime_quota::QuotaConfig;

#[derive(Debug, Clone)]
pub struct ProductSettings {
    pub base_url: String,
    pub refresh_rate: Duration,
}

/// Which analytics submission path to wire up, per §6's `LegacyEndpoint`
/// / `FluentdEndpoint` configuration switch.
#[derive(Debug, Clone)]
pub enum UploadTarget {
    /// Apigee SaaS legacy signed-URL upload (S3-backed, AES256 SSE).
    Legacy { base_url: String },
    /// Apigee hybrid/GCP signed-URL upload.
    Gcp { base_url: String },
    /// Direct fluentd forwarding over TCP, optionally wrapped in TLS/mTLS
    /// per §6's `TLSSkipVerify`/`TLSCAFile`/`TLSCertFile`/`TLSKeyFile`.
    Fluentd { addr: String, tls: Option<FluentdTlsConfig> },
}

#[derive(Clone)]
pub struct RuntimeConfig {
    pub jwt: JwtConfig,
    pub product: ProductSettings,
    pub quota: QuotaConfig,
    pub analytics: AnalyticsConfig,
    pub upload_target: UploadTarget,
    pub http_client: Client,
}
