//! Facade crate: assembles JWT verification, product authorization,
//! quota management, and analytics behind one entry point a gateway
//! filter constructs once at startup, mirroring the teacher's `AppState`
//! composition (`integration-gateway/src/app_state.rs`) minus its
//! axum-specific fields.

pub mod config;
pub mod error;

pub use config::{ProductSettings, RuntimeConfig, UploadTarget};
pub use error::{RuntimeError, RuntimeResult};

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use runtime_analytics::{AnalyticsManager, FluentdFormat, FluentdUploader, GcpUploader, LineFormat, Record, SaasFormat, SaasUploader, Uploader};
use runtime_auth::{AuthResult, Claims, JwtVerifier, Provider};
use runtime_product::{AuthContext, AuthorizedOperation, ProductAuthorizer, ProductConfig, ProductPoller};
use runtime_quota::{QuotaManager, QuotaOutcome};

/// Everything a sidecar filter needs per request: verify the token,
/// authorize the operation, apply quota, and record analytics.
pub struct SidecarRuntime {
    pub jwt: Arc<JwtVerifier>,
    pub products: ProductAuthorizer,
    pub quota: Arc<QuotaManager>,
    pub analytics: Arc<AnalyticsManager>,
    poller: std::sync::Mutex<Option<ProductPoller>>,
}

impl SidecarRuntime {
    pub fn new(config: RuntimeConfig) -> RuntimeResult<Self> {
        let jwt = Arc::new(JwtVerifier::with_client(config.jwt, config.http_client.clone()));

        let product_config = ProductConfig::new(config.product.base_url, config.product.refresh_rate)?;
        let (poller, reader) = ProductPoller::new(product_config, config.http_client.clone());
        let products = ProductAuthorizer::new(reader);

        let quota = QuotaManager::new(config.quota, config.http_client.clone());

        let (format, uploader): (Arc<dyn LineFormat>, Arc<dyn Uploader>) = match config.upload_target {
            UploadTarget::Legacy { base_url } => (
                Arc::new(SaasFormat),
                Arc::new(SaasUploader { client: config.http_client.clone(), base_url }),
            ),
            UploadTarget::Gcp { base_url } => (
                Arc::new(SaasFormat),
                Arc::new(GcpUploader { client: config.http_client.clone(), base_url }),
            ),
            UploadTarget::Fluentd { addr, tls } => {
                let uploader = match tls {
                    Some(tls) => FluentdUploader::with_tls(addr, &tls).map_err(|e| RuntimeError::Config(e.to_string()))?,
                    None => FluentdUploader::new(addr),
                };
                (Arc::new(FluentdFormat), Arc::new(uploader))
            }
        };
        let analytics = AnalyticsManager::new(config.analytics, format, uploader);

        Ok(Self { jwt, products, quota, analytics, poller: std::sync::Mutex::new(Some(poller)) })
    }

    /// Starts every background loop: the product catalog poller, JWKS
    /// refresh/eviction, quota sync workers and GC scan, and the
    /// analytics staging/collection/upload pipeline.
    pub async fn start(&self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        self.jwt.start(cancel.clone());

        let mut handles = self.quota.start(cancel.clone());
        handles.extend(self.analytics.start(cancel.clone()).await);

        let poller = self.poller.lock().expect("poller mutex poisoned").take();
        if let Some(poller) = poller {
            handles.push(poller.spawn(cancel));
        }

        handles
    }

    /// Stops every background loop and drains outstanding work. The
    /// analytics pipeline gets a final swap-and-stage and its upload
    /// reservoir closed first, so its worker pool empties the queue
    /// before exiting on its own; everything else (collection ticker,
    /// quota sync, JWKS refresh, product poller) is then stopped via
    /// `cancel`, and every handle `start` returned is awaited.
    pub async fn close(&self, cancel: CancellationToken, handles: Vec<JoinHandle<()>>) {
        self.analytics.close().await;
        cancel.cancel();
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Verifies `token` against the provider registered for `jwks_url`.
    pub async fn verify(&self, jwks_url: &str, token: &str) -> AuthResult<Claims> {
        let provider = self.jwt.provider(jwks_url).cloned().unwrap_or_else(|| Provider::new(jwks_url, std::time::Duration::from_secs(600)));
        self.jwt.parse(token, &provider).await
    }

    /// Authorizes a request and returns every operation it's entitled to.
    pub fn authorize(&self, ctx: &AuthContext, target_api: &str, path: &str, method: &str) -> Vec<AuthorizedOperation> {
        self.products.authorize(ctx, target_api, path, method)
    }

    /// Applies quota for one authorized operation; `None` when the
    /// operation carries no quota to enforce.
    pub async fn apply_quota(&self, op: &AuthorizedOperation, weight: i64, dedup_id: Option<&str>) -> Option<QuotaOutcome> {
        self.quota.apply(op, weight, dedup_id).await
    }

    /// Enqueues an analytics record for its tenant (`org~env`) bucket.
    pub async fn record(&self, record: Record) {
        let tenant = record.tenant();
        self.analytics.send(&tenant, vec![record]).await;
    }
}
