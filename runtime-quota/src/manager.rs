//! Quota manager: bucket registry, sync-worker pool, periodic
//! resync/garbage-collection scheduler. Grounded on
//! `integration-gateway/src/usage.rs`'s `UsageTracker` split between a
//! synchronous foreground call (`record_api_key_use`) and ticker-driven
//! background flush tasks (`spawn_background_tasks`), generalized here to
//! a worker pool draining a bounded-dedup sync queue instead of two fixed
//! tickers.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use reqwest::Client;
use tokio::sync::{mpsc, Mutex as AsyncMutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use runtime_product::{AuthorizedOperation, Quota};
use runtime_util::looper::{BackoffPolicy, Looper};
use runtime_util::lru_cache::ExpiringLru;

use crate::bucket::{QuotaBucket, QuotaOutcome, RequestTemplate};
use crate::error::QuotaError;

#[derive(Debug, Clone)]
pub struct QuotaConfig {
    pub base_url: String,
    pub num_sync_workers: usize,
    /// How often the scheduler scans the registry for buckets that
    /// `needToSync`.
    pub sync_rate: Duration,
    /// A synced bucket is re-enqueued once this much time has passed with
    /// no local activity, so the remote service's view doesn't go stale.
    pub refresh_after: ChronoDuration,
    /// Idle buckets (no pending weight) older than this are GC'd.
    pub delete_after: ChronoDuration,
    pub dedup_capacity: usize,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            num_sync_workers: 4,
            sync_rate: Duration::from_secs(1),
            refresh_after: ChronoDuration::seconds(30),
            delete_after: ChronoDuration::minutes(5),
            dedup_capacity: 10_000,
        }
    }
}

type DedupKey = (String, String);

pub struct QuotaManager {
    config: QuotaConfig,
    client: Client,
    registry: Arc<RwLock<HashMap<String, Arc<QuotaBucket>>>>,
    dedup: ExpiringLru<DedupKey, QuotaOutcome>,
    queue_tx: mpsc::UnboundedSender<String>,
    queue_rx: AsyncMutex<Option<mpsc::UnboundedReceiver<String>>>,
    inflight: StdMutex<HashSet<String>>,
}

impl QuotaManager {
    pub fn new(config: QuotaConfig, client: Client) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let dedup = ExpiringLru::new(config.dedup_capacity, Duration::from_secs(300));
        Arc::new(Self {
            config,
            client,
            registry: Arc::new(RwLock::new(HashMap::new())),
            dedup,
            queue_tx,
            queue_rx: AsyncMutex::new(Some(queue_rx)),
            inflight: StdMutex::new(HashSet::new()),
        })
    }

    /// `Apply(authContext, authorizedOp, args)`, §4.8. Returns `None` when
    /// the operation carries no quota (nothing to enforce).
    pub async fn apply(
        &self,
        op: &AuthorizedOperation,
        weight: i64,
        dedup_id: Option<&str>,
    ) -> Option<QuotaOutcome> {
        let quota = op.quota?;

        if let Some(dedup_id) = dedup_id {
            let key = (op.id.clone(), dedup_id.to_string());
            if let Some(cached) = self.dedup.get(&key) {
                return Some(cached);
            }
            let outcome = self.apply_to_bucket(&op.id, quota, weight).await;
            self.dedup.set(key, outcome);
            Some(outcome)
        } else {
            Some(self.apply_to_bucket(&op.id, quota, weight).await)
        }
    }

    async fn apply_to_bucket(&self, quota_id: &str, quota: Quota, weight: i64) -> QuotaOutcome {
        let template = RequestTemplate::from_quota(quota_id, quota);
        let bucket = self.get_or_create_bucket(quota_id, &template).await;
        let outcome = bucket.apply(weight);
        self.enqueue_sync(quota_id);
        outcome
    }

    async fn get_or_create_bucket(&self, quota_id: &str, template: &RequestTemplate) -> Arc<QuotaBucket> {
        {
            let guard = self.registry.read().await;
            if let Some(bucket) = guard.get(quota_id) {
                if bucket.is_compatible(template) {
                    return bucket.clone();
                }
            }
        }
        let mut guard = self.registry.write().await;
        if let Some(bucket) = guard.get(quota_id) {
            if bucket.is_compatible(template) {
                return bucket.clone();
            }
        }
        let bucket = Arc::new(QuotaBucket::new(template.clone()));
        guard.insert(quota_id.to_string(), bucket.clone());
        bucket
    }

    fn enqueue_sync(&self, quota_id: &str) {
        let mut inflight = self.inflight.lock().expect("quota inflight mutex poisoned");
        if inflight.insert(quota_id.to_string()) {
            let _ = self.queue_tx.send(quota_id.to_string());
        }
    }

    /// Spawns the sync-worker pool and the scan/GC scheduler. Join
    /// handles are returned so the caller can await them after
    /// cancelling.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();

        let receiver = {
            let mut guard = self
                .queue_rx
                .try_lock()
                .expect("quota manager queue receiver already taken");
            guard.take().expect("quota manager started twice")
        };
        let receiver = Arc::new(AsyncMutex::new(receiver));

        for _ in 0..self.config.num_sync_workers.max(1) {
            let manager = self.clone();
            let receiver = receiver.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let id = {
                        let mut rx = receiver.lock().await;
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            next = rx.recv() => match next {
                                Some(id) => id,
                                None => return,
                            },
                        }
                    };
                    manager.inflight.lock().expect("quota inflight mutex poisoned").remove(&id);
                    let bucket = manager.registry.read().await.get(&id).cloned();
                    if let Some(bucket) = bucket {
                        if let Err(err) = bucket.sync(&manager.client, &manager.config.base_url).await {
                            warn!(quota_id = %id, error = %err, "quota sync failed");
                        }
                    }
                }
            }));
        }

        let scheduler = self.clone();
        handles.push(Looper::spawn(
            self.config.sync_rate,
            BackoffPolicy::default(),
            cancel,
            move || {
                let scheduler = scheduler.clone();
                async move {
                    scheduler.scan_and_schedule().await;
                    Ok::<(), QuotaError>(())
                }
            },
            |_err: &QuotaError| false,
        ));

        handles
    }

    async fn scan_and_schedule(&self) {
        let due: Vec<String> = {
            let guard = self.registry.read().await;
            guard
                .iter()
                .filter(|(_, bucket)| bucket.needs_sync(self.config.refresh_after))
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in due {
            self.enqueue_sync(&id);
        }

        let idle: Vec<String> = {
            let guard = self.registry.read().await;
            guard
                .iter()
                .filter(|(_, bucket)| bucket.is_idle(self.config.delete_after))
                .map(|(id, _)| id.clone())
                .collect()
        };
        if !idle.is_empty() {
            let mut guard = self.registry.write().await;
            for id in idle {
                guard.remove(&id);
            }
        }
    }

    pub async fn bucket_count(&self) -> usize {
        self.registry.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runtime_product::{Quota, TimeUnit};

    fn op_with_quota(id: &str, limit: i64) -> AuthorizedOperation {
        AuthorizedOperation {
            id: id.to_string(),
            product_name: "p".to_string(),
            environment: "test".to_string(),
            application: "app".to_string(),
            operation_config_hash: None,
            quota: Some(Quota {
                limit,
                interval: 1,
                time_unit: TimeUnit::Minute,
            }),
        }
    }

    #[tokio::test]
    async fn apply_without_quota_is_a_no_op() {
        let manager = QuotaManager::new(QuotaConfig::default(), Client::new());
        let op = AuthorizedOperation {
            id: "p~test~app".to_string(),
            product_name: "p".to_string(),
            environment: "test".to_string(),
            application: "app".to_string(),
            operation_config_hash: None,
            quota: None,
        };
        assert!(manager.apply(&op, 1, None).await.is_none());
        assert_eq!(manager.bucket_count().await, 0);
    }

    #[tokio::test]
    async fn dedup_id_returns_cached_result_without_recounting() {
        let manager = QuotaManager::new(QuotaConfig::default(), Client::new());
        let op = op_with_quota("p~test~app", 5);

        let first = manager.apply(&op, 3, Some("req-1")).await.unwrap();
        let second = manager.apply(&op, 3, Some("req-1")).await.unwrap();
        assert_eq!(first.used, second.used);

        let third = manager.apply(&op, 3, Some("req-2")).await.unwrap();
        assert_eq!(third.used, 5);
        assert_eq!(third.exceeded, 1);
    }

    #[tokio::test]
    async fn exceeding_allow_caps_used_and_reports_exceeded() {
        let manager = QuotaManager::new(QuotaConfig::default(), Client::new());
        let op = op_with_quota("p~test~app", 5);

        manager.apply(&op, 4, None).await.unwrap();
        let outcome = manager.apply(&op, 4, None).await.unwrap();
        assert_eq!(outcome.used, 5);
        assert_eq!(outcome.exceeded, 3);
        assert_eq!(manager.bucket_count().await, 1);
    }
}
