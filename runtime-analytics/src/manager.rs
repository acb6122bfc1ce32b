//! Analytics manager: tenant bucket registry, collection ticker, staging,
//! and the upload worker pool, composed per §4.9. Grounded on
//! `integration-gateway/src/usage.rs`'s `UsageTracker`, whose
//! `spawn_background_tasks` drives a periodic flush the same way this
//! manager's collection loop drains and restarts the tenant registry.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use runtime_util::reservoir::ReservoirReceiver;

use crate::bucket::{AnalyticsBucket, StagedFile};
use crate::format::LineFormat;
use crate::record::Record;
use crate::staging::Stager;
use crate::upload::Uploader;

#[derive(Clone)]
pub struct AnalyticsConfig {
    pub buffer_path: PathBuf,
    pub staging_file_limit: usize,
    pub num_uploaders: usize,
    pub send_channel_size: usize,
    pub collection_interval: Duration,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            buffer_path: PathBuf::from("."),
            staging_file_limit: 64,
            num_uploaders: 4,
            send_channel_size: 256,
            collection_interval: Duration::from_secs(120),
        }
    }
}

impl AnalyticsConfig {
    fn temp_dir(&self) -> PathBuf {
        self.buffer_path.join("temp")
    }

    fn staging_dir(&self) -> PathBuf {
        self.buffer_path.join("staging")
    }

    /// `max(stagingFileLimit - numUploaders, 1)`.
    fn reservoir_limit(&self) -> usize {
        self.staging_file_limit.saturating_sub(self.num_uploaders).max(1)
    }
}

pub struct AnalyticsManager {
    config: AnalyticsConfig,
    format: Arc<dyn LineFormat>,
    buckets: RwLock<HashMap<String, AnalyticsBucket>>,
    staged_tx: mpsc::UnboundedSender<StagedFile>,
    staged_rx: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<StagedFile>>>,
    stager: Stager,
    upload_rx: tokio::sync::Mutex<Option<ReservoirReceiver<StagedFile>>>,
    uploader: Arc<dyn Uploader>,
}

impl AnalyticsManager {
    pub fn new(config: AnalyticsConfig, format: Arc<dyn LineFormat>, uploader: Arc<dyn Uploader>) -> Arc<Self> {
        let (staged_tx, staged_rx) = mpsc::unbounded_channel();
        let (stager, upload_rx) = Stager::new(config.staging_dir(), config.reservoir_limit());
        Arc::new(Self {
            config,
            format,
            buckets: RwLock::new(HashMap::new()),
            staged_tx,
            staged_rx: tokio::sync::Mutex::new(Some(staged_rx)),
            stager,
            upload_rx: tokio::sync::Mutex::new(Some(upload_rx)),
            uploader,
        })
    }

    /// Enqueues a batch of records for `tenant`, creating its bucket if
    /// this is the first record seen for it.
    /// Validates every record against §3/§8's rules and drops the ones
    /// that fail before handing the rest to the tenant's bucket.
    pub async fn send(&self, tenant: &str, batch: Vec<Record>) {
        let now = chrono::Utc::now();
        let batch: Vec<Record> = batch
            .into_iter()
            .filter(|record| match record.validate(now) {
                Ok(()) => true,
                Err(errors) => {
                    warn!(tenant = %tenant, error = %errors, "dropping invalid analytics record");
                    false
                }
            })
            .collect();
        if batch.is_empty() {
            return;
        }

        {
            let guard = self.buckets.read().await;
            if let Some(bucket) = guard.get(tenant) {
                bucket.send(batch);
                return;
            }
        }
        let mut guard = self.buckets.write().await;
        if let Some(bucket) = guard.get(tenant) {
            bucket.send(batch);
            return;
        }
        let bucket = AnalyticsBucket::spawn(
            tenant.to_string(),
            self.config.temp_dir().join(tenant),
            self.format.clone(),
            self.config.send_channel_size,
            self.staged_tx.clone(),
        );
        bucket.send(batch);
        guard.insert(tenant.to_string(), bucket);
    }

    /// Spawns the staging drain, collection ticker, and upload worker
    /// pool, and performs crash recovery over `temp/`/`staging/`. Returns
    /// join handles the caller awaits after cancelling.
    pub async fn start(self: &Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        self.recover_crash_state().await;

        let mut handles = Vec::new();

        let staging_manager = self.clone();
        let staging_cancel = cancel.clone();
        let staged_rx = {
            let mut guard = self.staged_rx.lock().await;
            guard.take().expect("analytics manager started twice")
        };
        handles.push(tokio::spawn(run_staging_drain(staging_manager, staged_rx, staging_cancel)));

        let collection_manager = self.clone();
        let collection_cancel = cancel.clone();
        handles.push(tokio::spawn(run_collection_loop(collection_manager, collection_cancel)));

        let upload_rx = {
            let mut guard = self.upload_rx.lock().await;
            guard.take().expect("analytics manager started twice")
        };
        let upload_rx = Arc::new(upload_rx);
        for _ in 0..self.config.num_uploaders.max(1) {
            let manager = self.clone();
            let rx = upload_rx.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(run_upload_worker(manager, rx, cancel)));
        }

        handles
    }

    /// Atomically swaps the tenant registry for an empty one and closes
    /// every drained bucket, each of which stages itself on close.
    async fn collect(&self) {
        let drained = {
            let mut guard = self.buckets.write().await;
            std::mem::take(&mut *guard)
        };
        for (_, bucket) in drained {
            bucket.close().await;
        }
    }

    async fn recover_crash_state(&self) {
        recover_temp(&self.config.temp_dir(), &self.stager).await;
        recover_staging(&self.config.staging_dir(), &self.stager, self.format.clone()).await;
    }

    /// Drains every bucket and stages its file; used by `close()`.
    async fn drain_all(&self) {
        self.collect().await;
    }

    /// Final swap-and-stage of whatever every bucket still holds, then
    /// closes the upload reservoir so worker pool drains the rest of the
    /// queue and returns. Call after cancelling the collection/staging
    /// loops and before awaiting their join handles, per §4.9's `Close`.
    pub async fn close(&self) {
        self.drain_all().await;
        self.stager.close();
    }
}

async fn run_staging_drain(
    manager: Arc<AnalyticsManager>,
    mut staged_rx: mpsc::UnboundedReceiver<StagedFile>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            next = staged_rx.recv() => match next {
                Some(file) => manager.stager.stage(file).await,
                None => return,
            },
        }
    }
}

async fn run_collection_loop(manager: Arc<AnalyticsManager>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(manager.config.collection_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => manager.collect().await,
        }
    }
}

async fn run_upload_worker(
    manager: Arc<AnalyticsManager>,
    rx: Arc<ReservoirReceiver<StagedFile>>,
    cancel: CancellationToken,
) {
    loop {
        let file = tokio::select! {
            _ = cancel.cancelled() => return,
            next = rx.recv() => match next {
                Some(file) => file,
                None => return,
            },
        };
        match manager.uploader.upload(&file.tenant, &file.path).await {
            Ok(()) => {
                if let Err(err) = tokio::fs::remove_file(&file.path).await {
                    warn!(tenant = %file.tenant, error = %err, "uploaded file could not be removed from staging");
                }
            }
            Err(err) => {
                warn!(tenant = %file.tenant, error = %err, "analytics upload failed, leaving file staged for retry");
            }
        }
    }
}

/// Non-empty leftovers in `temp/<tenant>/` from a previous crash are
/// moved straight to staging; empty files (never closed, never written
/// to) are discarded.
async fn recover_temp(temp_dir: &Path, stager: &Stager) {
    let Ok(mut tenants) = tokio::fs::read_dir(temp_dir).await else { return };
    while let Ok(Some(tenant_entry)) = tenants.next_entry().await {
        let tenant_path = tenant_entry.path();
        if !tenant_path.is_dir() {
            continue;
        }
        let tenant = tenant_path.file_name().and_then(|n| n.to_str()).unwrap_or_default().to_string();
        let Ok(mut files) = tokio::fs::read_dir(&tenant_path).await else { continue };
        while let Ok(Some(file_entry)) = files.next_entry().await {
            let path = file_entry.path();
            let Ok(metadata) = file_entry.metadata().await else { continue };
            if metadata.len() == 0 {
                let _ = tokio::fs::remove_file(&path).await;
                continue;
            }
            info!(tenant = %tenant, path = %path.display(), "recovering leftover temp file from a previous run");
            let format = format_for_extension(&path);
            stager
                .stage(StagedFile { tenant: tenant.clone(), path, record_count: 0, format })
                .await;
        }
    }
}

/// Files already in `staging/` were staged but never confirmed uploaded;
/// re-enqueue them directly onto the upload reservoir.
async fn recover_staging(staging_dir: &Path, stager: &Stager, default_format: Arc<dyn LineFormat>) {
    let Ok(mut tenants) = tokio::fs::read_dir(staging_dir).await else { return };
    while let Ok(Some(tenant_entry)) = tenants.next_entry().await {
        let tenant_path = tenant_entry.path();
        if !tenant_path.is_dir() {
            continue;
        }
        let tenant = tenant_path.file_name().and_then(|n| n.to_str()).unwrap_or_default().to_string();
        let Ok(mut files) = tokio::fs::read_dir(&tenant_path).await else { continue };
        while let Ok(Some(file_entry)) = files.next_entry().await {
            let path = file_entry.path();
            info!(tenant = %tenant, path = %path.display(), "re-enqueuing staged file from a previous run");
            stager.enqueue_existing(StagedFile {
                tenant: tenant.clone(),
                path,
                record_count: 0,
                format: default_format.clone(),
            });
        }
    }
}

fn format_for_extension(path: &Path) -> Arc<dyn LineFormat> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("txt") => Arc::new(crate::format::FluentdFormat),
        _ => Arc::new(crate::format::SaasFormat),
    }
}
