//! Per-tenant append file: an unbounded channel of record batches drained
//! by a dedicated blocking writer task, so gzip/file I/O never runs on an
//! async worker thread or under a shared mutex. Grounded on the
//! channel-plus-background-writer shape the teacher uses for its audit
//! trail producer, generalized to a tenant-keyed temp file instead of a
//! single append-only log.

use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use flate2::write::GzEncoder;
use flate2::Compression;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use runtime_util::harden_dir;
use tracing::warn;

use crate::format::LineFormat;
use crate::record::Record;

/// A temp file handed off once its writer closes, ready for staging.
pub struct StagedFile {
    pub tenant: String,
    pub path: PathBuf,
    pub record_count: usize,
    pub format: Arc<dyn LineFormat>,
}

pub struct AnalyticsBucket {
    tenant: String,
    tx: mpsc::Sender<Vec<Record>>,
    writer: JoinHandle<()>,
}

impl AnalyticsBucket {
    /// `channel_size` is the configured `SendChannelSize`: once the
    /// writer falls behind by that many queued batches, new batches are
    /// dropped rather than applying backpressure to the caller.
    pub fn spawn(
        tenant: String,
        temp_dir: PathBuf,
        format: Arc<dyn LineFormat>,
        channel_size: usize,
        staged_tx: mpsc::UnboundedSender<StagedFile>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(channel_size.max(1));
        let writer_tenant = tenant.clone();
        let writer = tokio::task::spawn_blocking(move || {
            run_writer(writer_tenant, temp_dir, format, rx, staged_tx);
        });
        Self { tenant, tx, writer }
    }

    /// Enqueues a batch of records for writing. Never blocks; drops and
    /// logs if the writer's queue is full.
    pub fn send(&self, batch: Vec<Record>) -> bool {
        match self.tx.try_send(batch) {
            Ok(()) => true,
            Err(err) => {
                warn!(tenant = %self.tenant, "analytics bucket queue full, dropping batch");
                !matches!(err, mpsc::error::TrySendError::Closed(_))
            }
        }
    }

    /// Drops the sending half so the writer drains and closes, then waits
    /// for it to finish and hand the file off to staging.
    pub async fn close(self) {
        drop(self.tx);
        let _ = self.writer.await;
    }
}

fn run_writer(
    tenant: String,
    temp_dir: PathBuf,
    format: Arc<dyn LineFormat>,
    mut rx: mpsc::Receiver<Vec<Record>>,
    staged_tx: mpsc::UnboundedSender<StagedFile>,
) {
    if let Err(err) = std::fs::create_dir_all(&temp_dir) {
        warn!(tenant = %tenant, error = %err, "failed to create analytics temp dir");
        return;
    }
    harden_dir(&temp_dir);

    let unix_secs = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
    let random = uuid::Uuid::new_v4().simple().to_string();
    let filename = format!("{unix_secs}-{random}.{}", format.file_extension());
    let path = temp_dir.join(&filename);

    let file = match std::fs::File::create(&path) {
        Ok(f) => f,
        Err(err) => {
            warn!(tenant = %tenant, path = %path.display(), error = %err, "failed to create analytics temp file");
            return;
        }
    };

    let mut sink: Box<dyn Write> = if format.uses_gzip() {
        Box::new(GzEncoder::new(file, Compression::default()))
    } else {
        Box::new(BufWriter::new(file))
    };

    let mut count = 0usize;
    while let Some(batch) = rx.blocking_recv() {
        for record in &batch {
            if let Err(err) = format.write_record(record, &mut sink) {
                warn!(tenant = %tenant, error = %err, "failed to write analytics record");
            } else {
                count += 1;
            }
        }
    }

    if let Err(err) = sink.flush() {
        warn!(tenant = %tenant, error = %err, "failed to flush analytics temp file");
    }
    drop(sink);

    if count == 0 {
        let _ = std::fs::remove_file(&path);
        return;
    }

    let _ = staged_tx.send(StagedFile { tenant, path, record_count: count, format });
}
