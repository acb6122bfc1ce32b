//! Moves a closed bucket file from `temp/<tenant>/` to `staging/<tenant>/`
//! and hands it to the upload reservoir. Grounded on
//! `runtime_util::reservoir` for the bounded work queue described in
//! §4.9: the reservoir's limit caps how many files sit in staging at
//! once, and its overflow side is how the cap is enforced without ever
//! blocking a producer.

use std::path::PathBuf;

use tracing::warn;

use runtime_util::harden_dir;
use runtime_util::reservoir::{reservoir, OverflowReceiver, ReservoirReceiver, ReservoirSender};

use crate::bucket::StagedFile;

#[derive(Clone)]
pub struct Stager {
    staging_dir: PathBuf,
    sender: ReservoirSender<StagedFile>,
}

impl Stager {
    /// `limit` is `max(stagingFileLimit - numUploaders, 1)`, per §4.9.
    pub fn new(staging_dir: PathBuf, limit: usize) -> (Self, ReservoirReceiver<StagedFile>) {
        let (sender, receiver, overflow) = reservoir(limit);
        tokio::spawn(drain_overflow(overflow));
        (Self { staging_dir, sender }, receiver)
    }

    /// Renames the file into `staging/<tenant>/<basename>` and enqueues it
    /// for upload. Failures are logged; the file is left in `temp/` for a
    /// future crash-recovery scan to pick up.
    pub async fn stage(&self, file: StagedFile) {
        let tenant_dir = self.staging_dir.join(&file.tenant);
        if let Err(err) = tokio::fs::create_dir_all(&tenant_dir).await {
            warn!(tenant = %file.tenant, error = %err, "failed to create staging dir");
            return;
        }
        harden_dir(&tenant_dir);

        let Some(name) = file.path.file_name().map(|n| n.to_owned()) else {
            warn!(path = %file.path.display(), "staged file has no basename");
            return;
        };
        let dest = tenant_dir.join(&name);

        if let Err(err) = tokio::fs::rename(&file.path, &dest).await {
            warn!(tenant = %file.tenant, error = %err, "failed to move file into staging");
            return;
        }

        self.sender.send(StagedFile { path: dest, ..file });
    }

    /// Enqueues an already-staged file, used by crash recovery to pick up
    /// files left over from a previous run.
    pub fn enqueue_existing(&self, file: StagedFile) {
        self.sender.send(file);
    }

    /// Closes the upload reservoir: already-queued files still drain to
    /// the uploader pool, but no more are accepted after this.
    pub fn close(&self) {
        self.sender.close();
    }
}

/// Every overflowed file is deleted without being uploaded: this is the
/// staging cap in effect, not a failure.
async fn drain_overflow(overflow: OverflowReceiver<StagedFile>) {
    while let Some(file) = overflow.recv().await {
        warn!(tenant = %file.tenant, path = %file.path.display(), "staging cap exceeded, dropping file");
        let _ = tokio::fs::remove_file(&file.path).await;
    }
}
