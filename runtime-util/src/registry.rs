//! A single-writer, many-reader immutable snapshot holder.
//!
//! Grounded on the `Arc<RwLock<HashMap<..>>>` composition in
//! `integration-gateway/src/app_state.rs`, but modeled the way the spec's
//! registry-swap design note asks for: readers never block the writer and
//! a read returns the current snapshot without copying it. `tokio::sync
//! ::watch` already gives us exactly that contract, so this is a thin,
//! typed wrapper rather than a hand-rolled actor.

use std::sync::Arc;

use tokio::sync::watch;

pub struct RegistryWriter<T> {
    tx: watch::Sender<Arc<T>>,
}

pub struct RegistryReader<T> {
    rx: watch::Receiver<Arc<T>>,
}

/// Creates a registry seeded with `initial`.
pub fn registry<T>(initial: T) -> (RegistryWriter<T>, RegistryReader<T>) {
    let (tx, rx) = watch::channel(Arc::new(initial));
    (RegistryWriter { tx }, RegistryReader { rx })
}

impl<T> RegistryWriter<T> {
    /// Publishes a new snapshot, atomically replacing the one readers see.
    pub fn publish(&self, value: T) {
        // A send error means every reader has been dropped; nothing to do.
        let _ = self.tx.send(Arc::new(value));
    }
}

impl<T> RegistryReader<T> {
    /// Returns the current snapshot without blocking the writer.
    pub fn get(&self) -> Arc<T> {
        self.rx.borrow().clone()
    }

    /// Waits until a new snapshot has been published since the last call.
    /// Returns `false` once the writer has been dropped.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}

impl<T> Clone for RegistryReader<T> {
    fn clone(&self) -> Self {
        Self { rx: self.rx.clone() }
    }
}
