use thiserror::Error;

pub type AnalyticsResult<T> = Result<T, AnalyticsError>;

#[derive(Debug, Error)]
pub enum AnalyticsError {
    #[error("invalid analytics configuration: {0}")]
    Config(String),
    #[error("failed to fetch signed upload URL: {0}")]
    SignedUrl(String),
    #[error("failed to upload analytics file: {0}")]
    Upload(String),
    #[error("fluentd TLS setup failed: {0}")]
    Tls(String),
    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),
}

/// Sentinel returned by upload work invoked with an already-cancelled
/// token: not a real failure, so the looper must not retry it.
#[derive(Debug, Error)]
#[error("upload manager is closed")]
pub struct Closed;
