use thiserror::Error;

pub type QuotaResult<T> = Result<T, QuotaError>;

#[derive(Debug, Error)]
pub enum QuotaError {
    #[error("failed to sync quota with remote service: {0}")]
    Sync(String),
    #[error("failed to decode quota sync response: {0}")]
    Decode(String),
}
