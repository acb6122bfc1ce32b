use thiserror::Error;

pub type ProductResult<T> = Result<T, ProductError>;

#[derive(Debug, Error)]
pub enum ProductError {
    #[error("refresh rate must be at least {minimum:?}, got {requested:?}")]
    RefreshRateTooLow {
        requested: std::time::Duration,
        minimum: std::time::Duration,
    },
    #[error("failed to fetch product catalog: {0}")]
    Fetch(String),
    #[error("failed to parse product catalog response: {0}")]
    Decode(String),
}
