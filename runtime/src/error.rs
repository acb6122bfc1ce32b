use thiserror::Error;

pub type RuntimeResult<T> = Result<T, RuntimeError>;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("invalid product configuration: {0}")]
    Product(#[from] runtime_product::ProductError),
    #[error("invalid runtime configuration: {0}")]
    Config(String),
}
