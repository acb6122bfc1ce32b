pub mod authorize;
pub mod catalog;
pub mod error;
pub mod poller;

pub use authorize::{AuthContext, AuthorizedOperation, ProductAuthorizer};
pub use catalog::{OperationConfig, OperationGroup, Product, ProductSnapshot, Quota, TimeUnit};
pub use error::{ProductError, ProductResult};
pub use poller::{ProductConfig, ProductPoller, MIN_REFRESH_RATE};
