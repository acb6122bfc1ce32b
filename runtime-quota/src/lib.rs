pub mod bucket;
pub mod error;
pub mod manager;

pub use bucket::{calc_local_expiry, QuotaBucket, QuotaOutcome, RequestTemplate};
pub use error::{QuotaError, QuotaResult};
pub use manager::{QuotaConfig, QuotaManager};
