pub mod bucket;
pub mod error;
pub mod format;
pub mod manager;
pub mod record;
pub mod staging;
pub mod upload;

pub use bucket::{AnalyticsBucket, StagedFile};
pub use error::{AnalyticsError, AnalyticsResult, Closed};
pub use format::{FluentdFormat, LineFormat, SaasFormat};
pub use manager::{AnalyticsConfig, AnalyticsManager};
pub use record::{Attribute, AttributeValue, Record, ValidationError};
pub use staging::Stager;
pub use upload::{FluentdTlsConfig, FluentdUploader, GcpUploader, SaasUploader, Uploader};
