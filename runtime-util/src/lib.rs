pub mod error_set;
pub mod fsperm;
pub mod looper;
pub mod lru_cache;
pub mod path_tree;
pub mod registry;
pub mod reservoir;

pub use error_set::ErrorSet;
pub use fsperm::harden_dir;
pub use looper::{BackoffPolicy, Looper};
pub use lru_cache::ExpiringLru;
pub use path_tree::PathTree;
pub use registry::{registry, RegistryReader, RegistryWriter};
pub use reservoir::{reservoir, OverflowReceiver, ReservoirReceiver, ReservoirSender};

pub use tokio_util::sync::CancellationToken;
