pub mod cache;
pub mod cluster;
pub mod config;
pub mod lock;
pub mod project;
pub mod server;
pub mod work;

pub use cache::{CacheIndex, JobCacheStore, MemoryCacheIndex};
pub use cluster::{ClusterDirectory, ClusterProxyClient};
pub use config::Config;
pub use lock::LockRegistry;
pub use project::{AccessPolicy, ProjectRegistry, PullAuthorization};
pub use server::{AppState, GrangeServer};
pub use work::{WorkExecutor, GIT_PRIORITY};
