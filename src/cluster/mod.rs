//! Cluster membership lookup and node-to-node streaming calls.

pub mod directory;
pub mod proxy;

pub use directory::{ClusterDirectory, DirectoryError};
pub use proxy::{ClusterProxyClient, ProxyError};
