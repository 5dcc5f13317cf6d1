//! Job cache store: metadata rows plus the on-disk payload format.

pub mod index;
pub mod store;

pub use index::{CacheIndex, CacheRecord, IndexError, MemoryCacheIndex};
pub use store::{CacheError, JobCacheStore, CACHE_VERSION};
