//! Caching layer for Accurate
//!
//! - [`Cache`]: process-local LRU cache of storage entities, per tenant and
//!   key family, with negative entries and transactional invalidation
//! - [`ResponseCache`]: TTL cache replaying RPC outcomes to retrying clients
//! - [`RedisBackend`]: Redis implementation of the key/value storage backend
//! - [`keys`]: key prefixes and builders shared with the storage layer
//!
//! # Example
//!
//! ```
//! use accurate_cache::{Cache, Cached};
//!
//! let cache = Cache::new(1000);
//! cache.set("cgrates.org", "dst_49", Some(vec!["GERMANY".to_string()]), None);
//! assert!(matches!(cache.get::<Vec<String>>("cgrates.org", "dst_49"), Cached::Hit(_)));
//! ```

pub mod keys;
pub mod lru_cache;
pub mod redis_backend;
pub mod response;

pub use lru_cache::{Cache, Cached};
pub use redis_backend::RedisBackend;
pub use response::ResponseCache;
