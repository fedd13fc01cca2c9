//! Accurate storage layer
//!
//! - Typed JSON documents over a key/value backend (`*map` in process or
//!   `*redis`), fronted by the per-tenant LRU cache
//! - Tariff plan and accounting stores with their secondary indexes
//! - CDR and session cost storage, in memory or in PostgreSQL via sqlx

pub mod accounting;
pub mod cdr_memory;
pub mod cdr_pg;
pub mod iterator;
pub mod map_backend;
pub mod pool;
pub mod store;
pub mod tariff_plan;

use std::sync::Arc;

use accurate_cache::RedisBackend;
use accurate_core::config::StorageConfig;
use accurate_core::traits::{CdrStorage, KvBackend};
use tracing::info;

pub use accounting::AccountingStore;
pub use cdr_memory::MemoryCdrStore;
pub use cdr_pg::PgCdrStore;
pub use iterator::StoreIter;
pub use map_backend::MapBackend;
pub use pool::create_pool;
pub use store::{CacheMode, Store};
pub use tariff_plan::{DestStrategy, TariffPlanStore};

pub use accurate_core::{AppError, AppResult};
pub use sqlx::PgPool;

/// Key/value backend selected by `storage.kind`
pub async fn open_backend(cfg: &StorageConfig) -> AppResult<Arc<dyn KvBackend>> {
    match cfg.kind.as_str() {
        "*map" => {
            info!("Using in-process data storage");
            Ok(Arc::new(MapBackend::new()))
        }
        "*redis" => {
            info!(url = %cfg.redis_url, "Using redis data storage");
            Ok(Arc::new(RedisBackend::new(&cfg.redis_url).await?))
        }
        other => Err(AppError::Config(format!("unsupported storage kind {}", other))),
    }
}

/// PostgreSQL when `storage.cdr_db_url` is set, memory otherwise
pub async fn open_cdr_storage(cfg: &StorageConfig) -> AppResult<Arc<dyn CdrStorage>> {
    match cfg.cdr_db_url.as_deref() {
        Some(url) if !url.is_empty() => Ok(Arc::new(PgCdrStore::new(create_pool(url, cfg).await?))),
        _ => {
            info!("Using in-process CDR storage");
            Ok(Arc::new(MemoryCdrStore::new()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_defaults() {
        let cfg = StorageConfig::default();
        let backend = open_backend(&cfg).await.unwrap();
        assert_eq!(backend.count("").await.unwrap(), 0);
        open_cdr_storage(&cfg).await.unwrap();

        let bad = StorageConfig {
            kind: "*mongo".into(),
            ..Default::default()
        };
        assert!(matches!(open_backend(&bad).await, Err(AppError::Config(_))));
    }
}
