//! Typed JSON documents over a key/value backend, fronted by the LRU cache

use std::sync::Arc;

use accurate_cache::{Cache, Cached};
use accurate_core::traits::KvBackend;
use accurate_core::{AppError, AppResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::iterator::StoreIter;

/// How a read uses the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    /// Serve from the cache, loading and caching on a miss
    #[default]
    Cached,
    /// Read the backend and refresh the cache with the result
    CacheSkip,
    /// Read the backend only
    Live,
}

#[derive(Clone)]
pub struct Store {
    backend: Arc<dyn KvBackend>,
    cache: Arc<Cache>,
}

impl Store {
    pub fn new(backend: Arc<dyn KvBackend>, cache: Arc<Cache>) -> Self {
        Self { backend, cache }
    }

    pub fn backend(&self) -> &Arc<dyn KvBackend> {
        &self.backend
    }

    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    /// Document at `key`, `NOT_FOUND` when absent
    pub async fn get<T>(&self, tenant: &str, key: &str, mode: CacheMode) -> AppResult<T>
    where
        T: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        self.get_opt(tenant, key, mode).await?.ok_or(AppError::NotFound)
    }

    pub async fn get_opt<T>(&self, tenant: &str, key: &str, mode: CacheMode) -> AppResult<Option<T>>
    where
        T: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        if mode == CacheMode::Cached {
            match self.cache.get::<T>(tenant, key) {
                Cached::Hit(v) => return Ok(Some((*v).clone())),
                Cached::Absent => return Ok(None),
                Cached::Miss => debug!(key, "cache miss"),
            }
        }
        let value: Option<T> = match self.backend.get(key).await? {
            Some(raw) => Some(serde_json::from_str(&raw)?),
            None => None,
        };
        if mode != CacheMode::Live {
            self.cache.set(tenant, key, value.clone(), None);
        }
        Ok(value)
    }

    /// Writes the document and drops the cached copy, within `trans_id` when given
    pub async fn set<T: Serialize + Sync>(
        &self,
        tenant: &str,
        key: &str,
        value: &T,
        trans_id: Option<&str>,
    ) -> AppResult<()> {
        self.backend.set(key, serde_json::to_string(value)?).await?;
        self.cache.remove(tenant, key, trans_id);
        Ok(())
    }

    pub async fn remove(&self, tenant: &str, key: &str, trans_id: Option<&str>) -> AppResult<bool> {
        let existed = self.backend.remove(key).await?;
        self.cache.remove(tenant, key, trans_id);
        Ok(existed)
    }

    pub async fn remove_prefix(&self, tenant: &str, prefix: &str, trans_id: Option<&str>) -> AppResult<usize> {
        let n = self.backend.remove_prefix(prefix).await?;
        self.cache.remove_prefix(tenant, prefix, trans_id);
        Ok(n)
    }

    pub async fn count(&self, prefix: &str) -> AppResult<usize> {
        self.backend.count(prefix).await
    }

    pub async fn keys(&self, prefix: &str) -> AppResult<Vec<String>> {
        self.backend.keys(prefix).await
    }

    pub async fn iter<T: DeserializeOwned>(&self, prefix: &str) -> AppResult<StoreIter<T>> {
        StoreIter::open(self.backend.clone(), prefix).await
    }

    /// Page of documents under `prefix`, in key order
    pub async fn range<T: DeserializeOwned>(
        &self,
        prefix: &str,
        offset: usize,
        limit: Option<usize>,
    ) -> AppResult<Vec<T>> {
        let keys = self.backend.keys(prefix).await?;
        let mut out = Vec::new();
        for key in keys.iter().skip(offset).take(limit.unwrap_or(usize::MAX)) {
            if let Some(raw) = self.backend.get(key).await? {
                out.push(serde_json::from_str(&raw)?);
            }
        }
        Ok(out)
    }

    /// Drops every document of `tenant` in the given families
    pub async fn remove_tenant(&self, tenant: &str, families: &[&str]) -> AppResult<usize> {
        let mut n = 0;
        for family in families {
            n += self
                .backend
                .remove_prefix(&format!("{}{}:", family, tenant))
                .await?;
        }
        self.cache.flush(tenant);
        Ok(n)
    }

    pub fn begin_transaction(&self) -> String {
        self.cache.begin_transaction()
    }

    pub fn commit_transaction(&self, trans_id: &str) {
        self.cache.commit_transaction(trans_id)
    }

    pub fn rollback_transaction(&self, trans_id: &str) {
        self.cache.rollback_transaction(trans_id)
    }
}
