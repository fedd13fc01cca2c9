//! Redis key/value backend
//!
//! Stores every entity as a JSON string under its prefixed key, through a
//! multiplexed `ConnectionManager`.

use accurate_core::error::AppError;
use accurate_core::traits::KvBackend;
use accurate_core::AppResult;
use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Client, RedisError};
use tracing::{debug, error, warn};

#[derive(Clone)]
pub struct RedisBackend {
    manager: ConnectionManager,
}

impl RedisBackend {
    /// Connects to `url`, e.g. `redis://127.0.0.1:6379/10`
    pub async fn new(url: &str) -> AppResult<Self> {
        debug!("Connecting to Redis at {}", url);

        let client = Client::open(url).map_err(|e| {
            error!("Failed to create Redis client: {}", e);
            AppError::Cache(format!("Invalid Redis URL: {}", e))
        })?;

        let manager = ConnectionManager::new(client).await.map_err(|e| {
            error!("Failed to establish Redis connection: {}", e);
            AppError::Cache(format!("Connection failed: {}", e))
        })?;

        debug!("Redis connection established");
        Ok(Self { manager })
    }

    pub async fn ping(&self) -> AppResult<()> {
        let mut conn = self.manager.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(Self::map_redis_error)?;
        Ok(())
    }

    #[cfg(test)]
    async fn flush_db(&self) -> AppResult<()> {
        let mut conn = self.manager.clone();
        let _: () = redis::cmd("FLUSHDB")
            .query_async(&mut conn)
            .await
            .map_err(Self::map_redis_error)?;
        Ok(())
    }

    fn map_redis_error(err: RedisError) -> AppError {
        match err.kind() {
            redis::ErrorKind::IoError => {
                error!("Redis I/O error: {}", err);
                AppError::Cache(format!("I/O error: {}", err))
            }
            redis::ErrorKind::TypeError => {
                warn!("Redis type error: {}", err);
                AppError::Cache(format!("Type mismatch: {}", err))
            }
            _ => {
                error!("Redis error: {}", err);
                AppError::Cache(err.to_string())
            }
        }
    }
}

/// Escapes glob metacharacters so a prefix matches literally
fn glob_prefix(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('*');
    out
}

#[async_trait]
impl KvBackend for RedisBackend {
    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        debug!("GET {}", key);
        let mut conn = self.manager.clone();
        conn.get(key).await.map_err(Self::map_redis_error)
    }

    async fn set(&self, key: &str, value: String) -> AppResult<()> {
        debug!("SET {}", key);
        let mut conn = self.manager.clone();
        let _: () = conn.set(key, value).await.map_err(Self::map_redis_error)?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> AppResult<bool> {
        debug!("DEL {}", key);
        let mut conn = self.manager.clone();
        let deleted: i32 = conn.del(key).await.map_err(Self::map_redis_error)?;
        Ok(deleted > 0)
    }

    async fn keys(&self, prefix: &str) -> AppResult<Vec<String>> {
        let mut conn = self.manager.clone();
        let mut keys: Vec<String> = conn
            .keys(glob_prefix(prefix))
            .await
            .map_err(Self::map_redis_error)?;
        keys.sort();
        Ok(keys)
    }

    async fn remove_prefix(&self, prefix: &str) -> AppResult<usize> {
        let keys = self.keys(prefix).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.manager.clone();
        let deleted: usize = conn.del(&keys).await.map_err(Self::map_redis_error)?;
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> RedisBackend {
        let backend = RedisBackend::new("redis://127.0.0.1:6379/10")
            .await
            .expect("Failed to connect to Redis");
        backend.flush_db().await.expect("Failed to flush DB");
        backend
    }

    #[test]
    fn test_glob_prefix() {
        assert_eq!(glob_prefix("rpf_*out:t"), "rpf_\\*out:t*");
        assert_eq!(glob_prefix("acc_"), "acc_*");
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_set_get_remove() {
        let b = setup().await;
        b.set("acc_t:dan", "{}".into()).await.unwrap();
        assert_eq!(b.get("acc_t:dan").await.unwrap(), Some("{}".to_string()));
        assert!(b.remove("acc_t:dan").await.unwrap());
        assert!(!b.remove("acc_t:dan").await.unwrap());
        assert_eq!(b.get("acc_t:dan").await.unwrap(), None);
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_prefix_operations() {
        let b = setup().await;
        b.set("rpf_*out:t:call:a", "1".into()).await.unwrap();
        b.set("rpf_*out:t:call:b", "1".into()).await.unwrap();
        b.set("rpf_*out:t:sms:a", "1".into()).await.unwrap();
        assert_eq!(b.count("rpf_*out:t:call:").await.unwrap(), 2);
        assert_eq!(b.remove_prefix("rpf_*out:t:call:").await.unwrap(), 2);
        assert_eq!(b.keys("rpf_").await.unwrap(), vec!["rpf_*out:t:sms:a".to_string()]);
    }
}
