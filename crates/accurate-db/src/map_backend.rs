//! In-memory key/value backend

use std::collections::BTreeMap;

use accurate_core::traits::KvBackend;
use accurate_core::AppResult;
use async_trait::async_trait;
use parking_lot::RwLock;

/// Ordered map behind a lock, used by `*map` storage and tests
#[derive(Default)]
pub struct MapBackend {
    data: RwLock<BTreeMap<String, String>>,
}

impl MapBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvBackend for MapBackend {
    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        Ok(self.data.read().get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> AppResult<()> {
        self.data.write().insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> AppResult<bool> {
        Ok(self.data.write().remove(key).is_some())
    }

    async fn keys(&self, prefix: &str) -> AppResult<Vec<String>> {
        Ok(self
            .data
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn remove_prefix(&self, prefix: &str) -> AppResult<usize> {
        let mut data = self.data.write();
        let before = data.len();
        data.retain(|k, _| !k.starts_with(prefix));
        Ok(before - data.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_prefix_scan_is_sorted_and_bounded() {
        let b = MapBackend::new();
        for k in ["acc_t:b", "acc_t:a", "acd_x", "acb_x", "acc_u:a"] {
            b.set(k, "{}".into()).await.unwrap();
        }
        assert_eq!(b.keys("acc_t:").await.unwrap(), vec!["acc_t:a", "acc_t:b"]);
        assert_eq!(b.count("acc_").await.unwrap(), 3);
        assert_eq!(b.remove_prefix("acc_t:").await.unwrap(), 2);
        assert!(b.remove("acc_u:a").await.unwrap());
        assert_eq!(b.count("acc_").await.unwrap(), 0);
        assert_eq!(b.count("").await.unwrap(), 2);
    }
}
