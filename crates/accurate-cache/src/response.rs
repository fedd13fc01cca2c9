//! Deduplication cache for RPC replies
//!
//! A client retrying a request after a timeout must receive the outcome of
//! the first attempt, errors included. Replies are stored as JSON next to
//! their insertion time and dropped once older than the TTL.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use accurate_core::{AppError, AppResult};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::debug;

pub struct ResponseCache {
    ttl: Duration,
    items: Mutex<HashMap<String, (Instant, Result<Value, AppError>)>>,
}

impl ResponseCache {
    /// A zero TTL disables caching
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            items: Mutex::new(HashMap::new()),
        }
    }

    pub fn enabled(&self) -> bool {
        !self.ttl.is_zero()
    }

    /// Stored outcome for `key`, if still fresh
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<AppResult<T>> {
        if !self.enabled() {
            return None;
        }
        let mut items = self.items.lock();
        let fresh = match items.get(key) {
            Some((at, _)) => at.elapsed() < self.ttl,
            None => return None,
        };
        if !fresh {
            items.remove(key);
            return None;
        }
        debug!(key, "response cache hit");
        let (_, outcome) = items.get(key)?;
        Some(match outcome {
            Ok(v) => serde_json::from_value(v.clone()).map_err(AppError::from),
            Err(e) => Err(e.clone()),
        })
    }

    pub fn set<T: Serialize>(&self, key: &str, outcome: &AppResult<T>) {
        if !self.enabled() {
            return;
        }
        let stored = match outcome {
            Ok(v) => match serde_json::to_value(v) {
                Ok(v) => Ok(v),
                Err(e) => Err(AppError::from(e)),
            },
            Err(e) => Err(e.clone()),
        };
        let mut items = self.items.lock();
        let ttl = self.ttl;
        items.retain(|_, (at, _)| at.elapsed() < ttl);
        items.insert(key.to_string(), (Instant::now(), stored));
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
