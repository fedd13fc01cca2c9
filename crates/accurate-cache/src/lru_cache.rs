//! Process-local entity cache
//!
//! Entries live per tenant, in one LRU per key family. A lookup can cache
//! the absence of a key too, so repeated misses stay in memory. Writes may be
//! buffered under a transaction id and applied together on commit.

use std::any::Any;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use accurate_core::utils::consts::ANY;
use accurate_core::utils::gen_uuid;
use lru::LruCache;
use parking_lot::Mutex;
use tracing::debug;

use crate::keys::split_key;

type Value = Option<Arc<dyn Any + Send + Sync>>;

/// Outcome of a cache lookup
#[derive(Debug, Clone, PartialEq)]
pub enum Cached<T> {
    /// Nothing known about the key
    Miss,
    /// The key is known not to exist
    Absent,
    Hit(Arc<T>),
}

impl<T> Cached<T> {
    pub fn is_miss(&self) -> bool {
        matches!(self, Cached::Miss)
    }
}

enum TxItem {
    Add { tenant: String, key: String, value: Value },
    Rem { tenant: String, key: String },
    Prefix { tenant: String, prefix: String },
}

type TenantStore = HashMap<String, LruCache<String, Value>>;

struct State {
    tenants: HashMap<String, TenantStore>,
    transactions: HashMap<String, Vec<TxItem>>,
}

pub struct Cache {
    capacity: NonZeroUsize,
    state: Mutex<State>,
}

impl Cache {
    /// `capacity` bounds every (tenant, family) LRU
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN),
            state: Mutex::new(State {
                tenants: HashMap::new(),
                transactions: HashMap::new(),
            }),
        }
    }

    pub fn get<T: Send + Sync + 'static>(&self, tenant: &str, key: &str) -> Cached<T> {
        let (prefix, rest) = split_key(key);
        let mut state = self.state.lock();
        let entry = state
            .tenants
            .get_mut(tenant)
            .and_then(|t| t.get_mut(prefix))
            .and_then(|lru| lru.get(rest).cloned());
        match entry {
            None => Cached::Miss,
            Some(None) => Cached::Absent,
            Some(Some(v)) => match v.downcast::<T>() {
                Ok(v) => Cached::Hit(v),
                Err(_) => {
                    debug!(key, "cached value has another type");
                    Cached::Miss
                }
            },
        }
    }

    /// Caches `value`, `None` recording that the key does not exist
    pub fn set<T: Send + Sync + 'static>(
        &self,
        tenant: &str,
        key: &str,
        value: Option<T>,
        trans_id: Option<&str>,
    ) {
        let value: Value = value.map(|v| Arc::new(v) as Arc<dyn Any + Send + Sync>);
        let mut state = self.state.lock();
        if let Some(id) = trans_id {
            if let Some(items) = state.transactions.get_mut(id) {
                items.push(TxItem::Add {
                    tenant: tenant.to_string(),
                    key: key.to_string(),
                    value,
                });
            }
            return;
        }
        let capacity = self.capacity;
        Self::put(&mut state, capacity, tenant, key, value);
    }

    pub fn remove(&self, tenant: &str, key: &str, trans_id: Option<&str>) {
        let mut state = self.state.lock();
        if let Some(id) = trans_id {
            if let Some(items) = state.transactions.get_mut(id) {
                items.push(TxItem::Rem {
                    tenant: tenant.to_string(),
                    key: key.to_string(),
                });
            }
            return;
        }
        Self::delete(&mut state, tenant, key);
    }

    /// Drops every entry whose key starts with `prefix`
    pub fn remove_prefix(&self, tenant: &str, prefix: &str, trans_id: Option<&str>) {
        let mut state = self.state.lock();
        if let Some(id) = trans_id {
            if let Some(items) = state.transactions.get_mut(id) {
                items.push(TxItem::Prefix {
                    tenant: tenant.to_string(),
                    prefix: prefix.to_string(),
                });
            }
            return;
        }
        Self::delete_prefix(&mut state, tenant, prefix);
    }

    pub fn keys_prefix(&self, tenant: &str, prefix: &str) -> Vec<String> {
        let (family, rest) = split_key(prefix);
        let state = self.state.lock();
        let mut keys: Vec<String> = state
            .tenants
            .get(tenant)
            .and_then(|t| t.get(family))
            .map(|lru| {
                lru.iter()
                    .filter(|(k, _)| k.starts_with(rest))
                    .map(|(k, _)| format!("{}{}", family, k))
                    .collect()
            })
            .unwrap_or_default();
        keys.sort();
        keys
    }

    pub fn count_prefix(&self, tenant: &str, prefix: &str) -> usize {
        self.keys_prefix(tenant, prefix).len()
    }

    /// Empties one tenant, or every tenant for `*any`
    pub fn flush(&self, tenant: &str) {
        let mut state = self.state.lock();
        if tenant == ANY {
            state.tenants.clear();
        } else {
            state.tenants.remove(tenant);
        }
    }

    pub fn begin_transaction(&self) -> String {
        let id = gen_uuid();
        self.state.lock().transactions.insert(id.clone(), Vec::new());
        id
    }

    pub fn rollback_transaction(&self, trans_id: &str) {
        self.state.lock().transactions.remove(trans_id);
    }

    /// Applies the buffered operations in order
    pub fn commit_transaction(&self, trans_id: &str) {
        let mut state = self.state.lock();
        let Some(items) = state.transactions.remove(trans_id) else {
            return;
        };
        let capacity = self.capacity;
        for item in items {
            match item {
                TxItem::Add { tenant, key, value } => {
                    Self::put(&mut state, capacity, &tenant, &key, value)
                }
                TxItem::Rem { tenant, key } => Self::delete(&mut state, &tenant, &key),
                TxItem::Prefix { tenant, prefix } => Self::delete_prefix(&mut state, &tenant, &prefix),
            }
        }
    }

    fn put(state: &mut State, capacity: NonZeroUsize, tenant: &str, key: &str, value: Value) {
        let (prefix, rest) = split_key(key);
        state
            .tenants
            .entry(tenant.to_string())
            .or_default()
            .entry(prefix.to_string())
            .or_insert_with(|| LruCache::new(capacity))
            .put(rest.to_string(), value);
    }

    fn delete(state: &mut State, tenant: &str, key: &str) {
        let (prefix, rest) = split_key(key);
        if let Some(lru) = state.tenants.get_mut(tenant).and_then(|t| t.get_mut(prefix)) {
            lru.pop(rest);
        }
    }

    fn delete_prefix(state: &mut State, tenant: &str, prefix: &str) {
        let Some(store) = state.tenants.get_mut(tenant) else {
            return;
        };
        let (family, rest) = split_key(prefix);
        if rest.is_empty() {
            store.remove(family);
            return;
        }
        if let Some(lru) = store.get_mut(family) {
            let doomed: Vec<String> = lru
                .iter()
                .filter(|(k, _)| k.starts_with(rest))
                .map(|(k, _)| k.clone())
                .collect();
            for k in doomed {
                lru.pop(&k);
            }
        }
    }
}
