//! Accounting store: accounts, simple accounts, aliases, user profiles,
//! stats queue states, action plan bindings, queued tasks, load history and
//! the schema version manifest

use accurate_cache::keys;
use accurate_core::models::{
    Account, ActionPlanBinding, Alias, LoadInstance, SimpleAccount, StatsQueueState,
    StructVersion, Task, UserProfile,
};
use accurate_core::utils::gen_uuid;
use accurate_core::{AppError, AppResult};
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use crate::store::{CacheMode, Store};

/// Keys live outside any tenant namespace in the cache
const GLOBAL: &str = "*global";

pub struct AccountingStore {
    store: Store,
    load_history_size: usize,
    // serializes read-modify-write of the history document
    history: Mutex<()>,
    tasks: Mutex<()>,
}

impl AccountingStore {
    pub fn new(store: Store, load_history_size: usize) -> Self {
        Self {
            store,
            load_history_size,
            history: Mutex::new(()),
            tasks: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    // ==================== Accounts ====================

    pub async fn get_account(&self, tenant: &str, name: &str) -> AppResult<Account> {
        self.store
            .get(tenant, &keys::account_key(tenant, name), CacheMode::Live)
            .await
            .map_err(|e| match e {
                AppError::NotFound => AppError::AccountNotFound,
                other => other,
            })
    }

    pub async fn get_account_opt(&self, tenant: &str, name: &str) -> AppResult<Option<Account>> {
        self.store
            .get_opt(tenant, &keys::account_key(tenant, name), CacheMode::Live)
            .await
    }

    #[instrument(skip(self, acc), fields(account = %acc.full_id()))]
    pub async fn set_account(&self, acc: &Account) -> AppResult<()> {
        let key = keys::account_key(&acc.tenant, &acc.name);
        self.store.set(&acc.tenant, &key, acc, None).await
    }

    pub async fn remove_account(&self, tenant: &str, name: &str) -> AppResult<()> {
        if !self.store.remove(tenant, &keys::account_key(tenant, name), None).await? {
            return Err(AppError::AccountNotFound);
        }
        Ok(())
    }

    /// Accounts of a tenant, `offset`/`limit` paged in key order
    pub async fn accounts(&self, tenant: &str, offset: usize, limit: Option<usize>) -> AppResult<Vec<Account>> {
        let prefix = format!("{}{}:", keys::ACCOUNT_PREFIX, tenant);
        self.store.range(&prefix, offset, limit).await
    }

    pub async fn count_accounts(&self, tenant: &str) -> AppResult<usize> {
        self.store
            .count(&format!("{}{}:", keys::ACCOUNT_PREFIX, tenant))
            .await
    }

    pub async fn get_simple_account(&self, tenant: &str, name: &str) -> AppResult<SimpleAccount> {
        self.store
            .get(tenant, &keys::simple_account_key(tenant, name), CacheMode::Live)
            .await
            .map_err(|e| match e {
                AppError::NotFound => AppError::AccountNotFound,
                other => other,
            })
    }

    pub async fn set_simple_account(&self, acc: &SimpleAccount) -> AppResult<()> {
        let key = keys::simple_account_key(&acc.tenant, &acc.name);
        self.store.set(&acc.tenant, &key, acc, None).await
    }

    pub async fn remove_simple_account(&self, tenant: &str, name: &str) -> AppResult<bool> {
        self.store
            .remove(tenant, &keys::simple_account_key(tenant, name), None)
            .await
    }

    // ==================== Aliases ====================

    pub async fn get_alias(&self, tenant: &str, full_id: &str, mode: CacheMode) -> AppResult<Alias> {
        self.store.get(tenant, &keys::alias_key(tenant, full_id), mode).await
    }

    pub async fn get_alias_opt(&self, tenant: &str, full_id: &str, mode: CacheMode) -> AppResult<Option<Alias>> {
        self.store
            .get_opt(tenant, &keys::alias_key(tenant, full_id), mode)
            .await
    }

    /// Stores the alias and feeds its reverse index entries
    #[instrument(skip(self, alias), fields(alias = %alias.full_id()))]
    pub async fn set_alias(&self, alias: &Alias) -> AppResult<()> {
        let id = alias.full_id();
        self.store
            .set(&alias.tenant, &keys::alias_key(&alias.tenant, &id), alias, None)
            .await?;
        for rid in alias.reverse_keys() {
            let key = keys::reverse_alias_key(&alias.tenant, &rid);
            let mut ids: Vec<String> = self
                .store
                .get_opt(&alias.tenant, &key, CacheMode::Live)
                .await?
                .unwrap_or_default();
            if !ids.contains(&id) {
                ids.push(id.clone());
                self.store.set(&alias.tenant, &key, &ids, None).await?;
            }
        }
        Ok(())
    }

    /// Drops the alias and its reverse index entries
    pub async fn remove_alias(&self, tenant: &str, full_id: &str) -> AppResult<()> {
        let alias = self.get_alias(tenant, full_id, CacheMode::Live).await?;
        for rid in alias.reverse_keys() {
            let key = keys::reverse_alias_key(tenant, &rid);
            let mut ids: Vec<String> = self
                .store
                .get_opt(tenant, &key, CacheMode::Live)
                .await?
                .unwrap_or_default();
            ids.retain(|i| i != full_id);
            if ids.is_empty() {
                self.store.remove(tenant, &key, None).await?;
            } else {
                self.store.set(tenant, &key, &ids, None).await?;
            }
        }
        self.store
            .remove(tenant, &keys::alias_key(tenant, full_id), None)
            .await?;
        Ok(())
    }

    /// Alias ids whose values rewrite `target` to `alias` within `context`
    pub async fn reverse_alias(&self, tenant: &str, context: &str, target: &str, alias: &str) -> AppResult<Vec<String>> {
        let rid = accurate_core::models::alias::reverse_alias_key(context, target, alias);
        Ok(self
            .store
            .get_opt(tenant, &keys::reverse_alias_key(tenant, &rid), CacheMode::Cached)
            .await?
            .unwrap_or_default())
    }

    // ==================== Users ====================

    pub async fn get_user(&self, tenant: &str, name: &str) -> AppResult<UserProfile> {
        self.store
            .get(tenant, &keys::user_key(tenant, name), CacheMode::Live)
            .await
            .map_err(|e| match e {
                AppError::NotFound => AppError::UserNotFound,
                other => other,
            })
    }

    pub async fn set_user(&self, user: &UserProfile) -> AppResult<()> {
        let key = keys::user_key(&user.tenant, &user.name);
        self.store.set(&user.tenant, &key, user, None).await
    }

    pub async fn remove_user(&self, tenant: &str, name: &str) -> AppResult<()> {
        if !self.store.remove(tenant, &keys::user_key(tenant, name), None).await? {
            return Err(AppError::UserNotFound);
        }
        Ok(())
    }

    /// Profiles of one tenant, or of all tenants when empty
    pub async fn users(&self, tenant: &str) -> AppResult<Vec<UserProfile>> {
        let prefix = if tenant.is_empty() {
            keys::USERS_PREFIX.to_string()
        } else {
            format!("{}{}:", keys::USERS_PREFIX, tenant)
        };
        self.store.range(&prefix, 0, None).await
    }

    // ==================== Stats queues ====================

    pub async fn get_stats_queue(&self, tenant: &str, name: &str) -> AppResult<Option<StatsQueueState>> {
        self.store
            .get_opt(tenant, &keys::stats_queue_key(tenant, name), CacheMode::Live)
            .await
    }

    pub async fn set_stats_queue(&self, state: &StatsQueueState) -> AppResult<()> {
        let key = keys::stats_queue_key(&state.tenant, &state.name);
        self.store.set(&state.tenant, &key, state, None).await
    }

    pub async fn remove_stats_queue(&self, tenant: &str, name: &str) -> AppResult<bool> {
        self.store
            .remove(tenant, &keys::stats_queue_key(tenant, name), None)
            .await
    }

    // ==================== Action plan bindings ====================

    pub async fn bind_action_plan(&self, binding: &ActionPlanBinding) -> AppResult<()> {
        let key = keys::action_plan_binding_key(&binding.tenant, &binding.account, &binding.action_plan);
        self.store.set(&binding.tenant, &key, binding, None).await
    }

    pub async fn unbind_action_plan(&self, tenant: &str, account: &str, plan: &str) -> AppResult<bool> {
        self.store
            .remove(tenant, &keys::action_plan_binding_key(tenant, account, plan), None)
            .await
    }

    /// Plans an account is attached to
    pub async fn plans_for_account(&self, tenant: &str, account: &str) -> AppResult<Vec<String>> {
        let prefix = format!("{}{}:{}:", keys::ACTION_PLAN_BINDING_PREFIX, tenant, account);
        let bindings: Vec<ActionPlanBinding> = self.store.range(&prefix, 0, None).await?;
        Ok(bindings.into_iter().map(|b| b.action_plan).collect())
    }

    /// Accounts (bare names) attached to a plan
    pub async fn accounts_for_plan(&self, tenant: &str, plan: &str) -> AppResult<Vec<String>> {
        let prefix = format!("{}{}:", keys::ACTION_PLAN_BINDING_PREFIX, tenant);
        let bindings: Vec<ActionPlanBinding> = self.store.range(&prefix, 0, None).await?;
        Ok(bindings
            .into_iter()
            .filter(|b| b.action_plan == plan)
            .map(|b| b.account)
            .collect())
    }

    // ==================== Tasks ====================

    /// Appends a task; tasks pop in push order
    pub async fn push_task(&self, task: &Task) -> AppResult<()> {
        let _guard = self.tasks.lock().await;
        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let key = keys::task_key(&format!("{:020}:{}", nanos, gen_uuid()));
        self.store.backend().set(&key, serde_json::to_string(task)?).await
    }

    /// Oldest queued task, removed from the queue
    pub async fn pop_task(&self) -> AppResult<Option<Task>> {
        let _guard = self.tasks.lock().await;
        let backend = self.store.backend();
        let Some(key) = backend.keys(keys::TASK_PREFIX).await?.into_iter().next() else {
            return Ok(None);
        };
        let raw = backend.get(&key).await?;
        backend.remove(&key).await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn task_count(&self) -> AppResult<usize> {
        self.store.count(keys::TASK_PREFIX).await
    }

    // ==================== Load history and versions ====================

    /// Newest first
    pub async fn load_history(&self) -> AppResult<Vec<LoadInstance>> {
        Ok(self
            .store
            .get_opt(GLOBAL, keys::LOAD_HISTORY_KEY, CacheMode::Live)
            .await?
            .unwrap_or_default())
    }

    /// Records a load, keeping the configured number of entries
    pub async fn add_load_history(&self, load: LoadInstance) -> AppResult<()> {
        let _guard = self.history.lock().await;
        let mut history = self.load_history().await?;
        history.insert(0, load);
        history.truncate(self.load_history_size.max(1));
        debug!(entries = history.len(), "load history updated");
        self.store.set(GLOBAL, keys::LOAD_HISTORY_KEY, &history, None).await
    }

    pub async fn versions(&self) -> AppResult<Option<StructVersion>> {
        self.store
            .get_opt(GLOBAL, keys::VERSIONS_KEY, CacheMode::Live)
            .await
    }

    pub async fn set_versions(&self, versions: &StructVersion) -> AppResult<()> {
        self.store.set(GLOBAL, keys::VERSIONS_KEY, versions, None).await
    }

    /// True when the store holds no data at all
    pub async fn is_empty(&self) -> AppResult<bool> {
        Ok(self.store.keys("").await?.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map_backend::MapBackend;
    use accurate_cache::Cache;
    use accurate_core::models::{AliasIndex, AliasValue};
    use std::sync::Arc;

    fn acc_store() -> AccountingStore {
        AccountingStore::new(
            Store::new(Arc::new(MapBackend::new()), Arc::new(Cache::new(100))),
            3,
        )
    }

    #[tokio::test]
    async fn test_account_not_found() {
        let s = acc_store();
        assert!(matches!(s.get_account("t", "x").await, Err(AppError::AccountNotFound)));
        s.set_account(&Account::new("t", "x")).await.unwrap();
        assert_eq!(s.get_account("t", "x").await.unwrap().name, "x");
        assert_eq!(s.count_accounts("t").await.unwrap(), 1);
        s.remove_account("t", "x").await.unwrap();
        assert!(matches!(s.remove_account("t", "x").await, Err(AppError::AccountNotFound)));
    }

    #[tokio::test]
    async fn test_reverse_alias_index() {
        let s = acc_store();
        let alias = Alias {
            direction: "*out".into(),
            tenant: "t".into(),
            category: "call".into(),
            account: "dan".into(),
            subject: "dan".into(),
            context: "*rating".into(),
            index: vec![AliasIndex {
                target: "Subject".into(),
                alias: "dan1".into(),
            }],
            values: vec![AliasValue {
                destination_id: "*any".into(),
                fields: r#"{"Subject":"dan1"}"#.into(),
                weight: 10.0,
            }],
        };
        s.set_alias(&alias).await.unwrap();
        s.set_alias(&alias).await.unwrap();
        let ids = s.reverse_alias("t", "*rating", "Subject", "dan1").await.unwrap();
        assert_eq!(ids, vec![alias.full_id()]);
        s.remove_alias("t", &alias.full_id()).await.unwrap();
        assert!(s.reverse_alias("t", "*rating", "Subject", "dan1").await.unwrap().is_empty());
        assert!(s.get_alias_opt("t", &alias.full_id(), CacheMode::Cached).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_tasks_pop_in_push_order() {
        let s = acc_store();
        for i in 0..3 {
            s.push_task(&Task {
                uuid: i.to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        }
        assert_eq!(s.task_count().await.unwrap(), 3);
        for i in 0..3 {
            assert_eq!(s.pop_task().await.unwrap().unwrap().uuid, i.to_string());
        }
        assert!(s.pop_task().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_bindings() {
        let s = acc_store();
        for (acc, plan) in [("a", "P1"), ("b", "P1"), ("a", "P2")] {
            s.bind_action_plan(&ActionPlanBinding {
                tenant: "t".into(),
                account: acc.into(),
                action_plan: plan.into(),
            })
            .await
            .unwrap();
        }
        assert_eq!(s.plans_for_account("t", "a").await.unwrap(), vec!["P1", "P2"]);
        assert_eq!(s.accounts_for_plan("t", "P1").await.unwrap(), vec!["a", "b"]);
        s.unbind_action_plan("t", "a", "P1").await.unwrap();
        assert_eq!(s.accounts_for_plan("t", "P1").await.unwrap(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_load_history_bounded() {
        let s = acc_store();
        for i in 0..5 {
            s.add_load_history(LoadInstance {
                load_id: i.to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        }
        let h = s.load_history().await.unwrap();
        assert_eq!(h.len(), 3);
        assert_eq!(h[0].load_id, "4");
    }

    #[tokio::test]
    async fn test_versions() {
        let s = acc_store();
        assert!(s.is_empty().await.unwrap());
        assert!(s.versions().await.unwrap().is_none());
        s.set_versions(&StructVersion::current()).await.unwrap();
        assert_eq!(s.versions().await.unwrap(), Some(StructVersion::current()));
    }
}
