//! User profile service
//!
//! Profiles are kept in memory, keyed by `tenant:name`, with an optional
//! index over configured fields to narrow the candidates of a lookup.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use accurate_core::models::user::{needs_users, sort_profiles};
use accurate_core::models::{AttrGetUsers, UserProfile};
use accurate_core::utils::concatenated_key;
use accurate_core::{AppError, AppResult};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::Engine;

#[derive(Debug, Default)]
struct UserTable {
    profiles: HashMap<String, UserProfile>,
    /// `Field:value` to profile ids
    index: BTreeMap<String, BTreeSet<String>>,
    index_fields: BTreeSet<String>,
}

impl UserTable {
    fn add_index(&mut self, up: &UserProfile) {
        for key in up.index_keys(&self.index_fields) {
            self.index.entry(key).or_default().insert(up.full_id());
        }
    }

    fn remove_index(&mut self, up: &UserProfile) {
        for key in up.index_keys(&self.index_fields) {
            if let Some(ids) = self.index.get_mut(&key) {
                ids.remove(&up.full_id());
                if ids.is_empty() {
                    self.index.remove(&key);
                }
            }
        }
    }

    fn rebuild_index(&mut self) {
        self.index.clear();
        let profiles: Vec<UserProfile> = self.profiles.values().cloned().collect();
        for up in &profiles {
            self.add_index(up);
        }
    }
}

/// In-memory user profiles
#[derive(Debug, Default)]
pub struct UserIndex {
    inner: RwLock<UserTable>,
}

impl UserIndex {
    pub fn new(index_fields: &[String]) -> Self {
        let table = UserTable {
            index_fields: index_fields.iter().cloned().collect(),
            ..Default::default()
        };
        Self {
            inner: RwLock::new(table),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Value of `field` in a request, top level or extra field
fn request_field<'a>(object: &'a Value, field: &str) -> Option<&'a str> {
    object
        .get(field)
        .or_else(|| object.get("ExtraFields").and_then(|e| e.get(field)))
        .and_then(Value::as_str)
}

impl Engine {
    /// Replaces the in-memory profiles with the stored ones
    pub async fn reload_users(&self, tenant: &str) -> AppResult<usize> {
        let stored = self.accounting.users(tenant).await?;
        let mut table = self.users.inner.write();
        if tenant.is_empty() {
            table.profiles.clear();
        } else {
            table.profiles.retain(|_, up| up.tenant != tenant);
        }
        for up in stored {
            table.profiles.insert(up.full_id(), up);
        }
        table.rebuild_index();
        info!(profiles = table.profiles.len(), "user profiles loaded");
        Ok(table.profiles.len())
    }

    pub async fn set_user(&self, mut up: UserProfile) -> AppResult<()> {
        if up.tenant.is_empty() || up.name.is_empty() {
            return Err(AppError::missing(["Tenant", "Name"]));
        }
        up.normalize_query();
        up.compiled()?;
        self.accounting.set_user(&up).await?;
        let mut table = self.users.inner.write();
        if let Some(old) = table.profiles.remove(&up.full_id()) {
            table.remove_index(&old);
        }
        table.add_index(&up);
        table.profiles.insert(up.full_id(), up);
        Ok(())
    }

    /// Merges the given index values, query and weight into a stored profile
    ///
    /// An empty index value drops the entry.
    pub async fn update_user(&self, up: UserProfile) -> AppResult<()> {
        let id = up.full_id();
        let cached = self.users.inner.read().profiles.get(&id).cloned();
        let mut current = match cached {
            Some(p) => p,
            None => self.accounting.get_user(&up.tenant, &up.name).await?,
        };
        for (k, v) in up.index {
            if v.is_empty() {
                current.index.remove(&k);
            } else {
                current.index.insert(k, v);
            }
        }
        if !up.query.is_empty() {
            current.query = up.query;
        }
        if up.weight != 0.0 {
            current.weight = up.weight;
        }
        current.masked = up.masked;
        self.set_user(current).await
    }

    pub async fn remove_user(&self, tenant: &str, name: &str) -> AppResult<()> {
        self.accounting.remove_user(tenant, name).await?;
        let mut table = self.users.inner.write();
        if let Some(old) = table.profiles.remove(&concatenated_key(&[tenant, name])) {
            table.remove_index(&old);
        }
        Ok(())
    }

    /// Starts indexing profiles by `fields` as well
    pub fn add_user_index(&self, fields: &[String]) {
        let mut table = self.users.inner.write();
        table.index_fields.extend(fields.iter().cloned());
        table.rebuild_index();
    }

    /// Index key to profile ids
    pub fn user_indexes(&self) -> BTreeMap<String, Vec<String>> {
        self.users
            .inner
            .read()
            .index
            .iter()
            .map(|(k, ids)| (k.clone(), ids.iter().cloned().collect()))
            .collect()
    }

    /// Profiles whose query accepts the request, best match first
    pub fn get_users(&self, attr: &AttrGetUsers) -> AppResult<Vec<UserProfile>> {
        let table = self.users.inner.read();
        let mut indexed: BTreeSet<&String> = BTreeSet::new();
        for field in &table.index_fields {
            if let Some(value) = request_field(&attr.object, field) {
                if let Some(ids) = table.index.get(&concatenated_key(&[field.as_str(), value])) {
                    indexed.extend(ids.iter());
                }
            }
        }
        let candidates: Vec<&UserProfile> = if indexed.is_empty() {
            table.profiles.values().collect()
        } else {
            indexed.iter().filter_map(|id| table.profiles.get(*id)).collect()
        };

        let mut found = Vec::new();
        for up in candidates {
            if up.masked && !attr.masked {
                continue;
            }
            let query = match up.compiled() {
                Ok(q) => q,
                Err(e) => {
                    warn!(user = %up.full_id(), error = %e, "bad profile query");
                    continue;
                }
            };
            match query.matches_value(&attr.object) {
                Ok(true) => {
                    found.push((up.clone(), query.complexity()));
                    if !self.cfg.users.complexity_match {
                        break;
                    }
                }
                Ok(false) => {}
                Err(e) => warn!(user = %up.full_id(), error = %e, "profile query failed"),
            }
        }
        sort_profiles(&mut found);
        Ok(found.into_iter().map(|(up, _)| up).collect())
    }

    /// Fills the `*users` markers of `target` from the best matching profile
    ///
    /// Requests without markers are left untouched.
    pub fn load_user_profile<T>(&self, target: &mut T, masked: bool) -> AppResult<()>
    where
        T: Serialize + DeserializeOwned,
    {
        let object = serde_json::to_value(&*target)?;
        if !needs_users(&object) {
            return Ok(());
        }
        let profiles = self.get_users(&AttrGetUsers { object, masked })?;
        let up = profiles.first().ok_or(AppError::UserNotFound)?;
        debug!(user = %up.full_id(), "user profile applied");
        up.compiled()?.apply(target)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::*;
    use accurate_core::models::CallDescriptor;
    use accurate_core::utils::consts::USERS;
    use serde_json::json;

    fn profile(name: &str, account: &str, query: &str, weight: f64) -> UserProfile {
        UserProfile {
            tenant: TENANT.into(),
            name: name.into(),
            index: [("Account".to_string(), account.to_string())].into(),
            query: query.into(),
            weight,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_fill_users_markers() {
        let engine = engine_with_tariffs().await;
        engine
            .set_user(profile(
                "dan",
                "dan",
                "{'Tenant':'cgrates.org','Account':{'$usr':'dan'},'Subject':{'$usr':'dan'},'Cli':'0723'}",
                10.0,
            ))
            .await
            .unwrap();
        let mut cd = CallDescriptor {
            tenant: TENANT.into(),
            account: USERS.into(),
            subject: USERS.into(),
            extra_fields: [("Cli".to_string(), "0723".to_string())].into(),
            ..Default::default()
        };
        engine.load_user_profile(&mut cd, false).unwrap();
        assert_eq!(cd.account, "dan");
        assert_eq!(cd.subject, "dan");

        let mut unknown = CallDescriptor {
            tenant: TENANT.into(),
            account: USERS.into(),
            extra_fields: [("Cli".to_string(), "999".to_string())].into(),
            ..Default::default()
        };
        assert!(matches!(engine.load_user_profile(&mut unknown, false), Err(AppError::UserNotFound)));
    }

    #[tokio::test]
    async fn test_get_users_ranking_and_mask() {
        let engine = engine_with_tariffs().await;
        engine.set_user(profile("a", "x", r#"{"Tenant":"cgrates.org"}"#, 10.0)).await.unwrap();
        engine
            .set_user(profile("b", "x", r#"{"Tenant":"cgrates.org","Category":"call"}"#, 10.0))
            .await
            .unwrap();
        let mut masked = profile("c", "x", r#"{"Tenant":"cgrates.org"}"#, 50.0);
        masked.masked = true;
        engine.set_user(masked).await.unwrap();

        let object = json!({"Tenant": "cgrates.org", "Category": "call"});
        let names: Vec<String> = engine
            .get_users(&AttrGetUsers { object: object.clone(), masked: false })
            .unwrap()
            .into_iter()
            .map(|u| u.name)
            .collect();
        assert_eq!(names, ["b", "a"]);
        let all = engine.get_users(&AttrGetUsers { object, masked: true }).unwrap();
        assert_eq!(all[0].name, "c");
    }

    #[tokio::test]
    async fn test_index_update_and_remove() {
        let engine = engine_with_tariffs().await;
        engine.add_user_index(&["Account".to_string()]);
        engine.set_user(profile("u1", "dan", "{}", 0.0)).await.unwrap();
        assert_eq!(engine.user_indexes()["Account:dan"], vec!["cgrates.org:u1".to_string()]);

        engine.update_user(profile("u1", "rif", "", 5.0)).await.unwrap();
        let indexes = engine.user_indexes();
        assert!(!indexes.contains_key("Account:dan"));
        assert!(indexes.contains_key("Account:rif"));

        engine.remove_user(TENANT, "u1").await.unwrap();
        assert!(engine.user_indexes().is_empty());
        assert!(matches!(engine.remove_user(TENANT, "u1").await, Err(AppError::UserNotFound)));
    }

    #[tokio::test]
    async fn test_update_user_loads_from_storage() {
        let engine = std::sync::Arc::new(engine_with_tariffs().await);
        engine.set_user(profile("u2", "dan", "{}", 0.0)).await.unwrap();
        engine.users.inner.write().profiles.clear();

        let e = engine.clone();
        tokio::spawn(async move { e.update_user(profile("u2", "rif", "", 3.0)).await })
            .await
            .unwrap()
            .unwrap();
        let stored = engine.accounting.get_user(TENANT, "u2").await.unwrap();
        assert_eq!(stored.index["Account"], "rif");
        assert_eq!(stored.weight, 3.0);
    }

    #[tokio::test]
    async fn test_reload_from_storage() {
        let engine = engine_with_tariffs().await;
        engine.set_user(profile("u1", "dan", "{}", 0.0)).await.unwrap();
        engine.users.inner.write().profiles.clear();
        assert!(engine.users.is_empty());
        assert_eq!(engine.reload_users("").await.unwrap(), 1);
    }
}
