//! Alias service: stored rewrites applied to requests before rating
//!
//! An alias is looked up by (direction, category, account, subject) with
//! `*any` fallbacks, the most specific key winning; the context must match
//! exactly.

use std::collections::BTreeMap;

use accurate_core::models::alias::alias_key;
use accurate_core::models::{Alias, AttrAddAlias, AttrAlias, AttrReverseAlias, CallDescriptor};
use accurate_core::utils::consts::{ALIAS_CONTEXT_RATING, ANY};
use accurate_core::{AppError, AppResult};
use accurate_db::CacheMode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, instrument};

use crate::Engine;

/// Candidate keys for `attr`, most specific first
fn candidate_keys(attr: &AttrAlias) -> Vec<String> {
    let fields = [&attr.direction, &attr.category, &attr.account, &attr.subject];
    let mut keys: Vec<(usize, String)> = Vec::with_capacity(16);
    for mask in 0u8..16 {
        let pick = |i: usize| {
            if mask & (1 << (3 - i)) != 0 || fields[i].is_empty() {
                ANY
            } else {
                fields[i].as_str()
            }
        };
        let key = alias_key(pick(0), pick(1), pick(2), pick(3), &attr.context);
        let precision = (0..4).filter(|&i| pick(i) != ANY).count();
        if !keys.iter().any(|(_, k)| *k == key) {
            keys.push((precision, key));
        }
    }
    keys.sort_by(|a, b| b.0.cmp(&a.0));
    keys.into_iter().map(|(_, k)| k).collect()
}

impl Engine {
    /// Stores an alias; without `overwrite` the values are merged into the
    /// stored ones by destination
    #[instrument(skip(self, attr), fields(alias = %attr.alias.full_id()))]
    pub async fn set_alias(&self, attr: AttrAddAlias) -> AppResult<()> {
        let AttrAddAlias { mut alias, overwrite } = attr;
        if alias.tenant.is_empty() {
            return Err(AppError::missing(["Tenant"]));
        }
        for v in &alias.values {
            v.query()?;
        }
        if !overwrite {
            if let Some(mut old) = self
                .accounting
                .get_alias_opt(&alias.tenant, &alias.full_id(), CacheMode::Cached)
                .await?
            {
                old.merge_values(alias.values);
                for idx in alias.index {
                    if !old.index.contains(&idx) {
                        old.index.push(idx);
                    }
                }
                alias = old;
            }
        }
        self.accounting.set_alias(&alias).await
    }

    /// The alias stored under exactly the given key fields
    pub async fn get_alias(&self, al: &Alias) -> AppResult<Alias> {
        self.accounting
            .get_alias(&al.tenant, &al.full_id(), CacheMode::Cached)
            .await
    }

    pub async fn remove_alias(&self, al: &Alias) -> AppResult<()> {
        self.accounting.remove_alias(&al.tenant, &al.full_id()).await
    }

    /// Aliases rewriting `target` into `alias`, grouped by the destination
    /// of the value doing it
    pub async fn get_reverse_alias(&self, attr: &AttrReverseAlias) -> AppResult<BTreeMap<String, Vec<Alias>>> {
        let mut out: BTreeMap<String, Vec<Alias>> = BTreeMap::new();
        let ids = self
            .accounting
            .reverse_alias(&attr.tenant, &attr.context, &attr.target, &attr.alias)
            .await?;
        for id in ids {
            let Some(al) = self.accounting.get_alias_opt(&attr.tenant, &id, CacheMode::Cached).await? else {
                continue;
            };
            if let Some(v) = al.has_reverse(&attr.target, &attr.alias) {
                let dest = v.destination_id.clone();
                out.entry(dest).or_default().push(al);
            }
        }
        Ok(out)
    }

    /// Most specific alias for the request attributes
    pub async fn get_matching_alias(&self, attr: &AttrAlias) -> AppResult<Alias> {
        for key in candidate_keys(attr) {
            if let Some(al) = self.accounting.get_alias_opt(&attr.tenant, &key, CacheMode::Cached).await? {
                return Ok(al);
            }
        }
        Err(AppError::NotFound)
    }

    /// Applies the matching alias value to `target`
    ///
    /// Returns false when no alias or no value applies.
    pub async fn load_alias<T>(&self, attr: &AttrAlias, target: &mut T) -> AppResult<bool>
    where
        T: Serialize + DeserializeOwned,
    {
        let al = match self.get_matching_alias(attr).await {
            Ok(al) => al,
            Err(AppError::NotFound) => return Ok(false),
            Err(e) => return Err(e),
        };
        let dest_names = if attr.destination.is_empty() || attr.destination == ANY {
            Vec::new()
        } else {
            self.tariff.destination_names(&attr.tenant, &attr.destination).await?
        };
        let Some(value) = al.select_value(&attr.destination, &dest_names) else {
            return Ok(false);
        };
        let applied = value.query()?.apply(target)?;
        debug!(alias = %al.full_id(), destination = %value.destination_id, applied, "alias applied");
        Ok(applied)
    }

    /// Fills defaults, `*users` markers and rating aliases of a request
    /// descriptor before it reaches the rating services
    pub(crate) async fn prepare_descriptor(&self, cd: &mut CallDescriptor) -> AppResult<()> {
        self.normalize_descriptor(cd);
        self.load_user_profile(cd, false)?;
        let attr = AttrAlias {
            direction: cd.direction.clone(),
            tenant: cd.tenant.clone(),
            category: cd.category.clone(),
            account: cd.account.clone(),
            subject: cd.subject.clone(),
            context: ALIAS_CONTEXT_RATING.to_string(),
            destination: cd.destination.clone(),
        };
        self.load_alias(&attr, cd).await.map(|_| ())
    }
}
