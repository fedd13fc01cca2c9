//! Tariff plan store: destinations, rating plans and profiles, LCR rules,
//! derived chargers, action groups and plans, trigger groups, shared groups
//! and stats queue configurations

use accurate_cache::{keys, Cached};
use accurate_core::models::{
    destination::sort_by_precision, rating::split_prefix, ActionGroup, ActionPlan,
    ActionTriggerGroup, CdrStats, DerivedChargerGroup, Destination, Lcr, RatingPlan,
    RatingProfile, SharedGroup,
};
use accurate_core::{AppError, AppResult};
use tracing::instrument;

use crate::store::{CacheMode, Store};

/// How destinations are looked up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestStrategy {
    /// Code and/or name equal the given ones
    Exact,
    /// Every destination holding a prefix of the dialled number, longest first
    Matching,
}

impl DestStrategy {
    fn tag(self) -> &'static str {
        match self {
            DestStrategy::Exact => "exact",
            DestStrategy::Matching => "matching",
        }
    }
}

#[derive(Clone)]
pub struct TariffPlanStore {
    store: Store,
    min_prefix_len: usize,
}

const FAMILIES: &[&str] = &[
    keys::DESTINATION_PREFIX,
    keys::REVERSE_DESTINATION_PREFIX,
    keys::RATING_PLAN_PREFIX,
    keys::ACTION_PREFIX,
    keys::ACTION_PLAN_PREFIX,
    keys::ACTION_TRIGGER_PREFIX,
    keys::SHARED_GROUP_PREFIX,
    keys::CDR_STATS_PREFIX,
];

impl TariffPlanStore {
    pub fn new(store: Store, min_prefix_len: usize) -> Self {
        Self {
            store,
            min_prefix_len,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    // ==================== Destinations ====================

    /// Stores a destination code and indexes it by code
    #[instrument(skip(self, dest, trans_id), fields(code = %dest.code, name = %dest.name))]
    pub async fn set_destination(&self, dest: &Destination, trans_id: Option<&str>) -> AppResult<()> {
        let key = keys::destination_key(&dest.tenant, &dest.code, &dest.name);
        self.store.set(&dest.tenant, &key, dest, trans_id).await?;
        let rkey = keys::reverse_destination_key(&dest.tenant, &dest.code);
        let mut names: Vec<String> = self
            .store
            .get_opt(&dest.tenant, &rkey, CacheMode::Live)
            .await?
            .unwrap_or_default();
        if !names.contains(&dest.name) {
            names.push(dest.name.clone());
        }
        self.store.set(&dest.tenant, &rkey, &names, trans_id).await?;
        self.forget_destination_results(&dest.tenant, trans_id);
        Ok(())
    }

    pub async fn remove_destination(
        &self,
        tenant: &str,
        code: &str,
        name: &str,
        trans_id: Option<&str>,
    ) -> AppResult<()> {
        let key = keys::destination_key(tenant, code, name);
        if !self.store.remove(tenant, &key, trans_id).await? {
            return Err(AppError::NotFound);
        }
        let rkey = keys::reverse_destination_key(tenant, code);
        let mut names: Vec<String> = self
            .store
            .get_opt(tenant, &rkey, CacheMode::Live)
            .await?
            .unwrap_or_default();
        names.retain(|n| n != name);
        if names.is_empty() {
            self.store.remove(tenant, &rkey, trans_id).await?;
        } else {
            self.store.set(tenant, &rkey, &names, trans_id).await?;
        }
        self.forget_destination_results(tenant, trans_id);
        Ok(())
    }

    /// Drops every resolved lookup of the tenant after a destination change
    fn forget_destination_results(&self, tenant: &str, trans_id: Option<&str>) {
        self.store
            .cache()
            .remove_prefix(tenant, keys::DESTINATION_RESULT_PREFIX, trans_id);
    }

    /// Destination names holding exactly `code`, in insertion order
    async fn names_for_code(&self, tenant: &str, code: &str, mode: CacheMode) -> AppResult<Vec<String>> {
        let rkey = keys::reverse_destination_key(tenant, code);
        Ok(self.store.get_opt(tenant, &rkey, mode).await?.unwrap_or_default())
    }

    /// Destinations for a code and/or name; `NOT_FOUND` when none qualify
    ///
    /// With [`DestStrategy::Matching`] `code` is a dialled number and the
    /// result is ordered longest code first. An empty `name` matches any.
    pub async fn get_destinations(
        &self,
        tenant: &str,
        code: &str,
        name: &str,
        strategy: DestStrategy,
        mode: CacheMode,
    ) -> AppResult<Vec<Destination>> {
        let result_key = keys::destination_result_key(tenant, code, name, strategy.tag());
        if mode == CacheMode::Cached {
            match self.store.cache().get::<Vec<Destination>>(tenant, &result_key) {
                Cached::Hit(found) => return Ok((*found).clone()),
                Cached::Absent => return Err(AppError::NotFound),
                Cached::Miss => {}
            }
        }
        let mut out = Vec::new();
        match strategy {
            DestStrategy::Exact if code.is_empty() => {
                let prefix = format!("{}{}:", keys::DESTINATION_PREFIX, tenant);
                let all: Vec<Destination> = self.store.range(&prefix, 0, None).await?;
                out.extend(all.into_iter().filter(|d| name.is_empty() || d.name == name));
            }
            DestStrategy::Exact => {
                for n in self.names_for_code(tenant, code, mode).await? {
                    if name.is_empty() || n == name {
                        out.push(Destination::new(tenant, code, n));
                    }
                }
            }
            DestStrategy::Matching => {
                for prefix in split_prefix(code, self.min_prefix_len) {
                    for n in self.names_for_code(tenant, prefix, mode).await? {
                        if name.is_empty() || n == name {
                            out.push(Destination::new(tenant, prefix, n));
                        }
                    }
                }
                sort_by_precision(&mut out);
            }
        }
        if mode != CacheMode::Live {
            let cached = (!out.is_empty()).then(|| out.clone());
            self.store.cache().set(tenant, &result_key, cached, None);
        }
        if out.is_empty() {
            return Err(AppError::NotFound);
        }
        Ok(out)
    }

    /// Names of the destinations matching a dialled number, best first
    pub async fn destination_names(&self, tenant: &str, number: &str) -> AppResult<Vec<String>> {
        match self
            .get_destinations(tenant, number, "", DestStrategy::Matching, CacheMode::Cached)
            .await
        {
            Ok(dests) => Ok(dests.into_iter().map(|d| d.name).collect()),
            Err(AppError::NotFound) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    // ==================== Rating ====================

    pub async fn set_rating_plan(&self, rp: &RatingPlan, trans_id: Option<&str>) -> AppResult<()> {
        let key = keys::rating_plan_key(&rp.tenant, &rp.name);
        self.store.set(&rp.tenant, &key, rp, trans_id).await
    }

    pub async fn get_rating_plan(&self, tenant: &str, name: &str, mode: CacheMode) -> AppResult<RatingPlan> {
        self.store
            .get(tenant, &keys::rating_plan_key(tenant, name), mode)
            .await
            .map_err(|e| match e {
                AppError::NotFound => AppError::RatingPlanNotFound,
                other => other,
            })
    }

    pub async fn set_rating_profile(&self, rpf: &RatingProfile, trans_id: Option<&str>) -> AppResult<()> {
        let key = keys::rating_profile_key(&rpf.direction, &rpf.tenant, &rpf.category, &rpf.subject);
        self.store.set(&rpf.tenant, &key, rpf, trans_id).await
    }

    pub async fn remove_rating_profile(
        &self,
        direction: &str,
        tenant: &str,
        category: &str,
        subject: &str,
        trans_id: Option<&str>,
    ) -> AppResult<bool> {
        let key = keys::rating_profile_key(direction, tenant, category, subject);
        self.store.remove(tenant, &key, trans_id).await
    }

    /// Profile for the subject; with `prefix_matching` the longest stored
    /// prefix of the subject wins
    pub async fn get_rating_profile(
        &self,
        direction: &str,
        tenant: &str,
        category: &str,
        subject: &str,
        prefix_matching: bool,
        mode: CacheMode,
    ) -> AppResult<RatingProfile> {
        if !prefix_matching {
            let key = keys::rating_profile_key(direction, tenant, category, subject);
            return self.store.get(tenant, &key, mode).await;
        }
        for p in split_prefix(subject, 1) {
            let key = keys::rating_profile_key(direction, tenant, category, p);
            if let Some(rpf) = self.store.get_opt(tenant, &key, mode).await? {
                return Ok(rpf);
            }
        }
        Err(AppError::NotFound)
    }

    /// Profiles of one (direction, tenant, category), as used by LCR suppliers
    pub async fn rating_profiles_for_category(
        &self,
        direction: &str,
        tenant: &str,
        category: &str,
    ) -> AppResult<Vec<RatingProfile>> {
        let prefix = keys::rating_profile_key(direction, tenant, category, "");
        self.store.range(&prefix, 0, None).await
    }

    // ==================== LCR and chargers ====================

    pub async fn set_lcr(&self, lcr: &Lcr, trans_id: Option<&str>) -> AppResult<()> {
        let key = keys::lcr_key(&lcr.direction, &lcr.tenant, &lcr.category, &lcr.account, &lcr.subject);
        self.store.set(&lcr.tenant, &key, lcr, trans_id).await
    }

    pub async fn get_lcr(
        &self,
        direction: &str,
        tenant: &str,
        category: &str,
        account: &str,
        subject: &str,
        mode: CacheMode,
    ) -> AppResult<Lcr> {
        let key = keys::lcr_key(direction, tenant, category, account, subject);
        self.store.get(tenant, &key, mode).await
    }

    pub async fn set_derived_chargers(&self, dcs: &DerivedChargerGroup, trans_id: Option<&str>) -> AppResult<()> {
        let key = keys::derived_chargers_key(&dcs.direction, &dcs.tenant, &dcs.category, &dcs.account, &dcs.subject);
        self.store.set(&dcs.tenant, &key, dcs, trans_id).await
    }

    pub async fn get_derived_chargers(
        &self,
        direction: &str,
        tenant: &str,
        category: &str,
        account: &str,
        subject: &str,
        mode: CacheMode,
    ) -> AppResult<DerivedChargerGroup> {
        let key = keys::derived_chargers_key(direction, tenant, category, account, subject);
        self.store.get(tenant, &key, mode).await
    }

    pub async fn remove_derived_chargers(
        &self,
        direction: &str,
        tenant: &str,
        category: &str,
        account: &str,
        subject: &str,
        trans_id: Option<&str>,
    ) -> AppResult<bool> {
        let key = keys::derived_chargers_key(direction, tenant, category, account, subject);
        self.store.remove(tenant, &key, trans_id).await
    }

    // ==================== Actions ====================

    pub async fn set_action_group(&self, ag: &ActionGroup, trans_id: Option<&str>) -> AppResult<()> {
        let key = keys::action_group_key(&ag.tenant, &ag.name);
        self.store.set(&ag.tenant, &key, ag, trans_id).await
    }

    pub async fn get_action_group(&self, tenant: &str, name: &str, mode: CacheMode) -> AppResult<ActionGroup> {
        self.store.get(tenant, &keys::action_group_key(tenant, name), mode).await
    }

    pub async fn remove_action_group(&self, tenant: &str, name: &str, trans_id: Option<&str>) -> AppResult<bool> {
        self.store.remove(tenant, &keys::action_group_key(tenant, name), trans_id).await
    }

    pub async fn set_action_plan(&self, ap: &ActionPlan, trans_id: Option<&str>) -> AppResult<()> {
        let key = keys::action_plan_key(&ap.tenant, &ap.name);
        self.store.set(&ap.tenant, &key, ap, trans_id).await
    }

    pub async fn get_action_plan(&self, tenant: &str, name: &str, mode: CacheMode) -> AppResult<ActionPlan> {
        self.store.get(tenant, &keys::action_plan_key(tenant, name), mode).await
    }

    pub async fn remove_action_plan(&self, tenant: &str, name: &str, trans_id: Option<&str>) -> AppResult<bool> {
        self.store.remove(tenant, &keys::action_plan_key(tenant, name), trans_id).await
    }

    /// Every action plan of every tenant
    pub async fn action_plans(&self) -> AppResult<Vec<ActionPlan>> {
        self.store.range(keys::ACTION_PLAN_PREFIX, 0, None).await
    }

    pub async fn set_action_trigger_group(&self, atg: &ActionTriggerGroup, trans_id: Option<&str>) -> AppResult<()> {
        let key = keys::action_trigger_key(&atg.tenant, &atg.name);
        self.store.set(&atg.tenant, &key, atg, trans_id).await
    }

    pub async fn get_action_trigger_group(
        &self,
        tenant: &str,
        name: &str,
        mode: CacheMode,
    ) -> AppResult<ActionTriggerGroup> {
        self.store.get(tenant, &keys::action_trigger_key(tenant, name), mode).await
    }

    pub async fn remove_action_trigger_group(&self, tenant: &str, name: &str, trans_id: Option<&str>) -> AppResult<bool> {
        self.store.remove(tenant, &keys::action_trigger_key(tenant, name), trans_id).await
    }

    pub async fn set_shared_group(&self, sg: &SharedGroup, trans_id: Option<&str>) -> AppResult<()> {
        let key = keys::shared_group_key(&sg.tenant, &sg.name);
        self.store.set(&sg.tenant, &key, sg, trans_id).await
    }

    pub async fn get_shared_group(&self, tenant: &str, name: &str, mode: CacheMode) -> AppResult<SharedGroup> {
        self.store.get(tenant, &keys::shared_group_key(tenant, name), mode).await
    }

    // ==================== Stats ====================

    pub async fn set_cdr_stats(&self, cs: &CdrStats, trans_id: Option<&str>) -> AppResult<()> {
        let key = keys::cdr_stats_key(&cs.tenant, &cs.name);
        self.store.set(&cs.tenant, &key, cs, trans_id).await
    }

    pub async fn get_cdr_stats(&self, tenant: &str, name: &str, mode: CacheMode) -> AppResult<CdrStats> {
        self.store.get(tenant, &keys::cdr_stats_key(tenant, name), mode).await
    }

    pub async fn remove_cdr_stats(&self, tenant: &str, name: &str, trans_id: Option<&str>) -> AppResult<bool> {
        self.store.remove(tenant, &keys::cdr_stats_key(tenant, name), trans_id).await
    }

    /// Stats queue configurations, of one tenant or all when empty
    pub async fn all_cdr_stats(&self, tenant: &str) -> AppResult<Vec<CdrStats>> {
        let prefix = if tenant.is_empty() {
            keys::CDR_STATS_PREFIX.to_string()
        } else {
            format!("{}{}:", keys::CDR_STATS_PREFIX, tenant)
        };
        self.store.range(&prefix, 0, None).await
    }

    /// Drops every tariff plan entity of the tenant
    pub async fn remove_tenant(&self, tenant: &str) -> AppResult<usize> {
        let mut n = self.store.remove_tenant(tenant, FAMILIES).await?;
        // keys of these families start with the direction
        for family in [
            keys::RATING_PROFILE_PREFIX,
            keys::LCR_PREFIX,
            keys::DERIVED_CHARGERS_PREFIX,
        ] {
            for key in self.store.keys(family).await? {
                if key.split(':').nth(1) == Some(tenant) {
                    self.store.remove(tenant, &key, None).await?;
                    n += 1;
                }
            }
        }
        Ok(n)
    }
}
