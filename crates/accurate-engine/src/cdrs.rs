//! CDR server: stores raw records, forks them into derived runs, rates
//! every run and feeds the results to stats and replication

use std::time::Duration as StdDuration;

use accurate_core::models::cdr::unrated_cost;
use accurate_core::models::{CallCost, Cdr, CdrsFilter, SmCost};
use accurate_core::utils::consts::{
    DEFAULT, META_NONE, META_POSTPAID, META_PREPAID, META_PSEUDOPREPAID, OUT, RAW,
};
use accurate_core::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::replication::fib_delays;
use crate::Engine;

/// Cost source of records rated by the CDR server
pub const CDRS_SOURCE: &str = "*cdrs";
/// Extra field narrowing the session-manager cost lookup by origin id
pub const ORIGIN_ID_PREFIX_FIELD: &str = "OriginIDPrefix";

const PROCESS_CDR_CACHE_PREFIX: &str = "PROCESS_CDR_";
const STORE_SM_COST_CACHE_PREFIX: &str = "STORE_SM_COST_";
const SM_COST_RETRY_UNIT: StdDuration = StdDuration::from_millis(100);

/// Session manager cost to remember until the CDR arrives
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct AttrStoreSmCost {
    pub cost: SmCost,
    /// Refuse the cost when one is already stored for the same run
    pub check_duplicate: bool,
}

/// Re-rating request over stored CDRs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct AttrRateCdrs {
    #[serde(flatten)]
    pub filter: CdrsFilter,
    pub store_cdrs: Option<bool>,
    #[serde(rename = "SendToStats")]
    pub send_to_stats: Option<bool>,
    #[serde(rename = "ReplicateCDRs")]
    pub replicate_cdrs: Option<bool>,
}

/// Where the results of a rating pass go
#[derive(Debug, Clone, Copy)]
struct Sinks {
    store: bool,
    stats: bool,
    replicate: bool,
}

fn debits_account(request_type: &str) -> bool {
    matches!(request_type, META_PREPAID | META_POSTPAID | META_PSEUDOPREPAID)
}

fn mark_failed(cdr: &mut Cdr, err: &AppError) {
    cdr.cost = unrated_cost();
    cdr.cost_details = None;
    cdr.extra_info = err.to_string();
}

impl Engine {
    /// Processes one incoming CDR
    ///
    /// A repeated (UniqueID, RunID) within the response cache TTL gets the
    /// first outcome back without being processed again.
    #[instrument(skip(self, cdr), fields(origin_id = %cdr.origin_id))]
    pub async fn process_cdr(&self, mut cdr: Cdr) -> AppResult<()> {
        if !self.cfg.cdrs.enabled {
            return Err(AppError::NotImplemented);
        }
        if cdr.unique_id.is_empty() {
            cdr.compute_unique_id();
        }
        let cache_key = format!("{}{}{}", PROCESS_CDR_CACHE_PREFIX, cdr.unique_id, cdr.run_id);
        if let Some(replied) = self.responses.get::<String>(&cache_key) {
            return replied.map(|_| ());
        }
        let out = self.process_cdr_uncached(cdr).await.map(|_| "OK".to_string());
        self.responses.set(&cache_key, &out);
        out.map(|_| ())
    }

    fn fill_cdr_defaults(&self, cdr: &mut Cdr) {
        if cdr.direction.is_empty() {
            cdr.direction = OUT.to_string();
        }
        if cdr.request_type.is_empty() {
            cdr.request_type = self.cfg.general.default_request_type.clone();
        }
        if cdr.tenant.is_empty() {
            cdr.tenant = self.cfg.general.default_tenant.clone();
        }
        if cdr.category.is_empty() {
            cdr.category = self.cfg.general.default_category.clone();
        }
        if cdr.subject.is_empty() {
            cdr.subject = cdr.account.clone();
        }
    }

    async fn process_cdr_uncached(&self, mut cdr: Cdr) -> AppResult<()> {
        self.fill_cdr_defaults(&mut cdr);
        if !cdr.rated {
            cdr.run_id = RAW.to_string();
        } else if cdr.run_id.is_empty() {
            cdr.run_id = DEFAULT.to_string();
        }
        if cdr.is_raw() {
            cdr.cost = unrated_cost();
        }
        if self.cfg.cdrs.store_cdrs {
            self.cdr_storage.set_cdr(&cdr, false).await?;
            debug!(unique_id = %cdr.unique_id, run_id = %cdr.run_id, "CDR stored");
        }
        if self.cfg.cdrs.stats_enabled {
            self.send_to_stats(&cdr).await;
        }
        self.replicate_cdr(&cdr).await;

        if self.cfg.cdrs.rals_enabled && !cdr.rated {
            let sinks = Sinks {
                store: self.cfg.cdrs.store_cdrs,
                stats: self.cfg.cdrs.stats_enabled,
                replicate: true,
            };
            self.derive_rate_store(&cdr, sinks).await?;
        }
        Ok(())
    }

    async fn send_to_stats(&self, cdr: &Cdr) {
        if let Err(e) = self.append_stats_cdr(cdr).await {
            warn!(unique_id = %cdr.unique_id, error = %e, "stats append failed");
        }
    }

    /// Forks, rates and dispatches `cdr`, returning the rated records
    async fn derive_rate_store(&self, cdr: &Cdr, sinks: Sinks) -> AppResult<Vec<Cdr>> {
        let forks = self.derive_cdrs(cdr).await?;
        let mut rated = Vec::with_capacity(forks.len());
        for fork in forks {
            match self.rate_cdr(fork).await {
                Ok(mut runs) => rated.append(&mut runs),
                Err(e) => warn!(unique_id = %cdr.unique_id, error = %e, "rating failed"),
            }
        }
        for out in &rated {
            if sinks.store {
                if let Err(e) = self.cdr_storage.set_cdr(out, true).await {
                    warn!(unique_id = %out.unique_id, run_id = %out.run_id, error = %e, "rated CDR not stored");
                }
            }
            if sinks.stats {
                self.send_to_stats(out).await;
            }
            if sinks.replicate {
                self.replicate_cdr(out).await;
            }
        }
        Ok(rated)
    }

    /// Derived runs of a raw CDR, a rated one passing through unchanged
    async fn derive_cdrs(&self, cdr: &Cdr) -> AppResult<Vec<Cdr>> {
        if !cdr.is_raw() {
            return Ok(vec![cdr.clone()]);
        }
        let mut base = cdr.clone();
        self.prepare_event(&mut base, true).await?;
        let mut out = Vec::new();
        for (_, mut fork) in self.derive_event(&base).await? {
            if let Err(e) = self.prepare_event(&mut fork, true).await {
                warn!(unique_id = %fork.unique_id, run_id = %fork.run_id, error = %e, "derived run dropped");
                continue;
            }
            fork.cost = unrated_cost();
            fork.cost_details = None;
            out.push(fork);
        }
        Ok(out)
    }

    /// Rated copies of one derived run
    ///
    /// A prepaid call may come back as several records when the session
    /// manager logged more than one cost for it. Rating failures are kept
    /// on the record instead of being returned.
    async fn rate_cdr(&self, mut cdr: Cdr) -> AppResult<Vec<Cdr>> {
        if cdr.request_type == META_NONE {
            return Ok(vec![cdr]);
        }
        let mut rated = Vec::new();
        if cdr.request_type == META_PREPAID && !cdr.usage.is_zero() {
            for sm in self.session_costs(&cdr).await? {
                let mut copy = cdr.clone();
                copy.origin_host = sm.origin_host;
                copy.origin_id = sm.origin_id;
                copy.cost_source = sm.cost_source;
                if let Some(mut cc) = sm.cost_details {
                    cc.update_rated_usage();
                    copy.cost = cc.cost;
                    copy.cost_details = Some(cc);
                }
                copy.extra_info.clear();
                rated.push(copy);
            }
        }
        if rated.is_empty() {
            match self.cost_from_rater(&mut cdr).await {
                Ok(mut cc) => {
                    cc.update_rated_usage();
                    cdr.cost = cc.cost;
                    cdr.cost_details = Some(cc);
                    cdr.extra_info.clear();
                }
                Err(e) => {
                    warn!(unique_id = %cdr.unique_id, run_id = %cdr.run_id, error = %e, "CDR not rated");
                    mark_failed(&mut cdr, &e);
                }
            }
            rated.push(cdr);
        }
        for out in rated.iter_mut() {
            self.finish_rated(out).await;
        }
        Ok(rated)
    }

    /// Session-manager costs of a prepaid run, retried while they may still
    /// be on their way
    async fn session_costs(&self, cdr: &Cdr) -> AppResult<Vec<SmCost>> {
        let prefix = cdr.extra_fields.get(ORIGIN_ID_PREFIX_FIELD).map(String::as_str).unwrap_or("");
        let attempts = self.cfg.cdrs.sm_cost_retries.max(1) as usize;
        let mut delays = fib_delays(SM_COST_RETRY_UNIT);
        for attempt in 1..=attempts {
            let found = self
                .cdr_storage
                .get_sm_costs(&cdr.unique_id, &cdr.run_id, "", prefix)
                .await?;
            if !found.is_empty() {
                return Ok(found);
            }
            if attempt < attempts {
                if let Some(delay) = delays.next() {
                    tokio::time::sleep(delay).await;
                }
            }
        }
        debug!(unique_id = %cdr.unique_id, run_id = %cdr.run_id, "no session manager cost");
        Ok(Vec::new())
    }

    /// Debits or prices one run depending on its request type
    async fn cost_from_rater(&self, cdr: &mut Cdr) -> AppResult<CallCost> {
        let mut cd = cdr.call_descriptor();
        cdr.cost_source = CDRS_SOURCE.to_string();
        if debits_account(&cdr.request_type) {
            return self.debit(&mut cd).await;
        }
        let cc = self.get_cost(&mut cd).await?;
        self.debit_rated_call(&cdr.tenant, &cdr.account, &cdr.category, cc.cost)
            .await?;
        Ok(cc)
    }

    /// Tax and account summary of a rated record
    async fn finish_rated(&self, cdr: &mut Cdr) {
        if cdr.cost.is_sign_negative() {
            return;
        }
        if let Some(tax) = self.tax_collaborator() {
            if let Err(e) = tax.apply(cdr).await {
                warn!(unique_id = %cdr.unique_id, collaborator = tax.name(), error = %e, "tax not applied");
                mark_failed(cdr, &e);
                return;
            }
        }
        if self.cfg.cdrs.account_summary && debits_account(&cdr.request_type) {
            match self.accounting.get_account(&cdr.tenant, &cdr.account).await {
                Ok(acc) => cdr.account_summary = Some(acc.as_summary()),
                Err(e) => debug!(account = %cdr.account, error = %e, "no account summary"),
            }
        }
    }

    /// Remembers a session manager cost for the CDR still to come
    #[instrument(skip(self, attr), fields(unique_id = %attr.cost.unique_id, run_id = %attr.cost.run_id))]
    pub async fn store_sm_cost(&self, attr: AttrStoreSmCost) -> AppResult<()> {
        if attr.cost.unique_id.is_empty() {
            return Err(AppError::missing(["UniqueID"]));
        }
        let cache_key = format!(
            "{}{}{}{}",
            STORE_SM_COST_CACHE_PREFIX, attr.cost.unique_id, attr.cost.run_id, attr.cost.origin_id
        );
        if let Some(replied) = self.responses.get::<String>(&cache_key) {
            return replied.map(|_| ());
        }
        let out = self.store_sm_cost_uncached(attr).await.map(|_| "OK".to_string());
        self.responses.set(&cache_key, &out);
        out.map(|_| ())
    }

    async fn store_sm_cost_uncached(&self, attr: AttrStoreSmCost) -> AppResult<()> {
        let AttrStoreSmCost { mut cost, check_duplicate } = attr;
        if let Some(cc) = cost.cost_details.as_mut() {
            cc.update_rated_usage();
        }
        if !check_duplicate {
            return self.cdr_storage.set_sm_cost(&cost).await;
        }
        let keys = vec![format!("{}{}{}{}", CDRS_SOURCE, cost.unique_id, cost.run_id, cost.origin_id)];
        self.guardian
            .guard(&keys, self.lock_timeout(), || async move {
                let existing = self
                    .cdr_storage
                    .get_sm_costs(&cost.unique_id, &cost.run_id, "", &cost.origin_id)
                    .await?;
                if !existing.is_empty() {
                    return Err(AppError::Exists);
                }
                self.cdr_storage.set_sm_cost(&cost).await
            })
            .await
    }

    /// Stored CDRs matching `filter` with the count before paging
    pub async fn get_cdrs(&self, filter: &CdrsFilter) -> AppResult<(Vec<Cdr>, usize)> {
        self.cdr_storage.get_cdrs(filter, false).await
    }

    /// Removes the stored CDRs matching `filter`, returning how many went
    pub async fn remove_cdrs(&self, filter: &CdrsFilter) -> AppResult<usize> {
        let (removed, _) = self.cdr_storage.get_cdrs(filter, true).await?;
        Ok(removed.len())
    }

    /// Re-rates the stored CDRs matching the filter
    ///
    /// Only raw records are forked again; rated ones are re-priced as they are.
    #[instrument(skip(self, attr))]
    pub async fn rate_cdrs(&self, attr: &AttrRateCdrs) -> AppResult<usize> {
        let (cdrs, _) = self.cdr_storage.get_cdrs(&attr.filter, false).await?;
        let sinks = Sinks {
            store: attr.store_cdrs.unwrap_or(self.cfg.cdrs.store_cdrs),
            stats: attr.send_to_stats.unwrap_or(self.cfg.cdrs.stats_enabled),
            replicate: attr.replicate_cdrs.unwrap_or(false),
        };
        let mut rated = 0;
        for cdr in cdrs {
            if cdr.rated && !cdr.is_raw() {
                continue;
            }
            match self.derive_rate_store(&cdr, sinks).await {
                Ok(out) => rated += out.len(),
                Err(e) => warn!(unique_id = %cdr.unique_id, error = %e, "CDR not re-rated"),
            }
        }
        info!(rated, "CDRs re-rated");
        Ok(rated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::*;
    use accurate_core::models::{DerivedCharger, DerivedChargerGroup};
    use accurate_core::utils::consts::META_RATED;
    use accurate_core::AppConfig;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn raw_cdr(origin_id: &str, account: &str, request_type: &str, secs: i64) -> Cdr {
        Cdr {
            origin_id: origin_id.into(),
            origin_host: "192.168.1.1".into(),
            source: "test".into(),
            request_type: request_type.into(),
            tenant: TENANT.into(),
            category: "call".into(),
            account: account.into(),
            destination: "0723045326".into(),
            setup_time: call_start(),
            answer_time: call_start(),
            usage: Duration::seconds(secs),
            ..Default::default()
        }
    }

    async fn stored(engine: &Engine, run_id: &str) -> Vec<Cdr> {
        let filter = CdrsFilter {
            run_ids: vec![run_id.to_string()],
            ..Default::default()
        };
        engine.get_cdrs(&filter).await.unwrap().0
    }

    #[tokio::test]
    async fn test_raw_and_default_run_stored() {
        let engine = engine_with_tariffs().await;
        engine.process_cdr(raw_cdr("call1", "dan", META_RATED, 60)).await.unwrap();

        let raw = stored(&engine, RAW).await;
        assert_eq!(raw.len(), 1);
        assert_eq!(raw[0].cost, dec!(-1));
        assert_eq!(raw[0].subject, "dan");

        let rated = stored(&engine, DEFAULT).await;
        assert_eq!(rated.len(), 1);
        assert_eq!(rated[0].cost, dec!(0.6));
        assert_eq!(rated[0].cost_source, CDRS_SOURCE);
        assert_eq!(rated[0].unique_id, raw[0].unique_id);
    }

    #[tokio::test]
    async fn test_duplicate_returns_first_outcome() {
        let engine = engine_with_tariffs().await;
        let cdr = raw_cdr("call1", "dan", META_RATED, 60);
        engine.process_cdr(cdr.clone()).await.unwrap();
        engine.process_cdr(cdr).await.unwrap();
        assert_eq!(stored(&engine, RAW).await.len(), 1);
        assert_eq!(stored(&engine, DEFAULT).await.len(), 1);
    }

    #[tokio::test]
    async fn test_postpaid_debits_account() {
        let engine = engine_with_tariffs().await;
        funded(&engine, "dan", dec!(10)).await;
        engine.process_cdr(raw_cdr("call1", "dan", META_POSTPAID, 60)).await.unwrap();
        assert_eq!(money(&engine, "dan").await, dec!(9.4));
        assert_eq!(stored(&engine, DEFAULT).await[0].cost, dec!(0.6));
    }

    struct Vat {
        fail: bool,
    }

    #[async_trait::async_trait]
    impl accurate_core::traits::TaxCollaborator for Vat {
        fn name(&self) -> &str {
            "vat"
        }

        async fn apply(&self, cdr: &mut Cdr) -> AppResult<()> {
            if self.fail {
                return Err(AppError::ServerError("tax service down".into()));
            }
            cdr.cost *= dec!(1.2);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_tax_collaborator() {
        let mut cfg = AppConfig::default();
        cfg.cdrs.tax_collaborator = "vat".into();
        let engine = engine_with_config(cfg.clone()).await;
        engine.register_tax_collaborator(std::sync::Arc::new(Vat { fail: false }));
        engine.process_cdr(raw_cdr("call1", "dan", META_RATED, 60)).await.unwrap();
        assert_eq!(stored(&engine, DEFAULT).await[0].cost, dec!(0.72));

        let engine = engine_with_config(cfg).await;
        engine.register_tax_collaborator(std::sync::Arc::new(Vat { fail: true }));
        engine.process_cdr(raw_cdr("call2", "dan", META_RATED, 60)).await.unwrap();
        let rated = stored(&engine, DEFAULT).await;
        assert_eq!(rated[0].cost, dec!(-1));
        assert!(rated[0].extra_info.contains("tax service down"));
    }

    #[tokio::test]
    async fn test_rating_error_kept_on_record() {
        let engine = engine_with_tariffs().await;
        engine.process_cdr(raw_cdr("call1", "ghost", META_POSTPAID, 60)).await.unwrap();
        let rated = stored(&engine, DEFAULT).await;
        assert_eq!(rated[0].cost, dec!(-1));
        assert_eq!(rated[0].extra_info, AppError::AccountNotFound.to_string());
    }

    #[tokio::test]
    async fn test_prepaid_joins_session_cost() {
        let mut cfg = AppConfig::default();
        cfg.cdrs.sm_cost_retries = 1;
        let engine = engine_with_config(cfg).await;
        funded(&engine, "dan", dec!(10)).await;
        let mut cdr = raw_cdr("call1", "dan", META_PREPAID, 60);
        cdr.compute_unique_id();

        let cc = CallCost {
            cost: dec!(0.42),
            ..Default::default()
        };
        engine
            .store_sm_cost(AttrStoreSmCost {
                cost: SmCost {
                    unique_id: cdr.unique_id.clone(),
                    run_id: DEFAULT.into(),
                    origin_host: "sm1".into(),
                    origin_id: "call1".into(),
                    cost_source: "*sessionmanager".into(),
                    usage: 60.0,
                    cost_details: Some(cc),
                },
                check_duplicate: true,
            })
            .await
            .unwrap();

        engine.process_cdr(cdr).await.unwrap();
        let rated = stored(&engine, DEFAULT).await;
        assert_eq!(rated[0].cost, dec!(0.42));
        assert_eq!(rated[0].cost_source, "*sessionmanager");
        assert_eq!(money(&engine, "dan").await, dec!(10));
    }

    #[tokio::test]
    async fn test_prepaid_without_session_cost_debits() {
        let mut cfg = AppConfig::default();
        cfg.cdrs.sm_cost_retries = 1;
        let engine = engine_with_config(cfg).await;
        funded(&engine, "dan", dec!(10)).await;
        engine.process_cdr(raw_cdr("call1", "dan", META_PREPAID, 60)).await.unwrap();
        assert_eq!(money(&engine, "dan").await, dec!(9.4));
    }

    #[tokio::test]
    async fn test_sm_cost_duplicate_refused() {
        let mut cfg = AppConfig::default();
        cfg.general.response_cache_ttl_secs = 0;
        let engine = engine_with_config(cfg).await;
        let cost = SmCost {
            unique_id: "u1".into(),
            run_id: DEFAULT.into(),
            origin_id: "o1".into(),
            ..Default::default()
        };
        engine
            .store_sm_cost(AttrStoreSmCost { cost: cost.clone(), check_duplicate: true })
            .await
            .unwrap();
        assert_eq!(
            engine
                .store_sm_cost(AttrStoreSmCost { cost: cost.clone(), check_duplicate: true })
                .await,
            Err(AppError::Exists)
        );
        engine
            .store_sm_cost(AttrStoreSmCost { cost, check_duplicate: false })
            .await
            .unwrap();
        assert!(matches!(
            engine.store_sm_cost(AttrStoreSmCost::default()).await,
            Err(AppError::MandatoryIeMissing(_))
        ));
    }

    #[tokio::test]
    async fn test_derived_runs_and_none_kept() {
        let engine = engine_with_tariffs().await;
        let group = DerivedChargerGroup {
            direction: OUT.into(),
            tenant: TENANT.into(),
            category: "call".into(),
            account: "dan".into(),
            subject: "dan".into(),
            chargers: vec![
                DerivedCharger::new("extra1", "", r#"{"Subject":{"$set":"rif"}}"#).unwrap(),
                DerivedCharger::new("extra2", "", r#"{"RequestType":{"$set":"*none"}}"#).unwrap(),
            ],
            ..Default::default()
        };
        engine.tariff.set_derived_chargers(&group, None).await.unwrap();
        engine.process_cdr(raw_cdr("call1", "dan", META_RATED, 60)).await.unwrap();

        assert_eq!(stored(&engine, DEFAULT).await[0].cost, dec!(0.6));
        let extra1 = stored(&engine, "extra1").await;
        assert_eq!(extra1[0].subject, "rif");
        assert_eq!(extra1[0].cost, dec!(1.2));
        let extra2 = stored(&engine, "extra2").await;
        assert_eq!(extra2[0].cost, dec!(-1));
    }

    #[tokio::test]
    async fn test_rate_cdrs_again() {
        let mut cfg = AppConfig::default();
        cfg.cdrs.rals_enabled = false;
        let engine = engine_with_config(cfg).await;
        engine.process_cdr(raw_cdr("call1", "dan", META_RATED, 60)).await.unwrap();
        assert!(stored(&engine, DEFAULT).await.is_empty());

        let attr = AttrRateCdrs {
            filter: CdrsFilter {
                run_ids: vec![RAW.into()],
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(engine.rate_cdrs(&attr).await.unwrap(), 1);
        assert_eq!(stored(&engine, DEFAULT).await[0].cost, dec!(0.6));
    }

    #[tokio::test]
    async fn test_disabled_server() {
        let mut cfg = AppConfig::default();
        cfg.cdrs.enabled = false;
        let engine = engine_with_config(cfg).await;
        assert_eq!(
            engine.process_cdr(raw_cdr("call1", "dan", META_RATED, 60)).await,
            Err(AppError::NotImplemented)
        );
    }
}
