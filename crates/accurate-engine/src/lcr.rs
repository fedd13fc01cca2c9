//! Least cost routing: supplier lists for a dialled destination

use std::collections::BTreeMap;

use accurate_core::models::lcr::{STRATEGY_LOAD, STRATEGY_QOS, STRATEGY_QOS_THRESHOLD, STRATEGY_STATIC};
use accurate_core::models::stats::{stats_na, ACC, ACD, ASR, DDC, PDD, TCC, TCD};
use accurate_core::models::{
    AttrStatsQueueId, CallCost, CallDescriptor, Lcr, LcrCost, LcrEntry, LcrReply, LcrRequest, LcrSupplierCost,
    RatingProfile,
};
use accurate_core::utils::concatenated_key;
use accurate_core::utils::consts::ANY;
use accurate_core::{AppError, AppResult};
use accurate_db::{CacheMode, DestStrategy};
use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{debug, instrument, warn};

use crate::Engine;

const LCR_CACHE_PREFIX: &str = "GET_LCR_";

const QOS_METRICS: [&str; 7] = [ASR, PDD, ACD, TCD, ACC, TCC, DDC];

/// Rule keys tried for a request, most specific first
fn rule_keys(cd: &CallDescriptor) -> [[&str; 5]; 6] {
    let (d, t, c, a, s) = (
        cd.direction.as_str(),
        cd.tenant.as_str(),
        cd.category.as_str(),
        cd.account.as_str(),
        cd.subject.as_str(),
    );
    [
        [d, t, c, a, s],
        [d, t, c, a, ANY],
        [d, t, c, ANY, ANY],
        [d, t, ANY, ANY, ANY],
        [d, ANY, ANY, ANY, ANY],
        [ANY, ANY, ANY, ANY, ANY],
    ]
}

/// Mean of the available values per metric, not available when none are
fn average_qos(samples: &[BTreeMap<String, Decimal>], decimals: u32) -> BTreeMap<String, Decimal> {
    QOS_METRICS
        .iter()
        .map(|metric| {
            let values: Vec<Decimal> = samples
                .iter()
                .filter_map(|s| s.get(*metric).copied())
                .filter(|v| *v > stats_na())
                .collect();
            let avg = if values.is_empty() {
                stats_na()
            } else {
                (values.iter().sum::<Decimal>() / Decimal::from(values.len())).round_dp(decimals)
            };
            (metric.to_string(), avg)
        })
        .collect()
}

fn stat_queue_ids(rpf: &RatingProfile) -> Vec<String> {
    rpf.rating_plan_activations
        .iter()
        .flat_map(|rpa| rpa.cdr_stat_queue_ids.iter())
        .map(|id| id.trim())
        .filter(|id| !id.is_empty())
        .map(String::from)
        .collect()
}

impl Engine {
    /// Most specific routing rule for the descriptor
    pub async fn get_lcr_rule(&self, cd: &CallDescriptor) -> AppResult<Option<Lcr>> {
        for [d, t, c, a, s] in rule_keys(cd) {
            match self.tariff.get_lcr(d, t, c, a, s, CacheMode::Cached).await {
                Ok(lcr) => return Ok(Some(lcr)),
                Err(AppError::NotFound) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// Ordered suppliers for a routing request
    ///
    /// Replies are remembered per (UniqueID, RunID) when the request
    /// carries a unique id.
    #[instrument(skip(self, req), fields(account = %req.account, destination = %req.destination))]
    pub async fn get_lcr(&self, req: &LcrRequest) -> AppResult<LcrReply> {
        let cache_key = (!req.unique_id.is_empty())
            .then(|| format!("{}{}:{}", LCR_CACHE_PREFIX, req.unique_id, req.run_id));
        if let Some(key) = &cache_key {
            if let Some(replied) = self.responses.get::<LcrReply>(key) {
                return replied;
            }
        }
        let out = self.lcr_reply(req).await;
        if let Some(key) = &cache_key {
            self.responses.set(key, &out);
        }
        out
    }

    async fn lcr_reply(&self, req: &LcrRequest) -> AppResult<LcrReply> {
        let mut cd = req.as_call_descriptor(
            &self.cfg.general.default_tenant,
            &self.cfg.general.default_category,
            Utc::now(),
        )?;
        self.prepare_descriptor(&mut cd).await?;
        let mut lc = self.lcr_cost(&cd).await?;
        if lc.entry.is_none() {
            return Err(AppError::NotFound);
        }
        lc.filter_and_page(req);
        Ok(lc.as_reply(req.ignore_errors))
    }

    /// Costs of every supplier of the matching routing entry, sorted by
    /// the entry's strategy
    pub async fn lcr_cost(&self, cd: &CallDescriptor) -> AppResult<LcrCost> {
        let lcr = self.get_lcr_rule(cd).await?.ok_or(AppError::NotFound)?;
        let dests = match self
            .tariff
            .get_destinations(&cd.tenant, &cd.destination, "", DestStrategy::Matching, CacheMode::Cached)
            .await
        {
            Ok(d) => d,
            Err(AppError::NotFound) => Vec::new(),
            Err(e) => return Err(e),
        };
        let Some(activation) = lcr.active_between(cd.time_start, cd.time_end).into_iter().next() else {
            return Ok(LcrCost::default());
        };
        let Some(entry) = activation.entry_for_destinations(&dests) else {
            debug!(rule = %lcr.full_id(), "no routing entry for destination");
            return Ok(LcrCost::default());
        };
        let mut lc = LcrCost {
            entry: Some(entry.clone()),
            supplier_costs: Vec::new(),
        };
        if entry.strategy == STRATEGY_STATIC {
            for supplier in entry.params() {
                lc.supplier_costs
                    .push(self.supplier_cost(cd, &entry.rp_category, &supplier).await);
            }
            return Ok(lc);
        }

        let category = if entry.rp_category.is_empty() { ANY } else { entry.rp_category.as_str() };
        let profiles = self
            .tariff
            .rating_profiles_for_category(&cd.direction, &cd.tenant, category)
            .await?;
        for rpf in profiles {
            if let Some(sc) = self.ranked_supplier(cd, &entry, category, &rpf).await {
                lc.supplier_costs.push(sc);
            }
        }
        lc.sort(Utc::now());
        Ok(lc)
    }

    /// Supplier cost with the quality data its strategy needs; `None` when
    /// a quality threshold rules the supplier out
    async fn ranked_supplier(
        &self,
        cd: &CallDescriptor,
        entry: &LcrEntry,
        category: &str,
        rpf: &RatingProfile,
    ) -> Option<LcrSupplierCost> {
        let strategy = entry.strategy.as_str();
        if !matches!(strategy, STRATEGY_QOS_THRESHOLD | STRATEGY_QOS | STRATEGY_LOAD) {
            return Some(self.supplier_cost(cd, category, &rpf.subject).await);
        }
        let queue_ids = stat_queue_ids(rpf);
        if strategy == STRATEGY_LOAD {
            let mut queues = Vec::with_capacity(queue_ids.len());
            for id in &queue_ids {
                match self.supplier_queue(&cd.tenant, id).await {
                    Ok(q) => queues.push(q),
                    Err(e) => warn!(queue = %id, supplier = %rpf.subject, error = %e, "supplier queue unavailable"),
                }
            }
            let mut sc = self.supplier_cost(cd, category, &rpf.subject).await;
            sc.supplier_queues = queues;
            return Some(sc);
        }

        let mut samples = Vec::with_capacity(queue_ids.len());
        for id in &queue_ids {
            let attr = AttrStatsQueueId {
                tenant: cd.tenant.clone(),
                id: id.clone(),
            };
            match self.get_stats_metrics(&attr).await {
                Ok(m) => samples.push(m),
                Err(e) => {
                    return Some(LcrSupplierCost {
                        supplier: concatenated_key(&[cd.direction.as_str(), &cd.tenant, category, &rpf.subject]),
                        error: format!("stats of queue {}: {}", id, e),
                        ..Default::default()
                    });
                }
            }
        }
        let qos = average_qos(&samples, self.decimals());
        if strategy == STRATEGY_QOS_THRESHOLD && !entry.qos_limits().accepts(&qos) {
            debug!(supplier = %rpf.subject, "supplier below quality threshold");
            return None;
        }
        let mut sc = self.supplier_cost(cd, category, &rpf.subject).await;
        sc.qos = qos;
        if strategy == STRATEGY_QOS {
            sc.qos_sort_params = entry.params();
        }
        Some(sc)
    }

    /// Prices the call through one supplier; failures are kept on the entry
    async fn supplier_cost(&self, cd: &CallDescriptor, category: &str, supplier: &str) -> LcrSupplierCost {
        let mut scd = cd.clone();
        scd.category = category.to_string();
        scd.account = supplier.to_string();
        scd.subject = supplier.to_string();
        scd.rating_infos.clear();
        let full_id = concatenated_key(&[scd.direction.as_str(), &scd.tenant, &scd.category, &scd.subject]);
        match self.supplier_call_cost(&mut scd).await {
            Ok(cc) => LcrSupplierCost {
                supplier: full_id,
                cost: cc.cost,
                duration: cc.duration(),
                ..Default::default()
            },
            Err(e) => {
                debug!(supplier, error = %e, "supplier not priced");
                LcrSupplierCost {
                    supplier: full_id,
                    error: e.to_string(),
                    ..Default::default()
                }
            }
        }
    }

    /// Dry-run debit when the supplier has an account, plain pricing otherwise
    async fn supplier_call_cost(&self, scd: &mut CallDescriptor) -> AppResult<CallCost> {
        match self.accounting.get_account(&scd.tenant, &scd.account).await {
            Ok(acc) if acc.disabled => Err(AppError::AccountDisabled),
            Ok(_) => {
                scd.dry_run = true;
                self.debit(scd).await
            }
            Err(AppError::AccountNotFound | AppError::NotFound) => self.get_cost(scd).await,
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::*;
    use accurate_core::models::lcr::{STRATEGY_HIGHEST, STRATEGY_LOWEST};
    use accurate_core::models::{Cdr, CdrStats, LcrActivation, RatingPlan};
    use accurate_core::utils::consts::{OUT, VOICE};
    use accurate_core::utils::time::zero_time;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    async fn routing(engine: &Engine, strategy: &str, params: &str) {
        let mut cheap = RatingPlan::new(TENANT, "RP_CHEAP");
        cheap.add_rate_interval("+49", "GERMANY", &[per_second(dec!(0.01), dec!(0))]);
        engine.tariff.set_rating_plan(&cheap, None).await.unwrap();
        category_profile(engine, "lcr", "rif", "RP_CHEAP", &["Q_RIF"]).await;
        category_profile(engine, "lcr", "dan", "RP_DAN", &["Q_DAN"]).await;

        let lcr = Lcr {
            direction: OUT.into(),
            tenant: TENANT.into(),
            category: "call".into(),
            account: ANY.into(),
            subject: ANY.into(),
            activations: vec![LcrActivation {
                activation_time: Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(),
                entries: vec![LcrEntry {
                    destination_id: "GERMANY".into(),
                    rp_category: "lcr".into(),
                    strategy: strategy.into(),
                    strategy_params: params.into(),
                    weight: 10.0,
                    precision: 0,
                }],
            }],
        };
        engine.tariff.set_lcr(&lcr, None).await.unwrap();
    }

    fn request() -> LcrRequest {
        LcrRequest {
            account: "caller".into(),
            destination: "+4986517174963".into(),
            setup_time: call_start().to_rfc3339(),
            duration: "60s".into(),
            ..Default::default()
        }
    }

    fn names(reply: &LcrReply) -> Vec<&str> {
        reply.suppliers.iter().map(|s| s.supplier.as_str()).collect()
    }

    async fn feed_queue(engine: &Engine, queue: &str, answered: bool) {
        engine
            .add_stats_queue(CdrStats {
                tenant: TENANT.into(),
                name: queue.into(),
                queue_length: 10,
                metrics: vec![ASR.into(), ACD.into()],
                supplier: vec![queue.into()],
                ..Default::default()
            })
            .await
            .unwrap();
        let cdr = Cdr {
            unique_id: format!("{}-1", queue),
            tor: VOICE.into(),
            direction: OUT.into(),
            tenant: TENANT.into(),
            category: "call".into(),
            account: "x".into(),
            destination: "+4986517174963".into(),
            setup_time: call_start(),
            answer_time: if answered { call_start() } else { zero_time() },
            usage: Duration::seconds(if answered { 30 } else { 0 }),
            supplier: queue.into(),
            ..Default::default()
        };
        engine.append_stats_cdr(&cdr).await.unwrap();
    }

    #[tokio::test]
    async fn test_lowest_and_highest_cost() {
        let engine = engine_with_tariffs().await;
        routing(&engine, STRATEGY_LOWEST, "").await;
        let reply = engine.get_lcr(&request()).await.unwrap();
        assert_eq!(reply.destination_id, "GERMANY");
        assert_eq!(names(&reply), ["rif", "dan"]);
        assert_eq!(reply.suppliers[0].cost, dec!(0.6));

        let engine = engine_with_tariffs().await;
        routing(&engine, STRATEGY_HIGHEST, "").await;
        assert_eq!(names(&engine.get_lcr(&request()).await.unwrap()), ["dan", "rif"]);
    }

    #[tokio::test]
    async fn test_static_order_and_errors() {
        let engine = engine_with_tariffs().await;
        routing(&engine, STRATEGY_STATIC, "dan;ghost;rif").await;
        let reply = engine.get_lcr(&request()).await.unwrap();
        assert_eq!(names(&reply), ["dan", "ghost", "rif"]);
        assert!(!reply.suppliers[1].error.is_empty());

        let mut req = request();
        req.ignore_errors = true;
        assert_eq!(names(&engine.get_lcr(&req).await.unwrap()), ["dan", "rif"]);
    }

    #[tokio::test]
    async fn test_qos_threshold_drops_supplier() {
        let engine = engine_with_tariffs().await;
        routing(&engine, STRATEGY_QOS_THRESHOLD, "20;;;;;;;;;;;;;").await;
        feed_queue(&engine, "Q_RIF", false).await;
        feed_queue(&engine, "Q_DAN", true).await;
        let reply = engine.get_lcr(&request()).await.unwrap();
        assert_eq!(names(&reply), ["dan"]);
        assert_eq!(reply.suppliers[0].qos[ASR], dec!(100));
    }

    #[tokio::test]
    async fn test_qos_orders_by_metric() {
        let engine = engine_with_tariffs().await;
        routing(&engine, STRATEGY_QOS, "ASR").await;
        feed_queue(&engine, "Q_RIF", false).await;
        feed_queue(&engine, "Q_DAN", true).await;
        assert_eq!(names(&engine.get_lcr(&request()).await.unwrap()), ["dan", "rif"]);
    }

    #[tokio::test]
    async fn test_missing_rule_and_cache() {
        let engine = engine_with_tariffs().await;
        assert_eq!(engine.get_lcr(&request()).await, Err(AppError::NotFound));

        routing(&engine, STRATEGY_LOWEST, "").await;
        let mut req = request();
        req.unique_id = "sess1".into();
        req.run_id = "*default".into();
        assert_eq!(names(&engine.get_lcr(&req).await.unwrap()), ["rif", "dan"]);

        routing(&engine, STRATEGY_HIGHEST, "").await;
        assert_eq!(names(&engine.get_lcr(&req).await.unwrap()), ["rif", "dan"]);
        assert_eq!(names(&engine.get_lcr(&request()).await.unwrap()), ["dan", "rif"]);
    }

    #[test]
    fn test_average_skips_unavailable() {
        let samples = vec![
            [(ASR.to_string(), dec!(40))].into(),
            [(ASR.to_string(), dec!(-1))].into(),
            [(ASR.to_string(), dec!(60))].into(),
        ];
        let qos = average_qos(&samples, 4);
        assert_eq!(qos[ASR], dec!(50));
        assert_eq!(qos[ACD], dec!(-1));
    }
}
