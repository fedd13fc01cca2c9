//! CDR statistics queues
//!
//! Each queue keeps the simplified form of the CDRs it accepted and a set of
//! incrementally updated metrics. Thresholds on those metrics fire action
//! triggers the same way balance thresholds do.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use accurate_core::models::lcr::SupplierQueue;
use accurate_core::models::stats::{metric_for_threshold, stats_na};
use accurate_core::models::trigger::sort_triggers;
use accurate_core::models::{
    ActionTrigger, ActionTriggerRecord, AttrStatsQueueDisable, AttrStatsQueueId, AttrStatsQueueIds, Cdr, CdrStats,
    Metric, QCdr, StatsQueueState,
};
use accurate_core::utils::concatenated_key;
use accurate_core::{AppError, AppResult};
use accurate_db::CacheMode;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::actions::TriggeredQueue;
use crate::Engine;

/// Minimum spacing of time window scans
const PURGE_CHECK_INTERVAL_SECS: i64 = 5;

#[derive(Debug)]
struct StatsQueue {
    conf: CdrStats,
    metrics: BTreeMap<String, Metric>,
    items: VecDeque<QCdr>,
    trigger_records: BTreeMap<String, ActionTriggerRecord>,
    last_purge: Option<DateTime<Utc>>,
    dirty: bool,
}

impl StatsQueue {
    fn new(conf: CdrStats) -> Self {
        let mut sq = Self {
            metrics: BTreeMap::new(),
            conf,
            items: VecDeque::new(),
            trigger_records: BTreeMap::new(),
            last_purge: None,
            dirty: false,
        };
        sq.reset_metrics();
        sq
    }

    fn reset_metrics(&mut self) {
        self.metrics = self
            .conf
            .metrics
            .iter()
            .filter_map(|name| Metric::create(name).map(|m| (name.clone(), m)))
            .collect();
        for q in &self.items {
            for m in self.metrics.values_mut() {
                m.add(q);
            }
        }
    }

    /// Takes a new configuration; one changing nothing but triggers keeps
    /// the queued items and metrics
    fn update_conf(&mut self, conf: CdrStats) {
        if conf.triggers_only() || self.conf.equal_except_triggers(&conf) {
            self.conf.trigger_ids = conf.trigger_ids;
            return;
        }
        self.conf = conf;
        self.reset_metrics();
        self.dirty = true;
    }

    fn push(&mut self, q: QCdr) {
        for m in self.metrics.values_mut() {
            m.add(&q);
        }
        self.items.push_back(q);
        self.dirty = true;
    }

    fn pop_front(&mut self) {
        if let Some(q) = self.items.pop_front() {
            for m in self.metrics.values_mut() {
                m.remove(&q);
            }
            self.dirty = true;
        }
    }

    /// Drops items beyond the queue length and, at most once per check
    /// interval, items older than the time window
    fn purge(&mut self, now: DateTime<Utc>) {
        if self.conf.queue_length > 0 {
            while self.items.len() > self.conf.queue_length {
                self.pop_front();
            }
        }
        if self.conf.time_window <= Duration::zero() {
            return;
        }
        if self
            .last_purge
            .is_some_and(|t| now - t < Duration::seconds(PURGE_CHECK_INTERVAL_SECS))
        {
            return;
        }
        self.last_purge = Some(now);
        let cutoff = now - self.conf.time_window;
        while self.items.front().is_some_and(|q| q.event_time <= cutoff) {
            self.pop_front();
        }
    }

    fn metric_values(&self) -> BTreeMap<String, Decimal> {
        self.metrics.iter().map(|(k, m)| (k.clone(), m.value())).collect()
    }

    fn destinations(&self) -> Vec<String> {
        let set: BTreeSet<&String> = self.items.iter().map(|q| &q.destination).collect();
        set.into_iter().cloned().collect()
    }

    fn state(&self) -> StatsQueueState {
        StatsQueueState {
            tenant: self.conf.tenant.clone(),
            name: self.conf.name.clone(),
            trigger_records: self.trigger_records.clone(),
            items: self.items.iter().cloned().collect(),
        }
    }

    fn triggered(&self, at: &ActionTrigger) -> TriggeredQueue {
        TriggeredQueue {
            tenant: self.conf.tenant.clone(),
            name: self.conf.name.clone(),
            metrics: self.metric_values(),
            destinations: self.destinations(),
            trigger: at.clone(),
        }
    }
}

/// Live queues by `tenant:name`
#[derive(Default)]
pub struct StatsQueues {
    queues: RwLock<HashMap<String, Arc<Mutex<StatsQueue>>>>,
}

impl StatsQueues {
    fn get(&self, tenant: &str, name: &str) -> Option<Arc<Mutex<StatsQueue>>> {
        self.queues.read().get(&concatenated_key(&[tenant, name])).cloned()
    }

    fn all(&self) -> Vec<Arc<Mutex<StatsQueue>>> {
        self.queues.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.queues.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Engine {
    /// Creates or reconfigures a queue and stores its configuration
    #[instrument(skip(self, cs), fields(queue = %cs.full_id()))]
    pub async fn add_stats_queue(&self, cs: CdrStats) -> AppResult<()> {
        if cs.tenant.is_empty() || cs.name.is_empty() {
            return Err(AppError::missing(["Tenant", "Name"]));
        }
        self.tariff.set_cdr_stats(&cs, None).await?;
        self.install_queue(cs).await;
        Ok(())
    }

    async fn install_queue(&self, cs: CdrStats) {
        if let Some(existing) = self.stats.get(&cs.tenant, &cs.name) {
            existing.lock().await.update_conf(cs);
            return;
        }
        let id = cs.full_id();
        let mut sq = StatsQueue::new(cs);
        match self.accounting.get_stats_queue(&sq.conf.tenant, &sq.conf.name).await {
            Ok(Some(state)) => {
                sq.trigger_records = state.trigger_records;
                for q in state.items {
                    sq.push(q);
                }
                sq.purge(Utc::now());
                sq.dirty = false;
            }
            Ok(None) => {}
            Err(e) => warn!(queue = %id, error = %e, "could not load queued items"),
        }
        self.stats.queues.write().insert(id, Arc::new(Mutex::new(sq)));
    }

    /// Drops the queues, their configuration and their stored state
    pub async fn remove_stats_queues(&self, attr: &AttrStatsQueueIds) -> AppResult<()> {
        for id in &attr.ids {
            self.stats.queues.write().remove(&concatenated_key(&[&attr.tenant, id]));
            self.tariff.remove_cdr_stats(&attr.tenant, id, None).await?;
            self.accounting.remove_stats_queue(&attr.tenant, id).await?;
        }
        Ok(())
    }

    pub async fn disable_stats_queue(&self, attr: &AttrStatsQueueDisable) -> AppResult<()> {
        let mut cs = self.tariff.get_cdr_stats(&attr.tenant, &attr.id, CacheMode::Live).await?;
        cs.disabled = attr.disable;
        self.add_stats_queue(cs).await
    }

    /// Rebuilds the named queues from stored configuration, every queue of
    /// the tenant when no id is given
    pub async fn reload_stats_queues(&self, attr: &AttrStatsQueueIds) -> AppResult<usize> {
        let confs = if attr.ids.is_empty() {
            self.tariff.all_cdr_stats(&attr.tenant).await?
        } else {
            let mut confs = Vec::with_capacity(attr.ids.len());
            for id in &attr.ids {
                confs.push(self.tariff.get_cdr_stats(&attr.tenant, id, CacheMode::Live).await?);
            }
            confs
        };
        let loaded = confs.len();
        for cs in confs {
            self.install_queue(cs).await;
        }
        info!(tenant = %attr.tenant, queues = loaded, "stats queues loaded");
        Ok(loaded)
    }

    /// Empties the named queues, all of them when no id is given
    pub async fn reset_stats_queues(&self, attr: &AttrStatsQueueIds) -> AppResult<()> {
        let queues = if attr.ids.is_empty() {
            self.stats.all()
        } else {
            attr.ids
                .iter()
                .filter_map(|id| {
                    let q = self.stats.get(&attr.tenant, id);
                    if q.is_none() {
                        warn!(tenant = %attr.tenant, queue = %id, "cannot reset queue, not found");
                    }
                    q
                })
                .collect()
        };
        for q in queues {
            let mut sq = q.lock().await;
            sq.items.clear();
            sq.reset_metrics();
            sq.dirty = true;
        }
        Ok(())
    }

    pub async fn get_stats_metrics(&self, attr: &AttrStatsQueueId) -> AppResult<BTreeMap<String, Decimal>> {
        let q = self.stats.get(&attr.tenant, &attr.id).ok_or(AppError::NotFound)?;
        let mut sq = q.lock().await;
        sq.purge(Utc::now());
        Ok(sq.metric_values())
    }

    /// Length and freshness of a queue, as weighed by load distribution
    pub(crate) async fn supplier_queue(&self, tenant: &str, id: &str) -> AppResult<SupplierQueue> {
        let q = self.stats.get(tenant, id).ok_or(AppError::NotFound)?;
        let mut sq = q.lock().await;
        sq.purge(Utc::now());
        Ok(SupplierQueue {
            time_window: sq.conf.time_window,
            length: sq.items.len(),
            last_setup_time: sq.items.back().map(|i| i.setup_time),
        })
    }

    pub async fn get_stats_queue(&self, attr: &AttrStatsQueueId) -> AppResult<StatsQueueState> {
        let q = self.stats.get(&attr.tenant, &attr.id).ok_or(AppError::NotFound)?;
        let state = q.lock().await.state();
        Ok(state)
    }

    /// Queue names of a tenant, sorted
    pub fn get_stats_queue_ids(&self, tenant: &str) -> Vec<String> {
        let prefix = concatenated_key(&[tenant, ""]);
        let mut ids: Vec<String> = self
            .stats
            .queues
            .read()
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix).map(str::to_string))
            .collect();
        ids.sort();
        ids
    }

    async fn queue_triggers(&self, conf: &CdrStats) -> Vec<ActionTrigger> {
        let mut triggers = Vec::new();
        for group in conf.trigger_ids.keys() {
            match self
                .tariff
                .get_action_trigger_group(&conf.tenant, group, CacheMode::Cached)
                .await
            {
                Ok(atg) => triggers.extend(atg.action_triggers),
                Err(e) => warn!(queue = %conf.full_id(), group = %group, error = %e, "could not get trigger group"),
            }
        }
        sort_triggers(&mut triggers);
        triggers
    }

    /// Offers the CDR to every queue; returns how many accepted it
    pub async fn append_stats_cdr(&self, cdr: &Cdr) -> AppResult<usize> {
        let dest_names = self
            .tariff
            .destination_names(&cdr.tenant, &cdr.destination)
            .await
            .unwrap_or_default();
        let mut accepted = 0;
        for q in self.stats.all() {
            let mut sq = q.lock().await;
            match sq.conf.accepts(cdr, &dest_names) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    warn!(queue = %sq.conf.full_id(), error = %e, "queue filter failed");
                    continue;
                }
            }
            let now = Utc::now();
            sq.push(QCdr::from_cdr(cdr, now));
            sq.purge(now);
            accepted += 1;
            self.check_queue_triggers(&mut sq, now).await;
        }
        Ok(accepted)
    }

    async fn check_queue_triggers(&self, sq: &mut StatsQueue, now: DateTime<Utc>) {
        let triggers = self.queue_triggers(&sq.conf).await;
        if triggers.is_empty() {
            return;
        }
        let values = sq.metric_values();
        let mut fired = false;
        for at in &triggers {
            sq.trigger_records
                .entry(at.unique_id.clone())
                .or_insert_with(|| at.new_record());
            if at.is_expired(now) || !at.is_active(now) {
                continue;
            }
            if sq.trigger_records.get(&at.unique_id).is_some_and(|r| r.executed) {
                continue;
            }
            if at.min_queued_items > 0 && sq.items.len() < at.min_queued_items {
                continue;
            }
            let Some(value) = metric_for_threshold(&at.threshold_type).and_then(|m| values.get(m)) else {
                continue;
            };
            if *value <= stats_na() || !at.crossed(*value) {
                continue;
            }
            let queue = sq.triggered(at);
            let Some(record) = sq.trigger_records.get_mut(&at.unique_id) else {
                continue;
            };
            if let Err(e) = self.execute_queue_trigger(&queue, record).await {
                warn!(queue = %queue.name, trigger = %at.unique_id, error = %e, "queue trigger failed");
            }
            fired = true;
        }
        if fired {
            sq.dirty = true;
            if let Err(e) = self.accounting.set_stats_queue(&sq.state()).await {
                warn!(queue = %sq.conf.full_id(), error = %e, "could not save stats queue");
            } else {
                sq.dirty = false;
            }
        }
    }

    /// Persists the queues changed since the last save
    pub async fn save_stats_queues(&self) -> usize {
        let mut saved = 0;
        for q in self.stats.all() {
            let mut sq = q.lock().await;
            if !sq.dirty {
                continue;
            }
            match self.accounting.set_stats_queue(&sq.state()).await {
                Ok(()) => {
                    sq.dirty = false;
                    saved += 1;
                }
                Err(e) => warn!(queue = %sq.conf.full_id(), error = %e, "could not save stats queue"),
            }
        }
        saved
    }

    /// Periodic queue persistence; saves once more on shutdown
    pub async fn run_stats_saver(self: Arc<Self>) {
        let secs = self.cfg.stats.save_interval_secs;
        if secs == 0 {
            return;
        }
        let shutdown = self.shutdown_signal();
        tokio::pin!(shutdown);
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(secs));
        tick.tick().await;
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = tick.tick() => {
                    let saved = self.save_stats_queues().await;
                    if saved > 0 {
                        debug!(queues = saved, "stats queues saved");
                    }
                }
            }
        }
        self.save_stats_queues().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::*;
    use accurate_core::models::action::LOG;
    use accurate_core::models::stats::{ACD, ASR, DDC};
    use accurate_core::models::{Action, ActionGroup, ActionTriggerGroup};
    use accurate_core::utils::consts::{META_POSTPAID, OUT, VOICE};
    use accurate_core::utils::time::zero_time;
    use accurate_core::utils::StringMap;
    use rust_decimal_macros::dec;

    fn conf(name: &str, queue_length: usize) -> CdrStats {
        CdrStats {
            tenant: TENANT.into(),
            name: name.into(),
            queue_length,
            metrics: vec![ASR.into(), ACD.into(), DDC.into()],
            ..Default::default()
        }
    }

    fn cdr(id: &str, destination: &str, answered: bool, usage: i64) -> Cdr {
        Cdr {
            unique_id: id.into(),
            tor: VOICE.into(),
            request_type: META_POSTPAID.into(),
            direction: OUT.into(),
            tenant: TENANT.into(),
            category: "call".into(),
            account: "dan".into(),
            subject: "dan".into(),
            destination: destination.into(),
            setup_time: call_start(),
            answer_time: if answered { call_start() } else { zero_time() },
            usage: Duration::seconds(usage),
            cost: dec!(1),
            ..Default::default()
        }
    }

    fn metrics_attr(name: &str) -> AttrStatsQueueId {
        AttrStatsQueueId {
            tenant: TENANT.into(),
            id: name.into(),
        }
    }

    #[tokio::test]
    async fn test_metrics_and_queue_length() {
        let engine = engine_with_tariffs().await;
        engine.add_stats_queue(conf("CDRST1", 2)).await.unwrap();
        engine.append_stats_cdr(&cdr("1", "0723", true, 10)).await.unwrap();
        engine.append_stats_cdr(&cdr("2", "0256", false, 0)).await.unwrap();
        let m = engine.get_stats_metrics(&metrics_attr("CDRST1")).await.unwrap();
        assert_eq!(m[ASR], dec!(50));
        assert_eq!(m[ACD], dec!(10));
        assert_eq!(m[DDC], dec!(2));

        engine.append_stats_cdr(&cdr("3", "0256", true, 30)).await.unwrap();
        let m = engine.get_stats_metrics(&metrics_attr("CDRST1")).await.unwrap();
        assert_eq!(m[ASR], dec!(50));
        assert_eq!(m[ACD], dec!(30));
        assert_eq!(m[DDC], dec!(1));
    }

    #[tokio::test]
    async fn test_filtered_cdr_is_ignored() {
        let engine = engine_with_tariffs().await;
        let mut cs = conf("ONLY_NAT", 0);
        cs.destination_prefix = vec!["0256".into()];
        engine.add_stats_queue(cs).await.unwrap();
        assert_eq!(engine.append_stats_cdr(&cdr("1", "0723", true, 10)).await.unwrap(), 0);
        let m = engine.get_stats_metrics(&metrics_attr("ONLY_NAT")).await.unwrap();
        assert_eq!(m[ASR], stats_na());
    }

    #[tokio::test]
    async fn test_reset_reload_and_remove() {
        let engine = engine_with_tariffs().await;
        engine.add_stats_queue(conf("Q1", 0)).await.unwrap();
        engine.append_stats_cdr(&cdr("1", "0723", true, 10)).await.unwrap();
        assert_eq!(engine.save_stats_queues().await, 1);

        engine.stats.queues.write().clear();
        let ids = AttrStatsQueueIds {
            tenant: TENANT.into(),
            ids: vec![],
        };
        assert_eq!(engine.reload_stats_queues(&ids).await.unwrap(), 1);
        assert_eq!(engine.get_stats_queue_ids(TENANT), vec!["Q1".to_string()]);
        let m = engine.get_stats_metrics(&metrics_attr("Q1")).await.unwrap();
        assert_eq!(m[ACD], dec!(10));

        engine.reset_stats_queues(&ids).await.unwrap();
        let m = engine.get_stats_metrics(&metrics_attr("Q1")).await.unwrap();
        assert_eq!(m[ACD], stats_na());

        let named = AttrStatsQueueIds {
            tenant: TENANT.into(),
            ids: vec!["Q1".into()],
        };
        engine.remove_stats_queues(&named).await.unwrap();
        assert!(engine.stats.is_empty());
        assert!(matches!(
            engine.get_stats_metrics(&metrics_attr("Q1")).await,
            Err(AppError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_disabled_queue_accepts_nothing() {
        let engine = engine_with_tariffs().await;
        engine.add_stats_queue(conf("Q1", 0)).await.unwrap();
        engine
            .disable_stats_queue(&AttrStatsQueueDisable {
                tenant: TENANT.into(),
                id: "Q1".into(),
                disable: true,
            })
            .await
            .unwrap();
        assert_eq!(engine.append_stats_cdr(&cdr("1", "0723", true, 10)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_min_asr_trigger_fires_once() {
        let engine = engine_with_tariffs().await;
        let atg = ActionTriggerGroup {
            tenant: TENANT.into(),
            name: "STATS_TRIGGERS".into(),
            action_triggers: vec![ActionTrigger {
                unique_id: "low_asr".into(),
                threshold_type: "*min_asr".into(),
                threshold_value: dec!(60),
                actions_id: "AG_ALERT".into(),
                min_queued_items: 2,
                ..Default::default()
            }],
        };
        engine.tariff.set_action_trigger_group(&atg, None).await.unwrap();
        let ag = ActionGroup {
            tenant: TENANT.into(),
            name: "AG_ALERT".into(),
            actions: vec![Action {
                action_type: LOG.into(),
                ..Default::default()
            }],
        };
        engine.tariff.set_action_group(&ag, None).await.unwrap();
        let mut cs = conf("Q1", 0);
        cs.trigger_ids = StringMap::from_items(["STATS_TRIGGERS"]);
        engine.add_stats_queue(cs).await.unwrap();

        engine.append_stats_cdr(&cdr("1", "0723", false, 0)).await.unwrap();
        let state = engine.get_stats_queue(&metrics_attr("Q1")).await.unwrap();
        assert!(!state.trigger_records["low_asr"].executed);

        engine.append_stats_cdr(&cdr("2", "0723", false, 0)).await.unwrap();
        let state = engine.get_stats_queue(&metrics_attr("Q1")).await.unwrap();
        let rec = &state.trigger_records["low_asr"];
        assert!(rec.executed);
        let first = rec.last_execution_time;

        engine.append_stats_cdr(&cdr("3", "0723", false, 0)).await.unwrap();
        let state = engine.get_stats_queue(&metrics_attr("Q1")).await.unwrap();
        assert_eq!(state.trigger_records["low_asr"].last_execution_time, first);
    }
}
