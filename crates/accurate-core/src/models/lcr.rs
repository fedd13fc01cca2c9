//! Least cost routing rules and supplier ordering

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::callcost::CallDescriptor;
use super::destination::Destination;
use super::rating::duration_secs;
use super::stats::{ACC, ACD, ASR, DDC, PDD, TCC, TCD};
use crate::error::AppError;
use crate::utils::consts::{ANY, DEFAULT, OUT};
use crate::utils::time::{parse_duration, parse_time};
use crate::utils::{concatenated_key, decimal_from_f64};
use crate::AppResult;

pub const STRATEGY_STATIC: &str = "*static";
pub const STRATEGY_LOWEST: &str = "*lowest_cost";
pub const STRATEGY_HIGHEST: &str = "*highest_cost";
pub const STRATEGY_QOS_THRESHOLD: &str = "*qos_threshold";
pub const STRATEGY_QOS: &str = "*qos";
pub const STRATEGY_LOAD: &str = "*load_distribution";

const RAND_LIMIT: i64 = 99;
const LOW_PRIORITY_LIMIT: i64 = 100;
const MED_PRIORITY_LIMIT: i64 = 200;
const HIGH_PRIORITY_LIMIT: i64 = 300;

/// Routing query as received over RPC
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct LcrRequest {
    /// With `run_id`, keys the cached reply
    #[serde(rename = "UniqueID")]
    pub unique_id: String,
    #[serde(rename = "RunID")]
    pub run_id: String,
    pub direction: String,
    pub tenant: String,
    pub category: String,
    pub account: String,
    pub subject: String,
    pub destination: String,
    pub setup_time: String,
    pub duration: String,
    pub ignore_errors: bool,
    pub extra_fields: BTreeMap<String, String>,
    pub min_cost: Option<Decimal>,
    pub max_cost: Option<Decimal>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl LcrRequest {
    /// Fills defaults; the call lasts one minute from now unless told otherwise
    pub fn as_call_descriptor(
        &self,
        default_tenant: &str,
        default_category: &str,
        now: DateTime<Utc>,
    ) -> AppResult<CallDescriptor> {
        if self.account.is_empty() || self.destination.is_empty() {
            let mut missing = Vec::new();
            if self.account.is_empty() {
                missing.push("Account");
            }
            if self.destination.is_empty() {
                missing.push("Destination");
            }
            return Err(AppError::missing(missing));
        }
        let start = if self.setup_time.is_empty() {
            now
        } else {
            parse_time(&self.setup_time)?
        };
        let usage = if self.duration.is_empty() {
            Duration::minutes(1)
        } else {
            parse_duration(&self.duration)?
        };
        let or = |v: &str, d: &str| if v.is_empty() { d.to_string() } else { v.to_string() };
        Ok(CallDescriptor {
            direction: or(&self.direction, OUT),
            tenant: or(&self.tenant, default_tenant),
            category: or(&self.category, default_category),
            account: self.account.clone(),
            subject: or(&self.subject, &self.account),
            destination: self.destination.clone(),
            time_start: start,
            time_end: start + usage,
            extra_fields: self.extra_fields.clone(),
            unique_id: self.unique_id.clone(),
            run_id: self.run_id.clone(),
            ..Default::default()
        })
    }
}

/// Ordered supplier list handed back to session managers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct LcrReply {
    #[serde(rename = "DestinationID")]
    pub destination_id: String,
    #[serde(rename = "RPCategory")]
    pub rp_category: String,
    pub strategy: String,
    pub suppliers: Vec<LcrSupplier>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct LcrSupplier {
    pub supplier: String,
    pub cost: Decimal,
    #[serde(rename = "QOS")]
    pub qos: BTreeMap<String, Decimal>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Lcr {
    pub direction: String,
    pub tenant: String,
    pub category: String,
    pub account: String,
    pub subject: String,
    pub activations: Vec<LcrActivation>,
}

impl Lcr {
    pub fn full_id(&self) -> String {
        concatenated_key(&[
            self.direction.as_str(),
            &self.tenant,
            &self.category,
            &self.account,
            &self.subject,
        ])
    }

    pub fn sort_activations(&mut self) {
        self.activations.sort_by_key(|a| a.activation_time);
    }

    pub fn precision(&self) -> usize {
        [
            &self.direction,
            &self.tenant,
            &self.category,
            &self.account,
            &self.subject,
        ]
        .iter()
        .filter(|f| f.as_str() != ANY)
        .count()
    }

    /// Activations in force during [start, end): the last one starting at or
    /// before `start` plus any starting inside the window
    pub fn active_between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<&LcrActivation> {
        let mut sorted: Vec<&LcrActivation> = self.activations.iter().collect();
        sorted.sort_by_key(|a| a.activation_time);
        let mut out: Vec<&LcrActivation> = Vec::new();
        for a in sorted {
            if a.activation_time <= start {
                out.clear();
                out.push(a);
            } else if a.activation_time < end {
                out.push(a);
            }
        }
        out
    }
}

/// Higher precision first
pub fn sort_lcrs(list: &mut [Lcr]) {
    list.sort_by_key(|l| std::cmp::Reverse(l.precision()));
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct LcrActivation {
    pub activation_time: DateTime<Utc>,
    pub entries: Vec<LcrEntry>,
}

impl Default for LcrActivation {
    fn default() -> Self {
        Self {
            activation_time: crate::utils::time::zero_time(),
            entries: Vec::new(),
        }
    }
}

impl LcrActivation {
    /// Entry for the dialled number given its matching destinations
    ///
    /// Heavier entries win, then longer destination codes; `*any` is the
    /// last resort.
    pub fn entry_for_destinations(&self, dests: &[Destination]) -> Option<LcrEntry> {
        let mut potentials: Vec<LcrEntry> = Vec::new();
        for dest in dests {
            for entry in &self.entries {
                if entry.destination_id == dest.name {
                    let mut e = entry.clone();
                    e.precision = dest.code.len();
                    potentials.push(e);
                }
            }
        }
        if !potentials.is_empty() {
            potentials.sort_by(|a, b| {
                b.weight
                    .partial_cmp(&a.weight)
                    .unwrap_or(Ordering::Equal)
                    .then(b.precision.cmp(&a.precision))
            });
            return potentials.into_iter().next();
        }
        self.entries
            .iter()
            .find(|e| e.destination_id == ANY)
            .cloned()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct LcrEntry {
    #[serde(rename = "DestinationID")]
    pub destination_id: String,
    #[serde(rename = "RPCategory")]
    pub rp_category: String,
    pub strategy: String,
    pub strategy_params: String,
    pub weight: f64,
    #[serde(skip)]
    pub precision: usize,
}

/// Optional lower/upper bound per metric, durations in seconds
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QosLimits(pub BTreeMap<&'static str, (Option<Decimal>, Option<Decimal>)>);

impl QosLimits {
    /// True when every known metric value sits inside its bounds
    pub fn accepts(&self, qos: &BTreeMap<String, Decimal>) -> bool {
        self.0.iter().all(|(metric, (min, max))| {
            let Some(v) = qos.get(*metric) else {
                return true;
            };
            if *v < Decimal::ZERO {
                return true;
            }
            min.map_or(true, |m| *v >= m) && max.map_or(true, |m| *v <= m)
        })
    }
}

impl LcrEntry {
    /// `MIN_ASR;MAX_ASR;MIN_PDD;MAX_PDD;MIN_ACD;MAX_ACD;MIN_TCD;MAX_TCD;MIN_ACC;MAX_ACC;MIN_TCC;MAX_TCC;MIN_DDC;MAX_DDC`
    ///
    /// Unparsable or negative bounds are ignored.
    pub fn qos_limits(&self) -> QosLimits {
        let params: Vec<&str> = self.strategy_params.split(';').collect();
        let mut limits = BTreeMap::new();
        if params.len() != 14 {
            return QosLimits(limits);
        }
        let metrics = [
            (ASR, false),
            (PDD, true),
            (ACD, true),
            (TCD, true),
            (ACC, false),
            (TCC, false),
            (DDC, false),
        ];
        for (i, (metric, is_duration)) in metrics.into_iter().enumerate() {
            let parse = |s: &str| -> Option<Decimal> {
                let s = s.trim();
                if s.is_empty() {
                    return None;
                }
                let v = if is_duration {
                    duration_secs(parse_duration(s).ok()?)
                } else {
                    decimal_from_f64(s.parse::<f64>().ok()?)
                };
                (v >= Decimal::ZERO).then_some(v)
            };
            limits.insert(metric, (parse(params[2 * i]), parse(params[2 * i + 1])));
        }
        QosLimits(limits)
    }

    /// Non-empty strategy parameters; `*qos` defaults to every metric
    pub fn params(&self) -> Vec<String> {
        let clean: Vec<String> = self
            .strategy_params
            .split(';')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(String::from)
            .collect();
        if clean.is_empty() && self.strategy == STRATEGY_QOS {
            return [ASR, PDD, ACD, TCD, ACC, TCC, DDC]
                .iter()
                .map(|s| s.to_string())
                .collect();
        }
        clean
    }

    /// Supplier to ratio table of `*load_distribution`, `supplier:ratio;...`
    pub fn load_ratios(&self) -> BTreeMap<String, i64> {
        let mut ratios = BTreeMap::new();
        for param in self.strategy_params.split(';').filter(|p| !p.trim().is_empty()) {
            let parts: Vec<&str> = param.trim().split(':').collect();
            match (parts.as_slice(), parts.get(1).and_then(|r| r.parse::<i64>().ok())) {
                ([name, _], Some(ratio)) => {
                    ratios.insert(name.to_string(), ratio);
                }
                _ => warn!(param = %self.strategy_params, "bad format in load distribution strategy"),
            }
        }
        ratios
    }
}

/// Queue snapshot used by the load distribution ordering
#[derive(Debug, Clone, PartialEq)]
pub struct SupplierQueue {
    pub time_window: Duration,
    pub length: usize,
    pub last_setup_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct LcrSupplierCost {
    /// Rating profile key of the supplier, `dir:tenant:category:subject`
    pub supplier: String,
    pub cost: Decimal,
    #[serde(with = "crate::utils::time::duration_nanos")]
    pub duration: Duration,
    pub error: String,
    #[serde(rename = "QOS")]
    pub qos: BTreeMap<String, Decimal>,
    #[serde(skip)]
    pub qos_sort_params: Vec<String>,
    #[serde(skip)]
    pub supplier_queues: Vec<SupplierQueue>,
}

impl LcrSupplierCost {
    /// Last segment of the supplier key
    pub fn subject(&self) -> &str {
        self.supplier.rsplit(':').next().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct LcrCost {
    pub entry: Option<LcrEntry>,
    pub supplier_costs: Vec<LcrSupplierCost>,
}

impl LcrCost {
    pub fn sort(&mut self, now: DateTime<Utc>) {
        let Some(strategy) = self.entry.as_ref().map(|e| e.strategy.clone()) else {
            return;
        };
        match strategy.as_str() {
            STRATEGY_LOWEST | STRATEGY_QOS_THRESHOLD => {
                self.supplier_costs.sort_by(|a, b| a.cost.cmp(&b.cost))
            }
            STRATEGY_HIGHEST => self.supplier_costs.sort_by(|a, b| b.cost.cmp(&a.cost)),
            STRATEGY_QOS => self.supplier_costs.sort_by(qos_order),
            STRATEGY_LOAD => {
                self.score_load_distribution(now);
                self.supplier_costs.sort_by(|a, b| b.cost.cmp(&a.cost));
            }
            _ => {}
        }
    }

    /// Ratio configured for a supplier; 1 when no ratios exist and -1 when
    /// the supplier is not listed and no `*default` ratio applies
    pub fn supplier_ratio(&self, supplier: &str) -> i64 {
        let ratios = self
            .entry
            .as_ref()
            .map(LcrEntry::load_ratios)
            .unwrap_or_default();
        let subject = supplier.rsplit(':').next().unwrap_or_default();
        if let Some(r) = ratios.get(subject).or_else(|| ratios.get(DEFAULT)) {
            return *r;
        }
        if ratios.is_empty() {
            1
        } else {
            -1
        }
    }

    /// Scores suppliers into the cost field so that the ones most behind their
    /// ratio sort first; suppliers without a ratio drop out
    fn score_load_distribution(&mut self, now: DateTime<Utc>) {
        let mut score_board: BTreeMap<Duration, usize> = BTreeMap::new();
        let mut winner: Option<Duration> = None;
        let mut max_score = 0;
        for sc in &self.supplier_costs {
            let mut seen = Vec::new();
            for q in &sc.supplier_queues {
                if !seen.contains(&q.time_window) {
                    seen.push(q.time_window);
                    *score_board.entry(q.time_window).or_default() += 1;
                }
                let score = score_board.get(&q.time_window).copied().unwrap_or_default();
                if score > max_score {
                    max_score = score;
                    winner = Some(q.time_window);
                }
            }
        }
        let ratios: Vec<i64> = self
            .supplier_costs
            .iter()
            .map(|sc| self.supplier_ratio(&sc.supplier))
            .collect();
        let mut rng = rand::thread_rng();
        let mut ratioless = false;
        for (sc, ratio) in self.supplier_costs.iter_mut().zip(ratios) {
            let Some(queue) = sc
                .supplier_queues
                .iter()
                .find(|q| Some(q.time_window) == winner)
            else {
                continue;
            };
            if ratio == -1 {
                sc.cost = Decimal::NEGATIVE_ONE;
                ratioless = true;
                continue;
            }
            let count = queue.length as i64;
            let age = queue
                .last_setup_time
                .map(|t| duration_secs(now - t))
                .unwrap_or_default()
                / Decimal::from(RAND_LIMIT);
            let jitter = rng.gen_range(0..RAND_LIMIT);
            sc.cost = if count < ratio {
                Decimal::from(LOW_PRIORITY_LIMIT + jitter)
            } else if ratio != 0 && count % ratio == 0 {
                Decimal::from(MED_PRIORITY_LIMIT + jitter) + age
            } else {
                Decimal::from(HIGH_PRIORITY_LIMIT + jitter) + age
            };
        }
        if ratioless {
            self.supplier_costs.retain(|sc| sc.cost != Decimal::NEGATIVE_ONE);
        }
    }

    pub fn has_errors(&self) -> bool {
        self.supplier_costs.iter().any(|sc| !sc.error.is_empty())
    }

    /// Supplier subjects without errors, in routing order
    pub fn suppliers(&self) -> AppResult<Vec<String>> {
        if self.entry.is_none() {
            return Err(AppError::NotFound);
        }
        let supps: Vec<String> = self
            .supplier_costs
            .iter()
            .filter(|sc| sc.error.is_empty())
            .map(|sc| sc.subject().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if supps.is_empty() {
            return Err(AppError::NotFound);
        }
        Ok(supps)
    }

    /// Applies the cost window of the request and its paging
    pub fn filter_and_page(&mut self, req: &LcrRequest) {
        self.supplier_costs.retain(|sc| {
            req.min_cost.map_or(true, |m| sc.cost >= m) && req.max_cost.map_or(true, |m| sc.cost <= m)
        });
        let offset = req.offset.unwrap_or(0).min(self.supplier_costs.len());
        self.supplier_costs.drain(..offset);
        if let Some(limit) = req.limit {
            self.supplier_costs.truncate(limit);
        }
    }

    /// Reply form; failed suppliers are listed with their error unless ignored
    pub fn as_reply(&self, ignore_errors: bool) -> LcrReply {
        let entry = self.entry.clone().unwrap_or_default();
        LcrReply {
            destination_id: entry.destination_id,
            rp_category: entry.rp_category,
            strategy: entry.strategy,
            suppliers: self
                .supplier_costs
                .iter()
                .filter(|sc| !ignore_errors || sc.error.is_empty())
                .map(|sc| LcrSupplier {
                    supplier: sc.subject().to_string(),
                    cost: sc.cost,
                    qos: sc.qos.clone(),
                    error: sc.error.clone(),
                })
                .collect(),
        }
    }
}

/// Bigger metric values first, not available (-1) before everything
fn qos_order(a: &LcrSupplierCost, b: &LcrSupplierCost) -> Ordering {
    for param in &a.qos_sort_params {
        let (Some(x), Some(y)) = (a.qos.get(param), b.qos.get(param)) else {
            continue;
        };
        if x == y {
            continue;
        }
        if *y == Decimal::NEGATIVE_ONE {
            return Ordering::Greater;
        }
        if *x == Decimal::NEGATIVE_ONE {
            return Ordering::Less;
        }
        return y.cmp(x);
    }
    Ordering::Equal
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn entry(strategy: &str, params: &str) -> LcrEntry {
        LcrEntry {
            destination_id: "GERMANY".into(),
            rp_category: "lcr".into(),
            strategy: strategy.into(),
            strategy_params: params.into(),
            weight: 10.0,
            precision: 0,
        }
    }

    fn cost(supplier: &str, c: Decimal) -> LcrSupplierCost {
        LcrSupplierCost {
            supplier: format!("*out:test:lcr:{}", supplier),
            cost: c,
            ..Default::default()
        }
    }

    #[test]
    fn test_entry_selection() {
        let act = LcrActivation {
            entries: vec![
                LcrEntry { destination_id: ANY.into(), weight: 5.0, ..Default::default() },
                LcrEntry { destination_id: "GERMANY".into(), weight: 10.0, ..Default::default() },
                LcrEntry { destination_id: "GERMANY_MOBILE".into(), weight: 10.0, ..Default::default() },
            ],
            ..Default::default()
        };
        let dests = vec![
            Destination::new("test", "49151", "GERMANY_MOBILE"),
            Destination::new("test", "49", "GERMANY"),
        ];
        let e = act.entry_for_destinations(&dests).unwrap();
        assert_eq!(e.destination_id, "GERMANY_MOBILE");
        assert_eq!(e.precision, 5);
        let e = act.entry_for_destinations(&[]).unwrap();
        assert_eq!(e.destination_id, ANY);
    }

    #[test]
    fn test_lowest_and_highest() {
        let mut lc = LcrCost {
            entry: Some(entry(STRATEGY_LOWEST, "")),
            supplier_costs: vec![cost("s1", dec!(2)), cost("s2", dec!(1)), cost("s3", dec!(3))],
        };
        lc.sort(Utc::now());
        assert_eq!(lc.suppliers().unwrap(), vec!["s2", "s1", "s3"]);
        lc.entry = Some(entry(STRATEGY_HIGHEST, ""));
        lc.sort(Utc::now());
        assert_eq!(lc.suppliers().unwrap(), vec!["s3", "s1", "s2"]);
    }

    #[test]
    fn test_qos_sort() {
        let params = vec![ASR.to_string(), ACD.to_string()];
        let mut a = cost("s1", dec!(1));
        a.qos = [(ASR.to_string(), dec!(50)), (ACD.to_string(), dec!(30))].into();
        a.qos_sort_params = params.clone();
        let mut b = cost("s2", dec!(1));
        b.qos = [(ASR.to_string(), dec!(80)), (ACD.to_string(), dec!(10))].into();
        b.qos_sort_params = params.clone();
        let mut c = cost("s3", dec!(1));
        c.qos = [(ASR.to_string(), dec!(-1)), (ACD.to_string(), dec!(10))].into();
        c.qos_sort_params = params;
        let mut lc = LcrCost {
            entry: Some(entry(STRATEGY_QOS, "")),
            supplier_costs: vec![a, b, c],
        };
        lc.sort(Utc::now());
        assert_eq!(lc.suppliers().unwrap(), vec!["s3", "s2", "s1"]);
    }

    #[test]
    fn test_qos_limits() {
        let e = entry(STRATEGY_QOS_THRESHOLD, "20;;;2m;;;;;;;;;;");
        let limits = e.qos_limits();
        let good: BTreeMap<String, Decimal> = [(ASR.to_string(), dec!(30)), (PDD.to_string(), dec!(3))].into();
        assert!(limits.accepts(&good));
        let slow: BTreeMap<String, Decimal> = [(ASR.to_string(), dec!(30)), (PDD.to_string(), dec!(180))].into();
        assert!(!limits.accepts(&slow));
        let bad_asr: BTreeMap<String, Decimal> = [(ASR.to_string(), dec!(10))].into();
        assert!(!limits.accepts(&bad_asr));
        let na: BTreeMap<String, Decimal> = [(ASR.to_string(), dec!(-1))].into();
        assert!(limits.accepts(&na));
        assert!(entry(STRATEGY_QOS_THRESHOLD, "20;30").qos_limits().0.is_empty());
    }

    #[test]
    fn test_default_qos_params() {
        assert_eq!(entry(STRATEGY_QOS, "").params().len(), 7);
        assert_eq!(entry(STRATEGY_QOS, "*asr; ;*acd").params(), vec!["*asr", "*acd"]);
    }

    #[test]
    fn test_supplier_ratio() {
        let lc = LcrCost {
            entry: Some(entry(STRATEGY_LOAD, "s1:2;*default:1")),
            supplier_costs: vec![],
        };
        assert_eq!(lc.supplier_ratio("*out:test:lcr:s1"), 2);
        assert_eq!(lc.supplier_ratio("*out:test:lcr:s9"), 1);
        let lc = LcrCost {
            entry: Some(entry(STRATEGY_LOAD, "s1:2")),
            supplier_costs: vec![],
        };
        assert_eq!(lc.supplier_ratio("*out:test:lcr:s9"), -1);
        let lc = LcrCost {
            entry: Some(entry(STRATEGY_LOAD, "")),
            supplier_costs: vec![],
        };
        assert_eq!(lc.supplier_ratio("*out:test:lcr:s9"), 1);
    }

    #[test]
    fn test_load_distribution_prefers_lagging_supplier() {
        let now = Utc::now();
        let q = |length| SupplierQueue {
            time_window: Duration::hours(1),
            length,
            last_setup_time: Some(now - Duration::seconds(10)),
        };
        let mut s1 = cost("s1", dec!(0));
        s1.supplier_queues = vec![q(1)];
        let mut s2 = cost("s2", dec!(0));
        s2.supplier_queues = vec![q(3)];
        let mut s3 = cost("s3", dec!(0));
        s3.supplier_queues = vec![q(5)];
        let mut lc = LcrCost {
            entry: Some(entry(STRATEGY_LOAD, "s1:2;s2:2")),
            supplier_costs: vec![s1, s2, s3],
        };
        lc.sort(now);
        // s3 has no ratio and drops out; s2 is off its ratio and goes first
        assert_eq!(lc.suppliers().unwrap(), vec!["s2", "s1"]);
    }

    #[test]
    fn test_request_defaults() {
        let req = LcrRequest {
            account: "dan".into(),
            destination: "+4986517174963".into(),
            ..Default::default()
        };
        let now = Utc::now();
        let cd = req.as_call_descriptor("cgrates.org", "call", now).unwrap();
        assert_eq!(cd.direction, OUT);
        assert_eq!(cd.tenant, "cgrates.org");
        assert_eq!(cd.subject, "dan");
        assert_eq!(cd.duration(), Duration::minutes(1));
        assert!(LcrRequest::default().as_call_descriptor("t", "c", now).is_err());
    }

    #[test]
    fn test_filter_and_page() {
        let mut lc = LcrCost {
            entry: Some(entry(STRATEGY_LOWEST, "")),
            supplier_costs: vec![cost("s1", dec!(1)), cost("s2", dec!(2)), cost("s3", dec!(3))],
        };
        let req = LcrRequest {
            max_cost: Some(dec!(2.5)),
            offset: Some(1),
            ..Default::default()
        };
        lc.filter_and_page(&req);
        assert_eq!(lc.suppliers().unwrap(), vec!["s2"]);
    }
}
