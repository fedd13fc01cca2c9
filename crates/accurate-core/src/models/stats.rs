//! Stats queue configuration, queued CDR form and metrics
//!
//! Metrics are updated incrementally on every append and eviction so a
//! queue never rescans its items.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::cdr::Cdr;
use super::rating::duration_secs;
use super::trigger::ActionTriggerRecord;
use crate::query::Query;
use crate::utils::time::{duration_nanos, is_zero_time, parse_duration, zero_time};
use crate::utils::{concatenated_key, div, StringMap};
use crate::AppResult;

pub const ASR: &str = "ASR";
pub const ACD: &str = "ACD";
pub const TCD: &str = "TCD";
pub const ACC: &str = "ACC";
pub const TCC: &str = "TCC";
pub const PDD: &str = "PDD";
pub const DDC: &str = "DDC";

/// Value reported by a metric that has seen nothing
pub fn stats_na() -> Decimal {
    Decimal::NEGATIVE_ONE
}

/// Metric watched by a queue threshold type such as `*min_asr`
pub fn metric_for_threshold(threshold_type: &str) -> Option<&'static str> {
    let name = threshold_type
        .strip_prefix("*min_")
        .or_else(|| threshold_type.strip_prefix("*max_"))?;
    [ASR, ACD, TCD, ACC, TCC, PDD, DDC]
        .into_iter()
        .find(|m| m.eq_ignore_ascii_case(name))
}

/// Queue configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CdrStats {
    pub tenant: String,
    pub name: String,
    /// Maximum number of queued items, zero for unbounded
    pub queue_length: usize,
    /// Items whose queueing time is older than now minus this window are dropped
    #[serde(with = "duration_nanos")]
    pub time_window: Duration,
    #[serde(with = "duration_nanos")]
    pub save_interval: Duration,
    pub metrics: Vec<String>,
    /// `[start, end]` bounds on the setup time, either may be missing
    pub setup_interval: Vec<DateTime<Utc>>,
    #[serde(rename = "TOR")]
    pub tor: Vec<String>,
    pub cdr_host: Vec<String>,
    pub cdr_source: Vec<String>,
    pub req_type: Vec<String>,
    pub direction: Vec<String>,
    pub tenants: Vec<String>,
    pub category: Vec<String>,
    pub account: Vec<String>,
    pub subject: Vec<String>,
    pub destination_prefix: Vec<String>,
    pub supplier: Vec<String>,
    pub disconnect_cause: Vec<String>,
    pub mediation_run_ids: Vec<String>,
    pub rated_account: Vec<String>,
    pub rated_subject: Vec<String>,
    /// `[min, max]` cost, either may be missing
    pub cost_interval: Vec<Decimal>,
    /// `[min, max]` usage as duration strings
    pub usage_interval: Vec<String>,
    pub pdd_interval: Vec<String>,
    /// Structured query over the CDR, with `DestinationIDs` available
    pub filter: String,
    #[serde(rename = "TriggerIDs")]
    pub trigger_ids: StringMap,
    pub disabled: bool,
}

impl Default for CdrStats {
    fn default() -> Self {
        Self {
            tenant: String::new(),
            name: String::new(),
            queue_length: 0,
            time_window: Duration::zero(),
            save_interval: Duration::zero(),
            metrics: Vec::new(),
            setup_interval: Vec::new(),
            tor: Vec::new(),
            cdr_host: Vec::new(),
            cdr_source: Vec::new(),
            req_type: Vec::new(),
            direction: Vec::new(),
            tenants: Vec::new(),
            category: Vec::new(),
            account: Vec::new(),
            subject: Vec::new(),
            destination_prefix: Vec::new(),
            supplier: Vec::new(),
            disconnect_cause: Vec::new(),
            mediation_run_ids: Vec::new(),
            rated_account: Vec::new(),
            rated_subject: Vec::new(),
            cost_interval: Vec::new(),
            usage_interval: Vec::new(),
            pdd_interval: Vec::new(),
            filter: String::new(),
            trigger_ids: StringMap::new(),
            disabled: false,
        }
    }
}

fn listed(list: &[String], value: &str) -> bool {
    list.is_empty() || list.iter().any(|v| v == value)
}

fn within<T: PartialOrd + Copy>(bounds: &[T], value: T) -> bool {
    bounds.first().map_or(true, |min| value >= *min) && bounds.get(1).map_or(true, |max| value < *max)
}

fn duration_bounds(bounds: &[String]) -> AppResult<Vec<Duration>> {
    bounds.iter().map(|b| parse_duration(b)).collect()
}

impl CdrStats {
    pub fn full_id(&self) -> String {
        concatenated_key(&[&self.tenant, &self.name])
    }

    /// Only the triggers may differ
    pub fn equal_except_triggers(&self, other: &CdrStats) -> bool {
        let mut a = self.clone();
        a.trigger_ids = other.trigger_ids.clone();
        &a == other
    }

    /// A reload carrying nothing but trigger ids
    pub fn triggers_only(&self) -> bool {
        self.queue_length == 0 && self.time_window.is_zero() && self.metrics.is_empty()
    }

    /// Whether `cdr` enters the queue; `dest_names` are the destinations its number resolves to
    pub fn accepts(&self, cdr: &Cdr, dest_names: &[String]) -> AppResult<bool> {
        if self.disabled || cdr.tenant != self.tenant {
            return Ok(false);
        }
        let rated_account = cdr
            .cost_details
            .as_ref()
            .map(|cc| cc.account.as_str())
            .unwrap_or_default();
        let rated_subject = cdr
            .cost_details
            .as_ref()
            .map(|cc| cc.subject.as_str())
            .unwrap_or_default();
        let plain = listed(&self.tor, &cdr.tor)
            && listed(&self.cdr_host, &cdr.origin_host)
            && listed(&self.cdr_source, &cdr.source)
            && listed(&self.req_type, &cdr.request_type)
            && listed(&self.direction, &cdr.direction)
            && listed(&self.tenants, &cdr.tenant)
            && listed(&self.category, &cdr.category)
            && listed(&self.account, &cdr.account)
            && listed(&self.subject, &cdr.subject)
            && listed(&self.supplier, &cdr.supplier)
            && listed(&self.disconnect_cause, &cdr.disconnect_cause)
            && listed(&self.mediation_run_ids, &cdr.run_id)
            && listed(&self.rated_account, rated_account)
            && listed(&self.rated_subject, rated_subject)
            && (self.destination_prefix.is_empty()
                || self
                    .destination_prefix
                    .iter()
                    .any(|p| cdr.destination.starts_with(p.as_str())))
            && within(&self.setup_interval, cdr.setup_time)
            && within(&self.cost_interval, cdr.cost)
            && within(&duration_bounds(&self.usage_interval)?, cdr.usage)
            && within(&duration_bounds(&self.pdd_interval)?, cdr.pdd);
        if !plain {
            return Ok(false);
        }
        if self.filter.is_empty() {
            return Ok(true);
        }
        let mut doc = serde_json::to_value(cdr)?;
        if let serde_json::Value::Object(map) = &mut doc {
            map.insert("DestinationIDs".into(), serde_json::json!(dest_names));
        }
        Query::parse(&self.filter)?.matches_value(&doc)
    }
}

/// Queued, simplified CDR
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct QCdr {
    #[serde(rename = "UniqueID")]
    pub unique_id: String,
    #[serde(rename = "RunID")]
    pub run_id: String,
    pub setup_time: DateTime<Utc>,
    pub answer_time: DateTime<Utc>,
    /// When the item entered the queue
    pub event_time: DateTime<Utc>,
    #[serde(with = "duration_nanos")]
    pub pdd: Duration,
    #[serde(with = "duration_nanos")]
    pub usage: Duration,
    pub cost: Decimal,
    pub destination: String,
}

impl Default for QCdr {
    fn default() -> Self {
        Self {
            unique_id: String::new(),
            run_id: String::new(),
            setup_time: zero_time(),
            answer_time: zero_time(),
            event_time: zero_time(),
            pdd: Duration::zero(),
            usage: Duration::zero(),
            cost: Decimal::ZERO,
            destination: String::new(),
        }
    }
}

impl QCdr {
    pub fn from_cdr(cdr: &Cdr, now: DateTime<Utc>) -> Self {
        Self {
            unique_id: cdr.unique_id.clone(),
            run_id: cdr.run_id.clone(),
            setup_time: cdr.setup_time,
            answer_time: cdr.answer_time,
            event_time: now,
            pdd: cdr.pdd,
            usage: cdr.usage,
            cost: cdr.cost,
            destination: cdr.destination.clone(),
        }
    }

    fn answered(&self) -> bool {
        !is_zero_time(&self.answer_time)
    }
}

/// Incremental metric accumulator
#[derive(Debug, Clone, PartialEq)]
pub enum Metric {
    /// Answered over attempted, percent
    Asr { answered: i64, count: i64 },
    /// Average post dial delay, seconds
    Pdd { sum: Duration, count: i64 },
    /// Average duration of answered calls, seconds
    Acd { sum: Duration, count: i64 },
    /// Total duration of answered calls, seconds
    Tcd { sum: Duration, count: i64 },
    /// Average cost of answered, charged calls
    Acc { sum: Decimal, count: i64 },
    /// Total cost of answered, charged calls
    Tcc { sum: Decimal, count: i64 },
    /// Distinct destinations
    Ddc { destinations: BTreeMap<String, i64> },
}

impl Metric {
    pub fn create(name: &str) -> Option<Metric> {
        Some(match name {
            ASR => Metric::Asr { answered: 0, count: 0 },
            PDD => Metric::Pdd { sum: Duration::zero(), count: 0 },
            ACD => Metric::Acd { sum: Duration::zero(), count: 0 },
            TCD => Metric::Tcd { sum: Duration::zero(), count: 0 },
            ACC => Metric::Acc { sum: Decimal::ZERO, count: 0 },
            TCC => Metric::Tcc { sum: Decimal::ZERO, count: 0 },
            DDC => Metric::Ddc { destinations: BTreeMap::new() },
            _ => return None,
        })
    }

    pub fn add(&mut self, q: &QCdr) {
        self.update(q, 1);
    }

    pub fn remove(&mut self, q: &QCdr) {
        self.update(q, -1);
    }

    fn update(&mut self, q: &QCdr, sign: i64) {
        match self {
            Metric::Asr { answered, count } => {
                if q.answered() {
                    *answered += sign;
                }
                *count += sign;
            }
            Metric::Pdd { sum, count } => {
                if !q.pdd.is_zero() {
                    *sum = *sum + q.pdd * sign as i32;
                    *count += sign;
                }
            }
            Metric::Acd { sum, count } | Metric::Tcd { sum, count } => {
                if q.answered() {
                    *sum = *sum + q.usage * sign as i32;
                    *count += sign;
                }
            }
            Metric::Acc { sum, count } | Metric::Tcc { sum, count } => {
                if q.answered() && q.cost > Decimal::ZERO {
                    *sum += q.cost * Decimal::from(sign);
                    *count += sign;
                }
            }
            Metric::Ddc { destinations } => {
                let entry = destinations.entry(q.destination.clone()).or_insert(0);
                *entry += sign;
                if *entry <= 0 {
                    destinations.remove(&q.destination);
                }
            }
        }
    }

    /// Current value, [`stats_na`] when nothing was counted
    pub fn value(&self) -> Decimal {
        match self {
            Metric::Asr { answered, count } if *count > 0 => {
                div(Decimal::from(*answered * 100), Decimal::from(*count), None).normalize()
            }
            Metric::Pdd { sum, count } | Metric::Acd { sum, count } if *count > 0 => {
                div(duration_secs(*sum), Decimal::from(*count), None).normalize()
            }
            Metric::Tcd { sum, count } if *count > 0 => duration_secs(*sum),
            Metric::Acc { sum, count } if *count > 0 => {
                div(*sum, Decimal::from(*count), None).normalize()
            }
            Metric::Tcc { sum, count } if *count > 0 => *sum,
            Metric::Ddc { destinations } if !destinations.is_empty() => {
                Decimal::from(destinations.len())
            }
            _ => stats_na(),
        }
    }
}

/// Persisted state of a queue
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct StatsQueueState {
    pub tenant: String,
    pub name: String,
    pub trigger_records: BTreeMap<String, ActionTriggerRecord>,
    pub items: Vec<QCdr>,
}

/// Queue id plus tenant, as sent by the stats RPC methods
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct AttrStatsQueueIds {
    pub tenant: String,
    #[serde(rename = "IDs")]
    pub ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct AttrStatsQueueId {
    pub tenant: String,
    #[serde(rename = "ID")]
    pub id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct AttrStatsQueueDisable {
    pub tenant: String,
    #[serde(rename = "ID")]
    pub id: String,
    pub disable: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn q(answered: bool, usage: i64, cost: Decimal, dest: &str) -> QCdr {
        let setup = DateTime::parse_from_rfc3339("2024-03-11T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        QCdr {
            setup_time: setup,
            answer_time: if answered { setup } else { zero_time() },
            usage: Duration::seconds(usage),
            cost,
            destination: dest.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_asr_and_acd() {
        let mut asr = Metric::create(ASR).unwrap();
        let mut acd = Metric::create(ACD).unwrap();
        assert_eq!(asr.value(), stats_na());
        let items = [q(true, 10, dec!(1), "1001"), q(false, 0, dec!(0), "1002"), q(true, 20, dec!(2), "1001")];
        for i in &items {
            asr.add(i);
            acd.add(i);
        }
        assert_eq!(asr.value().round_dp(2), dec!(66.67));
        assert_eq!(acd.value(), dec!(15));
        asr.remove(&items[1]);
        acd.remove(&items[0]);
        assert_eq!(asr.value(), dec!(100));
        assert_eq!(acd.value(), dec!(20));
    }

    #[test]
    fn test_costs_and_destinations() {
        let mut tcc = Metric::create(TCC).unwrap();
        let mut acc = Metric::create(ACC).unwrap();
        let mut ddc = Metric::create(DDC).unwrap();
        let items = [q(true, 10, dec!(1.5), "1001"), q(true, 10, dec!(0.5), "1001"), q(true, 10, dec!(-1), "1002")];
        for i in &items {
            tcc.add(i);
            acc.add(i);
            ddc.add(i);
        }
        assert_eq!(tcc.value(), dec!(2.0));
        assert_eq!(acc.value(), dec!(1));
        assert_eq!(ddc.value(), dec!(2));
        ddc.remove(&items[2]);
        assert_eq!(ddc.value(), dec!(1));
    }

    #[test]
    fn test_threshold_metric() {
        assert_eq!(metric_for_threshold("*min_asr"), Some(ASR));
        assert_eq!(metric_for_threshold("*max_acd"), Some(ACD));
        assert_eq!(metric_for_threshold("*min_balance"), None);
    }

    #[test]
    fn test_accepts() {
        let cdr = Cdr {
            tenant: "test".into(),
            tor: "*voice".into(),
            destination: "+49151".into(),
            usage: Duration::seconds(30),
            ..Default::default()
        };
        let mut cs = CdrStats {
            tenant: "test".into(),
            destination_prefix: vec!["+49".into()],
            usage_interval: vec!["10s".into()],
            ..Default::default()
        };
        assert!(cs.accepts(&cdr, &[]).unwrap());
        cs.filter = r#"{"DestinationIDs":{"$has":["GERMANY"]}}"#.into();
        assert!(cs.accepts(&cdr, &["GERMANY".to_string()]).unwrap());
        assert!(!cs.accepts(&cdr, &[]).unwrap());
        cs.filter.clear();
        cs.usage_interval = vec!["1m".into()];
        assert!(!cs.accepts(&cdr, &[]).unwrap());
        cs.usage_interval.clear();
        cs.disabled = true;
        assert!(!cs.accepts(&cdr, &[]).unwrap());
    }
}
