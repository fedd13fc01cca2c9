//! Call descriptors and call costs
//!
//! A [`CallDescriptor`] is the rating request; a [`CallCost`] is the priced
//! answer, a list of timespans whose increments carry the debit trail.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::rating::SharedRatingInfo;
use super::timespan::{compress, decompress, round_duration, Increment, TimeSpan};
use crate::utils::consts::{ROUNDING_MIDDLE, VOICE};
use crate::utils::time::{duration_nanos, secs_f64};
use crate::utils::{concatenated_key, round};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CallCost {
    pub direction: String,
    pub category: String,
    pub tenant: String,
    pub subject: String,
    pub account: String,
    pub destination: String,
    #[serde(rename = "TOR")]
    pub tor: String,
    pub cost: Decimal,
    pub timespans: Vec<TimeSpan>,
    /// Seconds covered by the timespans
    pub rated_usage: f64,
    #[serde(skip)]
    pub deduct_connect_fee: bool,
    /// Connect fee was charged to the default balance, driving it negative
    #[serde(skip)]
    pub negative_connect_fee: bool,
    #[serde(skip)]
    pub max_cost_disconnect: bool,
}

impl CallCost {
    pub fn merge(&mut self, other: CallCost) {
        self.cost += other.cost;
        self.timespans.extend(other.timespans);
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.timespans.first().map(|ts| ts.time_start)
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.timespans.last().map(|ts| ts.time_end)
    }

    pub fn duration(&self) -> Duration {
        self.timespans
            .iter()
            .fold(Duration::zero(), |acc, ts| acc + ts.duration())
    }

    pub fn update_rated_usage(&mut self) -> Duration {
        let total = self.duration();
        self.rated_usage = secs_f64(total);
        total
    }

    pub fn connect_fee(&self) -> Decimal {
        self.timespans
            .first()
            .and_then(|ts| ts.rate_interval.as_ref())
            .map_or(Decimal::ZERO, |ri| ri.connect_fee())
    }

    pub fn first_increment(&self) -> Option<&Increment> {
        self.timespans
            .first()
            .and_then(|ts| ts.increments.comp_increment.as_ref())
    }

    pub fn create_call_descriptor(&self) -> CallDescriptor {
        CallDescriptor {
            direction: self.direction.clone(),
            category: self.category.clone(),
            tenant: self.tenant.clone(),
            subject: self.subject.clone(),
            account: self.account.clone(),
            destination: self.destination.clone(),
            tor: self.tor.clone(),
            ..Default::default()
        }
    }

    /// Every timespan has its increments backed by a balance
    pub fn is_paid(&self) -> bool {
        self.timespans.iter().all(|ts| {
            ts.increments
                .comp_increment
                .as_ref()
                .is_some_and(|inc| inc.balance_info.is_paid())
        })
    }

    /// Largest rounding among the rate intervals, the call total uses it
    pub fn longest_rounding(&self, decimals: u32) -> (u32, String) {
        let mut best: Option<(u32, String)> = None;
        for ts in &self.timespans {
            if let Some(ri) = &ts.rate_interval {
                let (d, m) = ri.rating.rounding(decimals);
                if best.as_ref().map_or(true, |(bd, _)| d > *bd) {
                    best = Some((d, m.to_string()));
                }
            }
        }
        best.unwrap_or((decimals, ROUNDING_MIDDLE.to_string()))
    }

    /// Recomputes the total of a final, merged cost including the connect fee
    pub fn update_cost(&mut self, decimals: u32) {
        self.deduct_connect_fee = true;
        self.refresh_cost(decimals);
    }

    /// Recomputes span costs and the total, connect fee only when flagged
    pub fn refresh_cost(&mut self, decimals: u32) {
        let mut cost = if self.deduct_connect_fee {
            self.connect_fee()
        } else {
            Decimal::ZERO
        };
        for ts in self.timespans.iter_mut() {
            ts.cost = ts.calculate_cost(decimals);
            cost += ts.cost;
        }
        self.cost = round(cost, decimals, ROUNDING_MIDDLE);
    }

    pub fn compress(&mut self) {
        self.timespans = compress(std::mem::take(&mut self.timespans));
    }

    pub fn decompress(&mut self) {
        self.timespans = decompress(std::mem::take(&mut self.timespans));
    }

    /// Cuts `truncate` worth of increments off the tail
    ///
    /// Returns the increments that were cut, each carrying the number of
    /// repetitions removed in its compress factor, ready for a refund.
    pub fn truncate_timespans_at_duration(&mut self, mut truncate: Duration, decimals: u32) -> Vec<Increment> {
        self.decompress();
        let mut refunds = Vec::new();
        while let Some(ts) = self.timespans.last_mut() {
            let Some(comp) = ts.increments.comp_increment.clone() else {
                self.timespans.pop();
                continue;
            };
            let ts_duration = ts.duration();
            if truncate <= ts_duration {
                let mut refunded = 0;
                while refunded < comp.compress_factor && comp.duration <= truncate {
                    truncate = truncate - comp.duration;
                    refunded += 1;
                }
                if refunded > 0 {
                    refunds.push(Increment {
                        compress_factor: refunded,
                        ..comp.clone()
                    });
                }
                if refunded == comp.compress_factor {
                    self.timespans.pop();
                } else if refunded > 0 {
                    ts.split_by_increment(comp.compress_factor - refunded + 1);
                    ts.cost = ts.calculate_cost(decimals);
                }
                break;
            }
            refunds.push(comp);
            truncate = truncate - ts_duration;
            self.timespans.pop();
        }
        refunds
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CallDescriptor {
    pub direction: String,
    pub category: String,
    pub tenant: String,
    pub subject: String,
    pub account: String,
    pub destination: String,
    #[serde(rename = "TOR")]
    pub tor: String,
    pub time_start: DateTime<Utc>,
    pub time_end: DateTime<Utc>,
    /// Position of this request inside a session loop, zero for the first
    pub loop_index: f64,
    /// Session duration so far, including this request
    #[serde(with = "duration_nanos")]
    pub duration_index: Duration,
    pub fallback_subject: String,
    #[serde(rename = "UniqueID")]
    pub unique_id: String,
    #[serde(rename = "RunID")]
    pub run_id: String,
    pub extra_fields: BTreeMap<String, String>,
    pub max_rate: Decimal,
    #[serde(with = "duration_nanos")]
    pub max_rate_unit: Duration,
    pub max_cost_so_far: Decimal,
    /// Increments handed back by refunds
    pub increments: Vec<Increment>,
    pub force_duration: bool,
    pub perform_rounding: bool,
    pub dry_run: bool,
    pub deny_negative_account: bool,
    #[serde(skip)]
    pub rating_infos: Vec<SharedRatingInfo>,
}

impl CallDescriptor {
    pub fn duration(&self) -> Duration {
        self.time_end - self.time_start
    }

    pub fn account_name(&self) -> &str {
        if self.account.is_empty() {
            &self.subject
        } else {
            &self.account
        }
    }

    pub fn subject_name(&self) -> &str {
        if self.subject.is_empty() {
            &self.account
        } else {
            &self.subject
        }
    }

    /// "tenant:account" key used by storage and locks
    pub fn account_key(&self) -> String {
        concatenated_key(&[self.tenant.as_str(), self.account_name()])
    }

    /// Rating profile key for `subject`
    pub fn rating_profile_key(&self, subject: &str) -> String {
        concatenated_key(&[
            self.direction.as_str(),
            self.tenant.as_str(),
            self.category.as_str(),
            subject,
        ])
    }

    pub fn create_call_cost(&self) -> CallCost {
        CallCost {
            direction: self.direction.clone(),
            category: self.category.clone(),
            tenant: self.tenant.clone(),
            subject: self.subject.clone(),
            account: self.account.clone(),
            destination: self.destination.clone(),
            tor: self.tor.clone(),
            ..Default::default()
        }
    }

    pub fn add_rating_info(&mut self, info: SharedRatingInfo) {
        self.rating_infos.push(info);
    }

    /// Splits the requested interval along rating plan activations, days and
    /// rate interval boundaries, then rounds every span up to its increment
    pub fn split_in_time_spans(&self) -> Vec<TimeSpan> {
        let mut first = TimeSpan::new(self.time_start, self.time_end);
        first.duration_index = self.duration_index;
        let Some(head) = self.rating_infos.first() else {
            return vec![first];
        };
        first.set_rating_info(head.clone());
        let mut spans = vec![first];

        for info in &self.rating_infos {
            if info.activation_time <= self.time_start {
                spans[0].set_rating_info(info.clone());
                continue;
            }
            if let Some(i) = spans.iter().position(|ts| ts.contains(info.activation_time)) {
                if let Some(mut next) = spans[i].split_by_rating_plan(info.activation_time) {
                    next.set_rating_info(info.clone());
                    spans.insert(i + 1, next);
                }
            }
        }

        if self.tor == VOICE {
            let mut i = 0;
            while i < spans.len() {
                if let Some(next) = spans[i].split_by_day() {
                    spans.insert(i + 1, next);
                }
                i += 1;
            }
        }

        let data = self.tor != VOICE;
        let mut i = 0;
        while i < spans.len() {
            if let Some(info) = spans[i].rating_info.clone() {
                let intervals = info.select_rate_intervals(spans[i].time_start, spans[i].time_end);
                for interval in &intervals {
                    if let Some(mut next) = spans[i].split_by_rate_interval(interval, data) {
                        next.set_rating_info(info.clone());
                        spans.insert(i + 1, next);
                        break;
                    }
                }
            }
            i += 1;
        }
        round_spans_to_increment(&mut spans);
        spans
    }

    /// Prices the interval against the already loaded rating infos
    pub fn rate(&mut self, decimals: u32) -> CallCost {
        if self.duration_index < self.duration() {
            self.duration_index = self.duration();
        }
        if self.tor.is_empty() {
            self.tor = VOICE.to_string();
        }
        let mut spans = self.split_in_time_spans();
        let mut cost = Decimal::ZERO;
        for (i, ts) in spans.iter_mut().enumerate() {
            ts.create_increments(decimals);
            if self.loop_index == 0.0 && i == 0 {
                if let Some(ri) = &ts.rate_interval {
                    cost += ri.connect_fee();
                }
            }
            cost += ts.calculate_cost(decimals);
        }
        let mut cc = self.create_call_cost();
        cc.timespans = spans;
        let (d, method) = cc.longest_rounding(decimals);
        cc.cost = round(cost, d, &method);
        cc
    }
}

/// Extends spans shorter than their increment and drops what they now cover
fn round_spans_to_increment(spans: &mut Vec<TimeSpan>) {
    let mut i = 0;
    while i < spans.len() {
        let increment = match &spans[i].rate_interval {
            Some(ri) => ri.rate_increment(spans[i].group_start()),
            None => {
                i += 1;
                continue;
            }
        };
        let current = spans[i].duration();
        let target = if increment < current {
            round_duration(increment, current)
        } else {
            increment
        };
        if target > current {
            let ts = &mut spans[i];
            ts.time_end = ts.time_start + target;
            ts.duration_index = ts.duration_index + (target - current);
            remove_overlapped_from_index(spans, i);
        }
        i += 1;
    }
}

/// Drops the spans swallowed by `spans[index]` and trims the first partial one
pub fn remove_overlapped_from_index(spans: &mut Vec<TimeSpan>, index: usize) {
    let end = spans[index].time_end;
    let mut last_covered = index;
    for i in index + 1..spans.len() {
        if spans[i].time_end <= end {
            last_covered = i;
        } else {
            if spans[i].time_start < end {
                spans[i].time_start = end;
            }
            break;
        }
    }
    if last_covered > index {
        spans.drain(index + 1..=last_covered);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::rating::{RIRate, RITiming, RateInfo, RateInterval, RatingInfo};
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn t(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn rate(value: Decimal, inc: i64, fee: Decimal) -> RateInterval {
        RateInterval {
            timing: RITiming::default(),
            rating: RIRate {
                connect_fee: fee,
                rates: vec![RateInfo {
                    group_interval_start: Duration::zero(),
                    value,
                    rate_increment: Duration::seconds(inc),
                    rate_unit: Duration::seconds(1),
                }],
                ..Default::default()
            },
            weight: 10.0,
        }
    }

    fn descriptor(start: &str, secs: i64, ri: RateInterval) -> CallDescriptor {
        let start = t(start);
        CallDescriptor {
            direction: "*out".into(),
            tenant: "test".into(),
            category: "call".into(),
            subject: "dan".into(),
            destination: "+49151000".into(),
            tor: VOICE.into(),
            time_start: start,
            time_end: start + Duration::seconds(secs),
            rating_infos: vec![Arc::new(RatingInfo {
                matched_subject: "*out:test:call:dan".into(),
                rating_plan_id: "RP1".into(),
                matched_prefix: "49".into(),
                matched_dest_id: "GERMANY".into(),
                activation_time: t("2012-01-01T00:00:00Z"),
                rate_intervals: vec![ri],
                fallback_keys: vec![],
            })],
            ..Default::default()
        }
    }

    #[test]
    fn test_rate_simple_minute() {
        let mut cd = descriptor("2024-03-11T10:00:00Z", 60, rate(dec!(0.01), 1, dec!(0)));
        let cc = cd.rate(10);
        assert_eq!(cc.cost, dec!(0.6));
        assert_eq!(cc.timespans.len(), 1);
        assert_eq!(cc.timespans[0].rating_plan_id, "RP1");
        assert_eq!(cd.duration_index, Duration::seconds(60));
    }

    #[test]
    fn test_rate_rounds_up_to_increment() {
        let mut cd = descriptor("2024-03-11T10:00:00Z", 61, rate(dec!(0.01), 60, dec!(0.5)));
        let cc = cd.rate(10);
        assert_eq!(cc.duration(), Duration::seconds(120));
        assert_eq!(cc.cost, dec!(1.7));
    }

    #[test]
    fn test_split_at_midnight() {
        let cd = descriptor("2024-03-11T23:59:30Z", 60, rate(dec!(0.01), 1, dec!(0)));
        let spans = cd.split_in_time_spans();
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[1].time_start, t("2024-03-12T00:00:00Z"));
        assert_eq!(spans[1].rating_plan_id, "RP1");
    }

    #[test]
    fn test_update_cost_and_truncate() {
        let mut cd = descriptor("2024-03-11T10:00:00Z", 60, rate(dec!(0.01), 10, dec!(0)));
        let mut cc = cd.rate(10);
        let refunds = cc.truncate_timespans_at_duration(Duration::seconds(20), 10);
        assert_eq!(refunds.len(), 1);
        assert_eq!(refunds[0].compress_factor, 2);
        assert_eq!(cc.duration(), Duration::seconds(40));
        cc.refresh_cost(10);
        assert_eq!(cc.cost, dec!(0.4));
    }

    #[test]
    fn test_remove_overlapped() {
        let base = t("2024-03-11T10:00:00Z");
        let mut spans = vec![
            TimeSpan::new(base, base + Duration::seconds(30)),
            TimeSpan::new(base + Duration::seconds(10), base + Duration::seconds(20)),
            TimeSpan::new(base + Duration::seconds(20), base + Duration::seconds(40)),
        ];
        remove_overlapped_from_index(&mut spans, 0);
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[1].time_start, base + Duration::seconds(30));
    }
}
