//! Rating plan model
//!
//! A rating plan stores its timings, rates and destination bindings in a
//! normalized form; rate intervals are assembled on demand for the dialled
//! prefix. Rating profiles point a (direction, tenant, category, subject)
//! tuple at a history of rating plan activations.

use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Timelike, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::utils::consts::{ANY, ROUNDING_MIDDLE};
use crate::utils::time::duration_nanos;
use crate::utils::{concatenated_key, div, round, sha_id};

/// Calendar window during which a rate applies
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RITiming {
    pub years: Vec<i32>,
    pub months: Vec<u32>,
    pub month_days: Vec<u32>,
    /// 0 = Sunday
    pub week_days: Vec<u32>,
    /// `HH:MM:SS`, empty means midnight
    pub start_time: String,
    /// `HH:MM:SS`, empty means end of day
    pub end_time: String,
}

fn parse_hms(s: &str) -> Option<(u32, u32, u32)> {
    let mut parts = s.split(':').map(|p| p.trim().parse::<u32>());
    match (parts.next(), parts.next(), parts.next()) {
        (Some(Ok(h)), Some(Ok(m)), Some(Ok(sec))) => Some((h, m, sec)),
        _ => None,
    }
}

fn at_time_of_day(t: DateTime<Utc>, h: u32, m: u32, s: u32) -> DateTime<Utc> {
    let time = NaiveTime::from_hms_opt(h, m, s).unwrap_or(NaiveTime::MIN);
    Utc.from_utc_datetime(&t.date_naive().and_time(time))
}

/// True when `t` is exactly midnight
pub fn is_midnight(t: DateTime<Utc>) -> bool {
    t.hour() == 0 && t.minute() == 0 && t.second() == 0 && t.nanosecond() == 0
}

/// Moves the clock time of `src` onto the date of `dest`; midnight stays put
pub fn copy_hour(src: DateTime<Utc>, dest: DateTime<Utc>) -> DateTime<Utc> {
    if src.hour() == 0 && src.minute() == 0 && src.second() == 0 {
        return src;
    }
    let time = src.time();
    Utc.from_utc_datetime(&dest.date_naive().and_time(time))
}

impl RITiming {
    /// Start of the window on the day of `t`
    pub fn left_margin(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        let (h, m, s) = parse_hms(&self.start_time).unwrap_or((0, 0, 0));
        at_time_of_day(t, h, m, s)
    }

    /// End of the window on the day of `t`; next midnight without an end time
    pub fn right_margin(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        if let Some((h, m, s)) = parse_hms(&self.end_time) {
            return at_time_of_day(t, h, m, s);
        }
        at_time_of_day(t, 23, 59, 59) + Duration::seconds(1)
    }

    pub fn is_active_at(&self, t: DateTime<Utc>) -> bool {
        if !self.years.is_empty() && !self.years.contains(&t.year()) {
            return false;
        }
        if !self.months.is_empty() && !self.months.contains(&t.month()) {
            return false;
        }
        if !self.month_days.is_empty() && !self.month_days.contains(&t.day()) {
            return false;
        }
        if !self.week_days.is_empty()
            && !self.week_days.contains(&t.weekday().num_days_from_sunday())
        {
            return false;
        }
        t >= self.left_margin(t) && t <= self.right_margin(t)
    }

    /// Active every day from midnight
    pub fn is_blank(&self) -> bool {
        self.years.is_empty()
            && self.months.is_empty()
            && self.month_days.is_empty()
            && self.week_days.is_empty()
            && (self.start_time.is_empty() || self.start_time == "00:00:00")
    }

    fn hash(&self) -> String {
        let repr = serde_json::to_string(self).unwrap_or_default();
        sha_id([repr.as_bytes()])[..8].to_string()
    }
}

/// One step of a rate group
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RateInfo {
    #[serde(with = "duration_nanos")]
    pub group_interval_start: Duration,
    pub value: Decimal,
    #[serde(with = "duration_nanos")]
    pub rate_increment: Duration,
    #[serde(with = "duration_nanos")]
    pub rate_unit: Duration,
}

/// Pricing part of a rate interval
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RIRate {
    pub connect_fee: Decimal,
    pub max_cost: Decimal,
    /// `*free` or `*disconnect`, empty for none
    pub max_cost_strategy: String,
    /// `*up`, `*middle` or `*down`; the engine default when empty
    pub rounding_method: String,
    pub rounding_decimals: Option<u32>,
    pub rates: Vec<RateInfo>,
}

impl RIRate {
    pub fn sort_rates(&mut self) {
        self.rates.sort_by_key(|r| r.group_interval_start);
    }

    /// Rounding to use for costs of this rate, falling back to `decimals` and `*middle`
    pub fn rounding(&self, decimals: u32) -> (u32, &str) {
        let method = if self.rounding_method.is_empty() {
            ROUNDING_MIDDLE
        } else {
            self.rounding_method.as_str()
        };
        (self.rounding_decimals.unwrap_or(decimals), method)
    }

    fn hash(&self) -> String {
        let repr = serde_json::to_string(self).unwrap_or_default();
        sha_id([repr.as_bytes()])[..8].to_string()
    }
}

/// A timing with its pricing and weight
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RateInterval {
    pub timing: RITiming,
    pub rating: RIRate,
    pub weight: f64,
}

/// Rate parameters: value, increment and unit
pub type RateParameters = (Decimal, Duration, Duration);

impl RateInterval {
    /// Whether `t` falls inside the timing; an end time at midnight is read
    /// as the last second of the previous day
    pub fn contains(&self, t: DateTime<Utc>, end_time: bool) -> bool {
        let t = if end_time && is_midnight(t) {
            t - Duration::seconds(1)
        } else {
            t
        };
        self.timing.is_active_at(t)
    }

    /// Rate group active at `start` within the call; missing increments
    /// and units default to one second
    pub fn rate_parameters(&self, start: Duration) -> Option<RateParameters> {
        let mut rates: Vec<&RateInfo> = self.rating.rates.iter().collect();
        rates.sort_by_key(|r| r.group_interval_start);
        for (i, rate) in rates.iter().enumerate() {
            let next_starts_later = rates
                .get(i + 1)
                .map_or(true, |next| next.group_interval_start > start);
            if rate.group_interval_start <= start && next_starts_later {
                let increment = if rate.rate_increment.is_zero() {
                    Duration::seconds(1)
                } else {
                    rate.rate_increment
                };
                let unit = if rate.rate_unit.is_zero() {
                    Duration::seconds(1)
                } else {
                    rate.rate_unit
                };
                return Some((rate.value, increment, unit));
            }
        }
        None
    }

    pub fn rate_increment(&self, start: Duration) -> Duration {
        self.rate_parameters(start)
            .map_or(Duration::seconds(1), |(_, inc, _)| inc)
    }

    /// Cost of `duration` seconds priced from `start` within the call
    pub fn get_cost(&self, duration: Duration, start: Duration, decimals: u32) -> Decimal {
        let Some((value, _, unit)) = self.rate_parameters(start) else {
            return Decimal::ZERO;
        };
        let cost = div(nanos_decimal(duration) * value, nanos_decimal(unit), None);
        let (decimals, method) = self.rating.rounding(decimals);
        round(cost, decimals, method)
    }

    pub fn max_cost(&self) -> (Decimal, &str) {
        (self.rating.max_cost, self.rating.max_cost_strategy.as_str())
    }

    pub fn connect_fee(&self) -> Decimal {
        self.rating.connect_fee
    }
}

fn nanos_decimal(d: Duration) -> Decimal {
    Decimal::from(crate::utils::time::nanos(d))
}

/// Duration expressed as decimal seconds
pub fn duration_secs(d: Duration) -> Decimal {
    div(nanos_decimal(d), Decimal::from(1_000_000_000i64), None).normalize()
}

/// Reference from a destination binding to a timing and a rating
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DRate {
    pub timing: String,
    pub rating: String,
    pub weight: f64,
}

impl DRate {
    fn hash(&self) -> String {
        let repr = format!("{}|{}|{}", self.timing, self.rating, self.weight);
        sha_id([repr.as_bytes()])[..8].to_string()
    }
}

/// Rates bound to one destination code
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DRateHelper {
    pub d_rate_keys: BTreeSet<String>,
    /// Destination name the code belongs to
    pub code_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RatingPlan {
    pub tenant: String,
    pub name: String,
    pub timings: BTreeMap<String, RITiming>,
    pub ratings: BTreeMap<String, RIRate>,
    pub d_rates: BTreeMap<String, DRate>,
    /// Keyed by destination code (prefix) or `*any`
    pub destination_rates: BTreeMap<String, DRateHelper>,
}

impl RatingPlan {
    pub fn new(tenant: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    /// Binds rate intervals to a destination code, deduplicating shared parts
    pub fn add_rate_interval(&mut self, code: &str, code_name: &str, intervals: &[RateInterval]) {
        for ri in intervals {
            let timing_tag = ri.timing.hash();
            self.timings.insert(timing_tag.clone(), ri.timing.clone());
            let rating_tag = ri.rating.hash();
            self.ratings.insert(rating_tag.clone(), ri.rating.clone());
            let drate = DRate {
                timing: timing_tag,
                rating: rating_tag,
                weight: ri.weight,
            };
            let drate_tag = drate.hash();
            self.d_rates.insert(drate_tag.clone(), drate);
            self.destination_rates
                .entry(code.to_string())
                .or_insert_with(|| DRateHelper {
                    d_rate_keys: BTreeSet::new(),
                    code_name: code_name.to_string(),
                })
                .d_rate_keys
                .insert(drate_tag);
        }
    }

    /// Rate intervals bound to `code`
    pub fn rate_interval_list(&self, code: &str) -> Vec<RateInterval> {
        let Some(helper) = self.destination_rates.get(code) else {
            return Vec::new();
        };
        helper
            .d_rate_keys
            .iter()
            .filter_map(|tag| self.d_rates.get(tag))
            .map(|drate| RateInterval {
                timing: self.timings.get(&drate.timing).cloned().unwrap_or_default(),
                rating: self.ratings.get(&drate.rating).cloned().unwrap_or_default(),
                weight: drate.weight,
            })
            .collect()
    }

    /// Longest code of the plan prefixing `destination`, `*any` as last resort
    pub fn match_destination(&self, destination: &str, min_len: usize) -> Option<(String, String)> {
        if destination.is_empty() || destination == ANY {
            return self
                .destination_rates
                .get(ANY)
                .map(|_| (ANY.to_string(), ANY.to_string()));
        }
        for prefix in split_prefix(destination, min_len) {
            if let Some(helper) = self.destination_rates.get(prefix) {
                return Some((prefix.to_string(), helper.code_name.clone()));
            }
        }
        self.destination_rates
            .get(ANY)
            .map(|_| (ANY.to_string(), ANY.to_string()))
    }

    /// Whether the timings together cover every moment of the week
    pub fn is_continuous(&self) -> bool {
        let mut weekdays = [false; 7];
        for timing in self.timings.values() {
            if timing.is_blank() {
                return true;
            }
            if !timing.years.is_empty() || !timing.months.is_empty() || !timing.month_days.is_empty()
            {
                continue;
            }
            if !(timing.start_time.is_empty() || timing.start_time == "00:00:00") {
                continue;
            }
            for wd in &timing.week_days {
                if let Some(slot) = weekdays.get_mut(*wd as usize) {
                    *slot = true;
                }
            }
            if weekdays.iter().all(|d| *d) {
                return true;
            }
        }
        false
    }

    /// First rating whose groups are out of order or not increment aligned
    pub fn first_unsane_rating(&self) -> Option<&str> {
        for (tag, rating) in &self.ratings {
            let mut rates = rating.rates.clone();
            rates.sort_by_key(|r| r.group_interval_start);
            for pair in rates.windows(2) {
                let (rate, next) = (&pair[0], &pair[1]);
                if next.group_interval_start <= rate.group_interval_start
                    || rate.rate_unit.is_zero()
                    || rate.rate_increment.is_zero()
                {
                    return Some(tag);
                }
                let inc = crate::utils::time::nanos(rate.rate_increment);
                if inc != 0 && crate::utils::time::nanos(next.group_interval_start) % inc != 0 {
                    return Some(tag);
                }
            }
        }
        None
    }
}

/// All prefixes of `s` from the longest down to `min_len` characters
pub fn split_prefix(s: &str, min_len: usize) -> Vec<&str> {
    let bounds: Vec<usize> = s
        .char_indices()
        .map(|(i, c)| i + c.len_utf8())
        .collect();
    bounds
        .into_iter()
        .rev()
        .filter(|end| s[..*end].chars().count() >= min_len.max(1))
        .map(|end| &s[..end])
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RatingPlanActivation {
    pub activation_time: DateTime<Utc>,
    #[serde(rename = "RatingPlanID")]
    pub rating_plan_id: String,
    pub fallback_keys: Vec<String>,
    #[serde(rename = "CdrStatQueueIDs")]
    pub cdr_stat_queue_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RatingProfile {
    pub direction: String,
    pub tenant: String,
    pub category: String,
    pub subject: String,
    pub rating_plan_activations: Vec<RatingPlanActivation>,
}

impl RatingProfile {
    pub fn full_id(&self) -> String {
        concatenated_key(&[&self.direction, &self.tenant, &self.category, &self.subject])
    }

    /// Activations relevant for `[start, end]`: from the last one at or
    /// before `start` up to the last one not after `end`
    pub fn active_for_call(
        &mut self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> &[RatingPlanActivation] {
        self.rating_plan_activations
            .sort_by_key(|a| a.activation_time);
        let mut last_before_start = 0;
        let mut first_after_end = self.rating_plan_activations.len();
        for (i, rpa) in self.rating_plan_activations.iter().enumerate() {
            if rpa.activation_time <= start {
                last_before_start = i;
            }
            if rpa.activation_time > end {
                first_after_end = i;
                break;
            }
        }
        let first_after_end = first_after_end.max(last_before_start);
        &self.rating_plan_activations[last_before_start..first_after_end]
    }
}

/// Rating plan selection result attached to timespans
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RatingInfo {
    pub matched_subject: String,
    #[serde(rename = "RatingPlanID")]
    pub rating_plan_id: String,
    pub matched_prefix: String,
    #[serde(rename = "MatchedDestID")]
    pub matched_dest_id: String,
    pub activation_time: DateTime<Utc>,
    pub rate_intervals: Vec<RateInterval>,
    pub fallback_keys: Vec<String>,
}

pub type SharedRatingInfo = Arc<RatingInfo>;

impl RatingInfo {
    /// Candidate rate intervals for a timespan starting at `start` and ending at `end`
    ///
    /// Intervals are ranked by weight, then by how close their window opens
    /// before `start`. Later opening intervals of at least the same weight
    /// that start before `end` follow so the splitter can cut at their margin.
    pub fn select_rate_intervals(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<RateInterval> {
        let mut sorted = self.rate_intervals.clone();
        sorted.sort_by(|a, b| {
            b.weight
                .partial_cmp(&a.weight)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.timing.left_margin(start).cmp(&b.timing.left_margin(start)))
        });
        if sorted.is_empty() {
            return sorted;
        }

        let mut best_delta: Option<Duration> = None;
        let mut best_index = 0;
        let mut best_weight = 0.0;
        for (i, ri) in sorted.iter().enumerate() {
            if !ri.contains(start, false) {
                continue;
            }
            if ri.weight < best_weight {
                break;
            }
            let left = ri.timing.left_margin(start);
            let delta = start - left;
            if left <= start && best_delta.map_or(true, |d| delta < d) {
                best_index = i;
                best_weight = ri.weight;
                best_delta = Some(delta);
            }
        }

        let mut result = vec![sorted[best_index].clone()];
        for ri in sorted.iter().skip(best_index + 1) {
            if ri.weight < best_weight {
                break;
            }
            if ri.timing.left_margin(start) < end {
                result.push(ri.clone());
            }
        }
        result
    }
}
