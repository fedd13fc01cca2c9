//! Timespans and increments
//!
//! A timespan is a half-open slice of a call priced by a single rate
//! interval. Its increments are stored compressed: one template increment
//! plus the number of times it repeats.

use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::rating::{copy_hour, is_midnight, RateInterval, SharedRatingInfo};
use crate::utils::div;
use crate::utils::time::{duration_nanos, nanos};

/// Unit balance touched by an increment
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct UnitInfo {
    #[serde(rename = "UUID")]
    pub uuid: String,
    #[serde(rename = "ID")]
    pub id: String,
    /// Balance value after the debit
    pub value: Decimal,
    #[serde(rename = "DestinationID")]
    pub destination_id: String,
    /// Units taken per increment
    pub consumed: Decimal,
    #[serde(rename = "TOR")]
    pub tor: String,
    pub rate_interval: Option<RateInterval>,
}

/// Monetary balance touched by an increment
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct MonetaryInfo {
    #[serde(rename = "UUID")]
    pub uuid: String,
    #[serde(rename = "ID")]
    pub id: String,
    pub value: Decimal,
    pub rate_interval: Option<RateInterval>,
}

/// Which balances paid an increment
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DebitInfo {
    pub unit: Option<UnitInfo>,
    pub monetary: Option<MonetaryInfo>,
    /// Full id of the paying account, differs from the caller for shared balances
    #[serde(rename = "AccountID")]
    pub account_id: String,
}

impl DebitInfo {
    pub fn is_paid(&self) -> bool {
        self.unit.is_some() || self.monetary.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Increment {
    #[serde(with = "duration_nanos")]
    pub duration: Duration,
    pub cost: Decimal,
    pub balance_info: DebitInfo,
    pub compress_factor: i64,
    /// Debit passes over this increment; kept for stored records only
    pub paid: i64,
}

impl Increment {
    pub fn total_cost(&self) -> Decimal {
        self.cost * Decimal::from(self.compress_factor)
    }

    pub fn total_duration(&self) -> Duration {
        self.duration * self.compress_factor as i32
    }

    fn same_as(&self, other: &Increment) -> bool {
        self.duration == other.duration
            && self.cost == other.cost
            && self.balance_info == other.balance_info
    }
}

/// Compressed increment list of a timespan
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Increments {
    pub comp_increment: Option<Increment>,
    /// Increments past this index are free under the `*free` max cost strategy
    pub max_cost_free_index: i64,
}

impl Increments {
    pub fn len(&self) -> i64 {
        self.comp_increment.as_ref().map_or(0, |i| i.compress_factor)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_cost(&self) -> Decimal {
        self.comp_increment
            .as_ref()
            .map_or(Decimal::ZERO, Increment::total_cost)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct TimeSpan {
    pub time_start: DateTime<Utc>,
    pub time_end: DateTime<Utc>,
    pub cost: Decimal,
    pub rate_interval: Option<RateInterval>,
    /// Call duration so far, up to `time_end`
    #[serde(with = "duration_nanos")]
    pub duration_index: Duration,
    pub increments: Increments,
    pub matched_subject: String,
    pub matched_prefix: String,
    #[serde(rename = "MatchedDestID")]
    pub matched_dest_id: String,
    #[serde(rename = "RatingPlanID")]
    pub rating_plan_id: String,
    pub compress_factor: i64,
    #[serde(skip)]
    pub rating_info: Option<SharedRatingInfo>,
}

impl PartialEq for TimeSpan {
    fn eq(&self, other: &Self) -> bool {
        self.time_start == other.time_start
            && self.time_end == other.time_end
            && self.cost == other.cost
            && self.rate_interval == other.rate_interval
            && self.duration_index == other.duration_index
            && self.increments == other.increments
            && self.matched_subject == other.matched_subject
            && self.matched_prefix == other.matched_prefix
            && self.matched_dest_id == other.matched_dest_id
            && self.rating_plan_id == other.rating_plan_id
            && self.compress_factor == other.compress_factor
    }
}

impl TimeSpan {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            time_start: start,
            time_end: end,
            compress_factor: 1,
            ..Default::default()
        }
    }

    pub fn duration(&self) -> Duration {
        self.time_end - self.time_start
    }

    pub fn compress_factor(&self) -> i64 {
        self.compress_factor.max(1)
    }

    pub fn unit_duration(&self) -> Duration {
        Duration::nanoseconds(nanos(self.duration()) / self.compress_factor())
    }

    pub fn unit_cost(&self) -> Decimal {
        div(self.cost, Decimal::from(self.compress_factor()), None)
    }

    /// Strictly inside the span
    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        t > self.time_start && t < self.time_end
    }

    pub fn group_start(&self) -> Duration {
        let s = self.duration_index - self.duration();
        if s < Duration::zero() {
            Duration::zero()
        } else {
            s
        }
    }

    pub fn group_end(&self) -> Duration {
        self.duration_index
    }

    pub fn set_rating_info(&mut self, info: SharedRatingInfo) {
        self.matched_subject = info.matched_subject.clone();
        self.matched_prefix = info.matched_prefix.clone();
        self.matched_dest_id = info.matched_dest_id.clone();
        self.rating_plan_id = info.rating_plan_id.clone();
        self.rating_info = Some(info);
    }

    fn copy_rating_info(&mut self, from: &TimeSpan) {
        if let Some(info) = &from.rating_info {
            self.set_rating_info(info.clone());
        }
    }

    /// Keeps the current interval when it is a better fit than `interval`
    pub fn set_rate_interval(&mut self, interval: &RateInterval) {
        if !self.has_better_rate_interval_than(interval) {
            self.rate_interval = Some(interval.clone());
        }
    }

    fn has_better_rate_interval_than(&self, interval: &RateInterval) -> bool {
        let other_distance = self.time_start - interval.timing.left_margin(self.time_start);
        if other_distance < Duration::zero() {
            return true;
        }
        let Some(own) = &self.rate_interval else {
            return false;
        };
        if own.weight < interval.weight {
            return false;
        }
        let own_distance = self.time_start - own.timing.left_margin(self.time_start);
        own_distance <= other_distance
    }

    /// Cost from increments when present, from the rate interval otherwise
    pub fn calculate_cost(&self, decimals: u32) -> Decimal {
        match &self.increments.comp_increment {
            Some(inc) if inc.compress_factor > 0 => {
                let factor = if self.increments.max_cost_free_index > 0 {
                    self.increments.max_cost_free_index
                } else {
                    inc.compress_factor
                };
                inc.cost * Decimal::from(factor) * Decimal::from(self.compress_factor())
            }
            _ => match &self.rate_interval {
                Some(ri) => ri.get_cost(self.duration(), self.group_start(), decimals),
                None => Decimal::ZERO,
            },
        }
    }

    /// Builds the increment template from the rate interval
    pub fn create_increments(&mut self, decimals: u32) {
        self.increments = Increments::default();
        let Some(ri) = &self.rate_interval else {
            return;
        };
        let increment = ri.rate_increment(self.group_start());
        let inc_nanos = nanos(increment).max(1);
        let count = (nanos(self.duration()) / inc_nanos).max(1);
        let total = self.calculate_cost(decimals);
        let unit_cost = div(total, Decimal::from(count), None);
        self.increments.comp_increment = Some(Increment {
            duration: increment,
            cost: unit_cost,
            balance_info: DebitInfo::default(),
            compress_factor: count,
            paid: 0,
        });
        self.cost = unit_cost * Decimal::from(count);
    }

    pub fn time_start_for_increment(&self, index: i64) -> DateTime<Utc> {
        let step = self
            .increments
            .comp_increment
            .as_ref()
            .map_or(Duration::zero(), |i| i.duration);
        self.time_start + Duration::nanoseconds(nanos(step) * index)
    }

    /// Shrinks the duration index by the duration handed over to `next`
    fn set_new_duration_index(&mut self, next: &TimeSpan) {
        let d = self.duration_index - next.duration();
        self.duration_index = if d < Duration::zero() { Duration::zero() } else { d };
    }

    fn split_at(&mut self, at: DateTime<Utc>) -> TimeSpan {
        let mut next = TimeSpan::new(at, self.time_end);
        next.copy_rating_info(self);
        next.duration_index = self.duration_index;
        self.time_end = at;
        self.set_new_duration_index(&next);
        next
    }

    /// Cuts the span where `interval` starts or stops applying
    ///
    /// The receiver keeps the head and the returned span the tail. Rate
    /// group boundaries inside the span are cut first; data spans only take
    /// the interval without time based cuts.
    pub fn split_by_rate_interval(&mut self, interval: &RateInterval, data: bool) -> Option<TimeSpan> {
        if !(interval.contains(self.time_start, false) || interval.contains(self.time_end, true)) {
            return None;
        }
        let mut rates: Vec<_> = interval.rating.rates.iter().collect();
        rates.sort_by_key(|r| r.group_interval_start);
        for rate in rates {
            if self.group_start() < rate.group_interval_start
                && self.group_end() > rate.group_interval_start
            {
                self.set_rate_interval(interval);
                let split = self.time_start + (rate.group_interval_start - self.group_start());
                let mut next = self.split_at(split);
                next.set_rate_interval(interval);
                return Some(next);
            }
        }
        if data {
            if interval.contains(self.time_start, false) {
                self.set_rate_interval(interval);
            }
            return None;
        }
        if interval.contains(self.time_start, false) && interval.contains(self.time_end, true) {
            self.set_rate_interval(interval);
            return None;
        }
        if interval.contains(self.time_start, false) {
            let split = interval.timing.right_margin(self.time_start);
            self.set_rate_interval(interval);
            if split == self.time_start || split == self.time_end {
                return None;
            }
            return Some(self.split_at(split));
        }
        if interval.contains(self.time_end, true) {
            let split = copy_hour(interval.timing.left_margin(self.time_end), self.time_start);
            if split == self.time_end {
                return None;
            }
            let mut next = self.split_at(split);
            next.set_rate_interval(interval);
            return Some(next);
        }
        None
    }

    /// Splits before the 1-based increment `index`; the tail keeps the rest
    pub fn split_by_increment(&mut self, index: i64) -> Option<TimeSpan> {
        let index = index - 1;
        if index <= 0 || index >= self.increments.len() {
            return None;
        }
        let at = self.time_start_for_increment(index);
        let mut next = TimeSpan::new(at, self.time_end);
        next.rate_interval = self.rate_interval.clone();
        next.copy_rating_info(self);
        next.duration_index = self.duration_index;
        let mut tail_inc = self.increments.comp_increment.clone();
        if let Some(inc) = tail_inc.as_mut() {
            inc.compress_factor -= index;
            next.cost = inc.total_cost();
        }
        next.increments = Increments {
            comp_increment: tail_inc,
            max_cost_free_index: 0,
        };
        self.time_end = at;
        if let Some(inc) = self.increments.comp_increment.as_mut() {
            inc.compress_factor = index;
            self.cost = inc.total_cost();
        }
        self.set_new_duration_index(&next);
        Some(next)
    }

    /// Splits where a new rating plan activates inside the span
    pub fn split_by_rating_plan(&mut self, activation: DateTime<Utc>) -> Option<TimeSpan> {
        if !self.contains(activation) {
            return None;
        }
        Some(self.split_at(activation))
    }

    /// Splits at the first midnight inside the span
    pub fn split_by_day(&mut self) -> Option<TimeSpan> {
        if self.time_start.date_naive() == self.time_end.date_naive() || is_midnight(self.time_end) {
            return None;
        }
        let next_day = self.time_start.date_naive().succ_opt()?;
        let split = Utc.from_utc_datetime(&next_day.and_hms_opt(0, 0, 0)?);
        if split >= self.time_end {
            return None;
        }
        Some(self.split_at(split))
    }

    /// Extends the span so it lasts a whole multiple of `step`
    pub fn round_to_duration(&mut self, step: Duration) {
        let current = self.duration();
        let target = if step < current {
            round_duration(step, current)
        } else {
            step
        };
        if target > current {
            self.time_end = self.time_start + target;
            self.duration_index = self.duration_index + (target - current);
        }
    }

    /// Identical pricing and debit footprint, used to merge neighbours
    pub fn same_shape(&self, other: &TimeSpan) -> bool {
        let incs_equal = match (&self.increments.comp_increment, &other.increments.comp_increment) {
            (None, None) => true,
            (Some(a), Some(b)) => a.same_as(b) && a.compress_factor == b.compress_factor,
            _ => false,
        };
        incs_equal
            && self.rate_interval == other.rate_interval
            && self.unit_cost() == other.unit_cost()
            && self.unit_duration() == other.unit_duration()
            && self.matched_subject == other.matched_subject
            && self.matched_prefix == other.matched_prefix
            && self.matched_dest_id == other.matched_dest_id
            && self.rating_plan_id == other.rating_plan_id
    }

    /// Day of month of the span start, exposed for day based reports
    pub fn start_day(&self) -> u32 {
        self.time_start.day()
    }
}

/// Rounds `value` up to a whole multiple of `step`
pub fn round_duration(step: Duration, value: Duration) -> Duration {
    let step_n = nanos(step);
    if step_n <= 0 {
        return value;
    }
    let v = nanos(value);
    let rounded = if v % step_n == 0 { v } else { (v / step_n + 1) * step_n };
    Duration::nanoseconds(rounded)
}

/// Merges consecutive spans with the same shape
pub fn compress(spans: Vec<TimeSpan>) -> Vec<TimeSpan> {
    let mut out: Vec<TimeSpan> = Vec::with_capacity(spans.len());
    for mut ts in spans {
        if let Some(last) = out.last_mut() {
            if last.same_shape(&ts) {
                last.compress_factor = last.compress_factor() + 1;
                last.cost += ts.cost;
                last.time_end = ts.time_end;
                last.duration_index = ts.duration_index;
                continue;
            }
        }
        ts.compress_factor = ts.compress_factor();
        out.push(ts);
    }
    out
}

/// Expands compressed spans back into unit spans
pub fn decompress(spans: Vec<TimeSpan>) -> Vec<TimeSpan> {
    let mut out = Vec::with_capacity(spans.len());
    for mut cts in spans {
        let factor = cts.compress_factor();
        if factor > 1 {
            let unit = cts.unit_duration();
            let unit_cost = cts.unit_cost();
            for i in (2..=factor).rev() {
                let mut uts = cts.clone();
                uts.time_end = cts.time_start + unit;
                uts.duration_index = cts.duration_index - unit * (i - 1) as i32;
                uts.compress_factor = 1;
                uts.cost = unit_cost;
                cts.time_start = uts.time_end;
                out.push(uts);
            }
            cts.cost = unit_cost;
        }
        cts.compress_factor = 1;
        out.push(cts);
    }
    out
}
