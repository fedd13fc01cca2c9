//! Balance model
//!
//! Balances hold a signed decimal value of one type of record (money,
//! seconds, messages, bytes or generic units) together with the filters
//! deciding which requests may draw from them.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::rating::RITiming;
use crate::utils::consts::{ANY, DEFAULT, ZERO};
use crate::utils::time::{is_zero_time, parse_duration, zero_time};
use crate::utils::{gen_uuid, StringMap};

/// Per type of record multiplier applied when units are derived from money
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ValueFactor(pub BTreeMap<String, Decimal>);

impl ValueFactor {
    pub fn get(&self, tor: &str) -> Decimal {
        self.0.get(tor).copied().unwrap_or(Decimal::ONE)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Balance {
    /// System wide unique, never rewritten once set
    #[serde(rename = "UUID")]
    pub uuid: String,
    /// Account wide unique, user assigned
    #[serde(rename = "ID")]
    pub id: String,
    pub value: Decimal,
    pub directions: StringMap,
    pub expiration_date: DateTime<Utc>,
    pub weight: f64,
    #[serde(rename = "DestinationIDs")]
    pub destination_ids: StringMap,
    pub rating_subject: String,
    pub categories: StringMap,
    pub shared_groups: StringMap,
    pub timings: Vec<RITiming>,
    #[serde(rename = "TimingIDs")]
    pub timing_ids: StringMap,
    pub disabled: bool,
    pub factor: ValueFactor,
    pub blocker: bool,
    pub unlimited: bool,
    /// Length of the matched destination prefix, set during selection
    #[serde(skip)]
    pub precision: usize,
    #[serde(skip)]
    pub dirty: bool,
}

impl Default for Balance {
    fn default() -> Self {
        Self {
            uuid: String::new(),
            id: String::new(),
            value: Decimal::ZERO,
            directions: StringMap::new(),
            expiration_date: zero_time(),
            weight: 0.0,
            destination_ids: StringMap::new(),
            rating_subject: String::new(),
            categories: StringMap::new(),
            shared_groups: StringMap::new(),
            timings: Vec::new(),
            timing_ids: StringMap::new(),
            disabled: false,
            factor: ValueFactor::default(),
            blocker: false,
            unlimited: false,
            precision: 0,
            dirty: false,
        }
    }
}

impl Balance {
    /// Fresh default monetary balance
    pub fn new_default() -> Self {
        Self {
            uuid: gen_uuid(),
            id: DEFAULT.to_string(),
            ..Default::default()
        }
    }

    pub fn is_default(&self) -> bool {
        self.id == DEFAULT
    }

    /// Expired when an expiration is set and falls before `t` plus one second
    ///
    /// Expiry is compared at second granularity: a balance lapsing within
    /// the next second is already treated as expired, so it is never picked
    /// for a debit that would straddle its expiration.
    pub fn is_expired_at(&self, t: DateTime<Utc>) -> bool {
        !is_zero_time(&self.expiration_date) && self.expiration_date < t + Duration::seconds(1)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_active_at(&self, t: DateTime<Utc>) -> bool {
        if self.disabled {
            return false;
        }
        self.timings.is_empty() || self.timings.iter().any(|tim| tim.is_active_at(t))
    }

    pub fn is_active(&self) -> bool {
        self.is_active_at(Utc::now())
    }

    pub fn match_category(&self, category: &str) -> bool {
        self.categories.len() == 0 || self.categories.has(category)
    }

    pub fn match_direction(&self, direction: &str) -> bool {
        self.directions.len() == 0 || self.directions.has(direction)
    }

    /// Destination filtering is configured and not `*any`
    pub fn has_destination(&self) -> bool {
        self.destination_ids.len() > 0 && !self.destination_ids.has(ANY)
    }

    pub fn match_destination(&self, destination_id: &str) -> bool {
        !self.has_destination() || self.destination_ids.has(destination_id)
    }

    pub fn add_value(&mut self, amount: Decimal) {
        if self.unlimited {
            return;
        }
        self.set_value(self.value + amount);
    }

    pub fn subtract_value(&mut self, amount: Decimal) {
        if self.unlimited {
            return;
        }
        self.set_value(self.value - amount);
    }

    pub fn set_value(&mut self, amount: Decimal) {
        self.value = amount;
        self.dirty = true;
    }

    /// Copy carrying a new UUID, used when a balance template seeds an account
    pub fn clone_fresh(&self) -> Self {
        Self {
            uuid: gen_uuid(),
            ..self.clone()
        }
    }

    /// Same identity and filters, value ignored
    pub fn same_definition(&self, other: &Balance) -> bool {
        let norm = |m: &StringMap| {
            if m.len() == 0 {
                StringMap::from_items([ANY])
            } else {
                m.clone()
            }
        };
        self.uuid == other.uuid
            && self.id == other.id
            && self.expiration_date == other.expiration_date
            && self.weight == other.weight
            && norm(&self.destination_ids) == norm(&other.destination_ids)
            && self.directions == other.directions
            && self.rating_subject == other.rating_subject
            && self.categories == other.categories
            && self.shared_groups == other.shared_groups
            && self.disabled == other.disabled
            && self.blocker == other.blocker
    }

    /// Rating subject of the form `*zero<duration>` means free units debited
    /// in steps of that duration
    pub fn zero_rating_step(&self) -> Option<Duration> {
        if self.rating_subject.is_empty() {
            return Some(Duration::seconds(1));
        }
        let rest = self.rating_subject.strip_prefix(ZERO)?;
        match parse_duration(rest) {
            Ok(d) if d > Duration::zero() => Some(d),
            _ => Some(Duration::seconds(1)),
        }
    }

    pub fn as_summary(&self, tor: &str) -> BalanceSummary {
        BalanceSummary {
            id: if self.id.is_empty() {
                self.uuid.clone()
            } else {
                self.id.clone()
            },
            tor: tor.to_string(),
            value: self.value,
            disabled: self.disabled,
        }
    }
}

/// Sorts by precision descending, then weight descending
pub fn sort_balances(balances: &mut [Balance]) {
    balances.sort_by(|a, b| {
        b.precision.cmp(&a.precision).then_with(|| {
            b.weight
                .partial_cmp(&a.weight)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
    });
}

/// Sum of the values of active, unexpired balances
pub fn total_value(balances: &[Balance], now: DateTime<Utc>) -> Decimal {
    balances
        .iter()
        .filter(|b| !b.is_expired_at(now) && b.is_active_at(now))
        .map(|b| b.value)
        .sum()
}

/// Compact view of a balance, attached to CDRs as the account summary
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct BalanceSummary {
    /// ID, or UUID when the balance has none
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Type")]
    pub tor: String,
    pub value: Decimal,
    pub disabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_expiry_uses_one_second_slack() {
        let now = Utc::now();
        let mut b = Balance::default();
        assert!(!b.is_expired_at(now));
        b.expiration_date = now + Duration::milliseconds(500);
        assert!(b.is_expired_at(now));
        b.expiration_date = now + Duration::seconds(10);
        assert!(!b.is_expired_at(now));
    }

    #[test]
    fn test_unlimited_ignores_changes() {
        let mut b = Balance {
            value: dec!(10),
            unlimited: true,
            ..Default::default()
        };
        b.subtract_value(dec!(3));
        assert_eq!(b.value, dec!(10));
        assert!(!b.dirty);
        b.unlimited = false;
        b.subtract_value(dec!(3));
        assert_eq!(b.value, dec!(7));
        assert!(b.dirty);
    }

    #[test]
    fn test_zero_rating_step() {
        let mut b = Balance::default();
        assert_eq!(b.zero_rating_step(), Some(Duration::seconds(1)));
        b.rating_subject = "*zero60s".into();
        assert_eq!(b.zero_rating_step(), Some(Duration::seconds(60)));
        b.rating_subject = "*zero".into();
        assert_eq!(b.zero_rating_step(), Some(Duration::seconds(1)));
        b.rating_subject = "special".into();
        assert_eq!(b.zero_rating_step(), None);
    }

    #[test]
    fn test_sort_precision_then_weight() {
        let mut list = vec![
            Balance { id: "a".into(), weight: 30.0, ..Default::default() },
            Balance { id: "b".into(), weight: 10.0, precision: 4, ..Default::default() },
            Balance { id: "c".into(), weight: 20.0, precision: 4, ..Default::default() },
        ];
        sort_balances(&mut list);
        let ids: Vec<_> = list.iter().map(|b| b.id.as_str()).collect();
        assert_eq!(ids, ["c", "b", "a"]);
    }

    #[test]
    fn test_destination_matching() {
        let mut b = Balance::default();
        assert!(b.match_destination("NAT"));
        b.destination_ids = StringMap::from_items(["NAT", "!RET"]);
        assert!(b.has_destination());
        assert!(b.match_destination("NAT"));
        assert!(!b.match_destination("RET"));
    }
}
