//! Action triggers
//!
//! A trigger watches a balance or counter of an account (or a metric of a
//! stats queue) and runs an action group once its threshold is crossed.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::query::Query;
use crate::utils::time::{duration_nanos, is_zero_time, zero_time};
use crate::AppResult;

pub const TRIGGER_MIN_EVENT_COUNTER: &str = "*min_event_counter";
pub const TRIGGER_MAX_EVENT_COUNTER: &str = "*max_event_counter";
pub const TRIGGER_MIN_BALANCE_COUNTER: &str = "*min_balance_counter";
pub const TRIGGER_MAX_BALANCE_COUNTER: &str = "*max_balance_counter";
pub const TRIGGER_MIN_COUNTER: &str = "*min_counter";
pub const TRIGGER_MAX_COUNTER: &str = "*max_counter";
pub const TRIGGER_MIN_BALANCE: &str = "*min_balance";
pub const TRIGGER_MAX_BALANCE: &str = "*max_balance";
pub const TRIGGER_BALANCE_EXPIRED: &str = "*balance_expired";

pub const COUNTER_EVENT: &str = "*event";
pub const COUNTER_BALANCE: &str = "*balance";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ActionTrigger {
    #[serde(rename = "UniqueID")]
    pub unique_id: String,
    /// `*min_balance`, `*max_event_counter`, `*balance_expired` or, on stats
    /// queues, `*min_asr`, `*max_acd` and friends
    pub threshold_type: String,
    pub threshold_value: Decimal,
    /// Rearm after every execution
    pub recurrent: bool,
    /// Minimum pause between two executions of a recurrent trigger
    #[serde(with = "duration_nanos")]
    pub min_sleep: Duration,
    pub expiration_date: DateTime<Utc>,
    pub activation_date: DateTime<Utc>,
    /// Balance type watched
    #[serde(rename = "TOR")]
    pub tor: String,
    /// Query selecting the balances or counters watched
    pub filter: String,
    pub weight: f64,
    #[serde(rename = "ActionsID")]
    pub actions_id: String,
    /// Stats queues only: fire once the queue holds at least this many items
    pub min_queued_items: usize,
}

impl Default for ActionTrigger {
    fn default() -> Self {
        Self {
            unique_id: String::new(),
            threshold_type: String::new(),
            threshold_value: Decimal::ZERO,
            recurrent: false,
            min_sleep: Duration::zero(),
            expiration_date: zero_time(),
            activation_date: zero_time(),
            tor: String::new(),
            filter: String::new(),
            weight: 0.0,
            actions_id: String::new(),
            min_queued_items: 0,
        }
    }
}

impl ActionTrigger {
    pub fn is_active(&self, t: DateTime<Utc>) -> bool {
        is_zero_time(&self.activation_date) || t > self.activation_date
    }

    pub fn is_expired(&self, t: DateTime<Utc>) -> bool {
        !is_zero_time(&self.expiration_date) && t > self.expiration_date
    }

    pub fn query(&self) -> AppResult<Query> {
        Query::parse(&self.filter)
    }

    pub fn is_counter(&self) -> bool {
        self.threshold_type.contains("counter")
    }

    pub fn is_max(&self) -> bool {
        self.threshold_type.starts_with("*max")
    }

    /// Counter kind this trigger feeds on, `*event` unless it names balances
    pub fn counter_type(&self) -> &'static str {
        if self.threshold_type.contains("balance") {
            COUNTER_BALANCE
        } else {
            COUNTER_EVENT
        }
    }

    /// Generic `*min_counter`/`*max_counter` watch any counter kind
    pub fn watches_counter(&self, counter_type: &str) -> bool {
        if self.threshold_type == TRIGGER_MIN_COUNTER || self.threshold_type == TRIGGER_MAX_COUNTER {
            return true;
        }
        counter_type
            .strip_prefix('*')
            .is_some_and(|kind| self.threshold_type.contains(kind))
    }

    /// Compares `value` against the threshold in the trigger's direction
    pub fn crossed(&self, value: Decimal) -> bool {
        if self.is_max() {
            value >= self.threshold_value
        } else {
            value <= self.threshold_value
        }
    }

    pub fn new_record(&self) -> ActionTriggerRecord {
        ActionTriggerRecord {
            unique_id: self.unique_id.clone(),
            recurrent: self.recurrent,
            executed: false,
            expiration_date: self.expiration_date,
            activation_date: self.activation_date,
            last_execution_time: zero_time(),
        }
    }
}

/// Higher weights first
pub fn sort_triggers(triggers: &mut [ActionTrigger]) {
    triggers.sort_by(|a, b| {
        b.weight
            .partial_cmp(&a.weight)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ActionTriggerGroup {
    pub tenant: String,
    pub name: String,
    pub action_triggers: Vec<ActionTrigger>,
}

/// Per owner execution state of one trigger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ActionTriggerRecord {
    #[serde(rename = "UniqueID")]
    pub unique_id: String,
    pub recurrent: bool,
    pub executed: bool,
    pub expiration_date: DateTime<Utc>,
    pub activation_date: DateTime<Utc>,
    pub last_execution_time: DateTime<Utc>,
}

impl Default for ActionTriggerRecord {
    fn default() -> Self {
        Self {
            unique_id: String::new(),
            recurrent: false,
            executed: false,
            expiration_date: zero_time(),
            activation_date: zero_time(),
            last_execution_time: zero_time(),
        }
    }
}

impl ActionTriggerRecord {
    /// A recurrent trigger that fired less than `min_sleep` ago stays quiet
    pub fn sleeping(&self, trigger: &ActionTrigger, now: DateTime<Utc>) -> bool {
        trigger.recurrent
            && !is_zero_time(&self.last_execution_time)
            && now - self.last_execution_time < trigger.min_sleep
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_activation_window() {
        let now = Utc::now();
        let mut at = ActionTrigger::default();
        assert!(at.is_active(now));
        assert!(!at.is_expired(now));
        at.expiration_date = now - Duration::hours(1);
        assert!(at.is_expired(now));
        at.activation_date = now + Duration::hours(1);
        assert!(!at.is_active(now));
    }

    #[test]
    fn test_threshold_direction() {
        let mut at = ActionTrigger {
            threshold_type: TRIGGER_MIN_BALANCE.into(),
            threshold_value: dec!(2),
            ..Default::default()
        };
        assert!(at.crossed(dec!(1)));
        assert!(at.crossed(dec!(2)));
        assert!(!at.crossed(dec!(3)));
        at.threshold_type = TRIGGER_MAX_EVENT_COUNTER.into();
        assert!(at.crossed(dec!(3)));
        assert!(at.is_counter());
        assert_eq!(at.counter_type(), COUNTER_EVENT);
        assert!(at.watches_counter(COUNTER_EVENT));
        assert!(!at.watches_counter(COUNTER_BALANCE));
    }

    #[test]
    fn test_generic_counter_watches_all() {
        let at = ActionTrigger {
            threshold_type: TRIGGER_MAX_COUNTER.into(),
            ..Default::default()
        };
        assert!(at.watches_counter(COUNTER_EVENT));
        assert!(at.watches_counter(COUNTER_BALANCE));
    }

    #[test]
    fn test_min_sleep() {
        let now = Utc::now();
        let at = ActionTrigger {
            recurrent: true,
            min_sleep: Duration::minutes(5),
            ..Default::default()
        };
        let mut rec = at.new_record();
        assert!(!rec.sleeping(&at, now));
        rec.last_execution_time = now - Duration::minutes(1);
        assert!(rec.sleeping(&at, now));
        rec.last_execution_time = now - Duration::minutes(10);
        assert!(!rec.sleeping(&at, now));
    }
}
