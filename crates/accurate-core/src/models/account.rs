//! Account model
//!
//! An account groups typed balance chains, the trigger groups watching them
//! and the counters those triggers read.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::balance::{Balance, BalanceSummary};
use super::trigger::{ActionTrigger, ActionTriggerRecord, COUNTER_BALANCE, COUNTER_EVENT};
use crate::query::Query;
use crate::utils::consts::MONETARY;
use crate::utils::{concatenated_key, StringMap};
use crate::AppResult;

/// Accumulated traffic for one trigger filter
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CounterFilter {
    #[serde(rename = "UniqueID")]
    pub unique_id: String,
    pub filter: String,
    pub value: Decimal,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct UnitCounter {
    /// `*event` or `*balance`
    pub counter_type: String,
    pub counters: Vec<CounterFilter>,
}

impl UnitCounter {
    /// Copies values of matching filters from `old` when both count the same kind
    fn copy_counter_values(&mut self, old: &UnitCounter) -> bool {
        if self.counter_type != old.counter_type {
            return false;
        }
        for c in self.counters.iter_mut() {
            if let Some(o) = old.counters.iter().find(|o| o.filter == c.filter) {
                c.value = o.value;
            }
        }
        true
    }
}

/// Counters keyed by balance type
pub type UnitCounters = BTreeMap<String, Vec<UnitCounter>>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Account {
    pub tenant: String,
    pub name: String,
    pub balance_map: BTreeMap<String, Vec<Balance>>,
    pub unit_counters: UnitCounters,
    /// Trigger group ids
    #[serde(rename = "TriggerIDs")]
    pub trigger_ids: StringMap,
    pub trigger_records: BTreeMap<String, ActionTriggerRecord>,
    pub allow_negative: bool,
    pub disabled: bool,
    #[serde(skip)]
    pub executing_triggers: bool,
}

impl Account {
    pub fn new(tenant: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    /// "tenant:name"
    pub fn full_id(&self) -> String {
        concatenated_key(&[self.tenant.as_str(), self.name.as_str()])
    }

    pub fn balances(&self, tor: &str) -> &[Balance] {
        self.balance_map.get(tor).map_or(&[], Vec::as_slice)
    }

    pub fn balance_by_uuid_mut(&mut self, uuid: &str) -> Option<&mut Balance> {
        self.balance_map
            .values_mut()
            .flat_map(|chain| chain.iter_mut())
            .find(|b| b.uuid == uuid)
    }

    /// Position of the default monetary balance, created when missing
    pub fn default_money_balance_index(&mut self) -> usize {
        let chain = self.balance_map.entry(MONETARY.to_string()).or_default();
        if let Some(i) = chain.iter().position(Balance::is_default) {
            return i;
        }
        chain.push(Balance::new_default());
        chain.len() - 1
    }

    pub fn default_money_balance(&mut self) -> &mut Balance {
        let i = self.default_money_balance_index();
        &mut self.balance_map.entry(MONETARY.to_string()).or_default()[i]
    }

    /// Drops balances expired at `now`
    pub fn clean_expired(&mut self, now: DateTime<Utc>) {
        for chain in self.balance_map.values_mut() {
            chain.retain(|b| !b.is_expired_at(now));
        }
    }

    pub fn all_balances_expired(&self, now: DateTime<Utc>) -> bool {
        self.balance_map
            .values()
            .flat_map(|chain| chain.iter())
            .all(|b| b.is_expired_at(now))
    }

    /// Shared groups referenced by any balance
    pub fn shared_groups(&self) -> Vec<String> {
        let mut groups: Vec<String> = self
            .balance_map
            .values()
            .flat_map(|chain| chain.iter())
            .flat_map(|b| b.shared_groups.slice())
            .collect();
        groups.sort();
        groups.dedup();
        groups
    }

    /// Balances only, counters and trigger state left behind
    pub fn clone_balances(&self) -> Account {
        Account {
            tenant: self.tenant.clone(),
            name: self.name.clone(),
            balance_map: self.balance_map.clone(),
            allow_negative: self.allow_negative,
            disabled: self.disabled,
            ..Default::default()
        }
    }

    pub fn clear_dirty(&mut self) {
        for b in self.balance_map.values_mut().flat_map(|c| c.iter_mut()) {
            b.dirty = false;
        }
    }

    pub fn has_dirty(&self) -> bool {
        self.balance_map.values().flat_map(|c| c.iter()).any(|b| b.dirty)
    }

    /// True when any balance, seen as `{Type, ...balance}`, matches `condition`
    pub fn match_action_filter(&self, condition: &str) -> AppResult<bool> {
        let query = Query::parse(condition)?;
        for (tor, chain) in &self.balance_map {
            for b in chain {
                let mut doc = serde_json::to_value(b)?;
                if let Value::Object(m) = &mut doc {
                    m.insert("Type".into(), Value::String(tor.clone()));
                }
                if query.matches_value(&doc)? {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Keeps records of known triggers and creates the missing ones
    pub fn init_trigger_records(&mut self, triggers: &[ActionTrigger]) {
        let mut records = BTreeMap::new();
        for at in triggers {
            let rec = self
                .trigger_records
                .remove(&at.unique_id)
                .unwrap_or_else(|| at.new_record());
            records.insert(at.unique_id.clone(), rec);
        }
        self.trigger_records = records;
    }

    /// Rebuilds counters from the counter triggers, carrying old values over
    pub fn init_counters(&mut self, triggers: &[ActionTrigger]) {
        let old = std::mem::take(&mut self.unit_counters);
        let mut counters = UnitCounters::new();
        for at in triggers.iter().filter(|at| at.is_counter()) {
            let ct = at.counter_type();
            let list = counters.entry(at.tor.clone()).or_default();
            let uc = match list.iter().position(|uc| uc.counter_type == ct) {
                Some(i) => &mut list[i],
                None => {
                    list.push(UnitCounter {
                        counter_type: ct.to_string(),
                        counters: Vec::new(),
                    });
                    let last = list.len() - 1;
                    &mut list[last]
                }
            };
            if !uc.counters.iter().any(|c| c.filter == at.filter) {
                uc.counters.push(CounterFilter {
                    unique_id: at.unique_id.clone(),
                    filter: at.filter.clone(),
                    value: Decimal::ZERO,
                });
            }
        }
        for (tor, list) in counters.iter_mut() {
            let Some(old_list) = old.get(tor) else {
                continue;
            };
            for uc in list.iter_mut() {
                for old_uc in old_list {
                    if uc.copy_counter_values(old_uc) {
                        break;
                    }
                }
            }
        }
        self.unit_counters = counters;
    }

    /// Adds `amount` to the counters of `tor`
    ///
    /// Event counters test their filter against `event`, the view of the
    /// priced call; balance counters test it against the debited balance.
    pub fn add_units(
        &mut self,
        amount: Decimal,
        tor: &str,
        event: Option<&Value>,
        balance: Option<&Balance>,
    ) -> AppResult<()> {
        let Some(list) = self.unit_counters.get_mut(tor) else {
            return Ok(());
        };
        let balance_doc = match balance {
            Some(b) => Some(serde_json::to_value(b)?),
            None => None,
        };
        for uc in list.iter_mut() {
            if uc.counter_type.is_empty() {
                uc.counter_type = COUNTER_EVENT.to_string();
            }
            for c in uc.counters.iter_mut() {
                let target = match uc.counter_type.as_str() {
                    COUNTER_EVENT => event,
                    COUNTER_BALANCE => balance_doc.as_ref(),
                    _ => None,
                };
                if let Some(doc) = target {
                    if Query::parse(&c.filter)?.matches_value(doc)? {
                        c.value += amount;
                    }
                }
            }
        }
        Ok(())
    }

    /// Zeroes counters of `tor` (all types when `None`) whose filter passes `filter`
    pub fn reset_counters(&mut self, tor: Option<&str>, filter: Option<&Query>) -> AppResult<()> {
        for (key, list) in self.unit_counters.iter_mut() {
            if tor.is_some_and(|t| !t.is_empty() && t != key) {
                continue;
            }
            for uc in list.iter_mut() {
                for c in uc.counters.iter_mut() {
                    let hit = match filter {
                        Some(q) => q.matches(&*c)?,
                        None => true,
                    };
                    if hit {
                        c.value = Decimal::ZERO;
                    }
                }
            }
        }
        Ok(())
    }

    pub fn as_summary(&self) -> AccountSummary {
        let mut summaries = Vec::new();
        for (tor, chain) in &self.balance_map {
            for b in chain {
                summaries.push(b.as_summary(tor));
            }
        }
        AccountSummary {
            tenant: self.tenant.clone(),
            id: self.name.clone(),
            balance_summaries: summaries,
            allow_negative: self.allow_negative,
            disabled: self.disabled,
        }
    }
}

/// View of a priced call that event counter filters are run against
pub fn counter_event_view(category: &str, direction: &str, destination_ids: &StringMap) -> Value {
    let mut categories = StringMap::new();
    if !category.is_empty() {
        categories.add(category);
    }
    let mut directions = StringMap::new();
    if !direction.is_empty() {
        directions.add(direction);
    }
    json!({
        "Categories": categories,
        "Directions": directions,
        "DestinationIDs": destination_ids,
    })
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct AccountSummary {
    pub tenant: String,
    #[serde(rename = "ID")]
    pub id: String,
    pub balance_summaries: Vec<BalanceSummary>,
    pub allow_negative: bool,
    pub disabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::trigger::{TRIGGER_MAX_BALANCE_COUNTER, TRIGGER_MAX_EVENT_COUNTER};
    use crate::utils::consts::VOICE;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn counter_trigger(id: &str, kind: &str, filter: &str) -> ActionTrigger {
        ActionTrigger {
            unique_id: id.into(),
            threshold_type: kind.into(),
            tor: MONETARY.into(),
            filter: filter.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_balance_created_once() {
        let mut acc = Account::new("test", "dan");
        acc.default_money_balance().value = dec!(5);
        acc.default_money_balance().value += dec!(1);
        assert_eq!(acc.balances(MONETARY).len(), 1);
        assert_eq!(acc.balances(MONETARY)[0].value, dec!(6));
        assert!(acc.balances(MONETARY)[0].is_default());
        assert_eq!(acc.full_id(), "test:dan");
    }

    #[test]
    fn test_clean_expired() {
        let now = Utc::now();
        let mut acc = Account::new("test", "dan");
        acc.balance_map.insert(
            VOICE.into(),
            vec![
                Balance { id: "old".into(), expiration_date: now - Duration::hours(1), ..Default::default() },
                Balance { id: "new".into(), ..Default::default() },
            ],
        );
        acc.clean_expired(now);
        assert_eq!(acc.balances(VOICE).len(), 1);
        assert_eq!(acc.balances(VOICE)[0].id, "new");
    }

    #[test]
    fn test_init_counters_preserves_values() {
        let mut acc = Account::new("test", "dan");
        let triggers = vec![
            counter_trigger("t1", TRIGGER_MAX_EVENT_COUNTER, r#"{"DestinationIDs":{"$has":["NAT"]}}"#),
            counter_trigger("t2", TRIGGER_MAX_BALANCE_COUNTER, ""),
        ];
        acc.init_counters(&triggers);
        assert_eq!(acc.unit_counters[MONETARY].len(), 2);

        let view = counter_event_view("call", "*out", &StringMap::from_items(["NAT"]));
        acc.add_units(dec!(3), MONETARY, Some(&view), None).unwrap();
        acc.add_units(dec!(2), MONETARY, None, Some(&Balance::default())).unwrap();
        acc.init_counters(&triggers);
        let list = &acc.unit_counters[MONETARY];
        let event = list.iter().find(|uc| uc.counter_type == COUNTER_EVENT).unwrap();
        let balance = list.iter().find(|uc| uc.counter_type == COUNTER_BALANCE).unwrap();
        assert_eq!(event.counters[0].value, dec!(3));
        assert_eq!(balance.counters[0].value, dec!(2));

        acc.reset_counters(None, None).unwrap();
        assert_eq!(acc.unit_counters[MONETARY][0].counters[0].value, dec!(0));
    }

    #[test]
    fn test_init_trigger_records_keeps_state() {
        let mut acc = Account::new("test", "dan");
        let triggers = vec![counter_trigger("t1", TRIGGER_MAX_EVENT_COUNTER, "")];
        acc.init_trigger_records(&triggers);
        acc.trigger_records.get_mut("t1").unwrap().executed = true;
        acc.init_trigger_records(&triggers);
        assert!(acc.trigger_records["t1"].executed);
        acc.init_trigger_records(&[]);
        assert!(acc.trigger_records.is_empty());
    }

    #[test]
    fn test_match_action_filter_sees_type() {
        let mut acc = Account::new("test", "dan");
        acc.balance_map.insert(
            MONETARY.into(),
            vec![Balance { value: dec!(10), ..Default::default() }],
        );
        assert!(acc.match_action_filter(r#"{"Type":"*monetary","Value":{"$gte":5}}"#).unwrap());
        assert!(!acc.match_action_filter(r#"{"Type":"*voice"}"#).unwrap());
    }

    #[test]
    fn test_serialization_is_canonical() {
        let mut acc = Account::new("test", "dan");
        acc.balance_map.insert(
            MONETARY.into(),
            vec![Balance { uuid: "u".into(), value: dec!(1.5), ..Default::default() }],
        );
        let first = serde_json::to_string(&acc).unwrap();
        let back: Account = serde_json::from_str(&first).unwrap();
        assert_eq!(first, serde_json::to_string(&back).unwrap());
    }
}
