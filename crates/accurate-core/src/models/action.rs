//! Actions, action groups and action plans

use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::balance::{Balance, ValueFactor};
use super::rating::RITiming;
use crate::error::AppError;
use crate::query::Query;
use crate::utils::consts::{ASAP, META_ANY};
use crate::AppResult;

pub const LOG: &str = "*log";
pub const RESET_TRIGGERS: &str = "*reset_triggers";
pub const SET_RECURRENT: &str = "*set_recurrent";
pub const UNSET_RECURRENT: &str = "*unset_recurrent";
pub const ALLOW_NEGATIVE: &str = "*allow_negative";
pub const DENY_NEGATIVE: &str = "*deny_negative";
pub const RESET_ACCOUNT: &str = "*reset_account";
pub const REMOVE_ACCOUNT: &str = "*remove_account";
pub const SET_BALANCE: &str = "*set_balance";
pub const REMOVE_BALANCE: &str = "*remove_balance";
pub const TOPUP_RESET: &str = "*topup_reset";
pub const TOPUP: &str = "*topup";
pub const DEBIT_RESET: &str = "*debit_reset";
pub const DEBIT: &str = "*debit";
pub const RESET_COUNTERS: &str = "*reset_counters";
pub const ENABLE_ACCOUNT: &str = "*enable_account";
pub const DISABLE_ACCOUNT: &str = "*disable_account";
pub const CALL_URL: &str = "*call_url";
pub const CALL_URL_ASYNC: &str = "*call_url_async";
pub const MAIL_ASYNC: &str = "*mail_async";
pub const CDRLOG: &str = "*cdrlog";
pub const SET_DDESTINATIONS: &str = "*set_ddestinations";
pub const TRANSFER_MONETARY_DEFAULT: &str = "*transfer_monetary_default";
pub const CGR_RPC: &str = "*cgr_rpc";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Action {
    pub action_type: String,
    /// Balance type the action works on
    #[serde(rename = "TOR")]
    pub tor: String,
    /// JSON parameters, `{"Balance": {...}}` for balance actions
    pub params: String,
    /// Query over the account balances; the action is skipped when none match
    pub exec_filter: String,
    /// Query selecting the balances the action touches
    #[serde(rename = "Filter1", alias = "Filter")]
    pub filter: String,
    pub weight: f64,
}

impl Action {
    pub fn query(&self) -> AppResult<Query> {
        Query::parse(&self.filter)
    }

    fn params_doc(&self) -> AppResult<Map<String, Value>> {
        if self.params.trim().is_empty() {
            return Ok(Map::new());
        }
        serde_json::from_str(&self.params).map_err(|e| AppError::ParserError(e.to_string()))
    }

    /// The `Balance` object of the parameters, if any
    pub fn balance_params(&self) -> AppResult<Option<Map<String, Value>>> {
        match self.params_doc()?.remove("Balance") {
            Some(Value::Object(m)) => Ok(Some(m)),
            Some(Value::Null) | None => Ok(None),
            Some(_) => Err(AppError::ParserError("Balance must be an object".into())),
        }
    }

    /// Balance described by the parameters
    pub fn new_balance(&self) -> AppResult<Balance> {
        let mut balance = Balance::default();
        self.merge_balance(&mut balance)?;
        Ok(balance)
    }

    /// Writes the fields present in the parameters over `target`
    ///
    /// The UUID of `target` is never replaced.
    pub fn merge_balance(&self, target: &mut Balance) -> AppResult<()> {
        let Some(fields) = self.balance_params()? else {
            return Ok(());
        };
        let mut current = serde_json::to_value(&*target)?;
        if let Value::Object(doc) = &mut current {
            for (k, v) in fields {
                if k == "UUID" {
                    continue;
                }
                doc.insert(k, v);
            }
        }
        let precision = target.precision;
        let dirty = target.dirty;
        *target = serde_json::from_value(current)?;
        target.precision = precision;
        target.dirty = dirty;
        Ok(())
    }

    /// `ValueFactor` parameter used when a debit creates a balance
    pub fn value_factor(&self) -> AppResult<Option<ValueFactor>> {
        match self.params_doc()?.remove("ValueFactor") {
            Some(v) => Ok(Some(serde_json::from_value(v)?)),
            None => Ok(None),
        }
    }

    /// Any other parameter, as raw JSON
    pub fn param(&self, key: &str) -> AppResult<Option<Value>> {
        Ok(self.params_doc()?.remove(key))
    }
}

/// Higher weights first
pub fn sort_actions(actions: &mut [Action]) {
    actions.sort_by(|a, b| {
        b.weight
            .partial_cmp(&a.weight)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ActionGroup {
    pub tenant: String,
    pub name: String,
    pub actions: Vec<Action>,
}

impl ActionGroup {
    pub fn sorted_actions(&self) -> Vec<Action> {
        let mut actions = self.actions.clone();
        sort_actions(&mut actions);
        actions
    }
}

/// One scheduled entry of an action plan
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ActionTiming {
    #[serde(rename = "UUID")]
    pub uuid: String,
    pub timing: Option<RITiming>,
    #[serde(rename = "ActionsID")]
    pub actions_id: String,
    pub weight: f64,
}

impl ActionTiming {
    pub fn is_asap(&self) -> bool {
        self.timing.as_ref().is_some_and(|t| t.start_time == ASAP)
    }

    /// First instant after `now` the timing allows; `*asap` answers `now`
    pub fn next_start_time(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let timing = self.timing.as_ref()?;
        if timing.start_time == ASAP {
            return Some(now);
        }
        next_fire(timing, now)
    }
}

/// Walks forward day by day, bounded to a few years, for the first match
fn next_fire(timing: &RITiming, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let start = if timing.start_time.is_empty() || timing.start_time == META_ANY {
        NaiveTime::MIN
    } else {
        NaiveTime::parse_from_str(&timing.start_time, "%H:%M:%S").ok()?
    };
    let mut months = timing.months.clone();
    let mut month_days = timing.month_days.clone();
    if !timing.years.is_empty() && months.is_empty() {
        months.push(1);
    }
    if !months.is_empty() && month_days.is_empty() {
        month_days.push(1);
    }
    let mut day = now.date_naive();
    for _ in 0..(366 * 5) {
        let matches = (timing.years.is_empty() || timing.years.contains(&day.year()))
            && (months.is_empty() || months.contains(&day.month()))
            && (month_days.is_empty() || month_days.contains(&day.day()))
            && (timing.week_days.is_empty()
                || timing
                    .week_days
                    .contains(&day.weekday().num_days_from_sunday()));
        if matches {
            let candidate = Utc.from_utc_datetime(&day.and_time(start));
            if candidate > now {
                return Some(candidate);
            }
        }
        day = day.checked_add_signed(Duration::days(1))?;
    }
    None
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ActionPlan {
    pub tenant: String,
    pub name: String,
    pub action_timings: Vec<ActionTiming>,
}

/// Account attached to an action plan
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ActionPlanBinding {
    pub tenant: String,
    pub account: String,
    pub action_plan: String,
}

/// Queued one-off execution of an action group for an account
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Task {
    #[serde(rename = "UUID")]
    pub uuid: String,
    pub tenant: String,
    #[serde(rename = "AccountID")]
    pub account_id: String,
    #[serde(rename = "ActionsID")]
    pub actions_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn t(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_merge_balance_keeps_uuid() {
        let mut b = Balance {
            uuid: "u1".into(),
            id: "bonus".into(),
            value: dec!(3),
            weight: 10.0,
            ..Default::default()
        };
        let a = Action {
            params: r#"{"Balance":{"UUID":"other","Value":7,"Weight":20,"DestinationIDs":"NAT"}}"#.into(),
            ..Default::default()
        };
        a.merge_balance(&mut b).unwrap();
        assert_eq!(b.uuid, "u1");
        assert_eq!(b.id, "bonus");
        assert_eq!(b.value, dec!(7));
        assert_eq!(b.weight, 20.0);
        assert!(b.destination_ids.has("NAT"));
    }

    #[test]
    fn test_new_balance_without_params() {
        let a = Action::default();
        assert_eq!(a.new_balance().unwrap().value, dec!(0));
        assert!(a.value_factor().unwrap().is_none());
    }

    #[test]
    fn test_sort_actions_by_weight() {
        let mut list = vec![
            Action { action_type: TOPUP.into(), weight: 10.0, ..Default::default() },
            Action { action_type: LOG.into(), weight: 20.0, ..Default::default() },
        ];
        sort_actions(&mut list);
        assert_eq!(list[0].action_type, LOG);
    }

    #[test]
    fn test_next_start_monthly() {
        let at = ActionTiming {
            timing: Some(RITiming {
                months: vec![],
                month_days: vec![1],
                start_time: "00:00:00".into(),
                ..Default::default()
            }),
            ..Default::default()
        };
        let next = at.next_start_time(t("2024-03-11T10:00:00Z")).unwrap();
        assert_eq!(next, t("2024-04-01T00:00:00Z"));
    }

    #[test]
    fn test_next_start_asap_and_daily() {
        let now = t("2024-03-11T10:00:00Z");
        let asap = ActionTiming {
            timing: Some(RITiming { start_time: ASAP.into(), ..Default::default() }),
            ..Default::default()
        };
        assert!(asap.is_asap());
        assert_eq!(asap.next_start_time(now), Some(now));
        let daily = ActionTiming {
            timing: Some(RITiming { start_time: "09:00:00".into(), ..Default::default() }),
            ..Default::default()
        };
        assert_eq!(daily.next_start_time(now), Some(t("2024-03-12T09:00:00Z")));
    }
}
