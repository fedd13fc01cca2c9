//! Action triggers watching account balances and counters
//!
//! Triggers are evaluated after every balance mutation. A non recurrent
//! trigger fires once and stays quiet until its record is reset.

use accurate_core::models::trigger::{sort_triggers, TRIGGER_BALANCE_EXPIRED, TRIGGER_MAX_BALANCE, TRIGGER_MIN_BALANCE};
use accurate_core::models::{Account, Action, ActionTrigger, ActionTriggerRecord};
use accurate_core::query::Query;
use accurate_core::{AppError, AppResult};
use accurate_db::CacheMode;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tracing::{debug, info, warn};

use crate::actions::{ActionTarget, TriggeredQueue};
use crate::Engine;

/// Query of the action that caused the evaluation; a broken filter matches nothing
fn action_filter(fired_by: Option<&Action>) -> Option<Option<Query>> {
    let a = fired_by?;
    match a.query() {
        Ok(q) => Some(Some(q)),
        Err(e) => {
            warn!(filter = %a.filter, error = %e, "action filter does not parse");
            Some(None)
        }
    }
}

fn passes<T: serde::Serialize>(filter: &Option<Option<Query>>, target: &T) -> bool {
    match filter {
        None => true,
        Some(None) => false,
        Some(Some(q)) => q.matches(target).unwrap_or_else(|e| {
            warn!(error = %e, "action filter errored");
            false
        }),
    }
}

/// Whether `at` is met by the current state of `acc`
fn trigger_met(acc: &Account, at: &ActionTrigger, now: DateTime<Utc>) -> AppResult<bool> {
    if at.is_counter() {
        let Some(list) = acc.unit_counters.get(&at.tor) else {
            return Ok(false);
        };
        return Ok(list
            .iter()
            .filter(|uc| at.watches_counter(&uc.counter_type))
            .flat_map(|uc| uc.counters.iter())
            .any(|c| c.filter == at.filter && at.crossed(c.value)));
    }
    let query = at.query()?;
    for b in acc.balances(&at.tor) {
        if !b.dirty && at.threshold_type != TRIGGER_BALANCE_EXPIRED {
            continue;
        }
        let hit = match at.threshold_type.as_str() {
            TRIGGER_MIN_BALANCE | TRIGGER_MAX_BALANCE => at.crossed(b.value),
            TRIGGER_BALANCE_EXPIRED => b.is_expired_at(now),
            _ => false,
        };
        if hit && query.matches(b)? {
            return Ok(true);
        }
    }
    Ok(false)
}

impl Engine {
    /// Triggers of the account's trigger groups, heaviest first
    pub(crate) async fn account_triggers(&self, acc: &Account) -> Vec<ActionTrigger> {
        let mut triggers = Vec::new();
        for group in acc.trigger_ids.keys() {
            match self
                .tariff
                .get_action_trigger_group(&acc.tenant, group, CacheMode::Cached)
                .await
            {
                Ok(atg) => triggers.extend(atg.action_triggers),
                Err(e) => warn!(account = %acc.full_id(), group = %group, error = %e, "could not get trigger group"),
            }
        }
        sort_triggers(&mut triggers);
        triggers
    }

    /// Rebuilds trigger records and counters after the trigger set changed
    pub(crate) async fn init_account_triggers(&self, acc: &mut Account) {
        let triggers = self.account_triggers(acc).await;
        acc.init_trigger_records(&triggers);
        acc.init_counters(&triggers);
    }

    /// Runs the triggers of `acc` whose threshold is met
    ///
    /// With `fired_by` only the triggers matching that action's filter are
    /// considered. Failures are logged and swallowed. Returns whether an
    /// action removed the account.
    pub(crate) fn execute_action_triggers<'a>(
        &'a self,
        acc: &'a mut Account,
        fired_by: Option<&'a Action>,
    ) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            if acc.executing_triggers {
                return false;
            }
            acc.executing_triggers = true;
            let triggers = self.account_triggers(acc).await;
            acc.init_trigger_records(&triggers);
            let filter = action_filter(fired_by);
            let now = Utc::now();
            let mut removed = false;
            for at in &triggers {
                if at.is_expired(now) || !at.is_active(now) {
                    continue;
                }
                if acc.trigger_records.get(&at.unique_id).is_some_and(|r| r.executed) {
                    continue;
                }
                if !passes(&filter, at) {
                    continue;
                }
                match trigger_met(acc, at, now) {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(e) => {
                        warn!(trigger = %at.unique_id, error = %e, "trigger filter errored");
                        continue;
                    }
                }
                if self.fire_account_trigger(acc, at, now).await {
                    removed = true;
                    break;
                }
            }
            acc.clean_expired(now);
            acc.clear_dirty();
            acc.executing_triggers = false;
            removed
        })
    }

    /// Executes the action group of `at` for `acc`, returning whether the account was removed
    async fn fire_account_trigger(&self, acc: &mut Account, at: &ActionTrigger, now: DateTime<Utc>) -> bool {
        let rec = acc
            .trigger_records
            .entry(at.unique_id.clone())
            .or_insert_with(|| at.new_record());
        if rec.sleeping(at, now) {
            return false;
        }
        rec.last_execution_time = now;
        if acc.disabled {
            warn!(account = %acc.full_id(), trigger = %at.unique_id, "account is disabled, trigger not executed");
            return false;
        }
        let group = match self
            .tariff
            .get_action_group(&acc.tenant, &at.actions_id, CacheMode::Cached)
            .await
        {
            Ok(g) => g,
            Err(e) => {
                warn!(tenant = %acc.tenant, actions = %at.actions_id, error = %e, "could not get actions");
                return false;
            }
        };
        if let Some(rec) = acc.trigger_records.get_mut(&at.unique_id) {
            rec.executed = true;
        }
        info!(account = %acc.full_id(), trigger = %at.unique_id, actions = %at.actions_id, "action trigger fired");
        let outcome = self
            .execute_actions(&mut ActionTarget::account(acc), &group, Some(at))
            .await;
        if let Err(e) = &outcome {
            warn!(account = %acc.full_id(), trigger = %at.unique_id, error = %e, "trigger actions failed");
        }
        if let Some(rec) = acc.trigger_records.get_mut(&at.unique_id) {
            if at.recurrent || rec.recurrent {
                rec.executed = false;
            }
        }
        outcome.map(|o| o.account_removed).unwrap_or(false)
    }

    /// Rearms the triggers whose record passes the action filter, then evaluates them
    pub(crate) async fn reset_triggers(&self, acc: &mut Account, fired_by: Option<&Action>) -> bool {
        let filter = action_filter(fired_by);
        for rec in acc.trigger_records.values_mut() {
            if passes(&filter, &*rec) {
                rec.executed = false;
            }
        }
        self.execute_action_triggers(acc, fired_by).await
    }

    /// Marks the matching trigger records recurrent or one-shot
    pub(crate) fn set_recurrent(&self, acc: &mut Account, fired_by: Option<&Action>, recurrent: bool) {
        let filter = action_filter(fired_by);
        for rec in acc.trigger_records.values_mut() {
            if passes(&filter, &*rec) {
                rec.recurrent = recurrent;
            }
        }
    }

    /// Fires a stats queue trigger whose threshold was crossed
    ///
    /// `record` belongs to the queue; the caller persists it.
    pub(crate) async fn execute_queue_trigger(
        &self,
        queue: &TriggeredQueue,
        record: &mut ActionTriggerRecord,
    ) -> AppResult<()> {
        let at = &queue.trigger;
        let now = Utc::now();
        if record.sleeping(at, now) {
            debug!(queue = %queue.name, trigger = %at.unique_id, "queue trigger sleeping");
            return Ok(());
        }
        record.last_execution_time = now;
        let group = self
            .tariff
            .get_action_group(&queue.tenant, &at.actions_id, CacheMode::Cached)
            .await
            .map_err(|e| match e {
                AppError::NotFound => AppError::ServerError(format!("actions {} not found", at.actions_id)),
                other => other,
            })?;
        record.executed = true;
        info!(queue = %queue.name, trigger = %at.unique_id, actions = %at.actions_id, "queue trigger fired");
        let result = self
            .execute_actions(&mut ActionTarget::queue(queue), &group, Some(at))
            .await;
        if at.recurrent || record.recurrent {
            record.executed = false;
        }
        result.map(|_| ())
    }
}
