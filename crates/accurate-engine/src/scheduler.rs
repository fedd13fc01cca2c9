//! Action plan scheduler
//!
//! Runs as one background task. `*asap` timings are turned into queued tasks
//! (one per bound account) and dropped from their plan; the remaining
//! timings are sorted by next fire time and the task sleeps until the
//! earliest, a reload request or shutdown.

use std::sync::Arc;

use accurate_core::models::{ActionPlan, ActionTiming, Task};
use accurate_core::utils::{gen_uuid, split_account_id};
use accurate_core::AppResult;
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use crate::Engine;

/// A timing due at `at`
#[derive(Debug, Clone)]
pub struct ScheduledTiming {
    pub at: DateTime<Utc>,
    pub tenant: String,
    pub plan: String,
    pub timing: ActionTiming,
}

impl Engine {
    /// Wakes the scheduler so it reloads the action plans
    pub fn reload_scheduler(&self) {
        self.scheduler_reload.notify_one();
    }

    /// Converts the `*asap` timings of `plan` into tasks and stores the plan
    /// without them, removing it once empty
    async fn enqueue_asap(&self, mut plan: ActionPlan) -> AppResult<usize> {
        let (asap, rest): (Vec<_>, Vec<_>) = plan.action_timings.drain(..).partition(ActionTiming::is_asap);
        if asap.is_empty() {
            plan.action_timings = rest;
            return Ok(0);
        }
        let accounts = self.accounting.accounts_for_plan(&plan.tenant, &plan.name).await?;
        let mut queued = 0;
        for at in &asap {
            for account in &accounts {
                self.accounting
                    .push_task(&Task {
                        uuid: gen_uuid(),
                        tenant: plan.tenant.clone(),
                        account_id: format!("{}:{}", plan.tenant, account),
                        actions_id: at.actions_id.clone(),
                    })
                    .await?;
                queued += 1;
            }
        }
        plan.action_timings = rest;
        if plan.action_timings.is_empty() {
            self.tariff.remove_action_plan(&plan.tenant, &plan.name, None).await?;
        } else {
            self.tariff.set_action_plan(&plan, None).await?;
        }
        debug!(plan = %plan.name, queued, "asap timings queued");
        Ok(queued)
    }

    /// Timings with a fire time after `now`, earliest first, heaviest first
    /// on ties. `*asap` timings are moved to the task queue on the way.
    pub async fn scheduled_timings(&self, now: DateTime<Utc>) -> AppResult<Vec<ScheduledTiming>> {
        let mut out = Vec::new();
        for plan in self.tariff.action_plans().await? {
            if plan.action_timings.iter().any(ActionTiming::is_asap) {
                self.enqueue_asap(plan.clone()).await?;
            }
            for timing in plan.action_timings.into_iter().filter(|t| !t.is_asap()) {
                match timing.next_start_time(now) {
                    Some(at) => out.push(ScheduledTiming {
                        at,
                        tenant: plan.tenant.clone(),
                        plan: plan.name.clone(),
                        timing,
                    }),
                    None => debug!(plan = %plan.name, uuid = %timing.uuid, "timing never fires again"),
                }
            }
        }
        out.sort_by(|a, b| {
            a.at.cmp(&b.at)
                .then_with(|| b.timing.weight.partial_cmp(&a.timing.weight).unwrap_or(std::cmp::Ordering::Equal))
        });
        Ok(out)
    }

    /// Drains the task queue, returning how many tasks ran
    pub async fn execute_pending_tasks(&self) -> usize {
        let mut done = 0;
        loop {
            let task = match self.accounting.pop_task().await {
                Ok(Some(task)) => task,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "could not pop task");
                    break;
                }
            };
            let (tenant, account) = split_account_id(&task.account_id);
            let tenant = if tenant.is_empty() { task.tenant.as_str() } else { tenant };
            if let Err(e) = self.execute_account_actions(tenant, account, &task.actions_id).await {
                warn!(task = %task.uuid, account = %task.account_id, actions = %task.actions_id, error = %e, "task failed");
            }
            done += 1;
        }
        done
    }

    /// Runs a timing for every account bound to its plan, or once without an
    /// account when none is bound
    #[instrument(skip(self, st), fields(plan = %st.plan, actions = %st.timing.actions_id))]
    pub async fn fire_timing(&self, st: &ScheduledTiming) {
        let accounts = match self.accounting.accounts_for_plan(&st.tenant, &st.plan).await {
            Ok(accounts) => accounts,
            Err(e) => {
                warn!(error = %e, "could not load plan bindings");
                return;
            }
        };
        if accounts.is_empty() {
            if let Err(e) = self.execute_account_actions(&st.tenant, "", &st.timing.actions_id).await {
                warn!(error = %e, "account-less timing failed");
            }
            return;
        }
        for account in &accounts {
            if let Err(e) = self.execute_account_actions(&st.tenant, account, &st.timing.actions_id).await {
                warn!(account = %account, error = %e, "scheduled actions failed");
            }
        }
    }

    /// Scheduler loop; returns on shutdown
    pub async fn run_scheduler(self: Arc<Self>) {
        info!("scheduler started");
        let shutdown = self.shutdown_signal();
        tokio::pin!(shutdown);
        loop {
            let now = Utc::now();
            let queue = match self.scheduled_timings(now).await {
                Ok(q) => q,
                Err(e) => {
                    warn!(error = %e, "could not load action plans");
                    Vec::new()
                }
            };
            let ran = self.execute_pending_tasks().await;
            if ran > 0 {
                info!(tasks = ran, "queued tasks executed");
            }
            let next = queue.first().map(|st| st.at);
            let sleep = match next {
                Some(at) => (at - now).to_std().unwrap_or_default(),
                None => std::time::Duration::from_secs(3600),
            };
            debug!(timings = queue.len(), next = ?next, "scheduler queue loaded");
            tokio::select! {
                _ = &mut shutdown => break,
                _ = self.scheduler_reload.notified() => {
                    debug!("scheduler reload requested");
                    continue;
                }
                _ = tokio::time::sleep(sleep) => {}
            }
            let due = Utc::now();
            for st in queue.iter().filter(|st| st.at <= due) {
                self.fire_timing(st).await;
            }
        }
        info!("scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::*;
    use accurate_core::models::action::TOPUP;
    use accurate_core::models::{Action, ActionGroup, ActionPlanBinding, RITiming};
    use accurate_core::utils::consts::{ASAP, MONETARY};
    use accurate_db::CacheMode;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    async fn topup_group(engine: &Engine) {
        let ag = ActionGroup {
            tenant: TENANT.into(),
            name: "AG_TOPUP".into(),
            actions: vec![Action {
                action_type: TOPUP.into(),
                tor: MONETARY.into(),
                params: r#"{"Balance":{"ID":"M","Value":2}}"#.into(),
                filter: r#"{"ID":"M"}"#.into(),
                ..Default::default()
            }],
        };
        engine.tariff.set_action_group(&ag, None).await.unwrap();
    }

    fn timing(start_time: &str, month_days: Vec<u32>) -> ActionTiming {
        ActionTiming {
            uuid: gen_uuid(),
            timing: Some(RITiming {
                start_time: start_time.into(),
                month_days,
                ..Default::default()
            }),
            actions_id: "AG_TOPUP".into(),
            weight: 10.0,
        }
    }

    async fn bind(engine: &Engine, plan: &ActionPlan, account: &str) {
        engine.tariff.set_action_plan(plan, None).await.unwrap();
        engine
            .accounting
            .bind_action_plan(&ActionPlanBinding {
                tenant: TENANT.into(),
                account: account.into(),
                action_plan: plan.name.clone(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_asap_becomes_task() {
        let engine = engine_with_tariffs().await;
        topup_group(&engine).await;
        let plan = ActionPlan {
            tenant: TENANT.into(),
            name: "AP_NOW".into(),
            action_timings: vec![timing(ASAP, vec![])],
        };
        bind(&engine, &plan, "dan").await;

        let queue = engine.scheduled_timings(Utc::now()).await.unwrap();
        assert!(queue.is_empty());
        assert_eq!(engine.accounting.task_count().await.unwrap(), 1);
        assert!(engine.tariff.get_action_plan(TENANT, "AP_NOW", CacheMode::Live).await.is_err());

        assert_eq!(engine.execute_pending_tasks().await, 1);
        let acc = engine.accounting.get_account(TENANT, "dan").await.unwrap();
        assert_eq!(acc.balances(MONETARY)[0].value, dec!(2));
    }

    #[tokio::test]
    async fn test_monthly_timing_is_queued() {
        let engine = engine_with_tariffs().await;
        let plan = ActionPlan {
            tenant: TENANT.into(),
            name: "AP_MONTHLY".into(),
            action_timings: vec![timing("00:00:00", vec![1])],
        };
        engine.tariff.set_action_plan(&plan, None).await.unwrap();
        let now = Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).unwrap();
        let queue = engine.scheduled_timings(now).await.unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].at, Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap());
        assert_eq!(queue[0].plan, "AP_MONTHLY");
    }

    #[tokio::test]
    async fn test_fire_timing_runs_for_bound_accounts() {
        let engine = engine_with_tariffs().await;
        topup_group(&engine).await;
        let plan = ActionPlan {
            tenant: TENANT.into(),
            name: "AP_DAILY".into(),
            action_timings: vec![timing("08:00:00", vec![])],
        };
        bind(&engine, &plan, "a1").await;
        bind(&engine, &plan, "a2").await;
        let st = ScheduledTiming {
            at: Utc::now(),
            tenant: TENANT.into(),
            plan: "AP_DAILY".into(),
            timing: plan.action_timings[0].clone(),
        };
        engine.fire_timing(&st).await;
        engine.fire_timing(&st).await;
        for name in ["a1", "a2"] {
            let acc = engine.accounting.get_account(TENANT, name).await.unwrap();
            assert_eq!(acc.balances(MONETARY)[0].value, dec!(4));
        }
    }

    #[tokio::test]
    async fn test_scheduler_stops_on_shutdown() {
        let engine = engine_with_tariffs().await;
        let handle = tokio::spawn(engine.clone().run_scheduler());
        engine.reload_scheduler();
        engine.shutdown();
        tokio::time::timeout(std::time::Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
