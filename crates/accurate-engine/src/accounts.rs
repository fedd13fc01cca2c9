//! Account debits, authorizations and refunds
//!
//! Every operation runs under the guardian lock of the account and the
//! members of its shared groups.

use std::collections::HashMap;

use accurate_core::models::account::counter_event_view;
use accurate_core::models::{Account, CallCost, CallDescriptor, Increment};
use accurate_core::utils::consts::MONETARY;
use accurate_core::utils::time::nanos;
use accurate_core::utils::{split_account_id, StringMap};
use accurate_core::{AppError, AppResult};
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::Engine;

const MAX_DEBIT_CACHE_PREFIX: &str = "MAX_DEBIT_";

impl Engine {
    /// Account named by the descriptor, refusing disabled ones
    async fn debit_account(&self, cd: &CallDescriptor) -> AppResult<Account> {
        let acc = self.accounting.get_account(&cd.tenant, cd.account_name()).await?;
        if acc.disabled {
            return Err(AppError::AccountDisabled);
        }
        Ok(acc)
    }

    /// Debits `acc` for `cd` and, unless `dry_run`, runs its triggers and
    /// stores it. Zero length requests leave the account untouched.
    async fn debit_on_account(
        &self,
        mut acc: Account,
        cd: &mut CallDescriptor,
        dry_run: bool,
        go_negative: bool,
    ) -> AppResult<CallCost> {
        if cd.duration() <= Duration::zero() {
            return Ok(cd.create_call_cost());
        }
        if !dry_run {
            acc.clean_expired(Utc::now());
        }
        let mut session = self.open_debit_session(acc, cd, !dry_run, dry_run).await?;
        let mut cc = self.debit_balances(&mut session, cd, go_negative).await?;
        let mut acc = session.into_main();
        if !dry_run {
            if !self.execute_action_triggers(&mut acc, None).await {
                self.accounting.set_account(&acc).await?;
            }
        }
        cc.compress();
        Ok(cc)
    }

    /// Longest part of `cd` the account pays without going into debt,
    /// `None` when the account may go negative
    async fn max_session_duration(&self, acc: &Account, cd: &CallDescriptor) -> AppResult<Option<Duration>> {
        if acc.allow_negative {
            return Ok(None);
        }
        let initial = cd.duration();
        let mut trial = cd.clone();
        if trial.duration_index < initial {
            trial.duration_index = initial;
        }
        let mut session = self.open_debit_session(acc.clone(), &trial, false, true).await?;
        let mut cc = self.debit_balances(&mut session, &mut trial, false).await?;
        if cc.negative_connect_fee {
            return Ok(Some(Duration::zero()));
        }
        cc.decompress();

        let rate_cap = (cd.max_rate > Decimal::ZERO && cd.max_rate_unit > Duration::zero())
            .then(|| cd.max_rate / accurate_core::models::rating::duration_secs(cd.max_rate_unit));
        let mut total = Duration::zero();
        for ts in &cc.timespans {
            if let (Some(cap), Some(ri)) = (rate_cap, ts.rate_interval.as_ref()) {
                if let Some((value, _, unit)) = ri.rate_parameters(ts.group_start()) {
                    if value / accurate_core::models::rating::duration_secs(unit) > cap {
                        debug!(rate = %value, "rate above the caller's maximum");
                        return Ok(Some(initial.min(total)));
                    }
                }
            }
            let Some(inc) = ts.increments.comp_increment.as_ref() else {
                continue;
            };
            for _ in 0..inc.compress_factor {
                let in_debt = inc
                    .balance_info
                    .monetary
                    .as_ref()
                    .is_some_and(|m| m.value < Decimal::ZERO);
                if in_debt {
                    return Ok(Some(initial.min(total)));
                }
                total = total + inc.duration;
                if total >= initial {
                    return Ok(Some(initial));
                }
            }
        }
        Ok(Some(initial.min(total)))
    }

    /// Debits the account for the full descriptor
    #[instrument(skip(self, cd), fields(account = %cd.account_key(), destination = %cd.destination))]
    pub async fn debit(&self, cd: &mut CallDescriptor) -> AppResult<CallCost> {
        self.normalize_descriptor(cd);
        let keys = self.debit_lock_keys(&cd.tenant, cd.account_name()).await?;
        self.guardian
            .guard(&keys, self.lock_timeout(), || async move {
                let acc = self.debit_account(cd).await?;
                let (dry_run, go_negative) = (cd.dry_run, !cd.deny_negative_account);
                self.debit_on_account(acc, cd, dry_run, go_negative).await
            })
            .await
    }

    /// Debits as much of the descriptor as the account can pay
    ///
    /// Replies are remembered per (UniqueID, RunID, DurationIndex) so a
    /// retried request does not debit twice.
    #[instrument(skip(self, cd), fields(account = %cd.account_key(), destination = %cd.destination))]
    pub async fn max_debit(&self, cd: &mut CallDescriptor) -> AppResult<CallCost> {
        self.normalize_descriptor(cd);
        let cache_key = (!cd.unique_id.is_empty()).then(|| {
            format!(
                "{}{}:{}:{}",
                MAX_DEBIT_CACHE_PREFIX,
                cd.unique_id,
                cd.run_id,
                nanos(cd.duration_index)
            )
        });
        if let Some(key) = &cache_key {
            if let Some(replied) = self.responses.get::<CallCost>(key) {
                debug!(key = %key, "max debit served from cache");
                return replied;
            }
        }
        let keys = self.debit_lock_keys(&cd.tenant, cd.account_name()).await?;
        let out = self
            .guardian
            .guard(&keys, self.lock_timeout(), || self.max_debit_locked(cd))
            .await;
        if let Some(key) = &cache_key {
            self.responses.set(key, &out);
        }
        out
    }

    async fn max_debit_locked(&self, cd: &mut CallDescriptor) -> AppResult<CallCost> {
        let acc = self.debit_account(cd).await?;
        let initial = cd.duration();
        let remaining = match self.max_session_duration(&acc, cd).await {
            Ok(r) => r,
            Err(e) if initial > Duration::zero() => return Err(e),
            Err(_) => Some(Duration::zero()),
        };
        if cd.force_duration && !acc.allow_negative && remaining.is_some_and(|r| r < initial) {
            return Err(AppError::InsufficientCredit);
        }
        match remaining {
            Some(r) if r.is_zero() => {
                if initial.is_zero() {
                    return self.get_cost(cd).await;
                }
                return Ok(cd.create_call_cost());
            }
            Some(r) if r < initial => {
                cd.time_end = cd.time_start + r;
                cd.duration_index = cd.duration_index - (initial - r);
            }
            _ => {}
        }
        let (dry_run, go_negative) = (cd.dry_run, !cd.deny_negative_account);
        self.debit_on_account(acc, cd, dry_run, go_negative).await
    }

    /// Duration the account can pay for, `None` when unlimited
    #[instrument(skip(self, cd), fields(account = %cd.account_key()))]
    pub async fn get_max_session_time(&self, cd: &mut CallDescriptor) -> AppResult<Option<Duration>> {
        self.normalize_descriptor(cd);
        let keys = self.debit_lock_keys(&cd.tenant, cd.account_name()).await?;
        self.guardian
            .guard(&keys, self.lock_timeout(), || async move {
                let acc = self.debit_account(cd).await?;
                self.max_session_duration(&acc, cd).await
            })
            .await
    }

    /// Applies `refund` to each increment of `cd` on the account that paid it
    async fn refund_each<F>(&self, cd: &mut CallDescriptor, refund: F) -> AppResult<()>
    where
        F: Fn(&mut Account, &Increment, &Value) -> AppResult<()>,
    {
        self.normalize_descriptor(cd);
        let own = cd.account_key();
        let payer = |inc: &Increment| {
            if inc.balance_info.account_id.is_empty() {
                own.clone()
            } else {
                inc.balance_info.account_id.clone()
            }
        };
        let mut keys: Vec<String> = cd.increments.iter().map(&payer).collect();
        keys.sort();
        keys.dedup();
        if keys.is_empty() {
            return Ok(());
        }
        let names = self
            .tariff
            .destination_names(&cd.tenant, &cd.destination)
            .await
            .unwrap_or_default();
        let event = counter_event_view(&cd.category, &cd.direction, &StringMap::from_items(names));

        let cd = &*cd;
        self.guardian
            .guard(&keys, self.lock_timeout(), || async move {
                let mut accounts: HashMap<String, Account> = HashMap::new();
                for inc in &cd.increments {
                    let id = payer(inc);
                    if !accounts.contains_key(&id) {
                        let (tenant, name) = split_account_id(&id);
                        match self.accounting.get_account_opt(tenant, name).await? {
                            Some(acc) => {
                                accounts.insert(id.clone(), acc);
                            }
                            None => {
                                warn!(account = %id, "could not get the account to be refunded");
                                continue;
                            }
                        }
                    }
                    if let Some(acc) = accounts.get_mut(&id) {
                        refund(acc, inc, &event)?;
                    }
                }
                for acc in accounts.values() {
                    self.accounting.set_account(acc).await?;
                }
                Ok(())
            })
            .await
    }

    /// Gives back what the increments debited, to the very balances that paid
    #[instrument(skip(self, cd), fields(account = %cd.account_key(), increments = cd.increments.len()))]
    pub async fn refund_increments(&self, cd: &mut CallDescriptor) -> AppResult<()> {
        let tor = cd.tor.clone();
        self.refund_each(cd, |acc, inc, event| {
            let times = Decimal::from(inc.compress_factor.max(1));
            if let Some(unit) = inc.balance_info.unit.as_ref().filter(|u| !u.uuid.is_empty()) {
                let unit_tor = if unit.tor.is_empty() { tor.as_str() } else { unit.tor.as_str() };
                let amount = unit.consumed * times;
                let Some(b) = acc.balance_by_uuid_mut(&unit.uuid) else {
                    warn!(balance = %unit.uuid, "refunded balance is gone");
                    return Ok(());
                };
                b.add_value(amount);
                let snapshot = b.clone();
                acc.add_units(-amount, unit_tor, Some(event), Some(&snapshot))?;
            }
            if let Some(money) = inc.balance_info.monetary.as_ref().filter(|m| !m.uuid.is_empty()) {
                let amount = inc.cost * times;
                let Some(b) = acc.balance_by_uuid_mut(&money.uuid) else {
                    warn!(balance = %money.uuid, "refunded balance is gone");
                    return Ok(());
                };
                b.add_value(amount);
                let snapshot = b.clone();
                acc.add_units(-amount, MONETARY, Some(event), Some(&snapshot))?;
            }
            Ok(())
        })
        .await
    }

    /// Charges the rounding difference carried by the increments
    #[instrument(skip(self, cd), fields(account = %cd.account_key()))]
    pub async fn refund_rounding(&self, cd: &mut CallDescriptor) -> AppResult<()> {
        self.refund_each(cd, |acc, inc, event| {
            let Some(money) = inc.balance_info.monetary.as_ref() else {
                return Ok(());
            };
            let amount = inc.cost * Decimal::from(inc.compress_factor.max(1));
            let b = match acc.balance_by_uuid_mut(&money.uuid) {
                Some(b) => b,
                None => acc.default_money_balance(),
            };
            b.subtract_value(amount);
            let snapshot = b.clone();
            acc.add_units(amount, MONETARY, Some(event), Some(&snapshot))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::*;
    use rust_decimal_macros::dec;

    fn increments(cc: &CallCost) -> Vec<Increment> {
        cc.timespans
            .iter()
            .filter_map(|ts| ts.increments.comp_increment.clone())
            .collect()
    }

    #[tokio::test]
    async fn test_debit_money() {
        let engine = engine_with_tariffs().await;
        funded(&engine, "dan", dec!(10)).await;
        let mut cd = descriptor("dan", "0723045326", 60);
        let cc = engine.debit(&mut cd).await.unwrap();
        assert_eq!(cc.cost, dec!(0.6));
        assert_eq!(money(&engine, "dan").await, dec!(9.4));
    }

    #[tokio::test]
    async fn test_debit_refused() {
        let engine = engine_with_tariffs().await;
        let mut cd = descriptor("ghost", "0723045326", 60);
        assert!(matches!(engine.debit(&mut cd).await, Err(AppError::AccountNotFound)));

        let mut acc = account("off");
        acc.disabled = true;
        engine.accounting.set_account(&acc).await.unwrap();
        let mut cd = descriptor("off", "0723045326", 60);
        assert!(matches!(engine.debit(&mut cd).await, Err(AppError::AccountDisabled)));
    }

    #[tokio::test]
    async fn test_zero_duration_debit_is_empty() {
        let engine = engine_with_tariffs().await;
        funded(&engine, "dan", dec!(10)).await;
        let mut cd = descriptor("dan", "0723045326", 0);
        let cc = engine.debit(&mut cd).await.unwrap();
        assert!(cc.timespans.is_empty());
        assert_eq!(cc.cost, dec!(0));
        assert_eq!(money(&engine, "dan").await, dec!(10));
    }

    #[tokio::test]
    async fn test_max_debit_caps_duration() {
        let engine = engine_with_tariffs().await;
        funded(&engine, "dan", dec!(0.3)).await;
        let mut cd = descriptor("dan", "0723045326", 60);
        let cc = engine.max_debit(&mut cd).await.unwrap();
        assert_eq!(cc.rated_usage, 30.0);
        assert_eq!(cc.cost, dec!(0.3));
        assert_eq!(money(&engine, "dan").await, dec!(0));
    }

    #[tokio::test]
    async fn test_max_debit_replays_cached_reply() {
        let engine = engine_with_tariffs().await;
        funded(&engine, "dan", dec!(10)).await;
        let mut first = descriptor("dan", "0723045326", 60);
        first.unique_id = "sess1".into();
        first.run_id = "*default".into();
        let mut retry = first.clone();
        let a = engine.max_debit(&mut first).await.unwrap();
        let b = engine.max_debit(&mut retry).await.unwrap();
        assert_eq!(a.cost, b.cost);
        assert_eq!(money(&engine, "dan").await, dec!(9.4));
    }

    #[tokio::test]
    async fn test_force_duration_without_credit() {
        let engine = engine_with_tariffs().await;
        funded(&engine, "dan", dec!(0.3)).await;
        let mut cd = descriptor("dan", "0723045326", 60);
        cd.force_duration = true;
        assert!(matches!(engine.max_debit(&mut cd).await, Err(AppError::InsufficientCredit)));
        assert_eq!(money(&engine, "dan").await, dec!(0.3));
    }

    #[tokio::test]
    async fn test_max_session_time() {
        let engine = engine_with_tariffs().await;
        funded(&engine, "dan", dec!(0.3)).await;
        let mut cd = descriptor("dan", "0723045326", 60);
        let max = engine.get_max_session_time(&mut cd).await.unwrap();
        assert_eq!(max, Some(Duration::seconds(30)));

        let mut acc = account("rich");
        acc.allow_negative = true;
        engine.accounting.set_account(&acc).await.unwrap();
        let mut cd = descriptor("rich", "0723045326", 60);
        assert_eq!(engine.get_max_session_time(&mut cd).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_refund_restores_balances() {
        let engine = engine_with_tariffs().await;
        let mut acc = account("dan");
        acc.balance_map.insert("*voice".into(), vec![balance("NAT_MIN", dec!(10), &["NAT"], 0.0)]);
        acc.balance_map.insert(MONETARY.into(), vec![balance("MONEY", dec!(5), &[], 0.0)]);
        engine.accounting.set_account(&acc).await.unwrap();

        let mut cd = descriptor("dan", "0723045326", 30);
        let cc = engine.debit(&mut cd).await.unwrap();
        assert_eq!(money(&engine, "dan").await, dec!(4.8));

        let mut refund = descriptor("dan", "0723045326", 30);
        refund.increments = increments(&cc);
        engine.refund_increments(&mut refund).await.unwrap();
        let acc = engine.accounting.get_account(TENANT, "dan").await.unwrap();
        assert_eq!(acc.balances("*voice")[0].value, dec!(10));
        assert_eq!(acc.balances(MONETARY)[0].value, dec!(5));
    }

    #[tokio::test]
    async fn test_refund_rounding_charges_difference() {
        let engine = engine_with_tariffs().await;
        funded(&engine, "dan", dec!(10)).await;
        let uuid = engine.accounting.get_account(TENANT, "dan").await.unwrap().balances(MONETARY)[0]
            .uuid
            .clone();
        let mut cd = descriptor("dan", "0723045326", 0);
        cd.increments = vec![Increment {
            cost: dec!(0.05),
            compress_factor: 1,
            balance_info: accurate_core::models::DebitInfo {
                monetary: Some(accurate_core::models::MonetaryInfo {
                    uuid,
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        }];
        engine.refund_rounding(&mut cd).await.unwrap();
        assert_eq!(money(&engine, "dan").await, dec!(9.95));
    }
}
