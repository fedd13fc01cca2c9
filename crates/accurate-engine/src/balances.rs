//! Balance selection and the debit loop
//!
//! A [`DebitSession`] holds the debited account at index 0 followed by the
//! members of its shared groups. Balances are addressed by [`BalanceRef`]s
//! so pooled balances of other accounts are debited in place; the indexes
//! stay valid because a debit only ever appends balances.

use std::collections::HashMap;
use std::sync::Arc;

use accurate_core::models::account::counter_event_view;
use accurate_core::models::rating::duration_secs;
use accurate_core::models::shared_group::sort_by_strategy;
use accurate_core::models::{
    Account, Balance, CallCost, CallDescriptor, DebitInfo, Destination, Increment, MonetaryInfo,
    RIRate, RateInfo, RateInterval, RatingInfo, SharedGroup, TimeSpan, UnitInfo,
};
use accurate_core::utils::consts::{ANY, GENERIC, MAX_COST_DISCONNECT, MAX_COST_FREE, MONETARY, NONE};
use accurate_core::utils::{div, split_account_id, StringMap};
use accurate_core::{AppError, AppResult};
use accurate_db::{CacheMode, DestStrategy};
use chrono::Duration;
use rust_decimal::Decimal;
use serde_json::Value;
use tracing::{debug, warn};

use crate::Engine;

/// Position of a balance inside a [`DebitSession`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BalanceRef {
    pub acc: usize,
    pub tor: String,
    pub idx: usize,
}

pub(crate) struct DebitSession {
    /// Debited account first, then the loaded shared group members
    pub accounts: Vec<Account>,
    index: HashMap<String, usize>,
    groups: HashMap<String, SharedGroup>,
    /// Destinations of the dialled number, longest code first
    dests: Vec<Destination>,
    /// Call view matched by event counters
    event: Value,
    /// Feed the account counters
    count: bool,
    pub dry_run: bool,
    connect_fee_charged: bool,
    negative_connect_fee: bool,
}

impl DebitSession {
    pub fn balance(&self, r: &BalanceRef) -> &Balance {
        &self.accounts[r.acc].balance_map[&r.tor][r.idx]
    }

    fn balance_mut(&mut self, r: &BalanceRef) -> &mut Balance {
        let chain = self.accounts[r.acc].balance_map.entry(r.tor.clone()).or_default();
        &mut chain[r.idx]
    }

    pub fn main(&mut self) -> &mut Account {
        &mut self.accounts[0]
    }

    pub fn into_main(mut self) -> Account {
        self.accounts.swap_remove(0)
    }

    /// Prefix and destination id a balance was selected for
    fn matched_destination(&self, b: &Balance, number: &str) -> (String, String) {
        if b.has_destination() {
            if let Some(d) = self.dests.iter().find(|d| b.destination_ids.get(&d.name) == Some(true)) {
                return (d.code.clone(), d.name.clone());
            }
        }
        (number.to_string(), ANY.to_string())
    }

    /// Balances of one account usable for the call, best first
    fn select(&self, acc: usize, cd: &CallDescriptor, tor: &str, shared_group: Option<&str>) -> Vec<BalanceRef> {
        let now = chrono::Utc::now();
        let mut tors = vec![tor.to_string()];
        if tor != MONETARY && tor != GENERIC {
            tors.push(GENERIC.to_string());
        }
        let mut found: Vec<(BalanceRef, usize, f64)> = Vec::new();
        for t in tors {
            for (idx, b) in self.accounts[acc].balances(&t).iter().enumerate() {
                if b.disabled || b.is_expired_at(now) {
                    continue;
                }
                if b.shared_groups.is_empty() && b.value <= Decimal::ZERO && !b.unlimited && !b.blocker {
                    continue;
                }
                if shared_group.is_some_and(|sg| !b.shared_groups.has(sg)) {
                    continue;
                }
                if !b.match_category(&cd.category) || !b.match_direction(&cd.direction) {
                    continue;
                }
                let Some(precision) = self.destination_precision(b) else {
                    continue;
                };
                found.push((BalanceRef { acc, tor: t.clone(), idx }, precision, b.weight));
            }
        }
        found.sort_by(|a, b| {
            b.1.cmp(&a.1)
                .then_with(|| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal))
        });
        found.into_iter().map(|(r, _, _)| r).collect()
    }

    /// Matched prefix length, `None` when the destination filter rejects
    ///
    /// An included destination selects the balance. With no inclusion
    /// matching, a matched exclusion rejects it and an exclusion-only filter
    /// that matches nothing accepts it.
    fn destination_precision(&self, b: &Balance) -> Option<usize> {
        if !b.has_destination() {
            return Some(0);
        }
        let mut include_len: Option<usize> = None;
        let mut excluded = false;
        for d in &self.dests {
            match b.destination_ids.get(&d.name) {
                Some(true) => include_len = Some(include_len.unwrap_or(0).max(d.code.len())),
                Some(false) => excluded = true,
                None => {}
            }
        }
        if let Some(len) = include_len {
            return Some(len);
        }
        let only_excludes = b.destination_ids.iter().all(|(_, included)| !included);
        (!excluded && only_excludes).then_some(0)
    }

    /// Selected balances with shared ones replaced by their pooled group
    fn balances_for(&self, cd: &CallDescriptor, tor: &str) -> Vec<BalanceRef> {
        let mut out: Vec<BalanceRef> = Vec::new();
        let push = |r: BalanceRef, out: &mut Vec<BalanceRef>| {
            if !out.contains(&r) {
                out.push(r);
            }
        };
        for own in self.select(0, cd, tor, None) {
            let groups = self.balance(&own).shared_groups.slice();
            if groups.is_empty() {
                push(own, &mut out);
                continue;
            }
            for name in groups {
                let Some(sg) = self.groups.get(&name) else {
                    continue;
                };
                let mut members = vec![0usize];
                for id in sg.member_ids.keys() {
                    if let Some(&i) = self.index.get(id) {
                        if !members.contains(&i) {
                            members.push(i);
                        }
                    }
                }
                let mut pooled: Vec<BalanceRef> = members
                    .into_iter()
                    .flat_map(|i| self.select(i, cd, tor, Some(&name)))
                    .collect();
                let strategy = sg.strategy_for(&self.accounts[0].full_id());
                sort_by_strategy(strategy, &mut pooled, |r| self.balance(r).value, |r| *r == own);
                for r in pooled {
                    push(r, &mut out);
                }
            }
        }
        out
    }

    fn count_units(&mut self, amount: Decimal, tor: &str, balance: &Balance) -> AppResult<()> {
        if !self.count || amount.is_zero() {
            return Ok(());
        }
        let event = self.event.clone();
        self.accounts[0].add_units(amount, tor, Some(&event), Some(balance))
    }

    fn account_id(&self, acc: usize) -> String {
        self.accounts[acc].full_id()
    }
}

/// Who paid an increment
fn same_payer(a: &DebitInfo, b: &DebitInfo) -> bool {
    a.unit.as_ref().map(|u| &u.uuid) == b.unit.as_ref().map(|u| &u.uuid)
        && a.monetary.as_ref().map(|m| &m.uuid) == b.monetary.as_ref().map(|m| &m.uuid)
        && a.account_id == b.account_id
}

/// Increments of one span, paid in runs sharing a payer
struct SpanPayer {
    current: Option<TimeSpan>,
    out: Vec<TimeSpan>,
    run: i64,
    info: Option<DebitInfo>,
}

impl SpanPayer {
    fn new(ts: TimeSpan) -> Self {
        Self {
            current: Some(ts),
            out: Vec::new(),
            run: 0,
            info: None,
        }
    }

    fn remaining(&self) -> i64 {
        self.current.as_ref().map_or(0, |ts| ts.increments.len()) - self.run
    }

    fn paid(&mut self, info: DebitInfo) {
        if self.info.as_ref().is_some_and(|prev| !same_payer(prev, &info)) {
            self.flush();
        }
        self.info = Some(info);
        self.run += 1;
    }

    /// Moves the paid run into the output
    fn flush(&mut self) {
        if self.run == 0 {
            return;
        }
        let Some(mut ts) = self.current.take() else {
            return;
        };
        let tail = if self.run < ts.increments.len() {
            ts.split_by_increment(self.run + 1)
        } else {
            None
        };
        if let (Some(inc), Some(info)) = (ts.increments.comp_increment.as_mut(), self.info.take()) {
            inc.paid = inc.compress_factor;
            inc.balance_info = info;
        }
        self.out.push(ts);
        self.current = tail;
        self.run = 0;
    }

    /// The unpaid rest costs nothing
    fn free_rest(&mut self, info: DebitInfo) {
        self.flush();
        if let Some(mut ts) = self.current.take() {
            if let Some(inc) = ts.increments.comp_increment.as_mut() {
                inc.cost = Decimal::ZERO;
                inc.paid = inc.compress_factor;
                inc.balance_info = info;
            }
            ts.cost = Decimal::ZERO;
            self.out.push(ts);
        }
    }

    fn finish(mut self) -> (Vec<TimeSpan>, bool) {
        self.flush();
        let complete = self.current.is_none();
        (self.out, complete)
    }
}

/// Result of a debit attempt on one balance
struct Part {
    spans: Vec<TimeSpan>,
    max_cost_disconnect: bool,
    /// Stop walking balances, the call must end here
    stop: bool,
}

impl Engine {
    /// Loads the shared group members of `main` and the call context
    pub(crate) async fn open_debit_session(
        &self,
        main: Account,
        cd: &CallDescriptor,
        count: bool,
        dry_run: bool,
    ) -> AppResult<DebitSession> {
        let main_id = main.full_id();
        let mut session = DebitSession {
            accounts: vec![main],
            index: HashMap::from([(main_id.clone(), 0)]),
            groups: HashMap::new(),
            dests: Vec::new(),
            event: Value::Null,
            count,
            dry_run,
            connect_fee_charged: false,
            negative_connect_fee: false,
        };
        for name in session.accounts[0].shared_groups() {
            let sg = match self.tariff.get_shared_group(&cd.tenant, &name, CacheMode::Cached).await {
                Ok(sg) => sg,
                Err(AppError::NotFound) => {
                    warn!(shared_group = %name, account = %main_id, "unknown shared group");
                    continue;
                }
                Err(e) => return Err(e),
            };
            for member in sg.member_ids.slice() {
                if session.index.contains_key(&member) {
                    continue;
                }
                let (tenant, name) = split_account_id(&member);
                match self.accounting.get_account_opt(tenant, name).await? {
                    Some(acc) if !acc.disabled => {
                        session.index.insert(member.clone(), session.accounts.len());
                        session.accounts.push(acc);
                    }
                    _ => debug!(member = %member, "shared group member skipped"),
                }
            }
            session.groups.insert(name, sg);
        }
        session.dests = match self
            .tariff
            .get_destinations(&cd.tenant, &cd.destination, "", DestStrategy::Matching, CacheMode::Cached)
            .await
        {
            Ok(d) => d,
            Err(AppError::NotFound) => Vec::new(),
            Err(e) => return Err(e),
        };
        let names = StringMap::from_items(session.dests.iter().map(|d| d.name.clone()));
        session.event = counter_event_view(&cd.category, &cd.direction, &names);
        Ok(session)
    }

    /// Lock keys for a debit on the account: the account and every member of
    /// its shared groups, sorted
    pub(crate) async fn debit_lock_keys(&self, tenant: &str, name: &str) -> AppResult<Vec<String>> {
        let own = accurate_core::utils::concatenated_key(&[tenant, name]);
        let mut keys = vec![own];
        if let Some(acc) = self.accounting.get_account_opt(tenant, name).await? {
            for group in acc.shared_groups() {
                if let Ok(sg) = self.tariff.get_shared_group(tenant, &group, CacheMode::Cached).await {
                    keys.extend(sg.member_ids.slice());
                }
            }
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    /// Prices `cd` the way `b` is rated: through its rating subject, or the
    /// descriptor's own subject when it has none
    async fn balance_cost(&self, b: &Balance, cd: &CallDescriptor) -> AppResult<CallCost> {
        let mut bcd = cd.clone();
        bcd.rating_infos.clear();
        if !b.rating_subject.is_empty() && b.zero_rating_step().is_none() {
            bcd.subject = b.rating_subject.clone();
            bcd.account = b.rating_subject.clone();
        }
        self.get_cost(&mut bcd).await
    }

    /// Charges the connect fee of `cc` to the first money balance able to
    /// pay it, to the default balance otherwise
    ///
    /// Returns false when a blocker balance stops the search.
    fn debit_connection_fee(
        &self,
        s: &mut DebitSession,
        cc: &mut CallCost,
        money: &[BalanceRef],
        block: bool,
    ) -> AppResult<bool> {
        if !cc.deduct_connect_fee || s.connect_fee_charged {
            return Ok(true);
        }
        let fee = cc.connect_fee();
        if fee <= Decimal::ZERO {
            return Ok(true);
        }
        for r in money {
            let b = s.balance_mut(r);
            if b.unlimited || b.value >= fee {
                b.subtract_value(fee);
                let snapshot = b.clone();
                s.connect_fee_charged = true;
                s.count_units(fee, MONETARY, &snapshot)?;
                return Ok(true);
            }
            if b.blocker && block {
                return Ok(false);
            }
        }
        cc.negative_connect_fee = true;
        s.negative_connect_fee = true;
        s.connect_fee_charged = true;
        let def = s.main().default_money_balance();
        def.subtract_value(fee);
        let snapshot = def.clone();
        s.count_units(fee, MONETARY, &snapshot)?;
        Ok(true)
    }

    /// Free units: the span is rated at zero in steps of the balance's
    /// `*zero` duration and each step consumes units
    fn debit_zero_units(&self, s: &mut DebitSession, r: &BalanceRef, cd: &CallDescriptor, step: Duration) -> AppResult<Option<Part>> {
        let b = s.balance(r).clone();
        let (prefix, dest_id) = s.matched_destination(&b, &cd.destination);
        let interval = RateInterval {
            rating: RIRate {
                rates: vec![RateInfo {
                    group_interval_start: Duration::zero(),
                    value: Decimal::ZERO,
                    rate_increment: step,
                    rate_unit: step,
                }],
                ..Default::default()
            },
            ..Default::default()
        };
        let mut ts = TimeSpan::new(cd.time_start, cd.time_end);
        ts.duration_index = cd.duration_index;
        ts.round_to_duration(step);
        ts.set_rating_info(Arc::new(RatingInfo {
            matched_subject: b.uuid.clone(),
            rating_plan_id: NONE.to_string(),
            matched_prefix: prefix,
            matched_dest_id: dest_id.clone(),
            activation_time: cd.time_start,
            rate_intervals: vec![interval.clone()],
            fallback_keys: Vec::new(),
        }));
        ts.rate_interval = Some(interval);
        ts.create_increments(self.decimals());
        let Some(template) = ts.increments.comp_increment.clone() else {
            return Ok(None);
        };

        let amount = div(duration_secs(template.duration), b.factor.get(&r.tor), None);
        let account_id = s.account_id(r.acc);
        let mut payer = SpanPayer::new(ts);
        let mut consumed = Decimal::ZERO;
        while payer.remaining() > 0 {
            let bal = s.balance_mut(r);
            if !(bal.unlimited || bal.value >= amount) {
                break;
            }
            bal.subtract_value(amount);
            consumed += amount;
            payer.paid(DebitInfo {
                unit: Some(UnitInfo {
                    uuid: bal.uuid.clone(),
                    id: bal.id.clone(),
                    value: bal.value,
                    destination_id: dest_id.clone(),
                    consumed: amount,
                    tor: r.tor.clone(),
                    rate_interval: None,
                }),
                monetary: None,
                account_id: account_id.clone(),
            });
        }
        let snapshot = s.balance(r).clone();
        s.count_units(consumed, &r.tor, &snapshot)?;
        let (mut spans, _) = payer.finish();
        for ts in spans.iter_mut() {
            ts.cost = Decimal::ZERO;
        }
        if spans.is_empty() {
            return Ok(None);
        }
        Ok(Some(Part {
            spans,
            max_cost_disconnect: false,
            stop: false,
        }))
    }

    /// Debits `r` for as much of `cd` as it covers
    ///
    /// Unit balances consume units per increment and, for priced increments,
    /// money from the first money balance able to pay; money balances pay the
    /// increment cost themselves.
    async fn debit_balance(
        &self,
        s: &mut DebitSession,
        r: &BalanceRef,
        cd: &mut CallDescriptor,
        money: &[BalanceRef],
        unit_mode: bool,
        first: bool,
    ) -> AppResult<Option<Part>> {
        {
            let b = s.balance(r);
            if !b.is_active_at(cd.time_start) || (b.value <= Decimal::ZERO && !b.unlimited) {
                return Ok(None);
            }
        }
        if unit_mode {
            if let Some(step) = s.balance(r).zero_rating_step() {
                return self.debit_zero_units(s, r, cd, step);
            }
        }

        let b = s.balance(r).clone();
        let mut cc = self.balance_cost(&b, cd).await?;
        if first && !self.debit_connection_fee(s, &mut cc, money, true)? {
            return Ok(None);
        }
        cc.decompress();

        let stop_on_disconnect = s.dry_run || self.cfg.general.max_cost_disconnect_always;
        let factor = b.factor.get(&r.tor);
        let account_id = s.account_id(r.acc);
        let mut out: Vec<TimeSpan> = Vec::new();
        let mut disconnect = false;
        let mut stop = false;

        for ts in std::mem::take(&mut cc.timespans) {
            let Some(template) = ts.increments.comp_increment.clone() else {
                continue;
            };
            let (max_cost, strategy) = ts
                .rate_interval
                .as_ref()
                .map(|ri| {
                    let (c, st) = ri.max_cost();
                    (c, st.to_string())
                })
                .unwrap_or_default();
            let interval = ts.rate_interval.clone();
            let mut payer = SpanPayer::new(ts);
            let mut unit_total = Decimal::ZERO;
            let mut money_spent: Vec<(BalanceRef, Decimal)> = Vec::new();

            while payer.remaining() > 0 {
                if strategy == MAX_COST_DISCONNECT && cd.max_cost_so_far >= max_cost {
                    disconnect = true;
                    if stop_on_disconnect {
                        stop = true;
                        break;
                    }
                }
                if strategy == MAX_COST_FREE && cd.max_cost_so_far >= max_cost {
                    let bal = s.balance(r);
                    payer.free_rest(DebitInfo {
                        monetary: Some(MonetaryInfo {
                            uuid: bal.uuid.clone(),
                            id: bal.id.clone(),
                            value: bal.value,
                            rate_interval: None,
                        }),
                        unit: None,
                        account_id: account_id.clone(),
                    });
                    break;
                }
                let cost = template.cost;
                let info = if unit_mode {
                    let amount = div(duration_secs(template.duration), factor, None);
                    let payer_ref = if cost.is_zero() {
                        None
                    } else {
                        match money.iter().find(|m| {
                            let mb = s.balance(m);
                            mb.unlimited || mb.value >= cost
                        }) {
                            Some(m) => Some(m.clone()),
                            None => break,
                        }
                    };
                    {
                        let ub = s.balance(r);
                        if !(ub.unlimited || ub.value >= amount) {
                            break;
                        }
                    }
                    let ub = s.balance_mut(r);
                    ub.subtract_value(amount);
                    unit_total += amount;
                    let unit = UnitInfo {
                        uuid: ub.uuid.clone(),
                        id: ub.id.clone(),
                        value: ub.value,
                        destination_id: ts_dest(&payer),
                        consumed: amount,
                        tor: r.tor.clone(),
                        rate_interval: interval.clone(),
                    };
                    let monetary = match payer_ref {
                        Some(m) => {
                            let mb = s.balance_mut(&m);
                            mb.subtract_value(cost);
                            let info = MonetaryInfo {
                                uuid: mb.uuid.clone(),
                                id: mb.id.clone(),
                                value: mb.value,
                                rate_interval: None,
                            };
                            money_spent.push((m, cost));
                            Some(info)
                        }
                        None => None,
                    };
                    DebitInfo {
                        unit: Some(unit),
                        monetary,
                        account_id: account_id.clone(),
                    }
                } else {
                    let mb = s.balance_mut(r);
                    if !(mb.unlimited || mb.value >= cost) {
                        break;
                    }
                    mb.subtract_value(cost);
                    money_spent.push((r.clone(), cost));
                    DebitInfo {
                        monetary: Some(MonetaryInfo {
                            uuid: mb.uuid.clone(),
                            id: mb.id.clone(),
                            value: mb.value,
                            rate_interval: if mb.rating_subject.is_empty() {
                                None
                            } else {
                                interval.clone()
                            },
                        }),
                        unit: None,
                        account_id: account_id.clone(),
                    }
                };
                cd.max_cost_so_far += cost;
                payer.paid(info);
            }

            if unit_total > Decimal::ZERO {
                let snapshot = s.balance(r).clone();
                s.count_units(unit_total, &r.tor, &snapshot)?;
            }
            for (m, spent) in money_spent {
                let snapshot = s.balance(&m).clone();
                s.count_units(spent, MONETARY, &snapshot)?;
            }
            let (spans, complete) = payer.finish();
            out.extend(spans);
            if !complete || stop {
                break;
            }
        }

        if out.is_empty() && !disconnect {
            return Ok(None);
        }
        Ok(Some(Part {
            spans: out,
            max_cost_disconnect: disconnect,
            stop,
        }))
    }

    /// Walks the candidate balances over `cd`, unit chains first
    ///
    /// Whatever no balance covers is priced through the standard rating and,
    /// with `go_negative`, charged to the default money balance. A blocker
    /// balance ends the walk, leaving the rest uncovered.
    pub(crate) async fn debit_balances(
        &self,
        s: &mut DebitSession,
        cd: &mut CallDescriptor,
        go_negative: bool,
    ) -> AppResult<CallCost> {
        let mut cc = cd.create_call_cost();
        let tor = cd.tor.clone();
        let unit_refs = if tor == MONETARY {
            Vec::new()
        } else {
            s.balances_for(cd, &tor)
        };
        let money_refs = s.balances_for(cd, MONETARY);
        let mut halted = false;

        let plan = unit_refs
            .iter()
            .map(|r| (r, true))
            .chain(money_refs.iter().map(|r| (r, false)));
        for (r, unit_mode) in plan {
            if cd.duration() <= Duration::zero() {
                break;
            }
            let first = cc.timespans.is_empty();
            if let Some(part) = self.debit_balance(s, r, cd, &money_refs, unit_mode, first).await? {
                if let Some(end) = part.spans.last().map(|ts| ts.time_end) {
                    cd.time_start = end;
                }
                cc.timespans.extend(part.spans);
                if part.max_cost_disconnect {
                    cc.max_cost_disconnect = true;
                }
                if part.stop {
                    halted = true;
                    break;
                }
            }
            if s.balance(r).blocker {
                debug!(balance = %s.balance(r).uuid, "blocker balance reached");
                if cc.timespans.is_empty() {
                    cc.timespans.push(blocked_span(cd, s.balance(r), &s.account_id(r.acc)));
                }
                halted = true;
                break;
            }
        }

        if !halted && cd.duration() > Duration::zero() {
            let mut left_cd = cd.clone();
            left_cd.rating_infos.clear();
            let mut left = self.get_cost(&mut left_cd).await?;
            let main_id = s.account_id(0);
            if left.cost.is_zero() && !left.timespans.is_empty() {
                for ts in left.timespans.iter_mut() {
                    if let Some(inc) = ts.increments.comp_increment.as_mut() {
                        inc.balance_info.account_id = main_id.clone();
                    }
                }
                cc.timespans.extend(left.timespans);
            } else if left.cost > Decimal::ZERO && go_negative {
                if !s.accounts[0].allow_negative {
                    warn!(account = %main_id, "going negative on an account not allowing it");
                }
                if cc.timespans.is_empty() {
                    left.deduct_connect_fee = cd.loop_index == 0.0;
                    self.debit_connection_fee(s, &mut left, &money_refs, true)?;
                }
                left.decompress();
                for ts in left.timespans.iter_mut() {
                    let Some(inc) = ts.increments.comp_increment.as_mut() else {
                        continue;
                    };
                    let total = inc.cost * Decimal::from(inc.compress_factor);
                    let def = s.main().default_money_balance();
                    def.subtract_value(total);
                    inc.balance_info = DebitInfo {
                        monetary: Some(MonetaryInfo {
                            uuid: def.uuid.clone(),
                            id: def.id.clone(),
                            value: def.value,
                            rate_interval: None,
                        }),
                        unit: None,
                        account_id: main_id.clone(),
                    };
                    inc.paid = inc.compress_factor;
                    let snapshot = def.clone();
                    s.count_units(total, MONETARY, &snapshot)?;
                    cd.max_cost_so_far += total;
                }
                cc.timespans.extend(left.timespans);
            }
        }

        if !s.dry_run {
            for acc in s.accounts.iter().skip(1).filter(|a| a.has_dirty()) {
                self.accounting.set_account(acc).await?;
            }
        }
        cc.negative_connect_fee = s.negative_connect_fee;
        cc.deduct_connect_fee = cd.loop_index == 0.0;
        cc.refresh_cost(self.decimals());
        cc.update_rated_usage();
        Ok(cc)
    }
}

/// Destination id recorded on unit debits
fn ts_dest(payer: &SpanPayer) -> String {
    payer
        .current
        .as_ref()
        .map(|ts| ts.matched_dest_id.clone())
        .unwrap_or_default()
}

/// Zero length span naming the blocker that stopped the debit
fn blocked_span(cd: &CallDescriptor, b: &Balance, account_id: &str) -> TimeSpan {
    let mut ts = TimeSpan::new(cd.time_start, cd.time_start);
    ts.increments.comp_increment = Some(Increment {
        duration: Duration::zero(),
        cost: Decimal::ZERO,
        balance_info: DebitInfo {
            monetary: Some(MonetaryInfo {
                uuid: b.uuid.clone(),
                id: b.id.clone(),
                value: b.value,
                rate_interval: None,
            }),
            unit: None,
            account_id: account_id.to_string(),
        },
        compress_factor: 1,
        paid: 0,
    });
    ts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::*;
    use rust_decimal_macros::dec;

    fn refs(s: &DebitSession, list: &[BalanceRef]) -> Vec<String> {
        list.iter().map(|r| s.balance(r).id.clone()).collect()
    }

    #[tokio::test]
    async fn test_selection_prefers_destination_precision() {
        let engine = engine_with_tariffs().await;
        let mut acc = account("dan");
        acc.balance_map.insert(
            "*voice".into(),
            vec![
                balance("ANY_MIN", dec!(100), &[], 30.0),
                balance("NAT_MIN", dec!(100), &["NAT"], 10.0),
                balance("RET_MIN", dec!(100), &["RET"], 0.0),
                balance("FOREIGN", dec!(100), &["GERMANY"], 50.0),
            ],
        );
        let cd = descriptor("dan", "0723045326", 60);
        let s = engine.open_debit_session(acc, &cd, false, true).await.unwrap();
        let picked = s.balances_for(&cd, "*voice");
        assert_eq!(refs(&s, &picked), ["RET_MIN", "NAT_MIN", "ANY_MIN"]);
    }

    #[tokio::test]
    async fn test_exclusion_rejects_matched_destination() {
        let engine = engine_with_tariffs().await;
        let mut acc = account("dan");
        let mut not_ret = balance("NOT_RET", dec!(100), &[], 0.0);
        not_ret.destination_ids = StringMap::parse("!RET", ";");
        acc.balance_map.insert("*voice".into(), vec![not_ret]);

        let cd = descriptor("dan", "0723045326", 60);
        let s = engine.open_debit_session(acc.clone(), &cd, false, true).await.unwrap();
        assert!(s.balances_for(&cd, "*voice").is_empty());

        let cd = descriptor("dan", "0256123", 60);
        let s = engine.open_debit_session(acc, &cd, false, true).await.unwrap();
        assert_eq!(s.balances_for(&cd, "*voice").len(), 1);
    }

    #[tokio::test]
    async fn test_units_then_money() {
        let engine = engine_with_tariffs().await;
        let mut acc = account("dan");
        acc.balance_map.insert("*voice".into(), vec![balance("NAT_MIN", dec!(10), &["NAT"], 0.0)]);
        acc.balance_map.insert("*monetary".into(), vec![balance("MONEY", dec!(5), &[], 0.0)]);
        let mut cd = descriptor("dan", "0723045326", 30);
        let mut s = engine.open_debit_session(acc, &cd, true, false).await.unwrap();
        let cc = engine.debit_balances(&mut s, &mut cd, true).await.unwrap();

        let acc = s.into_main();
        assert_eq!(acc.balances("*voice")[0].value, dec!(0));
        assert_eq!(acc.balances("*monetary")[0].value, dec!(4.8));
        assert_eq!(cc.cost, dec!(0.2));
        assert_eq!(cc.rated_usage, 30.0);
    }

    #[tokio::test]
    async fn test_goes_negative_on_default_balance() {
        let engine = engine_with_tariffs().await;
        let mut acc = account("dan");
        acc.balance_map.insert("*monetary".into(), vec![balance("MONEY", dec!(0.1), &[], 0.0)]);
        let mut cd = descriptor("dan", "0723045326", 60);
        let mut s = engine.open_debit_session(acc, &cd, true, false).await.unwrap();
        let cc = engine.debit_balances(&mut s, &mut cd, true).await.unwrap();
        assert_eq!(cc.cost, dec!(0.6));
        assert!(cc.is_paid());

        let acc = s.into_main();
        let money = acc.balances("*monetary");
        assert_eq!(money[0].value, dec!(0));
        let def = money.iter().find(|b| b.is_default()).unwrap();
        assert_eq!(def.value, dec!(-0.5));
    }

    #[tokio::test]
    async fn test_blocker_stops_the_walk() {
        let engine = engine_with_tariffs().await;
        let mut acc = account("dan");
        let mut blocker = balance("BLOCK", dec!(0), &[], 20.0);
        blocker.blocker = true;
        acc.balance_map.insert(
            "*monetary".into(),
            vec![blocker, balance("MONEY", dec!(10), &[], 10.0)],
        );
        let mut cd = descriptor("dan", "0723045326", 60);
        let mut s = engine.open_debit_session(acc, &cd, false, true).await.unwrap();
        let cc = engine.debit_balances(&mut s, &mut cd, false).await.unwrap();
        assert_eq!(cc.rated_usage, 0.0);
        let info = &cc.first_increment().unwrap().balance_info;
        assert_eq!(info.monetary.as_ref().unwrap().id, "BLOCK");
    }

    #[tokio::test]
    async fn test_shared_group_pools_member_balances() {
        let engine = engine_with_tariffs().await;
        shared_group(&engine, "SG_TEST", "*highest", &["cgrates.org:dan", "cgrates.org:rif"]).await;

        let mut rif = account("rif");
        let mut pooled = balance("RIF_POOL", dec!(100), &[], 0.0);
        pooled.shared_groups = StringMap::from_items(["SG_TEST"]);
        rif.balance_map.insert("*monetary".into(), vec![pooled]);
        engine.accounting.set_account(&rif).await.unwrap();

        let mut dan = account("dan");
        let mut own = balance("DAN_POOL", dec!(1), &[], 0.0);
        own.shared_groups = StringMap::from_items(["SG_TEST"]);
        dan.balance_map.insert("*monetary".into(), vec![own]);

        let mut cd = descriptor("dan", "0723045326", 60);
        let mut s = engine.open_debit_session(dan, &cd, true, false).await.unwrap();
        let picked = s.balances_for(&cd, MONETARY);
        assert_eq!(refs(&s, &picked), ["RIF_POOL", "DAN_POOL"]);

        engine.debit_balances(&mut s, &mut cd, true).await.unwrap();
        let rif = engine.accounting.get_account("cgrates.org", "rif").await.unwrap();
        assert_eq!(rif.balances("*monetary")[0].value, dec!(99.4));
        assert_eq!(s.into_main().balances("*monetary")[0].value, dec!(1));
    }

    #[tokio::test]
    async fn test_lock_keys_cover_group_members() {
        let engine = engine_with_tariffs().await;
        shared_group(&engine, "SG_TEST", "*lowest", &["cgrates.org:rif", "cgrates.org:dan"]).await;
        let mut dan = account("dan");
        let mut own = balance("DAN_POOL", dec!(1), &[], 0.0);
        own.shared_groups = StringMap::from_items(["SG_TEST"]);
        dan.balance_map.insert("*monetary".into(), vec![own]);
        engine.accounting.set_account(&dan).await.unwrap();

        let keys = engine.debit_lock_keys("cgrates.org", "dan").await.unwrap();
        assert_eq!(keys, ["cgrates.org:dan", "cgrates.org:rif"]);
    }
}
