//! Action execution
//!
//! Actions run against an account, a triggered stats queue, or nothing at
//! all (scheduled plans bound to no account). Handlers are dispatched on the
//! action type.

use std::collections::{BTreeMap, HashMap};

use accurate_core::models::action::*;
use accurate_core::models::{Account, Action, ActionGroup, ActionTrigger, Balance, Cdr, Destination};
use accurate_core::utils::consts::{
    ACCID, ACCOUNT, ANSWER_TIME, CDRHOST, COST, DEFAULT, DIRECTION, MEDI_RUNID, META_PREPAID, MONETARY,
    REQTYPE, SETUP_TIME, SUBJECT, TENANT, TOR, USAGE,
};
use accurate_core::utils::{gen_uuid, StringMap};
use accurate_core::{AppError, AppResult};
use accurate_db::{CacheMode, DestStrategy};
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::replication::{fib_delays, post, Payload};
use crate::Engine;

/// Source of CDRs written by `*cdrlog`
pub const CDRLOG_SOURCE: &str = "*cdrlog";

/// Address of `*cgr_rpc` requests served by this engine
pub const META_INTERNAL: &str = "*internal";

/// Prefix of destination ids rewritten by `*set_ddestinations`
const DDC_PREFIX: &str = "*ddc";

/// Action types `*cdrlog` writes a record for
const LOGGED_ACTIONS: [&str; 4] = [DEBIT, DEBIT_RESET, TOPUP, TOPUP_RESET];

static TEMPLATE_FIELD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<<\s*\.([A-Za-z0-9_.]+)\s*>>").expect("template regex is valid"));

/// Queue state handed to the actions of a stats queue trigger
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct TriggeredQueue {
    pub tenant: String,
    pub name: String,
    pub metrics: BTreeMap<String, Decimal>,
    /// Distinct destinations currently queued
    pub destinations: Vec<String>,
    pub trigger: ActionTrigger,
}

/// What an action group runs against
pub(crate) struct ActionTarget<'a> {
    account: Option<&'a mut Account>,
    queue: Option<&'a TriggeredQueue>,
}

impl<'a> ActionTarget<'a> {
    pub fn account(acc: &'a mut Account) -> Self {
        Self {
            account: Some(acc),
            queue: None,
        }
    }

    pub fn queue(queue: &'a TriggeredQueue) -> Self {
        Self {
            account: None,
            queue: Some(queue),
        }
    }

    pub fn none() -> Self {
        Self {
            account: None,
            queue: None,
        }
    }

    fn account_mut(&mut self) -> AppResult<&mut Account> {
        self.account.as_deref_mut().ok_or(AppError::AccountNotFound)
    }

    /// Account or queue as posted by `*call_url`
    fn as_json(&self) -> AppResult<Value> {
        if let Some(acc) = self.account.as_deref() {
            return Ok(serde_json::to_value(acc)?);
        }
        if let Some(q) = self.queue {
            return Ok(serde_json::to_value(q)?);
        }
        Ok(Value::Null)
    }
}

/// Side results of an action group run
#[derive(Debug, Default)]
pub struct ActionOutcome {
    pub account_removed: bool,
    /// Records written by `*cdrlog`
    pub cdrs: Vec<Cdr>,
    /// Balance value after each balance action, by position in the group
    balance_values: HashMap<usize, Decimal>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct RpcRequest {
    address: String,
    method: String,
    attempts: u32,
    #[serde(rename = "Async")]
    is_async: bool,
    params: Value,
}

impl Default for RpcRequest {
    fn default() -> Self {
        Self {
            address: META_INTERNAL.to_string(),
            method: String::new(),
            attempts: 1,
            is_async: false,
            params: Value::Null,
        }
    }
}

/// Account and plan named in the parameters of account-less actions
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct AccountParams {
    tenant: String,
    account: String,
}

fn lookup<'v>(doc: &'v Value, path: &str) -> Option<&'v Value> {
    path.split('.').try_fold(doc, |v, key| v.get(key))
}

/// Expands `<< .Account.Name >>` style placeholders against `doc`
fn render_template(template: &str, doc: &Value) -> String {
    TEMPLATE_FIELD
        .replace_all(template, |caps: &regex::Captures| match lookup(doc, &caps[1]) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        })
        .into_owned()
}

fn default_cdrlog_template() -> BTreeMap<String, String> {
    [
        (TOR, "BalanceType"),
        (CDRHOST, "^127.0.0.1"),
        (DIRECTION, "Directions"),
        (REQTYPE, "^*prepaid"),
        (TENANT, "Tenant"),
        (ACCOUNT, "Account"),
        (SUBJECT, "Account"),
        (COST, "ActionValue"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// Values a `*cdrlog` template field may reference
struct CdrLogView<'a> {
    account: &'a Account,
    group: &'a str,
    action: &'a Action,
    balance: &'a Balance,
    balance_value: Decimal,
}

impl CdrLogView<'_> {
    /// `;` separated parts, `^` marking a literal
    fn render(&self, template: &str) -> String {
        template
            .split(';')
            .map(|part| match part.strip_prefix('^') {
                Some(literal) => literal.to_string(),
                None => self.variable(part),
            })
            .collect()
    }

    fn variable(&self, name: &str) -> String {
        let b = self.balance;
        match name {
            "AccountID" => self.account.full_id(),
            "Directions" => b.directions.slice().join(";"),
            "Tenant" => self.account.tenant.clone(),
            "Account" => self.account.name.clone(),
            "ActionID" => self.group.to_string(),
            "ActionType" => self.action.action_type.clone(),
            "ActionValue" => b.value.to_string(),
            "BalanceType" => self.action.tor.clone(),
            "BalanceUUID" => b.uuid.clone(),
            "BalanceID" => b.id.clone(),
            "BalanceValue" => self.balance_value.to_string(),
            "DestinationIDs" => b.destination_ids.slice().join(";"),
            "Params" => self.action.params.clone(),
            "RatingSubject" => b.rating_subject.clone(),
            "Category" => b.categories.slice().join(";"),
            "SharedGroups" => b.shared_groups.slice().join(";"),
            _ => String::new(),
        }
    }
}

impl Engine {
    /// Runs the actions of `group` against `target`, heaviest first
    ///
    /// An action whose exec filter matches none of the account's balances is
    /// skipped. The first failing action aborts the run.
    pub(crate) async fn execute_actions(
        &self,
        target: &mut ActionTarget<'_>,
        group: &ActionGroup,
        trigger: Option<&ActionTrigger>,
    ) -> AppResult<ActionOutcome> {
        let actions = group.sorted_actions();
        let mut outcome = ActionOutcome::default();
        for (idx, a) in actions.iter().enumerate() {
            if !a.exec_filter.is_empty() {
                if let Some(acc) = target.account.as_deref() {
                    if !acc.match_action_filter(&a.exec_filter)? {
                        debug!(action = %a.action_type, filter = %a.exec_filter, "exec filter not met");
                        continue;
                    }
                }
            }
            self.apply_action(target, idx, &actions, group, trigger, &mut outcome)
                .await
                .map_err(|e| {
                    warn!(group = %group.name, action = %a.action_type, error = %e, "action failed");
                    e
                })?;
            if outcome.account_removed {
                break;
            }
        }
        Ok(outcome)
    }

    async fn apply_action(
        &self,
        target: &mut ActionTarget<'_>,
        idx: usize,
        actions: &[Action],
        group: &ActionGroup,
        trigger: Option<&ActionTrigger>,
        outcome: &mut ActionOutcome,
    ) -> AppResult<()> {
        let a = &actions[idx];
        match a.action_type.as_str() {
            LOG => {
                info!(
                    target_state = %target.as_json()?,
                    trigger = trigger.map(|t| t.unique_id.as_str()).unwrap_or_default(),
                    extra_info = %a.params,
                    "threshold hit"
                );
            }
            CDRLOG => {
                let cdrs = self.cdr_log(target.account_mut()?, a, actions, group, outcome).await?;
                outcome.cdrs.extend(cdrs);
            }
            RESET_TRIGGERS => {
                let acc = target.account_mut()?;
                outcome.account_removed |= self.reset_triggers(acc, Some(a)).await;
            }
            SET_RECURRENT => self.set_recurrent(target.account_mut()?, Some(a), true),
            UNSET_RECURRENT => self.set_recurrent(target.account_mut()?, Some(a), false),
            ALLOW_NEGATIVE => target.account_mut()?.allow_negative = true,
            DENY_NEGATIVE => target.account_mut()?.allow_negative = false,
            ENABLE_ACCOUNT => target.account_mut()?.disabled = false,
            DISABLE_ACCOUNT => target.account_mut()?.disabled = true,
            RESET_ACCOUNT => {
                let acc = target.account_mut()?;
                for (tor, chain) in acc.balance_map.iter_mut() {
                    let mut fresh = if tor == MONETARY {
                        Balance::new_default()
                    } else {
                        Balance {
                            uuid: gen_uuid(),
                            ..Default::default()
                        }
                    };
                    fresh.dirty = true;
                    *chain = vec![fresh];
                }
                self.init_account_triggers(acc).await;
                outcome.account_removed |= self.reset_triggers(acc, None).await;
            }
            TOPUP_RESET | TOPUP | DEBIT_RESET | DEBIT => {
                let reset = matches!(a.action_type.as_str(), TOPUP_RESET | DEBIT_RESET);
                let topup = matches!(a.action_type.as_str(), TOPUP_RESET | TOPUP);
                let acc = target.account_mut()?;
                let value = self.debit_balance_action(acc, a, reset, topup).await?;
                outcome.balance_values.insert(idx, value);
                outcome.account_removed |= self.execute_action_triggers(acc, None).await;
            }
            RESET_COUNTERS => {
                let query = a.query()?;
                target.account_mut()?.reset_counters(Some(&a.tor), Some(&query))?;
            }
            SET_BALANCE => {
                let acc = target.account_mut()?;
                self.set_balance_action(acc, a).await?;
                outcome.account_removed |= self.execute_action_triggers(acc, None).await;
            }
            REMOVE_BALANCE => {
                let acc = target.account_mut()?;
                let query = a.query()?;
                let chain = acc.balance_map.get_mut(&a.tor).ok_or(AppError::NotFound)?;
                let before = chain.len();
                let mut kept = Vec::with_capacity(before);
                for b in chain.drain(..) {
                    if !query.matches(&b)? {
                        kept.push(b);
                    }
                }
                *chain = kept;
                if chain.len() == before {
                    return Err(AppError::NotFound);
                }
            }
            TRANSFER_MONETARY_DEFAULT => {
                let acc = target.account_mut()?;
                if !acc.balance_map.contains_key(MONETARY) {
                    return Err(AppError::NotFound);
                }
                let query = a.query()?;
                let default_idx = acc.default_money_balance_index();
                let chain = acc.balance_map.entry(MONETARY.to_string()).or_default();
                let mut moved = Decimal::ZERO;
                for (i, b) in chain.iter_mut().enumerate() {
                    if i == default_idx || b.id == DEFAULT || !query.matches(&*b)? {
                        continue;
                    }
                    if b.value > Decimal::ZERO {
                        moved += b.value;
                        b.set_value(Decimal::ZERO);
                    }
                }
                chain[default_idx].add_value(moved);
            }
            REMOVE_ACCOUNT => {
                let (tenant, name) = match target.account.as_deref() {
                    Some(acc) => (acc.tenant.clone(), acc.name.clone()),
                    None => {
                        let p: AccountParams = serde_json::from_str(&a.params).unwrap_or_default();
                        (p.tenant, p.account)
                    }
                };
                if tenant.is_empty() || name.is_empty() {
                    return Err(AppError::InvalidKey);
                }
                self.accounting.remove_account(&tenant, &name).await?;
                for plan in self.accounting.plans_for_account(&tenant, &name).await? {
                    self.accounting.unbind_action_plan(&tenant, &name, &plan).await?;
                }
                info!(tenant = %tenant, account = %name, "account removed by action");
                outcome.account_removed = true;
            }
            SET_DDESTINATIONS => self.set_ddc_destinations(target, a).await?,
            CALL_URL => {
                let body = Payload::Json(target.as_json()?);
                let general = &self.cfg.general;
                post(&self.http, a.params.trim(), &body, general.http_poster_attempts, &general.http_failed_dir)
                    .await?;
            }
            CALL_URL_ASYNC => {
                let body = Payload::Json(target.as_json()?);
                let client = self.http.clone();
                let url = a.params.trim().to_string();
                let attempts = self.cfg.general.http_poster_attempts;
                let dir = self.cfg.general.http_failed_dir.clone();
                tokio::spawn(async move {
                    if let Err(e) = post(&client, &url, &body, attempts, &dir).await {
                        warn!(url = %url, error = %e, "asynchronous call_url failed");
                    }
                });
            }
            MAIL_ASYNC => {
                let to = a.params.split(',').next().unwrap_or_default();
                warn!(to = %to, error = %AppError::NotImplemented, "mail transport not available, notification dropped");
            }
            CGR_RPC => {
                let doc = json!({
                    "Account": target.account.as_deref(),
                    "Sq": target.queue,
                    "Action": a,
                    "Actions": actions,
                });
                self.cgr_rpc(&render_template(&a.params, &doc)).await?;
            }
            other => {
                return Err(AppError::InvalidArgument(format!("unknown action type {}", other)));
            }
        }
        Ok(())
    }

    /// Adds the account to the shared groups it now has balances in
    async fn join_shared_groups(&self, acc: &Account, groups: &StringMap) -> AppResult<()> {
        if groups.is_empty() {
            return Ok(());
        }
        let keys: Vec<String> = groups.keys().map(|g| format!("*sg:{}:{}", acc.tenant, g)).collect();
        let member = acc.full_id();
        self.guardian
            .guard(&keys, self.lock_timeout(), || async move {
                for name in groups.keys() {
                    let mut sg = match self.tariff.get_shared_group(&acc.tenant, name, CacheMode::Cached).await {
                        Ok(sg) => sg,
                        Err(e) => {
                            warn!(shared_group = %name, error = %e, "could not get shared group");
                            continue;
                        }
                    };
                    if !sg.member_ids.has(&member) {
                        sg.member_ids.add(member.clone());
                        self.tariff.set_shared_group(&sg, None).await?;
                    }
                }
                Ok(())
            })
            .await
    }

    /// Applies a top-up or debit to the balances of the action's type matching
    /// its filter, creating the balance when none matches
    ///
    /// Returns the value of the last touched balance.
    async fn debit_balance_action(&self, acc: &mut Account, a: &Action, reset: bool, topup: bool) -> AppResult<Decimal> {
        let template = a.new_balance()?;
        let amount = if topup { -template.value.abs() } else { template.value };
        let query = a.query()?;
        let now = Utc::now();
        let mut last = None;
        for b in acc.balance_map.entry(a.tor.clone()).or_default().iter_mut() {
            if b.is_expired_at(now) {
                continue;
            }
            if !query.matches(&*b)? {
                continue;
            }
            if reset {
                b.set_value(Decimal::ZERO);
            }
            b.subtract_value(amount);
            b.dirty = true;
            last = Some(b.value);
        }
        let value = match last {
            Some(v) => v,
            None => {
                let mut fresh = if template.id == DEFAULT {
                    Balance {
                        id: DEFAULT.to_string(),
                        ..Default::default()
                    }
                } else {
                    template
                };
                fresh.value = -amount;
                fresh.uuid = gen_uuid();
                fresh.dirty = true;
                if let Some(factor) = a.value_factor().unwrap_or_else(|e| {
                    warn!(params = %a.params, error = %e, "could not load value factor");
                    None
                }) {
                    fresh.factor = factor;
                }
                let groups = fresh.shared_groups.clone();
                let value = fresh.value;
                acc.balance_map.entry(a.tor.clone()).or_default().push(fresh);
                self.join_shared_groups(acc, &groups).await?;
                value
            }
        };
        self.init_account_triggers(acc).await;
        Ok(value)
    }

    /// Writes the parameters' balance fields over the first matching balance,
    /// creating it when none matches
    async fn set_balance_action(&self, acc: &mut Account, a: &Action) -> AppResult<()> {
        if a.tor.is_empty() {
            return Err(AppError::InvalidArgument("missing action tor".into()));
        }
        let query = a.query()?;
        let now = Utc::now();
        let chain = acc.balance_map.entry(a.tor.clone()).or_default();
        let mut found = None;
        for (i, b) in chain.iter().enumerate() {
            if !b.is_expired_at(now) && query.matches(b)? {
                found = Some(i);
                break;
            }
        }
        let previous_groups = found.map(|i| chain[i].shared_groups.clone());
        let i = match found {
            Some(i) => i,
            None => {
                chain.push(Balance {
                    uuid: gen_uuid(),
                    ..Default::default()
                });
                chain.len() - 1
            }
        };
        let template = a.new_balance()?;
        let b = &mut chain[i];
        if template.id == DEFAULT {
            b.id = DEFAULT.to_string();
            b.value = template.value;
        } else {
            a.merge_balance(b)?;
        }
        b.dirty = true;
        let groups = b.shared_groups.clone();
        if previous_groups.as_ref() != Some(&groups) {
            self.join_shared_groups(acc, &groups).await?;
        }
        self.init_account_triggers(acc).await;
        Ok(())
    }

    /// One CDR per top-up or debit sibling, stored and returned
    async fn cdr_log(
        &self,
        acc: &Account,
        a: &Action,
        actions: &[Action],
        group: &ActionGroup,
        outcome: &ActionOutcome,
    ) -> AppResult<Vec<Cdr>> {
        let mut template = default_cdrlog_template();
        if let Some(custom) = a.param("CdrLogTemplate")? {
            let custom: BTreeMap<String, String> = serde_json::from_value(custom)?;
            template.extend(custom);
        }
        let mut cdrs = Vec::new();
        for (idx, sibling) in actions.iter().enumerate() {
            if !LOGGED_ACTIONS.contains(&sibling.action_type.as_str()) {
                continue;
            }
            let balance = sibling.new_balance()?;
            let view = CdrLogView {
                account: acc,
                group: &group.name,
                action: sibling,
                balance: &balance,
                balance_value: outcome.balance_values.get(&idx).copied().unwrap_or_default(),
            };
            let now = Utc::now().to_rfc3339();
            let mut fields: BTreeMap<String, String> = BTreeMap::from([
                (ACCID.to_string(), gen_uuid()),
                (SETUP_TIME.to_string(), now.clone()),
                (ANSWER_TIME.to_string(), now),
                (USAGE.to_string(), "1".to_string()),
                (MEDI_RUNID.to_string(), sibling.action_type.clone()),
                (REQTYPE.to_string(), META_PREPAID.to_string()),
            ]);
            for (field, tpl) in &template {
                fields.insert(field.clone(), view.render(tpl));
            }
            let cost = fields.remove(COST);
            let mut cdr = Cdr::from_fields(&fields, CDRLOG_SOURCE)?;
            if let Some(cost) = cost.and_then(|c| c.parse::<Decimal>().ok()) {
                cdr.cost = cost;
            }
            cdr.rated = true;
            if let Err(e) = self.cdr_storage.set_cdr(&cdr, true).await {
                warn!(unique_id = %cdr.unique_id, error = %e, "could not store cdrlog record");
                return Err(e);
            }
            cdrs.push(cdr);
        }
        Ok(cdrs)
    }

    /// Replaces the destination named by the account's `*ddc` balance with
    /// the destinations seen by the triggering queue
    async fn set_ddc_destinations(&self, target: &mut ActionTarget<'_>, a: &Action) -> AppResult<()> {
        let queue = target
            .queue
            .ok_or_else(|| AppError::InvalidArgument("*set_ddestinations needs a stats queue".into()))?;
        let acc = match target.account.as_deref() {
            Some(acc) => acc.clone(),
            None => {
                let p: AccountParams = serde_json::from_str(&a.params).unwrap_or_default();
                let tenant = if p.tenant.is_empty() { queue.tenant.clone() } else { p.tenant };
                self.accounting.get_account(&tenant, &p.account).await?
            }
        };
        let ddc = acc
            .balance_map
            .values()
            .flat_map(|chain| chain.iter())
            .flat_map(|b| b.destination_ids.keys())
            .find(|d| d.starts_with(DDC_PREFIX))
            .cloned()
            .ok_or(AppError::NotFound)?;
        match self
            .tariff
            .get_destinations(&acc.tenant, "", &ddc, DestStrategy::Exact, CacheMode::Live)
            .await
        {
            Ok(old) => {
                for d in old {
                    self.tariff.remove_destination(&d.tenant, &d.code, &d.name, None).await?;
                }
            }
            Err(AppError::NotFound) => {}
            Err(e) => return Err(e),
        }
        for code in &queue.destinations {
            self.tariff
                .set_destination(&Destination::new(acc.tenant.clone(), code.clone(), ddc.clone()), None)
                .await?;
        }
        info!(destination = %ddc, codes = queue.destinations.len(), "dynamic destination rewritten");
        Ok(())
    }

    /// Performs the request described by rendered `*cgr_rpc` parameters
    async fn cgr_rpc(&self, rendered: &str) -> AppResult<()> {
        #[derive(Deserialize)]
        #[serde(rename_all = "PascalCase")]
        struct Envelope {
            rpc_request: RpcRequest,
        }
        let req = serde_json::from_str::<Envelope>(rendered)
            .map_err(|e| AppError::ParserError(e.to_string()))?
            .rpc_request;
        if req.method.is_empty() {
            return Err(AppError::missing(["Method"]));
        }
        if req.address == META_INTERNAL {
            let reply = self.call(&req.method, req.params).await;
            info!(method = %req.method, ok = reply.is_ok(), "*cgr_rpc internal call");
            return if req.is_async { Ok(()) } else { reply.map(|_| ()) };
        }
        let url = if req.address.starts_with("http") {
            req.address.clone()
        } else {
            format!("http://{}/jsonrpc", req.address)
        };
        let body = json!({ "method": req.method, "params": [req.params], "id": 1 });
        let client = self.http.clone();
        let attempts = req.attempts.max(1);
        let call = async move {
            let mut delays = fib_delays(std::time::Duration::from_millis(500));
            let mut last = AppError::ServerError("no attempt made".into());
            for attempt in 0..attempts {
                if attempt > 0 {
                    if let Some(d) = delays.next() {
                        tokio::time::sleep(d).await;
                    }
                }
                let reply = match client.post(&url).json(&body).send().await {
                    Ok(resp) => resp.json::<Value>().await.map_err(AppError::server),
                    Err(e) => Err(AppError::server(e)),
                };
                match reply {
                    Ok(v) if v.get("error").map_or(true, Value::is_null) => return Ok(v),
                    Ok(v) => return Err(AppError::ServerError(v["error"].to_string())),
                    Err(e) => last = e,
                }
            }
            Err(last)
        };
        if req.is_async {
            let method = req.method.clone();
            tokio::spawn(async move {
                if let Err(e) = call.await {
                    warn!(method = %method, error = %e, "asynchronous *cgr_rpc failed");
                }
            });
            return Ok(());
        }
        call.await.map(|_| ())
    }

    /// Runs an action group against a stored account and saves it
    pub async fn execute_account_actions(&self, tenant: &str, account: &str, actions_id: &str) -> AppResult<ActionOutcome> {
        let group = self.tariff.get_action_group(tenant, actions_id, CacheMode::Cached).await?;
        if account.is_empty() {
            return self.execute_actions(&mut ActionTarget::none(), &group, None).await;
        }
        let keys = self.debit_lock_keys(tenant, account).await?;
        self.guardian
            .guard(&keys, self.lock_timeout(), || async move {
                let mut acc = self
                    .accounting
                    .get_account_opt(tenant, account)
                    .await?
                    .unwrap_or_else(|| Account::new(tenant, account));
                let outcome = self
                    .execute_actions(&mut ActionTarget::account(&mut acc), &group, None)
                    .await?;
                if !outcome.account_removed {
                    self.accounting.set_account(&acc).await?;
                }
                Ok(outcome)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::*;
    use crate::test_fixtures::TENANT;
    use accurate_core::models::{ActionTrigger, ActionTriggerGroup, SharedGroup};
    use accurate_core::utils::consts::VOICE;
    use rust_decimal_macros::dec;

    fn action(action_type: &str, tor: &str, params: &str, filter: &str, weight: f64) -> Action {
        Action {
            action_type: action_type.into(),
            tor: tor.into(),
            params: params.into(),
            filter: filter.into(),
            weight,
            ..Default::default()
        }
    }

    async fn run(engine: &Engine, acc: &mut Account, actions: Vec<Action>) -> AppResult<ActionOutcome> {
        let group = ActionGroup {
            tenant: TENANT.into(),
            name: "TEST_ACTIONS".into(),
            actions,
        };
        engine.execute_actions(&mut ActionTarget::account(acc), &group, None).await
    }

    #[test]
    fn test_render_template() {
        let doc = json!({"Account": {"Name": "dan", "Tenant": "t"}, "Action": {"Weight": 10}});
        let out = render_template(r#"{"Acc":"<< .Account.Name >>","W":<<.Action.Weight>>,"X":"<< .Sq.Name >>"}"#, &doc);
        assert_eq!(out, r#"{"Acc":"dan","W":10,"X":""}"#);
    }

    #[tokio::test]
    async fn test_topup_creates_then_adds() {
        let engine = engine_with_tariffs().await;
        let mut acc = account("dan");
        let topup = action(TOPUP, MONETARY, r#"{"Balance":{"ID":"BONUS","Value":10,"Weight":20}}"#, r#"{"ID":"BONUS"}"#, 0.0);
        run(&engine, &mut acc, vec![topup.clone()]).await.unwrap();
        run(&engine, &mut acc, vec![topup]).await.unwrap();
        let chain = acc.balances(MONETARY);
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].value, dec!(20));
        assert_eq!(chain[0].weight, 20.0);
    }

    #[tokio::test]
    async fn test_reset_and_debit_variants() {
        let engine = engine_with_tariffs().await;
        let mut acc = account("dan");
        acc.balance_map.insert(MONETARY.into(), vec![balance("MONEY", dec!(7), &[], 0.0)]);
        let sel = r#"{"ID":"MONEY"}"#;
        run(&engine, &mut acc, vec![action(TOPUP_RESET, MONETARY, r#"{"Balance":{"Value":5}}"#, sel, 0.0)])
            .await
            .unwrap();
        assert_eq!(acc.balances(MONETARY)[0].value, dec!(5));
        run(&engine, &mut acc, vec![action(DEBIT, MONETARY, r#"{"Balance":{"Value":2}}"#, sel, 0.0)])
            .await
            .unwrap();
        assert_eq!(acc.balances(MONETARY)[0].value, dec!(3));
        run(&engine, &mut acc, vec![action(DEBIT_RESET, MONETARY, r#"{"Balance":{"Value":1}}"#, sel, 0.0)])
            .await
            .unwrap();
        assert_eq!(acc.balances(MONETARY)[0].value, dec!(-1));
    }

    #[tokio::test]
    async fn test_debit_default_creates_negative_default() {
        let engine = engine_with_tariffs().await;
        let mut acc = account("dan");
        run(
            &engine,
            &mut acc,
            vec![action(DEBIT, MONETARY, r#"{"Balance":{"ID":"*default","Value":3,"Weight":50}}"#, r#"{"ID":"none"}"#, 0.0)],
        )
        .await
        .unwrap();
        let b = &acc.balances(MONETARY)[0];
        assert!(b.is_default());
        assert_eq!(b.value, dec!(-3));
        assert_eq!(b.weight, 0.0);
    }

    #[tokio::test]
    async fn test_set_and_remove_balance() {
        let engine = engine_with_tariffs().await;
        let mut acc = account("dan");
        run(
            &engine,
            &mut acc,
            vec![action(SET_BALANCE, VOICE, r#"{"Balance":{"ID":"NAT_MIN","Value":60,"DestinationIDs":{"NAT":true}}}"#, r#"{"ID":"NAT_MIN"}"#, 0.0)],
        )
        .await
        .unwrap();
        let b = &acc.balances(VOICE)[0];
        assert_eq!(b.value, dec!(60));
        assert!(b.destination_ids.has("NAT"));
        assert!(!b.uuid.is_empty());

        run(&engine, &mut acc, vec![action(REMOVE_BALANCE, VOICE, "", r#"{"ID":"NAT_MIN"}"#, 0.0)])
            .await
            .unwrap();
        assert!(acc.balances(VOICE).is_empty());
        let again = run(&engine, &mut acc, vec![action(REMOVE_BALANCE, VOICE, "", r#"{"ID":"NAT_MIN"}"#, 0.0)]).await;
        assert!(matches!(again, Err(AppError::NotFound)));
    }

    #[tokio::test]
    async fn test_transfer_monetary_default() {
        let engine = engine_with_tariffs().await;
        let mut acc = account("dan");
        let mut default = Balance::new_default();
        default.value = dec!(1);
        acc.balance_map.insert(
            MONETARY.into(),
            vec![default, balance("B1", dec!(2), &[], 0.0), balance("B2", dec!(3), &[], 0.0)],
        );
        run(&engine, &mut acc, vec![action(TRANSFER_MONETARY_DEFAULT, MONETARY, "", "", 0.0)])
            .await
            .unwrap();
        let values: Vec<Decimal> = acc.balances(MONETARY).iter().map(|b| b.value).collect();
        assert_eq!(values, vec![dec!(6), dec!(0), dec!(0)]);
    }

    #[tokio::test]
    async fn test_exec_filter_and_weights() {
        let engine = engine_with_tariffs().await;
        let mut acc = account("dan");
        acc.balance_map.insert(MONETARY.into(), vec![balance("MONEY", dec!(10), &[], 0.0)]);
        let mut guarded = action(DISABLE_ACCOUNT, "", "", "", 10.0);
        guarded.exec_filter = r#"{"Value":{"$lt":5}}"#.into();
        run(&engine, &mut acc, vec![guarded.clone(), action(ALLOW_NEGATIVE, "", "", "", 20.0)])
            .await
            .unwrap();
        assert!(acc.allow_negative);
        assert!(!acc.disabled);

        acc.balance_map.get_mut(MONETARY).unwrap()[0].value = dec!(1);
        run(&engine, &mut acc, vec![guarded]).await.unwrap();
        assert!(acc.disabled);
    }

    #[tokio::test]
    async fn test_unknown_action_fails() {
        let engine = engine_with_tariffs().await;
        let mut acc = account("dan");
        let out = run(&engine, &mut acc, vec![action("*explode", "", "", "", 0.0)]).await;
        assert!(matches!(out, Err(AppError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_cdrlog_records_siblings() {
        let engine = engine_with_tariffs().await;
        let mut acc = account("dan");
        let out = run(
            &engine,
            &mut acc,
            vec![
                action(TOPUP, MONETARY, r#"{"Balance":{"ID":"BONUS","Value":5}}"#, r#"{"ID":"BONUS"}"#, 20.0),
                action(CDRLOG, "", r#"{"CdrLogTemplate":{"Subject":"^topups"}}"#, "", 10.0),
            ],
        )
        .await
        .unwrap();
        assert_eq!(out.cdrs.len(), 1);
        let cdr = &out.cdrs[0];
        assert_eq!(cdr.run_id, TOPUP);
        assert_eq!(cdr.tor, MONETARY);
        assert_eq!(cdr.account, "dan");
        assert_eq!(cdr.subject, "topups");
        assert_eq!(cdr.source, CDRLOG_SOURCE);
        assert_eq!(cdr.cost, dec!(5));
        assert_eq!(cdr.origin_host, "127.0.0.1");
    }

    #[tokio::test]
    async fn test_remove_account() {
        let engine = engine_with_tariffs().await;
        let mut acc = account("gone");
        engine.accounting.set_account(&acc).await.unwrap();
        let out = run(&engine, &mut acc, vec![action(REMOVE_ACCOUNT, "", "", "", 0.0), action(ALLOW_NEGATIVE, "", "", "", -1.0)])
            .await
            .unwrap();
        assert!(out.account_removed);
        assert!(!acc.allow_negative);
        assert!(engine.accounting.get_account_opt(TENANT, "gone").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_topup_joins_shared_group() {
        let engine = engine_with_tariffs().await;
        shared_group(&engine, "SG1", "*highest", &[]).await;
        let mut acc = account("dan");
        run(
            &engine,
            &mut acc,
            vec![action(TOPUP, MONETARY, r#"{"Balance":{"ID":"POOL","Value":5,"SharedGroups":{"SG1":true}}}"#, r#"{"ID":"POOL"}"#, 0.0)],
        )
        .await
        .unwrap();
        let sg: SharedGroup = engine.tariff.get_shared_group(TENANT, "SG1", CacheMode::Live).await.unwrap();
        assert!(sg.member_ids.has(&acc.full_id()));
    }

    #[tokio::test]
    async fn test_topup_runs_triggers() {
        let engine = engine_with_tariffs().await;
        let atg = ActionTriggerGroup {
            tenant: TENANT.into(),
            name: "RICH".into(),
            action_triggers: vec![ActionTrigger {
                unique_id: "rich".into(),
                threshold_type: accurate_core::models::trigger::TRIGGER_MAX_BALANCE.into(),
                threshold_value: dec!(100),
                tor: MONETARY.into(),
                actions_id: "AG_DISABLE".into(),
                ..Default::default()
            }],
        };
        engine.tariff.set_action_trigger_group(&atg, None).await.unwrap();
        let ag = ActionGroup {
            tenant: TENANT.into(),
            name: "AG_DISABLE".into(),
            actions: vec![action(DISABLE_ACCOUNT, "", "", "", 0.0)],
        };
        engine.tariff.set_action_group(&ag, None).await.unwrap();

        let mut acc = account("dan");
        acc.trigger_ids = StringMap::from_items(["RICH"]);
        run(&engine, &mut acc, vec![action(TOPUP, MONETARY, r#"{"Balance":{"ID":"M","Value":150}}"#, r#"{"ID":"M"}"#, 0.0)])
            .await
            .unwrap();
        assert!(acc.disabled);
        assert!(acc.trigger_records["rich"].executed);
    }

    #[tokio::test]
    async fn test_execute_account_actions_saves() {
        let engine = engine_with_tariffs().await;
        let ag = ActionGroup {
            tenant: TENANT.into(),
            name: "AG_TOPUP".into(),
            actions: vec![action(TOPUP, MONETARY, r#"{"Balance":{"ID":"M","Value":3}}"#, r#"{"ID":"M"}"#, 0.0)],
        };
        engine.tariff.set_action_group(&ag, None).await.unwrap();
        engine.execute_account_actions(TENANT, "fresh", "AG_TOPUP").await.unwrap();
        let acc = engine.accounting.get_account(TENANT, "fresh").await.unwrap();
        assert_eq!(acc.balances(MONETARY)[0].value, dec!(3));
    }
}
