//! RPC method table
//!
//! Every service reachable over `/jsonrpc` (and from `*cgr_rpc` actions
//! addressed to `*internal`) is dispatched here by its `Service.Method` name.

use accurate_core::models::{
    AttrAddAlias, AttrAlias, AttrDerivedChargers, AttrGetUsers, AttrReverseAlias, AttrStatsQueueDisable,
    AttrStatsQueueId, AttrStatsQueueIds, Alias, CallDescriptor, Cdr, CdrStats, CdrsFilter, LcrRequest, UserProfile,
};
use accurate_core::{AppError, AppResult};
use chrono::Duration;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::cdrs::{AttrRateCdrs, AttrStoreSmCost};
use crate::simple_accounts::{AttrNewSimpleAccount, AttrSimpleAccountValue};
use crate::Engine;

pub const OK: &str = "OK";

/// Account reference of the account-level methods
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct AttrAccount {
    tenant: String,
    #[serde(alias = "Name")]
    account: String,
    #[serde(rename = "ActionsID")]
    actions_id: String,
}

/// JSON-RPC clients send the argument wrapped in a one element array
fn unwrap_params(params: Value) -> Value {
    match params {
        Value::Array(mut items) if items.len() == 1 => items.remove(0),
        other => other,
    }
}

fn args<T: DeserializeOwned>(params: Value) -> AppResult<T> {
    serde_json::from_value(params).map_err(|e| AppError::InvalidArgument(e.to_string()))
}

fn reply<T: Serialize>(value: T) -> AppResult<Value> {
    Ok(serde_json::to_value(value)?)
}

fn ok() -> AppResult<Value> {
    Ok(Value::String(OK.to_string()))
}

/// Nanoseconds, `-1` standing for unlimited
fn duration_reply(d: Option<Duration>) -> AppResult<Value> {
    reply(d.and_then(|d| d.num_nanoseconds()).unwrap_or(-1))
}

impl Engine {
    /// Invokes `method` with JSON `params`, replying with JSON
    pub fn call<'a>(&'a self, method: &'a str, params: Value) -> BoxFuture<'a, AppResult<Value>> {
        Box::pin(async move {
            debug!(method, "rpc call");
            self.dispatch(method, unwrap_params(params)).await
        })
    }

    async fn dispatch(&self, method: &str, params: Value) -> AppResult<Value> {
        match method {
            // ==================== Responder ====================
            "Responder.GetCost" => {
                let mut cd: CallDescriptor = args(params)?;
                self.prepare_descriptor(&mut cd).await?;
                reply(self.get_cost(&mut cd).await?)
            }
            "Responder.Debit" => {
                let mut cd: CallDescriptor = args(params)?;
                self.prepare_descriptor(&mut cd).await?;
                reply(self.debit(&mut cd).await?)
            }
            "Responder.MaxDebit" => {
                let mut cd: CallDescriptor = args(params)?;
                self.prepare_descriptor(&mut cd).await?;
                reply(self.max_debit(&mut cd).await?)
            }
            "Responder.RefundIncrements" => {
                let mut cd: CallDescriptor = args(params)?;
                self.prepare_descriptor(&mut cd).await?;
                self.refund_increments(&mut cd).await?;
                ok()
            }
            "Responder.RefundRounding" => {
                let mut cd: CallDescriptor = args(params)?;
                self.prepare_descriptor(&mut cd).await?;
                self.refund_rounding(&mut cd).await?;
                ok()
            }
            "Responder.GetMaxSessionTime" => {
                let mut cd: CallDescriptor = args(params)?;
                self.prepare_descriptor(&mut cd).await?;
                duration_reply(self.get_max_session_time(&mut cd).await?)
            }
            "Responder.GetDerivedMaxSessionTime" => {
                duration_reply(self.get_derived_max_session_time(args::<Cdr>(params)?).await?)
            }
            "Responder.GetSessionRuns" => reply(self.get_session_runs(args::<Cdr>(params)?).await?),
            "Responder.GetDerivedChargers" => {
                reply(self.get_derived_chargers(&args::<AttrDerivedChargers>(params)?).await?)
            }
            "Responder.GetLCR" => reply(self.get_lcr(&args::<LcrRequest>(params)?).await?),
            "Responder.Status" => reply(self.status()),
            "Responder.Shutdown" => {
                self.shutdown();
                reply("Done!")
            }

            // ==================== CDRs ====================
            "CDRSv1.ProcessCDR" => {
                self.process_cdr(args::<Cdr>(params)?).await?;
                ok()
            }
            "CDRSv1.StoreSMCost" => {
                self.store_sm_cost(args::<AttrStoreSmCost>(params)?).await?;
                ok()
            }
            "CDRSv1.RateCDRs" => {
                self.rate_cdrs(&args::<AttrRateCdrs>(params)?).await?;
                ok()
            }
            "CDRSv1.GetCDRs" => reply(self.get_cdrs(&args::<CdrsFilter>(params)?).await?.0),
            "CDRSv1.CountCDRs" => reply(self.get_cdrs(&args::<CdrsFilter>(params)?).await?.1),

            // ==================== Aliases ====================
            "AliasesV1.SetAlias" => {
                self.set_alias(args::<AttrAddAlias>(params)?).await?;
                ok()
            }
            "AliasesV1.GetAlias" => reply(self.get_alias(&args::<Alias>(params)?).await?),
            "AliasesV1.RemoveAlias" => {
                self.remove_alias(&args::<Alias>(params)?).await?;
                ok()
            }
            "AliasesV1.GetReverseAlias" => reply(self.get_reverse_alias(&args::<AttrReverseAlias>(params)?).await?),
            "AliasesV1.GetMatchingAlias" => reply(self.get_matching_alias(&args::<AttrAlias>(params)?).await?),

            // ==================== Users ====================
            "UsersV1.SetUser" => {
                self.set_user(args::<UserProfile>(params)?).await?;
                ok()
            }
            "UsersV1.UpdateUser" => {
                self.update_user(args::<UserProfile>(params)?).await?;
                ok()
            }
            "UsersV1.RemoveUser" => {
                let up: UserProfile = args(params)?;
                self.remove_user(&up.tenant, &up.name).await?;
                ok()
            }
            "UsersV1.GetUsers" => reply(self.get_users(&args::<AttrGetUsers>(params)?)?),
            "UsersV1.AddIndex" => {
                self.add_user_index(&args::<Vec<String>>(params)?);
                ok()
            }
            "UsersV1.GetIndexes" => reply(self.user_indexes()),
            "UsersV1.ReloadUsers" => {
                let tenant: Option<String> = args(params)?;
                reply(self.reload_users(tenant.as_deref().unwrap_or("")).await?)
            }

            // ==================== Stats ====================
            "CDRStatsV1.AddQueue" => {
                self.add_stats_queue(args::<CdrStats>(params)?).await?;
                ok()
            }
            "CDRStatsV1.AppendCDR" => {
                self.append_stats_cdr(&args::<Cdr>(params)?).await?;
                ok()
            }
            "CDRStatsV1.GetMetrics" => reply(self.get_stats_metrics(&args::<AttrStatsQueueId>(params)?).await?),
            "CDRStatsV1.GetQueue" => reply(self.get_stats_queue(&args::<AttrStatsQueueId>(params)?).await?),
            "CDRStatsV1.GetQueueIDs" => {
                let tenant: Option<String> = args(params)?;
                let tenant = tenant.unwrap_or_else(|| self.cfg.general.default_tenant.clone());
                reply(self.get_stats_queue_ids(&tenant))
            }
            "CDRStatsV1.ResetQueues" => {
                self.reset_stats_queues(&args::<AttrStatsQueueIds>(params)?).await?;
                ok()
            }
            "CDRStatsV1.ReloadQueues" => {
                self.reload_stats_queues(&args::<AttrStatsQueueIds>(params)?).await?;
                ok()
            }
            "CDRStatsV1.RemoveQueue" => {
                self.remove_stats_queues(&args::<AttrStatsQueueIds>(params)?).await?;
                ok()
            }
            "CDRStatsV1.DisableQueue" => {
                self.disable_stats_queue(&args::<AttrStatsQueueDisable>(params)?).await?;
                ok()
            }

            // ==================== Simple accounts ====================
            "SimpleAccounts.New" => {
                self.new_simple_account(args::<AttrNewSimpleAccount>(params)?).await?;
                ok()
            }
            "SimpleAccounts.Get" => {
                let attr: AttrAccount = args(params)?;
                reply(self.get_simple_account(&attr.tenant, &attr.account).await?)
            }
            "SimpleAccounts.Set" => {
                self.set_simple_account_value(&args::<AttrSimpleAccountValue>(params)?).await?;
                ok()
            }
            "SimpleAccounts.Debit" => {
                self.debit_simple_account(&args::<AttrSimpleAccountValue>(params)?).await?;
                ok()
            }
            "SimpleAccounts.Remove" => {
                let attr: AttrAccount = args(params)?;
                self.remove_simple_account(&attr.tenant, &attr.account).await?;
                ok()
            }

            // ==================== Accounts ====================
            "ApierV1.GetAccount" => {
                let attr: AttrAccount = args(params)?;
                reply(self.accounting.get_account(&attr.tenant, &attr.account).await?)
            }
            "ApierV1.ExecuteAction" => {
                let attr: AttrAccount = args(params)?;
                if attr.actions_id.is_empty() {
                    return Err(AppError::missing(["ActionsID"]));
                }
                self.execute_account_actions(&attr.tenant, &attr.account, &attr.actions_id)
                    .await?;
                ok()
            }

            other => Err(AppError::ServerError(format!("rpc: can't find method {}", other))),
        }
    }

    /// Instance identity, uptime and in-memory counts
    pub fn status(&self) -> Value {
        json!({
            "NodeID": self.cfg.general.node_id,
            "Version": env!("CARGO_PKG_VERSION"),
            "Uptime": format!("{}s", self.uptime().as_secs()),
            "ShuttingDown": self.is_shutting_down(),
            "StatsQueues": self.stats.len(),
            "Users": self.users.len(),
            "ActiveLocks": self.guardian.active_keys(),
            "CachedReplies": self.responses.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::*;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::str::FromStr;

    fn cd_params(account: &str, secs: i64) -> Value {
        serde_json::to_value(descriptor(account, "0723045326", secs)).unwrap()
    }

    #[tokio::test]
    async fn test_get_cost_and_debit() {
        let engine = engine_with_tariffs().await;
        funded(&engine, "dan", dec!(10)).await;

        let cc = engine.call("Responder.GetCost", json!([cd_params("dan", 60)])).await.unwrap();
        assert_eq!(Decimal::from_str(cc["Cost"].as_str().unwrap()).unwrap(), dec!(0.6));

        engine.call("Responder.Debit", cd_params("dan", 60)).await.unwrap();
        assert_eq!(money(&engine, "dan").await, dec!(9.4));
    }

    #[tokio::test]
    async fn test_unlimited_session_is_minus_one() {
        let engine = engine_with_tariffs().await;
        let ev = json!({
            "UniqueID": "s1",
            "RequestType": "*postpaid",
            "Direction": "*out",
            "Tenant": TENANT,
            "Category": "call",
            "Account": "dan",
            "Subject": "dan",
            "Destination": "0723045326",
            "SetupTime": call_start().to_rfc3339(),
            "Usage": 60_000_000_000i64,
        });
        funded(&engine, "dan", dec!(10)).await;
        let max = engine.call("Responder.GetDerivedMaxSessionTime", ev).await.unwrap();
        assert_eq!(max, json!(-1));
    }

    #[tokio::test]
    async fn test_status_and_unknown_method() {
        let engine = engine_with_tariffs().await;
        let status = engine.call("Responder.Status", Value::Null).await.unwrap();
        assert_eq!(status["NodeID"], json!(engine.config().general.node_id));
        assert!(matches!(
            engine.call("Nope.Method", Value::Null).await,
            Err(AppError::ServerError(_))
        ));
    }

    #[tokio::test]
    async fn test_bad_params() {
        let engine = engine_with_tariffs().await;
        assert!(matches!(
            engine.call("CDRStatsV1.GetMetrics", json!("oops")).await,
            Err(AppError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_simple_account_round_trip() {
        let engine = engine_with_tariffs().await;
        engine
            .call("SimpleAccounts.New", json!({"Tenant": TENANT, "Name": "sa"}))
            .await
            .unwrap();
        engine
            .call(
                "SimpleAccounts.Set",
                json!({"Tenant": TENANT, "Name": "sa", "Category": "call", "Value": "3"}),
            )
            .await
            .unwrap();
        let sa = engine
            .call("SimpleAccounts.Get", json!({"Tenant": TENANT, "Name": "sa"}))
            .await
            .unwrap();
        assert_eq!(sa["Tenant"], json!(TENANT));
        engine
            .call("SimpleAccounts.Remove", json!({"Tenant": TENANT, "Name": "sa"}))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown() {
        let engine = engine_with_tariffs().await;
        assert_eq!(engine.call("Responder.Shutdown", Value::Null).await.unwrap(), json!("Done!"));
        assert!(engine.is_shutting_down());
    }
}
