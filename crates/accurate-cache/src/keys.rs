//! Storage and cache key prefixes for Accurate
//!
//! Every key starts with a four character family prefix, so the in-process
//! cache can keep one LRU per family and prefix scans enumerate one family.
//!
//! # Example
//!
//! ```
//! use accurate_cache::keys;
//!
//! let key = keys::account_key("cgrates.org", "dan");
//! assert_eq!(key, "acc_cgrates.org:dan");
//! ```

pub const DESTINATION_PREFIX: &str = "dst_";
pub const REVERSE_DESTINATION_PREFIX: &str = "rds_";
pub const DESTINATION_RESULT_PREFIX: &str = "dsr_";
pub const RATING_PLAN_PREFIX: &str = "rpl_";
pub const RATING_PROFILE_PREFIX: &str = "rpf_";
pub const ACTION_PREFIX: &str = "act_";
pub const ACTION_PLAN_PREFIX: &str = "apl_";
pub const ACTION_PLAN_BINDING_PREFIX: &str = "apb_";
pub const ACTION_TRIGGER_PREFIX: &str = "atr_";
pub const TASK_PREFIX: &str = "tsk_";
pub const SHARED_GROUP_PREFIX: &str = "shg_";
pub const ACCOUNT_PREFIX: &str = "acc_";
pub const SIMPLE_ACCOUNT_PREFIX: &str = "sac_";
pub const LCR_PREFIX: &str = "lcr_";
pub const DERIVED_CHARGERS_PREFIX: &str = "dcs_";
pub const ALIASES_PREFIX: &str = "als_";
pub const REVERSE_ALIASES_PREFIX: &str = "rls_";
pub const USERS_PREFIX: &str = "usr_";
pub const CDR_STATS_PREFIX: &str = "cst_";
pub const STATS_QUEUE_PREFIX: &str = "stq_";
pub const LOAD_HISTORY_KEY: &str = "lhs_load_history";
pub const VERSIONS_KEY: &str = "ver_versions";

/// Response cache prefixes for deduplicated RPC replies
pub const MAX_DEBIT_CACHE_PREFIX: &str = "MAX_DEBIT_";
pub const GET_DERIVED_MAX_SESSION_TIME_CACHE_PREFIX: &str = "GET_DERIVED_MAX_SESSION_TIME_";
pub const GET_SESSION_RUNS_CACHE_PREFIX: &str = "GET_SESSION_RUNS_";
pub const LCR_CACHE_PREFIX: &str = "LCR_";
pub const PROCESS_CDR_CACHE_PREFIX: &str = "V1ProcessCDR";
pub const STORE_SM_COST_CACHE_PREFIX: &str = "V1StoreSMCost";
pub const DEBIT_CACHE_PREFIX: &str = "DEBIT_";
pub const REFUND_INCR_CACHE_PREFIX: &str = "REFUND_INCR_";
pub const REFUND_ROUND_CACHE_PREFIX: &str = "REFUND_ROUND_";

/// Number of leading characters naming the family of a key
pub const PREFIX_LEN: usize = 4;

/// Splits a key into its family prefix and the rest
pub fn split_key(key: &str) -> (&str, &str) {
    match key.get(..PREFIX_LEN) {
        Some(prefix) => (prefix, &key[PREFIX_LEN..]),
        None => (key, ""),
    }
}

fn join(prefix: &str, parts: &[&str]) -> String {
    format!("{}{}", prefix, parts.join(":"))
}

pub fn destination_key(tenant: &str, code: &str, name: &str) -> String {
    join(DESTINATION_PREFIX, &[tenant, code, name])
}

/// Index from a dialled code to the destination names holding it
pub fn reverse_destination_key(tenant: &str, code: &str) -> String {
    join(REVERSE_DESTINATION_PREFIX, &[tenant, code])
}

/// Resolved destination list for one lookup; `strategy` tags how it matched
pub fn destination_result_key(tenant: &str, code: &str, name: &str, strategy: &str) -> String {
    join(DESTINATION_RESULT_PREFIX, &[tenant, strategy, code, name])
}

pub fn rating_plan_key(tenant: &str, name: &str) -> String {
    join(RATING_PLAN_PREFIX, &[tenant, name])
}

pub fn rating_profile_key(direction: &str, tenant: &str, category: &str, subject: &str) -> String {
    join(RATING_PROFILE_PREFIX, &[direction, tenant, category, subject])
}

pub fn action_group_key(tenant: &str, name: &str) -> String {
    join(ACTION_PREFIX, &[tenant, name])
}

pub fn action_plan_key(tenant: &str, name: &str) -> String {
    join(ACTION_PLAN_PREFIX, &[tenant, name])
}

pub fn action_plan_binding_key(tenant: &str, account: &str, plan: &str) -> String {
    join(ACTION_PLAN_BINDING_PREFIX, &[tenant, account, plan])
}

pub fn action_trigger_key(tenant: &str, name: &str) -> String {
    join(ACTION_TRIGGER_PREFIX, &[tenant, name])
}

pub fn task_key(uuid: &str) -> String {
    join(TASK_PREFIX, &[uuid])
}

pub fn shared_group_key(tenant: &str, name: &str) -> String {
    join(SHARED_GROUP_PREFIX, &[tenant, name])
}

pub fn account_key(tenant: &str, name: &str) -> String {
    join(ACCOUNT_PREFIX, &[tenant, name])
}

pub fn simple_account_key(tenant: &str, name: &str) -> String {
    join(SIMPLE_ACCOUNT_PREFIX, &[tenant, name])
}

pub fn lcr_key(direction: &str, tenant: &str, category: &str, account: &str, subject: &str) -> String {
    join(LCR_PREFIX, &[direction, tenant, category, account, subject])
}

pub fn derived_chargers_key(
    direction: &str,
    tenant: &str,
    category: &str,
    account: &str,
    subject: &str,
) -> String {
    join(DERIVED_CHARGERS_PREFIX, &[direction, tenant, category, account, subject])
}

/// `full_id` is the alias id without tenant
pub fn alias_key(tenant: &str, full_id: &str) -> String {
    join(ALIASES_PREFIX, &[tenant, full_id])
}

/// `reverse_id` is `context:target:alias`
pub fn reverse_alias_key(tenant: &str, reverse_id: &str) -> String {
    join(REVERSE_ALIASES_PREFIX, &[tenant, reverse_id])
}

pub fn user_key(tenant: &str, name: &str) -> String {
    join(USERS_PREFIX, &[tenant, name])
}

pub fn cdr_stats_key(tenant: &str, name: &str) -> String {
    join(CDR_STATS_PREFIX, &[tenant, name])
}

pub fn stats_queue_key(tenant: &str, name: &str) -> String {
    join(STATS_QUEUE_PREFIX, &[tenant, name])
}
