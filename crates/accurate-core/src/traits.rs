//! Storage and collaborator traits
//!
//! The engine talks to persistence only through these abstractions.

use async_trait::async_trait;

use crate::models::{Cdr, CdrsFilter, SmCost};
use crate::AppResult;

/// Flat key/value store backing the tariff plan and accounting stores
///
/// Values are JSON documents. Keys carry a short family prefix followed by
/// the entity id, so prefix scans enumerate one family.
#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn get(&self, key: &str) -> AppResult<Option<String>>;

    async fn set(&self, key: &str, value: String) -> AppResult<()>;

    /// Returns whether the key existed
    async fn remove(&self, key: &str) -> AppResult<bool>;

    /// Keys starting with `prefix`, sorted
    async fn keys(&self, prefix: &str) -> AppResult<Vec<String>>;

    /// Removes every key starting with `prefix`, returning how many went away
    async fn remove_prefix(&self, prefix: &str) -> AppResult<usize>;

    async fn count(&self, prefix: &str) -> AppResult<usize> {
        Ok(self.keys(prefix).await?.len())
    }
}

/// Rated and raw CDRs plus session manager costs
#[async_trait]
pub trait CdrStorage: Send + Sync {
    /// Inserts a CDR; with `allow_update` an existing (UniqueID, RunID)
    /// record is replaced, otherwise it is refused with `EXISTS`
    async fn set_cdr(&self, cdr: &Cdr, allow_update: bool) -> AppResult<()>;

    async fn set_sm_cost(&self, cost: &SmCost) -> AppResult<()>;

    /// Costs matching the non-empty criteria; `origin_id_prefix` matches the
    /// start of the origin id
    async fn get_sm_costs(
        &self,
        unique_id: &str,
        run_id: &str,
        origin_host: &str,
        origin_id_prefix: &str,
    ) -> AppResult<Vec<SmCost>>;

    /// Matching CDRs and their total count before paging; with `remove` the
    /// matches are deleted instead of returned
    async fn get_cdrs(&self, filter: &CdrsFilter, remove: bool) -> AppResult<(Vec<Cdr>, usize)>;
}

/// External tax computation applied to rated CDRs
#[async_trait]
pub trait TaxCollaborator: Send + Sync {
    fn name(&self) -> &str;

    async fn apply(&self, cdr: &mut Cdr) -> AppResult<()>;
}
