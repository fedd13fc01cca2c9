//! In-process CDR store, used when no PostgreSQL URL is configured

use std::sync::atomic::{AtomicI64, Ordering};

use accurate_core::models::{Cdr, CdrsFilter, SmCost};
use accurate_core::traits::CdrStorage;
use accurate_core::{AppError, AppResult};
use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

#[derive(Default)]
pub struct MemoryCdrStore {
    cdrs: RwLock<Vec<Cdr>>,
    sm_costs: RwLock<Vec<SmCost>>,
    order: AtomicI64,
}

impl MemoryCdrStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CdrStorage for MemoryCdrStore {
    async fn set_cdr(&self, cdr: &Cdr, allow_update: bool) -> AppResult<()> {
        let mut cdrs = self.cdrs.write();
        let existing = cdrs
            .iter()
            .position(|c| c.unique_id == cdr.unique_id && c.run_id == cdr.run_id);
        match existing {
            Some(_) if !allow_update => Err(AppError::Exists),
            Some(idx) => {
                let order_id = cdrs[idx].order_id;
                cdrs[idx] = cdr.clone();
                cdrs[idx].order_id = order_id;
                Ok(())
            }
            None => {
                let mut cdr = cdr.clone();
                cdr.order_id = self.order.fetch_add(1, Ordering::SeqCst) + 1;
                debug!(unique_id = %cdr.unique_id, run_id = %cdr.run_id, "cdr stored");
                cdrs.push(cdr);
                Ok(())
            }
        }
    }

    async fn set_sm_cost(&self, cost: &SmCost) -> AppResult<()> {
        let mut costs = self.sm_costs.write();
        costs.retain(|c| !(c.unique_id == cost.unique_id && c.run_id == cost.run_id));
        costs.push(cost.clone());
        Ok(())
    }

    async fn get_sm_costs(
        &self,
        unique_id: &str,
        run_id: &str,
        origin_host: &str,
        origin_id_prefix: &str,
    ) -> AppResult<Vec<SmCost>> {
        Ok(self
            .sm_costs
            .read()
            .iter()
            .filter(|c| unique_id.is_empty() || c.unique_id == unique_id)
            .filter(|c| run_id.is_empty() || c.run_id == run_id)
            .filter(|c| origin_host.is_empty() || c.origin_host == origin_host)
            .filter(|c| c.origin_id.starts_with(origin_id_prefix))
            .cloned()
            .collect())
    }

    async fn get_cdrs(&self, filter: &CdrsFilter, remove: bool) -> AppResult<(Vec<Cdr>, usize)> {
        if remove {
            let mut cdrs = self.cdrs.write();
            let mut removed = Vec::new();
            let mut kept = Vec::with_capacity(cdrs.len());
            for cdr in cdrs.drain(..) {
                if filter.matches(&cdr)? {
                    removed.push(cdr);
                } else {
                    kept.push(cdr);
                }
            }
            *cdrs = kept;
            let n = removed.len();
            return Ok((Vec::new(), n));
        }
        let cdrs = self.cdrs.read();
        let mut matched = Vec::new();
        for cdr in cdrs.iter() {
            if filter.matches(cdr)? {
                matched.push(cdr.clone());
            }
        }
        let total = matched.len();
        let page = matched
            .into_iter()
            .skip(filter.offset.unwrap_or(0))
            .take(filter.limit.unwrap_or(usize::MAX))
            .collect();
        Ok((page, total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn cdr(id: &str, run: &str) -> Cdr {
        Cdr {
            unique_id: id.into(),
            run_id: run.into(),
            tenant: "cgrates.org".into(),
            account: "1001".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_unique_per_run() {
        let s = MemoryCdrStore::new();
        s.set_cdr(&cdr("a", "*raw"), false).await.unwrap();
        s.set_cdr(&cdr("a", "*default"), false).await.unwrap();
        assert_eq!(s.set_cdr(&cdr("a", "*raw"), false).await, Err(AppError::Exists));

        let mut rated = cdr("a", "*default");
        rated.cost = dec!(1.5);
        s.set_cdr(&rated, true).await.unwrap();
        let (found, total) = s
            .get_cdrs(
                &CdrsFilter {
                    run_ids: vec!["*default".into()],
                    ..Default::default()
                },
                false,
            )
            .await
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(found[0].cost, dec!(1.5));
        assert_eq!(found[0].order_id, 2);
    }

    #[tokio::test]
    async fn test_paging_and_remove() {
        let s = MemoryCdrStore::new();
        for i in 0..5 {
            s.set_cdr(&cdr(&i.to_string(), "*raw"), false).await.unwrap();
        }
        let filter = CdrsFilter {
            offset: Some(1),
            limit: Some(2),
            ..Default::default()
        };
        let (page, total) = s.get_cdrs(&filter, false).await.unwrap();
        assert_eq!(total, 5);
        assert_eq!(page.iter().map(|c| c.unique_id.as_str()).collect::<Vec<_>>(), vec!["1", "2"]);

        let doomed = CdrsFilter {
            unique_ids: vec!["0".into(), "4".into()],
            ..Default::default()
        };
        assert_eq!(s.get_cdrs(&doomed, true).await.unwrap().1, 2);
        assert_eq!(s.get_cdrs(&CdrsFilter::default(), false).await.unwrap().1, 3);
    }

    #[tokio::test]
    async fn test_sm_costs_by_origin_prefix() {
        let s = MemoryCdrStore::new();
        for (uid, origin) in [("u1", "abc-1"), ("u2", "abc-2"), ("u3", "xyz")] {
            s.set_sm_cost(&SmCost {
                unique_id: uid.into(),
                run_id: "*default".into(),
                origin_host: "h".into(),
                origin_id: origin.into(),
                ..Default::default()
            })
            .await
            .unwrap();
        }
        assert_eq!(s.get_sm_costs("", "", "h", "abc").await.unwrap().len(), 2);
        assert_eq!(s.get_sm_costs("u3", "*default", "", "").await.unwrap().len(), 1);
    }
}
