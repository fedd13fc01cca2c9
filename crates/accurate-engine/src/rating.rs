//! Rating plan lookup and pricing of call descriptors
//!
//! The subject's rating profile (longest subject prefix wins) yields the
//! activations covering the call. Each activation's plan is matched against
//! the destination; gaps are filled from the fallback keys of the activation
//! and, as a last resort, from the `*any` subject.

use std::sync::Arc;

use accurate_core::models::{CallCost, CallDescriptor, RatingInfo, TimeSpan};
use accurate_core::utils::consts::{ANY, FALLBACK_SEP, OUT, VOICE};
use accurate_core::{AppError, AppResult};
use accurate_db::CacheMode;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tracing::{debug, instrument, warn};

use crate::Engine;

/// Fallback chains deeper than this are cut
const RECURSION_MAX_DEPTH: usize = 3;

/// Identity of a rating profile
#[derive(Debug, Clone, PartialEq)]
struct ProfileKey {
    direction: String,
    tenant: String,
    category: String,
    subject: String,
}

impl ProfileKey {
    fn for_subject(cd: &CallDescriptor, subject: &str) -> Self {
        Self {
            direction: cd.direction.clone(),
            tenant: cd.tenant.clone(),
            category: cd.category.clone(),
            subject: subject.to_string(),
        }
    }

    /// "dir:tenant:category:subject" or a bare subject inheriting the rest
    fn parse(raw: &str, parent: &ProfileKey) -> Self {
        let parts: Vec<&str> = raw.split(':').collect();
        if parts.len() == 4 {
            return Self {
                direction: parts[0].to_string(),
                tenant: parts[1].to_string(),
                category: parts[2].to_string(),
                subject: parts[3].to_string(),
            };
        }
        Self {
            subject: raw.to_string(),
            ..parent.clone()
        }
    }

    fn with_subject(&self, subject: &str) -> Self {
        Self {
            subject: subject.to_string(),
            ..self.clone()
        }
    }

    fn as_key(&self) -> String {
        format!("{}:{}:{}:{}", self.direction, self.tenant, self.category, self.subject)
    }
}

/// Keeps the part of `infos` applying from `from` until `until`, the first
/// one starting exactly at `from`
fn clip_infos(mut infos: Vec<RatingInfo>, from: DateTime<Utc>, until: Option<DateTime<Utc>>) -> Vec<RatingInfo> {
    infos.sort_by_key(|ri| ri.activation_time);
    if let Some(until) = until {
        infos.retain(|ri| ri.activation_time < until);
    }
    if let Some(last_before) = infos.iter().rposition(|ri| ri.activation_time <= from) {
        infos.drain(..last_before);
        if let Some(first) = infos.first_mut() {
            first.activation_time = from;
        }
    }
    infos
}

/// Every moment of the call is backed by rate intervals
fn continuous(infos: &[RatingInfo], start: DateTime<Utc>) -> bool {
    match infos.first() {
        Some(first) if first.activation_time <= start => {
            infos.iter().all(|ri| !ri.rate_intervals.is_empty())
        }
        _ => false,
    }
}

impl Engine {
    /// Fills in defaults the rest of the pipeline relies on
    pub(crate) fn normalize_descriptor(&self, cd: &mut CallDescriptor) {
        if cd.direction.is_empty() {
            cd.direction = OUT.to_string();
        }
        if cd.tenant.is_empty() {
            cd.tenant = self.cfg.general.default_tenant.clone();
        }
        if cd.category.is_empty() {
            cd.category = self.cfg.general.default_category.clone();
        }
        if cd.tor.is_empty() {
            cd.tor = VOICE.to_string();
        }
        if cd.subject.is_empty() {
            cd.subject = cd.account.clone();
        }
    }

    /// Loads the rating infos covering `[time_start, time_end)`
    ///
    /// `RATING_PLAN_NOT_FOUND` when no plan matches or the plans leave a gap.
    #[instrument(skip(self, cd), fields(subject = %cd.subject_name(), destination = %cd.destination))]
    pub async fn load_rating_plans(&self, cd: &mut CallDescriptor) -> AppResult<()> {
        let primary = ProfileKey::for_subject(cd, cd.subject_name());
        let mut candidates = vec![primary.clone()];
        for fallback in cd.fallback_subject.split(FALLBACK_SEP).filter(|s| !s.is_empty()) {
            candidates.push(ProfileKey::parse(fallback, &primary));
        }
        if primary.subject != ANY {
            candidates.push(primary.with_subject(ANY));
        }

        for key in candidates {
            match self.rating_infos(cd, key.clone(), 1).await {
                Ok(infos) if continuous(&infos, cd.time_start) => {
                    debug!(profile = %key.as_key(), count = infos.len(), "rating plans loaded");
                    cd.rating_infos = infos.into_iter().map(Arc::new).collect();
                    return Ok(());
                }
                Ok(_) | Err(AppError::NotFound) => continue,
                Err(e) => return Err(e),
            }
        }
        cd.rating_infos.clear();
        Err(AppError::RatingPlanNotFound)
    }

    fn rating_infos<'a>(
        &'a self,
        cd: &'a CallDescriptor,
        key: ProfileKey,
        depth: usize,
    ) -> BoxFuture<'a, AppResult<Vec<RatingInfo>>> {
        Box::pin(async move {
            if depth > RECURSION_MAX_DEPTH {
                warn!(profile = %key.as_key(), "rating fallback chain too deep");
                return Err(AppError::NotFound);
            }
            let mut rpf = self
                .tariff
                .get_rating_profile(&key.direction, &key.tenant, &key.category, &key.subject, true, CacheMode::Cached)
                .await?;
            let matched_subject = rpf.full_id();
            let activations = rpf.active_for_call(cd.time_start, cd.time_end).to_vec();

            let mut infos: Vec<RatingInfo> = Vec::new();
            for (i, rpa) in activations.iter().enumerate() {
                if i == 0 && cd.time_start < rpa.activation_time && key.subject != ANY {
                    infos.push(RatingInfo {
                        activation_time: cd.time_start,
                        fallback_keys: vec![key.with_subject(ANY).as_key()],
                        ..Default::default()
                    });
                }
                let plan = match self
                    .tariff
                    .get_rating_plan(&key.tenant, &rpa.rating_plan_id, CacheMode::Cached)
                    .await
                {
                    Ok(plan) => plan,
                    Err(AppError::RatingPlanNotFound) => {
                        warn!(plan = %rpa.rating_plan_id, profile = %matched_subject, "activation points at a missing rating plan");
                        continue;
                    }
                    Err(e) => return Err(e),
                };
                match plan.match_destination(&cd.destination, self.cfg.general.min_prefix_len) {
                    Some((prefix, dest_id)) => infos.push(RatingInfo {
                        matched_subject: matched_subject.clone(),
                        rating_plan_id: rpa.rating_plan_id.clone(),
                        rate_intervals: plan.rate_interval_list(&prefix),
                        matched_prefix: prefix,
                        matched_dest_id: dest_id,
                        activation_time: rpa.activation_time,
                        fallback_keys: rpa.fallback_keys.clone(),
                    }),
                    None => infos.push(RatingInfo {
                        matched_subject: matched_subject.clone(),
                        rating_plan_id: rpa.rating_plan_id.clone(),
                        activation_time: rpa.activation_time,
                        fallback_keys: rpa.fallback_keys.clone(),
                        ..Default::default()
                    }),
                }
            }

            let mut resolved = Vec::with_capacity(infos.len());
            for (i, info) in infos.iter().enumerate() {
                if !info.rate_intervals.is_empty() {
                    resolved.push(info.clone());
                    continue;
                }
                let until = infos.get(i + 1).map(|next| next.activation_time);
                let mut filled = false;
                for fallback in &info.fallback_keys {
                    let fk = ProfileKey::parse(fallback, &key);
                    match self.rating_infos(cd, fk, depth + 1).await {
                        Ok(sub) if !sub.is_empty() => {
                            resolved.extend(clip_infos(sub, info.activation_time, until));
                            filled = true;
                            break;
                        }
                        Ok(_) | Err(AppError::NotFound) => continue,
                        Err(e) => return Err(e),
                    }
                }
                if !filled {
                    resolved.push(info.clone());
                }
            }
            if resolved.iter().all(|ri| ri.rate_intervals.is_empty()) {
                return Err(AppError::NotFound);
            }
            resolved.sort_by_key(|ri| ri.activation_time);
            Ok(resolved)
        })
    }

    /// Prices the descriptor without touching any account
    ///
    /// The connect fee is part of the cost only for the first request of a
    /// session (`loop_index == 0`).
    #[instrument(skip(self, cd), fields(account = %cd.account_key(), destination = %cd.destination))]
    pub async fn get_cost(&self, cd: &mut CallDescriptor) -> AppResult<CallCost> {
        self.normalize_descriptor(cd);
        if cd.duration() <= chrono::Duration::zero() {
            let mut cc = cd.create_call_cost();
            if self.load_rating_plans(cd).await.is_ok() {
                if let Some(info) = cd.rating_infos.first() {
                    let mut ts = TimeSpan::new(cd.time_start, cd.time_start);
                    ts.set_rating_info(info.clone());
                    cc.timespans.push(ts);
                }
            }
            return Ok(cc);
        }
        if cd.rating_infos.is_empty() {
            self.load_rating_plans(cd).await?;
        }
        let mut cc = cd.rate(self.decimals());
        cc.deduct_connect_fee = cd.loop_index == 0.0;
        cc.update_rated_usage();
        debug!(cost = %cc.cost, "call priced");
        Ok(cc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::*;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_get_cost_per_second() {
        let engine = engine_with_tariffs().await;
        let mut cd = descriptor("dan", "0723045326", 60);
        let cc = engine.get_cost(&mut cd).await.unwrap();
        assert_eq!(cc.cost, dec!(0.6));
        assert_eq!(cc.rated_usage, 60.0);
        assert_eq!(cc.timespans[0].matched_dest_id, "NAT");
    }

    #[tokio::test]
    async fn test_connect_fee_only_on_first_loop() {
        let engine = engine_with_tariffs().await;
        let mut cd = descriptor("dan", "+4915112345", 10);
        let first = engine.get_cost(&mut cd).await.unwrap();
        assert_eq!(first.cost, dec!(0.6));

        let mut cd = descriptor("dan", "+4915112345", 10);
        cd.loop_index = 1.0;
        let next = engine.get_cost(&mut cd).await.unwrap();
        assert_eq!(next.cost, dec!(0.5));
        assert!(!next.deduct_connect_fee);
    }

    #[tokio::test]
    async fn test_falls_back_to_any_subject() {
        let engine = engine_with_tariffs().await;
        let mut cd = descriptor("nobody", "0723045326", 30);
        let cc = engine.get_cost(&mut cd).await.unwrap();
        assert_eq!(cc.cost, dec!(0.6));
        assert!(cc.timespans[0].matched_subject.ends_with(":*any"));
    }

    #[tokio::test]
    async fn test_unknown_destination() {
        let engine = engine_with_tariffs().await;
        let mut cd = descriptor("dan", "999", 30);
        assert!(matches!(
            engine.get_cost(&mut cd).await,
            Err(AppError::RatingPlanNotFound)
        ));
    }

    #[tokio::test]
    async fn test_zero_duration_carries_rating_info() {
        let engine = engine_with_tariffs().await;
        let mut cd = descriptor("dan", "0723045326", 0);
        let cc = engine.get_cost(&mut cd).await.unwrap();
        assert_eq!(cc.cost, dec!(0));
        assert_eq!(cc.timespans.len(), 1);
        assert_eq!(cc.timespans[0].duration(), Duration::zero());
    }

    #[test]
    fn test_clip_infos() {
        let t = |h| Utc.with_ymd_and_hms(2024, 1, 1, h, 0, 0).unwrap();
        let infos = vec![
            RatingInfo { activation_time: t(0), ..Default::default() },
            RatingInfo { activation_time: t(5), ..Default::default() },
            RatingInfo { activation_time: t(10), ..Default::default() },
        ];
        let clipped = clip_infos(infos, t(6), Some(t(9)));
        assert_eq!(clipped.len(), 1);
        assert_eq!(clipped[0].activation_time, t(6));
    }

    #[test]
    fn test_profile_key_parse() {
        let parent = ProfileKey {
            direction: "*out".into(),
            tenant: "test".into(),
            category: "call".into(),
            subject: "dan".into(),
        };
        assert_eq!(ProfileKey::parse("rif", &parent).as_key(), "*out:test:call:rif");
        assert_eq!(
            ProfileKey::parse("*out:other:sms:x", &parent).as_key(),
            "*out:other:sms:x"
        );
    }
}
