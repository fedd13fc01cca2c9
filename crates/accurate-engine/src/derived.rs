//! Derived chargers: one event forked into several rating runs

use accurate_core::models::{AttrDerivedChargers, Cdr, DerivedCharger, DerivedChargerGroup, SessionRun};
use accurate_core::models::alias::AttrAlias;
use accurate_core::utils::consts::{
    ALIAS_CONTEXT_RATING, ANY, INFIELD_SEP, META_NONE, META_POSTPAID, META_RATED,
};
use accurate_core::{AppError, AppResult};
use accurate_db::CacheMode;
use chrono::Duration;
use tracing::{debug, instrument};

use crate::Engine;

/// Extra field carrying per-event flags
pub const FLAGS_FIELD: &str = "cgr_flags";
/// Flag asking for the whole usage to be debited
pub const FLAG_FORCE_DURATION: &str = "fd";

const SESSION_RUNS_CACHE_PREFIX: &str = "GET_SESSION_RUNS_";
const DERIVED_MAX_SESSION_CACHE_PREFIX: &str = "GET_DERIV_MAX_SESS_TIME_";

/// Lookup keys for `attr`, most specific first
fn candidate_keys(attr: &AttrDerivedChargers) -> Vec<[String; 4]> {
    let fields = [&attr.direction, &attr.category, &attr.account, &attr.subject];
    let mut out: Vec<(usize, [String; 4])> = Vec::with_capacity(16);
    for mask in 0u8..16 {
        let key: [String; 4] = std::array::from_fn(|i| {
            if mask & (1 << (3 - i)) != 0 || fields[i].is_empty() {
                ANY.to_string()
            } else {
                fields[i].clone()
            }
        });
        if !out.iter().any(|(_, k)| *k == key) {
            let precision = key.iter().filter(|f| f.as_str() != ANY).count();
            out.push((precision, key));
        }
    }
    out.sort_by(|a, b| b.0.cmp(&a.0));
    out.into_iter().map(|(_, k)| k).collect()
}

impl Engine {
    /// Most specific charger group applying to the attributes and their
    /// destination; an empty group when none does
    pub async fn get_derived_chargers(&self, attr: &AttrDerivedChargers) -> AppResult<DerivedChargerGroup> {
        let dest_names = if attr.destination.is_empty() {
            Vec::new()
        } else {
            self.tariff.destination_names(&attr.tenant, &attr.destination).await?
        };
        for [direction, category, account, subject] in candidate_keys(attr) {
            let group = match self
                .tariff
                .get_derived_chargers(&direction, &attr.tenant, &category, &account, &subject, CacheMode::Cached)
                .await
            {
                Ok(g) => g,
                Err(AppError::NotFound) => continue,
                Err(e) => return Err(e),
            };
            if group.matches_destination(&dest_names) {
                return Ok(group);
            }
        }
        Ok(DerivedChargerGroup {
            tenant: attr.tenant.clone(),
            ..Default::default()
        })
    }

    /// Defaults, `*users` markers and rating aliases of an incoming event
    ///
    /// `masked` lets masked user profiles match as well.
    pub(crate) async fn prepare_event(&self, ev: &mut Cdr, masked: bool) -> AppResult<()> {
        if ev.subject.is_empty() {
            ev.subject = ev.account.clone();
        }
        if ev.tenant.is_empty() {
            ev.tenant = self.cfg.general.default_tenant.clone();
        }
        if ev.category.is_empty() {
            ev.category = self.cfg.general.default_category.clone();
        }
        self.load_user_profile(ev, masked)?;
        let attr = AttrAlias {
            direction: ev.direction.clone(),
            tenant: ev.tenant.clone(),
            category: ev.category.clone(),
            account: ev.account.clone(),
            subject: ev.subject.clone(),
            context: ALIAS_CONTEXT_RATING.to_string(),
            destination: ev.destination.clone(),
        };
        self.load_alias(&attr, ev).await?;
        Ok(())
    }

    /// Chargers of the event, `*default` first
    async fn event_chargers(&self, ev: &Cdr) -> AppResult<Vec<DerivedCharger>> {
        let group = self
            .get_derived_chargers(&AttrDerivedChargers {
                direction: ev.direction.clone(),
                tenant: ev.tenant.clone(),
                category: ev.category.clone(),
                account: ev.account.clone(),
                subject: ev.subject.clone(),
                destination: ev.destination.clone(),
            })
            .await?;
        Ok(group.with_default_run())
    }

    /// Copies of the event, one per charger whose run filter accepts it,
    /// with the charger's field changes applied and its run id set
    pub async fn derive_event(&self, ev: &Cdr) -> AppResult<Vec<(DerivedCharger, Cdr)>> {
        let mut forks = Vec::new();
        for dc in self.event_chargers(ev).await? {
            if !dc.run_filter()?.matches(ev)? {
                debug!(run_id = %dc.run_id, "run filter rejected the event");
                continue;
            }
            let mut fork = ev.clone();
            dc.field_changes()?.apply(&mut fork)?;
            fork.run_id = dc.run_id.clone();
            forks.push((dc, fork));
        }
        Ok(forks)
    }

    /// Rating runs of a session, each with the descriptor to authorize it
    ///
    /// Runs whose request type is `*none` or `*rated` are left out.
    #[instrument(skip(self, ev), fields(unique_id = %ev.unique_id))]
    pub async fn get_session_runs(&self, mut ev: Cdr) -> AppResult<Vec<SessionRun>> {
        let cache_key = format!("{}{}", SESSION_RUNS_CACHE_PREFIX, ev.unique_id);
        if !ev.unique_id.is_empty() {
            if let Some(replied) = self.responses.get::<Vec<SessionRun>>(&cache_key) {
                return replied;
            }
        }
        let out = self.session_runs(&mut ev).await;
        if !ev.unique_id.is_empty() {
            self.responses.set(&cache_key, &out);
        }
        out
    }

    async fn session_runs(&self, ev: &mut Cdr) -> AppResult<Vec<SessionRun>> {
        self.prepare_event(ev, false).await?;
        let mut runs = Vec::new();
        for (dc, fork) in self.derive_event(ev).await? {
            if fork.request_type == META_NONE || fork.request_type == META_RATED {
                continue;
            }
            let mut cd = fork.call_descriptor();
            cd.run_id = dc.run_id.clone();
            cd.perform_rounding = false;
            if let Some(flags) = fork.extra_fields.get(FLAGS_FIELD) {
                cd.force_duration = flags.split(INFIELD_SEP).any(|f| f == FLAG_FORCE_DURATION);
            }
            runs.push(SessionRun {
                derived_charger: dc,
                call_descriptor: cd,
                call_costs: Vec::new(),
            });
        }
        Ok(runs)
    }

    /// Shortest authorized duration over the derived runs of an event
    ///
    /// `None` when every considered run is unlimited. Postpaid runs are
    /// checked for authorization but do not bound the result.
    #[instrument(skip(self, ev), fields(unique_id = %ev.unique_id))]
    pub async fn get_derived_max_session_time(&self, mut ev: Cdr) -> AppResult<Option<Duration>> {
        let cache_key = format!("{}{}{}", DERIVED_MAX_SESSION_CACHE_PREFIX, ev.unique_id, ev.run_id);
        if !ev.unique_id.is_empty() {
            if let Some(replied) = self.responses.get::<Option<i64>>(&cache_key) {
                return replied.map(|o| o.map(Duration::nanoseconds));
            }
        }
        let out = self.derived_max_session_time(&mut ev).await;
        if !ev.unique_id.is_empty() {
            let stored = out.clone().map(|o| o.and_then(|d| d.num_nanoseconds()));
            self.responses.set(&cache_key, &stored);
        }
        out
    }

    async fn derived_max_session_time(&self, ev: &mut Cdr) -> AppResult<Option<Duration>> {
        self.prepare_event(ev, false).await?;
        let usage = if ev.usage.is_zero() {
            Duration::seconds(self.cfg.general.max_call_duration_secs as i64)
        } else {
            ev.usage
        };
        let mut max: Option<Duration> = None;
        for (dc, fork) in self.derive_event(ev).await? {
            if fork.request_type == META_NONE || fork.request_type == META_RATED {
                continue;
            }
            let mut cd = fork.call_descriptor();
            cd.time_start = fork.setup_time;
            cd.time_end = fork.setup_time + usage;
            cd.duration_index = usage;
            cd.run_id = dc.run_id.clone();
            let remaining = self.get_max_session_time(&mut cd).await?;
            if fork.request_type == META_POSTPAID {
                continue;
            }
            if let Some(r) = remaining {
                max = Some(max.map_or(r, |m| m.min(r)));
            }
        }
        Ok(max)
    }
}
