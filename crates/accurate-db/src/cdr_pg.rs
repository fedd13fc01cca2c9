//! PostgreSQL CDR store
//!
//! Runtime built queries (no compile time macros), so building does not need
//! a live database. Filters map onto `= ANY($n)` list binds.

use std::collections::BTreeMap;

use accurate_core::models::{AccountSummary, CallCost, Cdr, CdrsFilter, SmCost};
use accurate_core::traits::CdrStorage;
use accurate_core::utils::time::{nanos, parse_duration};
use accurate_core::{AppError, AppResult};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::{debug, error, instrument};

pub struct PgCdrStore {
    pool: PgPool,
}

impl PgCdrStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const CDR_COLUMNS: &str = r#"
    unique_id, run_id, tor, origin_id, origin_host, source,
    request_type, direction, tenant, category, account, subject, destination,
    setup_time, pdd, answer_time, usage, supplier, disconnect_cause,
    extra_fields, cost_source, cost, cost_details, account_summary,
    extra_info, rated
"#;

#[derive(Debug, sqlx::FromRow)]
struct CdrRow {
    order_id: i64,
    unique_id: String,
    run_id: String,
    tor: String,
    origin_id: String,
    origin_host: String,
    source: String,
    request_type: String,
    direction: String,
    tenant: String,
    category: String,
    account: String,
    subject: String,
    destination: String,
    setup_time: DateTime<Utc>,
    pdd: i64,
    answer_time: DateTime<Utc>,
    usage: i64,
    supplier: String,
    disconnect_cause: String,
    extra_fields: Json<BTreeMap<String, String>>,
    cost_source: String,
    cost: Decimal,
    cost_details: Option<Json<CallCost>>,
    account_summary: Option<Json<AccountSummary>>,
    extra_info: String,
    rated: bool,
}

impl From<CdrRow> for Cdr {
    fn from(row: CdrRow) -> Self {
        Cdr {
            unique_id: row.unique_id,
            order_id: row.order_id,
            tor: row.tor,
            origin_id: row.origin_id,
            origin_host: row.origin_host,
            source: row.source,
            request_type: row.request_type,
            direction: row.direction,
            tenant: row.tenant,
            category: row.category,
            account: row.account,
            subject: row.subject,
            destination: row.destination,
            setup_time: row.setup_time,
            pdd: Duration::nanoseconds(row.pdd),
            answer_time: row.answer_time,
            usage: Duration::nanoseconds(row.usage),
            supplier: row.supplier,
            disconnect_cause: row.disconnect_cause,
            extra_fields: row.extra_fields.0,
            run_id: row.run_id,
            cost_source: row.cost_source,
            cost: row.cost,
            cost_details: row.cost_details.map(|j| j.0),
            extra_info: row.extra_info,
            account_summary: row.account_summary.map(|j| j.0),
            rated: row.rated,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SmCostRow {
    unique_id: String,
    run_id: String,
    origin_host: String,
    origin_id: String,
    cost_source: String,
    usage: f64,
    cost_details: Option<Json<CallCost>>,
}

impl From<SmCostRow> for SmCost {
    fn from(row: SmCostRow) -> Self {
        SmCost {
            unique_id: row.unique_id,
            run_id: row.run_id,
            origin_host: row.origin_host,
            origin_id: row.origin_id,
            cost_source: row.cost_source,
            usage: row.usage,
            cost_details: row.cost_details.map(|j| j.0),
        }
    }
}

fn push_any(qb: &mut QueryBuilder<'_, Postgres>, column: &str, values: &[String], negate: bool) {
    if values.is_empty() {
        return;
    }
    qb.push(if negate { " AND NOT (" } else { " AND (" });
    qb.push(column);
    qb.push(" = ANY(");
    qb.push_bind(values.to_vec());
    qb.push("))");
}

fn push_prefixes(qb: &mut QueryBuilder<'_, Postgres>, prefixes: &[String], negate: bool) {
    if prefixes.is_empty() {
        return;
    }
    qb.push(if negate { " AND NOT (" } else { " AND (" });
    for (i, p) in prefixes.iter().enumerate() {
        if i > 0 {
            qb.push(" OR ");
        }
        qb.push("destination LIKE ");
        qb.push_bind(format!("{}%", p.replace('%', "\\%").replace('_', "\\_")));
    }
    qb.push(")");
}

fn push_range<T>(qb: &mut QueryBuilder<'_, Postgres>, column: &str, from: Option<T>, to: Option<T>)
where
    T: for<'q> sqlx::Encode<'q, Postgres> + sqlx::Type<Postgres> + Send + 'static,
{
    if let Some(v) = from {
        qb.push(format!(" AND {} >= ", column));
        qb.push_bind(v);
    }
    if let Some(v) = to {
        qb.push(format!(" AND {} < ", column));
        qb.push_bind(v);
    }
}

/// Appends the WHERE clause of a filter
fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, f: &CdrsFilter) -> AppResult<()> {
    qb.push(" WHERE TRUE");
    push_any(qb, "unique_id", &f.unique_ids, false);
    push_any(qb, "unique_id", &f.not_unique_ids, true);
    push_any(qb, "run_id", &f.run_ids, false);
    push_any(qb, "run_id", &f.not_run_ids, true);
    push_any(qb, "origin_host", &f.origin_hosts, false);
    push_any(qb, "source", &f.sources, false);
    push_any(qb, "tor", &f.tors, false);
    push_any(qb, "request_type", &f.request_types, false);
    push_any(qb, "direction", &f.directions, false);
    push_any(qb, "tenant", &f.tenants, false);
    push_any(qb, "category", &f.categories, false);
    push_any(qb, "account", &f.accounts, false);
    push_any(qb, "subject", &f.subjects, false);
    push_any(qb, "supplier", &f.suppliers, false);
    push_any(qb, "disconnect_cause", &f.disconnect_causes, false);
    push_prefixes(qb, &f.destination_prefixes, false);
    push_prefixes(qb, &f.not_destination_prefixes, true);
    push_range(qb, "setup_time", f.setup_time_start, f.setup_time_end);
    push_range(qb, "answer_time", f.answer_time_start, f.answer_time_end);
    let min_usage = f.min_usage.as_deref().map(parse_duration).transpose()?.map(nanos);
    let max_usage = f.max_usage.as_deref().map(parse_duration).transpose()?.map(nanos);
    push_range(qb, "usage", min_usage, max_usage);
    push_range(qb, "cost", f.min_cost, f.max_cost);
    if let Some(rated) = f.rated {
        qb.push(" AND rated = ");
        qb.push_bind(rated);
    }
    Ok(())
}

fn db_error(context: &str, e: sqlx::Error) -> AppError {
    error!("Database error {}: {}", context, e);
    AppError::Database(format!("{}: {}", context, e))
}

#[async_trait]
impl CdrStorage for PgCdrStore {
    #[instrument(skip(self, cdr), fields(unique_id = %cdr.unique_id, run_id = %cdr.run_id))]
    async fn set_cdr(&self, cdr: &Cdr, allow_update: bool) -> AppResult<()> {
        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("INSERT INTO cdrs ({}) VALUES (", CDR_COLUMNS));
        {
            let mut values = qb.separated(", ");
            values
                .push_bind(&cdr.unique_id)
                .push_bind(&cdr.run_id)
                .push_bind(&cdr.tor)
                .push_bind(&cdr.origin_id)
                .push_bind(&cdr.origin_host)
                .push_bind(&cdr.source)
                .push_bind(&cdr.request_type)
                .push_bind(&cdr.direction)
                .push_bind(&cdr.tenant)
                .push_bind(&cdr.category)
                .push_bind(&cdr.account)
                .push_bind(&cdr.subject)
                .push_bind(&cdr.destination)
                .push_bind(cdr.setup_time)
                .push_bind(nanos(cdr.pdd))
                .push_bind(cdr.answer_time)
                .push_bind(nanos(cdr.usage))
                .push_bind(&cdr.supplier)
                .push_bind(&cdr.disconnect_cause)
                .push_bind(Json(&cdr.extra_fields))
                .push_bind(&cdr.cost_source)
                .push_bind(cdr.cost)
                .push_bind(cdr.cost_details.as_ref().map(Json))
                .push_bind(cdr.account_summary.as_ref().map(Json))
                .push_bind(&cdr.extra_info)
                .push_bind(cdr.rated);
        }
        qb.push(")");
        if allow_update {
            qb.push(
                " ON CONFLICT (unique_id, run_id) DO UPDATE SET \
                 request_type = EXCLUDED.request_type, tenant = EXCLUDED.tenant, \
                 category = EXCLUDED.category, account = EXCLUDED.account, \
                 subject = EXCLUDED.subject, destination = EXCLUDED.destination, \
                 setup_time = EXCLUDED.setup_time, answer_time = EXCLUDED.answer_time, \
                 usage = EXCLUDED.usage, pdd = EXCLUDED.pdd, supplier = EXCLUDED.supplier, \
                 disconnect_cause = EXCLUDED.disconnect_cause, extra_fields = EXCLUDED.extra_fields, \
                 cost_source = EXCLUDED.cost_source, cost = EXCLUDED.cost, \
                 cost_details = EXCLUDED.cost_details, account_summary = EXCLUDED.account_summary, \
                 extra_info = EXCLUDED.extra_info, rated = EXCLUDED.rated, updated_at = NOW()",
            );
        }
        match qb.build().execute(&self.pool).await {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(AppError::Exists),
            Err(e) => Err(db_error("storing CDR", e)),
        }
    }

    #[instrument(skip(self, cost), fields(unique_id = %cost.unique_id, run_id = %cost.run_id))]
    async fn set_sm_cost(&self, cost: &SmCost) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sm_costs (unique_id, run_id, origin_host, origin_id, cost_source, usage, cost_details)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (unique_id, run_id) DO UPDATE SET
                origin_host = EXCLUDED.origin_host, origin_id = EXCLUDED.origin_id,
                cost_source = EXCLUDED.cost_source, usage = EXCLUDED.usage,
                cost_details = EXCLUDED.cost_details
            "#,
        )
        .bind(&cost.unique_id)
        .bind(&cost.run_id)
        .bind(&cost.origin_host)
        .bind(&cost.origin_id)
        .bind(&cost.cost_source)
        .bind(cost.usage)
        .bind(cost.cost_details.as_ref().map(Json))
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("storing SM cost", e))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_sm_costs(
        &self,
        unique_id: &str,
        run_id: &str,
        origin_host: &str,
        origin_id_prefix: &str,
    ) -> AppResult<Vec<SmCost>> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "SELECT unique_id, run_id, origin_host, origin_id, cost_source, usage, cost_details \
             FROM sm_costs WHERE TRUE",
        );
        for (column, value) in [("unique_id", unique_id), ("run_id", run_id), ("origin_host", origin_host)] {
            if !value.is_empty() {
                qb.push(format!(" AND {} = ", column));
                qb.push_bind(value.to_string());
            }
        }
        if !origin_id_prefix.is_empty() {
            qb.push(" AND origin_id LIKE ");
            qb.push_bind(format!("{}%", origin_id_prefix));
        }
        qb.push(" ORDER BY id");
        let rows = qb
            .build_query_as::<SmCostRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error("fetching SM costs", e))?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    #[instrument(skip(self, filter))]
    async fn get_cdrs(&self, filter: &CdrsFilter, remove: bool) -> AppResult<(Vec<Cdr>, usize)> {
        if remove {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new("DELETE FROM cdrs");
            push_filter(&mut qb, filter)?;
            let done = qb
                .build()
                .execute(&self.pool)
                .await
                .map_err(|e| db_error("removing CDRs", e))?;
            debug!(removed = done.rows_affected(), "CDRs removed");
            return Ok((Vec::new(), done.rows_affected() as usize));
        }

        let mut count_qb: QueryBuilder<Postgres> = QueryBuilder::new("SELECT COUNT(*) FROM cdrs");
        push_filter(&mut count_qb, filter)?;
        let (total,): (i64,) = count_qb
            .build_query_as()
            .fetch_one(&self.pool)
            .await
            .map_err(|e| db_error("counting CDRs", e))?;

        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT id AS order_id, {} FROM cdrs", CDR_COLUMNS));
        push_filter(&mut qb, filter)?;
        qb.push(" ORDER BY id");
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ");
            qb.push_bind(limit as i64);
        }
        if let Some(offset) = filter.offset {
            qb.push(" OFFSET ");
            qb.push_bind(offset as i64);
        }
        let rows = qb
            .build_query_as::<CdrRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error("fetching CDRs", e))?;
        Ok((rows.into_iter().map(Into::into).collect(), total as usize))
    }
}
