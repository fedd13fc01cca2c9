//! CDR intake handlers
//!
//! Both endpoints only parse and enqueue; rating happens on the worker pool.

use std::collections::BTreeMap;
use std::sync::Arc;

use accurate_core::models::Cdr;
use accurate_core::AppError;
use accurate_engine::{CdrPool, Engine};
use accurate_freeswitch::FsCdr;
use actix_web::web::{Bytes, Data, Form, Query};
use actix_web::{HttpRequest, HttpResponse};
use tracing::{debug, instrument, warn};

/// Accepts a generic `name=value` CDR from the query string and form body
///
/// ```text
/// POST /cdr_http
/// OriginID=dsafdsaf&Account=1001&Destination=1002&Usage=10&...
/// ```
#[instrument(skip_all)]
pub async fn cdr_http(
    req: HttpRequest,
    query: Query<BTreeMap<String, String>>,
    form: Option<Form<BTreeMap<String, String>>>,
    pool: Data<CdrPool>,
) -> Result<HttpResponse, AppError> {
    let mut fields = query.into_inner();
    if let Some(form) = form {
        fields.extend(form.into_inner());
    }
    let source = req
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_default();
    let cdr = Cdr::from_fields(&fields, &source).map_err(|e| {
        warn!(error = %e, "could not parse CDR fields");
        e
    })?;
    debug!(origin_id = %cdr.origin_id, "CDR received over HTTP");
    pool.submit(cdr).await?;
    Ok(HttpResponse::Ok().finish())
}

/// Accepts a FreeSWITCH `mod_json_cdr` post
#[instrument(skip_all)]
pub async fn freeswitch_json(
    body: Bytes,
    engine: Data<Arc<Engine>>,
    pool: Data<CdrPool>,
) -> Result<HttpResponse, AppError> {
    let cfg = engine.config();
    let cdr = FsCdr::parse(&body)
        .and_then(|fs| fs.as_cdr(&cfg.general, &cfg.freeswitch.extra_fields))
        .map_err(|e| {
            warn!(error = %e, "could not parse FreeSWITCH CDR");
            e
        })?;
    debug!(origin_id = %cdr.origin_id, "FreeSWITCH CDR received");
    pool.submit(cdr).await?;
    Ok(HttpResponse::Ok().finish())
}
