//! HTTP request handlers

pub mod cdr;
pub mod rpc;

use std::sync::Arc;

use accurate_engine::Engine;
use actix_web::{web, HttpResponse};

/// Health check with the engine status
pub async fn health(engine: web::Data<Arc<Engine>>) -> HttpResponse {
    let status = if engine.is_shutting_down() { "stopping" } else { "healthy" };
    HttpResponse::Ok().json(serde_json::json!({
        "status": status,
        "service": "accurate",
        "engine": engine.status(),
    }))
}

/// Registers every route; the engine and the CDR pool are expected as app data
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health))
        .route("/jsonrpc", web::post().to(rpc::jsonrpc))
        .route("/cdr_http", web::post().to(cdr::cdr_http))
        .route("/freeswitch_json", web::post().to(cdr::freeswitch_json));
}
