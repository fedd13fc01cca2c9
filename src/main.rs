//! Accurate rating server
//!
//! Loads the configuration, opens storage, checks the data versions, starts
//! the background services (scheduler, stats persistence, CDR workers) and
//! serves the HTTP surface until shutdown.

use std::sync::Arc;

use accurate_api::configure;
use accurate_core::models::AttrStatsQueueIds;
use accurate_core::AppConfig;
use accurate_engine::{CdrPool, Engine};
use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
use tracing::{error, info};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize tracing/logging
fn init_tracing(cfg: &AppConfig) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.log.level));

    let registry = tracing_subscriber::registry().with(env_filter);
    if cfg.log.json {
        registry.with(fmt::layer().json().with_current_span(true)).init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .init();
    }
}

/// Loads what the engine keeps in memory
async fn warm_up(engine: &Engine) -> anyhow::Result<()> {
    engine.check_versions().await.context("data versions")?;
    engine.reload_users("").await.context("loading users")?;
    engine
        .reload_stats_queues(&AttrStatsQueueIds::default())
        .await
        .context("loading stats queues")?;
    Ok(())
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cfg = AppConfig::load().context("loading configuration")?;
    init_tracing(&cfg);

    info!("Starting Accurate v{}", env!("CARGO_PKG_VERSION"));

    let bind_addr = cfg.server_addr();
    let workers = cfg.server.workers;
    let engine = Arc::new(Engine::open(cfg).await.context("opening storage")?);
    if let Err(e) = warm_up(&engine).await {
        error!(error = %e, "startup aborted");
        return Err(e);
    }

    let scheduler = tokio::spawn(engine.clone().run_scheduler());
    let stats_saver = tokio::spawn(engine.clone().run_stats_saver());
    let (pool, cdr_workers) = CdrPool::with_cpus(engine.clone());

    info!("Starting HTTP server on {} with {} workers", bind_addr, workers);

    let app_engine = engine.clone();
    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(app_engine.clone()))
            .app_data(web::Data::new(pool.clone()))
            .app_data(web::PayloadConfig::new(4 * 1024 * 1024))
            .wrap(Cors::permissive())
            .wrap(TracingLogger::default())
            .wrap(middleware::NormalizePath::trim())
            .configure(configure)
    })
    .workers(workers)
    .disable_signals()
    .bind(&bind_addr)
    .with_context(|| format!("binding {}", bind_addr))?
    .run();

    let handle = server.handle();
    let running = actix_web::rt::spawn(server);
    let shutdown = engine.shutdown_signal();
    tokio::select! {
        res = running => res.context("HTTP server task")?.context("HTTP server")?,
        _ = shutdown => {
            info!("shutdown requested over RPC");
            handle.stop(true).await;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
            engine.shutdown();
            handle.stop(true).await;
        }
    }

    engine.shutdown();
    for task in cdr_workers {
        task.await.ok();
    }
    scheduler.await.ok();
    stats_saver.await.ok();
    info!("Accurate stopped");
    Ok(())
}
