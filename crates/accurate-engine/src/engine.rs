//! The engine: every service the responder exposes, wired once at startup
//!
//! One `Arc<Engine>` is shared by the HTTP handlers, the worker pool and the
//! background tasks. Services are `impl Engine` blocks spread across the
//! crate's modules.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use accurate_cache::{Cache, ResponseCache};
use accurate_core::traits::{CdrStorage, KvBackend, TaxCollaborator};
use accurate_core::{AppConfig, AppResult};
use accurate_db::{open_backend, open_cdr_storage, AccountingStore, MapBackend, MemoryCdrStore, Store, TariffPlanStore};
use parking_lot::RwLock;
use tokio::sync::{watch, Notify};
use tracing::info;

use crate::guardian::Guardian;
use crate::stats::StatsQueues;
use crate::users::UserIndex;

pub struct Engine {
    pub(crate) cfg: AppConfig,
    pub(crate) tariff: TariffPlanStore,
    pub(crate) accounting: AccountingStore,
    pub(crate) cdr_storage: Arc<dyn CdrStorage>,
    pub(crate) guardian: Guardian,
    pub(crate) responses: ResponseCache,
    pub(crate) users: UserIndex,
    pub(crate) stats: StatsQueues,
    pub(crate) http: reqwest::Client,
    taxes: RwLock<HashMap<String, Arc<dyn TaxCollaborator>>>,
    pub(crate) scheduler_reload: Notify,
    shutdown: watch::Sender<bool>,
    started: Instant,
}

impl Engine {
    pub fn new(cfg: AppConfig, backend: Arc<dyn KvBackend>, cdr_storage: Arc<dyn CdrStorage>) -> Self {
        let cache = Arc::new(Cache::new(cfg.storage.cache_capacity));
        let store = Store::new(backend, cache);
        let (shutdown, _) = watch::channel(false);
        Self {
            tariff: TariffPlanStore::new(store.clone(), cfg.general.min_prefix_len),
            accounting: AccountingStore::new(store, cfg.storage.load_history_size),
            cdr_storage,
            guardian: Guardian::new(),
            responses: ResponseCache::new(Duration::from_secs(cfg.general.response_cache_ttl_secs)),
            users: UserIndex::new(&cfg.users.indexes),
            stats: StatsQueues::default(),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(cfg.general.reply_timeout_secs))
                .build()
                .unwrap_or_default(),
            taxes: RwLock::new(HashMap::new()),
            scheduler_reload: Notify::new(),
            shutdown,
            started: Instant::now(),
            cfg,
        }
    }

    /// Engine over the storage named by the configuration
    pub async fn open(cfg: AppConfig) -> AppResult<Self> {
        let backend = open_backend(&cfg.storage).await?;
        let cdrs = open_cdr_storage(&cfg.storage).await?;
        info!(kind = %cfg.storage.kind, "storage ready");
        Ok(Self::new(cfg, backend, cdrs))
    }

    /// Everything in process memory
    pub fn in_memory(cfg: AppConfig) -> Self {
        Self::new(cfg, Arc::new(MapBackend::new()), Arc::new(MemoryCdrStore::new()))
    }

    pub fn config(&self) -> &AppConfig {
        &self.cfg
    }

    pub fn tariff(&self) -> &TariffPlanStore {
        &self.tariff
    }

    pub fn accounting(&self) -> &AccountingStore {
        &self.accounting
    }

    pub fn cdr_storage(&self) -> &Arc<dyn CdrStorage> {
        &self.cdr_storage
    }

    pub fn decimals(&self) -> u32 {
        self.cfg.general.rounding_decimals
    }

    pub(crate) fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.cfg.general.lock_timeout_ms)
    }

    /// Makes a tax collaborator available under its name
    pub fn register_tax_collaborator(&self, tax: Arc<dyn TaxCollaborator>) {
        self.taxes.write().insert(tax.name().to_string(), tax);
    }

    /// The collaborator named by `cdrs.tax_collaborator`, if registered
    pub(crate) fn tax_collaborator(&self) -> Option<Arc<dyn TaxCollaborator>> {
        let name = &self.cfg.cdrs.tax_collaborator;
        if name.is_empty() {
            return None;
        }
        self.taxes.read().get(name).cloned()
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Asks the background tasks and the server to stop
    pub fn shutdown(&self) {
        info!("shutdown requested");
        self.shutdown.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Resolves once [`Engine::shutdown`] was called
    pub fn shutdown_signal(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let mut rx = self.shutdown.subscribe();
        async move {
            while !*rx.borrow_and_update() {
                if rx.changed().await.is_err() {
                    return;
                }
            }
        }
    }
}
