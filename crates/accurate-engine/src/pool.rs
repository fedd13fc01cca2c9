//! Bounded worker pool feeding HTTP-received CDRs into the CDR server

use std::sync::Arc;

use accurate_core::models::Cdr;
use accurate_core::{AppError, AppResult};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::Engine;

/// Handle to the intake queue; cheap to clone
#[derive(Clone)]
pub struct CdrPool {
    tx: mpsc::Sender<Cdr>,
}

impl CdrPool {
    /// Starts `workers` tasks over a queue holding as many pending CDRs
    pub fn start(engine: Arc<Engine>, workers: usize) -> (Self, Vec<JoinHandle<()>>) {
        let workers = workers.max(1);
        let (tx, rx) = mpsc::channel::<Cdr>(workers);
        let rx = Arc::new(Mutex::new(rx));
        let handles = (0..workers)
            .map(|id| tokio::spawn(worker(id, engine.clone(), rx.clone())))
            .collect();
        info!(workers, "CDR worker pool started");
        (Self { tx }, handles)
    }

    /// One worker per CPU
    pub fn with_cpus(engine: Arc<Engine>) -> (Self, Vec<JoinHandle<()>>) {
        Self::start(engine, num_cpus::get())
    }

    /// Queues a CDR, waiting while every worker is busy and the queue full
    pub async fn submit(&self, cdr: Cdr) -> AppResult<()> {
        self.tx
            .send(cdr)
            .await
            .map_err(|_| AppError::ServerError("CDR pool stopped".into()))
    }
}

async fn worker(id: usize, engine: Arc<Engine>, rx: Arc<Mutex<mpsc::Receiver<Cdr>>>) {
    let shutdown = engine.shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        let next = tokio::select! {
            cdr = async { rx.lock().await.recv().await } => cdr,
            _ = &mut shutdown => None,
        };
        let Some(cdr) = next else {
            debug!(worker = id, "CDR worker stopping");
            return;
        };
        let origin_id = cdr.origin_id.clone();
        if let Err(e) = engine.process_cdr(cdr).await {
            warn!(worker = id, origin_id = %origin_id, error = %e, "CDR processing failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::*;
    use accurate_core::models::CdrsFilter;
    use accurate_core::utils::consts::{META_RATED, RAW};
    use chrono::Duration;

    #[tokio::test]
    async fn test_pool_processes_and_stops() {
        let engine = engine_with_tariffs().await;
        let (pool, handles) = CdrPool::start(engine.clone(), 2);
        for i in 0..5 {
            pool.submit(Cdr {
                origin_id: format!("call{}", i),
                request_type: META_RATED.into(),
                tenant: TENANT.into(),
                account: "dan".into(),
                destination: "0723045326".into(),
                setup_time: call_start(),
                answer_time: call_start(),
                usage: Duration::seconds(10),
                ..Default::default()
            })
            .await
            .unwrap();
        }
        drop(pool);
        for h in handles {
            h.await.unwrap();
        }
        let filter = CdrsFilter {
            run_ids: vec![RAW.into()],
            ..Default::default()
        };
        assert_eq!(engine.get_cdrs(&filter).await.unwrap().1, 5);
    }
}
