//! The background replicator sweep
//!
//! Requisition reconciliation is decoupled from the request path: mutations
//! only queue dirty-chunk notifications, and this task drains the queue on a
//! period. Callers observe stale usage for at most roughly one period after
//! a mutation.

use crate::accounting::engine::AccountingEngine;
use log::{debug, info};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Periodic sweep driver over a shared accounting engine.
pub struct Replicator {
    engine: Arc<Mutex<AccountingEngine>>,
    period: Duration,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Replicator {
    pub fn new(engine: Arc<Mutex<AccountingEngine>>, period: Duration) -> Self {
        Self {
            engine,
            period,
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    /// Shared handle to the engine this replicator drives.
    pub fn engine(&self) -> Arc<Mutex<AccountingEngine>> {
        self.engine.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawn the sweep task. Starting an already running replicator is a
    /// no-op.
    pub fn start(&mut self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let engine = self.engine.clone();
        let running = self.running.clone();
        let period = self.period;
        self.handle = Some(tokio::spawn(async move {
            info!("replicator started with period {:?}", period);
            while running.load(Ordering::SeqCst) {
                tokio::time::sleep(period).await;
                let mut engine = engine.lock().await;
                engine.run_sweep();
            }
            debug!("replicator stopped");
        }));
    }

    /// Stop the sweep task and wait for it to wind down. The sweep itself is
    /// never interrupted mid-batch; cancellation lands between ticks.
    pub async fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            handle.abort();
            let _ = handle.await;
        }
    }

    /// Run one sweep immediately, outside the periodic schedule.
    pub async fn sweep_now(&self) -> usize {
        let mut engine = self.engine.lock().await;
        engine.run_sweep()
    }
}
