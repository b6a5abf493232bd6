use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use slot_lifecycle::SlotLifecycle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::engine::AllocationEngine;

const DEFAULT_SLOT_GENERATION_INTERVAL: Duration = Duration::from_secs(60 * 60);
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Periodic background work the host wires up once at startup: generates
/// each day's slots from the weekly templates, and retries tokens stuck
/// `pending_reallocation` after a preemption that couldn't find anywhere to
/// land them immediately. Grounded on a queue worker's start/shutdown/
/// health-check loop shape, adapted from polling a job queue to polling the
/// clock and the tokens collection.
pub struct EngineBackgroundTasks {
    lifecycle: Arc<SlotLifecycle>,
    engine: Arc<AllocationEngine>,
    slot_generation_interval: Duration,
    sweep_interval: Duration,
    shutdown: Arc<Notify>,
    healthy: Arc<AtomicBool>,
}

impl EngineBackgroundTasks {
    pub fn new(lifecycle: Arc<SlotLifecycle>, engine: Arc<AllocationEngine>) -> Self {
        Self {
            lifecycle,
            engine,
            slot_generation_interval: DEFAULT_SLOT_GENERATION_INTERVAL,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            shutdown: Arc::new(Notify::new()),
            healthy: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn with_intervals(mut self, slot_generation_interval: Duration, sweep_interval: Duration) -> Self {
        self.slot_generation_interval = slot_generation_interval;
        self.sweep_interval = sweep_interval;
        self
    }

    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move { self.worker_loop().await })
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    async fn worker_loop(&self) {
        let mut generation_ticker = tokio::time::interval(self.slot_generation_interval);
        let mut sweep_ticker = tokio::time::interval(self.sweep_interval);
        loop {
            tokio::select! {
                _ = generation_ticker.tick() => self.generate_today().await,
                _ = sweep_ticker.tick() => self.sweep_pending_reallocations().await,
                _ = self.shutdown.notified() => {
                    info!("allocation engine background tasks shutting down");
                    break;
                }
            }
        }
    }

    async fn generate_today(&self) {
        let today = Utc::now().date_naive();
        match self.lifecycle.generate_for_date(today).await {
            Ok(slots) => {
                self.healthy.store(true, Ordering::Relaxed);
                info!("generated {} slots for {today}", slots.len());
            }
            Err(err) => {
                self.healthy.store(false, Ordering::Relaxed);
                error!("slot generation failed for {today}: {err}");
            }
        }
    }

    async fn sweep_pending_reallocations(&self) {
        match self.engine.retry_pending_reallocations().await {
            Ok(count) if count > 0 => info!("reallocated {count} pending tokens"),
            Ok(_) => {}
            Err(err) => error!("pending-reallocation sweep failed: {err}"),
        }
    }
}
