//! Background Workers
//!
//! One tokio task persists the event log to flash, another replicates flash
//! to the collector. Each sleeps until it is notified or its poll interval
//! elapses, and exits when shutdown is initiated.

use crate::application::{EventLog, FlashStore, PushAttempt, PushService};
use crate::infrastructure::backoff::{BackoffConfig, HoldOff};
use crate::infrastructure::shutdown::ShutdownController;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Flash worker timing.
#[derive(Debug, Clone)]
pub struct FlashWorkerConfig {
    /// Delay before the first write after boot.
    pub startup_delay: Duration,
    /// Wake-up interval when nothing notifies the worker.
    pub interval: Duration,
}

impl Default for FlashWorkerConfig {
    fn default() -> Self {
        Self {
            startup_delay: Duration::from_secs(180),
            interval: Duration::from_secs(120),
        }
    }
}

/// Push worker timing.
#[derive(Debug, Clone)]
pub struct PushWorkerConfig {
    /// Wake-up interval when nothing notifies the worker.
    pub interval: Duration,
    pub backoff: BackoffConfig,
}

impl Default for PushWorkerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(120),
            backoff: BackoffConfig::default(),
        }
    }
}

/// Sleep for `delay` unless shutdown comes first. Returns false on shutdown.
async fn sleep_or_shutdown(delay: Duration, shutdown: &ShutdownController) -> bool {
    if delay.is_zero() {
        return !shutdown.is_shutdown();
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => !shutdown.is_shutdown(),
        _ = shutdown.wait() => false,
    }
}

/// Wait for a notification or the poll interval. Returns false on shutdown.
async fn wait_for_work(wake: &Notify, interval: Duration, shutdown: &ShutdownController) -> bool {
    tokio::select! {
        _ = wake.notified() => !shutdown.is_shutdown(),
        _ = tokio::time::sleep(interval) => !shutdown.is_shutdown(),
        _ = shutdown.wait() => false,
    }
}

async fn flush(log: &Arc<EventLog>, store: &Arc<FlashStore>) {
    let log = log.clone();
    let store = store.clone();
    match tokio::task::spawn_blocking(move || store.flush_pending(&log)).await {
        Ok(0) => {}
        Ok(n) => tracing::debug!("flash worker saved {} buffers", n),
        Err(e) => tracing::error!("flash flush task failed: {}", e),
    }
}

/// Start the Flash Persistence worker.
///
/// `wake` is the notifier the event log signals on every append.
pub fn spawn_flash_worker(
    log: Arc<EventLog>,
    store: Arc<FlashStore>,
    wake: Arc<Notify>,
    config: FlashWorkerConfig,
    shutdown: ShutdownController,
) -> JoinHandle<()> {
    let guard = shutdown.worker_guard();
    tokio::spawn(async move {
        let _guard = guard;

        // Let the power supply settle before the first flash write.
        if !sleep_or_shutdown(config.startup_delay, &shutdown).await {
            return;
        }
        tracing::info!("flash worker started");

        loop {
            flush(&log, &store).await;
            if !wait_for_work(&wake, config.interval, &shutdown).await {
                break;
            }
        }

        // Persist whatever is already due before exiting.
        flush(&log, &store).await;
        tracing::info!("flash worker stopped");
    })
}

/// Start the Network Replication worker.
///
/// `wake` is the notifier the flash store signals after each write.
pub fn spawn_push_worker(
    mut service: PushService,
    wake: Arc<Notify>,
    config: PushWorkerConfig,
    shutdown: ShutdownController,
) -> JoinHandle<()> {
    let guard = shutdown.worker_guard();
    tokio::spawn(async move {
        let _guard = guard;
        let mut hold_off = HoldOff::new(config.backoff.clone());
        tracing::info!("push worker started");

        'outer: loop {
            while service.maybe_more() {
                let delay = hold_off.next_delay();
                if !sleep_or_shutdown(delay, &shutdown).await {
                    break 'outer;
                }

                match service.push_once().await {
                    PushAttempt::Sent { index, offset, len } => {
                        tracing::debug!("pushed index {} offset {} ({} bytes)", index, offset, len);
                        hold_off.reset();
                    }
                    PushAttempt::NothingToSend => break,
                    PushAttempt::Failed(e) => {
                        tracing::warn!("push failed: {}", e);
                    }
                }
            }

            if !wait_for_work(&wake, config.interval, &shutdown).await {
                break;
            }
        }

        tracing::info!("push worker stopped");
    })
}
