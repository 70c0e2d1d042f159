//! sensor-log - sensor node telemetry pipeline
//!
//! This is the composition root that wires together all the components.

use sensor_log::adapters::inbound::AdminApi;
use sensor_log::adapters::outbound::{
    CounterTickSource, DashMapParamStore, FileFlash, HttpPushConfig, HttpPushTransport, MemFlash,
    SystemWallClock,
};
use sensor_log::application::{
    AdminService, EventLog, FlashConfig, FlashStore, LogConfig, PushConfig, PushService,
    LOGGING_PARAM,
};
use sensor_log::config::load_config;
use sensor_log::domain::ports::{FlashDevice, ParamStore};
use sensor_log::infrastructure::{
    shutdown_signal, spawn_flash_worker, spawn_push_worker, BackoffConfig, FlashWorkerConfig,
    PushWorkerConfig, ShutdownController,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing_subscriber::fmt::format::FmtSpan;

/// Boot reason logged with the STARTUP event: a regular power-on.
const BOOT_REASON_POWER_ON: u32 = 0;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration from environment
    let cfg = load_config()?;

    // Setup logging
    let log_level = if cfg.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_span_events(FmtSpan::CLOSE)
        .init();

    tracing::info!(
        "starting sensor-log: {} sectors of {} bytes, admin API on {}",
        cfg.flash_sectors,
        cfg.sector_size,
        cfg.api_listen_addr
    );

    // ===== COMPOSITION ROOT =====

    // 1. Outbound adapters
    let ticks = Arc::new(CounterTickSource::new(cfg.tick_period()));
    let device_sectors = cfg.flash_first_sector + cfg.flash_sectors;
    let device: Box<dyn FlashDevice> = match &cfg.flash_path {
        Some(path) => {
            tracing::info!("flash image at {}", path);
            Box::new(FileFlash::open(path, cfg.sector_size, device_sectors)?)
        }
        None => {
            tracing::warn!("no flash image configured, history lives in memory only");
            Box::new(MemFlash::new(cfg.sector_size, device_sectors))
        }
    };
    let params = Arc::new(DashMapParamStore::new());

    // 2. Flash Persistence Layer, recovered before the log picks its index
    let flush_wake = Arc::new(Notify::new());
    let push_wake = Arc::new(Notify::new());
    let store = Arc::new(FlashStore::new(
        device,
        FlashConfig {
            first_sector: cfg.flash_first_sector,
            num_sectors: cfg.flash_sectors,
            recovery_window: cfg.recovery_window,
            write_retries: cfg.write_retries,
        },
        push_wake.clone(),
    )?);
    let start_index = store.init();

    // 3. RAM Event Log
    let logging = params
        .get_bool(LOGGING_PARAM)
        .unwrap_or(cfg.logging_default);
    let log = Arc::new(EventLog::new(
        LogConfig {
            buffer_count: cfg.buffer_count,
            buffer_size: cfg.sector_size,
            quiescence_ticks: ticks.ticks_for(Duration::from_secs(cfg.quiescence_secs)),
        },
        ticks.clone(),
        flush_wake.clone(),
        start_index,
        logging,
    ));
    log.note_startup(BOOT_REASON_POWER_ON);

    // 4. Workers
    let shutdown = ShutdownController::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let flash_worker = spawn_flash_worker(
        log.clone(),
        store.clone(),
        flush_wake,
        FlashWorkerConfig {
            startup_delay: Duration::from_secs(cfg.flash_startup_delay_secs),
            interval: Duration::from_secs(cfg.flash_interval_secs),
        },
        shutdown.clone(),
    );

    let push_worker = match cfg.push_host.clone() {
        Some(host) => {
            tracing::info!(
                "pushing to {}:{}{} as sensor {}",
                host,
                cfg.push_port,
                cfg.push_path,
                cfg.sensor_id
            );
            let transport = Arc::new(HttpPushTransport::new(HttpPushConfig {
                host,
                port: cfg.push_port,
                path: cfg.push_path.clone(),
                response_timeout: Duration::from_secs(cfg.response_timeout_secs),
                drain_timeout: Duration::from_secs(cfg.drain_timeout_secs),
                ..HttpPushConfig::default()
            }));
            let service = PushService::new(
                PushConfig {
                    sensor_id: cfg.sensor_id,
                    key: cfg.push_key.clone(),
                    chunk_size: cfg.chunk_size,
                    post_time_interval_secs: cfg.post_time_interval_secs,
                    clock_ahead_tolerance_secs: cfg.clock_tolerance_secs,
                },
                store.clone(),
                transport,
                log.clone(),
                ticks.clone(),
                Arc::new(SystemWallClock::new()),
            );
            Some(spawn_push_worker(
                service,
                push_wake,
                PushWorkerConfig {
                    interval: Duration::from_secs(cfg.push_interval_secs),
                    backoff: BackoffConfig {
                        max: Duration::from_secs(cfg.max_hold_off_secs),
                        ..BackoffConfig::default()
                    },
                },
                shutdown.clone(),
            ))
        }
        None => {
            tracing::info!("no push server configured, replication disabled");
            None
        }
    };

    // 5. Inbound adapter: admin API, runs until shutdown
    let admin = Arc::new(AdminService::new(log.clone(), store.clone(), params));
    let api = AdminApi::new(cfg.api_listen_addr.clone(), admin);
    let api_shutdown = shutdown.clone();
    let served = api.run(async move { api_shutdown.wait().await }).await;

    shutdown.shutdown();
    if !shutdown.wait_for_drain(Duration::from_secs(10)).await {
        flash_worker.abort();
        if let Some(handle) = &push_worker {
            handle.abort();
        }
    }
    tracing::info!("sensor-log stopped");
    served
}
