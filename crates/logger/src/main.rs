//! usb-line-logger
//!
//! Captures text lines from a USB CDC device, stamps them with wall-clock
//! time and appends them to log files on a mounted volume, mirroring every
//! line to stdout.

mod config;
mod console;
mod rtc;
mod service;
mod tasks;
mod usb;

use anyhow::{Context, Result};
use capture::{ClockAdapter, DirStorage, Pipeline, SharedClock};
use clap::Parser;
use common::{UsbBridge, UsbCommand, create_usb_bridge, setup_logging};
use config::LoggerConfig;
use console::{CommandContext, StdoutConsole};
use service::Heartbeat;
use std::path::PathBuf;
use tasks::{PersistCommand, ReassemblyParts};
use tokio::signal;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};
use usb::{WorkerHandle, WorkerOptions, spawn_usb_worker};

#[derive(Parser, Debug)]
#[command(name = "usb-line-logger")]
#[command(
    author,
    version,
    about = "USB line logger - capture CDC serial output to timestamped log files"
)]
#[command(long_about = "
Reads text lines from the first USB CDC device that appears, stamps each line
with the wall-clock time and appends it to a log file. Every line is also
printed to stdout.

EXAMPLES:
    # Run with default config
    usb-line-logger

    # Log to a mounted card
    usb-line-logger --log-dir /mnt/sdcard

    # List USB devices and the endpoint that would be read
    usb-line-logger --list-devices

    # Run as systemd service (no command console)
    usb-line-logger --service

COMMANDS (typed on stdin):
    gettime | settime YYYY-MM-DD HH:MM:SS | newlog | status | help

CONFIGURATION:
    The logger looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usb-line-logger/logger.toml
    3. /etc/usb-line-logger/logger.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Run as systemd service (no command console)
    #[arg(long)]
    service: bool,

    /// List USB devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Directory for log files (overrides storage.log_dir)
    #[arg(long, value_name = "PATH")]
    log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = LoggerConfig::default();
        let path = LoggerConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let mut config = match &args.config {
        Some(path) => config::load_config(path).context("Failed to load configuration")?,
        None => LoggerConfig::load_or_default(),
    };
    if let Some(dir) = args.log_dir {
        config.storage.log_dir = dir;
    }

    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logger.log_level.clone());
    setup_logging(&log_level).context("Failed to setup logging")?;

    info!("usb-line-logger v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    let worker_options =
        WorkerOptions::from_settings(&config.usb).context("Invalid USB configuration")?;
    let (usb_bridge, worker) = create_usb_bridge();

    if args.list_devices {
        let mut handle =
            spawn_usb_worker(worker, worker_options, None).context("Failed to spawn USB worker")?;
        handle
            .wait_started()
            .await
            .context("Failed to initialize USB")?;
        let result = list_devices_mode(&usb_bridge).await;
        shutdown_usb_worker(&usb_bridge, handle).await;
        return result;
    }

    let service_mode = args.service || config.logger.service_mode;
    run_logger(config, service_mode, usb_bridge, worker, worker_options).await
}

/// List USB devices and exit
async fn list_devices_mode(usb_bridge: &UsbBridge) -> Result<()> {
    info!("Listing USB devices...");

    let (tx, rx) = oneshot::channel();
    usb_bridge
        .send_command(UsbCommand::ListDevices { response: tx })
        .await
        .context("Failed to send ListDevices command")?;

    let devices = rx.await.context("Failed to receive device list")?;

    if devices.is_empty() {
        println!("No USB devices found.");
    } else {
        println!("Found {} USB device(s):\n", devices.len());
        for device in devices {
            println!("  {}", device);
        }
    }

    Ok(())
}

async fn run_logger(
    config: LoggerConfig,
    service_mode: bool,
    usb_bridge: UsbBridge,
    worker: common::UsbWorker,
    worker_options: WorkerOptions,
) -> Result<()> {
    let source = rtc::open_clock_source(&config.clock);
    let clock = SharedClock::new(ClockAdapter::new(source, config.clock.resync()));
    rtc::log_clock_state(clock.is_available());

    let log_dir = config.storage.expanded_log_dir();
    let storage = DirStorage::new(&log_dir, config.storage.sync_on_flush);
    let Pipeline {
        ingestion,
        assembler,
        batch,
        mut persistence,
        gauge,
        gate,
        counters,
        clock,
    } = Pipeline::build(&config.pipeline_config(), storage, clock);

    match persistence.start_session() {
        Ok(name) => info!("Logging to {}", log_dir.join(name).display()),
        Err(e) => warn!(
            "No log file in {}: {}, lines are kept in memory until `newlog`",
            log_dir.display(),
            e
        ),
    }

    let mut usb_handle = spawn_usb_worker(worker, worker_options, Some(ingestion))
        .context("Failed to spawn USB worker")?;
    usb_handle
        .wait_started()
        .await
        .context("Failed to initialize USB")?;
    let event_logger = tasks::spawn_event_logger(usb_bridge.clone());

    let (stop_tx, stop_rx) = watch::channel(false);
    let reassembly_beat = Heartbeat::new();
    let persist_beat = Heartbeat::new();

    let reassembly = tasks::spawn_reassembly(
        ReassemblyParts {
            assembler,
            batch,
            clock: clock.clone(),
            console: Box::new(StdoutConsole),
        },
        config.pipeline.reassembly_period(),
        reassembly_beat.clone(),
        stop_rx.clone(),
    );

    let (persist_tx, persist_rx) = mpsc::channel(16);
    let persistence_task = tasks::spawn_persistence(
        persistence,
        config.storage.persist_period(),
        persist_beat.clone(),
        persist_rx,
    );

    if service_mode {
        info!("Running in service mode, command console disabled");
    } else {
        let context = CommandContext {
            clock,
            persist: persist_tx.clone(),
            gauge,
            gate,
            counters,
        };
        tokio::spawn(console::run_command_surface(context, stop_rx));
        info!("Type 'help' for commands");
    }

    if service::is_systemd() {
        info!("Running under systemd");
    }
    let watchdog = service::spawn_watchdog_task(vec![
        ("reassembly", reassembly_beat),
        ("persistence", persist_beat),
    ]);
    service::notify_ready().context("Failed to notify systemd ready")?;

    info!("Press Ctrl+C to shutdown");
    match signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, shutting down gracefully..."),
        Err(e) => error!("Error waiting for Ctrl+C: {}", e),
    }

    if let Err(e) = service::notify_stopping() {
        error!("Failed to notify systemd stopping: {:#}", e);
    }
    if let Some(handle) = watchdog {
        handle.abort();
    }

    // Ingestion stops first so the last reassembly pass sees every byte
    shutdown_usb_worker(&usb_bridge, usb_handle).await;

    let _ = stop_tx.send(true);
    let mut parts = reassembly.await.context("Reassembly task failed")?;
    let forwarded = parts.drain();
    debug!("Final reassembly pass forwarded {} lines", forwarded);

    let (tx, rx) = oneshot::channel();
    if persist_tx
        .send(PersistCommand::Shutdown { response: tx })
        .await
        .is_ok()
    {
        match rx.await {
            Ok(stats) => info!(
                "Wrote {} lines ({} bytes) in {} flushes, {} lines lost",
                stats.lines_written, stats.bytes_written, stats.flush_ops, stats.lines_lost
            ),
            Err(_) => warn!("Persistence stopped before the final flush"),
        }
    }
    if let Err(e) = persistence_task.await {
        error!("Persistence task failed: {}", e);
    }
    if let Err(e) = event_logger.await {
        debug!("Event logger ended: {}", e);
    }

    info!("Shutdown complete");
    Ok(())
}

/// Stop the USB worker thread and wait for it
async fn shutdown_usb_worker(usb_bridge: &UsbBridge, handle: WorkerHandle) {
    info!("Shutting down USB subsystem...");
    if let Err(e) = usb_bridge.send_command(UsbCommand::Shutdown).await {
        debug!("USB worker already gone: {}", e);
    }

    match tokio::task::spawn_blocking(move || handle.thread.join()).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => error!("USB worker failed: {}", e),
        Ok(Err(e)) => error!("USB worker thread panicked: {:?}", e),
        Err(e) => error!("Failed to join USB worker: {}", e),
    }
}
