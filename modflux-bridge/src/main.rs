//! Modbus TCP to InfluxDB bridge.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use modflux_bridge::config::BridgeConfig;
use modflux_bridge::health::PollHealth;
use modflux_bridge::poller::Poller;
use modflux_bridge::registry::TargetTable;
use modflux_bridge::scheduler::Scheduler;
use modflux_bridge::transport::ConnectionPool;
use modflux_common::LoggingConfig;
use modflux_influx::{InfluxClient, SinkHandle, SinkWriter};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Polls Modbus TCP devices and writes their registers to InfluxDB.
#[derive(Parser, Debug)]
#[command(name = "modflux-bridge")]
#[command(about = "Polls Modbus TCP devices and writes samples to InfluxDB")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format)
    #[arg(short, long, default_value = "modflux.json5")]
    config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = BridgeConfig::load_from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    let log_config = LoggingConfig {
        level: args
            .log_level
            .clone()
            .unwrap_or_else(|| config.logging.level.clone()),
        format: config.logging.format,
    };
    modflux_common::init_tracing(&log_config).context("Failed to init tracing")?;

    info!(config = ?args.config, "Starting modflux-bridge");

    let table = TargetTable::build(&config).context("Invalid configuration")?;
    for target in table.targets() {
        info!(
            device = %target.id,
            unit = target.unit_id,
            endpoint = %target.endpoint,
            template = %target.template.name,
            interval_ms = target.interval.as_millis() as u64,
            registers = target.template.span,
            "Poll target"
        );
    }

    for endpoint in table.endpoints() {
        let devices: Vec<&str> = table
            .at_endpoint(endpoint)
            .into_iter()
            .map(|t| t.id.as_str())
            .collect();
        info!(endpoint = %endpoint, devices = ?devices, "Modbus endpoint");
    }

    let pool = ConnectionPool::new(table.endpoints(), config.modbus.timeout());
    let client = InfluxClient::new(&config.influxdb).context("Failed to create InfluxDB client")?;
    info!(url = %client.write_url(), "InfluxDB sink configured");

    let (writer, sink) = SinkWriter::new(client, config.influxdb.writer_config());
    let health = Arc::new(PollHealth::new(
        table.targets().iter().map(|t| t.id.clone()),
    ));
    let poller = Arc::new(Poller::new(pool.clone(), sink.clone(), Arc::clone(&health)));
    let scheduler = Scheduler::new(&table, poller, config.modbus.max_concurrent_polls);

    info!(
        devices = table.len(),
        endpoints = pool.len(),
        interval_groups = scheduler.groups().len(),
        "Bridge running"
    );

    // Polling stops first; the writer keeps flushing until the scheduler is done.
    let (poll_shutdown_tx, poll_shutdown_rx) = watch::channel(false);
    let (sink_shutdown_tx, sink_shutdown_rx) = watch::channel(false);

    let writer_task = tokio::spawn(writer.run(sink_shutdown_rx));
    let scheduler_task = tokio::spawn(scheduler.run(poll_shutdown_rx.clone()));
    let stats_task = (config.stats_interval_secs > 0).then(|| {
        tokio::spawn(report_stats(
            Arc::clone(&health),
            sink.clone(),
            Duration::from_secs(config.stats_interval_secs),
            poll_shutdown_rx,
        ))
    });

    wait_for_signal().await;

    let _ = poll_shutdown_tx.send(true);
    if let Err(e) = scheduler_task.await {
        error!(error = %e, "Scheduler task failed");
    }
    pool.close_all().await;

    sink_shutdown_tx.send(true)?;
    if let Err(e) = writer_task.await {
        error!(error = %e, "Sink writer task failed");
    }
    if let Some(task) = stats_task
        && let Err(e) = task.await
    {
        error!(error = %e, "Stats reporter task failed");
    }

    log_stats(&health, &sink, "Final statistics");
    info!("modflux-bridge stopped");
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!(error = %e, "Cannot listen for Ctrl+C");
            }
            info!("Received Ctrl+C, shutting down...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        }
    }
}

async fn report_stats(
    health: Arc<PollHealth>,
    sink: SinkHandle,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = ticker.tick() => log_stats(&health, &sink, "Bridge statistics"),
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

fn log_stats(health: &PollHealth, sink: &SinkHandle, message: &str) {
    let poll = health.snapshot();
    let writer = sink.stats();
    info!(
        status = %poll.status,
        devices_online = poll.devices_online,
        devices_offline = poll.devices_offline,
        polls_ok = poll.polls_ok,
        polls_failed = poll.polls_failed,
        ticks_skipped = poll.ticks_skipped,
        samples_produced = poll.samples_produced,
        samples_skipped = poll.samples_skipped,
        samples_written = writer.samples_written,
        samples_dropped = writer.samples_dropped,
        samples_overflowed = writer.samples_overflowed,
        buffered = sink.buffered(),
        "{}",
        message
    );

    for (device, liveness) in &poll.devices {
        if liveness.consecutive_failures > 0 {
            warn!(
                device = %device,
                status = %liveness.status,
                failures = liveness.consecutive_failures,
                error = liveness.last_error.as_deref().unwrap_or(""),
                "Device not responding"
            );
        }
    }

    match serde_json::to_string(&poll) {
        Ok(json) => debug!(health = %json, "Health snapshot"),
        Err(e) => warn!(error = %e, "Cannot serialize health snapshot"),
    }
}
