//! Scheduler timing and admission control.

mod support;

use std::sync::Arc;
use std::time::Duration;

use modflux_bridge::config::BridgeConfig;
use modflux_bridge::health::PollHealth;
use modflux_bridge::poller::Poller;
use modflux_bridge::registry::TargetTable;
use modflux_bridge::scheduler::{Scheduler, TickOutcome};
use modflux_bridge::transport::ConnectionPool;
use modflux_influx::SinkWriter;
use support::{CaptureSink, GDT20_DEVICES, SimServer, config_json5};
use tokio::sync::watch;

const ONE_DEVICE: &str = r#"[{ id: 1, template: "gdt20" }]"#;

fn scheduler(server: &SimServer, interval_ms: u64, devices: &str) -> (Scheduler, Arc<PollHealth>) {
    let config = BridgeConfig::parse(&config_json5(server.port(), interval_ms, devices)).unwrap();
    scheduler_for(&config)
}

fn scheduler_for(config: &BridgeConfig) -> (Scheduler, Arc<PollHealth>) {
    let table = TargetTable::build(config).unwrap();
    let pool = ConnectionPool::new(table.endpoints(), config.modbus.timeout());
    let (_writer, handle) = SinkWriter::new(CaptureSink::default(), config.influxdb.writer_config());
    let health = Arc::new(PollHealth::new(table.targets().iter().map(|t| t.id.clone())));
    let poller = Arc::new(Poller::new(pool, handle, Arc::clone(&health)));
    (
        Scheduler::new(&table, poller, config.modbus.max_concurrent_polls),
        health,
    )
}

#[tokio::test]
async fn test_tick_skipped_while_previous_running() {
    let server = SimServer::start().await;
    // Three devices serialized on one connection: the tick takes ~450ms
    server.set_delay(Duration::from_millis(150));
    let (scheduler, health) = scheduler(&server, 100, GDT20_DEVICES);
    let group = &scheduler.groups()[0];

    let TickOutcome::Started(first) = group.try_tick() else {
        panic!("First tick must start");
    };
    assert!(group.is_busy());
    assert!(matches!(group.try_tick(), TickOutcome::Skipped));
    assert!(matches!(group.try_tick(), TickOutcome::Skipped));

    let summary = first.await.unwrap();
    assert_eq!(summary.polled, 3);
    assert_eq!(summary.failed, 0);
    assert!(summary.elapsed >= Duration::from_millis(400));

    // Skipped ticks issued no requests
    assert_eq!(server.requests(), 3);
    assert_eq!(health.ticks_skipped(), 2);

    assert!(!group.is_busy());
    assert!(matches!(group.try_tick(), TickOutcome::Started(_)));
}

#[tokio::test]
async fn test_first_tick_fires_one_interval_after_start() {
    let server = SimServer::start().await;
    let (scheduler, _) = scheduler(&server, 400, ONE_DEVICE);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run = tokio::spawn(scheduler.run(shutdown_rx));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.requests(), 0);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(server.requests(), 1);

    shutdown_tx.send(true).unwrap();
    run.await.unwrap();
}

#[tokio::test]
async fn test_shutdown_waits_for_in_flight_tick() {
    let server = SimServer::start().await;
    server.set_delay(Duration::from_millis(250));
    let (scheduler, health) = scheduler(&server, 100, ONE_DEVICE);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run = tokio::spawn(scheduler.run(shutdown_rx));

    // The first tick fires at 100ms and its response arrives around 350ms
    tokio::time::sleep(Duration::from_millis(150)).await;
    shutdown_tx.send(true).unwrap();
    run.await.unwrap();

    let snapshot = health.snapshot();
    assert_eq!(snapshot.ticks_started, 1);
    assert_eq!(snapshot.polls_ok, 1);
    assert_eq!(snapshot.polls_failed, 0);
}

#[tokio::test]
async fn test_one_group_per_interval() {
    let server = SimServer::start().await;
    let (scheduler, _) = scheduler(&server, 1000, GDT20_DEVICES);

    assert_eq!(scheduler.groups().len(), 1);
    let group = &scheduler.groups()[0];
    assert_eq!(group.interval(), Duration::from_secs(1));
    assert_eq!(group.targets().len(), 3);
}

/// Four devices, each behind its own delayed server.
async fn spread_devices(delay: Duration) -> (Vec<SimServer>, BridgeConfig) {
    let mut servers = Vec::new();
    for _ in 0..4 {
        let server = SimServer::start().await;
        server.set_delay(delay);
        servers.push(server);
    }

    let devices = servers
        .iter()
        .enumerate()
        .map(|(i, s)| format!(r#"{{ id: {}, template: "gdt20", port: {} }}"#, i + 1, s.port()))
        .collect::<Vec<_>>()
        .join(", ");
    let config =
        BridgeConfig::parse(&config_json5(servers[0].port(), 1000, &format!("[{devices}]"))).unwrap();
    (servers, config)
}

async fn tick_duration(config: &BridgeConfig) -> Duration {
    let (scheduler, _) = scheduler_for(config);
    let TickOutcome::Started(tick) = scheduler.groups()[0].try_tick() else {
        panic!("First tick must start");
    };
    let summary = tick.await.unwrap();
    assert_eq!(summary.polled, 4);
    assert_eq!(summary.failed, 0);
    summary.elapsed
}

#[tokio::test]
async fn test_fan_out_bounded_by_max_concurrent_polls() {
    let (servers, mut config) = spread_devices(Duration::from_millis(100)).await;

    config.modbus.max_concurrent_polls = 1;
    let serial = tick_duration(&config).await;
    assert!(serial >= Duration::from_millis(400), "took {serial:?}");

    config.modbus.max_concurrent_polls = 4;
    let parallel = tick_duration(&config).await;
    assert!(parallel < Duration::from_millis(300), "took {parallel:?}");

    // Each device was read once per tick on its own endpoint
    assert!(servers.iter().all(|s| s.requests() == 2));
}

#[tokio::test]
async fn test_interval_groups_are_independent() {
    let fast = SimServer::start().await;
    let slow = SimServer::start().await;
    slow.set_stalled(true);

    let config = BridgeConfig::parse(&format!(
        r#"{{
            modbus: {{ host: "127.0.0.1", port: {fast}, timeout_ms: 300 }},
            influxdb: {{
                url: "http://127.0.0.1:9",
                api: {{ version: "v1", database: "scada" }},
            }},
            templates: {{
                fast: {{ scan_interval_ms: 150, fields: [{{ address: 0, name: "a", type: "u16" }}] }},
                slow: {{ scan_interval_ms: 100, fields: [{{ address: 0, name: "b", type: "u16" }}] }},
            }},
            devices: [
                {{ id: 1, template: "fast" }},
                {{ id: 2, template: "slow", port: {slow} }},
            ],
        }}"#,
        fast = fast.port(),
        slow = slow.port(),
    ))
    .unwrap();

    let (scheduler, health) = scheduler_for(&config);
    assert_eq!(scheduler.groups().len(), 2);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run = tokio::spawn(scheduler.run(shutdown_rx));

    tokio::time::sleep(Duration::from_millis(1000)).await;
    shutdown_tx.send(true).unwrap();
    run.await.unwrap();

    // Fast ticks at 150ms steps kept going while the slow group was stuck
    assert!(fast.requests() >= 5, "fast requests: {}", fast.requests());
    assert!(slow.requests() <= 4, "slow requests: {}", slow.requests());
    assert!(health.ticks_skipped() >= 3);

    assert_eq!(
        health.device("1").unwrap().status,
        modflux_bridge::health::DeviceStatus::Online
    );
    assert_ne!(
        health.device("2").unwrap().status,
        modflux_bridge::health::DeviceStatus::Online
    );
}
