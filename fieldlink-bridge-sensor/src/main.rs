//! FieldLink sensor bridge.
//!
//! Reads blocks from a serial sensor terminal and forwards the latest one
//! to a Meshtastic mesh radio and to the broker on independent timers.

use std::collections::HashSet;

use anyhow::{Context, Result};
use fieldlink_bridge_framework::{BridgeArgs, BridgeConfig, BridgeError, BridgeRunner, Shutdown};
use fieldlink_bridge_sensor::broker::BrokerSink;
use fieldlink_bridge_sensor::config::SensorBridgeConfig;
use fieldlink_bridge_sensor::dispatcher::{DispatchTimer, SinkKind, run_sink_loop_after};
use fieldlink_bridge_sensor::journal::Journal;
use fieldlink_bridge_sensor::link::SerialOpener;
use fieldlink_bridge_sensor::locator::{DeviceLocator, SENSOR_ROLE, SystemPorts};
use fieldlink_bridge_sensor::mesh::{LabelTable, MeshSink};
use fieldlink_bridge_sensor::snapshot::SnapshotStore;
use fieldlink_bridge_sensor::supervisor::{
    MeshOpenSettings, SensorSupervisor, attach_mesh_radio, journal_link_transitions,
};
use serde_json::json;
use tokio::time::Instant;

const DEFAULT_CONFIG: &str = "fieldlink.json5";

#[tokio::main]
async fn main() -> Result<()> {
    let args = BridgeArgs::parse_with_default(DEFAULT_CONFIG);

    let mut config = if args.config_is_default {
        SensorBridgeConfig::load_or_default(&args.config)
    } else {
        SensorBridgeConfig::load(&args.config)
    }
    .with_context(|| format!("Failed to load config from {:?}", args.config))?;
    let unknown_roles = config.apply_port_overrides(&args);

    let mut runner = BridgeRunner::new_with_args("fieldlink-bridge-sensor", config, Some(&args))
        .await
        .context("Failed to start bridge")?;
    let config = runner.config().clone();

    let journal = Journal::open(&config.journal);
    journal.record(
        "bridge_start",
        json!({
            "version": runner.version(),
            "config": args.config.display().to_string(),
            "sensor_port": config.bridge.sensor.port,
            "mesh_port": config.bridge.mesh.port,
            "unknown_port_roles": unknown_roles,
            "broker_connected": runner.session().is_some(),
        }),
    );

    let locator = DeviceLocator::new(SystemPorts, journal.clone());
    locator.log_ports();

    // Sensor terminal is mandatory.
    let mut supervisor = SensorSupervisor::new(
        SerialOpener::new(config.bridge.sensor.baud_rate),
        locator.clone(),
        config.sensor_selector(),
        config.bridge.sensor.port.clone(),
        journal.clone(),
    )
    .with_reconnect(config.reconnect_delay(), config.bridge.reconnect.max_attempts)
    .with_raw_echo_interval(config.raw_echo_interval());

    let Some(sensor) = supervisor.attach(config.bridge.sensor.port.as_deref()).await else {
        tracing::error!("Sensor terminal not found, exiting");
        journal.record("bridge_start_failed", json!({ "reason": "sensor terminal not found" }));
        journal.close();
        return Err(BridgeError::discovery(SENSOR_ROLE)).context("Could not open the sensor terminal");
    };

    // Mesh radio is optional.
    let claimed: HashSet<String> = HashSet::from([sensor.located.path.clone()]);
    let mesh = attach_mesh_radio(
        &locator,
        &config.mesh_selector(),
        config.bridge.mesh.port.as_deref(),
        &claimed,
        MeshOpenSettings {
            baud_rate: config.bridge.mesh.baud_rate,
            write_timeout: config.mesh_write_timeout(),
            hop_limit: config.bridge.mesh.hop_limit,
        },
        &journal,
    )
    .await;
    if let Some(link) = &mesh {
        supervisor.claim(link.path());
    }

    let start = Instant::now();
    let store = SnapshotStore::new(config.storage_interval(), start);
    let shutdown = runner.shutdown();

    // Links close in order: sensor, then mesh, then broker. Each stage
    // releases the next by dropping its handle, which also happens if the
    // runner aborts the task.
    let sensor_closed = Shutdown::new();
    let mesh_closed = Shutdown::new();

    let mesh_sink = MeshSink::new(
        mesh,
        config.bridge.mesh.channel_index,
        config.message_gap(),
        LabelTable::with_overrides(&config.bridge.mesh.labels),
        journal.clone(),
    );
    let broker_sink = BrokerSink::new(runner.publisher(), runner.link_status(), journal.clone());

    let mesh_loop = run_sink_loop_after(
        mesh_sink,
        DispatchTimer::new(SinkKind::Mesh, config.mesh_interval(), start),
        store.reader(),
        journal.clone(),
        shutdown.listener(),
        sensor_closed.listener(),
    );
    let broker_loop = run_sink_loop_after(
        broker_sink,
        DispatchTimer::new(SinkKind::Broker, config.broker_interval(), start),
        store.reader(),
        journal.clone(),
        shutdown.listener(),
        mesh_closed.listener(),
    );
    let link_journal = journal_link_transitions(runner.link_status(), journal.clone(), shutdown.listener());

    // Tasks are joined in spawn order on shutdown.
    let sensor_shutdown = shutdown.clone();
    runner.spawn("sensor", async move {
        supervisor.run(sensor, store, sensor_shutdown).await;
        drop(sensor_closed);
    });
    runner.spawn("mesh-dispatch", async move {
        mesh_loop.await;
        drop(mesh_closed);
    });
    runner.spawn("broker-dispatch", async move {
        broker_loop.await;
    });
    runner.spawn("broker-link", link_journal);

    tracing::info!(
        mesh_interval_secs = config.bridge.mesh_interval_secs,
        broker_interval_secs = config.bridge.broker_interval_secs,
        "Bridge running"
    );

    let result = runner.run().await;

    journal.record(
        "bridge_shutdown",
        json!({ "clean": result.is_ok() }),
    );
    journal.close();

    result.context("Bridge stopped with an error")
}
