//! Soil-moisture radio gateway service
//!
//! This service:
//! - Spawns the radio helper as a subprocess (or reads stdin) and parses
//!   received frames from its output
//! - Validates and decodes sensor frames, updating the device registry
//! - Archives frames and metrics to InfluxDB, queueing to a local backlog
//!   while the database is unreachable
//! - Optionally publishes live device status to MQTT
//!
//! Architecture: radio helper → stdout → feed → pipeline → channel → drain → InfluxDB

use anyhow::{Context, Result};
use soil_gateway::archive::{spawn_reconnect_task, Archive, ReconnectPolicy};
use soil_gateway::backlog::Backlog;
use soil_gateway::config::Config;
use soil_gateway::feed::{feed_outcome, run_feed};
use soil_gateway::frame::Decoder;
use soil_gateway::influxdb::InfluxDbConnector;
use soil_gateway::mqtt::StatusPublisher;
use soil_gateway::pipeline::{drain, Pipeline};
use soil_gateway::registry::DeviceRegistry;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::process::Command;
use tracing::{error, info, warn};

const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber for structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .init();

    if let Err(e) = run().await {
        error!(error = %format!("{e:#}"), "Gateway failed");
        return Err(e);
    }
    Ok(())
}

async fn run() -> Result<()> {
    info!("Soil-moisture gateway starting");

    let config_path =
        std::env::var("SOIL_GATEWAY_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load {}", config_path))?;
    info!(path = %config_path, "Configuration loaded successfully");

    // Devices are only ever added here, never from received frames
    let mut registry = DeviceRegistry::load(&config.gateway.registry_path)?;
    for device in &config.devices {
        registry.provision(device.id, &device.label);
    }
    info!(devices = registry.len(), "Device registry ready");

    let policy = config.archive.policy();
    let archive = Arc::new(
        Archive::open(
            Box::new(InfluxDbConnector::new(config.influxdb.clone())),
            Backlog::new(&config.archive.backlog_path),
            policy,
        )
        .await,
    );
    for device in &config.devices {
        archive.set_device_name(device.id, &device.label).await;
    }

    let reconnect_handle = match policy {
        ReconnectPolicy::Interval(period) => {
            info!(period_secs = period.as_secs(), "Scheduling archive reconnects");
            Some(spawn_reconnect_task(Arc::clone(&archive), period))
        }
        ReconnectPolicy::Manual | ReconnectPolicy::OnWrite => None,
    };

    let status = match &config.mqtt {
        Some(mqtt) => {
            let publisher = StatusPublisher::new(&mqtt.broker_url, &mqtt.client_id, &mqtt.topic_prefix)
                .context("Failed to create MQTT client")?;
            for device in &config.devices {
                if let Err(e) = publisher.publish_label(device.id, &device.label).await {
                    warn!(error = %e, "Failed to publish device label");
                }
            }
            Some(publisher)
        }
        None => None,
    };

    let (pipeline, rx) = Pipeline::new(
        Decoder::default(),
        registry,
        config.archive.channel_capacity,
    );
    let drain_handle = tokio::spawn(drain(rx, Arc::clone(&archive), status));

    // Spawn the radio helper, or read frames from stdin without one
    let mut child = None;
    let mut feed_handle = match config.gateway.radio_command.split_first() {
        Some((program, args)) => {
            info!(command = ?config.gateway.radio_command, "Spawning radio helper");
            let mut helper = Command::new(program)
                .args(args)
                .stdout(Stdio::piped())
                .stderr(Stdio::inherit())
                .kill_on_drop(true)
                .spawn()
                .with_context(|| format!("Failed to spawn radio helper: {}", program))?;
            let stdout = helper
                .stdout
                .take()
                .context("Failed to capture radio helper stdout")?;
            child = Some(helper);
            tokio::spawn(run_feed(BufReader::new(stdout), pipeline.clone()))
        }
        None => {
            info!("No radio helper configured, reading frames from stdin");
            tokio::spawn(run_feed(BufReader::new(tokio::io::stdin()), pipeline.clone()))
        }
    };

    info!("Gateway running. Press Ctrl+C to stop.");
    let feed_result = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully");
            Ok(())
        }
        joined = &mut feed_handle => feed_outcome(joined),
    };

    // Waits for an in-flight frame, then refuses new ones
    pipeline.close().await;
    feed_handle.abort();

    if let Some(mut helper) = child {
        info!("Killing radio helper");
        helper.kill().await.ok();
    }

    // Archive what is still queued
    drain_handle.await.ok();
    if let Some(handle) = reconnect_handle {
        handle.abort();
    }

    match archive.pending().await {
        Ok(0) => {}
        Ok(pending) => warn!(pending, "Archive backlog not empty at shutdown"),
        Err(e) => error!(error = %e, "Failed to read archive backlog at shutdown"),
    }

    pipeline
        .save_registry(&config.gateway.registry_path)
        .await
        .context("Failed to save device registry")?;

    // shutdown is complete; a failed feed still ends with an error
    feed_result?;

    info!("Soil-moisture gateway stopped");
    Ok(())
}
