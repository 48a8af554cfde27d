//! Configuration management for the soil-moisture gateway
//!
//! Loads configuration from config.toml with environment variable overrides

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::archive::ReconnectPolicy;

/// Complete gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub influxdb: InfluxDbConfig,
    pub archive: ArchiveConfig,
    pub gateway: GatewayConfig,
    /// Live status publishing, disabled when absent
    #[serde(default)]
    pub mqtt: Option<MqttConfig>,
    /// Provisioned sensors
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

/// InfluxDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfluxDbConfig {
    pub url: String,
    pub org: String,
    pub bucket: String,
    pub token: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconnectMode {
    Manual,
    OnWrite,
    Interval,
}

/// Archive backlog and reconnection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    pub backlog_path: PathBuf,
    pub reconnect: ReconnectMode,
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_secs: u64,
    pub channel_capacity: usize,
}

fn default_reconnect_interval() -> u64 {
    60
}

impl ArchiveConfig {
    pub fn policy(&self) -> ReconnectPolicy {
        match self.reconnect {
            ReconnectMode::Manual => ReconnectPolicy::Manual,
            ReconnectMode::OnWrite => ReconnectPolicy::OnWrite,
            ReconnectMode::Interval => {
                ReconnectPolicy::Interval(Duration::from_secs(self.reconnect_interval_secs))
            }
        }
    }
}

/// Gateway process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub registry_path: PathBuf,
    /// Radio helper command line; frames are read from stdin when empty
    #[serde(default)]
    pub radio_command: Vec<String>,
}

/// MQTT broker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub broker_url: String,
    pub client_id: String,
    pub topic_prefix: String,
}

/// One provisioned sensor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub id: u32,
    pub label: String,
}

impl Config {
    /// Load configuration from file
    ///
    /// Environment variables override config file values:
    /// - INFLUXDB_TOKEN: Override InfluxDB token
    pub fn load(path: &str) -> Result<Self> {
        let config_str = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let mut config = Self::parse(&config_str)
            .with_context(|| format!("Failed to parse config file: {}", path))?;

        if let Ok(token) = std::env::var("INFLUXDB_TOKEN") {
            tracing::info!("Using INFLUXDB_TOKEN from environment");
            config.influxdb.token = token;
        }

        config.validate()?;

        Ok(config)
    }

    fn parse(config_str: &str) -> Result<Self> {
        Ok(toml::from_str(config_str)?)
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        if !self.influxdb.url.starts_with("http://") && !self.influxdb.url.starts_with("https://") {
            anyhow::bail!("Invalid InfluxDB URL: {} (must start with http:// or https://)", self.influxdb.url);
        }

        if self.influxdb.bucket.is_empty() {
            anyhow::bail!("InfluxDB bucket must not be empty");
        }

        if self.archive.channel_capacity == 0 {
            anyhow::bail!("Archive channel_capacity must be greater than 0");
        }

        if self.archive.reconnect == ReconnectMode::Interval && self.archive.reconnect_interval_secs == 0 {
            anyhow::bail!("Archive reconnect_interval_secs must be greater than 0");
        }

        if let Some(mqtt) = &self.mqtt {
            if !mqtt.broker_url.starts_with("mqtt://") && !mqtt.broker_url.starts_with("mqtts://") {
                anyhow::bail!("Invalid MQTT broker URL: {} (must start with mqtt:// or mqtts://)", mqtt.broker_url);
            }
        }

        let mut seen = HashSet::new();
        for device in &self.devices {
            if device.id > 0x00FF_FFFF {
                anyhow::bail!("Device id {:#x} does not fit in 24 bits", device.id);
            }
            if !seen.insert(device.id) {
                anyhow::bail!("Device id {:#08x} is configured twice", device.id);
            }
        }

        Ok(())
    }
}
