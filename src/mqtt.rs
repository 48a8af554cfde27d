//! MQTT status publisher
//!
//! Publishes each device's latest state as retained messages so that a
//! dashboard or home-automation system can show live values:
//! - soil/00ee58/label
//! - soil/00ee58/moisture
//! - soil/00ee58/battery_voltage
//! - soil/00ee58/fast_update_periods
//! - soil/00ee58/raw
//! - soil/00ee58/rssi

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::frame::DecodedReading;
use crate::influxdb::device_tag;

const MIN_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// MQTT client publishing device status
pub struct StatusPublisher {
    client: AsyncClient,
    topic_prefix: String,
    _event_loop_handle: JoinHandle<()>,
}

impl StatusPublisher {
    /// Start the publisher; the broker connection is made in the background
    ///
    /// # Arguments
    /// * `broker_url` - URL like "mqtt://localhost:1883"
    /// * `client_id` - Unique client identifier
    /// * `topic_prefix` - First topic level, e.g. "soil"
    pub fn new(broker_url: &str, client_id: &str, topic_prefix: &str) -> Result<Self> {
        let (host, port) = parse_broker_url(broker_url)?;
        info!(host = %host, port, client_id, "Starting status publisher");

        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(Duration::from_secs(30));

        let (client, event_loop) = AsyncClient::new(options, 10);
        let event_loop_handle = tokio::spawn(drive_event_loop(event_loop));

        Ok(Self {
            client,
            topic_prefix: topic_prefix.to_string(),
            _event_loop_handle: event_loop_handle,
        })
    }

    /// Publish a retained message to a topic
    pub async fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        self.client
            .publish(topic, QoS::AtLeastOnce, true, payload.as_bytes())
            .await
            .with_context(|| format!("Failed to publish to topic: {}", topic))?;

        debug!(topic = topic, payload_len = payload.len(), "Published to MQTT");
        Ok(())
    }

    /// Publish a device's location label
    pub async fn publish_label(&self, device_id: u32, label: &str) -> Result<()> {
        let topic = Self::build_topic(&self.topic_prefix, device_id, "label");
        self.publish(&topic, label).await
    }

    /// Publish the values of an accepted reading
    pub async fn publish_reading(&self, reading: &DecodedReading, rssi: f64) -> Result<()> {
        let values = [
            ("moisture", reading.moisture.to_string()),
            ("battery_voltage", format!("{:.1}", reading.battery_voltage)),
            ("fast_update_periods", reading.fast_update_periods.to_string()),
            ("raw", reading.raw.to_string()),
            ("rssi", format!("{:.1}", rssi)),
        ];

        for (metric, value) in values {
            let topic = Self::build_topic(&self.topic_prefix, reading.device_id, metric);
            self.publish(&topic, &value).await?;
        }
        Ok(())
    }

    /// Build topic name for a device metric
    pub fn build_topic(prefix: &str, device_id: u32, metric: &str) -> String {
        format!("{}/{}/{}", prefix, device_tag(device_id), metric)
    }
}

/// Keep the broker session alive; rumqttc reconnects on the poll after an error
///
/// Retained status is republished with the next accepted reading, so
/// readings published while the broker is away are simply superseded.
async fn drive_event_loop(mut event_loop: EventLoop) {
    let mut backoff = MIN_BACKOFF;
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("Status broker connected");
                backoff = MIN_BACKOFF;
            }
            Ok(event) => debug!(?event, "Status broker event"),
            Err(e) => {
                warn!(error = %e, retry_in_secs = backoff.as_secs(), "Status broker unreachable");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
}

/// Split `mqtt://host[:port]` or `mqtts://host[:port]`
///
/// The port defaults to 1883, or 8883 for `mqtts`.
fn parse_broker_url(url: &str) -> Result<(String, u16)> {
    let (authority, default_port) = if let Some(rest) = url.strip_prefix("mqtt://") {
        (rest, 1883)
    } else if let Some(rest) = url.strip_prefix("mqtts://") {
        (rest, 8883)
    } else {
        anyhow::bail!("Invalid MQTT URL: {} (must start with mqtt:// or mqtts://)", url);
    };
    let authority = authority.trim_end_matches('/');

    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) => (
            host,
            port.parse::<u16>()
                .with_context(|| format!("Invalid port in MQTT URL: {}", url))?,
        ),
        None => (authority, default_port),
    };
    if host.is_empty() {
        anyhow::bail!("MQTT URL has no host: {}", url);
    }
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_broker_url() {
        let (host, port) = parse_broker_url("mqtt://localhost:1883").unwrap();
        assert_eq!(host, "localhost");
        assert_eq!(port, 1883);

        let (host, port) = parse_broker_url("mqtts://192.168.1.100:8883").unwrap();
        assert_eq!(host, "192.168.1.100");
        assert_eq!(port, 8883);

        // Default ports follow the scheme
        let (host, port) = parse_broker_url("mqtt://broker.local").unwrap();
        assert_eq!(host, "broker.local");
        assert_eq!(port, 1883);
        let (_, port) = parse_broker_url("mqtts://broker.local/").unwrap();
        assert_eq!(port, 8883);

        assert!(parse_broker_url("http://localhost:1883").is_err());
        assert!(parse_broker_url("mqtt://localhost:port").is_err());
        assert!(parse_broker_url("mqtt://:1883").is_err());
    }

    #[test]
    fn test_build_topic() {
        assert_eq!(
            StatusPublisher::build_topic("soil", 0x00EE58, "moisture"),
            "soil/00ee58/moisture"
        );
        assert_eq!(
            StatusPublisher::build_topic("soil", 0x00EF32, "label"),
            "soil/00ef32/label"
        );
    }
}
