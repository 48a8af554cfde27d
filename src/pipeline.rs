//! Ingest pipeline
//!
//! Architecture: radio trigger → decode → registry update → channel →
//! drain task → archive (+ status publisher)
//!
//! Decoding and the registry update run under one lock, and the archive
//! submission is enqueued before that lock is released, so frames from any
//! number of triggers are processed one at a time and in arrival order. Sink
//! latency is absorbed by the single-consumer drain task.

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

use crate::archive::{Archive, ArchiveWrite, Channel};
use crate::frame::{DecodedReading, Decoder, RawFrame};
use crate::influxdb::device_tag;
use crate::mqtt::StatusPublisher;
use crate::registry::DeviceRegistry;

/// An accepted reading on its way to the archive
#[derive(Debug, Clone)]
pub struct Accepted {
    pub reading: DecodedReading,
    pub frame: RawFrame,
}

impl Accepted {
    /// The raw frame followed by the two derived metrics
    pub fn archive_writes(&self) -> [ArchiveWrite; 3] {
        let time = self.frame.received_at;
        let device_id = self.reading.device_id;
        // f32 decivolts widened without the binary noise
        let battery = (f64::from(self.reading.battery_voltage) * 10.0).round() / 10.0;

        [
            ArchiveWrite::Frame {
                time,
                device_id,
                rssi: self.frame.rssi,
                frame: self.frame.bytes.clone(),
            },
            ArchiveWrite::Metric {
                time,
                device_id,
                channel: Channel::SoilMoisture,
                value: f64::from(self.reading.moisture),
            },
            ArchiveWrite::Metric {
                time,
                device_id,
                channel: Channel::BatteryVoltage,
                value: battery,
            },
        ]
    }
}

struct Core {
    registry: DeviceRegistry,
    queue: Option<mpsc::Sender<Accepted>>,
}

/// Cloneable handle shared by every receive trigger
#[derive(Clone)]
pub struct Pipeline {
    decoder: Decoder,
    core: Arc<Mutex<Core>>,
}

impl Pipeline {
    /// Create the pipeline and the receiving end of its archive queue
    pub fn new(
        decoder: Decoder,
        registry: DeviceRegistry,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Accepted>) {
        let (tx, rx) = mpsc::channel(capacity);
        let pipeline = Self {
            decoder,
            core: Arc::new(Mutex::new(Core {
                registry,
                queue: Some(tx),
            })),
        };
        (pipeline, rx)
    }

    /// Run one decode → update → submit cycle for a received frame
    ///
    /// Returns whether the caller should keep receiving, which is the case
    /// until the pipeline is closed.
    pub async fn receive_now(&self, frame: RawFrame) -> bool {
        let mut guard = self.core.lock().await;
        let core = &mut *guard;

        let Some(queue) = core.queue.as_ref() else {
            return false;
        };

        // NaN and infinities have no JSON form in the snapshot or backlog
        if !frame.rssi.is_finite() {
            warn!(rssi = frame.rssi, frame = %frame.hex(), "RX: frame rejected, RSSI not finite");
            return true;
        }

        let reading = match self.decoder.decode(&frame, &core.registry) {
            Ok(reading) => reading,
            Err(e) => {
                warn!(rssi = frame.rssi, frame = %frame.hex(), error = %e, "RX: frame rejected");
                return true;
            }
        };

        core.registry
            .update(reading.device_id, &reading, frame.rssi, frame.received_at);

        info!(
            rssi = frame.rssi,
            frame = %frame.hex(),
            device = %device_tag(reading.device_id),
            moisture_pct = reading.moisture,
            battery_v = reading.battery_voltage,
            "RX: reading accepted"
        );

        if queue.send(Accepted { reading, frame }).await.is_err() {
            error!("Archive queue closed, reading not archived");
            return false;
        }
        true
    }

    /// Stop accepting frames; the drain task finishes the queued ones
    pub async fn close(&self) {
        self.core.lock().await.queue = None;
    }

    pub async fn with_registry<R>(&self, f: impl FnOnce(&DeviceRegistry) -> R) -> R {
        f(&self.core.lock().await.registry)
    }

    pub async fn save_registry(&self, path: impl AsRef<Path>) -> Result<()> {
        self.core.lock().await.registry.save(path)
    }
}

/// Archive accepted readings until the pipeline is closed and drained
pub async fn drain(
    mut rx: mpsc::Receiver<Accepted>,
    archive: Arc<Archive>,
    status: Option<StatusPublisher>,
) {
    info!("Starting archive drain");

    while let Some(accepted) = rx.recv().await {
        for write in accepted.archive_writes() {
            archive.record(write).await;
        }

        if let Some(status) = &status {
            if let Err(e) = status
                .publish_reading(&accepted.reading, accepted.frame.rssi)
                .await
            {
                error!(error = %e, "Failed to publish status to MQTT");
            }
        }
    }

    info!("Archive drain stopped");
}
