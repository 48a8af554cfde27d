//! Resilient archive
//!
//! Every accepted write is either committed to the time-series sink or
//! appended to the local backlog; nothing is surfaced to the caller.
//!
//! Bootstrap (connect, ensure schema, replay backlog) runs when the archive
//! is opened and whenever [`Archive::reconnect`] is called. Replay is
//! at-least-once: the backlog is truncated only after every entry was
//! committed, so an interrupted replay starts over from the first entry.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backlog::{self, Backlog, BacklogEntry};

/// Metric channels recorded per reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    SoilMoisture,
    BatteryVoltage,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::SoilMoisture => "soil_moisture",
            Channel::BatteryVoltage => "battery_voltage",
        }
    }
}

/// One logical durable write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ArchiveWrite {
    Frame {
        time: DateTime<Utc>,
        device_id: u32,
        rssi: f64,
        #[serde(with = "hex::serde")]
        frame: Vec<u8>,
    },
    Metric {
        time: DateTime<Utc>,
        device_id: u32,
        channel: Channel,
        value: f64,
    },
    /// Device display name as of `time`; the newest one wins
    DeviceName {
        time: DateTime<Utc>,
        device_id: u32,
        label: String,
    },
}

impl ArchiveWrite {
    pub fn device_id(&self) -> u32 {
        match self {
            ArchiveWrite::Frame { device_id, .. }
            | ArchiveWrite::Metric { device_id, .. }
            | ArchiveWrite::DeviceName { device_id, .. } => *device_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ArchiveWrite::Frame { .. } => "frame",
            ArchiveWrite::Metric { channel, .. } => channel.as_str(),
            ArchiveWrite::DeviceName { .. } => "device_name",
        }
    }
}

/// Why a sink did not commit a write
#[derive(Debug, Error)]
pub enum SinkError {
    /// The sink refused this write and will refuse it again
    #[error("write rejected: {0}")]
    Rejected(String),

    /// The sink could not be reached or failed transiently
    #[error(transparent)]
    Unavailable(#[from] anyhow::Error),
}

/// A live connection to the time-series store
#[async_trait]
pub trait Sink: Send + Sync {
    /// Create whatever storage the writes need; must succeed when it exists
    async fn ensure_schema(&self) -> Result<()>;

    /// Commit one write
    async fn execute(&self, write: &ArchiveWrite) -> std::result::Result<(), SinkError>;
}

/// Opens sink connections
#[async_trait]
pub trait SinkConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Sink>>;
}

/// When the archive tries to (re)establish its sink connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPolicy {
    /// Only when opened or when `reconnect` is called explicitly
    Manual,
    /// Before a write, whenever no connection is held
    OnWrite,
    /// From a scheduler task, see [`spawn_reconnect_task`]
    Interval(Duration),
}

struct ArchiveState {
    sink: Option<Box<dyn Sink>>,
    backlog: Backlog,
}

pub struct Archive {
    connector: Box<dyn SinkConnector>,
    policy: ReconnectPolicy,
    state: Mutex<ArchiveState>,
}

impl Archive {
    /// Create the archive and run a first bootstrap
    ///
    /// An unreachable sink is not an error: the archive starts disconnected
    /// and queues writes in the backlog.
    pub async fn open(
        connector: Box<dyn SinkConnector>,
        backlog: Backlog,
        policy: ReconnectPolicy,
    ) -> Self {
        let archive = Self {
            connector,
            policy,
            state: Mutex::new(ArchiveState {
                sink: None,
                backlog,
            }),
        };

        archive.reconnect().await;
        archive
    }

    pub fn policy(&self) -> ReconnectPolicy {
        self.policy
    }

    /// Re-establish the sink connection and replay the backlog
    ///
    /// Returns whether the archive is connected afterwards.
    pub async fn reconnect(&self) -> bool {
        let mut state = self.state.lock().await;
        self.bootstrap(&mut state).await
    }

    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.sink.is_some()
    }

    /// Writes waiting in the backlog
    pub async fn pending(&self) -> backlog::Result<usize> {
        self.state.lock().await.backlog.pending()
    }

    /// Commit `write` to the sink, or queue it locally
    pub async fn record(&self, write: ArchiveWrite) {
        let mut state = self.state.lock().await;

        if state.sink.is_none() && self.policy == ReconnectPolicy::OnWrite {
            self.bootstrap(&mut state).await;
        }

        if let Some(sink) = &state.sink {
            match sink.execute(&write).await {
                Ok(()) => {
                    debug!(device = write.device_id(), kind = write.kind(), "Committed to sink");
                    return;
                }
                Err(SinkError::Rejected(reason)) => {
                    error!(
                        device = write.device_id(),
                        kind = write.kind(),
                        reason = %reason,
                        "Sink rejected write, quarantining"
                    );
                    to_quarantine(&state.backlog, &write);
                    return;
                }
                Err(SinkError::Unavailable(e)) => {
                    warn!(
                        device = write.device_id(),
                        kind = write.kind(),
                        error = %format!("{e:#}"),
                        "Sink write failed, queueing in backlog"
                    );
                }
            }
        }

        to_backlog(&state.backlog, &write);
    }

    /// Register or rename a device in the sink
    pub async fn set_device_name(&self, device_id: u32, label: &str) {
        self.record(ArchiveWrite::DeviceName {
            time: Utc::now(),
            device_id,
            label: label.to_string(),
        })
        .await;
    }

    async fn bootstrap(&self, state: &mut ArchiveState) -> bool {
        state.sink = None;

        match self.try_bootstrap(&state.backlog).await {
            Ok(sink) => {
                state.sink = Some(sink);
                true
            }
            Err(e) => {
                warn!(error = %format!("{e:#}"), "Archive bootstrap failed, writes go to backlog");
                false
            }
        }
    }

    async fn try_bootstrap(&self, backlog: &Backlog) -> Result<Box<dyn Sink>> {
        let sink = self
            .connector
            .connect()
            .await
            .context("Failed to connect to sink")?;
        sink.ensure_schema()
            .await
            .context("Failed to ensure sink schema")?;

        let entries = backlog.entries().context("Failed to read backlog")?;
        if entries.is_empty() {
            info!("Archive connected, backlog empty");
            return Ok(sink);
        }

        info!(entries = entries.len(), "Replaying archive backlog");

        let mut rejected = Vec::new();
        for (index, entry) in entries.into_iter().enumerate() {
            match entry {
                BacklogEntry::Write(write) => match sink.execute(&write).await {
                    Ok(()) => {}
                    Err(SinkError::Rejected(reason)) => {
                        error!(entry = index, reason = %reason, "Sink rejected backlog entry, quarantining");
                        rejected.push(
                            serde_json::to_string(&write)
                                .context("Failed to encode rejected backlog entry")?,
                        );
                    }
                    Err(SinkError::Unavailable(e)) => {
                        return Err(e)
                            .with_context(|| format!("Backlog replay interrupted at entry {index}"));
                    }
                },
                BacklogEntry::Rejected(line) => {
                    error!(entry = index, line = %line, "Unparsable backlog entry, quarantining");
                    rejected.push(line);
                }
            }
        }

        backlog
            .quarantine(&rejected)
            .context("Failed to quarantine backlog entries")?;
        backlog.truncate().context("Failed to truncate backlog")?;
        info!(rejected = rejected.len(), "Backlog replayed and cleared");

        Ok(sink)
    }
}

fn to_backlog(backlog: &Backlog, write: &ArchiveWrite) {
    if let Err(e) = backlog.append(write) {
        // last resort: the log is the only record of this write
        error!(
            error = %e,
            write = %serde_json::to_string(write).unwrap_or_default(),
            "Failed to append to backlog, write lost"
        );
    }
}

fn to_quarantine(backlog: &Backlog, write: &ArchiveWrite) {
    let quarantined = serde_json::to_string(write)
        .map_err(backlog::BacklogError::from)
        .and_then(|line| backlog.quarantine(&[line]));
    if let Err(e) = quarantined {
        error!(error = %e, write = ?write, "Failed to quarantine rejected write, write lost");
    }
}

/// Periodically reconnect while disconnected or while the backlog is non-empty
pub fn spawn_reconnect_task(archive: Arc<Archive>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let backlogged = match archive.pending().await {
                Ok(pending) => pending > 0,
                Err(e) => {
                    // unreadable backlog may still hold writes
                    error!(error = %e, "Failed to read archive backlog");
                    true
                }
            };
            if !archive.is_connected().await || backlogged {
                let connected = archive.reconnect().await;
                debug!(connected, "Scheduled archive reconnect");
            }
        }
    })
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted in-memory sink

    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Debug, Default)]
    pub struct FakeState {
        pub online: bool,
        pub committed: Vec<ArchiveWrite>,
        /// Writes to accept before going offline
        pub fail_after: Option<usize>,
        pub schema_calls: usize,
        pub connects: usize,
        /// Write kinds the sink refuses permanently
        pub rejects: Vec<&'static str>,
    }

    #[derive(Clone, Default)]
    pub struct FakeConnector {
        pub state: Arc<StdMutex<FakeState>>,
    }

    impl FakeConnector {
        pub fn online() -> Self {
            let connector = Self::default();
            connector.set_online(true);
            connector
        }

        pub fn offline() -> Self {
            Self::default()
        }

        pub fn set_online(&self, online: bool) {
            self.state.lock().unwrap().online = online;
        }

        pub fn fail_after(&self, writes: usize) {
            self.state.lock().unwrap().fail_after = Some(writes);
        }

        pub fn reject_kind(&self, kind: &'static str) {
            self.state.lock().unwrap().rejects.push(kind);
        }

        pub fn committed(&self) -> Vec<ArchiveWrite> {
            self.state.lock().unwrap().committed.clone()
        }

        pub fn schema_calls(&self) -> usize {
            self.state.lock().unwrap().schema_calls
        }
    }

    #[async_trait]
    impl SinkConnector for FakeConnector {
        async fn connect(&self) -> Result<Box<dyn Sink>> {
            let mut state = self.state.lock().unwrap();
            state.connects += 1;
            if !state.online {
                anyhow::bail!("connection refused");
            }
            Ok(Box::new(FakeSink {
                state: Arc::clone(&self.state),
            }))
        }
    }

    struct FakeSink {
        state: Arc<StdMutex<FakeState>>,
    }

    #[async_trait]
    impl Sink for FakeSink {
        async fn ensure_schema(&self) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            if !state.online {
                anyhow::bail!("connection reset");
            }
            state.schema_calls += 1;
            Ok(())
        }

        async fn execute(&self, write: &ArchiveWrite) -> std::result::Result<(), SinkError> {
            let mut state = self.state.lock().unwrap();
            if let Some(remaining) = state.fail_after {
                if remaining == 0 {
                    state.online = false;
                    state.fail_after = None;
                } else {
                    state.fail_after = Some(remaining - 1);
                }
            }
            if !state.online {
                return Err(anyhow::anyhow!("connection reset").into());
            }
            if state.rejects.contains(&write.kind()) {
                return Err(SinkError::Rejected(format!("{} not accepted", write.kind())));
            }
            state.committed.push(write.clone());
            Ok(())
        }
    }
}
