//! Device registry
//!
//! In-memory table of provisioned sensors and their latest observed state.
//! Loaded from a JSON snapshot at startup and written back at shutdown.
//! The registry has no locking of its own; the ingest pipeline owns it.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::Path;
use tracing::info;

use crate::frame::DecodedReading;

/// RSSI reported for a device that has never been heard
pub const NEVER_HEARD_RSSI: f64 = -256.0;

/// Latest observed state of a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    pub fast_update_periods: u8,
    pub battery_voltage: f32,
    pub moisture: u8,
    pub raw: u16,
    pub last_seen: Option<DateTime<Utc>>,
    pub last_rssi: f64,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            fast_update_periods: 0,
            battery_voltage: 0.0,
            moisture: 0,
            raw: 0,
            last_seen: None,
            last_rssi: NEVER_HEARD_RSSI,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub id: u32,
    /// Where the sensor is planted
    pub label: String,
    pub state: DeviceState,
}

/// Serializable form of the whole registry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub devices: HashMap<u32, DeviceRecord>,
}

#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: HashMap<u32, DeviceRecord>,
}

impl DeviceRegistry {
    /// Load a registry from a snapshot file
    ///
    /// A missing file yields an empty registry. A file that exists but
    /// cannot be read or parsed is an error, so that a damaged snapshot is
    /// never silently replaced by empty state at shutdown.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!(path = %path.display(), "No registry snapshot, starting empty");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read registry snapshot: {}", path.display()))
            }
        };

        let snapshot: RegistrySnapshot = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse registry snapshot: {}", path.display()))?;

        let mut registry = Self::default();
        registry.restore(snapshot);
        info!(path = %path.display(), devices = registry.len(), "Registry snapshot loaded");
        Ok(registry)
    }

    /// Write the registry snapshot to `path`
    ///
    /// The snapshot is written and synced to a sibling temporary file first,
    /// then renamed over the target, so the target is always a complete
    /// snapshot.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(&self.snapshot())
            .context("Failed to serialize registry snapshot")?;

        let tmp = path.with_extension("tmp");
        let mut file = File::create(&tmp)
            .with_context(|| format!("Failed to create registry snapshot: {}", tmp.display()))?;
        file.write_all(json.as_bytes())
            .and_then(|()| file.sync_all())
            .with_context(|| format!("Failed to write registry snapshot: {}", tmp.display()))?;
        drop(file);
        fs::rename(&tmp, path)
            .with_context(|| format!("Failed to replace registry snapshot: {}", path.display()))?;

        info!(path = %path.display(), devices = self.len(), "Registry snapshot saved");
        Ok(())
    }

    pub fn lookup(&self, id: u32) -> Option<&DeviceRecord> {
        self.devices.get(&id)
    }

    /// Add a device, or relabel it if it is already known
    ///
    /// Relabelling keeps the observed state.
    pub fn provision(&mut self, id: u32, label: &str) {
        self.devices
            .entry(id)
            .and_modify(|record| record.label = label.to_string())
            .or_insert_with(|| DeviceRecord {
                id,
                label: label.to_string(),
                state: DeviceState::default(),
            });
    }

    /// Store an accepted reading for an existing device
    ///
    /// Returns `false` without touching anything when `id` is unknown.
    pub fn update(&mut self, id: u32, reading: &DecodedReading, rssi: f64, now: DateTime<Utc>) -> bool {
        let Some(record) = self.devices.get_mut(&id) else {
            return false;
        };

        let state = &mut record.state;
        state.fast_update_periods = reading.fast_update_periods;
        state.battery_voltage = reading.battery_voltage;
        state.moisture = reading.moisture;
        state.raw = reading.raw;
        state.last_seen = Some(now);
        state.last_rssi = rssi;
        true
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            devices: self.devices.clone(),
        }
    }

    /// Replace the whole registry with `snapshot`
    pub fn restore(&mut self, snapshot: RegistrySnapshot) {
        self.devices = snapshot.devices;
    }

    pub fn devices(&self) -> impl Iterator<Item = &DeviceRecord> {
        self.devices.values()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn reading(device_id: u32) -> DecodedReading {
        DecodedReading {
            device_id,
            fast_update_periods: 2,
            battery_voltage: 1.4,
            moisture: 37,
            raw: 300,
        }
    }

    #[test]
    fn test_update_never_creates_devices() {
        let mut registry = DeviceRegistry::default();
        registry.provision(0x00EE58, "Garden");

        let now = Utc::now();
        assert!(!registry.update(0x00EF32, &reading(0x00EF32), -80.0, now));
        assert_eq!(registry.len(), 1);
        assert!(registry.lookup(0x00EF32).is_none());
    }

    #[test]
    fn test_update_overwrites_state() {
        let mut registry = DeviceRegistry::default();
        registry.provision(0x00EE58, "Garden");

        let earlier = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        let later = Utc.with_ymd_and_hms(2024, 5, 1, 8, 1, 0).unwrap();
        assert!(registry.update(0x00EE58, &reading(0x00EE58), -70.0, earlier));
        assert!(registry.update(0x00EE58, &reading(0x00EE58), -65.5, later));

        let record = registry.lookup(0x00EE58).unwrap();
        assert_eq!(record.label, "Garden");
        assert_eq!(record.state.moisture, 37);
        assert_eq!(record.state.raw, 300);
        assert_eq!(record.state.last_seen, Some(later));
        assert_eq!(record.state.last_rssi, -65.5);
    }

    #[test]
    fn test_provision_keeps_state_when_relabelling() {
        let mut registry = DeviceRegistry::default();
        registry.provision(0x00EE58, "Garden");
        registry.update(0x00EE58, &reading(0x00EE58), -70.0, Utc::now());

        registry.provision(0x00EE58, "Greenhouse");
        let record = registry.lookup(0x00EE58).unwrap();
        assert_eq!(record.label, "Greenhouse");
        assert_eq!(record.state.moisture, 37);
    }

    #[test]
    fn test_new_device_has_never_been_heard() {
        let mut registry = DeviceRegistry::default();
        registry.provision(0x00EF32, "A10");
        let state = &registry.lookup(0x00EF32).unwrap().state;
        assert_eq!(state.last_seen, None);
        assert_eq!(state.last_rssi, NEVER_HEARD_RSSI);
    }

    #[test]
    fn test_snapshot_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.cache.json");

        let mut registry = DeviceRegistry::default();
        registry.provision(0x00EE58, "Garden, north bed");
        registry.provision(0x00EF32, "A10");
        registry.update(0x00EE58, &reading(0x00EE58), -71.25, Utc::now());
        registry.save(&path).unwrap();

        let restored = DeviceRegistry::load(&path).unwrap();
        assert_eq!(restored.snapshot(), registry.snapshot());
        assert_eq!(restored.lookup(0x00EE58).unwrap().label, "Garden, north bed");
    }

    #[test]
    fn test_save_replaces_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.cache.json");

        let mut registry = DeviceRegistry::default();
        registry.provision(0x00EE58, "Garden");
        registry.save(&path).unwrap();
        registry.provision(0x00EF32, "A10");
        registry.save(&path).unwrap();

        assert_eq!(DeviceRegistry::load(&path).unwrap().len(), 2);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_missing_snapshot_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let registry = DeviceRegistry::load(dir.path().join("absent.json")).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_corrupt_snapshot_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.cache.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(DeviceRegistry::load(&path).is_err());
    }
}
