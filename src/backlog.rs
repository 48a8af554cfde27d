//! Local write-ahead backlog for archive writes
//!
//! Writes that could not be committed to the sink are appended here, one
//! JSON document per line, in submission order. Each append is flushed and
//! synced before returning. The file is only ever truncated as a whole,
//! after every entry has been replayed.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::archive::ArchiveWrite;

#[derive(Debug, Error)]
pub enum BacklogError {
    #[error("backlog I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode backlog entry: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, BacklogError>;

/// A backlog line as read back from disk
#[derive(Debug, Clone, PartialEq)]
pub enum BacklogEntry {
    Write(ArchiveWrite),
    /// A line that no longer parses; kept verbatim
    Rejected(String),
}

#[derive(Debug, Clone)]
pub struct Backlog {
    path: PathBuf,
}

impl Backlog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Where unparsable lines are moved during replay
    pub fn rejected_path(&self) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(".rejected");
        PathBuf::from(name)
    }

    /// Durably append one write
    pub fn append(&self, write: &ArchiveWrite) -> Result<()> {
        let line = serde_json::to_string(write)?;
        append_line(&self.path, &line)
    }

    /// Read every entry in file order
    ///
    /// A missing file is an empty backlog.
    pub fn entries(&self) -> Result<Vec<BacklogEntry>> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.io_error(e)),
        };

        let mut entries = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| self.io_error(e))?;
            if line.trim().is_empty() {
                continue;
            }
            let entry = match serde_json::from_str(&line) {
                Ok(write) => BacklogEntry::Write(write),
                Err(_) => BacklogEntry::Rejected(line),
            };
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Number of entries currently pending
    pub fn pending(&self) -> Result<usize> {
        Ok(self.entries()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        match fs::metadata(&self.path) {
            Ok(meta) => Ok(meta.len() == 0),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(true),
            Err(e) => Err(self.io_error(e)),
        }
    }

    /// Move unparsable lines aside so they no longer block replay
    pub fn quarantine(&self, lines: &[String]) -> Result<()> {
        let rejected = self.rejected_path();
        for line in lines {
            append_line(&rejected, line)?;
        }
        Ok(())
    }

    /// Empty the backlog after a complete replay
    pub fn truncate(&self) -> Result<()> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)
            .map_err(|e| self.io_error(e))?;
        file.sync_data().map_err(|e| self.io_error(e))
    }

    fn io_error(&self, source: std::io::Error) -> BacklogError {
        BacklogError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

fn append_line(path: &Path, line: &str) -> Result<()> {
    let io_error = |source: std::io::Error| BacklogError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(io_error)?;
    file.write_all(line.as_bytes()).map_err(io_error)?;
    file.write_all(b"\n").map_err(io_error)?;
    file.flush().map_err(io_error)?;
    file.sync_data().map_err(io_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::Channel;
    use chrono::{TimeZone, Utc};

    fn metric(value: f64) -> ArchiveWrite {
        ArchiveWrite::Metric {
            time: Utc.with_ymd_and_hms(2024, 6, 2, 12, 0, 0).unwrap(),
            device_id: 0x00EE58,
            channel: Channel::SoilMoisture,
            value,
        }
    }

    #[test]
    fn test_entries_keep_submission_order() {
        let dir = tempfile::tempdir().unwrap();
        let backlog = Backlog::new(dir.path().join("archive.backlog"));

        backlog.append(&metric(10.0)).unwrap();
        backlog
            .append(&ArchiveWrite::Frame {
                time: Utc.with_ymd_and_hms(2024, 6, 2, 12, 0, 1).unwrap(),
                device_id: 0x00EE58,
                rssi: -72.5,
                frame: vec![0x51, 0x00, 0xEE, 0x58],
            })
            .unwrap();
        backlog.append(&metric(30.0)).unwrap();

        let entries = backlog.entries().unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0], BacklogEntry::Write(metric(10.0)));
        assert!(matches!(
            &entries[1],
            BacklogEntry::Write(ArchiveWrite::Frame { frame, .. }) if frame == &vec![0x51, 0x00, 0xEE, 0x58]
        ));
        assert_eq!(entries[2], BacklogEntry::Write(metric(30.0)));
    }

    #[test]
    fn test_one_entry_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let backlog = Backlog::new(dir.path().join("archive.backlog"));
        backlog
            .append(&ArchiveWrite::DeviceName {
                time: Utc.with_ymd_and_hms(2024, 6, 2, 12, 0, 0).unwrap(),
                device_id: 0x00EF32,
                label: "A10\nsecond line".to_string(),
            })
            .unwrap();

        let contents = fs::read_to_string(backlog.path()).unwrap();
        assert_eq!(contents.lines().count(), 1);
        assert!(contents.contains(r#""kind":"device_name""#));
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let backlog = Backlog::new(dir.path().join("archive.backlog"));
        assert!(backlog.is_empty().unwrap());
        assert!(backlog.entries().unwrap().is_empty());
    }

    #[test]
    fn test_unparsable_lines_are_reported_and_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        let backlog = Backlog::new(dir.path().join("archive.backlog"));
        backlog.append(&metric(1.0)).unwrap();
        append_line(backlog.path(), "INSERT INTO soil_moisture VALUES (...);").unwrap();

        let entries = backlog.entries().unwrap();
        let rejected: Vec<String> = entries
            .iter()
            .filter_map(|entry| match entry {
                BacklogEntry::Rejected(line) => Some(line.clone()),
                BacklogEntry::Write(_) => None,
            })
            .collect();
        assert_eq!(rejected.len(), 1);

        backlog.quarantine(&rejected).unwrap();
        let moved = fs::read_to_string(backlog.rejected_path()).unwrap();
        assert_eq!(moved, "INSERT INTO soil_moisture VALUES (...);\n");
    }

    #[test]
    fn test_truncate_empties_file() {
        let dir = tempfile::tempdir().unwrap();
        let backlog = Backlog::new(dir.path().join("archive.backlog"));
        backlog.append(&metric(1.0)).unwrap();
        assert_eq!(backlog.pending().unwrap(), 1);

        backlog.truncate().unwrap();
        assert!(backlog.is_empty().unwrap());
        assert_eq!(backlog.pending().unwrap(), 0);
    }
}
