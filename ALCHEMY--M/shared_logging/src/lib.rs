#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Structured JSON-lines logging shared by the neuron crates.
//!
//! Every record is one line of JSON. The logger rotates its file once it grows
//! past a configurable size so long-running nodes do not fill the disk.

use std::{
    fmt,
    fs::{self, File},
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Default rotation threshold (16 MiB).
pub const DEFAULT_MAX_BYTES: u64 = 16 * 1024 * 1024;

/// Log severity level.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    /// Debug information.
    Debug,
    /// Informational events.
    Info,
    /// Warning indicator.
    Warn,
    /// Error indicator.
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Debug => write!(f, "DEBUG"),
            Self::Info => write!(f, "INFO"),
            Self::Warn => write!(f, "WARN"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

/// Structured log record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    /// Timestamp in ISO8601.
    pub timestamp: DateTime<Utc>,
    /// Component emitting the log (e.g. `neuron.lifecycle`).
    pub module: String,
    /// Severity.
    pub level: LogLevel,
    /// Event name or human-readable message.
    pub message: String,
    /// Arbitrary JSON fields.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl LogRecord {
    /// Creates a record stamped with the current time.
    #[must_use]
    pub fn new(module: impl Into<String>, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            module: module.into(),
            level,
            message: message.into(),
            metadata: serde_json::Map::new(),
        }
    }

    /// Adds a single field.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Merges the fields of a JSON object; non-object values are ignored.
    #[must_use]
    pub fn with_fields(mut self, fields: &serde_json::Value) -> Self {
        if let Some(obj) = fields.as_object() {
            for (key, value) in obj {
                self.metadata.insert(key.clone(), value.clone());
            }
        }
        self
    }
}

struct Sink {
    file: File,
    written: u64,
}

/// Thread-safe append-only JSON logger with size-based rotation.
pub struct JsonLogger {
    path: PathBuf,
    max_bytes: u64,
    min_level: LogLevel,
    sink: Mutex<Sink>,
}

impl fmt::Debug for JsonLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonLogger")
            .field("path", &self.path)
            .field("max_bytes", &self.max_bytes)
            .field("min_level", &self.min_level)
            .finish()
    }
}

impl JsonLogger {
    /// Creates or opens a logger at the desired path using the default rotation size.
    ///
    /// # Errors
    /// Fails when the parent directory or the file cannot be created.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        Self::with_rotation(path, DEFAULT_MAX_BYTES)
    }

    /// Creates or opens a logger that rotates to `<path>.1` once `max_bytes` is exceeded.
    ///
    /// # Errors
    /// Fails when the parent directory or the file cannot be created.
    pub fn with_rotation(path: impl AsRef<Path>, max_bytes: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating log directory {}", parent.display()))?;
        }
        let file = open_append(&path)?;
        let written = file.metadata().map(|meta| meta.len()).unwrap_or(0);
        Ok(Self {
            path,
            max_bytes: max_bytes.max(1),
            min_level: LogLevel::Debug,
            sink: Mutex::new(Sink { file, written }),
        })
    }

    /// Drops records below `level`.
    #[must_use]
    pub const fn min_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    /// Writes a record as one JSON line.
    ///
    /// # Errors
    /// Fails on serialization or I/O errors.
    pub fn log(&self, record: &LogRecord) -> Result<()> {
        if record.level < self.min_level {
            return Ok(());
        }
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut sink = self.sink.lock();
        if sink.written > 0 && sink.written + line.len() as u64 > self.max_bytes {
            sink.file.flush()?;
            fs::rename(&self.path, self.rotated_path())
                .with_context(|| format!("rotating {}", self.path.display()))?;
            sink.file = open_append(&self.path)?;
            sink.written = 0;
        }
        sink.file.write_all(&line)?;
        sink.file.flush()?;
        sink.written += line.len() as u64;
        Ok(())
    }

    /// Reads back every record currently in the live file (skipping malformed lines).
    ///
    /// # Errors
    /// Fails when the file cannot be opened.
    pub fn records(&self) -> Result<Vec<LogRecord>> {
        let file = File::open(&self.path)?;
        Ok(BufReader::new(file)
            .lines()
            .map_while(std::result::Result::ok)
            .filter_map(|line| serde_json::from_str(&line).ok())
            .collect())
    }

    /// Returns the live file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path the live file is moved to on rotation.
    #[must_use]
    pub fn rotated_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(".1");
        PathBuf::from(name)
    }
}

fn open_append(path: &Path) -> Result<File> {
    fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening log file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn writes_json_lines() {
        let dir = tempdir().unwrap();
        let logger = JsonLogger::new(dir.path().join("neuron.log")).unwrap();
        logger
            .log(&LogRecord::new("neuron", LogLevel::Info, "registered").with_field("uid", 7))
            .unwrap();
        let content = fs::read_to_string(logger.path()).unwrap();
        assert!(content.contains("\"message\":\"registered\""));
        let records = logger.records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].metadata["uid"], 7);
    }

    #[test]
    fn filters_below_min_level() {
        let dir = tempdir().unwrap();
        let logger = JsonLogger::new(dir.path().join("neuron.log"))
            .unwrap()
            .min_level(LogLevel::Warn);
        logger
            .log(&LogRecord::new("neuron", LogLevel::Debug, "noise"))
            .unwrap();
        logger
            .log(&LogRecord::new("neuron", LogLevel::Error, "boom"))
            .unwrap();
        let records = logger.records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].level, LogLevel::Error);
    }

    #[test]
    fn rotates_when_full() {
        let dir = tempdir().unwrap();
        let logger = JsonLogger::with_rotation(dir.path().join("neuron.log"), 64).unwrap();
        for step in 0..4 {
            logger
                .log(&LogRecord::new("neuron", LogLevel::Info, "tick").with_field("step", step))
                .unwrap();
        }
        assert!(logger.rotated_path().exists());
        assert!(logger.records().unwrap().len() < 4);
    }
}
