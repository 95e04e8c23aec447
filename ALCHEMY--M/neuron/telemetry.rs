use std::{fmt, path::PathBuf, sync::Arc};

use anyhow::Result;
use serde_json::Value;
use shared_event_bus::{EventPublisher, EventRecord};
use shared_logging::{JsonLogger, LogLevel, LogRecord, DEFAULT_MAX_BYTES};
use tracing::warn;

/// Builder for neuron telemetry sinks.
pub struct NeuronTelemetryBuilder {
    module: String,
    log_path: Option<PathBuf>,
    log_level: LogLevel,
    log_max_bytes: u64,
    event_publisher: Option<Arc<dyn EventPublisher>>,
}

impl NeuronTelemetryBuilder {
    /// Creates the builder.
    #[must_use]
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            log_path: None,
            log_level: LogLevel::Debug,
            log_max_bytes: DEFAULT_MAX_BYTES,
            event_publisher: None,
        }
    }

    /// Sets the JSON log path.
    #[must_use]
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Drops JSON log records below `level`.
    #[must_use]
    pub const fn log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    /// Rotates the JSON log once it exceeds `max_bytes`.
    #[must_use]
    pub const fn log_max_bytes(mut self, max_bytes: u64) -> Self {
        self.log_max_bytes = max_bytes;
        self
    }

    /// Sets the event publisher.
    #[must_use]
    pub fn event_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.event_publisher = Some(publisher);
        self
    }

    /// Builds the telemetry handle.
    ///
    /// # Errors
    /// Fails when the log file cannot be opened.
    pub fn build(self) -> Result<NeuronTelemetry> {
        let logger = match self.log_path {
            Some(path) => Some(
                JsonLogger::with_rotation(path, self.log_max_bytes)?.min_level(self.log_level),
            ),
            None => None,
        };
        Ok(NeuronTelemetry {
            inner: Arc::new(TelemetryInner {
                module: self.module,
                logger,
                publisher: self.event_publisher,
            }),
        })
    }
}

/// Telemetry handle shared by the lifecycle loop and the background worker.
#[derive(Clone)]
pub struct NeuronTelemetry {
    inner: Arc<TelemetryInner>,
}

impl fmt::Debug for NeuronTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NeuronTelemetry")
            .field("module", &self.inner.module)
            .field("logger", &self.inner.logger.is_some())
            .field("events", &self.inner.publisher.is_some())
            .finish()
    }
}

struct TelemetryInner {
    module: String,
    logger: Option<JsonLogger>,
    publisher: Option<Arc<dyn EventPublisher>>,
}

impl NeuronTelemetry {
    /// Returns a builder.
    #[must_use]
    pub fn builder(module: impl Into<String>) -> NeuronTelemetryBuilder {
        NeuronTelemetryBuilder::new(module)
    }

    /// Module name stamped on every record.
    #[must_use]
    pub fn module(&self) -> &str {
        &self.inner.module
    }

    /// Logs structured metadata.
    ///
    /// # Errors
    /// Propagates log file write failures.
    pub fn log(&self, level: LogLevel, message: &str, metadata: &Value) -> Result<()> {
        if let Some(logger) = &self.inner.logger {
            let record = LogRecord::new(&self.inner.module, level, message).with_fields(metadata);
            logger.log(&record)?;
        }
        Ok(())
    }

    /// Emits an event on the bus.
    ///
    /// # Errors
    /// Propagates publisher failures.
    pub async fn event(&self, event_type: &str, payload: Value) -> Result<()> {
        if let Some(publisher) = &self.inner.publisher {
            publisher
                .publish(EventRecord::new(&self.inner.module, event_type, payload))
                .await?;
        }
        Ok(())
    }

    /// Logs and publishes in one go; sink failures are reported through `tracing`
    /// and otherwise ignored.
    pub async fn record(&self, level: LogLevel, event_type: &str, payload: Value) {
        if let Err(err) = self.log(level, event_type, &payload) {
            warn!(error = %err, event_type, "telemetry log write failed");
        }
        if let Err(err) = self.event(event_type, payload).await {
            warn!(error = %err, event_type, "telemetry event publish failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shared_event_bus::MemoryEventBus;
    use tempfile::tempdir;

    #[tokio::test]
    async fn telemetry_writes_log_and_event() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("neuron.log");
        let bus = Arc::new(MemoryEventBus::new(16));
        let telemetry = NeuronTelemetry::builder("lifecycle")
            .log_path(&path)
            .event_publisher(bus.clone())
            .build()
            .unwrap();
        telemetry
            .record(LogLevel::Info, "lifecycle.registered", json!({ "index": 3 }))
            .await;
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("lifecycle.registered"));
        let events = bus.of_type("lifecycle.registered");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].source, "lifecycle");
        assert_eq!(events[0].payload["index"], 3);
    }

    #[tokio::test]
    async fn log_level_and_rotation_apply_to_json_log() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("neuron.log");
        let telemetry = NeuronTelemetry::builder("worker")
            .log_path(&path)
            .log_level(LogLevel::Info)
            .log_max_bytes(1)
            .build()
            .unwrap();
        telemetry
            .log(LogLevel::Debug, "worker.policy_refreshed", &json!({}))
            .unwrap();
        assert!(std::fs::read_to_string(&path).unwrap().is_empty());

        telemetry
            .log(LogLevel::Info, "worker.first", &json!({}))
            .unwrap();
        telemetry
            .log(LogLevel::Error, "worker.second", &json!({}))
            .unwrap();
        let live = std::fs::read_to_string(&path).unwrap();
        let rotated = std::fs::read_to_string(tmp.path().join("neuron.log.1")).unwrap();
        assert!(live.contains("worker.second") && !live.contains("worker.first"));
        assert!(rotated.contains("worker.first"));
    }

    #[tokio::test]
    async fn sinks_are_optional() {
        let telemetry = NeuronTelemetry::builder("worker").build().unwrap();
        telemetry
            .log(LogLevel::Warn, "worker.refresh_failed", &json!({}))
            .unwrap();
        telemetry.event("worker.refresh_failed", json!({})).await.unwrap();
    }
}
