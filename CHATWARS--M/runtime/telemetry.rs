use std::{fmt, path::PathBuf, sync::Arc};

use anyhow::Result;
use serde_json::Value;
use shared_event_bus::{EventPublisher, EventRecord};
use shared_logging::{JsonLogger, LogLevel, LogRecord};
use tokio::runtime::Handle;
use tracing::warn;

/// Builder for team telemetry sinks.
pub struct RuntimeTelemetryBuilder {
    module: String,
    log_path: Option<PathBuf>,
    min_level: LogLevel,
    event_publisher: Option<Arc<dyn EventPublisher>>,
}

impl RuntimeTelemetryBuilder {
    /// Creates the builder; `module` is usually `team:<name>`.
    #[must_use]
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            log_path: None,
            min_level: LogLevel::Debug,
            event_publisher: None,
        }
    }

    /// Writes JSON lines to `path`.
    #[must_use]
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Drops log records below `level`.
    #[must_use]
    pub fn min_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    /// Publishes events to `publisher`.
    #[must_use]
    pub fn event_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.event_publisher = Some(publisher);
        self
    }

    /// Opens the sinks.
    pub fn build(self) -> Result<RuntimeTelemetry> {
        let logger = match self.log_path {
            Some(path) => Some(Arc::new(JsonLogger::new(path)?.with_min_level(self.min_level))),
            None => None,
        };
        Ok(RuntimeTelemetry {
            inner: Arc::new(TelemetryInner {
                module: self.module,
                logger,
                publisher: self.event_publisher,
            }),
        })
    }
}

/// Structured log and event sinks shared by a team's components.
#[derive(Clone)]
pub struct RuntimeTelemetry {
    inner: Arc<TelemetryInner>,
}

struct TelemetryInner {
    module: String,
    logger: Option<Arc<JsonLogger>>,
    publisher: Option<Arc<dyn EventPublisher>>,
}

impl fmt::Debug for RuntimeTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeTelemetry")
            .field("module", &self.inner.module)
            .field("log", &self.inner.logger.as_ref().map(|logger| logger.path()))
            .field("events", &self.inner.publisher.is_some())
            .finish()
    }
}

impl RuntimeTelemetry {
    /// Returns a builder.
    #[must_use]
    pub fn builder(module: impl Into<String>) -> RuntimeTelemetryBuilder {
        RuntimeTelemetryBuilder::new(module)
    }

    /// Writes one structured log record.
    pub fn log(&self, level: LogLevel, message: &str, metadata: Value) -> Result<()> {
        if let Some(logger) = &self.inner.logger {
            logger.log(&LogRecord::new(&self.inner.module, level, message).with_metadata(&metadata))?;
        }
        Ok(())
    }

    /// Publishes an event without waiting for the sink.
    ///
    /// Outside a tokio runtime the event is dropped with a warning.
    pub fn event(&self, event_type: &str, payload: Value) {
        let Some(publisher) = &self.inner.publisher else {
            return;
        };
        let record = EventRecord::new(&self.inner.module, event_type, payload);
        match Handle::try_current() {
            Ok(handle) => {
                let publisher = Arc::clone(publisher);
                handle.spawn(async move {
                    if let Err(err) = publisher.publish(record).await {
                        warn!(error = %err, "telemetry event publish failed");
                    }
                });
            }
            Err(_) => warn!(event_type, "no runtime available, telemetry event dropped"),
        }
    }
}
