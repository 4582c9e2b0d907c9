use std::sync::Arc;

use async_trait::async_trait;
use chatwars_commands::KeyId;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::info;

use crate::events::Transition;

/// Errors raised by a device driver.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// The device refused or failed the input.
    #[error("device error: {0}")]
    Device(String),
}

/// Driver applying key edges to a local device.
#[async_trait]
pub trait InputBackend: Send + Sync {
    /// Applies one key edge for a player slot.
    async fn apply(
        &self,
        player_index: u8,
        key: &KeyId,
        transition: Transition,
    ) -> Result<(), BackendError>;
}

/// Backend that only emits a `tracing` record per edge.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingBackend;

#[async_trait]
impl InputBackend for LoggingBackend {
    async fn apply(
        &self,
        player_index: u8,
        key: &KeyId,
        transition: Transition,
    ) -> Result<(), BackendError> {
        info!(player_index, key = %key, transition = transition.label(), "input");
        Ok(())
    }
}

/// Edge captured by [`RecordingBackend`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordedInput {
    /// Player slot.
    pub player_index: u8,
    /// Device key.
    pub key: KeyId,
    /// Press or release.
    pub transition: Transition,
    /// Monotonic time the edge was applied.
    #[serde(skip)]
    pub at: Instant,
}

/// Backend keeping every applied edge in memory.
#[derive(Debug, Default, Clone)]
pub struct RecordingBackend {
    inputs: Arc<Mutex<Vec<RecordedInput>>>,
    failing_keys: Arc<Mutex<Vec<KeyId>>>,
}

impl RecordingBackend {
    /// Empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every edge for `key` fail.
    pub fn fail_key(&self, key: KeyId) {
        self.failing_keys.lock().push(key);
    }

    /// Applied edges, oldest first.
    #[must_use]
    pub fn inputs(&self) -> Vec<RecordedInput> {
        self.inputs.lock().clone()
    }
}

#[async_trait]
impl InputBackend for RecordingBackend {
    async fn apply(
        &self,
        player_index: u8,
        key: &KeyId,
        transition: Transition,
    ) -> Result<(), BackendError> {
        if self.failing_keys.lock().contains(key) {
            return Err(BackendError::Device(format!("{key} unavailable")));
        }
        self.inputs.lock().push(RecordedInput {
            player_index,
            key: key.clone(),
            transition,
            at: Instant::now(),
        });
        Ok(())
    }
}
