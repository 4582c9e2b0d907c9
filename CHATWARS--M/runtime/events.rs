use std::fmt;

use chatwars_commands::KeyId;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Direction of a key edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    /// Key goes down.
    Press,
    /// Key goes up.
    Release,
}

impl Transition {
    /// Lower-case label used in logs and on the wire.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Press => "press",
            Self::Release => "release",
        }
    }
}

/// Identifier of one scheduled batch, unique per team.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(pub u64);

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "batch-{}", self.0)
    }
}

/// One timed key edge awaiting dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledEvent {
    /// Owning batch.
    pub batch_id: BatchId,
    /// Shared by a press and its release.
    pub pair_id: u64,
    /// Monotonic firing time.
    pub fire_at: Instant,
    /// Offset from the batch reference time.
    pub offset_ms: u64,
    /// Device key.
    pub key: KeyId,
    /// Verb that produced the edge.
    pub verb: String,
    /// Press or release.
    pub transition: Transition,
}

impl ScheduledEvent {
    /// Whether this edge presses its key.
    #[must_use]
    pub fn is_press(&self) -> bool {
        self.transition == Transition::Press
    }
}
