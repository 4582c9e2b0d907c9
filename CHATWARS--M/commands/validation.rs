use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use crate::{
    parser::RawTiming,
    verbs::{InputKind, KeyId, VerbSpec},
};

/// Timing that cannot be turned into a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ValidationRejected {
    /// Delay below zero.
    #[error("negative delay {0} ms")]
    NegativeDelay(i64),
    /// Duration below zero.
    #[error("negative duration {0} ms")]
    NegativeDuration(i64),
}

/// A validated, clamped request for one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionRequest {
    key: Arc<VerbSpec>,
    delay_ms: u32,
    duration_ms: u32,
}

impl ActionRequest {
    /// Verb being driven.
    #[must_use]
    pub fn spec(&self) -> &Arc<VerbSpec> {
        &self.key
    }

    /// Canonical verb name.
    #[must_use]
    pub fn verb(&self) -> &str {
        &self.key.name
    }

    /// Key on the device.
    #[must_use]
    pub fn key(&self) -> &KeyId {
        &self.key.canonical_key
    }

    /// Press offset from the batch reference time.
    #[must_use]
    pub const fn delay_ms(&self) -> u32 {
        self.delay_ms
    }

    /// Hold time.
    #[must_use]
    pub const fn duration_ms(&self) -> u32 {
        self.duration_ms
    }

    /// Release offset from the batch reference time.
    #[must_use]
    pub fn release_offset_ms(&self) -> u64 {
        u64::from(self.delay_ms) + u64::from(self.duration_ms)
    }
}

/// Normalizes raw timing against a verb.
pub fn validate(timing: RawTiming, spec: &Arc<VerbSpec>) -> Result<ActionRequest, ValidationRejected> {
    if timing.delay_ms < 0 {
        return Err(ValidationRejected::NegativeDelay(timing.delay_ms));
    }
    let requested = match timing.duration_ms {
        Some(duration) if duration < 0 => {
            return Err(ValidationRejected::NegativeDuration(duration));
        }
        Some(duration) => saturate(duration),
        None => spec.default_duration_ms,
    };
    let delay_ms = saturate(timing.delay_ms);
    Ok(ActionRequest {
        key: Arc::clone(spec),
        delay_ms,
        duration_ms: clamp_duration(delay_ms, requested, spec),
    })
}

/// Applies the minimum, toggle rule and ceiling to a duration.
#[must_use]
pub fn clamp_duration(delay_ms: u32, requested_ms: u32, spec: &VerbSpec) -> u32 {
    if spec.input_kind == InputKind::Toggle || delay_ms >= spec.max_total_ms {
        return 0;
    }
    requested_ms
        .max(spec.min_duration_ms)
        .min(spec.max_total_ms - delay_ms)
}

fn saturate(value: i64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}
