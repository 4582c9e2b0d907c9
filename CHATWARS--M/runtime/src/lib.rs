#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Team runtime: turns validated action requests into timed key edges and
//! delivers them to a local backend or a remote input server.

/// Key edges and batch identifiers.
#[path = "../events.rs"]
pub mod events;

/// Input targets.
#[path = "../target.rs"]
pub mod target;

/// Length-prefixed JSON frames for remote targets.
#[path = "../wire.rs"]
pub mod wire;

/// In-process input backends.
#[path = "../backend.rs"]
pub mod backend;

/// Ordered delivery to local and remote targets.
#[path = "../dispatcher.rs"]
pub mod dispatcher;

/// Concurrent per-key batch scheduling.
#[path = "../scheduler.rs"]
pub mod scheduler;

/// Structured logs and events.
#[path = "../telemetry.rs"]
pub mod telemetry;

/// Per-team command pipeline.
#[path = "../team.rs"]
pub mod team;

/// Multi-team routing and control hooks.
#[path = "../hub.rs"]
pub mod hub;

/// TOML runtime configuration.
#[path = "../config.rs"]
pub mod config;

/// Remote input server.
#[path = "../server.rs"]
pub mod server;

pub use backend::{BackendError, InputBackend, LoggingBackend, RecordingBackend};
pub use config::{ProfileCatalog, ProfileSource, RuntimeConfig, TeamEntry, TelemetryConfig};
pub use dispatcher::{
    DispatchError, DispatchFailure, DispatchHandle, DispatchStats, FailureKind, FailureSink,
    RemoteSettings,
};
pub use events::{BatchId, ScheduledEvent, Transition};
pub use hub::{ChatMessage, ControlHook, ControlReport, FailedTeam, TeamHub};
pub use scheduler::{BatchHandle, BatchReport, Scheduler, SchedulerError};
pub use server::RemoteInputServer;
pub use target::{InputTarget, TargetMode, MAX_PLAYER_INDEX};
pub use team::{
    MacroSettings, MessageOutcome, TeamConfig, TeamDiagnostics, TeamError, TeamRuntime,
    TeamSnapshot,
};
pub use telemetry::{RuntimeTelemetry, RuntimeTelemetryBuilder};
pub use wire::{FrameReader, FrameWriter, WireError, WireMessage, WIRE_VERSION};
