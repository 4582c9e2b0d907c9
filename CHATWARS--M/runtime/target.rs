use std::fmt;

use chatwars_commands::ConfigurationError;
use serde::{Deserialize, Serialize};

/// Highest player slot a target may address.
pub const MAX_PLAYER_INDEX: u8 = 15;

/// Where a team's inputs go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetMode {
    /// In-process input backend.
    #[default]
    Local,
    /// Remote input server over TCP.
    Remote,
}

/// Immutable destination of one team's inputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputTarget {
    /// Local or remote.
    #[serde(default)]
    pub mode: TargetMode,
    /// Remote host name or address.
    #[serde(default)]
    pub host: Option<String>,
    /// Remote TCP port.
    #[serde(default)]
    pub port: Option<u16>,
    /// Player slot on the device.
    #[serde(default)]
    pub player_index: u8,
}

impl InputTarget {
    /// Local target for a player slot.
    #[must_use]
    pub const fn local(player_index: u8) -> Self {
        Self {
            mode: TargetMode::Local,
            host: None,
            port: None,
            player_index,
        }
    }

    /// Remote target.
    #[must_use]
    pub fn remote(host: impl Into<String>, port: u16, player_index: u8) -> Self {
        Self {
            mode: TargetMode::Remote,
            host: Some(host.into()),
            port: Some(port),
            player_index,
        }
    }

    /// Checks the fields required by the mode.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.player_index > MAX_PLAYER_INDEX {
            return Err(ConfigurationError::InvalidTarget(format!(
                "player_index {} exceeds {MAX_PLAYER_INDEX}",
                self.player_index
            )));
        }
        if self.mode == TargetMode::Remote {
            if self.host.as_deref().map_or(true, str::is_empty) {
                return Err(ConfigurationError::InvalidTarget(
                    "remote target needs a host".into(),
                ));
            }
            if matches!(self.port, None | Some(0)) {
                return Err(ConfigurationError::InvalidTarget(
                    "remote target needs a non-zero port".into(),
                ));
            }
        }
        Ok(())
    }

    /// `host:port` for remote targets.
    #[must_use]
    pub fn address(&self) -> Option<String> {
        match (self.mode, &self.host, self.port) {
            (TargetMode::Remote, Some(host), Some(port)) => Some(format!("{host}:{port}")),
            _ => None,
        }
    }
}

impl fmt::Display for InputTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.address() {
            Some(address) => write!(f, "remote {address} player {}", self.player_index),
            None => write!(f, "local player {}", self.player_index),
        }
    }
}
