use std::{sync::Arc, time::Duration};

use anyhow::Result;
use chatwars_commands::ConfigurationError;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use shared_event_bus::{EventPublisher, FileEventPublisher};
use tokio::time::Instant;
use tracing::{error, info};

use crate::{
    backend::InputBackend,
    config::{ProfileCatalog, RuntimeConfig, TeamEntry},
    team::{MessageOutcome, TeamDiagnostics, TeamError, TeamRuntime},
    telemetry::RuntimeTelemetry,
};

/// One chat message addressed to a team.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    /// Destination team.
    pub team: String,
    /// Chat user name.
    pub author: String,
    /// Raw text.
    pub text: String,
    /// Arrival time; reference time of every command in the message.
    pub received_at: Instant,
}

impl ChatMessage {
    /// Message received now.
    #[must_use]
    pub fn now(team: impl Into<String>, author: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            team: team.into(),
            author: author.into(),
            text: text.into(),
            received_at: Instant::now(),
        }
    }
}

/// Operator control hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "hook", content = "enabled", rename_all = "snake_case")]
pub enum ControlHook {
    /// Cancel every pending press.
    CancelAll,
    /// Schedule one random action now.
    InjectRandom,
    /// Cancel, clear state and reload stored macros.
    Reset,
    /// Turn the random input loop on or off.
    RandomInputs(bool),
}

/// A team that could not start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedTeam {
    /// Team name.
    pub name: String,
    /// Startup error.
    pub error: String,
}

/// Outcome of a control hook across teams.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ControlReport {
    /// Teams the hook was applied to.
    pub affected: usize,
    /// Teams whose hook failed.
    pub failed: Vec<FailedTeam>,
}

/// Every running team, keyed by name.
#[derive(Debug, Default)]
pub struct TeamHub {
    teams: IndexMap<String, Arc<TeamRuntime>>,
    failed: Vec<FailedTeam>,
}

impl TeamHub {
    /// Empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts every configured team. A team that fails to start is recorded
    /// in [`TeamHub::failed`] and the others keep running.
    pub fn from_config(config: &RuntimeConfig, backend: Arc<dyn InputBackend>) -> Result<Self> {
        let publisher: Option<Arc<dyn EventPublisher>> = match &config.telemetry.event_log {
            Some(path) => Some(Arc::new(FileEventPublisher::new(path)?)),
            None => None,
        };
        Self::from_config_with_publisher(config, backend, publisher)
    }

    /// Same as [`TeamHub::from_config`] with an explicit event sink.
    pub fn from_config_with_publisher(
        config: &RuntimeConfig,
        backend: Arc<dyn InputBackend>,
        publisher: Option<Arc<dyn EventPublisher>>,
    ) -> Result<Self> {
        let mut catalog = config.catalog();
        let mut hub = Self::new();
        for entry in &config.teams {
            let started = if hub.teams.contains_key(&entry.name) {
                Err(ConfigurationError::DuplicateTeam(entry.name.clone()).into())
            } else {
                start_team(config, entry, &mut catalog, &backend, publisher.as_ref())
            };
            match started {
                Ok(team) => {
                    hub.teams.insert(entry.name.clone(), team);
                }
                Err(err) => {
                    let error = format!("{err:#}");
                    error!(team = %entry.name, %error, "team failed to start");
                    hub.failed.push(FailedTeam {
                        name: entry.name.clone(),
                        error,
                    });
                }
            }
        }
        info!(teams = hub.teams.len(), failed = hub.failed.len(), "team hub ready");
        Ok(hub)
    }

    /// Adds a running team.
    pub fn insert(&mut self, team: Arc<TeamRuntime>) -> Result<(), ConfigurationError> {
        if self.teams.contains_key(team.name()) {
            return Err(ConfigurationError::DuplicateTeam(team.name().to_string()));
        }
        self.teams.insert(team.name().to_string(), team);
        Ok(())
    }

    /// Team by name.
    #[must_use]
    pub fn team(&self, name: &str) -> Option<&Arc<TeamRuntime>> {
        self.teams.get(name)
    }

    /// Names of running teams.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.teams.keys().map(String::as_str)
    }

    /// Teams that failed to start.
    #[must_use]
    pub fn failed(&self) -> &[FailedTeam] {
        &self.failed
    }

    /// Hands a message to its team.
    pub fn route(&self, message: &ChatMessage) -> Result<MessageOutcome, TeamError> {
        let team = self
            .team(&message.team)
            .ok_or_else(|| TeamError::UnknownTeam(message.team.clone()))?;
        Ok(team.handle_message(&message.author, &message.text, message.received_at))
    }

    /// Applies a hook to one team, or to every team when `team` is `None`.
    ///
    /// Every selected team gets the hook; a team whose hook fails is listed
    /// in the report instead of stopping the rest.
    pub fn control(&self, team: Option<&str>, hook: ControlHook) -> Result<ControlReport, TeamError> {
        let targets: Vec<&Arc<TeamRuntime>> = match team {
            Some(name) => vec![self
                .team(name)
                .ok_or_else(|| TeamError::UnknownTeam(name.to_string()))?],
            None => self.teams.values().collect(),
        };
        let mut report = ControlReport::default();
        for runtime in targets {
            let applied = match hook {
                ControlHook::CancelAll => {
                    runtime.cancel_all();
                    Ok(())
                }
                ControlHook::InjectRandom => {
                    runtime.inject_random();
                    Ok(())
                }
                ControlHook::Reset => runtime.reset(),
                ControlHook::RandomInputs(enabled) => {
                    runtime.set_random_inputs(enabled);
                    Ok(())
                }
            };
            match applied {
                Ok(()) => report.affected += 1,
                Err(err) => {
                    let error = format!("{err:#}");
                    error!(team = %runtime.name(), ?hook, %error, "control hook failed");
                    report.failed.push(FailedTeam {
                        name: runtime.name().to_string(),
                        error,
                    });
                }
            }
        }
        Ok(report)
    }

    /// Diagnostics of every running team.
    #[must_use]
    pub fn diagnostics(&self) -> Vec<TeamDiagnostics> {
        self.teams.values().map(|team| team.diagnostics()).collect()
    }

    /// Shuts every team down, waiting up to `grace` for each.
    pub async fn shutdown(&self, grace: Duration) {
        for team in self.teams.values() {
            team.shutdown(grace).await;
        }
        info!(teams = self.teams.len(), "team hub stopped");
    }
}

fn start_team(
    config: &RuntimeConfig,
    entry: &TeamEntry,
    catalog: &mut ProfileCatalog,
    backend: &Arc<dyn InputBackend>,
    publisher: Option<&Arc<dyn EventPublisher>>,
) -> Result<Arc<TeamRuntime>> {
    let verbs = catalog.resolve(&entry.profile)?;
    let mut telemetry =
        RuntimeTelemetry::builder(format!("team:{}", entry.name)).min_level(config.telemetry.min_level);
    if let Some(dir) = &config.telemetry.log_dir {
        telemetry = telemetry.log_path(dir.join(format!("team_{}.log", entry.name)));
    }
    if let Some(publisher) = publisher {
        telemetry = telemetry.event_publisher(Arc::clone(publisher));
    }
    let team = TeamRuntime::start(
        config.team_config(entry),
        verbs,
        Arc::clone(backend),
        Some(telemetry.build()?),
    )?;
    Ok(team)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::RecordingBackend,
        target::InputTarget,
        team::{MacroSettings, TeamConfig},
    };
    use chatwars_commands::builtin;
    use shared_event_bus::MemoryEventBus;
    use tempfile::tempdir;

    fn config(text: &str) -> RuntimeConfig {
        toml::from_str(text).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn failing_team_does_not_stop_others() {
        let tmp = tempdir().unwrap();
        let mut config = config(
            r#"
            [[teams]]
            name = "red"
            profile = "towerfall_keyboard"

            [[teams]]
            name = "ghost"
            profile = "no_such_profile"

            [[teams]]
            name = "red"
            profile = "gamepad"

            [[teams]]
            name = "blue"
            profile = "gamepad"
            target = { mode = "remote", port = 9000 }
        "#,
        );
        config.telemetry.log_dir = Some(tmp.path().to_path_buf());
        let bus = Arc::new(MemoryEventBus::new(32));
        let backend = RecordingBackend::new();
        let publisher: Arc<dyn EventPublisher> = bus;
        let hub = TeamHub::from_config_with_publisher(&config, Arc::new(backend.clone()), Some(publisher))
            .unwrap();

        assert_eq!(hub.names().collect::<Vec<_>>(), vec!["red"]);
        let failed: Vec<_> = hub.failed().iter().map(|f| f.name.as_str()).collect();
        assert_eq!(failed, vec!["ghost", "red", "blue"]);
        assert!(hub.failed()[1].error.contains("more than once"));

        let outcome = hub.route(&ChatMessage::now("red", "ann", "+jump")).unwrap();
        let MessageOutcome::Scheduled { batch, .. } = outcome else {
            panic!("expected a batch");
        };
        batch.finished().await.unwrap();
        assert!(matches!(
            hub.route(&ChatMessage::now("green", "ann", "+jump")),
            Err(TeamError::UnknownTeam(_))
        ));
        hub.shutdown(Duration::from_secs(1)).await;
        let log = std::fs::read_to_string(tmp.path().join("team_red.log")).unwrap();
        assert!(log.contains("team.batch.scheduled"));
    }

    #[tokio::test(start_paused = true)]
    async fn control_hooks_reach_selected_teams() {
        let mut hub = TeamHub::new();
        for (name, player) in [("red", 0), ("blue", 1)] {
            let team = TeamRuntime::start(
                TeamConfig::new(name, InputTarget::local(player)),
                Arc::new(builtin("gamepad").unwrap()),
                Arc::new(RecordingBackend::new()),
                None,
            )
            .unwrap();
            hub.insert(team).unwrap();
        }
        let duplicate = TeamRuntime::start(
            TeamConfig::new("red", InputTarget::local(2)),
            Arc::new(builtin("gamepad").unwrap()),
            Arc::new(RecordingBackend::new()),
            None,
        )
        .unwrap();
        assert!(matches!(
            hub.insert(duplicate),
            Err(ConfigurationError::DuplicateTeam(_))
        ));

        hub.route(&ChatMessage::now("red", "ann", "+a 0+800")).unwrap();
        assert_eq!(hub.control(Some("red"), ControlHook::CancelAll).unwrap().affected, 1);
        assert_eq!(hub.control(None, ControlHook::InjectRandom).unwrap().affected, 2);
        assert_eq!(hub.control(None, ControlHook::RandomInputs(true)).unwrap().affected, 2);
        assert!(hub.team("blue").unwrap().diagnostics().random_inputs);
        let report = hub.control(None, ControlHook::Reset).unwrap();
        assert_eq!(report.affected, 2);
        assert!(report.failed.is_empty());
        assert!(hub.control(Some("green"), ControlHook::Reset).is_err());

        let diagnostics = hub.diagnostics();
        assert_eq!(diagnostics.len(), 2);
        assert_eq!(diagnostics[0].counters.cancellations, 2);
        assert_eq!(diagnostics[1].counters.random_injections, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn broken_profile_fails_only_its_teams() {
        let config = config(
            r#"
            [[profiles]]
            profile = "slowpoke"
            [[profiles.verbs]]
            name = "go"
            key = "enter"
            duration_ms = 5000

            [[teams]]
            name = "red"
            profile = "gamepad"

            [[teams]]
            name = "blue"
            profile = "slowpoke"
        "#,
        );
        let hub = TeamHub::from_config_with_publisher(&config, Arc::new(RecordingBackend::new()), None)
            .unwrap();
        assert_eq!(hub.names().collect::<Vec<_>>(), vec!["red"]);
        assert_eq!(hub.failed().len(), 1);
        assert_eq!(hub.failed()[0].name, "blue");
        assert!(hub.failed()[0].error.contains("slowpoke"));
        assert!(matches!(
            hub.route(&ChatMessage::now("red", "ann", "+a")),
            Ok(MessageOutcome::Scheduled { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_reset_does_not_skip_later_teams() {
        let tmp = tempdir().unwrap();
        let red_file = tmp.path().join("red.json");
        let mut hub = TeamHub::new();
        for name in ["red", "blue"] {
            let macros = MacroSettings {
                allow_changes: true,
                file: Some(tmp.path().join(format!("{name}.json"))),
                persistent: true,
                ..MacroSettings::default()
            };
            let team = TeamRuntime::start(
                TeamConfig::new(name, InputTarget::local(0)).macros(macros),
                Arc::new(builtin("gamepad").unwrap()),
                Arc::new(RecordingBackend::new()),
                None,
            )
            .unwrap();
            hub.insert(team).unwrap();
        }
        std::fs::write(&red_file, "{ truncated").unwrap();
        hub.route(&ChatMessage::now("blue", "ann", "+a 0+800")).unwrap();

        let report = hub.control(None, ControlHook::Reset).unwrap();
        assert_eq!(report.affected, 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].name, "red");
        assert!(report.failed[0].error.contains("macro"));
        assert_eq!(hub.team("blue").unwrap().diagnostics().counters.cancellations, 1);
        assert_eq!(hub.team("red").unwrap().diagnostics().counters.cancellations, 0);
    }

    #[test]
    fn control_hook_serializes_with_tag() {
        let hook: ControlHook =
            serde_json::from_str(r#"{"hook":"random_inputs","enabled":false}"#).unwrap();
        assert_eq!(hook, ControlHook::RandomInputs(false));
        let json = serde_json::to_string(&ControlHook::Reset).unwrap();
        assert_eq!(json, r#"{"hook":"reset"}"#);
    }
}
