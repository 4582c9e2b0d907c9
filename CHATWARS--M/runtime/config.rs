use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use chatwars_commands::{
    builtin, ConfigurationError, MacroLimits, ParserConfig, VerbTable, VerbTableDocument,
};
use serde::{Deserialize, Serialize};
use shared_logging::LogLevel;
use tracing::warn;

use crate::{
    dispatcher::RemoteSettings,
    target::InputTarget,
    team::{MacroSettings, TeamConfig},
};

/// Top-level runtime configuration read from TOML.
///
/// ```toml
/// [telemetry]
/// log_dir = "logs"
///
/// [[teams]]
/// name = "red"
/// profile = "towerfall_keyboard"
/// target = { mode = "local", player_index = 0 }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Parser settings shared by teams without their own.
    #[serde(default)]
    pub parser: ParserConfig,
    /// Custom verb profiles, by file or inline.
    #[serde(default)]
    pub profiles: Vec<ProfileSource>,
    /// Log and event sinks.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    /// Macro bounds shared by every team.
    #[serde(default)]
    pub macro_limits: MacroLimits,
    /// Settings for remote targets.
    #[serde(default)]
    pub remote: RemoteSettings,
    /// Team declarations.
    #[serde(default)]
    pub teams: Vec<TeamEntry>,
}

/// A custom verb profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProfileSource {
    /// TOML document on disk.
    File {
        /// Document path, relative to the config file.
        path: PathBuf,
    },
    /// Document embedded in the config.
    Inline(VerbTableDocument),
}

/// Telemetry sinks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Directory for per-team JSON logs.
    pub log_dir: Option<PathBuf>,
    /// JSON lines file receiving runtime events.
    pub event_log: Option<PathBuf>,
    /// Lowest level written to the logs.
    pub min_level: LogLevel,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_dir: None,
            event_log: None,
            min_level: LogLevel::Info,
        }
    }
}

/// One team declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamEntry {
    /// Unique team name.
    pub name: String,
    /// Built-in or custom profile name.
    pub profile: String,
    /// Input destination.
    #[serde(default = "default_target")]
    pub target: InputTarget,
    /// Team-specific parser settings.
    #[serde(default)]
    pub parser: Option<ParserConfig>,
    /// Accept macro changes from operators.
    #[serde(default)]
    pub allow_macro_changes: bool,
    /// JSON file holding the team's macros.
    #[serde(default)]
    pub macro_file: Option<PathBuf>,
    /// Write macro changes back to `macro_file`.
    #[serde(default)]
    pub persistent_macros: bool,
    /// Ignore repeated identical messages while they run.
    #[serde(default = "default_spam_protection")]
    pub spam_protection: bool,
    /// Interval of random inputs while the team is idle.
    #[serde(default)]
    pub random_input_interval_ms: Option<u64>,
}

const fn default_spam_protection() -> bool {
    true
}

const fn default_target() -> InputTarget {
    InputTarget::local(0)
}

impl RuntimeConfig {
    /// Loads configuration from a TOML file; relative paths resolve against its directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading runtime config {}", path.display()))?;
        let mut config: Self =
            toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        let source_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        config.resolve_paths(&source_dir);
        Ok(config)
    }

    fn resolve_paths(&mut self, base: &Path) {
        let resolve = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        };
        for profile in &mut self.profiles {
            if let ProfileSource::File { path } = profile {
                resolve(path);
            }
        }
        if let Some(dir) = &mut self.telemetry.log_dir {
            resolve(dir);
        }
        if let Some(file) = &mut self.telemetry.event_log {
            resolve(file);
        }
        for team in &mut self.teams {
            if let Some(file) = &mut team.macro_file {
                resolve(file);
            }
        }
    }

    /// Builds the profile catalog.
    ///
    /// A custom profile that fails to load or build is recorded as broken
    /// under its declared name (the file stem when the file is unreadable),
    /// so only the teams using it fail.
    #[must_use]
    pub fn catalog(&self) -> ProfileCatalog {
        let mut catalog = ProfileCatalog::default();
        for source in &self.profiles {
            let (name, built) = match source {
                ProfileSource::File { path } => match VerbTableDocument::load(path) {
                    Ok(document) => (document.profile.clone(), build_profile(document)),
                    Err(err) => (
                        path.file_stem()
                            .map(|stem| stem.to_string_lossy().into_owned())
                            .unwrap_or_default(),
                        Err(err),
                    ),
                },
                ProfileSource::Inline(document) => {
                    (document.profile.clone(), build_profile(document.clone()))
                }
            };
            match built {
                Ok(table) => catalog.insert(table),
                Err(err) => {
                    let reason = format!("{err:#}");
                    warn!(profile = %name, %reason, "verb profile unusable");
                    catalog.mark_broken(&name, reason);
                }
            }
        }
        catalog
    }

    /// Team configuration for one entry.
    #[must_use]
    pub fn team_config(&self, entry: &TeamEntry) -> TeamConfig {
        let mut config = TeamConfig::new(entry.name.clone(), entry.target.clone())
            .parser(entry.parser.clone().unwrap_or_else(|| self.parser.clone()))
            .macros(MacroSettings {
                allow_changes: entry.allow_macro_changes,
                file: entry.macro_file.clone(),
                persistent: entry.persistent_macros,
                limits: self.macro_limits,
            })
            .spam_protection(entry.spam_protection)
            .remote(self.remote);
        if let Some(ms) = entry.random_input_interval_ms.filter(|ms| *ms > 0) {
            config = config.random_input(Duration::from_millis(ms));
        }
        config
    }
}

fn build_profile(document: VerbTableDocument) -> Result<VerbTable> {
    let profile = document.profile.clone();
    document
        .into_table()
        .with_context(|| format!("building verb profile '{profile}'"))
}

/// Verb tables by profile name, shared between teams.
#[derive(Debug, Clone, Default)]
pub struct ProfileCatalog {
    tables: HashMap<String, Arc<VerbTable>>,
    broken: HashMap<String, String>,
}

impl ProfileCatalog {
    /// Registers a custom table, replacing any with the same profile name.
    pub fn insert(&mut self, table: VerbTable) {
        let key = table.profile().to_lowercase();
        self.broken.remove(&key);
        self.tables.insert(key, Arc::new(table));
    }

    /// Records a declared profile that cannot be used.
    pub fn mark_broken(&mut self, name: &str, reason: String) {
        let key = name.to_lowercase();
        self.tables.remove(&key);
        self.broken.insert(key, reason);
    }

    /// Names of declared profiles that failed to load, with the reason.
    pub fn broken(&self) -> impl Iterator<Item = (&str, &str)> {
        self.broken.iter().map(|(name, reason)| (name.as_str(), reason.as_str()))
    }

    /// Table for `name`, building and caching built-in profiles on first use.
    pub fn resolve(&mut self, name: &str) -> Result<Arc<VerbTable>, ConfigurationError> {
        let key = name.to_lowercase();
        if let Some(table) = self.tables.get(&key) {
            return Ok(Arc::clone(table));
        }
        if let Some(reason) = self.broken.get(&key) {
            return Err(ConfigurationError::BrokenProfile {
                profile: key,
                reason: reason.clone(),
            });
        }
        let table = Arc::new(builtin(&key)?);
        self.tables.insert(key, Arc::clone(&table));
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::TargetMode;
    use tempfile::tempdir;

    const SAMPLE: &str = r#"
        [parser]
        action_prefix = "!"

        [telemetry]
        log_dir = "logs"
        min_level = "DEBUG"

        [macro_limits]
        max_total_ms = 3000

        [remote]
        staleness_ms = 500

        [[profiles]]
        path = "profiles/arcade.toml"

        [[profiles]]
        profile = "tiny"
        [[profiles.verbs]]
        name = "go"
        key = "enter"

        [[teams]]
        name = "red"
        profile = "towerfall_keyboard"
        allow_macro_changes = true
        macro_file = "macros/red.json"
        persistent_macros = true
        random_input_interval_ms = 4000

        [[teams]]
        name = "blue"
        profile = "arcade"
        spam_protection = false
        target = { mode = "remote", host = "127.0.0.1", port = 33000, player_index = 1 }
    "#;

    const ARCADE: &str = r#"
        profile = "arcade"
        [[verbs]]
        name = "punch"
        key = "a"
        duration_ms = 120
        aliases = ["p"]
    "#;

    #[test]
    fn loads_and_resolves_relative_paths() {
        let tmp = tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("profiles")).unwrap();
        fs::write(tmp.path().join("profiles/arcade.toml"), ARCADE).unwrap();
        let path = tmp.path().join("chatwars.toml");
        fs::write(&path, SAMPLE).unwrap();

        let config = RuntimeConfig::load(&path).unwrap();
        assert_eq!(config.parser.action_prefix, "!");
        assert_eq!(config.telemetry.min_level, LogLevel::Debug);
        assert_eq!(config.telemetry.log_dir, Some(tmp.path().join("logs")));
        assert_eq!(config.macro_limits.max_total_ms, 3000);
        assert_eq!(config.macro_limits.max_steps, 32);
        assert_eq!(config.remote.staleness_ms, 500);
        assert_eq!(config.remote.initial_backoff_ms, 1_000);
        assert_eq!(
            config.teams[0].macro_file,
            Some(tmp.path().join("macros/red.json"))
        );
        assert_eq!(config.teams[1].target.mode, TargetMode::Remote);

        let mut catalog = config.catalog();
        assert!(catalog.resolve("arcade").unwrap().resolve("p").is_some());
        assert!(catalog.resolve("tiny").unwrap().resolve("go").is_some());
        let first = catalog.resolve("towerfall_keyboard").unwrap();
        let second = catalog.resolve("TOWERFALL_KEYBOARD").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(matches!(
            catalog.resolve("nope"),
            Err(ConfigurationError::UnknownProfile(_))
        ));
    }

    #[test]
    fn team_config_applies_shared_settings() {
        let config: RuntimeConfig = toml::from_str(
            r#"
            [[teams]]
            name = "red"
            profile = "gamepad"
            random_input_interval_ms = 0
        "#,
        )
        .unwrap();
        let team = config.team_config(&config.teams[0]);
        assert!(team.spam_protection);
        assert_eq!(team.random_input, None);
        assert_eq!(team.target, InputTarget::local(0));
        assert_eq!(team.parser, ParserConfig::default());
        assert!(!team.macros.allow_changes);
    }

    #[test]
    fn broken_profile_reports_context() {
        let config: RuntimeConfig = toml::from_str(
            r#"
            [[profiles]]
            profile = "bad"
            [[profiles.verbs]]
            name = "go"
            key = "enter"
            [[profiles.verbs]]
            name = "GO"
            key = "space"
        "#,
        )
        .unwrap();
        let mut catalog = config.catalog();
        assert_eq!(catalog.broken().count(), 1);
        let err = catalog.resolve("BAD").unwrap_err();
        assert!(matches!(&err, ConfigurationError::BrokenProfile { profile, .. } if profile == "bad"));
        assert!(err.to_string().contains("more than once"));
        assert!(catalog.resolve("gamepad").is_ok());
    }

    #[test]
    fn unreadable_profile_file_is_keyed_by_stem() {
        let tmp = tempdir().unwrap();
        let config = RuntimeConfig {
            profiles: vec![ProfileSource::File {
                path: tmp.path().join("arcade.toml"),
            }],
            ..RuntimeConfig::default()
        };
        let mut catalog = config.catalog();
        assert!(matches!(
            catalog.resolve("arcade"),
            Err(ConfigurationError::BrokenProfile { .. })
        ));
    }
}
