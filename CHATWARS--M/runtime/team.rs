use std::{
    collections::{HashMap, VecDeque},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use chatwars_commands::{
    validate, ActionRequest, CommandParser, JsonMacroStore, Macro, MacroError, MacroFile,
    MacroLimits, MacroStep, MacroTable, ParserConfig, RawTiming, TeamVocabulary, TokenTarget,
    VerbTable,
};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_logging::LogLevel;
use thiserror::Error;
use tokio::{task::JoinHandle, time::Instant};
use tracing::{debug, info, instrument, warn};

use crate::{
    backend::InputBackend,
    dispatcher::{DispatchFailure, DispatchHandle, DispatchStats, FailureSink, RemoteSettings},
    events::BatchId,
    scheduler::{BatchHandle, Scheduler},
    target::InputTarget,
    telemetry::RuntimeTelemetry,
};

/// Recent spam-protection entries kept before pruning finished batches.
const RECENT_MESSAGES_SOFT_LIMIT: usize = 256;

/// Team-level failures.
#[derive(Debug, Error)]
pub enum TeamError {
    /// Invalid team setup; only this team is affected.
    #[error(transparent)]
    Configuration(#[from] chatwars_commands::ConfigurationError),
    /// Macro management failure.
    #[error(transparent)]
    Macro(#[from] MacroError),
    /// Macro file could not be read or written.
    #[error("macro storage: {0}")]
    Storage(String),
    /// No team with this name is running.
    #[error("unknown team '{0}'")]
    UnknownTeam(String),
}

/// Macro behaviour of a team.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MacroSettings {
    /// Whether operator commands may add, change or remove macros.
    pub allow_changes: bool,
    /// JSON file to load macros from.
    pub file: Option<PathBuf>,
    /// Write changes back to `file`.
    pub persistent: bool,
    /// Bounds for every macro.
    pub limits: MacroLimits,
}

/// Static configuration of one team.
#[derive(Debug, Clone, PartialEq)]
pub struct TeamConfig {
    /// Unique team name.
    pub name: String,
    /// Input destination.
    pub target: InputTarget,
    /// Parser settings.
    pub parser: ParserConfig,
    /// Macro settings.
    pub macros: MacroSettings,
    /// Ignore repeated identical messages from one author while they run.
    pub spam_protection: bool,
    /// Interval of the random input loop, if enabled.
    pub random_input: Option<Duration>,
    /// Remote target settings.
    pub remote: RemoteSettings,
    /// Entries kept in each diagnostics ring.
    pub diagnostics_capacity: usize,
}

impl TeamConfig {
    /// Configuration with defaults for everything but name and target.
    #[must_use]
    pub fn new(name: impl Into<String>, target: InputTarget) -> Self {
        Self {
            name: name.into(),
            target,
            parser: ParserConfig::default(),
            macros: MacroSettings::default(),
            spam_protection: true,
            random_input: None,
            remote: RemoteSettings::default(),
            diagnostics_capacity: 32,
        }
    }

    /// Overrides parser settings.
    #[must_use]
    pub fn parser(mut self, parser: ParserConfig) -> Self {
        self.parser = parser;
        self
    }

    /// Overrides macro settings.
    #[must_use]
    pub fn macros(mut self, macros: MacroSettings) -> Self {
        self.macros = macros;
        self
    }

    /// Toggles spam protection.
    #[must_use]
    pub fn spam_protection(mut self, enabled: bool) -> Self {
        self.spam_protection = enabled;
        self
    }

    /// Enables the random input loop.
    #[must_use]
    pub fn random_input(mut self, interval: Duration) -> Self {
        self.random_input = Some(interval);
        self
    }

    /// Overrides remote target settings.
    #[must_use]
    pub fn remote(mut self, remote: RemoteSettings) -> Self {
        self.remote = remote;
        self
    }
}

/// What happened to a chat message.
#[derive(Debug)]
pub enum MessageOutcome {
    /// No word carries the action prefix.
    NotACommand,
    /// Same author and text while the earlier batch still runs.
    Duplicate,
    /// Every command was dropped.
    NothingToRun {
        /// Dropped commands.
        dropped: usize,
    },
    /// A batch was scheduled.
    Scheduled {
        /// Batch handle.
        batch: BatchHandle,
        /// Requests in the batch.
        requests: usize,
        /// Dropped commands.
        dropped: usize,
    },
}

/// Persistable team state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamSnapshot {
    /// Stored macros.
    #[serde(default)]
    pub macros: IndexMap<String, Vec<MacroStep>>,
}

/// A command dropped during translation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DroppedCommand {
    /// When it was dropped.
    pub at: DateTime<Utc>,
    /// Message author, empty for macro reloads.
    pub author: String,
    /// Reason.
    pub reason: String,
}

/// Monotonic team counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TeamCounters {
    /// Messages received.
    pub messages: u64,
    /// Messages ignored by spam protection.
    pub duplicates: u64,
    /// Batches scheduled.
    pub batches: u64,
    /// Requests scheduled.
    pub requests: u64,
    /// Commands dropped.
    pub dropped: u64,
    /// Random actions injected.
    pub random_injections: u64,
    /// Cancel operations.
    pub cancellations: u64,
}

/// Serializable view of a team's state.
#[derive(Debug, Clone, Serialize)]
pub struct TeamDiagnostics {
    /// Team name.
    pub team: String,
    /// Verb profile.
    pub profile: String,
    /// Target description.
    pub target: String,
    /// Edges waiting for their fire time.
    pub pending_events: usize,
    /// Batches still running.
    pub active_batches: usize,
    /// Stored macros.
    pub macros: usize,
    /// Whether the random loop injects actions.
    pub random_inputs: bool,
    /// Counters.
    pub counters: TeamCounters,
    /// Dispatcher counters.
    pub dispatch: DispatchStats,
    /// Recently dropped commands.
    pub last_parse_errors: Vec<DroppedCommand>,
    /// Recent dispatch failures.
    pub last_dispatch_failures: Vec<DispatchFailure>,
}

#[derive(Debug, Default)]
struct Counters {
    messages: AtomicU64,
    duplicates: AtomicU64,
    batches: AtomicU64,
    requests: AtomicU64,
    dropped: AtomicU64,
    random_injections: AtomicU64,
    cancellations: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> TeamCounters {
        TeamCounters {
            messages: self.messages.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            requests: self.requests.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            random_injections: self.random_injections.load(Ordering::Relaxed),
            cancellations: self.cancellations.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug)]
struct Diagnostics {
    capacity: usize,
    dropped: Mutex<VecDeque<DroppedCommand>>,
    failures: Mutex<VecDeque<DispatchFailure>>,
    counters: Counters,
}

impl Diagnostics {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            dropped: Mutex::new(VecDeque::new()),
            failures: Mutex::new(VecDeque::new()),
            counters: Counters::default(),
        }
    }

    fn push_dropped(&self, author: &str, reason: String) {
        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        push_bounded(
            &mut self.dropped.lock(),
            DroppedCommand {
                at: Utc::now(),
                author: author.to_string(),
                reason,
            },
            self.capacity,
        );
    }

    fn clear(&self) {
        self.dropped.lock().clear();
        self.failures.lock().clear();
    }
}

fn push_bounded<T>(ring: &mut VecDeque<T>, item: T, capacity: usize) {
    if ring.len() == capacity {
        ring.pop_front();
    }
    ring.push_back(item);
}

struct TeamFailureSink {
    diagnostics: Arc<Diagnostics>,
    telemetry: Option<RuntimeTelemetry>,
}

impl FailureSink for TeamFailureSink {
    fn report(&self, failure: DispatchFailure) {
        if let Some(telemetry) = &self.telemetry {
            let payload = serde_json::to_value(&failure).unwrap_or_default();
            if let Err(err) = telemetry.log(LogLevel::Error, "dispatch.failed", payload.clone()) {
                warn!(error = %err, "dispatch failure was not logged");
            }
            telemetry.event("dispatch.failed", payload);
        }
        push_bounded(
            &mut self.diagnostics.failures.lock(),
            failure,
            self.diagnostics.capacity,
        );
    }
}

/// One team's parser, macro table, scheduler and dispatcher.
pub struct TeamRuntime {
    config: TeamConfig,
    verbs: Arc<VerbTable>,
    parser: CommandParser,
    macros: RwLock<MacroTable>,
    store: Option<JsonMacroStore>,
    scheduler: Scheduler,
    telemetry: Option<RuntimeTelemetry>,
    diagnostics: Arc<Diagnostics>,
    recent: Mutex<HashMap<(String, String), BatchId>>,
    random_enabled: AtomicBool,
    random_loop: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for TeamRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TeamRuntime")
            .field("name", &self.config.name)
            .field("profile", &self.verbs.profile())
            .field("target", &self.config.target)
            .finish_non_exhaustive()
    }
}

impl TeamRuntime {
    /// Validates the configuration, loads stored macros and spawns the workers.
    #[instrument(skip_all, fields(team = %config.name))]
    pub fn start(
        config: TeamConfig,
        verbs: Arc<VerbTable>,
        backend: Arc<dyn InputBackend>,
        telemetry: Option<RuntimeTelemetry>,
    ) -> Result<Arc<Self>, TeamError> {
        config.target.validate()?;
        let parser = CommandParser::new(config.parser.clone())?;
        let diagnostics = Arc::new(Diagnostics::new(config.diagnostics_capacity));
        let store = config.macros.file.clone().map(JsonMacroStore::new);
        let macros = match &store {
            Some(store) => build_macros(read_macro_file(store)?, &verbs, &config.macros.limits, &diagnostics),
            None => MacroTable::default(),
        };

        let sink: Arc<dyn FailureSink> = Arc::new(TeamFailureSink {
            diagnostics: Arc::clone(&diagnostics),
            telemetry: telemetry.clone(),
        });
        let dispatcher =
            DispatchHandle::spawn(config.target.clone(), backend, config.remote, Arc::clone(&sink));
        let scheduler = Scheduler::new(config.name.clone(), dispatcher, sink);

        let team = Arc::new(Self {
            random_enabled: AtomicBool::new(config.random_input.is_some()),
            config,
            verbs,
            parser,
            macros: RwLock::new(macros),
            store,
            scheduler,
            telemetry,
            diagnostics,
            recent: Mutex::new(HashMap::new()),
            random_loop: Mutex::new(None),
        });
        if let Some(interval) = team.config.random_input {
            let handle = tokio::spawn(random_loop(Arc::downgrade(&team), interval));
            *team.random_loop.lock() = Some(handle);
        }

        info!(
            profile = team.verbs.profile(),
            target = %team.config.target,
            macros = team.macros.read().len(),
            "team started"
        );
        team.log(
            LogLevel::Info,
            "team.started",
            json!({
                "profile": team.verbs.profile(),
                "target": team.config.target.to_string(),
                "macros": team.macros.read().len(),
            }),
        );
        Ok(team)
    }

    /// Team name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Verb table in use.
    #[must_use]
    pub fn verbs(&self) -> &Arc<VerbTable> {
        &self.verbs
    }

    /// Scheduler of this team.
    #[must_use]
    pub const fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Parses, validates, expands and schedules one chat message.
    ///
    /// `received_at` is the reference time of every command in the message.
    pub fn handle_message(&self, author: &str, text: &str, received_at: Instant) -> MessageOutcome {
        self.diagnostics.counters.messages.fetch_add(1, Ordering::Relaxed);
        if !self.parser.is_command(text) {
            return MessageOutcome::NotACommand;
        }

        // Held from the duplicate check until the batch is recorded.
        let mut recent = self.config.spam_protection.then(|| self.recent.lock());
        let spam_key = (author.to_string(), text.trim().to_string());
        if let Some(recent) = &recent {
            if recent
                .get(&spam_key)
                .is_some_and(|batch| self.scheduler.is_active(*batch))
            {
                self.diagnostics.counters.duplicates.fetch_add(1, Ordering::Relaxed);
                debug!(team = %self.config.name, author, "duplicate message ignored");
                return MessageOutcome::Duplicate;
            }
        }

        let (requests, dropped) = self.translate(author, text);
        if requests.is_empty() {
            return MessageOutcome::NothingToRun { dropped };
        }

        let batch = self.scheduler.schedule(&requests, received_at);
        if let Some(recent) = recent.as_mut() {
            if recent.len() >= RECENT_MESSAGES_SOFT_LIMIT {
                recent.retain(|_, id| self.scheduler.is_active(*id));
            }
            recent.insert(spam_key, batch.id());
        }
        drop(recent);
        self.diagnostics.counters.batches.fetch_add(1, Ordering::Relaxed);
        self.diagnostics
            .counters
            .requests
            .fetch_add(requests.len() as u64, Ordering::Relaxed);

        let actions: Vec<_> = requests
            .iter()
            .map(|r| json!({ "verb": r.verb(), "delay_ms": r.delay_ms(), "duration_ms": r.duration_ms() }))
            .collect();
        self.log(
            LogLevel::Info,
            "team.batch.scheduled",
            json!({ "batch": batch.id(), "author": author, "actions": actions, "dropped": dropped }),
        );
        self.event(
            "batch.scheduled",
            json!({ "batch": batch.id(), "requests": requests.len() }),
        );
        MessageOutcome::Scheduled {
            requests: requests.len(),
            dropped,
            batch,
        }
    }

    fn translate(&self, author: &str, text: &str) -> (Vec<ActionRequest>, usize) {
        let macros = self.macros.read();
        let vocabulary = TeamVocabulary::new(&self.verbs, &macros);
        let Ok(parsed) = self.parser.parse(text, &vocabulary) else {
            return (Vec::new(), 0);
        };

        let mut reasons: Vec<String> = parsed.errors.iter().map(ToString::to_string).collect();
        let mut requests = Vec::with_capacity(parsed.tokens.len());
        for token in parsed.tokens {
            let expanded = match &token.target {
                TokenTarget::Verb(spec) => validate(token.timing, spec)
                    .map(|request| vec![request])
                    .map_err(|err| err.to_string()),
                TokenTarget::Macro(name) => macros
                    .get(name)
                    .ok_or_else(|| MacroError::Missing(name.clone()))
                    .and_then(|item| item.expand(token.timing, &self.verbs))
                    .map_err(|err| err.to_string()),
            };
            match expanded {
                Ok(batch) => requests.extend(batch),
                Err(reason) => reasons.push(format!("{}: {reason}", token.word)),
            }
        }

        let dropped = reasons.len();
        for reason in reasons {
            debug!(team = %self.config.name, author, %reason, "command dropped");
            self.diagnostics.push_dropped(author, reason);
        }
        (requests, dropped)
    }

    /// Schedules one weighted random verb with default timing, starting now.
    pub fn inject_random(&self) -> Option<BatchHandle> {
        let spec = self.verbs.pick_random(&mut rand::thread_rng())?.clone();
        let request = validate(RawTiming::default(), &spec).ok()?;
        let batch = self.scheduler.schedule(&[request], Instant::now());
        self.diagnostics
            .counters
            .random_injections
            .fetch_add(1, Ordering::Relaxed);
        debug!(team = %self.config.name, verb = %spec.name, "random action injected");
        self.event("random.injected", json!({ "batch": batch.id(), "verb": spec.name }));
        Some(batch)
    }

    /// Enables or disables injections of the random input loop. Without a
    /// configured interval there is no loop and this only changes diagnostics.
    pub fn set_random_inputs(&self, enabled: bool) {
        self.random_enabled.store(enabled, Ordering::SeqCst);
    }

    /// Cancels every pending press. Returns the number of active batches.
    pub fn cancel_all(&self) -> usize {
        let cancelled = self.scheduler.cancel_all();
        self.diagnostics
            .counters
            .cancellations
            .fetch_add(1, Ordering::Relaxed);
        self.log(LogLevel::Info, "team.cancelled", json!({ "batches": cancelled }));
        cancelled
    }

    /// Cancels pending input, clears runtime state and reloads stored macros.
    ///
    /// The macro file is read first; when it cannot be read the team is left
    /// untouched.
    pub fn reset(&self) -> Result<(), TeamError> {
        let stored = self.store.as_ref().map(read_macro_file).transpose()?;
        self.cancel_all();
        self.recent.lock().clear();
        self.diagnostics.clear();
        let table = stored.map_or_else(MacroTable::default, |file| {
            build_macros(file, &self.verbs, &self.config.macros.limits, &self.diagnostics)
        });
        *self.macros.write() = table;
        self.log(LogLevel::Info, "team.reset", json!({}));
        Ok(())
    }

    /// Compiles and stores a new macro.
    pub fn add_macro(&self, name: &str, body: &str) -> Result<(), TeamError> {
        self.ensure_macro_changes()?;
        self.update_macros("macro.added", name, |macros| {
            let item = self.compile(name, body, macros)?;
            macros.add(item)
        })
    }

    /// Replaces an existing macro.
    pub fn change_macro(&self, name: &str, body: &str) -> Result<(), TeamError> {
        self.ensure_macro_changes()?;
        self.update_macros("macro.changed", name, |macros| {
            let item = self.compile(name, body, macros)?;
            macros.change(item).map(drop)
        })
    }

    /// Deletes a macro.
    pub fn remove_macro(&self, name: &str) -> Result<(), TeamError> {
        self.ensure_macro_changes()?;
        self.update_macros("macro.removed", name, |macros| macros.remove(name).map(drop))
    }

    /// Applies `change` to a copy of the table and keeps it only once it is
    /// persisted, so a failed write leaves memory and file in agreement.
    fn update_macros(
        &self,
        event_type: &str,
        name: &str,
        change: impl FnOnce(&mut MacroTable) -> Result<(), MacroError>,
    ) -> Result<(), TeamError> {
        {
            let mut macros = self.macros.write();
            let mut staged = macros.clone();
            change(&mut staged)?;
            self.persist_macros(&staged)?;
            *macros = staged;
        }
        self.log(LogLevel::Info, event_type, json!({ "macro": name.to_lowercase() }));
        self.event(event_type, json!({ "macro": name.to_lowercase() }));
        Ok(())
    }

    /// Replaces the macro table with the macro file's contents.
    pub fn reload_macros(&self) -> Result<usize, TeamError> {
        let Some(store) = &self.store else {
            return Ok(self.macros.read().len());
        };
        let file = read_macro_file(store)?;
        let table = build_macros(file, &self.verbs, &self.config.macros.limits, &self.diagnostics);
        let loaded = table.len();
        *self.macros.write() = table;
        self.log(LogLevel::Info, "macro.reloaded", json!({ "macros": loaded }));
        Ok(loaded)
    }

    /// Names of stored macros.
    #[must_use]
    pub fn macro_names(&self) -> Vec<String> {
        self.macros.read().names().map(str::to_string).collect()
    }

    /// Exports runtime state.
    #[must_use]
    pub fn snapshot(&self) -> TeamSnapshot {
        TeamSnapshot {
            macros: self.macros.read().to_steps(),
        }
    }

    /// Overwrites runtime state. Invalid macros are skipped and returned.
    pub fn restore(&self, snapshot: TeamSnapshot) -> Vec<MacroError> {
        let (table, rejected) =
            MacroTable::from_steps(snapshot.macros, &self.verbs, &self.config.macros.limits);
        for error in &rejected {
            self.diagnostics.push_dropped("", error.to_string());
        }
        let mut macros = self.macros.write();
        *macros = table;
        if let Err(err) = self.persist_macros(&macros) {
            warn!(team = %self.config.name, error = %err, "restored macros were not persisted");
        }
        rejected
    }

    /// Current diagnostics.
    #[must_use]
    pub fn diagnostics(&self) -> TeamDiagnostics {
        TeamDiagnostics {
            team: self.config.name.clone(),
            profile: self.verbs.profile().to_string(),
            target: self.config.target.to_string(),
            pending_events: self.scheduler.pending_events(),
            active_batches: self.scheduler.active_batches(),
            macros: self.macros.read().len(),
            random_inputs: self.random_enabled.load(Ordering::SeqCst),
            counters: self.diagnostics.counters.snapshot(),
            dispatch: self.scheduler.dispatcher().stats(),
            last_parse_errors: self.diagnostics.dropped.lock().iter().cloned().collect(),
            last_dispatch_failures: self.diagnostics.failures.lock().iter().cloned().collect(),
        }
    }

    /// Stops random input, cancels pending presses and lets in-flight releases finish.
    pub async fn shutdown(&self, grace: Duration) {
        if let Some(handle) = self.random_loop.lock().take() {
            handle.abort();
        }
        self.scheduler.cancel_all();
        if tokio::time::timeout(grace, self.scheduler.until_idle()).await.is_err() {
            warn!(team = %self.config.name, "batches still active at shutdown");
        }
        self.scheduler.dispatcher().shutdown();
        self.log(LogLevel::Info, "team.stopped", json!({}));
    }

    fn compile(&self, name: &str, body: &str, macros: &MacroTable) -> Result<Macro, MacroError> {
        Macro::compile(
            name,
            body,
            &self.parser,
            &self.verbs,
            macros,
            &self.config.macros.limits,
        )
    }

    fn ensure_macro_changes(&self) -> Result<(), MacroError> {
        if self.config.macros.allow_changes {
            Ok(())
        } else {
            Err(MacroError::ChangesDisabled)
        }
    }

    fn persist_macros(&self, macros: &MacroTable) -> Result<(), TeamError> {
        let Some(store) = self.store.as_ref().filter(|_| self.config.macros.persistent) else {
            return Ok(());
        };
        let file = MacroFile {
            name: self.config.name.clone(),
            macros: macros.to_steps(),
        };
        store
            .save(&file)
            .map_err(|err| TeamError::Storage(format!("{err:#}")))
    }

    fn log(&self, level: LogLevel, message: &str, metadata: serde_json::Value) {
        if let Some(telemetry) = &self.telemetry {
            if let Err(err) = telemetry.log(level, message, metadata) {
                warn!(team = %self.config.name, error = %err, "telemetry log failed");
            }
        }
    }

    fn event(&self, event_type: &str, payload: serde_json::Value) {
        if let Some(telemetry) = &self.telemetry {
            telemetry.event(event_type, payload);
        }
    }
}

fn read_macro_file(store: &JsonMacroStore) -> Result<MacroFile, TeamError> {
    store
        .load()
        .map_err(|err| TeamError::Storage(format!("{err:#}")))
}

fn build_macros(
    file: MacroFile,
    verbs: &VerbTable,
    limits: &MacroLimits,
    diagnostics: &Diagnostics,
) -> MacroTable {
    let (table, rejected) = MacroTable::from_steps(file.macros, verbs, limits);
    for error in rejected {
        diagnostics.push_dropped("", error.to_string());
    }
    table
}

async fn random_loop(team: Weak<TeamRuntime>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(runtime) = team.upgrade() else {
            break;
        };
        if runtime.random_enabled.load(Ordering::SeqCst) && runtime.scheduler.active_batches() == 0 {
            runtime.inject_random();
        }
    }
}
