use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::{
    parser::{CommandParser, ParseError, RawTiming, TokenTarget, Vocabulary},
    validation::{validate, ActionRequest, ValidationRejected},
    verbs::VerbTable,
};

static MACRO_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9_]+$").expect("macro name pattern compiles"));

/// One stored step of a macro.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacroStep {
    /// Canonical verb name.
    pub verb: String,
    /// Offset from the invocation time.
    #[serde(default)]
    pub delay_ms: u32,
    /// Hold time.
    pub duration_ms: u32,
}

/// Bounds every macro must respect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MacroLimits {
    /// Ceiling on `delay + duration` for any step.
    pub max_total_ms: u32,
    /// Maximum number of flattened steps.
    pub max_steps: usize,
}

impl Default for MacroLimits {
    fn default() -> Self {
        Self {
            max_total_ms: 5_000,
            max_steps: 32,
        }
    }
}

/// Failures of macro management and expansion.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MacroError {
    /// Name does not match `^[a-zA-Z0-9_]+$`.
    #[error("invalid macro name '{0}'")]
    InvalidName(String),
    /// A macro with this name exists.
    #[error("macro '{0}' already exists")]
    AlreadyExists(String),
    /// No macro with this name.
    #[error("macro '{0}' does not exist")]
    Missing(String),
    /// The body names something that is neither a verb nor a macro.
    #[error("macro '{name}' uses unknown verb '{verb}'")]
    UnknownVerb {
        /// Macro being built.
        name: String,
        /// Unresolved word.
        verb: String,
    },
    /// The macro would not press any key.
    #[error("macro '{0}' has no steps")]
    Empty(String),
    /// A step ends past the macro ceiling.
    #[error("macro '{name}' runs for {max_time} ms, above the {limit} ms limit")]
    ExceedsBounds {
        /// Macro name.
        name: String,
        /// Latest step end.
        max_time: u32,
        /// Configured ceiling.
        limit: u32,
    },
    /// Too many steps after flattening.
    #[error("macro '{name}' has {steps} steps, above the {limit} step limit")]
    TooManySteps {
        /// Macro name.
        name: String,
        /// Step count.
        steps: usize,
        /// Configured maximum.
        limit: usize,
    },
    /// The body has a malformed timing clause.
    #[error("macro body: {0}")]
    Timing(ParseError),
    /// A step or the invocation carries negative timing.
    #[error("macro timing rejected: {0}")]
    Rejected(ValidationRejected),
    /// The team does not accept macro changes.
    #[error("macro changes are disabled for this team")]
    ChangesDisabled,
}

/// Named, validated sequence of steps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Macro {
    name: String,
    steps: Vec<MacroStep>,
    min_time: u32,
    max_time: u32,
}

impl Macro {
    /// Validates steps against the current verbs and limits.
    ///
    /// Steps are clamped like any parsed request, so a stored macro can never
    /// hold a key longer than its verb allows.
    pub fn new(
        name: &str,
        steps: Vec<MacroStep>,
        verbs: &VerbTable,
        limits: &MacroLimits,
    ) -> Result<Self, MacroError> {
        let name = normalize_name(name)?;
        let mut clamped = Vec::with_capacity(steps.len());
        for step in steps {
            let spec = verbs.get(&step.verb).ok_or_else(|| MacroError::UnknownVerb {
                name: name.clone(),
                verb: step.verb.clone(),
            })?;
            let request = validate(
                RawTiming::delayed(i64::from(step.delay_ms), Some(i64::from(step.duration_ms))),
                spec,
            )
            .map_err(MacroError::Rejected)?;
            clamped.push(MacroStep {
                verb: step.verb,
                delay_ms: request.delay_ms(),
                duration_ms: request.duration_ms(),
            });
        }
        Self::from_clamped(name, clamped, limits)
    }

    fn from_clamped(name: String, steps: Vec<MacroStep>, limits: &MacroLimits) -> Result<Self, MacroError> {
        if steps.is_empty() {
            return Err(MacroError::Empty(name));
        }
        if steps.len() > limits.max_steps {
            return Err(MacroError::TooManySteps {
                name,
                steps: steps.len(),
                limit: limits.max_steps,
            });
        }
        let ends = steps.iter().map(|s| s.delay_ms.saturating_add(s.duration_ms));
        let min_time = ends.clone().min().unwrap_or_default();
        let max_time = ends.max().unwrap_or_default();
        if max_time > limits.max_total_ms {
            return Err(MacroError::ExceedsBounds {
                name,
                max_time,
                limit: limits.max_total_ms,
            });
        }
        Ok(Self {
            name,
            steps,
            min_time,
            max_time,
        })
    }

    /// Compiles an operator-supplied body such as `right 200 jump 100+50`.
    ///
    /// Macros referenced in the body are flattened with their invocation
    /// offsets applied.
    pub fn compile(
        name: &str,
        body: &str,
        parser: &CommandParser,
        verbs: &VerbTable,
        macros: &MacroTable,
        limits: &MacroLimits,
    ) -> Result<Self, MacroError> {
        let name = normalize_name(name)?;
        let vocabulary = TeamVocabulary::new(verbs, macros);
        let parsed = parser.parse_body(body, &vocabulary);
        if let Some(error) = parsed.errors.into_iter().next() {
            return Err(MacroError::Timing(error));
        }
        if let Some(verb) = parsed.unknown.into_iter().next() {
            return Err(MacroError::UnknownVerb { name, verb });
        }

        let mut steps = Vec::new();
        for token in parsed.tokens {
            match &token.target {
                TokenTarget::Verb(spec) => {
                    let request = validate(token.timing, spec).map_err(MacroError::Rejected)?;
                    steps.push(step_of(&request));
                }
                TokenTarget::Macro(inner) => {
                    let nested = macros
                        .get(inner)
                        .ok_or_else(|| MacroError::Missing(inner.clone()))?;
                    steps.extend(nested.expand(token.timing, verbs)?.iter().map(step_of));
                }
            }
        }
        Self::from_clamped(name, steps, limits)
    }

    /// Lower-case macro name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stored steps.
    #[must_use]
    pub fn steps(&self) -> &[MacroStep] {
        &self.steps
    }

    /// Earliest step end.
    #[must_use]
    pub const fn min_time(&self) -> u32 {
        self.min_time
    }

    /// Latest step end.
    #[must_use]
    pub const fn max_time(&self) -> u32 {
        self.max_time
    }

    /// Expands an invocation into clamped requests.
    ///
    /// The invocation delay is added to every step. An explicit invocation
    /// duration replaces the first step's duration and shifts the others by
    /// the same amount.
    pub fn expand(&self, invocation: RawTiming, verbs: &VerbTable) -> Result<Vec<ActionRequest>, MacroError> {
        if invocation.delay_ms < 0 {
            return Err(MacroError::Rejected(ValidationRejected::NegativeDelay(invocation.delay_ms)));
        }
        if let Some(duration) = invocation.duration_ms.filter(|d| *d < 0) {
            return Err(MacroError::Rejected(ValidationRejected::NegativeDuration(duration)));
        }
        let first = self.steps.first().map_or(0, |s| i64::from(s.duration_ms));
        self.steps
            .iter()
            .map(|step| {
                let spec = verbs.get(&step.verb).ok_or_else(|| MacroError::UnknownVerb {
                    name: self.name.clone(),
                    verb: step.verb.clone(),
                })?;
                let duration = invocation
                    .duration_ms
                    .map_or(i64::from(step.duration_ms), |d| {
                        (d + i64::from(step.duration_ms) - first).max(0)
                    });
                validate(
                    RawTiming::delayed(invocation.delay_ms + i64::from(step.delay_ms), Some(duration)),
                    spec,
                )
                .map_err(MacroError::Rejected)
            })
            .collect()
    }
}

fn step_of(request: &ActionRequest) -> MacroStep {
    MacroStep {
        verb: request.verb().to_string(),
        delay_ms: request.delay_ms(),
        duration_ms: request.duration_ms(),
    }
}

fn normalize_name(name: &str) -> Result<String, MacroError> {
    if MACRO_NAME.is_match(name) {
        Ok(name.to_lowercase())
    } else {
        Err(MacroError::InvalidName(name.to_string()))
    }
}

/// Per-team macro store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MacroTable {
    macros: IndexMap<String, Macro>,
}

impl MacroTable {
    /// Looks a macro up by name, ignoring case.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Macro> {
        self.macros.get(&name.to_lowercase())
    }

    /// Number of macros.
    #[must_use]
    pub fn len(&self) -> usize {
        self.macros.len()
    }

    /// Whether no macro is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.macros.is_empty()
    }

    /// Stored names in insertion order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.macros.keys().map(String::as_str)
    }

    /// Adds a macro that does not exist yet.
    pub fn add(&mut self, item: Macro) -> Result<(), MacroError> {
        if self.macros.contains_key(item.name()) {
            return Err(MacroError::AlreadyExists(item.name));
        }
        self.macros.insert(item.name.clone(), item);
        Ok(())
    }

    /// Replaces an existing macro, returning the old definition.
    pub fn change(&mut self, item: Macro) -> Result<Macro, MacroError> {
        match self.macros.get_mut(item.name()) {
            Some(slot) => Ok(std::mem::replace(slot, item)),
            None => Err(MacroError::Missing(item.name)),
        }
    }

    /// Removes a macro.
    pub fn remove(&mut self, name: &str) -> Result<Macro, MacroError> {
        self.macros
            .shift_remove(&name.to_lowercase())
            .ok_or_else(|| MacroError::Missing(name.to_lowercase()))
    }

    /// Drops every macro.
    pub fn clear(&mut self) {
        self.macros.clear();
    }

    /// Step lists keyed by name, as persisted.
    #[must_use]
    pub fn to_steps(&self) -> IndexMap<String, Vec<MacroStep>> {
        self.macros
            .iter()
            .map(|(name, item)| (name.clone(), item.steps.clone()))
            .collect()
    }

    /// Rebuilds a table from persisted steps.
    ///
    /// Every macro is validated again; invalid ones are left out and reported.
    #[must_use]
    pub fn from_steps(
        stored: IndexMap<String, Vec<MacroStep>>,
        verbs: &VerbTable,
        limits: &MacroLimits,
    ) -> (Self, Vec<MacroError>) {
        let mut table = Self::default();
        let mut rejected = Vec::new();
        for (name, steps) in stored {
            match Macro::new(&name, steps, verbs, limits).and_then(|item| table.add(item)) {
                Ok(()) => {}
                Err(error) => {
                    warn!(macro_name = %name, %error, "dropping stored macro");
                    rejected.push(error);
                }
            }
        }
        (table, rejected)
    }
}

/// Verbs first, then macros.
#[derive(Debug, Clone, Copy)]
pub struct TeamVocabulary<'a> {
    verbs: &'a VerbTable,
    macros: &'a MacroTable,
}

impl<'a> TeamVocabulary<'a> {
    /// Combines a verb table and a macro table.
    #[must_use]
    pub const fn new(verbs: &'a VerbTable, macros: &'a MacroTable) -> Self {
        Self { verbs, macros }
    }
}

impl Vocabulary for TeamVocabulary<'_> {
    fn resolve(&self, word: &str) -> Option<TokenTarget> {
        Vocabulary::resolve(self.verbs, word).or_else(|| {
            self.macros
                .get(word)
                .map(|item| TokenTarget::Macro(item.name.clone()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{parser::ParserConfig, profiles::builtin};

    fn verbs() -> VerbTable {
        builtin("towerfall_keyboard").unwrap()
    }

    fn parser() -> CommandParser {
        CommandParser::new(ParserConfig::default()).unwrap()
    }

    fn compile(name: &str, body: &str, macros: &MacroTable) -> Result<Macro, MacroError> {
        Macro::compile(name, body, &parser(), &verbs(), macros, &MacroLimits::default())
    }

    fn shape(requests: &[ActionRequest]) -> Vec<(&str, u32, u32)> {
        requests
            .iter()
            .map(|r| (r.verb(), r.delay_ms(), r.duration_ms()))
            .collect()
    }

    #[test]
    fn compiles_body_with_aliases() {
        let item = compile("Combo_1", "right 200 j 100+50 fire", &MacroTable::default()).unwrap();
        assert_eq!(item.name(), "combo_1");
        assert_eq!(
            item.steps(),
            &[
                MacroStep { verb: "right".into(), delay_ms: 0, duration_ms: 200 },
                MacroStep { verb: "jump".into(), delay_ms: 100, duration_ms: 50 },
                MacroStep { verb: "shoot".into(), delay_ms: 0, duration_ms: 100 },
            ]
        );
        assert_eq!((item.min_time(), item.max_time()), (100, 200));
    }

    #[test]
    fn rejects_bad_names_and_bodies() {
        let empty = MacroTable::default();
        assert_eq!(
            compile("bad-name", "jump", &empty),
            Err(MacroError::InvalidName("bad-name".into()))
        );
        assert_eq!(compile("m", "", &empty), Err(MacroError::Empty("m".into())));
        assert_eq!(
            compile("m", "jump wiggle", &empty),
            Err(MacroError::UnknownVerb { name: "m".into(), verb: "wiggle".into() })
        );
        assert!(matches!(compile("m", "jump 10++5", &empty), Err(MacroError::Timing(_))));
        assert_eq!(
            compile("m", "jump 6000+", &empty),
            Err(MacroError::ExceedsBounds { name: "m".into(), max_time: 6000, limit: 5000 })
        );
    }

    #[test]
    fn add_change_remove_lifecycle() {
        let mut table = MacroTable::default();
        table.add(compile("hop", "jump", &table).unwrap()).unwrap();
        assert_eq!(
            table.add(compile("HOP", "up", &table).unwrap()),
            Err(MacroError::AlreadyExists("hop".into()))
        );
        let old = table.change(compile("hop", "jump 80", &table).unwrap()).unwrap();
        assert_eq!(old.steps()[0].duration_ms, 250);
        assert_eq!(table.get("HOP").unwrap().steps()[0].duration_ms, 80);
        assert_eq!(
            table.change(compile("other", "up", &table).unwrap()),
            Err(MacroError::Missing("other".into()))
        );
        table.remove("Hop").unwrap();
        assert_eq!(table.remove("hop"), Err(MacroError::Missing("hop".into())));
        assert!(table.is_empty());
    }

    #[test]
    fn invocation_offsets_shift_every_step() {
        let item = compile("combo", "right 200 jump 100+50", &MacroTable::default()).unwrap();
        let verbs = verbs();
        let plain = item.expand(RawTiming::default(), &verbs).unwrap();
        assert_eq!(shape(&plain), vec![("right", 0, 200), ("jump", 100, 50)]);

        let delayed = item.expand(RawTiming::delayed(300, None), &verbs).unwrap();
        assert_eq!(shape(&delayed), vec![("right", 300, 200), ("jump", 400, 50)]);

        let stretched = item.expand(RawTiming::delayed(0, Some(400)), &verbs).unwrap();
        assert_eq!(shape(&stretched), vec![("right", 0, 400), ("jump", 100, 250)]);

        let shrunk = item.expand(RawTiming::duration(10), &verbs).unwrap();
        assert_eq!(shape(&shrunk), vec![("right", 0, 10), ("jump", 100, 1)]);
    }

    #[test]
    fn expansion_is_clamped_again() {
        let item = compile("late", "right 800+150", &MacroTable::default()).unwrap();
        let requests = item.expand(RawTiming::delayed(100, None), &verbs()).unwrap();
        assert_eq!(shape(&requests), vec![("right", 900, 100)]);
        assert!(matches!(
            item.expand(RawTiming::delayed(-1, None), &verbs()),
            Err(MacroError::Rejected(ValidationRejected::NegativeDelay(-1)))
        ));
    }

    #[test]
    fn nested_macros_are_flattened() {
        let mut table = MacroTable::default();
        table.add(compile("hop", "jump 100", &table).unwrap()).unwrap();
        let outer = compile("double", "hop hop 300+", &table).unwrap();
        assert_eq!(
            outer.steps(),
            &[
                MacroStep { verb: "jump".into(), delay_ms: 0, duration_ms: 100 },
                MacroStep { verb: "jump".into(), delay_ms: 300, duration_ms: 100 },
            ]
        );
    }

    #[test]
    fn verbs_shadow_macros_of_the_same_name() {
        let mut table = MacroTable::default();
        table.add(compile("jump", "up", &table).unwrap()).unwrap();
        let verbs = verbs();
        let vocabulary = TeamVocabulary::new(&verbs, &table);
        assert!(matches!(vocabulary.resolve("jump"), Some(TokenTarget::Verb(_))));
    }

    #[test]
    fn stored_macros_are_revalidated() {
        let mut stored = IndexMap::new();
        stored.insert(
            "ok".to_string(),
            vec![MacroStep { verb: "right".into(), delay_ms: 0, duration_ms: 5000 }],
        );
        stored.insert(
            "stale".to_string(),
            vec![MacroStep { verb: "teleport".into(), delay_ms: 0, duration_ms: 10 }],
        );
        let (table, rejected) = MacroTable::from_steps(stored, &verbs(), &MacroLimits::default());
        assert_eq!(table.names().collect::<Vec<_>>(), vec!["ok"]);
        assert_eq!(table.get("ok").unwrap().steps()[0].duration_ms, 1000);
        assert_eq!(rejected.len(), 1);
        assert_eq!(table.to_steps()["ok"].len(), 1);
    }
}
