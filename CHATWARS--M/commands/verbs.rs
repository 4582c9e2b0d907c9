use std::{collections::HashMap, fmt, sync::Arc};

use indexmap::IndexMap;
use rand::{distributions::WeightedIndex, prelude::Distribution, Rng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Ceiling on `delay + duration` used when a verb does not override it.
pub const DEFAULT_MAX_TOTAL_MS: u32 = 1000;

/// Opaque identifier of a key or button on the downstream device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyId(String);

impl KeyId {
    /// Wraps a key name.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Returns the raw key name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a verb drives its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputKind {
    /// Press, hold for the duration, release.
    #[default]
    PressRelease,
    /// Instantaneous press immediately followed by release.
    Toggle,
}

/// Immutable description of one controllable verb.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerbSpec {
    /// Canonical verb name, lower-case.
    pub name: String,
    /// Key driven by the verb.
    pub canonical_key: KeyId,
    /// Duration used when a command omits it.
    pub default_duration_ms: u32,
    /// Lower bound applied to requested durations.
    #[serde(default)]
    pub min_duration_ms: u32,
    /// Hard ceiling on `delay + duration`.
    #[serde(default = "default_max_total")]
    pub max_total_ms: u32,
    /// Press/release or toggle behaviour.
    #[serde(default)]
    pub input_kind: InputKind,
}

const fn default_max_total() -> u32 {
    DEFAULT_MAX_TOTAL_MS
}

impl VerbSpec {
    /// Creates a press/release verb with the default ceiling.
    #[must_use]
    pub fn press_release(
        name: impl Into<String>,
        key: impl Into<String>,
        default_duration_ms: u32,
    ) -> Self {
        Self {
            name: name.into().to_lowercase(),
            canonical_key: KeyId::new(key),
            default_duration_ms,
            min_duration_ms: 0,
            max_total_ms: DEFAULT_MAX_TOTAL_MS,
            input_kind: InputKind::PressRelease,
        }
    }

    /// Creates an instantaneous toggle verb.
    #[must_use]
    pub fn toggle(name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            input_kind: InputKind::Toggle,
            ..Self::press_release(name, key, 0)
        }
    }

    /// Overrides the ceiling on `delay + duration`.
    #[must_use]
    pub fn with_max_total(mut self, max_total_ms: u32) -> Self {
        self.max_total_ms = max_total_ms;
        self
    }

    /// Overrides the minimum duration.
    #[must_use]
    pub fn with_min_duration(mut self, min_duration_ms: u32) -> Self {
        self.min_duration_ms = min_duration_ms;
        self
    }

    fn check(&self) -> Result<(), ConfigurationError> {
        let invalid = |reason: &str| ConfigurationError::InvalidVerb {
            verb: self.name.clone(),
            reason: reason.into(),
        };
        if self.name.is_empty() || self.name.chars().any(char::is_whitespace) {
            return Err(invalid("name must be a single non-empty word"));
        }
        if self.canonical_key.as_str().is_empty() {
            return Err(invalid("canonical key is empty"));
        }
        if self.max_total_ms == 0 {
            return Err(invalid("max_total_ms must be positive"));
        }
        if self.min_duration_ms > self.max_total_ms {
            return Err(invalid("min_duration_ms exceeds max_total_ms"));
        }
        if self.default_duration_ms > self.max_total_ms {
            return Err(invalid("default_duration_ms exceeds max_total_ms"));
        }
        Ok(())
    }
}

/// Errors detected while building tables, targets, or teams.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    /// No built-in or declared profile carries this name.
    #[error("unknown verb profile '{0}'")]
    UnknownProfile(String),
    /// A verb definition is inconsistent.
    #[error("verb '{verb}': {reason}")]
    InvalidVerb {
        /// Offending verb.
        verb: String,
        /// Human readable detail.
        reason: String,
    },
    /// Two verbs or aliases share one name.
    #[error("name '{0}' is defined more than once")]
    DuplicateName(String),
    /// An alias points at a verb that does not exist.
    #[error("alias '{alias}' points to unknown verb '{target}'")]
    DanglingAlias {
        /// Alias being registered.
        alias: String,
        /// Missing verb.
        target: String,
    },
    /// A random weight references an unknown verb.
    #[error("random weight references unknown verb '{0}'")]
    UnknownRandomVerb(String),
    /// Prefix or separators cannot be used by the parser.
    #[error("invalid parser configuration: {0}")]
    InvalidParser(String),
    /// Input target is malformed.
    #[error("invalid input target: {0}")]
    InvalidTarget(String),
    /// Two teams share one name.
    #[error("team '{0}' is configured more than once")]
    DuplicateTeam(String),
    /// A declared custom profile could not be loaded or built.
    #[error("verb profile '{profile}' is unusable: {reason}")]
    BrokenProfile {
        /// Declared profile name.
        profile: String,
        /// Load or build failure.
        reason: String,
    },
}

/// Flat, read-only lookup from verb names and aliases to [`VerbSpec`]s.
#[derive(Debug, Clone, Default)]
pub struct VerbTable {
    profile: String,
    verbs: IndexMap<String, Arc<VerbSpec>>,
    aliases: HashMap<String, String>,
    random_weights: Vec<(String, u32)>,
}

impl VerbTable {
    /// Starts a builder for the named profile.
    #[must_use]
    pub fn builder(profile: impl Into<String>) -> VerbTableBuilder {
        VerbTableBuilder {
            profile: profile.into(),
            verbs: Vec::new(),
            aliases: Vec::new(),
            random_weights: Vec::new(),
        }
    }

    /// Profile name the table was built for.
    #[must_use]
    pub fn profile(&self) -> &str {
        &self.profile
    }

    /// Resolves a verb name or alias, ignoring case.
    #[must_use]
    pub fn resolve(&self, word: &str) -> Option<&Arc<VerbSpec>> {
        let lowered = word.to_lowercase();
        self.verbs.get(&lowered).or_else(|| {
            self.aliases
                .get(&lowered)
                .and_then(|canonical| self.verbs.get(canonical))
        })
    }

    /// Looks up a verb by canonical name only.
    #[must_use]
    pub fn get(&self, canonical: &str) -> Option<&Arc<VerbSpec>> {
        self.verbs.get(canonical)
    }

    /// Iterates verbs in declaration order.
    pub fn verbs(&self) -> impl Iterator<Item = &Arc<VerbSpec>> {
        self.verbs.values()
    }

    /// Sorted aliases of a canonical verb.
    #[must_use]
    pub fn aliases_of(&self, canonical: &str) -> Vec<&str> {
        let mut aliases: Vec<&str> = self
            .aliases
            .iter()
            .filter(|(_, target)| target.as_str() == canonical)
            .map(|(alias, _)| alias.as_str())
            .collect();
        aliases.sort_unstable();
        aliases
    }

    /// Weighted verbs used for random injection.
    #[must_use]
    pub fn random_weights(&self) -> &[(String, u32)] {
        &self.random_weights
    }

    /// Number of canonical verbs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.verbs.len()
    }

    /// Whether the table has no verbs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.verbs.is_empty()
    }

    /// Picks a verb for random injection.
    ///
    /// Uses the profile's random weights when present, otherwise every verb
    /// is equally likely.
    pub fn pick_random<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<&Arc<VerbSpec>> {
        if self.random_weights.is_empty() {
            if self.verbs.is_empty() {
                return None;
            }
            let index = rng.gen_range(0..self.verbs.len());
            return self.verbs.get_index(index).map(|(_, spec)| spec);
        }
        let weights = WeightedIndex::new(self.random_weights.iter().map(|(_, w)| *w)).ok()?;
        let (verb, _) = &self.random_weights[weights.sample(rng)];
        self.verbs.get(verb)
    }
}

/// Builder validating a [`VerbTable`] before it is shared.
#[derive(Debug, Clone)]
pub struct VerbTableBuilder {
    profile: String,
    verbs: Vec<VerbSpec>,
    aliases: Vec<(String, String)>,
    random_weights: Vec<(String, u32)>,
}

impl VerbTableBuilder {
    /// Adds a verb.
    #[must_use]
    pub fn verb(mut self, spec: VerbSpec) -> Self {
        self.verbs.push(spec);
        self
    }

    /// Adds an alias for a verb (the target may itself be an alias).
    #[must_use]
    pub fn alias(mut self, alias: impl Into<String>, target: impl Into<String>) -> Self {
        self.aliases
            .push((alias.into().to_lowercase(), target.into().to_lowercase()));
        self
    }

    /// Adds a random-injection weight. Zero weights are ignored.
    #[must_use]
    pub fn random_weight(mut self, verb: impl Into<String>, weight: u32) -> Self {
        if weight > 0 {
            self.random_weights.push((verb.into().to_lowercase(), weight));
        }
        self
    }

    /// Validates every entry and freezes the table.
    pub fn build(self) -> Result<VerbTable, ConfigurationError> {
        let mut verbs = IndexMap::with_capacity(self.verbs.len());
        for mut spec in self.verbs {
            spec.name = spec.name.to_lowercase();
            spec.check()?;
            if verbs.contains_key(&spec.name) {
                return Err(ConfigurationError::DuplicateName(spec.name));
            }
            verbs.insert(spec.name.clone(), Arc::new(spec));
        }

        let mut aliases = HashMap::with_capacity(self.aliases.len());
        for (alias, target) in self.aliases {
            let canonical = if verbs.contains_key(&target) {
                target
            } else if let Some(resolved) = aliases.get(&target) {
                String::clone(resolved)
            } else {
                return Err(ConfigurationError::DanglingAlias { alias, target });
            };
            if alias == canonical {
                continue;
            }
            if verbs.contains_key(&alias) {
                return Err(ConfigurationError::DuplicateName(alias));
            }
            match aliases.get(&alias) {
                Some(existing) if *existing != canonical => {
                    return Err(ConfigurationError::DuplicateName(alias));
                }
                _ => {
                    aliases.insert(alias, canonical);
                }
            }
        }

        let mut random_weights = Vec::with_capacity(self.random_weights.len());
        for (verb, weight) in self.random_weights {
            let canonical = if verbs.contains_key(&verb) {
                verb
            } else {
                aliases
                    .get(&verb)
                    .cloned()
                    .ok_or(ConfigurationError::UnknownRandomVerb(verb))?
            };
            random_weights.push((canonical, weight));
        }

        Ok(VerbTable {
            profile: self.profile,
            verbs,
            aliases,
            random_weights,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn sample() -> VerbTable {
        VerbTable::builder("sample")
            .verb(VerbSpec::press_release("right", "dpad_right", 150))
            .verb(VerbSpec::press_release("jump", "a", 250).with_max_total(1500))
            .verb(VerbSpec::toggle("pause", "start"))
            .alias("r", "right")
            .alias("hop", "jump")
            .alias("leap", "hop")
            .random_weight("hop", 3)
            .build()
            .unwrap()
    }

    #[test]
    fn resolves_aliases_case_insensitively() {
        let table = sample();
        assert_eq!(table.resolve("RIGHT").unwrap().name, "right");
        assert_eq!(table.resolve("R").unwrap().canonical_key.as_str(), "dpad_right");
        assert_eq!(table.resolve("Leap").unwrap().name, "jump");
        assert!(table.resolve("left").is_none());
        assert_eq!(table.aliases_of("jump"), vec!["hop", "leap"]);
    }

    #[test]
    fn rejects_dangling_alias_and_duplicates() {
        let dangling = VerbTable::builder("bad")
            .verb(VerbSpec::press_release("right", "d", 100))
            .alias("l", "left")
            .build();
        assert!(matches!(
            dangling,
            Err(ConfigurationError::DanglingAlias { .. })
        ));

        let duplicate = VerbTable::builder("bad")
            .verb(VerbSpec::press_release("right", "d", 100))
            .verb(VerbSpec::press_release("Right", "e", 100))
            .build();
        assert_eq!(
            duplicate.unwrap_err(),
            ConfigurationError::DuplicateName("right".into())
        );
    }

    #[test]
    fn rejects_default_beyond_ceiling() {
        let err = VerbTable::builder("bad")
            .verb(VerbSpec::press_release("slow", "s", 2000))
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidVerb { .. }));
    }

    #[test]
    fn random_pick_follows_weights() {
        let table = sample();
        assert_eq!(table.random_weights(), &[("jump".to_string(), 3)]);
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..16 {
            assert_eq!(table.pick_random(&mut rng).unwrap().name, "jump");
        }
    }

    #[test]
    fn random_pick_without_weights_is_uniform_over_verbs() {
        let table = VerbTable::builder("plain")
            .verb(VerbSpec::press_release("a", "a", 100))
            .build()
            .unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(table.pick_random(&mut rng).unwrap().name, "a");
        assert!(VerbTable::default().pick_random(&mut rng).is_none());
    }
}
