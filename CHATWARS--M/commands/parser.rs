use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::verbs::{ConfigurationError, VerbSpec, VerbTable};

/// Immutable parser settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParserConfig {
    /// Prefix marking the start of a command run.
    pub action_prefix: String,
    /// Separators allowed between delay and duration.
    pub separators: Vec<String>,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            action_prefix: "+".into(),
            separators: ["+", ",", ";", ":", "->"].map(String::from).to_vec(),
        }
    }
}

impl ParserConfig {
    /// Rejects prefixes and separators that would make the grammar ambiguous.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let bad = |text: &str| text.is_empty() || text.chars().any(|c| c.is_whitespace() || c.is_ascii_digit());
        if bad(&self.action_prefix) {
            return Err(ConfigurationError::InvalidParser(format!(
                "action prefix '{}' must be non-empty without digits or whitespace",
                self.action_prefix
            )));
        }
        if self.separators.is_empty() {
            return Err(ConfigurationError::InvalidParser(
                "at least one separator is required".into(),
            ));
        }
        if let Some(sep) = self.separators.iter().find(|s| bad(s) || s.as_str() == "-") {
            return Err(ConfigurationError::InvalidParser(format!(
                "separator '{sep}' is not allowed"
            )));
        }
        Ok(())
    }
}

/// What a command word resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenTarget {
    /// A verb of the team's table.
    Verb(Arc<VerbSpec>),
    /// A stored macro, by lower-case name.
    Macro(String),
}

/// Name lookup used by the parser.
pub trait Vocabulary {
    /// Resolves a lower-case word to a verb or macro.
    fn resolve(&self, word: &str) -> Option<TokenTarget>;
}

impl Vocabulary for VerbTable {
    fn resolve(&self, word: &str) -> Option<TokenTarget> {
        Self::resolve(self, word).cloned().map(TokenTarget::Verb)
    }
}

/// Timing exactly as written, before validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RawTiming {
    /// Delay from the batch reference time.
    pub delay_ms: i64,
    /// Requested duration; `None` means the verb default.
    pub duration_ms: Option<i64>,
}

impl RawTiming {
    /// Timing with only a duration.
    #[must_use]
    pub const fn duration(duration_ms: i64) -> Self {
        Self {
            delay_ms: 0,
            duration_ms: Some(duration_ms),
        }
    }

    /// Timing with a delay and optional duration.
    #[must_use]
    pub const fn delayed(delay_ms: i64, duration_ms: Option<i64>) -> Self {
        Self {
            delay_ms,
            duration_ms,
        }
    }
}

/// One recognised command word with its timing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawToken {
    /// Position of the command among the message's commands.
    pub index: usize,
    /// Word as typed, without the prefix.
    pub word: String,
    /// Resolved verb or macro.
    pub target: TokenTarget,
    /// Timing clause, defaulted when absent.
    pub timing: RawTiming,
}

/// Why a timing clause could not be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimingFault {
    /// A value carries a minus sign.
    #[error("negative value")]
    Negative,
    /// A value contains non-digit characters.
    #[error("not an integer")]
    NotAnInteger,
    /// A value does not fit in 32 bits.
    #[error("value out of range")]
    Overflow,
    /// A separator appears without a delay before it.
    #[error("missing delay before separator")]
    MissingDelay,
    /// Two separators in a row.
    #[error("doubled separator")]
    DoubledSeparator,
}

/// Per-command parse failures.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParseError {
    /// No token carries the action prefix.
    #[error("message contains no command")]
    NotACommand,
    /// The timing clause after a command is malformed; the command is dropped.
    #[error("malformed timing '{clause}' for '{word}': {fault}")]
    MalformedTiming {
        /// Command position.
        index: usize,
        /// Command word.
        word: String,
        /// Offending clause.
        clause: String,
        /// Reason.
        fault: TimingFault,
    },
}

/// Result of parsing one message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedMessage {
    /// Recognised commands in message order.
    pub tokens: Vec<RawToken>,
    /// Commands dropped because of malformed timing.
    pub errors: Vec<ParseError>,
    /// Words inside a run that resolved to nothing.
    pub unknown: Vec<String>,
}

impl ParsedMessage {
    /// Whether nothing executable was found.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

enum TimingScan {
    Absent,
    Clause(RawTiming, usize),
    Malformed {
        clause: String,
        fault: TimingFault,
        consumed: usize,
    },
}

/// Tokenizes chat messages into command tokens.
#[derive(Debug, Clone, Default)]
pub struct CommandParser {
    config: ParserConfig,
}

impl CommandParser {
    /// Creates a parser from a validated configuration.
    pub fn new(config: ParserConfig) -> Result<Self, ConfigurationError> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &ParserConfig {
        &self.config
    }

    /// Whether any word carries the action prefix.
    #[must_use]
    pub fn is_command(&self, raw: &str) -> bool {
        raw.split_whitespace().any(|word| self.strip_prefix(word).is_some())
    }

    /// Parses a chat message.
    ///
    /// Words before the first prefixed word are prose. Inside a run, bare
    /// verbs and macros chain, while any other word ends the run.
    pub fn parse<V: Vocabulary + ?Sized>(
        &self,
        raw: &str,
        vocabulary: &V,
    ) -> Result<ParsedMessage, ParseError> {
        if !self.is_command(raw) {
            return Err(ParseError::NotACommand);
        }
        Ok(self.scan(raw, vocabulary, false))
    }

    /// Parses text where every word belongs to one run, as in macro bodies.
    #[must_use]
    pub fn parse_body<V: Vocabulary + ?Sized>(&self, raw: &str, vocabulary: &V) -> ParsedMessage {
        self.scan(raw, vocabulary, true)
    }

    fn scan<V: Vocabulary + ?Sized>(&self, raw: &str, vocabulary: &V, whole_run: bool) -> ParsedMessage {
        let words: Vec<&str> = raw.split_whitespace().collect();
        let mut parsed = ParsedMessage::default();
        let mut in_run = whole_run;
        let mut index = 0;
        let mut cursor = 0;

        while cursor < words.len() {
            let word = words[cursor];
            cursor += 1;
            let (candidate, prefixed) = match self.strip_prefix(word) {
                Some(rest) => (rest, true),
                None => (word, false),
            };
            if prefixed {
                in_run = true;
            } else if !in_run || looks_like_timing(word) {
                continue;
            }

            let lowered = candidate.to_lowercase();
            let Some(target) = vocabulary.resolve(&lowered) else {
                parsed.unknown.push(lowered);
                in_run = whole_run;
                continue;
            };

            match self.scan_timing(&words[cursor..]) {
                TimingScan::Absent => parsed.tokens.push(RawToken {
                    index,
                    word: lowered,
                    target,
                    timing: RawTiming::default(),
                }),
                TimingScan::Clause(timing, consumed) => {
                    cursor += consumed;
                    parsed.tokens.push(RawToken {
                        index,
                        word: lowered,
                        target,
                        timing,
                    });
                }
                TimingScan::Malformed {
                    clause,
                    fault,
                    consumed,
                } => {
                    cursor += consumed;
                    parsed.errors.push(ParseError::MalformedTiming {
                        index,
                        word: lowered,
                        clause,
                        fault,
                    });
                }
            }
            index += 1;
        }
        parsed
    }

    /// Reads a timing clause with no embedded whitespace.
    pub fn parse_timing(&self, clause: &str) -> Result<RawTiming, TimingFault> {
        let Some((at, sep)) = self.find_separator(clause) else {
            return parse_ms(clause).map(RawTiming::duration);
        };
        let (delay, rest) = (&clause[..at], &clause[at + sep.len()..]);
        if delay.is_empty() {
            return Err(TimingFault::MissingDelay);
        }
        let delay = parse_ms(delay)?;
        if rest.is_empty() {
            return Ok(RawTiming::delayed(delay, None));
        }
        if self.separators().any(|s| rest.starts_with(s)) {
            return Err(TimingFault::DoubledSeparator);
        }
        Ok(RawTiming::delayed(delay, Some(parse_ms(rest)?)))
    }

    fn scan_timing(&self, rest: &[&str]) -> TimingScan {
        let Some(first) = rest.first() else {
            return TimingScan::Absent;
        };
        if !looks_like_timing(first) {
            return TimingScan::Absent;
        }
        let mut clause = (*first).to_string();
        let mut consumed = 1;
        if self.ends_with_separator(first) {
            if let Some(next) = rest.get(1).filter(|w| is_digits(w)) {
                clause.push_str(next);
                consumed = 2;
            }
        } else if is_digits(first) {
            if let Some(next) = rest.get(1) {
                if self.separators().any(|s| s == *next) {
                    clause.push_str(next);
                    consumed = 2;
                    if let Some(after) = rest.get(2).filter(|w| is_digits(w)) {
                        clause.push_str(after);
                        consumed = 3;
                    }
                } else if self
                    .separators()
                    .any(|s| next.strip_prefix(s).is_some_and(is_digits))
                {
                    clause.push_str(next);
                    consumed = 2;
                }
            }
        }
        match self.parse_timing(&clause) {
            Ok(timing) => TimingScan::Clause(timing, consumed),
            Err(fault) => TimingScan::Malformed {
                clause,
                fault,
                consumed,
            },
        }
    }

    fn strip_prefix<'a>(&self, word: &'a str) -> Option<&'a str> {
        word.strip_prefix(self.config.action_prefix.as_str())
            .filter(|rest| !rest.is_empty())
    }

    fn separators(&self) -> impl Iterator<Item = &str> {
        self.config.separators.iter().map(String::as_str)
    }

    fn ends_with_separator(&self, word: &str) -> bool {
        self.separators()
            .any(|s| word.len() > s.len() && word.ends_with(s))
    }

    fn find_separator<'a>(&'a self, clause: &str) -> Option<(usize, &'a str)> {
        clause.char_indices().find_map(|(at, _)| {
            self.separators()
                .filter(|s| clause[at..].starts_with(s))
                .max_by_key(|s| s.len())
                .map(|s| (at, s))
        })
    }
}

fn looks_like_timing(word: &str) -> bool {
    let mut chars = word.chars();
    match chars.next() {
        Some(c) if c.is_ascii_digit() => true,
        Some('-') => chars.next().is_some_and(|c| c.is_ascii_digit()),
        _ => false,
    }
}

fn is_digits(word: &str) -> bool {
    !word.is_empty() && word.bytes().all(|b| b.is_ascii_digit())
}

fn parse_ms(text: &str) -> Result<i64, TimingFault> {
    if text.starts_with('-') {
        return Err(TimingFault::Negative);
    }
    if !is_digits(text) {
        return Err(TimingFault::NotAnInteger);
    }
    text.parse::<u32>()
        .map(i64::from)
        .map_err(|_| TimingFault::Overflow)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiles::builtin;

    fn parser() -> CommandParser {
        CommandParser::new(ParserConfig::default()).unwrap()
    }

    fn table() -> VerbTable {
        builtin("towerfall_keyboard").unwrap()
    }

    fn timings(parsed: &ParsedMessage) -> Vec<(&str, RawTiming)> {
        parsed
            .tokens
            .iter()
            .map(|t| (t.word.as_str(), t.timing))
            .collect()
    }

    #[test]
    fn plain_text_is_not_a_command() {
        assert_eq!(
            parser().parse("good game everyone", &table()),
            Err(ParseError::NotACommand)
        );
        assert_eq!(parser().parse("+ right", &table()), Err(ParseError::NotACommand));
    }

    #[test]
    fn prose_around_a_command_is_ignored() {
        let parsed = parser().parse("gg +right nice game", &table()).unwrap();
        assert_eq!(timings(&parsed), vec![("right", RawTiming::default())]);
        assert_eq!(parsed.unknown, vec!["nice"]);
    }

    #[test]
    fn bare_verbs_chain_until_prose() {
        let parsed = parser()
            .parse("+right 200+300 left 200+300 lol jump", &table())
            .unwrap();
        assert_eq!(
            timings(&parsed),
            vec![
                ("right", RawTiming::delayed(200, Some(300))),
                ("left", RawTiming::delayed(200, Some(300))),
            ]
        );
        assert_eq!(parsed.tokens[1].index, 1);
    }

    #[test]
    fn every_separator_is_equivalent() {
        for sep in ["+", ",", ";", ":", "->"] {
            let parsed = parser().parse(&format!("+jump 120{sep}80"), &table()).unwrap();
            assert_eq!(
                timings(&parsed),
                vec![("jump", RawTiming::delayed(120, Some(80)))],
                "separator {sep}"
            );
        }
    }

    #[test]
    fn delay_only_and_duration_only_clauses() {
        let parsed = parser().parse("+right 200+", &table()).unwrap();
        assert_eq!(timings(&parsed), vec![("right", RawTiming::delayed(200, None))]);
        let parsed = parser().parse("+right 300", &table()).unwrap();
        assert_eq!(timings(&parsed), vec![("right", RawTiming::duration(300))]);
    }

    #[test]
    fn whitespace_around_separator_is_allowed() {
        for text in ["+right 200 + 300", "+right 200+ 300", "+right 200 +300", "+right 200 -> 300"] {
            let parsed = parser().parse(text, &table()).unwrap();
            assert_eq!(
                timings(&parsed),
                vec![("right", RawTiming::delayed(200, Some(300)))],
                "{text}"
            );
        }
        let parsed = parser().parse("+right 200 +jump", &table()).unwrap();
        assert_eq!(
            timings(&parsed),
            vec![
                ("right", RawTiming::duration(200)),
                ("jump", RawTiming::default())
            ]
        );
    }

    #[test]
    fn aliases_resolve_case_insensitively() {
        let parsed = parser().parse("+FIRE +Dash 40", &table()).unwrap();
        let names: Vec<_> = parsed
            .tokens
            .iter()
            .map(|t| match &t.target {
                TokenTarget::Verb(spec) => spec.name.as_str(),
                TokenTarget::Macro(name) => name.as_str(),
            })
            .collect();
        assert_eq!(names, vec!["shoot", "dodge"]);
    }

    #[test]
    fn malformed_timing_drops_only_its_command() {
        let cases = [
            ("+right -5 +jump", TimingFault::Negative),
            ("+right 12x +jump", TimingFault::NotAnInteger),
            ("+right 99999999999 +jump", TimingFault::Overflow),
            ("+right 200++300 +jump", TimingFault::DoubledSeparator),
            ("+right 200->-5 +jump", TimingFault::Negative),
        ];
        for (text, expected) in cases {
            let parsed = parser().parse(text, &table()).unwrap();
            assert_eq!(timings(&parsed), vec![("jump", RawTiming::default())], "{text}");
            match &parsed.errors[..] {
                [ParseError::MalformedTiming { word, fault, .. }] => {
                    assert_eq!(word, "right");
                    assert_eq!(*fault, expected, "{text}");
                }
                other => panic!("unexpected errors for {text}: {other:?}"),
            }
        }
    }

    #[test]
    fn unknown_prefixed_word_ends_the_run() {
        let parsed = parser().parse("+dance right +jump", &table()).unwrap();
        assert_eq!(timings(&parsed), vec![("jump", RawTiming::default())]);
        assert_eq!(parsed.unknown, vec!["dance"]);
    }

    #[test]
    fn body_parsing_needs_no_prefix() {
        let parsed = parser().parse_body("right 100 jump 50+100 wiggle", &table());
        assert_eq!(parsed.tokens.len(), 2);
        assert_eq!(parsed.unknown, vec!["wiggle"]);
    }

    #[test]
    fn custom_prefix_and_separators() {
        let parser = CommandParser::new(ParserConfig {
            action_prefix: "!".into(),
            separators: vec!["/".into()],
        })
        .unwrap();
        let parsed = parser.parse("!jump 10/20", &table()).unwrap();
        assert_eq!(timings(&parsed), vec![("jump", RawTiming::delayed(10, Some(20)))]);
        assert!(CommandParser::new(ParserConfig {
            action_prefix: "1".into(),
            ..ParserConfig::default()
        })
        .is_err());
        assert!(CommandParser::new(ParserConfig {
            separators: vec!["-".into()],
            ..ParserConfig::default()
        })
        .is_err());
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn arbitrary_text_never_panics(text in "\\PC{0,80}") {
                let _ = parser().parse(&text, &table());
            }

            #[test]
            fn well_formed_clauses_round_trip(delay in 0u32..100_000, duration in 0u32..100_000, sep in prop::sample::select(vec!["+", ",", ";", ":", "->"])) {
                let parsed = parser().parse(&format!("+up {delay}{sep}{duration}"), &table()).unwrap();
                prop_assert_eq!(
                    parsed.tokens[0].timing,
                    RawTiming::delayed(i64::from(delay), Some(i64::from(duration)))
                );
            }
        }
    }
}
