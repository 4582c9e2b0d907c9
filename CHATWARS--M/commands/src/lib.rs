#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Chat command language: verb tables, parsing, clamping and macros.
//!
//! Everything here is synchronous and free of I/O except the profile and
//! macro file loaders.

/// Keys, verbs and validated verb tables.
#[path = "../verbs.rs"]
pub mod verbs;

/// Built-in game profiles and custom TOML profiles.
#[path = "../profiles.rs"]
pub mod profiles;

/// Chat message tokenizer.
#[path = "../parser.rs"]
pub mod parser;

/// Timing validation and clamping.
#[path = "../validation.rs"]
pub mod validation;

/// Macro definitions, tables and expansion.
#[path = "../macros.rs"]
pub mod macros;

/// JSON macro persistence.
#[path = "../macro_file.rs"]
pub mod macro_file;

pub use macro_file::{JsonMacroStore, MacroFile};
pub use macros::{Macro, MacroError, MacroLimits, MacroStep, MacroTable, TeamVocabulary};
pub use parser::{
    CommandParser, ParseError, ParsedMessage, ParserConfig, RawTiming, RawToken, TimingFault,
    TokenTarget, Vocabulary,
};
pub use profiles::{builtin, VerbTableDocument, BUILTIN_PROFILES};
pub use validation::{clamp_duration, validate, ActionRequest, ValidationRejected};
pub use verbs::{ConfigurationError, InputKind, KeyId, VerbSpec, VerbTable, VerbTableBuilder};
