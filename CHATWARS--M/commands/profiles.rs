use std::{fs, path::Path};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::verbs::{ConfigurationError, InputKind, VerbSpec, VerbTable, DEFAULT_MAX_TOTAL_MS};

/// Names accepted by [`builtin`].
pub const BUILTIN_PROFILES: &[&str] = &[
    "gamepad",
    "keyboard_arrows",
    "typewrite",
    "towerfall_keyboard",
    "towerfall_gamepad",
    "jumpking_keyboard",
    "jumpking_gamepad",
    "divekick_keyboard",
    "divekick_gamepad",
    "duckgame_keyboard",
    "duckgame_gamepad",
    "lethalleague_keyboard",
    "lethalleague_gamepad",
    "splody_keyboard",
    "splody_gamepad",
    "stickfight_gamepad",
    "trickytowers_keyboard",
    "trickytowers_gamepad",
];

const GAMEPAD_DURATION_MS: u32 = 150;

const TYPEWRITE_DURATION_MS: u32 = 20;

const GAMEPAD_BUTTONS: &[&str] = &[
    "a", "b", "x", "y", "lb", "rb", "lt", "rt", "ls", "rs", "start", "back", "guide",
    "dpad_up", "dpad_down", "dpad_left", "dpad_right", "ls_up", "ls_down", "ls_left",
    "ls_right", "rs_up", "rs_down", "rs_left", "rs_right",
];

/// Verb data of one game, shared by its keyboard and gamepad variants.
struct GameLayout {
    game: &'static str,
    keyboard: bool,
    /// (verb, keyboard key, gamepad button, default duration)
    verbs: &'static [(&'static str, &'static str, &'static str, u32)],
    aliases: &'static [(&'static str, &'static str)],
    random: &'static [(&'static str, u32)],
    /// Verbs whose ceiling differs from the default.
    ceilings: &'static [(&'static str, u32)],
}

const GAMES: &[GameLayout] = &[
    TOWERFALL,
    JUMPKING,
    DIVEKICK,
    DUCKGAME,
    LETHALLEAGUE,
    SPLODY,
    STICKFIGHT,
    TRICKYTOWERS,
];

const TOWERFALL: GameLayout = GameLayout {
    game: "towerfall",
    keyboard: true,
    verbs: &[
        ("left", "left", "dpad_left", 150),
        ("right", "right", "dpad_right", 150),
        ("up", "up", "dpad_up", 150),
        ("down", "down", "dpad_down", 150),
        ("jump", "c", "a", 250),
        ("dodge", "shift", "rt", 50),
        ("shoot", "x", "x", 100),
        ("alt", "z", "b", 100),
        ("toggle", "s", "y", 20),
    ],
    aliases: &[
        ("l", "left"),
        ("r", "right"),
        ("u", "up"),
        ("d", "down"),
        ("j", "jump"),
        ("crouch", "down"),
        ("duck", "down"),
        ("dash", "dodge"),
        ("catch", "dodge"),
        ("attack", "shoot"),
        ("fire", "shoot"),
        ("altattack", "alt"),
        ("altshoot", "alt"),
        ("altfire", "alt"),
        ("switch", "toggle"),
    ],
    random: &[
        ("left", 300),
        ("right", 300),
        ("up", 100),
        ("down", 100),
        ("jump", 200),
        ("dash", 50),
        ("shoot", 250),
        ("altshoot", 50),
        ("toggle", 50),
    ],
    ceilings: &[],
};

const JUMPKING: GameLayout = GameLayout {
    game: "jumpking",
    keyboard: true,
    verbs: &[
        ("left", "left", "dpad_left", 150),
        ("right", "right", "dpad_right", 150),
        ("jump", "space", "a", 150),
    ],
    aliases: &[("l", "left"), ("r", "right"), ("j", "jump")],
    random: &[("left", 300), ("right", 300), ("jump", 600)],
    ceilings: &[],
};

const DIVEKICK: GameLayout = GameLayout {
    game: "divekick",
    keyboard: true,
    verbs: &[("dive", "w", "y", 150), ("kick", "s", "x", 150)],
    aliases: &[("d", "dive"), ("k", "kick"), ("jump", "dive")],
    random: &[("dive", 700), ("kick", 700)],
    ceilings: &[],
};

const DUCKGAME: GameLayout = GameLayout {
    game: "duckgame",
    keyboard: true,
    verbs: &[
        ("left", "a", "dpad_left", 150),
        ("right", "d", "dpad_right", 150),
        // Up on its own does little, so it jumps.
        ("up", "space", "a", 250),
        ("down", "s", "dpad_down", 100),
        ("jump", "space", "a", 250),
        ("hop", "space", "a", 50),
        ("grab", "g", "y", 50),
        ("shoot", "h", "x", 100),
        ("strafe", "shiftleft", "lb", 100),
        ("trip", "f", "rb", 20),
        ("quack", "e", "b", 20),
    ],
    aliases: &[
        ("l", "left"),
        ("r", "right"),
        ("u", "up"),
        ("d", "down"),
        ("j", "jump"),
        ("crouch", "down"),
        ("duck", "down"),
        ("pickup", "grab"),
        ("attack", "shoot"),
        ("fire", "shoot"),
        ("taunt", "quack"),
    ],
    random: &[
        ("left", 300),
        ("right", 300),
        ("up", 100),
        ("hop", 100),
        ("down", 100),
        ("grab", 50),
        ("shoot", 250),
        ("trip", 50),
        ("quack", 50),
    ],
    ceilings: &[("shoot", 3_000)],
};

const LETHALLEAGUE: GameLayout = GameLayout {
    game: "lethalleague",
    keyboard: true,
    verbs: &[
        ("left", "left", "ls_left", 150),
        ("right", "right", "ls_right", 150),
        ("up", "up", "ls_up", 50),
        ("down", "down", "ls_down", 50),
        ("jump", "space", "a", 150),
        ("swing", "z", "x", 50),
        ("bunt", "x", "b", 50),
        ("express", "a", "y", 50),
    ],
    aliases: &[
        ("l", "left"),
        ("r", "right"),
        ("u", "up"),
        ("d", "down"),
        ("j", "jump"),
        ("crouch", "down"),
        ("duck", "down"),
        ("smash", "swing"),
        ("s", "swing"),
        ("parry", "bunt"),
        ("b", "bunt"),
        ("taunt", "express"),
        ("t", "express"),
    ],
    random: &[
        ("left", 200),
        ("right", 200),
        ("jump", 200),
        ("down", 40),
        ("swing", 100),
        ("bunt", 50),
        ("express", 5),
    ],
    ceilings: &[],
};

const SPLODY: GameLayout = GameLayout {
    game: "splody",
    keyboard: true,
    verbs: &[
        ("up", "up", "dpad_up", 250),
        ("down", "down", "dpad_down", 250),
        ("left", "left", "dpad_left", 250),
        ("right", "right", "dpad_right", 250),
        ("bomb", "l", "a", 50),
        ("secondary", "k", "b", 50),
        ("taunt", "j", "rb", 250),
    ],
    aliases: &[
        ("l", "left"),
        ("r", "right"),
        ("u", "up"),
        ("d", "down"),
        ("b", "bomb"),
        ("ping", "secondary"),
    ],
    random: &[
        ("up", 300),
        ("down", 300),
        ("left", 300),
        ("right", 300),
        ("bomb", 200),
        ("secondary", 100),
        ("taunt", 100),
    ],
    ceilings: &[],
};

const STICKFIGHT: GameLayout = GameLayout {
    game: "stickfight",
    keyboard: false,
    verbs: &[
        ("left", "", "dpad_left", 150),
        ("right", "", "dpad_right", 150),
        ("up", "", "dpad_up", 150),
        ("down", "", "dpad_down", 150),
        ("jump", "", "lb", 250),
        ("hop", "", "lb", 50),
        ("attack", "", "rt", 50),
        ("guard", "", "lt", 100),
        ("throw", "", "y", 50),
        ("aimleft", "", "rs_left", 150),
        ("aimright", "", "rs_right", 150),
        ("aimup", "", "rs_up", 150),
        ("aimdown", "", "rs_down", 150),
    ],
    aliases: &[
        ("l", "left"),
        ("r", "right"),
        ("u", "up"),
        ("d", "down"),
        ("j", "jump"),
        ("crouch", "down"),
        ("duck", "down"),
        ("yeet", "throw"),
        ("shoot", "attack"),
        ("fire", "attack"),
        ("defend", "guard"),
        ("shield", "guard"),
        ("aim_left", "aimleft"),
        ("aim_right", "aimright"),
        ("aim_up", "aimup"),
        ("aim_down", "aimdown"),
        ("aiml", "aimleft"),
        ("aimr", "aimright"),
        ("aimu", "aimup"),
        ("aimd", "aimdown"),
    ],
    random: &[
        ("left", 300),
        ("right", 300),
        ("jump", 100),
        ("hop", 100),
        ("down", 100),
        ("throw", 50),
        ("attack", 250),
        ("guard", 50),
        ("aimleft", 50),
        ("aimright", 50),
        ("aimup", 50),
        ("aimdown", 50),
    ],
    ceilings: &[],
};

const TRICKYTOWERS: GameLayout = GameLayout {
    game: "trickytowers",
    keyboard: true,
    verbs: &[
        ("left", "left", "dpad_left", 50),
        ("right", "right", "dpad_right", 50),
        ("down", "down", "dpad_down", 50),
        ("rotate", "up", "a", 50),
        ("nudge_left", "u", "lb", 50),
        ("nudge_right", "i", "rb", 50),
        ("light_magic", "j", "x", 50),
        ("dark_magic", "k", "b", 50),
    ],
    aliases: &[
        ("l", "left"),
        ("r", "right"),
        ("d", "down"),
        ("rot", "rotate"),
        ("nudgeleft", "nudge_left"),
        ("nudgeright", "nudge_right"),
        ("lightmagic", "light_magic"),
        ("darkmagic", "dark_magic"),
        ("left_nudge", "nudge_left"),
        ("right_nudge", "nudge_right"),
        ("leftnudge", "nudge_left"),
        ("rightnudge", "nudge_right"),
        ("nudgel", "nudge_left"),
        ("nudger", "nudge_right"),
        ("lnudge", "nudge_left"),
        ("rnudge", "nudge_right"),
        ("light", "light_magic"),
        ("dark", "dark_magic"),
        ("nl", "nudge_left"),
        ("nr", "nudge_right"),
        ("ln", "nudge_left"),
        ("rn", "nudge_right"),
    ],
    random: &[
        ("left", 100),
        ("right", 100),
        ("down", 20),
        ("rotate", 100),
        ("nudge_left", 50),
        ("nudge_right", 50),
        ("light_magic", 20),
        ("dark_magic", 20),
    ],
    ceilings: &[],
};

/// Builds one of the built-in profiles.
///
/// Game profiles are named `<game>_keyboard` or `<game>_gamepad`;
/// `towerfall` alone means the keyboard variant.
pub fn builtin(name: &str) -> Result<VerbTable, ConfigurationError> {
    let lowered = name.to_lowercase();
    match lowered.as_str() {
        "gamepad" => gamepad(),
        "keyboard_arrows" => keyboard_arrows(),
        "typewrite" => typewrite(),
        "towerfall" => TOWERFALL.table(&lowered, false),
        other => match game_variant(other) {
            Some((layout, gamepad)) => layout.table(other, gamepad),
            None => Err(ConfigurationError::UnknownProfile(other.to_string())),
        },
    }
}

fn game_variant(name: &str) -> Option<(&'static GameLayout, bool)> {
    let (game, variant) = name.rsplit_once('_')?;
    let layout = GAMES.iter().find(|layout| layout.game == game)?;
    match variant {
        "keyboard" if layout.keyboard => Some((layout, false)),
        "gamepad" => Some((layout, true)),
        _ => None,
    }
}

impl GameLayout {
    fn table(&self, profile: &str, gamepad: bool) -> Result<VerbTable, ConfigurationError> {
        let mut builder = VerbTable::builder(profile);
        for (verb, keyboard, button, duration) in self.verbs {
            let key = if gamepad { *button } else { *keyboard };
            let mut spec = VerbSpec::press_release(*verb, key, *duration).with_min_duration(1);
            if let Some((_, ceiling)) = self.ceilings.iter().find(|(name, _)| name == verb) {
                spec = spec.with_max_total(*ceiling);
            }
            builder = builder.verb(spec);
        }
        for (alias, target) in self.aliases {
            builder = builder.alias(*alias, *target);
        }
        for (verb, weight) in self.random {
            builder = builder.random_weight(*verb, *weight);
        }
        builder.build()
    }
}

fn gamepad() -> Result<VerbTable, ConfigurationError> {
    GAMEPAD_BUTTONS
        .iter()
        .fold(VerbTable::builder("gamepad"), |builder, button| {
            builder.verb(
                VerbSpec::press_release(*button, *button, GAMEPAD_DURATION_MS)
                    .with_min_duration(1),
            )
        })
        .build()
}

/// One verb per letter and digit, each tapping its own key.
fn typewrite() -> Result<VerbTable, ConfigurationError> {
    ('a'..='z')
        .chain('0'..='9')
        .map(String::from)
        .chain(["space", "enter", "backspace"].map(String::from))
        .fold(VerbTable::builder("typewrite"), |builder, key| {
            builder.verb(
                VerbSpec::press_release(key.clone(), key, TYPEWRITE_DURATION_MS)
                    .with_min_duration(1),
            )
        })
        .build()
}

fn keyboard_arrows() -> Result<VerbTable, ConfigurationError> {
    VerbTable::builder("keyboard_arrows")
        .verb(VerbSpec::press_release("left", "left", 150).with_min_duration(1))
        .verb(VerbSpec::press_release("right", "right", 150).with_min_duration(1))
        .verb(VerbSpec::press_release("up", "up", 150).with_min_duration(1))
        .verb(VerbSpec::press_release("down", "down", 150).with_min_duration(1))
        .verb(VerbSpec::press_release("jump", "space", 200).with_min_duration(1))
        .verb(VerbSpec::press_release("action", "z", 100).with_min_duration(1))
        .verb(VerbSpec::toggle("pause", "p"))
        .alias("l", "left")
        .alias("r", "right")
        .alias("u", "up")
        .alias("d", "down")
        .alias("j", "jump")
        .build()
}

/// Defaults applied to every verb of a custom profile unless overridden.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerbDefaults {
    /// Duration used when a verb omits one.
    pub duration_ms: u32,
    /// Minimum duration.
    pub min_duration_ms: u32,
    /// Ceiling on `delay + duration`.
    pub max_total_ms: u32,
}

impl Default for VerbDefaults {
    fn default() -> Self {
        Self {
            duration_ms: 50,
            min_duration_ms: 1,
            max_total_ms: DEFAULT_MAX_TOTAL_MS,
        }
    }
}

/// One verb entry of a custom profile document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerbEntry {
    /// Canonical verb name.
    pub name: String,
    /// Key the verb drives.
    pub key: String,
    /// Default duration override.
    #[serde(default)]
    pub duration_ms: Option<u32>,
    /// Minimum duration override.
    #[serde(default)]
    pub min_duration_ms: Option<u32>,
    /// Ceiling override.
    #[serde(default)]
    pub max_total_ms: Option<u32>,
    /// Press/release (default) or toggle.
    #[serde(default)]
    pub kind: InputKind,
    /// Alternative names.
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Weight for random injection.
    #[serde(default)]
    pub random_weight: Option<u32>,
}

/// Custom verb profile as declared in TOML.
///
/// ```toml
/// profile = "platformer"
/// [defaults]
/// duration_ms = 120
/// [[verbs]]
/// name = "jump"
/// key = "space"
/// aliases = ["j", "hop"]
/// random_weight = 2
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerbTableDocument {
    /// Profile name.
    pub profile: String,
    /// Shared defaults.
    #[serde(default)]
    pub defaults: VerbDefaults,
    /// Verb entries.
    #[serde(default)]
    pub verbs: Vec<VerbEntry>,
}

impl VerbTableDocument {
    /// Reads a document from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read verb profile {}", path.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("failed to parse verb profile {}", path.display()))
    }

    /// Converts the document into a validated table.
    pub fn into_table(self) -> Result<VerbTable, ConfigurationError> {
        let defaults = self.defaults;
        let mut builder = VerbTable::builder(self.profile);
        for entry in self.verbs {
            let mut spec = match entry.kind {
                InputKind::Toggle => VerbSpec::toggle(&entry.name, &entry.key),
                InputKind::PressRelease => VerbSpec::press_release(
                    &entry.name,
                    &entry.key,
                    entry.duration_ms.unwrap_or(defaults.duration_ms),
                ),
            };
            spec.min_duration_ms = entry.min_duration_ms.unwrap_or(defaults.min_duration_ms);
            spec.max_total_ms = entry.max_total_ms.unwrap_or(defaults.max_total_ms);
            builder = builder.verb(spec);
            for alias in &entry.aliases {
                builder = builder.alias(alias, &entry.name);
            }
            if let Some(weight) = entry.random_weight {
                builder = builder.random_weight(&entry.name, weight);
            }
        }
        builder.build()
    }
}
