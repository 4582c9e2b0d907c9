use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::macros::MacroStep;

/// On-disk macro collection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacroFile {
    /// Collection name, independent of the file name.
    #[serde(default)]
    pub name: String,
    /// Steps keyed by macro name.
    #[serde(default)]
    pub macros: IndexMap<String, Vec<MacroStep>>,
}

/// JSON file holding one team's macros.
#[derive(Debug, Clone)]
pub struct JsonMacroStore {
    path: PathBuf,
}

impl JsonMacroStore {
    /// Store backed by `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// File location.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the file; a missing file is an empty collection.
    pub fn load(&self) -> Result<MacroFile> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "macro file absent, starting empty");
            return Ok(MacroFile::default());
        }
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read macro file {}", self.path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse macro file {}", self.path.display()))
    }

    /// Writes the collection, replacing the file atomically.
    pub fn save(&self, file: &MacroFile) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let staging = self.path.with_extension("json.tmp");
        let body = serde_json::to_string_pretty(file)?;
        fs::write(&staging, body)
            .with_context(|| format!("failed to write {}", staging.display()))?;
        fs::rename(&staging, &self.path)
            .with_context(|| format!("failed to replace macro file {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let store = JsonMacroStore::new(dir.path().join("none.json"));
        assert_eq!(store.load().unwrap(), MacroFile::default());
    }

    #[test]
    fn saves_and_loads_collection() {
        let dir = tempdir().unwrap();
        let store = JsonMacroStore::new(dir.path().join("teams/red.json"));
        let mut file = MacroFile {
            name: "red macros".into(),
            ..MacroFile::default()
        };
        file.macros.insert(
            "hop".into(),
            vec![MacroStep {
                verb: "jump".into(),
                delay_ms: 0,
                duration_ms: 120,
            }],
        );
        store.save(&file).unwrap();
        assert_eq!(store.load().unwrap(), file);
        assert!(!dir.path().join("teams/red.json.tmp").exists());
    }

    #[test]
    fn step_delay_defaults_to_zero() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("m.json");
        fs::write(&path, r#"{"macros":{"x":[{"verb":"up","duration_ms":5}]}}"#).unwrap();
        let file = JsonMacroStore::new(&path).load().unwrap();
        assert_eq!(file.macros["x"][0].delay_ms, 0);
        assert!(file.name.is_empty());
    }

    #[test]
    fn corrupt_file_reports_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, "{").unwrap();
        let err = JsonMacroStore::new(&path).load().unwrap_err();
        assert!(format!("{err:#}").contains("broken.json"));
    }
}
