//! Settings persistence.
//!
//! Saves and loads user preferences to/from a JSON file in the platform
//! config directory. The certificate pair lives in the same directory.

use std::path::PathBuf;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const SETTINGS_FILE: &str = "settings.json";
const APP_DIR: &str = "deceive";

/// User preferences, all optional on disk via serde defaults so old files
/// keep loading as fields are added.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Game launched when none is named on the command line.
    #[serde(default = "default_game")]
    pub default_game: String,
    /// Initial appearance: "offline", "mobile" or "online".
    #[serde(default = "default_status")]
    pub default_status: String,
    /// Last version the user was shown an update prompt for.
    #[serde(default)]
    pub last_prompted_version: String,
    /// Forward lobby (MUC) presence verbatim regardless of mode, so custom
    /// games and lobbies keep working while hidden.
    #[serde(default = "default_true")]
    pub connect_to_muc: bool,
}

fn default_game() -> String {
    "prompt".to_string()
}

fn default_status() -> String {
    "offline".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_game: default_game(),
            default_status: default_status(),
            last_prompted_version: String::new(),
            connect_to_muc: default_true(),
        }
    }
}

/// Directory holding the settings file, certificate and key.
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

/// Load settings, falling back to defaults when the file is missing or
/// unreadable. A broken file is never fatal.
pub fn load_settings() -> Settings {
    load_from(&config_dir().join(SETTINGS_FILE))
}

fn load_from(path: &PathBuf) -> Settings {
    match std::fs::read_to_string(path) {
        Ok(raw) => match serde_json::from_str(&raw) {
            Ok(settings) => {
                debug!(path = %path.display(), "loaded settings");
                settings
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "settings file unparseable, using defaults");
                Settings::default()
            }
        },
        Err(_) => {
            debug!(path = %path.display(), "no settings file, using defaults");
            Settings::default()
        }
    }
}

/// Persist settings. Best effort; the proxy works fine without them.
pub fn save_settings(settings: &Settings) -> anyhow::Result<()> {
    let dir = config_dir();
    std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
    let path = dir.join(SETTINGS_FILE);
    let raw = serde_json::to_string_pretty(settings).context("serializing settings")?;
    std::fs::write(&path, raw).with_context(|| format!("writing {}", path.display()))?;
    debug!(path = %path.display(), "saved settings");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.default_game, "prompt");
        assert_eq!(settings.default_status, "offline");
        assert!(settings.connect_to_muc);
        assert!(settings.last_prompted_version.is_empty());
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_from(&dir.path().join("nope.json"));
        assert_eq!(settings.default_status, "offline");
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE);
        std::fs::write(&path, r#"{"default_status": "mobile"}"#).unwrap();
        let settings = load_from(&path);
        assert_eq!(settings.default_status, "mobile");
        assert_eq!(settings.default_game, "prompt");
        assert!(settings.connect_to_muc);
    }

    #[test]
    fn test_broken_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE);
        std::fs::write(&path, "{not json").unwrap();
        let settings = load_from(&path);
        assert_eq!(settings.default_status, "offline");
    }

    #[test]
    fn test_roundtrip() {
        let settings = Settings {
            default_game: "lol".to_string(),
            default_status: "online".to_string(),
            last_prompted_version: "1.2.3".to_string(),
            connect_to_muc: false,
        };
        let raw = serde_json::to_string(&settings).unwrap();
        let back: Settings = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.default_game, "lol");
        assert_eq!(back.default_status, "online");
        assert_eq!(back.last_prompted_version, "1.2.3");
        assert!(!back.connect_to_muc);
    }
}
