use std::fs;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Client-side preferences: read once at startup, written best-effort. Not
/// part of the reconciliation protocol; losing this file only loses which
/// channel was selected last.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Preferences {
    pub active_channel: Option<String>,
}

/// Platform config location; `None` when no home directory exists.
pub fn default_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "castaway").map(|dirs| dirs.config_dir().join("prefs.toml"))
}

impl Preferences {
    pub fn load(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(raw) => toml::from_str(&raw).unwrap_or_else(|err| {
                debug!(error = %err, "preferences unreadable, starting fresh");
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    /// Persist preferences. Storage being unavailable is tolerated.
    pub fn store(&self, path: &Path) {
        if let Some(parent) = path.parent() {
            if fs::create_dir_all(parent).is_err() {
                return;
            }
        }
        match toml::to_string(self) {
            Ok(raw) => {
                if let Err(err) = fs::write(path, raw) {
                    debug!(error = %err, "failed to persist preferences");
                }
            }
            Err(err) => debug!(error = %err, "failed to serialize preferences"),
        }
    }
}
