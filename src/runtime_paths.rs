//! Default locations of the manager's configuration and state checkpoint.

use directories::{BaseDirs, ProjectDirs};
use std::path::{Path, PathBuf};

const APP_NAME: &str = "fde-manager";
const CONFIG_FILE: &str = "config.json";
const STATE_FILE: &str = "state.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimePaths {
    pub config_file: PathBuf,
    pub state_file: PathBuf,
}

impl RuntimePaths {
    /// Both files directly below `root`.
    pub fn under(root: &Path) -> Self {
        Self {
            config_file: root.join(CONFIG_FILE),
            state_file: root.join(STATE_FILE),
        }
    }

    /// Configuration in the platform config directory and state in the data
    /// directory. Without a home directory both land below the local data or
    /// temporary directory.
    pub fn discover() -> Self {
        if let Some(root) = root_override() {
            return Self::under(&root);
        }
        if let Some(dirs) = ProjectDirs::from("", "", APP_NAME) {
            return Self {
                config_file: dirs.config_dir().join(CONFIG_FILE),
                state_file: dirs.data_dir().join(STATE_FILE),
            };
        }
        let root = BaseDirs::new()
            .map(|base| base.data_local_dir().join(APP_NAME))
            .unwrap_or_else(|| std::env::temp_dir().join(APP_NAME));
        Self::under(&root)
    }
}

#[cfg(test)]
static ROOT_OVERRIDE: std::sync::RwLock<Option<PathBuf>> = std::sync::RwLock::new(None);

#[cfg(test)]
pub(crate) fn set_root_override(root: Option<PathBuf>) {
    match ROOT_OVERRIDE.write() {
        Ok(mut guard) => *guard = root,
        Err(poisoned) => *poisoned.into_inner() = root,
    }
}

#[cfg(test)]
fn root_override() -> Option<PathBuf> {
    match ROOT_OVERRIDE.read() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

#[cfg(not(test))]
fn root_override() -> Option<PathBuf> {
    None
}
