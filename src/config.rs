use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::FdeError;
use crate::runtime_paths::RuntimePaths;
use crate::Result;

/// Runtime settings for the FDE manager. Every field has a default so an
/// empty JSON object is a valid configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct FdeConfig {
    /// System mode the manager runs in, e.g. "run", "recover",
    /// "factory-reset" or "install".
    pub mode: String,
    pub recovery_key_ttl_secs: u64,
    pub recovery_key_max_retries: u32,
    pub max_keyslots_per_container: usize,
    pub data_mount_point: PathBuf,
    pub save_mount_point: PathBuf,
    pub boot_encryption_key_dir: PathBuf,
    pub seed_encryption_key_dir: PathBuf,
    pub sealed_keys_stamp: PathBuf,
    pub activation_state_file: PathBuf,
    pub boot_id_file: PathBuf,
    pub lockout_auth_file: PathBuf,
    pub state_file: Option<PathBuf>,
}

impl Default for FdeConfig {
    fn default() -> Self {
        Self {
            mode: "run".to_string(),
            recovery_key_ttl_secs: 5 * 60,
            recovery_key_max_retries: 10,
            max_keyslots_per_container: 8,
            data_mount_point: PathBuf::from("/run/mnt/data"),
            save_mount_point: PathBuf::from("/var/lib/snapd/save"),
            boot_encryption_key_dir: PathBuf::from("/run/mnt/ubuntu-boot/device/fde"),
            seed_encryption_key_dir: PathBuf::from("/run/mnt/ubuntu-seed/device/fde"),
            sealed_keys_stamp: PathBuf::from("/var/lib/snapd/device/fde/sealed-keys"),
            activation_state_file: PathBuf::from("/run/snapd/snap-bootstrap/unlocked.json"),
            boot_id_file: PathBuf::from("/proc/sys/kernel/random/boot_id"),
            lockout_auth_file: PathBuf::from("/var/lib/snapd/device/fde/tpm-lockout-auth"),
            state_file: None,
        }
    }
}

impl FdeConfig {
    /// Loads the configuration from `path`. A missing file yields the
    /// defaults; a file that does not parse is an error.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(err) => {
                return Err(FdeError::Config(format!(
                    "cannot read {}: {err}",
                    path.to_string_lossy()
                )))
            }
        };
        let config: FdeConfig = serde_json::from_str(&raw).map_err(|e| {
            FdeError::Config(format!("cannot parse {}: {e}", path.to_string_lossy()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Loads the configuration from the default location.
    pub fn load() -> Result<Self> {
        Self::load_from(&RuntimePaths::discover())
    }

    /// Loads `paths.config_file`; an unset state file defaults to
    /// `paths.state_file`.
    pub fn load_from(paths: &RuntimePaths) -> Result<Self> {
        let mut config = Self::from_file(&paths.config_file)?;
        if config.state_file.is_none() {
            config.state_file = Some(paths.state_file.clone());
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.mode.trim().is_empty() {
            return Err(FdeError::Config("mode cannot be empty".to_string()));
        }
        if self.recovery_key_max_retries == 0 {
            return Err(FdeError::Config(
                "recovery_key_max_retries must be at least 1".to_string(),
            ));
        }
        if self.max_keyslots_per_container == 0 {
            return Err(FdeError::Config(
                "max_keyslots_per_container must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn recovery_key_ttl(&self) -> Duration {
        Duration::from_secs(self.recovery_key_ttl_secs)
    }

    /// Paths of the legacy sealed key files that may exist for the data
    /// container, keyed by the key slot they correspond to.
    pub fn data_legacy_key_paths(&self) -> [(&'static str, PathBuf); 2] {
        [
            (
                "default",
                self.boot_encryption_key_dir.join("ubuntu-data.sealed-key"),
            ),
            (
                "default-fallback",
                self.seed_encryption_key_dir.join("ubuntu-data.recovery.sealed-key"),
            ),
        ]
    }

    /// Candidate fallback key files for the save container, in order of
    /// preference.
    pub fn save_legacy_fallback_paths(&self) -> [PathBuf; 2] {
        [
            self.seed_encryption_key_dir
                .join("ubuntu-save.recovery.sealed-key.factory-reset"),
            self.seed_encryption_key_dir.join("ubuntu-save.recovery.sealed-key"),
        ]
    }
}
