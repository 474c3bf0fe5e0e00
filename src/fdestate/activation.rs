use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::FdeError;
use crate::Result;

/// Unlock outcome of one partition as recorded at boot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionState {
    #[serde(rename = "mount-state")]
    pub mount_state: String,
    #[serde(rename = "mount-location")]
    pub mount_location: String,
    pub device: String,
    /// "unlocked" or "error-unlocking"; empty for unencrypted partitions.
    #[serde(rename = "unlock-state")]
    pub unlock_state: String,
    /// "run", "fallback" or "recovery".
    #[serde(rename = "unlock-key")]
    pub unlock_key: String,
}

impl PartitionState {
    fn encrypted(&self) -> bool {
        !self.unlock_state.is_empty()
    }

    fn unlocked_with_recovery_key(&self) -> bool {
        self.unlock_state == "unlocked" && self.unlock_key == "recovery"
    }

    fn degraded(&self) -> bool {
        self.unlock_state != "unlocked" || self.unlock_key != "run"
    }
}

/// Boot-time record of how the encrypted partitions were activated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivationRecord {
    #[serde(rename = "ubuntu-data", skip_serializing_if = "Option::is_none")]
    pub data: Option<PartitionState>,
    #[serde(rename = "ubuntu-save", skip_serializing_if = "Option::is_none")]
    pub save: Option<PartitionState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemState {
    Indeterminate,
    Active,
    Inactive,
    Recovery,
    Degraded,
}

impl ActivationRecord {
    /// Reads the record, `None` when the boot left none behind.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let raw = match fs::read(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(FdeError::Io(format!(
                    "cannot read {}: {err}",
                    path.display()
                )))
            }
        };
        let record = serde_json::from_slice(&raw).map_err(|e| {
            FdeError::Serialization(format!("cannot parse {}: {e}", path.display()))
        })?;
        Ok(Some(record))
    }

    fn partitions(&self) -> impl Iterator<Item = &PartitionState> {
        self.data.iter().chain(self.save.iter())
    }

    pub fn unlocked_with_recovery_key(&self) -> bool {
        self.partitions().any(PartitionState::unlocked_with_recovery_key)
    }

    pub fn system_state(&self) -> SystemState {
        let encrypted: Vec<&PartitionState> =
            self.partitions().filter(|p| p.encrypted()).collect();
        if encrypted.is_empty() {
            SystemState::Inactive
        } else if encrypted.iter().any(|p| p.unlocked_with_recovery_key()) {
            SystemState::Recovery
        } else if encrypted.iter().any(|p| p.degraded()) {
            SystemState::Degraded
        } else {
            SystemState::Active
        }
    }
}
