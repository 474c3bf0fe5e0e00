use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::error::FdeError;
use crate::interfaces::sealing::{KeyData, SealingBackend};
use crate::Result;

pub const SYSTEM_DATA: &str = "system-data";
pub const SYSTEM_SAVE: &str = "system-save";

const TMP_PREFIX: &str = "snapd-tmp:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyslotType {
    Recovery,
    Platform,
}

impl KeyslotType {
    /// Type implied by a slot name: `*-recovery` names hold recovery keys,
    /// everything else is platform protected.
    pub fn for_name(name: &str) -> Self {
        if name.ends_with("-recovery") {
            KeyslotType::Recovery
        } else {
            KeyslotType::Platform
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            KeyslotType::Recovery => "recovery",
            KeyslotType::Platform => "platform",
        }
    }

    fn reserved_names(self) -> &'static [&'static str] {
        match self {
            KeyslotType::Recovery => &["default-recovery"],
            KeyslotType::Platform => &["default", "default-fallback"],
        }
    }
}

impl fmt::Display for KeyslotType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyslotRefError {
    #[error("container role cannot be empty")]
    EmptyContainerRole,
    #[error("name cannot be empty")]
    EmptyName,
    #[error("unsupported container role {0:?}, expected \"system-data\" or \"system-save\"")]
    UnsupportedContainerRole(String),
    #[error("unsupported name, expected {expected}")]
    NamePrefixReservedForSystem { expected: String },
    #[error("unsupported type {found:?}, expected {expected:?}")]
    UnsupportedType { found: String, expected: String },
    #[error("unsupported authentication mode {found:?}, expected {expected:?}")]
    UnsupportedAuthMode { found: String, expected: String },
    #[error("unsupported platform {found:?}, expected {expected:?}")]
    UnsupportedPlatform { found: String, expected: String },
}

/// Value identifier of a key slot on one of the encrypted containers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyslotRef {
    #[serde(rename = "container-role")]
    pub container_role: String,
    pub name: String,
}

impl KeyslotRef {
    pub fn new(container_role: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            container_role: container_role.into(),
            name: name.into(),
        }
    }

    fn invalid(&self, reason: KeyslotRefError) -> FdeError {
        FdeError::InvalidKeyslotRef {
            keyslot_ref: self.clone(),
            reason,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.container_role.is_empty() {
            return Err(self.invalid(KeyslotRefError::EmptyContainerRole));
        }
        if self.name.is_empty() {
            return Err(self.invalid(KeyslotRefError::EmptyName));
        }
        if self.container_role != SYSTEM_DATA && self.container_role != SYSTEM_SAVE {
            return Err(self.invalid(KeyslotRefError::UnsupportedContainerRole(
                self.container_role.clone(),
            )));
        }
        Ok(())
    }

    /// Validates the reference for a slot of `expected` type. Names with
    /// the `default` or `snap` prefixes are reserved for system slots.
    pub fn validate_for_type(&self, expected: KeyslotType) -> Result<()> {
        self.validate()?;
        if !(self.name.starts_with("default") || self.name.starts_with("snap")) {
            return Ok(());
        }
        let allowed = expected.reserved_names();
        if allowed.contains(&self.name.as_str()) {
            return Ok(());
        }
        let expected = allowed
            .iter()
            .map(|name| format!("{name:?}"))
            .collect::<Vec<_>>()
            .join(" or ");
        Err(self.invalid(KeyslotRefError::NamePrefixReservedForSystem { expected }))
    }

    /// Temporary slot used while replacing this one.
    pub fn tmp(&self) -> KeyslotRef {
        KeyslotRef::new(
            self.container_role.clone(),
            format!("{TMP_PREFIX}{}", self.name),
        )
    }
}

impl fmt::Display for KeyslotRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(container-role: {:?}, name: {:?})",
            self.container_role, self.name
        )
    }
}

pub fn validate_refs_for_type(refs: &[KeyslotRef], expected: KeyslotType) -> Result<()> {
    refs.iter().try_for_each(|r| r.validate_for_type(expected))
}

/// Key slot found on an encrypted container.
#[derive(Debug, Clone)]
pub struct Keyslot {
    pub name: String,
    pub kind: KeyslotType,
    pub container_role: String,
    dev_path: String,
    key_data: Option<KeyData>,
}

impl Keyslot {
    pub fn new(
        name: impl Into<String>,
        kind: KeyslotType,
        container_role: impl Into<String>,
        dev_path: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            container_role: container_role.into(),
            dev_path: dev_path.into(),
            key_data: None,
        }
    }

    pub fn keyslot_ref(&self) -> KeyslotRef {
        KeyslotRef::new(self.container_role.clone(), self.name.clone())
    }

    pub fn dev_path(&self) -> &str {
        &self.dev_path
    }

    /// Key data of a platform slot, read from the container on first use.
    pub fn key_data(&mut self, backend: &dyn SealingBackend) -> Result<&KeyData> {
        if self.kind != KeyslotType::Platform {
            return Err(FdeError::internal(format!(
                "key data is only available for platform key slots, found {:?}",
                self.kind.as_str()
            )));
        }
        if self.key_data.is_none() {
            let data = backend.read_key_data(&self.dev_path, &self.name).map_err(|e| {
                FdeError::backend(format!(
                    "cannot read key data for {:?} from {:?}: {e}",
                    self.name, self.dev_path
                ))
            })?;
            self.key_data = Some(data);
        }
        self.key_data
            .as_ref()
            .ok_or_else(|| FdeError::internal("key data vanished after loading"))
    }
}
