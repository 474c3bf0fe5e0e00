use std::fmt;

use thiserror::Error;

use crate::interfaces::disks::DiskError;
use crate::keyslots::{KeyslotRef, KeyslotRefError};
use crate::recovery_keys::RecoveryKeyCacheError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidRecoveryKeyReason {
    NotFound,
    Expired,
}

impl fmt::Display for InvalidRecoveryKeyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => f.write_str("not found"),
            Self::Expired => f.write_str("expired"),
        }
    }
}

/// Reports that a requested operation collides with a change that is still
/// in progress. Only the populated fields are meaningful.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeConflictError {
    pub change_kind: String,
    pub change_id: Option<String>,
    pub snap: Option<String>,
    pub keyslot_ref: Option<KeyslotRef>,
    pub message: String,
}

impl fmt::Display for ChangeConflictError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.message.is_empty() {
            return f.write_str(&self.message);
        }
        if let Some(snap) = &self.snap {
            return write!(f, "snap {snap:?} has {:?} change in progress", self.change_kind);
        }
        if let Some(keyslot_ref) = &self.keyslot_ref {
            return write!(
                f,
                "key slot {keyslot_ref} has {:?} change in progress",
                self.change_kind
            );
        }
        write!(f, "{:?} change in progress", self.change_kind)
    }
}

impl std::error::Error for ChangeConflictError {}

#[derive(Debug, Error)]
pub enum FdeError {
    #[error("invalid key slot reference {keyslot_ref}: {reason}")]
    InvalidKeyslotRef {
        keyslot_ref: KeyslotRef,
        reason: KeyslotRefError,
    },
    #[error("{}", refs_message("key slot reference", "not found", .0))]
    KeyslotRefsNotFound(Vec<KeyslotRef>),
    #[error("{}", refs_message("key slot", "already exists", .0))]
    KeyslotsAlreadyExist(Vec<KeyslotRef>),
    #[error("{}", invalid_recovery_key_message(.0))]
    InvalidRecoveryKey(InvalidRecoveryKeyReason),
    #[error(transparent)]
    ChangeConflict(#[from] ChangeConflictError),
    #[error("insufficient key slot capacity on encrypted containers: {}", .0.join(", "))]
    InsufficientContainerCapacity(Vec<String>),
    #[error(transparent)]
    RecoveryKey(#[from] RecoveryKeyCacheError),
    #[error("cannot add {slot_kind} key slot {keyslot_ref}: {source}")]
    AddKeyslot {
        slot_kind: &'static str,
        keyslot_ref: KeyslotRef,
        source: Box<FdeError>,
    },
    #[error("cannot remove key slot {keyslot_ref}: {source}")]
    RemoveKeyslot {
        keyslot_ref: KeyslotRef,
        source: Box<FdeError>,
    },
    #[error("cannot rename key slot {keyslot_ref} to {new_name:?}: {source}")]
    RenameKeyslot {
        keyslot_ref: KeyslotRef,
        new_name: String,
        source: Box<FdeError>,
    },
    #[error("primary key digest mismatch for {container_role} ({dev_path})")]
    PrimaryKeyMismatch {
        container_role: String,
        dev_path: String,
    },
    #[error("multiple revocation counters found for role {role:?}: {first} and {second}")]
    MultipleRevocationCounters { role: String, first: u32, second: u32 },
    #[error(transparent)]
    Disk(#[from] DiskError),
    #[error("{0}")]
    Backend(String),
    #[error("internal error: {0}")]
    Internal(String),
    #[error("no state entry for key {0:?}")]
    NoState(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("{0}")]
    Runtime(String),
}

impl FdeError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }

    /// True for conflict errors of any category.
    pub fn is_change_conflict(&self) -> bool {
        matches!(self, Self::ChangeConflict(_))
    }

    pub fn as_change_conflict(&self) -> Option<&ChangeConflictError> {
        match self {
            Self::ChangeConflict(err) => Some(err),
            _ => None,
        }
    }

    pub fn is_no_state(&self) -> bool {
        matches!(self, Self::NoState(_))
    }
}

impl From<serde_json::Error> for FdeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

fn invalid_recovery_key_message(reason: &InvalidRecoveryKeyReason) -> String {
    match reason {
        InvalidRecoveryKeyReason::Expired => "recovery key has expired".to_string(),
        other => format!("invalid recovery key: {other}"),
    }
}

fn refs_message(prefix: &str, suffix: &str, refs: &[KeyslotRef]) -> String {
    match refs {
        [single] => format!("{prefix} {single} {suffix}"),
        _ => {
            let rendered: Vec<String> = refs.iter().map(ToString::to_string).collect();
            let suffix = match suffix {
                "already exists" => "already exist",
                other => other,
            };
            format!("{prefix}s [{}] {suffix}", rendered.join(", "))
        }
    }
}
