use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::boot::BootChains;
use crate::fdestate::{ActivationRecord, HashAlg};
use crate::recovery_keys::RecoveryKey;
use crate::Result;

/// How the keys of this system were sealed. Legacy TPM systems leave the
/// marker file empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SealingMethod {
    #[serde(rename = "")]
    LegacyTpm,
    #[serde(rename = "tpm")]
    Tpm,
    #[serde(rename = "fde-setup-hook")]
    FdeSetupHook,
}

impl SealingMethod {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "" => Some(SealingMethod::LegacyTpm),
            "tpm" => Some(SealingMethod::Tpm),
            "fde-setup-hook" => Some(SealingMethod::FdeSetupHook),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    #[default]
    None,
    Passphrase,
    Pin,
}

impl AuthMode {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthMode::None => "none",
            AuthMode::Passphrase => "passphrase",
            AuthMode::Pin => "pin",
        }
    }
}

impl fmt::Display for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata of a platform protected key slot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyData {
    #[serde(rename = "platform-name")]
    pub platform_name: String,
    #[serde(rename = "auth-mode")]
    pub auth_mode: AuthMode,
    pub roles: Vec<String>,
    /// Sealed object, opaque to the manager.
    #[serde(default)]
    pub sealed: Vec<u8>,
}

/// Authentication to put on newly created protected key slots.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct VolumesAuthOptions {
    #[zeroize(skip)]
    pub mode: AuthMode,
    #[serde(default)]
    pub passphrase: String,
}

impl VolumesAuthOptions {
    pub fn passphrase(passphrase: impl Into<String>) -> Self {
        Self {
            mode: AuthMode::Passphrase,
            passphrase: passphrase.into(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self.mode {
            AuthMode::Passphrase if self.passphrase.is_empty() => {
                Err(crate::FdeError::runtime("passphrase cannot be empty"))
            }
            AuthMode::Passphrase => Ok(()),
            AuthMode::Pin => Err(crate::FdeError::runtime(
                "\"pin\" authentication mode is not implemented",
            )),
            AuthMode::None => Err(crate::FdeError::runtime(format!(
                "invalid authentication mode {:?}, only \"passphrase\" and \"pin\" modes are supported",
                self.mode.as_str()
            ))),
        }
    }
}

impl fmt::Debug for VolumesAuthOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VolumesAuthOptions")
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelForSealing {
    pub series: String,
    #[serde(rename = "brand-id")]
    pub brand_id: String,
    pub model: String,
    #[serde(default)]
    pub classic: bool,
    pub grade: String,
    #[serde(rename = "sign-key-id")]
    pub sign_key_id: String,
}

/// Inputs last used to compute the sealing policy of a role and container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealingParameters {
    #[serde(rename = "boot-modes", default)]
    pub boot_modes: Vec<String>,
    #[serde(default)]
    pub models: Vec<ModelForSealing>,
    #[serde(
        rename = "tpm2-pcr-profile",
        default,
        with = "crate::fdestate::base64_bytes"
    )]
    pub tpm_pcr_profile: Vec<u8>,
}

/// Re-acquires the state lock when dropped.
pub struct Relock<'a> {
    relock: Option<Box<dyn FnOnce() + 'a>>,
}

impl<'a> Relock<'a> {
    pub fn new(relock: impl FnOnce() + 'a) -> Self {
        Self {
            relock: Some(Box::new(relock)),
        }
    }

    /// For callers that never held the lock.
    pub fn noop() -> Self {
        Self { relock: None }
    }
}

impl Drop for Relock<'_> {
    fn drop(&mut self) {
        if let Some(relock) = self.relock.take() {
            relock();
        }
    }
}

/// View of the persistent sealing parameters handed to the backend during a
/// reseal.
///
/// The backend calls `get` and `update` with the state lock held. Around
/// slow platform work it may call `unlock`; while the returned [`Relock`] is
/// alive the lock is released and `get`/`update` take it briefly for each
/// call.
pub trait FdeStateManager {
    fn get(&self, role: &str, container_role: &str) -> Result<Option<SealingParameters>>;
    fn update(&self, role: &str, container_role: &str, params: &SealingParameters) -> Result<()>;
    fn unlock(&self) -> Relock<'_>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResealOptions {
    /// Reseal even when the stored parameters already match.
    pub force: bool,
    pub revoke_old_keys: bool,
    /// A reseal is expected to happen; skipping it is an error.
    pub expect_reseal: bool,
}

#[derive(Debug, Clone)]
pub struct ResealRequest {
    pub method: SealingMethod,
    pub boot_chains: BootChains,
    pub options: ResealOptions,
    /// Pending EFI signature database update to include in the policy.
    pub signature_db_update: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionMode {
    Full,
    WithoutLockout,
}

/// Parameters for a new platform protected key slot.
#[derive(Debug, Clone)]
pub struct ProtectedKeyParams<'a> {
    pub slot_name: &'a str,
    pub role: &'a str,
    pub primary_key_id: u32,
    pub pcr_profile: &'a [u8],
    pub pcr_policy_counter_handle: u32,
    pub volumes_auth: Option<&'a VolumesAuthOptions>,
}

/// Platform sealing engine and per-container key slot API. Device paths
/// identify the encrypted container.
pub trait SealingBackend: Send + Sync {
    fn provision_platform(&self, mode: ProvisionMode, lockout_auth_file: &Path) -> Result<()>;
    fn check_encryption_support(&self) -> Result<()>;
    fn should_attempt_repair(&self, activation: &ActivationRecord) -> bool;

    fn reseal(&self, manager: &dyn FdeStateManager, request: &ResealRequest) -> Result<()>;
    /// Computes the sealing parameters for `boot_chains` and stores them
    /// through `manager` without touching any key slot.
    fn load_parameters(
        &self,
        manager: &dyn FdeStateManager,
        method: SealingMethod,
        boot_chains: &BootChains,
    ) -> Result<()>;

    /// `Ok(None)` when the platform keyring holds no primary key for the
    /// device.
    fn primary_key_digest(&self, dev_path: &str, alg: HashAlg) -> Result<Option<(Vec<u8>, Vec<u8>)>>;
    fn verify_primary_key_digest(
        &self,
        dev_path: &str,
        alg: HashAlg,
        salt: &[u8],
        digest: &[u8],
    ) -> Result<bool>;
    fn policy_revocation_handle(
        &self,
        dev_path: &str,
        slot_name: &str,
        legacy_key_file: Option<&Path>,
        hint_expect_fde_hook: bool,
    ) -> Result<u32>;

    fn list_recovery_key_names(&self, dev_path: &str) -> Result<Vec<String>>;
    fn list_unlock_key_names(&self, dev_path: &str) -> Result<Vec<String>>;
    fn add_recovery_key(&self, dev_path: &str, slot_name: &str, key: &RecoveryKey) -> Result<()>;
    fn add_protected_key(&self, dev_path: &str, params: &ProtectedKeyParams<'_>) -> Result<()>;
    fn delete_key(&self, dev_path: &str, slot_name: &str) -> Result<()>;
    fn rename_key(&self, dev_path: &str, old_name: &str, new_name: &str) -> Result<()>;
    fn check_recovery_key(&self, dev_path: &str, key: &RecoveryKey) -> Result<()>;

    fn read_key_data(&self, dev_path: &str, slot_name: &str) -> Result<KeyData>;
    fn write_key_data(&self, dev_path: &str, slot_name: &str, key_data: &KeyData) -> Result<()>;
    fn change_passphrase(&self, key_data: &mut KeyData, old: &str, new: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn sealing_method_parses_marker_content() {
        assert_eq!(SealingMethod::parse(""), Some(SealingMethod::LegacyTpm));
        assert_eq!(SealingMethod::parse("tpm\n"), Some(SealingMethod::Tpm));
        assert_eq!(
            SealingMethod::parse("fde-setup-hook"),
            Some(SealingMethod::FdeSetupHook)
        );
        assert_eq!(SealingMethod::parse("other"), None);
        assert_eq!(serde_json::to_string(&SealingMethod::Tpm).unwrap(), r#""tpm""#);
    }

    #[test]
    fn relock_runs_once_on_drop() {
        let calls = Cell::new(0);
        {
            let _relock = Relock::new(|| calls.set(calls.get() + 1));
        }
        assert_eq!(calls.get(), 1);
        drop(Relock::noop());
    }

    #[test]
    fn volumes_auth_validation() {
        assert!(VolumesAuthOptions::passphrase("secret").validate().is_ok());
        let pin = VolumesAuthOptions {
            mode: AuthMode::Pin,
            passphrase: String::new(),
        };
        assert_eq!(
            pin.validate().unwrap_err().to_string(),
            r#""pin" authentication mode is not implemented"#
        );
        assert!(!format!("{:?}", VolumesAuthOptions::passphrase("secret")).contains("secret"));
    }

    #[test]
    fn parameters_use_wire_names() {
        let params = SealingParameters {
            boot_modes: vec!["run".to_string()],
            models: vec![],
            tpm_pcr_profile: b"profile".to_vec(),
        };
        let json = serde_json::to_value(&params).unwrap();
        assert_eq!(json["boot-modes"][0], "run");
        assert_eq!(json["tpm2-pcr-profile"], "cHJvZmlsZQ==");
        let back: SealingParameters = serde_json::from_value(json).unwrap();
        assert_eq!(back, params);
    }
}
