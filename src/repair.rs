//! Boot-time health of the encrypted system and automatic repair of the
//! platform protected key slots.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use tracing::{info, warn};

use crate::error::FdeError;
use crate::fdestate::SystemState;
use crate::interfaces::sealing::{ProvisionMode, ResealOptions, ResealRequest};
use crate::manager::FdeManager;
use crate::Result;

/// State key of the repair attempt made during the current boot.
pub const REPAIR_STATE_KEY: &str = "fde-repair-state";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RepairResult {
    NotAttempted,
    FailedPlatformInit,
    FailedKeyslots,
    FailedEncryptionSupport,
    Success,
}

impl fmt::Display for RepairResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RepairResult::NotAttempted => "not-attempted",
            RepairResult::FailedPlatformInit => "failed-platform-init",
            RepairResult::FailedKeyslots => "failed-keyslots",
            RepairResult::FailedEncryptionSupport => "failed-encryption-support",
            RepairResult::Success => "success",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct RepairAttempt {
    #[serde(rename = "boot-id")]
    boot_id: String,
    result: RepairResult,
}

impl FdeManager {
    /// How the encrypted partitions were unlocked during this boot.
    pub fn system_state(&self) -> Result<SystemState> {
        Ok(self
            .activation_record()?
            .map(|record| record.system_state())
            .unwrap_or(SystemState::Indeterminate))
    }

    fn boot_id(&self) -> Result<String> {
        let path = &self.config().boot_id_file;
        let raw = fs::read_to_string(path)
            .map_err(|e| FdeError::Io(format!("cannot read boot id from {}: {e}", path.display())))?;
        Ok(raw.trim().to_string())
    }

    /// Repairs the platform key slots when the boot needed a fallback to
    /// unlock. Runs at most once per boot; later calls return the result
    /// of the first attempt.
    pub fn attempt_auto_repair_if_needed(&self) -> Result<RepairResult> {
        let boot_id = self.boot_id()?;
        // concurrent callers wait for the attempt in progress and get its result
        let _attempt = self.repair_lock();
        {
            let st = self.state().lock();
            if let Some(attempt) = st.get::<RepairAttempt>(REPAIR_STATE_KEY)? {
                if attempt.boot_id == boot_id {
                    return Ok(attempt.result);
                }
            }
        }

        let result = self.repair()?;
        info!(%result, "automatic FDE repair finished");

        let mut st = self.state().lock();
        st.set(REPAIR_STATE_KEY, &RepairAttempt { boot_id, result })?;
        Ok(result)
    }

    fn repair(&self) -> Result<RepairResult> {
        let Some(method) = self.sealed_keys_method()? else {
            return Ok(RepairResult::NotAttempted);
        };
        let Some(record) = self.activation_record()? else {
            return Ok(RepairResult::NotAttempted);
        };
        if !self.backend().should_attempt_repair(&record) {
            return Ok(RepairResult::NotAttempted);
        }

        if let Err(err) = self
            .backend()
            .provision_platform(ProvisionMode::WithoutLockout, &self.config().lockout_auth_file)
        {
            warn!("cannot initialize the platform for repair: {err}");
            return Ok(RepairResult::FailedPlatformInit);
        }

        let boot_chains = match self.boot().boot_chains(method) {
            Ok(chains) => chains,
            Err(err) => {
                warn!("cannot compute boot chains for repair: {err}");
                return Ok(RepairResult::FailedKeyslots);
            }
        };
        let request = ResealRequest {
            method,
            boot_chains,
            options: ResealOptions {
                force: true,
                expect_reseal: true,
                ..Default::default()
            },
            signature_db_update: None,
        };
        let (st, result) = self.reseal(self.state().lock(), &request);
        drop(st);
        if let Err(err) = result {
            warn!("cannot reseal key slots for repair: {err}");
            return Ok(RepairResult::FailedKeyslots);
        }

        if let Err(err) = self.backend().check_encryption_support() {
            warn!("encryption is not supported after repair: {err}");
            return Ok(RepairResult::FailedEncryptionSupport);
        }
        Ok(RepairResult::Success)
    }
}
