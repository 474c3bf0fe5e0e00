mod activation;
mod external;

pub use activation::{ActivationRecord, PartitionState, SystemState};
pub use external::{
    add_external_operation, find_first_external_operation_by_change_id,
    find_first_pending_external_operation_by_kind, remove_external_operation_by_change_id,
    update_external_operation, ExternalOperation,
};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::debug;

use crate::error::FdeError;
use crate::interfaces::sealing::{ModelForSealing, SealingMethod, SealingParameters};
use crate::state::StateData;
use crate::Result;

/// State key the FDE record is stored under.
pub const FDE_STATE_KEY: &str = "fde";

pub const ROLE_RUN: &str = "run";
pub const ROLE_RUN_RECOVER: &str = "run+recover";
pub const ROLE_RECOVER: &str = "recover";

/// Container key for parameters shared by every container of a role.
pub const ALL_CONTAINERS: &str = "all";

/// Serde adapter storing byte vectors as standard base64 strings.
pub mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
        STANDARD.decode(raw).map_err(serde::de::Error::custom)
    }
}

/// Digest algorithms accepted for primary key digests. Unknown names are
/// rejected on decode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlg {
    Sha1,
    #[default]
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlg {
    pub fn as_str(self) -> &'static str {
        match self {
            HashAlg::Sha1 => "sha1",
            HashAlg::Sha256 => "sha256",
            HashAlg::Sha384 => "sha384",
            HashAlg::Sha512 => "sha512",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyDigest {
    pub algorithm: HashAlg,
    #[serde(with = "base64_bytes")]
    pub salt: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub digest: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryKeyInfo {
    pub digest: KeyDigest,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyslotRoleInfo {
    #[serde(rename = "primary-key-id")]
    pub primary_key_id: u32,
    /// Zero when unset.
    #[serde(rename = "tpm2-pcr-policy-revocation-counter", default)]
    pub tpm2_pcr_policy_revocation_counter: u32,
    /// Parameters keyed by container role, or by [`ALL_CONTAINERS`].
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, SealingParameters>,
}

/// Persistent FDE record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FdeState {
    /// Primary key 0 is managed by the system. Legacy systems have none.
    #[serde(rename = "primary-keys", default)]
    pub primary_keys: BTreeMap<u32, PrimaryKeyInfo>,
    #[serde(rename = "keyslot-roles", default)]
    pub keyslot_roles: BTreeMap<String, KeyslotRoleInfo>,
    #[serde(rename = "pending-external-operations", default)]
    pub pending_external_operations: Vec<ExternalOperation>,
}

impl FdeState {
    /// Fresh record with the three well-known roles bound to primary key 0.
    pub fn with_default_roles() -> Self {
        let keyslot_roles = [ROLE_RUN, ROLE_RUN_RECOVER, ROLE_RECOVER]
            .into_iter()
            .map(|role| (role.to_string(), KeyslotRoleInfo::default()))
            .collect();
        Self {
            keyslot_roles,
            ..Self::default()
        }
    }

    pub fn load(st: &StateData) -> Result<Option<Self>> {
        st.get(FDE_STATE_KEY)
    }

    /// Like [`FdeState::load`] but a missing record is an error.
    pub fn require(st: &StateData) -> Result<Self> {
        Self::load(st)?.ok_or_else(|| FdeError::NoState(FDE_STATE_KEY.to_string()))
    }

    pub fn store(&self, st: &mut StateData) -> Result<()> {
        st.set(FDE_STATE_KEY, self)
    }

    /// Parameters for `role` on `container_role`, falling back to the
    /// parameters shared by all containers.
    pub fn get_parameters(
        &self,
        role: &str,
        container_role: &str,
    ) -> Result<Option<&SealingParameters>> {
        let info = self
            .keyslot_roles
            .get(role)
            .ok_or_else(|| FdeError::runtime(format!("cannot find keyslot role {role}")))?;
        Ok(info
            .parameters
            .get(container_role)
            .or_else(|| info.parameters.get(ALL_CONTAINERS)))
    }

    pub fn update_parameters(
        &mut self,
        role: &str,
        container_role: &str,
        boot_modes: Vec<String>,
        models: Vec<ModelForSealing>,
        tpm_pcr_profile: Vec<u8>,
    ) -> Result<()> {
        let info = self.keyslot_roles.get_mut(role).ok_or_else(|| {
            FdeError::runtime(format!("cannot find keyslot role {role}"))
        })?;
        info.parameters.insert(
            container_role.to_string(),
            SealingParameters {
                boot_modes,
                models,
                tpm_pcr_profile,
            },
        );
        Ok(())
    }
}

/// Loads the FDE record, lets `f` mutate it and stores it back when `f`
/// succeeds.
pub fn with_fde_state<R>(
    st: &mut StateData,
    f: impl FnOnce(&mut FdeState) -> Result<R>,
) -> Result<R> {
    let mut fde = FdeState::require(st)?;
    let out = f(&mut fde)?;
    fde.store(st)?;
    Ok(out)
}

pub fn update_parameters(
    st: &mut StateData,
    role: &str,
    container_role: &str,
    params: &SealingParameters,
) -> Result<()> {
    with_fde_state(st, |fde| {
        fde.update_parameters(
            role,
            container_role,
            params.boot_modes.clone(),
            params.models.clone(),
            params.tpm_pcr_profile.clone(),
        )
    })
}

/// Sealing method recorded in the sealed keys marker, `None` when the
/// system has no sealed keys.
pub fn sealed_keys_method(stamp: &Path) -> Result<Option<SealingMethod>> {
    let raw = match fs::read_to_string(stamp) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            debug!(stamp = %stamp.display(), "no sealed keys marker");
            return Ok(None);
        }
        Err(err) => {
            return Err(FdeError::Io(format!(
                "cannot read {}: {err}",
                stamp.display()
            )))
        }
    };
    SealingMethod::parse(&raw).map(Some).ok_or_else(|| {
        FdeError::runtime(format!("unknown key sealing method: {:?}", raw.trim()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameters_fall_back_to_all_containers() {
        let mut fde = FdeState::with_default_roles();
        fde.update_parameters(ROLE_RUN, ALL_CONTAINERS, vec!["run".into()], vec![], b"p".to_vec())
            .unwrap();
        fde.update_parameters(ROLE_RUN, "system-save", vec!["recover".into()], vec![], vec![])
            .unwrap();

        let data = fde.get_parameters(ROLE_RUN, "system-data").unwrap().unwrap();
        assert_eq!(data.boot_modes, vec!["run"]);
        let save = fde.get_parameters(ROLE_RUN, "system-save").unwrap().unwrap();
        assert_eq!(save.boot_modes, vec!["recover"]);
        assert!(fde.get_parameters(ROLE_RECOVER, "system-data").unwrap().is_none());
        assert!(fde.get_parameters("other", "system-data").is_err());
    }

    #[test]
    fn unknown_hash_algorithm_is_rejected() {
        let ok: KeyDigest =
            serde_json::from_str(r#"{"algorithm":"sha256","salt":"c2FsdA==","digest":"ZA=="}"#)
                .unwrap();
        assert_eq!(ok.salt, b"salt");
        assert!(serde_json::from_str::<KeyDigest>(
            r#"{"algorithm":"md5","salt":"","digest":""}"#
        )
        .is_err());
    }

    #[test]
    fn with_fde_state_requires_record() {
        let mut st = StateData::default();
        let err = with_fde_state(&mut st, |_| Ok(())).unwrap_err();
        assert!(err.is_no_state());

        FdeState::with_default_roles().store(&mut st).unwrap();
        with_fde_state(&mut st, |fde| {
            fde.primary_keys.insert(0, PrimaryKeyInfo::default());
            Ok(())
        })
        .unwrap();
        let stored = FdeState::require(&st).unwrap();
        assert!(stored.primary_keys.contains_key(&0));
        let json = serde_json::to_value(&stored).unwrap();
        assert!(json["keyslot-roles"]["run+recover"].is_object());
    }

    #[test]
    fn sealed_keys_marker() {
        let temp = tempfile::tempdir().unwrap();
        let stamp = temp.path().join("sealed-keys");
        assert_eq!(sealed_keys_method(&stamp).unwrap(), None);
        fs::write(&stamp, "tpm").unwrap();
        assert_eq!(sealed_keys_method(&stamp).unwrap(), Some(SealingMethod::Tpm));
        fs::write(&stamp, "").unwrap();
        assert_eq!(
            sealed_keys_method(&stamp).unwrap(),
            Some(SealingMethod::LegacyTpm)
        );
        fs::write(&stamp, "bogus").unwrap();
        assert!(sealed_keys_method(&stamp).is_err());
    }
}
