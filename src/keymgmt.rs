//! Entry points that validate a key slot request and build the task set that
//! carries it out. Callers embed the returned [`TaskSet`] into a change of
//! their own.

use chrono::Utc;
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::conflicts::{check_fde_change_conflict, check_keyslots_conflict, KEYSLOTS_ATTR};
use crate::error::{FdeError, InvalidRecoveryKeyReason};
use crate::handlers::{
    ADD_PLATFORM_KEYS_KIND, ADD_RECOVERY_KEYS_KIND, AUTH_MODE_ATTR, CHANGE_AUTH_KIND,
    RECOVERY_KEY_ID_ATTR, REMOVE_KEYS_KIND, RENAMES_ATTR, RENAME_KEYS_KIND, ROLES_ATTR,
};
use crate::interfaces::sealing::{AuthMode, VolumesAuthOptions};
use crate::keyslots::{
    validate_refs_for_type, Keyslot, KeyslotRef, KeyslotRefError, KeyslotType, SYSTEM_DATA,
    SYSTEM_SAVE,
};
use crate::manager::{ChangeAuthOptions, FdeManager};
use crate::recovery_keys::is_no_recovery_key;
use crate::state::{StateData, Task, TaskSet};
use crate::Result;

const SUPPORTED_PLATFORM: &str = "tpm2";

fn default_recovery_keyslots() -> Vec<KeyslotRef> {
    vec![
        KeyslotRef::new(SYSTEM_DATA, "default-recovery"),
        KeyslotRef::new(SYSTEM_SAVE, "default-recovery"),
    ]
}

fn default_platform_keyslots() -> Vec<KeyslotRef> {
    vec![
        KeyslotRef::new(SYSTEM_DATA, "default"),
        KeyslotRef::new(SYSTEM_DATA, "default-fallback"),
        KeyslotRef::new(SYSTEM_SAVE, "default-fallback"),
    ]
}

fn or_defaults(refs: &[KeyslotRef], defaults: fn() -> Vec<KeyslotRef>) -> Vec<KeyslotRef> {
    if refs.is_empty() {
        defaults()
    } else {
        refs.to_vec()
    }
}

fn invalid_ref(keyslot_ref: KeyslotRef, reason: KeyslotRefError) -> FdeError {
    FdeError::InvalidKeyslotRef {
        keyslot_ref,
        reason,
    }
}

fn check_type(slot: &Keyslot, expected: KeyslotType) -> Result<()> {
    if slot.kind == expected {
        return Ok(());
    }
    Err(invalid_ref(
        slot.keyslot_ref(),
        KeyslotRefError::UnsupportedType {
            found: slot.kind.as_str().to_string(),
            expected: expected.as_str().to_string(),
        },
    ))
}

impl FdeManager {
    /// Checks that `key_id` names a live recovery key without consuming it.
    fn check_recovery_key_id(&self, key_id: &str) -> Result<()> {
        let entry = match self.recovery_key_cache().key(key_id) {
            Ok(entry) => entry,
            Err(err) if is_no_recovery_key(&err) => {
                return Err(FdeError::InvalidRecoveryKey(InvalidRecoveryKeyReason::NotFound))
            }
            Err(err) => return Err(err),
        };
        if entry.expired(Utc::now()) {
            return Err(FdeError::InvalidRecoveryKey(
                InvalidRecoveryKeyReason::Expired,
            ));
        }
        Ok(())
    }

    fn check_conflicts(&self, st: &StateData, refs: &[KeyslotRef]) -> Result<()> {
        check_fde_change_conflict(st)?;
        check_keyslots_conflict(st, refs)
    }

    /// Fails when adding `adding` would overflow any container. Every
    /// overflowing container is reported.
    fn check_capacity(&self, st: &mut StateData, adding: &[KeyslotRef]) -> Result<()> {
        let (existing, _) = self.get_keyslots(st, &[])?;
        let mut used: BTreeMap<&str, usize> = BTreeMap::new();
        for slot in &existing {
            *used.entry(slot.container_role.as_str()).or_default() += 1;
        }
        for r in adding {
            if !existing.iter().any(|s| &s.keyslot_ref() == r) {
                *used.entry(r.container_role.as_str()).or_default() += 1;
            }
        }
        let max = self.config().max_keyslots_per_container;
        let overflowing: Vec<String> = used
            .into_iter()
            .filter(|(_, count)| *count > max)
            .map(|(role, _)| role.to_string())
            .collect();
        if overflowing.is_empty() {
            Ok(())
        } else {
            Err(FdeError::InsufficientContainerCapacity(overflowing))
        }
    }

    /// Looks up `refs`, failing on missing slots and on slots that are not
    /// of `expected` type.
    fn existing_keyslots(
        &self,
        st: &mut StateData,
        refs: &[KeyslotRef],
        expected: KeyslotType,
    ) -> Result<Vec<Keyslot>> {
        let (slots, missing) = self.get_keyslots(st, refs)?;
        for slot in &slots {
            check_type(slot, expected)?;
        }
        if !missing.is_empty() {
            return Err(FdeError::KeyslotRefsNotFound(missing));
        }
        Ok(slots)
    }

    /// Builds the add, remove and rename tasks that swap `refs` for freshly
    /// created slots under temporary names.
    fn replace_tasks(
        &self,
        st: &mut StateData,
        label: &str,
        add_kind: &str,
        refs: &[KeyslotRef],
        setup_add: impl FnOnce(&mut Task) -> Result<()>,
    ) -> Result<TaskSet> {
        let tmp_refs: Vec<KeyslotRef> = refs.iter().map(KeyslotRef::tmp).collect();

        let add = st.new_task(add_kind, &format!("Add temporary {label} key slots"));
        {
            let task = st
                .task_mut(&add)
                .ok_or_else(|| FdeError::internal("cannot find new task"))?;
            task.set(KEYSLOTS_ATTR, &tmp_refs)?;
            setup_add(task)?;
        }

        let remove = st.new_task(REMOVE_KEYS_KIND, &format!("Remove old {label} key slots"));
        if let Some(task) = st.task_mut(&remove) {
            task.set(KEYSLOTS_ATTR, refs)?;
        }
        st.wait_for(&remove, &add)?;

        let renames: BTreeMap<String, String> = tmp_refs
            .iter()
            .zip(refs)
            .map(|(tmp, r)| (tmp.to_string(), r.name.clone()))
            .collect();
        let rename = st.new_task(
            RENAME_KEYS_KIND,
            &format!("Rename temporary {label} key slots"),
        );
        if let Some(task) = st.task_mut(&rename) {
            task.set(KEYSLOTS_ATTR, &tmp_refs)?;
            task.set(RENAMES_ATTR, &renames)?;
        }
        st.wait_for(&rename, &remove)?;

        Ok(TaskSet::new(vec![add, remove, rename]))
    }

    /// Adds new recovery key slots holding the cached recovery key `key_id`.
    pub fn add_recovery_key(
        &self,
        st: &mut StateData,
        key_id: &str,
        refs: &[KeyslotRef],
    ) -> Result<TaskSet> {
        self.is_functional()?;
        if refs.is_empty() {
            return Err(FdeError::runtime("key slots cannot be empty"));
        }
        self.check_recovery_key_id(key_id)?;
        validate_refs_for_type(refs, KeyslotType::Recovery)?;
        self.check_conflicts(st, refs)?;

        let (existing, _) = self.get_keyslots(st, refs)?;
        if !existing.is_empty() {
            return Err(FdeError::KeyslotsAlreadyExist(
                existing.iter().map(Keyslot::keyslot_ref).collect(),
            ));
        }
        self.check_capacity(st, refs)?;

        let add = st.new_task(ADD_RECOVERY_KEYS_KIND, "Add recovery key slots");
        if let Some(task) = st.task_mut(&add) {
            task.set(KEYSLOTS_ATTR, refs)?;
            task.set(RECOVERY_KEY_ID_ATTR, key_id)?;
        }
        Ok(TaskSet::new(vec![add]))
    }

    /// Replaces recovery key slots with the cached recovery key `key_id`.
    /// Empty `refs` selects the default recovery slots.
    pub fn replace_recovery_key(
        &self,
        st: &mut StateData,
        key_id: &str,
        refs: &[KeyslotRef],
    ) -> Result<TaskSet> {
        self.is_functional()?;
        let refs = or_defaults(refs, default_recovery_keyslots);
        self.check_recovery_key_id(key_id)?;
        validate_refs_for_type(&refs, KeyslotType::Recovery)?;

        let tmp_refs: Vec<KeyslotRef> = refs.iter().map(KeyslotRef::tmp).collect();
        let touched: Vec<KeyslotRef> = refs.iter().chain(&tmp_refs).cloned().collect();
        self.check_conflicts(st, &touched)?;

        self.existing_keyslots(st, &refs, KeyslotType::Recovery)?;
        self.check_capacity(st, &tmp_refs)?;

        self.replace_tasks(st, "recovery", ADD_RECOVERY_KEYS_KIND, &refs, |task| {
            task.set(RECOVERY_KEY_ID_ATTR, key_id)
        })
    }

    /// Replaces platform protected key slots. `volumes_auth` protects the new
    /// slots with a passphrase; the options stay in memory until the change
    /// consumes them. Empty `refs` selects the default platform slots.
    pub fn replace_platform_key(
        &self,
        st: &mut StateData,
        volumes_auth: Option<VolumesAuthOptions>,
        refs: &[KeyslotRef],
    ) -> Result<TaskSet> {
        self.is_functional()?;
        if let Some(options) = &volumes_auth {
            options.validate()?;
        }
        let refs = or_defaults(refs, default_platform_keyslots);
        validate_refs_for_type(&refs, KeyslotType::Platform)?;

        if self.unlocked_with_recovery_key()? {
            return Err(FdeError::runtime(
                "system was unlocked with a recovery key during boot: reboot required",
            ));
        }

        let tmp_refs: Vec<KeyslotRef> = refs.iter().map(KeyslotRef::tmp).collect();
        let touched: Vec<KeyslotRef> = refs.iter().chain(&tmp_refs).cloned().collect();
        self.check_conflicts(st, &touched)?;
        self.check_relevant_snaps_conflict(st)?;

        let (mut slots, missing) = self.get_keyslots(st, &refs)?;
        if !missing.is_empty() {
            return Err(FdeError::KeyslotRefsNotFound(missing));
        }
        let mut roles: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for slot in slots.iter_mut() {
            let r = slot.keyslot_ref();
            check_type(slot, KeyslotType::Platform)?;
            let key_data = slot
                .key_data(self.backend())
                .map_err(|e| FdeError::runtime(format!("cannot read key data for {r}: {e}")))?;
            if key_data.platform_name != SUPPORTED_PLATFORM {
                return Err(invalid_ref(
                    r,
                    KeyslotRefError::UnsupportedPlatform {
                        found: key_data.platform_name.clone(),
                        expected: SUPPORTED_PLATFORM.to_string(),
                    },
                ));
            }
            roles.insert(r.tmp().to_string(), key_data.roles.clone());
        }
        self.check_capacity(st, &tmp_refs)?;

        let auth_mode = volumes_auth
            .as_ref()
            .map(|options| options.mode)
            .unwrap_or_default();
        let label = match auth_mode {
            AuthMode::None => "platform",
            AuthMode::Passphrase => "passphrase",
            AuthMode::Pin => "pin",
        };
        let task_set = self.replace_tasks(st, label, ADD_PLATFORM_KEYS_KIND, &refs, |task| {
            task.set(AUTH_MODE_ATTR, &auth_mode)?;
            task.set(ROLES_ATTR, &roles)
        })?;

        match volumes_auth {
            Some(options) => {
                if self.cache_volumes_auth_options(options) {
                    debug!("replaced stale volumes authentication options");
                }
            }
            None => self.clear_volumes_auth_options(),
        }
        Ok(task_set)
    }

    /// Changes the passphrase of platform key slots. Empty `refs` selects the
    /// default platform slots.
    pub fn change_auth(
        &self,
        st: &mut StateData,
        auth_mode: AuthMode,
        old: &str,
        new: &str,
        refs: &[KeyslotRef],
    ) -> Result<TaskSet> {
        self.is_functional()?;
        if auth_mode != AuthMode::Passphrase {
            return Err(FdeError::internal(format!(
                "unexpected authentication mode {:?}",
                auth_mode.as_str()
            )));
        }
        let refs = or_defaults(refs, default_platform_keyslots);
        validate_refs_for_type(&refs, KeyslotType::Platform)?;
        self.check_conflicts(st, &refs)?;

        let (mut slots, missing) = self.get_keyslots(st, &refs)?;
        if !missing.is_empty() {
            return Err(FdeError::KeyslotRefsNotFound(missing));
        }
        for slot in slots.iter_mut() {
            let r = slot.keyslot_ref();
            check_type(slot, KeyslotType::Platform)?;
            let key_data = slot
                .key_data(self.backend())
                .map_err(|e| FdeError::runtime(format!("cannot read key data for {r}: {e}")))?;
            if key_data.auth_mode != auth_mode {
                return Err(invalid_ref(
                    r,
                    KeyslotRefError::UnsupportedAuthMode {
                        found: key_data.auth_mode.as_str().to_string(),
                        expected: auth_mode.as_str().to_string(),
                    },
                ));
            }
        }

        let change = st.new_task(CHANGE_AUTH_KIND, "Change passphrase protected key slots");
        if let Some(task) = st.task_mut(&change) {
            task.set(KEYSLOTS_ATTR, &refs)?;
            task.set(AUTH_MODE_ATTR, &auth_mode)?;
        }

        if self.cache_change_auth_options(ChangeAuthOptions::new(old, new)) {
            warn!("authentication change options already exists in memory");
        }
        Ok(TaskSet::new(vec![change]))
    }
}
