//! Task handlers of the key slot pipeline. Every handler tolerates being run
//! again after a partial failure: work that is already done is skipped.

use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::conflicts::{is_fde_task, KEYSLOTS_ATTR};
use crate::error::{FdeError, InvalidRecoveryKeyReason};
use crate::fdestate::FdeState;
use crate::interfaces::sealing::{AuthMode, KeyData, ProtectedKeyParams};
use crate::keyslots::{KeyslotRef, KeyslotRefError, KeyslotType};
use crate::manager::{EncryptedContainer, FdeManager};
use crate::recovery_keys::is_no_recovery_key;
use crate::state::{HandlerContext, StateData, Task, TaskRunner};
use crate::Result;

pub const ADD_RECOVERY_KEYS_KIND: &str = "fde-add-recovery-keys";
pub const ADD_PLATFORM_KEYS_KIND: &str = "fde-add-platform-keys";
pub const REMOVE_KEYS_KIND: &str = "fde-remove-keys";
pub const RENAME_KEYS_KIND: &str = "fde-rename-keys";
pub const CHANGE_AUTH_KIND: &str = "fde-change-auth";

pub const RECOVERY_KEY_ID_ATTR: &str = "recovery-key-id";
pub const RENAMES_ATTR: &str = "renames";
pub const AUTH_MODE_ATTR: &str = "auth-mode";
pub const ROLES_ATTR: &str = "roles";

pub(crate) fn register(manager: &Arc<FdeManager>, runner: &TaskRunner) {
    let m = Arc::clone(manager);
    runner.add_handler(
        ADD_RECOVERY_KEYS_KIND,
        move |ctx: &HandlerContext| m.do_add_recovery_keys(ctx),
        None,
    );
    let m = Arc::clone(manager);
    runner.add_handler(
        ADD_PLATFORM_KEYS_KIND,
        move |ctx: &HandlerContext| m.do_add_platform_keys(ctx),
        None,
    );
    let m = Arc::clone(manager);
    runner.add_handler(
        REMOVE_KEYS_KIND,
        move |ctx: &HandlerContext| m.do_remove_keys(ctx),
        None,
    );
    let m = Arc::clone(manager);
    runner.add_handler(
        RENAME_KEYS_KIND,
        move |ctx: &HandlerContext| m.do_rename_keys(ctx),
        None,
    );
    let m = Arc::clone(manager);
    runner.add_handler(
        CHANGE_AUTH_KIND,
        move |ctx: &HandlerContext| m.do_change_auth(ctx),
        None,
    );

    // fde-* tasks run one at a time
    runner.add_blocked(|_st, task, running| {
        is_fde_task(task) && running.iter().any(is_fde_task)
    });
}

/// Copy of the task the handler runs for.
pub(crate) fn current_task(st: &StateData, ctx: &HandlerContext) -> Result<Task> {
    st.task(ctx.task_id())
        .cloned()
        .ok_or_else(|| FdeError::internal(format!("cannot find task {}", ctx.task_id())))
}

fn container_for<'a>(
    containers: &'a [EncryptedContainer],
    keyslot_ref: &KeyslotRef,
) -> Result<&'a EncryptedContainer> {
    containers
        .iter()
        .find(|c| c.container_role == keyslot_ref.container_role)
        .ok_or_else(|| {
            FdeError::runtime(format!(
                "encrypted container role {:?} does not exist",
                keyslot_ref.container_role
            ))
        })
}

impl FdeManager {
    /// Best-effort removal of slots added by a failed attempt.
    fn delete_added(&self, added: &[(String, String)]) {
        for (dev_path, name) in added {
            if let Err(err) = self.backend().delete_key(dev_path, name) {
                warn!(dev_path, slot = %name, "cannot clean up key slot: {err}");
            }
        }
    }

    /// Drops a consumed recovery key. An earlier attempt may have dropped
    /// it already.
    fn forget_recovery_key(&self, key_id: &str) -> Result<()> {
        match self.recovery_key_cache().remove_key(key_id) {
            Err(err) if !is_no_recovery_key(&err) => Err(err),
            _ => Ok(()),
        }
    }

    fn do_add_recovery_keys(&self, ctx: &HandlerContext) -> Result<()> {
        let mut st = ctx.state().lock();
        let task = current_task(&st, ctx)?;
        let refs: Vec<KeyslotRef> = task.require(KEYSLOTS_ATTR)?;
        let key_id: String = task.require(RECOVERY_KEY_ID_ATTR)?;

        let containers = self.get_encrypted_containers(&mut st)?;
        for r in &refs {
            container_for(&containers, r)?;
        }
        let (_, missing) = self.get_keyslots(&mut st, &refs)?;
        if missing.is_empty() {
            debug!(task_id = ctx.task_id(), "all recovery key slots already exist");
            self.forget_recovery_key(&key_id)?;
            return Ok(());
        }

        let cached = self.recovery_key_cache().key(&key_id).map_err(|e| {
            FdeError::runtime(format!("cannot find recovery key with id {key_id:?}: {e}"))
        })?;
        if cached.expired(Utc::now()) {
            return Err(FdeError::InvalidRecoveryKey(InvalidRecoveryKeyReason::Expired));
        }

        let mut added = Vec::with_capacity(missing.len());
        for r in &missing {
            let dev_path = container_for(&containers, r)?.dev_path();
            if let Err(err) = self.backend().add_recovery_key(&dev_path, &r.name, &cached.key) {
                self.delete_added(&added);
                return Err(FdeError::AddKeyslot {
                    slot_kind: "recovery",
                    keyslot_ref: r.clone(),
                    source: Box::new(err),
                });
            }
            added.push((dev_path, r.name.clone()));
        }

        // the key is single use
        self.forget_recovery_key(&key_id)?;
        if let Some(task) = st.task_mut(ctx.task_id()) {
            task.logf(format!("added {} recovery key slots", added.len()));
        }
        info!(count = added.len(), "added recovery key slots");
        Ok(())
    }

    fn do_remove_keys(&self, ctx: &HandlerContext) -> Result<()> {
        let mut st = ctx.state().lock();
        let task = current_task(&st, ctx)?;
        let refs: Vec<KeyslotRef> = task.require(KEYSLOTS_ATTR)?;

        let (slots, missing) = self
            .get_keyslots(&mut st, &refs)
            .map_err(|e| FdeError::runtime(format!("cannot get key slots: {e}")))?;
        if !missing.is_empty() {
            debug!(?missing, "key slots already removed");
        }
        for slot in &slots {
            self.backend()
                .delete_key(slot.dev_path(), &slot.name)
                .map_err(|e| FdeError::RemoveKeyslot {
                    keyslot_ref: slot.keyslot_ref(),
                    source: Box::new(e),
                })?;
        }
        info!(count = slots.len(), "removed key slots");
        Ok(())
    }

    fn do_rename_keys(&self, ctx: &HandlerContext) -> Result<()> {
        let mut st = ctx.state().lock();
        let task = current_task(&st, ctx)?;
        let refs: Vec<KeyslotRef> = task.require(KEYSLOTS_ATTR)?;
        let renames: BTreeMap<String, String> = task.require(RENAMES_ATTR)?;

        let mut plan = Vec::with_capacity(refs.len());
        for r in &refs {
            let new_name = renames.get(&r.to_string()).ok_or_else(|| {
                FdeError::internal(format!("cannot find mapping for {r}"))
            })?;
            plan.push((r, new_name));
        }

        let (slots, _) = self.get_keyslots(&mut st, &[])?;
        for (r, new_name) in plan {
            let target = KeyslotRef::new(r.container_role.clone(), new_name.clone());
            let Some(source) = slots.iter().find(|s| &s.keyslot_ref() == r) else {
                if slots.iter().any(|s| s.keyslot_ref() == target) {
                    debug!(keyslot = %r, "key slot renamed by an earlier attempt");
                    continue;
                }
                return Err(FdeError::KeyslotRefsNotFound(vec![r.clone()]));
            };
            if slots.iter().any(|s| s.keyslot_ref() == target) {
                return Err(FdeError::KeyslotsAlreadyExist(vec![target]));
            }
            self.backend()
                .rename_key(source.dev_path(), &r.name, new_name)
                .map_err(|e| FdeError::RenameKeyslot {
                    keyslot_ref: r.clone(),
                    new_name: new_name.clone(),
                    source: Box::new(e),
                })?;
        }
        Ok(())
    }

    fn do_change_auth(&self, ctx: &HandlerContext) -> Result<()> {
        let mut st = ctx.state().lock();
        let task = current_task(&st, ctx)?;

        let options = self.change_auth_options().ok_or_else(|| {
            FdeError::runtime("cannot find authentication options in memory: unexpected restart")
        })?;
        let auth_mode: AuthMode = task.require(AUTH_MODE_ATTR)?;
        match auth_mode {
            AuthMode::Passphrase => {}
            AuthMode::Pin => {
                return Err(FdeError::internal("changing PINs is not implemented"));
            }
            AuthMode::None => {
                return Err(FdeError::internal(format!(
                    "unexpected auth-mode {:?}",
                    auth_mode.as_str()
                )));
            }
        }
        let refs: Vec<KeyslotRef> = task.require(KEYSLOTS_ATTR)?;
        let (slots, missing) = self.get_keyslots(&mut st, &refs)?;
        if !missing.is_empty() {
            return Err(FdeError::KeyslotRefsNotFound(missing));
        }

        // slots may have changed since the change was created
        let mut current = Vec::with_capacity(slots.len());
        for slot in &slots {
            let r = slot.keyslot_ref();
            if slot.kind != KeyslotType::Platform {
                return Err(FdeError::InvalidKeyslotRef {
                    keyslot_ref: r,
                    reason: KeyslotRefError::UnsupportedType {
                        found: slot.kind.as_str().to_string(),
                        expected: KeyslotType::Platform.as_str().to_string(),
                    },
                });
            }
            let key_data = self
                .backend()
                .read_key_data(slot.dev_path(), &slot.name)
                .map_err(|e| FdeError::runtime(format!("cannot read key data for {r}: {e}")))?;
            if key_data.auth_mode != auth_mode {
                return Err(FdeError::InvalidKeyslotRef {
                    keyslot_ref: r,
                    reason: KeyslotRefError::UnsupportedAuthMode {
                        found: key_data.auth_mode.as_str().to_string(),
                        expected: auth_mode.as_str().to_string(),
                    },
                });
            }
            current.push((slot, key_data));
        }

        let mut changed: Vec<(String, String, KeyData)> = Vec::with_capacity(slots.len());
        for (slot, original) in current {
            let r = slot.keyslot_ref();
            let dev_path = slot.dev_path();
            let result = (|| {
                let mut key_data = original.clone();
                self.backend()
                    .change_passphrase(&mut key_data, options.old(), options.new_secret())
                    .map_err(|e| {
                        FdeError::runtime(format!("cannot change passphrase for {r}: {e}"))
                    })?;
                self.backend()
                    .write_key_data(dev_path, &slot.name, &key_data)
                    .map_err(|e| {
                        FdeError::runtime(format!("cannot write key data for {r}: {e}"))
                    })?;
                Ok::<_, FdeError>(original)
            })();
            match result {
                Ok(original) => changed.push((dev_path.to_string(), slot.name.clone(), original)),
                Err(err) => {
                    for (dev_path, name, original) in changed.iter().rev() {
                        if let Err(revert_err) =
                            self.backend().write_key_data(dev_path, name, original)
                        {
                            warn!(dev_path, slot = %name, "cannot revert key data: {revert_err}");
                        }
                    }
                    return Err(err);
                }
            }
        }

        self.clear_change_auth_options();
        info!(count = changed.len(), "changed passphrase of key slots");
        Ok(())
    }

    fn do_add_platform_keys(&self, ctx: &HandlerContext) -> Result<()> {
        let mut st = ctx.state().lock();
        let task = current_task(&st, ctx)?;
        let refs: Vec<KeyslotRef> = task.require(KEYSLOTS_ATTR)?;
        let auth_mode: AuthMode = task.get(AUTH_MODE_ATTR)?.unwrap_or_default();
        let roles: BTreeMap<String, Vec<String>> = task.require(ROLES_ATTR)?;

        let containers = self.get_encrypted_containers(&mut st)?;
        for r in &refs {
            container_for(&containers, r)?;
        }
        let (_, missing) = self.get_keyslots(&mut st, &refs)?;
        if missing.is_empty() {
            self.clear_volumes_auth_options();
            return Ok(());
        }

        let volumes_auth = match auth_mode {
            AuthMode::None => None,
            _ => {
                let options = self.volumes_auth_options().ok_or_else(|| {
                    FdeError::runtime(
                        "cannot find authentication options in memory: unexpected restart",
                    )
                })?;
                options.validate().map_err(|e| {
                    FdeError::internal(format!("invalid authentication options: {e}"))
                })?;
                Some(options)
            }
        };

        if self.unlocked_with_recovery_key()? {
            return Err(FdeError::runtime(
                "cannot add protected keys if the system was unlocked with a recovery key during boot",
            ));
        }

        let mut loaded = false;
        let mut added = Vec::with_capacity(missing.len());
        for r in &missing {
            let key_roles = roles.get(&r.to_string()).cloned().unwrap_or_default();
            let [role] = key_roles.as_slice() else {
                self.delete_added(&added);
                return Err(FdeError::internal(format!(
                    "expected one key role, found [{}]",
                    key_roles.join(" ")
                )));
            };

            let mut params = self.get_parameters(&st, role, &r.container_role)?;
            if params.is_none() && !loaded {
                let (guard, result) = self.load_parameters(st);
                st = guard;
                loaded = true;
                if let Err(err) = result {
                    self.delete_added(&added);
                    return Err(err);
                }
                params = self.get_parameters(&st, role, &r.container_role)?;
            }
            let Some(params) = params else {
                self.delete_added(&added);
                return Err(FdeError::internal(format!(
                    "cannot find parameters (key role: {role}, container role: {})",
                    r.container_role
                )));
            };

            let fde = FdeState::require(&st)?;
            let role_info = fde.keyslot_roles.get(role.as_str()).ok_or_else(|| {
                FdeError::runtime(format!("cannot find keyslot role {role}"))
            })?;
            let dev_path = container_for(&containers, r)?.dev_path();
            let key_params = ProtectedKeyParams {
                slot_name: &r.name,
                role,
                primary_key_id: role_info.primary_key_id,
                pcr_profile: &params.tpm_pcr_profile,
                pcr_policy_counter_handle: role_info.tpm2_pcr_policy_revocation_counter,
                volumes_auth: volumes_auth.as_ref(),
            };
            if let Err(err) = self.backend().add_protected_key(&dev_path, &key_params) {
                self.delete_added(&added);
                return Err(FdeError::AddKeyslot {
                    slot_kind: "protected",
                    keyslot_ref: r.clone(),
                    source: Box::new(err),
                });
            }
            added.push((dev_path, r.name.clone()));
        }

        self.clear_volumes_auth_options();
        info!(count = added.len(), "added platform protected key slots");
        Ok(())
    }
}
