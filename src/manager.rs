use chrono::Utc;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::config::FdeConfig;
use crate::conflicts::{self, check_snaps_conflict, declared_snaps};
use crate::error::{FdeError, InvalidRecoveryKeyReason};
use crate::fdestate::{
    self, sealed_keys_method, ActivationRecord, FdeState, HashAlg, KeyDigest, PrimaryKeyInfo,
    ROLE_RECOVER, ROLE_RUN, ROLE_RUN_RECOVER,
};
use crate::interfaces::boot::BootEnvironment;
use crate::interfaces::disks::{DiskError, DiskResolver};
use crate::interfaces::sealing::{
    FdeStateManager, Relock, ResealRequest, SealingBackend, SealingMethod, SealingParameters,
    VolumesAuthOptions,
};
use crate::interfaces::snaps::SnapActivity;
use crate::keyslots::{Keyslot, KeyslotRef, KeyslotType, SYSTEM_DATA, SYSTEM_SAVE};
use crate::recovery_keys::{
    is_no_recovery_key, CachedRecoveryKey, InMemoryRecoveryKeyCache, RecoveryKey,
    RecoveryKeyCache,
};
use crate::state::runner::TaskRunner;
use crate::state::{State, StateData, StateGuard, Task};
use crate::{handlers, secureboot, Result};

pub type RecoveryKeySource = Arc<dyn Fn() -> Result<RecoveryKey> + Send + Sync>;

/// External services the manager is wired to.
#[derive(Clone)]
pub struct Collaborators {
    pub disks: Arc<dyn DiskResolver>,
    pub backend: Arc<dyn SealingBackend>,
    pub boot: Arc<dyn BootEnvironment>,
    pub snaps: Arc<dyn SnapActivity>,
    pub recovery_key_cache: Arc<dyn RecoveryKeyCache>,
    pub recovery_key_source: RecoveryKeySource,
}

impl Collaborators {
    pub fn new(
        disks: Arc<dyn DiskResolver>,
        backend: Arc<dyn SealingBackend>,
        boot: Arc<dyn BootEnvironment>,
        snaps: Arc<dyn SnapActivity>,
    ) -> Self {
        Self {
            disks,
            backend,
            boot,
            snaps,
            recovery_key_cache: Arc::new(InMemoryRecoveryKeyCache::new()),
            recovery_key_source: Arc::new(RecoveryKey::generate),
        }
    }

    pub fn with_recovery_key_cache(mut self, cache: Arc<dyn RecoveryKeyCache>) -> Self {
        self.recovery_key_cache = cache;
        self
    }

    pub fn with_recovery_key_source<F>(mut self, source: F) -> Self
    where
        F: Fn() -> Result<RecoveryKey> + Send + Sync + 'static,
    {
        self.recovery_key_source = Arc::new(source);
        self
    }
}

/// An encrypted volume found on this device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedContainer {
    pub uuid: String,
    pub container_role: String,
    /// Legacy sealed key files by the key slot they belong to.
    pub legacy_keys: BTreeMap<String, PathBuf>,
}

impl EncryptedContainer {
    pub fn dev_path(&self) -> String {
        format!("/dev/disk/by-uuid/{}", self.uuid)
    }
}

/// Old and new secrets of a pending authentication change.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ChangeAuthOptions {
    old: String,
    new: String,
}

impl ChangeAuthOptions {
    pub fn new(old: impl Into<String>, new: impl Into<String>) -> Self {
        Self {
            old: old.into(),
            new: new.into(),
        }
    }

    pub fn old(&self) -> &str {
        &self.old
    }

    pub fn new_secret(&self) -> &str {
        &self.new
    }
}

impl fmt::Debug for ChangeAuthOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ChangeAuthOptions(<redacted>)")
    }
}

fn guard<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Wake-up channels keyed by change id. Not persisted.
#[derive(Default)]
pub struct SignalRegistry {
    channels: Mutex<HashMap<String, watch::Sender<bool>>>,
}

impl SignalRegistry {
    pub fn register(&self, change_id: &str) -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        guard(&self.channels).insert(change_id.to_string(), tx);
        rx
    }

    /// Fires the channel of `change_id`. Returns false when nobody
    /// registered one.
    pub fn signal(&self, change_id: &str) -> bool {
        match guard(&self.channels).get(change_id) {
            Some(tx) => {
                tx.send_replace(true);
                true
            }
            None => false,
        }
    }

    pub fn forget(&self, change_id: &str) {
        guard(&self.channels).remove(change_id);
    }

    pub fn len(&self) -> usize {
        guard(&self.channels).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Manager of full disk encryption keys and the persistent FDE state.
pub struct FdeManager {
    state: State,
    config: FdeConfig,
    disks: Arc<dyn DiskResolver>,
    backend: Arc<dyn SealingBackend>,
    boot: Arc<dyn BootEnvironment>,
    snaps: Arc<dyn SnapActivity>,
    recovery_keys: Arc<dyn RecoveryKeyCache>,
    recovery_key_source: RecoveryKeySource,
    init_err: Mutex<Option<String>>,
    change_auth_options: Mutex<Option<ChangeAuthOptions>>,
    volumes_auth: Mutex<Option<VolumesAuthOptions>>,
    activation: Mutex<Option<Option<ActivationRecord>>>,
    /// Held for a whole repair attempt.
    repair: Mutex<()>,
    signals: SignalRegistry,
}

impl fmt::Debug for FdeManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FdeManager")
            .field("mode", &self.config.mode)
            .finish_non_exhaustive()
    }
}

impl FdeManager {
    /// Builds the manager and registers its task handlers with `runner`,
    /// which must drive the same state.
    pub fn new(
        state: State,
        runner: &TaskRunner,
        config: FdeConfig,
        collaborators: Collaborators,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        if !runner.state().same_as(&state) {
            return Err(FdeError::internal(
                "task runner is not associated with the manager state",
            ));
        }
        let manager = Arc::new(Self {
            state,
            config,
            disks: collaborators.disks,
            backend: collaborators.backend,
            boot: collaborators.boot,
            snaps: collaborators.snaps,
            recovery_keys: collaborators.recovery_key_cache,
            recovery_key_source: collaborators.recovery_key_source,
            init_err: Mutex::new(None),
            change_auth_options: Mutex::new(None),
            volumes_auth: Mutex::new(None),
            activation: Mutex::new(None),
            repair: Mutex::new(()),
            signals: SignalRegistry::default(),
        });
        handlers::register(&manager, runner);
        secureboot::register(&manager, runner);
        Ok(manager)
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn config(&self) -> &FdeConfig {
        &self.config
    }

    pub(crate) fn backend(&self) -> &dyn SealingBackend {
        self.backend.as_ref()
    }

    pub(crate) fn boot(&self) -> &dyn BootEnvironment {
        self.boot.as_ref()
    }

    pub(crate) fn recovery_key_cache(&self) -> &dyn RecoveryKeyCache {
        self.recovery_keys.as_ref()
    }

    pub(crate) fn repair_lock(&self) -> MutexGuard<'_, ()> {
        guard(&self.repair)
    }

    pub(crate) fn signals(&self) -> &SignalRegistry {
        &self.signals
    }

    /// Initializes the persistent state when running in run mode. Failures
    /// are remembered and reported by later operations instead.
    pub fn startup(&self) -> Result<()> {
        if self.config.mode != "run" {
            debug!(mode = %self.config.mode, "skipping FDE state initialization");
            return Ok(());
        }
        let mut st = self.state.lock();
        if let Err(err) = self.initialize_state(&mut st) {
            let err = format!("cannot initialize FDE state: {err}");
            error!("cannot complete FDE state manager startup: {err}");
            *guard(&self.init_err) = Some(err);
        }
        Ok(())
    }

    pub fn init_error(&self) -> Option<String> {
        guard(&self.init_err).clone()
    }

    pub(crate) fn is_functional(&self) -> Result<()> {
        match guard(&self.init_err).as_deref() {
            Some(err) => Err(FdeError::runtime(err)),
            None => Ok(()),
        }
    }

    pub fn sealed_keys_method(&self) -> Result<Option<SealingMethod>> {
        sealed_keys_method(&self.config.sealed_keys_stamp)
    }

    fn resolve_container(&self, mount_point: &Path) -> Result<Option<String>> {
        match self.disks.dm_crypt_uuid_from_mount_point(mount_point) {
            Ok(uuid) => Ok(Some(uuid)),
            Err(DiskError::NoDmUuid) => Ok(None),
            Err(DiskError::MountPointNotFound(_)) => {
                debug!(mount_point = %mount_point.display(), "mount point not found");
                Ok(None)
            }
            Err(err) => Err(FdeError::runtime(format!(
                "cannot find UUID for mount {}: {err}",
                mount_point.display()
            ))),
        }
    }

    /// Encrypted containers of this device, in no particular order.
    pub fn get_encrypted_containers(&self, st: &mut StateData) -> Result<Vec<EncryptedContainer>> {
        let mut found = Vec::new();

        if let Some(uuid) = self.resolve_container(&self.config.data_mount_point)? {
            let legacy_keys = self
                .config
                .data_legacy_key_paths()
                .into_iter()
                .filter(|(_, path)| path.exists())
                .map(|(name, path)| (name.to_string(), path))
                .collect();
            found.push(EncryptedContainer {
                uuid,
                container_role: SYSTEM_DATA.to_string(),
                legacy_keys,
            });
        }

        if let Some(uuid) = self.resolve_container(&self.config.save_mount_point)? {
            let mut legacy_keys = BTreeMap::new();
            if let Some(path) = self
                .config
                .save_legacy_fallback_paths()
                .into_iter()
                .find(|path| path.exists())
            {
                legacy_keys.insert("default-fallback".to_string(), path);
            }
            found.push(EncryptedContainer {
                uuid,
                container_role: SYSTEM_SAVE.to_string(),
                legacy_keys,
            });
        }

        for (i, first) in found.iter().enumerate() {
            for second in &found[i + 1..] {
                if first.container_role == second.container_role {
                    let msg = format!(
                        "unexpected system state detected, container roles for disk volumes should map to one volume only: container role {:?} maps to {} and {}",
                        first.container_role,
                        first.dev_path(),
                        second.dev_path()
                    );
                    warn!("{msg}");
                    st.warnf(msg);
                }
            }
        }

        Ok(found)
    }

    /// Key slots named by `refs`, or every key slot when `refs` is empty,
    /// together with the references that matched nothing.
    pub fn get_keyslots(
        &self,
        st: &mut StateData,
        refs: &[KeyslotRef],
    ) -> Result<(Vec<Keyslot>, Vec<KeyslotRef>)> {
        let all = refs.is_empty();
        let mut wanted: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for r in refs {
            wanted
                .entry(r.container_role.as_str())
                .or_default()
                .push(r.name.as_str());
        }

        let mut keyslots = Vec::with_capacity(refs.len());
        let mut missing = Vec::new();
        for container in self.get_encrypted_containers(st)? {
            let targets = wanted
                .get(container.container_role.as_str())
                .cloned()
                .unwrap_or_default();
            if !all && targets.is_empty() {
                continue;
            }
            let dev_path = container.dev_path();

            let recovery_names = self.backend.list_recovery_key_names(&dev_path).map_err(|e| {
                FdeError::backend(format!("cannot obtain recovery keys for {dev_path:?}: {e}"))
            })?;
            let platform_names = self.backend.list_unlock_key_names(&dev_path).map_err(|e| {
                FdeError::backend(format!("cannot obtain platform keys for {dev_path:?}: {e}"))
            })?;

            let matched: Vec<Keyslot> = recovery_names
                .into_iter()
                .map(|name| (name, KeyslotType::Recovery))
                .chain(
                    platform_names
                        .into_iter()
                        .map(|name| (name, KeyslotType::Platform)),
                )
                .filter(|(name, _)| all || targets.contains(&name.as_str()))
                .map(|(name, kind)| {
                    Keyslot::new(name, kind, container.container_role.clone(), dev_path.clone())
                })
                .collect();

            for target in targets {
                if !matched.iter().any(|k| k.name == target) {
                    missing.push(KeyslotRef::new(container.container_role.clone(), target));
                }
            }
            keyslots.extend(matched);
        }
        Ok((keyslots, missing))
    }

    /// Generates a recovery key and caches it under a fresh id until it
    /// expires.
    pub fn generate_recovery_key(&self) -> Result<(RecoveryKey, String)> {
        let mut attempts = 0;
        loop {
            if attempts >= self.config.recovery_key_max_retries {
                return Err(FdeError::internal(
                    "cannot generate recovery key: max retries reached",
                ));
            }
            let key = (self.recovery_key_source)()?;
            let key_id = key.id();
            match self.recovery_keys.key(&key_id) {
                Err(err) if is_no_recovery_key(&err) => {
                    let ttl = chrono::Duration::from_std(self.config.recovery_key_ttl())
                        .map_err(|e| FdeError::internal(format!("invalid recovery key TTL: {e}")))?;
                    self.recovery_keys.add_key(
                        &key_id,
                        CachedRecoveryKey {
                            key: key.clone(),
                            expiration: Utc::now() + ttl,
                        },
                    )?;
                    return Ok((key, key_id));
                }
                Err(err) => return Err(err),
                Ok(_) => {
                    debug!("recovery key id collision, retrying");
                    attempts += 1;
                }
            }
        }
    }

    /// Hands out a generated recovery key once. The entry is dropped even
    /// when it has expired.
    pub fn get_recovery_key(&self, key_id: &str) -> Result<RecoveryKey> {
        let entry = self.recovery_keys.key(key_id)?;
        self.recovery_keys.remove_key(key_id)?;
        if entry.expired(Utc::now()) {
            return Err(FdeError::InvalidRecoveryKey(InvalidRecoveryKeyReason::Expired));
        }
        Ok(entry.key.clone())
    }

    /// Checks that `key` unlocks the given container roles, or every
    /// encrypted container when `container_roles` is empty.
    pub fn check_recovery_key(
        &self,
        st: &mut StateData,
        key: &RecoveryKey,
        container_roles: &[String],
    ) -> Result<()> {
        let all = container_roles.is_empty();
        let mut found = Vec::new();
        for container in self.get_encrypted_containers(st)? {
            if !all && !container_roles.contains(&container.container_role) {
                continue;
            }
            self.backend
                .check_recovery_key(&container.dev_path(), key)
                .map_err(|e| {
                    FdeError::runtime(format!(
                        "recovery key failed for {:?}: {e}",
                        container.container_role
                    ))
                })?;
            found.push(container.container_role);
        }
        if let Some(absent) = container_roles.iter().find(|role| !found.contains(role)) {
            return Err(FdeError::runtime(format!(
                "encrypted container role {absent:?} does not exist"
            )));
        }
        Ok(())
    }

    /// Whether full disk encryption is enabled, judged by the presence of a
    /// system managed primary key.
    pub fn system_encrypted(&self, st: &StateData) -> Result<bool> {
        Ok(FdeState::load(st)?
            .map(|fde| !fde.primary_keys.is_empty())
            .unwrap_or(false))
    }

    pub fn get_parameters(
        &self,
        st: &StateData,
        role: &str,
        container_role: &str,
    ) -> Result<Option<SealingParameters>> {
        let fde = FdeState::require(st)?;
        Ok(fde.get_parameters(role, container_role)?.cloned())
    }

    pub fn update_parameters(
        &self,
        st: &mut StateData,
        role: &str,
        container_role: &str,
        params: &SealingParameters,
    ) -> Result<()> {
        fdestate::update_parameters(st, role, container_role, params)
    }

    /// Boot time activation record, read once per manager.
    pub fn activation_record(&self) -> Result<Option<ActivationRecord>> {
        let mut cached = guard(&self.activation);
        if let Some(record) = cached.as_ref() {
            return Ok(record.clone());
        }
        let record = ActivationRecord::load(&self.config.activation_state_file)?;
        *cached = Some(record.clone());
        Ok(record)
    }

    /// Reads the activation record afresh, bypassing the cache.
    pub fn unlocked_with_recovery_key(&self) -> Result<bool> {
        Ok(ActivationRecord::load(&self.config.activation_state_file)?
            .map(|r| r.unlocked_with_recovery_key())
            .unwrap_or(false))
    }

    /// Snaps whose changes must not overlap with `task`.
    pub fn affected_snaps(&self, task: &Task) -> Result<Vec<String>> {
        match task.kind() {
            handlers::ADD_PLATFORM_KEYS_KIND
            | secureboot::PREPARE_TASK_KIND
            | secureboot::UPDATE_TASK_KIND => self.snaps.relevant_snaps(),
            _ => declared_snaps(task),
        }
    }

    pub(crate) fn relevant_snaps(&self) -> Result<Vec<String>> {
        self.snaps.relevant_snaps()
    }

    /// Fails when a pending change touches one of the snaps whose content is
    /// measured at boot.
    pub(crate) fn check_relevant_snaps_conflict(&self, st: &StateData) -> Result<()> {
        let snaps = self.snaps.relevant_snaps()?;
        check_snaps_conflict(st, &snaps, None, &|task| self.affected_snaps(task))
    }

    /// Conflict check for snap operations: fails when a pending FDE change
    /// depends on `snap`.
    pub fn check_snap_change_conflict(&self, st: &StateData, snap: &str) -> Result<()> {
        let snaps = [snap.to_string()];
        check_snaps_conflict(st, &snaps, None, &|task| match task.kind() {
            handlers::ADD_PLATFORM_KEYS_KIND
            | secureboot::PREPARE_TASK_KIND
            | secureboot::UPDATE_TASK_KIND => self.snaps.relevant_snaps(),
            _ => Ok(Vec::new()),
        })
    }

    /// Stores the secrets for a pending authentication change. Returns true
    /// when stale options were replaced.
    pub fn cache_change_auth_options(&self, options: ChangeAuthOptions) -> bool {
        guard(&self.change_auth_options).replace(options).is_some()
    }

    pub fn change_auth_options(&self) -> Option<ChangeAuthOptions> {
        guard(&self.change_auth_options).clone()
    }

    pub fn clear_change_auth_options(&self) {
        guard(&self.change_auth_options).take();
    }

    pub fn cache_volumes_auth_options(&self, options: VolumesAuthOptions) -> bool {
        guard(&self.volumes_auth).replace(options).is_some()
    }

    pub fn volumes_auth_options(&self) -> Option<VolumesAuthOptions> {
        guard(&self.volumes_auth).clone()
    }

    pub fn clear_volumes_auth_options(&self) {
        guard(&self.volumes_auth).take();
    }

    /// Reseals through the backend. The backend may release `st` around
    /// slow platform work; the returned guard is held again.
    pub fn reseal<'a>(
        &'a self,
        st: StateGuard<'a>,
        request: &ResealRequest,
    ) -> (StateGuard<'a>, Result<()>) {
        let unlocked = UnlockedStateManager::new(&self.state, st);
        let result = self.backend.reseal(&unlocked, request);
        (unlocked.into_guard(), result)
    }

    /// Loads the sealing parameters for the current boot chains through
    /// the backend.
    pub(crate) fn load_parameters<'a>(
        &'a self,
        st: StateGuard<'a>,
    ) -> (StateGuard<'a>, Result<()>) {
        let method = match self.sealed_keys_method() {
            Ok(method) => method.unwrap_or(SealingMethod::LegacyTpm),
            Err(err) => return (st, Err(err)),
        };
        let chains = match self.boot.boot_chains(method) {
            Ok(chains) => chains,
            Err(err) => return (st, Err(err)),
        };
        let unlocked = UnlockedStateManager::new(&self.state, st);
        let result = self.backend.load_parameters(&unlocked, method, &chains);
        (unlocked.into_guard(), result)
    }

    fn initialize_state(&self, st: &mut StateData) -> Result<()> {
        if FdeState::load(st)?.is_some() {
            return Ok(());
        }
        let containers = self.get_encrypted_containers(st)?;
        let expect_fde_hook = matches!(
            self.sealed_keys_method()?,
            Some(SealingMethod::FdeSetupHook)
        );

        let mut fde = FdeState::with_default_roles();
        let mut primary: Option<KeyDigest> = None;
        let mut legacy = false;
        for container in &containers {
            let dev_path = container.dev_path();
            match &primary {
                Some(known) => {
                    let matches = self.backend.verify_primary_key_digest(
                        &dev_path,
                        known.algorithm,
                        &known.salt,
                        &known.digest,
                    )?;
                    if !matches {
                        return Err(FdeError::PrimaryKeyMismatch {
                            container_role: container.container_role.clone(),
                            dev_path,
                        });
                    }
                }
                None if !legacy => {
                    match self.backend.primary_key_digest(&dev_path, HashAlg::Sha256)? {
                        Some((salt, digest)) => {
                            primary = Some(KeyDigest {
                                algorithm: HashAlg::Sha256,
                                salt,
                                digest,
                            })
                        }
                        None => {
                            warn!(
                                dev_path,
                                "cannot find primary key in the kernel keyring, FDE state will not have a primary key"
                            );
                            legacy = true;
                        }
                    }
                }
                None => {}
            }

            for (slot, path) in &container.legacy_keys {
                let handle = self.backend.policy_revocation_handle(
                    &dev_path,
                    slot,
                    Some(path),
                    expect_fde_hook,
                )?;
                let roles: &[&str] = match slot.as_str() {
                    "default" => &[ROLE_RUN, ROLE_RUN_RECOVER],
                    "default-fallback" => &[ROLE_RECOVER],
                    _ => &[],
                };
                for role in roles {
                    let info = fde.keyslot_roles.entry(role.to_string()).or_default();
                    match info.tpm2_pcr_policy_revocation_counter {
                        0 => info.tpm2_pcr_policy_revocation_counter = handle,
                        existing if existing != handle => {
                            return Err(FdeError::MultipleRevocationCounters {
                                role: role.to_string(),
                                first: existing,
                                second: handle,
                            })
                        }
                        _ => {}
                    }
                }
            }
        }

        if let Some(digest) = primary {
            fde.primary_keys.insert(0, PrimaryKeyInfo { digest });
        }
        fde.store(st)?;
        info!(
            containers = containers.len(),
            "initialized FDE state"
        );
        Ok(())
    }

    /// Rejects the request when another FDE change is in flight.
    pub fn check_fde_change_conflict(&self, st: &StateData) -> Result<()> {
        conflicts::check_fde_change_conflict(st)
    }
}

/// [`FdeStateManager`] handed to the backend during reseals. It owns the
/// state guard so it can release it while the backend does slow work.
pub struct UnlockedStateManager<'a> {
    state: &'a State,
    guard: RefCell<Option<StateGuard<'a>>>,
}

impl<'a> UnlockedStateManager<'a> {
    pub fn new(state: &'a State, guard: StateGuard<'a>) -> Self {
        Self {
            state,
            guard: RefCell::new(Some(guard)),
        }
    }

    /// The state guard, locking again if the backend left it unlocked.
    pub fn into_guard(self) -> StateGuard<'a> {
        let state = self.state;
        self.guard.into_inner().unwrap_or_else(|| state.lock())
    }

    fn with_data<R>(&self, f: impl FnOnce(&mut StateData) -> R) -> R {
        let mut slot = self.guard.borrow_mut();
        match slot.as_mut() {
            Some(st) => f(st),
            None => {
                let mut st = self.state.lock();
                f(&mut st)
            }
        }
    }
}

impl FdeStateManager for UnlockedStateManager<'_> {
    fn get(&self, role: &str, container_role: &str) -> Result<Option<SealingParameters>> {
        self.with_data(|st| {
            let fde = FdeState::require(st)?;
            Ok(fde.get_parameters(role, container_role)?.cloned())
        })
    }

    fn update(&self, role: &str, container_role: &str, params: &SealingParameters) -> Result<()> {
        self.with_data(|st| fdestate::update_parameters(st, role, container_role, params))
    }

    fn unlock(&self) -> Relock<'_> {
        let held = self.guard.borrow_mut().take();
        if held.is_none() {
            return Relock::noop();
        }
        drop(held);
        Relock::new(move || {
            *self.guard.borrow_mut() = Some(self.state.lock());
        })
    }
}
