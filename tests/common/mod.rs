#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use fde_manager::config::FdeConfig;
use fde_manager::error::FdeError;
use fde_manager::fdestate::{ActivationRecord, HashAlg};
use fde_manager::interfaces::boot::{BootChain, BootChains, BootEnvironment};
use fde_manager::interfaces::disks::{DiskError, DiskResolver};
use fde_manager::interfaces::sealing::{
    AuthMode, FdeStateManager, KeyData, ProtectedKeyParams, ProvisionMode, ResealRequest,
    SealingBackend, SealingMethod, SealingParameters,
};
use fde_manager::interfaces::snaps::SnapActivity;
use fde_manager::manager::Collaborators;
use fde_manager::recovery_keys::RecoveryKey;
use fde_manager::state::{StateData, TaskRunner, TaskSet};
use fde_manager::{FdeManager, Result, State};

pub const DATA_UUID: &str = "aaaa-data";
pub const SAVE_UUID: &str = "bbbb-save";
pub const DATA_DEV: &str = "/dev/disk/by-uuid/aaaa-data";
pub const SAVE_DEV: &str = "/dev/disk/by-uuid/bbbb-save";

fn locked<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Default)]
pub struct FakeDisks {
    mounts: Mutex<HashMap<PathBuf, std::result::Result<String, DiskError>>>,
}

impl FakeDisks {
    pub fn set(&self, mount_point: &Path, result: std::result::Result<String, DiskError>) {
        locked(&self.mounts).insert(mount_point.to_path_buf(), result);
    }
}

impl DiskResolver for FakeDisks {
    fn dm_crypt_uuid_from_mount_point(
        &self,
        mount_point: &Path,
    ) -> std::result::Result<String, DiskError> {
        locked(&self.mounts)
            .get(mount_point)
            .cloned()
            .unwrap_or_else(|| Err(DiskError::MountPointNotFound(mount_point.display().to_string())))
    }
}

/// Key slots of one encrypted container.
#[derive(Debug, Clone, Default)]
pub struct FakeContainer {
    pub recovery: BTreeMap<String, RecoveryKey>,
    pub platform: BTreeMap<String, KeyData>,
}

pub fn tpm_key_data(role: &str) -> KeyData {
    KeyData {
        platform_name: "tpm2".to_string(),
        auth_mode: AuthMode::None,
        roles: vec![role.to_string()],
        sealed: Vec::new(),
    }
}

pub fn passphrase_key_data(role: &str, passphrase: &str) -> KeyData {
    KeyData {
        auth_mode: AuthMode::Passphrase,
        sealed: passphrase.as_bytes().to_vec(),
        ..tpm_key_data(role)
    }
}

/// In-memory sealing backend. Operations fail when a failure was injected
/// under `"<operation>"` or `"<operation>:<slot name>"`.
#[derive(Default)]
pub struct FakeBackend {
    containers: Mutex<BTreeMap<String, FakeContainer>>,
    failures: Mutex<HashMap<String, String>>,
    calls: Mutex<Vec<String>>,
    reseals: Mutex<Vec<ResealRequest>>,
    primary_keys: Mutex<HashMap<String, (Vec<u8>, Vec<u8>)>>,
    revocation_handles: Mutex<HashMap<String, u32>>,
    attempt_repair: Mutex<bool>,
}

impl FakeBackend {
    pub fn with_default_slots() -> Self {
        let backend = Self::default();
        let mut data = FakeContainer::default();
        data.recovery
            .insert("default-recovery".to_string(), RecoveryKey::from_bytes([1; 16]));
        data.platform
            .insert("default".to_string(), tpm_key_data("run+recover"));
        data.platform
            .insert("default-fallback".to_string(), tpm_key_data("recover"));
        let mut save = FakeContainer::default();
        save.recovery
            .insert("default-recovery".to_string(), RecoveryKey::from_bytes([1; 16]));
        save.platform
            .insert("default-fallback".to_string(), tpm_key_data("recover"));
        backend.set_container(DATA_DEV, data);
        backend.set_container(SAVE_DEV, save);
        for dev in [DATA_DEV, SAVE_DEV] {
            backend.set_primary_key(dev, b"salt", b"digest");
        }
        backend
    }

    pub fn set_container(&self, dev_path: &str, container: FakeContainer) {
        locked(&self.containers).insert(dev_path.to_string(), container);
    }

    pub fn container(&self, dev_path: &str) -> FakeContainer {
        locked(&self.containers)
            .get(dev_path)
            .cloned()
            .unwrap_or_default()
    }

    pub fn slot_names(&self, dev_path: &str) -> Vec<String> {
        let container = self.container(dev_path);
        container
            .recovery
            .keys()
            .chain(container.platform.keys())
            .cloned()
            .collect()
    }

    pub fn set_primary_key(&self, dev_path: &str, salt: &[u8], digest: &[u8]) {
        locked(&self.primary_keys).insert(dev_path.to_string(), (salt.to_vec(), digest.to_vec()));
    }

    pub fn clear_primary_key(&self, dev_path: &str) {
        locked(&self.primary_keys).remove(dev_path);
    }

    pub fn set_revocation_handle(&self, dev_path: &str, slot_name: &str, handle: u32) {
        locked(&self.revocation_handles).insert(format!("{dev_path}:{slot_name}"), handle);
    }

    pub fn set_attempt_repair(&self, attempt: bool) {
        *locked(&self.attempt_repair) = attempt;
    }

    pub fn fail(&self, key: &str, message: &str) {
        locked(&self.failures).insert(key.to_string(), message.to_string());
    }

    pub fn clear_failures(&self) {
        locked(&self.failures).clear();
    }

    pub fn calls(&self) -> Vec<String> {
        locked(&self.calls).clone()
    }

    pub fn reseals(&self) -> Vec<ResealRequest> {
        locked(&self.reseals).clone()
    }

    fn record(&self, call: String) -> Result<()> {
        let failures = locked(&self.failures);
        let operation = call.split(':').next().unwrap_or_default().to_string();
        let failure = failures
            .get(&call)
            .or_else(|| failures.get(&operation))
            .cloned();
        drop(failures);
        locked(&self.calls).push(call);
        match failure {
            Some(message) => Err(FdeError::backend(message)),
            None => Ok(()),
        }
    }

    fn with_container<R>(
        &self,
        dev_path: &str,
        f: impl FnOnce(&mut FakeContainer) -> Result<R>,
    ) -> Result<R> {
        let mut containers = locked(&self.containers);
        let container = containers
            .get_mut(dev_path)
            .ok_or_else(|| FdeError::backend(format!("no container at {dev_path}")))?;
        f(container)
    }
}

impl SealingBackend for FakeBackend {
    fn provision_platform(&self, _mode: ProvisionMode, _lockout_auth_file: &Path) -> Result<()> {
        self.record("provision_platform".to_string())
    }

    fn check_encryption_support(&self) -> Result<()> {
        self.record("check_encryption_support".to_string())
    }

    fn should_attempt_repair(&self, _activation: &ActivationRecord) -> bool {
        *locked(&self.attempt_repair)
    }

    fn reseal(&self, manager: &dyn FdeStateManager, request: &ResealRequest) -> Result<()> {
        self.record("reseal".to_string())?;
        locked(&self.reseals).push(request.clone());
        let params = SealingParameters {
            boot_modes: vec!["run".to_string()],
            models: Vec::new(),
            tpm_pcr_profile: b"resealed".to_vec(),
        };
        {
            let _unlocked = manager.unlock();
            std::thread::sleep(Duration::from_millis(5));
        }
        manager.update("run+recover", "all", &params)
    }

    fn load_parameters(
        &self,
        manager: &dyn FdeStateManager,
        _method: SealingMethod,
        _boot_chains: &BootChains,
    ) -> Result<()> {
        self.record("load_parameters".to_string())?;
        for role in ["run", "run+recover", "recover"] {
            let params = SealingParameters {
                boot_modes: vec!["run".to_string(), "recover".to_string()],
                models: Vec::new(),
                tpm_pcr_profile: format!("profile-{role}").into_bytes(),
            };
            manager.update(role, "all", &params)?;
        }
        Ok(())
    }

    fn primary_key_digest(
        &self,
        dev_path: &str,
        _alg: HashAlg,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.record(format!("primary_key_digest:{dev_path}"))?;
        Ok(locked(&self.primary_keys).get(dev_path).cloned())
    }

    fn verify_primary_key_digest(
        &self,
        dev_path: &str,
        _alg: HashAlg,
        salt: &[u8],
        digest: &[u8],
    ) -> Result<bool> {
        self.record(format!("verify_primary_key_digest:{dev_path}"))?;
        Ok(locked(&self.primary_keys)
            .get(dev_path)
            .map(|(s, d)| s == salt && d == digest)
            .unwrap_or(false))
    }

    fn policy_revocation_handle(
        &self,
        dev_path: &str,
        slot_name: &str,
        _legacy_key_file: Option<&Path>,
        _hint_expect_fde_hook: bool,
    ) -> Result<u32> {
        self.record(format!("policy_revocation_handle:{slot_name}"))?;
        Ok(locked(&self.revocation_handles)
            .get(&format!("{dev_path}:{slot_name}"))
            .copied()
            .unwrap_or(0x0180_0001))
    }

    fn list_recovery_key_names(&self, dev_path: &str) -> Result<Vec<String>> {
        self.record(format!("list_recovery_key_names:{dev_path}"))?;
        Ok(self.container(dev_path).recovery.keys().cloned().collect())
    }

    fn list_unlock_key_names(&self, dev_path: &str) -> Result<Vec<String>> {
        self.record(format!("list_unlock_key_names:{dev_path}"))?;
        Ok(self.container(dev_path).platform.keys().cloned().collect())
    }

    fn add_recovery_key(&self, dev_path: &str, slot_name: &str, key: &RecoveryKey) -> Result<()> {
        self.record(format!("add_recovery_key:{slot_name}"))?;
        self.with_container(dev_path, |c| {
            c.recovery.insert(slot_name.to_string(), key.clone());
            Ok(())
        })
    }

    fn add_protected_key(&self, dev_path: &str, params: &ProtectedKeyParams<'_>) -> Result<()> {
        self.record(format!("add_protected_key:{}", params.slot_name))?;
        let key_data = match params.volumes_auth {
            Some(auth) => passphrase_key_data(params.role, &auth.passphrase),
            None => tpm_key_data(params.role),
        };
        self.with_container(dev_path, |c| {
            c.platform.insert(params.slot_name.to_string(), key_data);
            Ok(())
        })
    }

    fn delete_key(&self, dev_path: &str, slot_name: &str) -> Result<()> {
        self.record(format!("delete_key:{slot_name}"))?;
        self.with_container(dev_path, |c| {
            c.recovery.remove(slot_name);
            c.platform.remove(slot_name);
            Ok(())
        })
    }

    fn rename_key(&self, dev_path: &str, old_name: &str, new_name: &str) -> Result<()> {
        self.record(format!("rename_key:{old_name}"))?;
        self.with_container(dev_path, |c| {
            if let Some(key) = c.recovery.remove(old_name) {
                c.recovery.insert(new_name.to_string(), key);
            } else if let Some(data) = c.platform.remove(old_name) {
                c.platform.insert(new_name.to_string(), data);
            } else {
                return Err(FdeError::backend(format!("no key slot {old_name}")));
            }
            Ok(())
        })
    }

    fn check_recovery_key(&self, dev_path: &str, key: &RecoveryKey) -> Result<()> {
        self.record(format!("check_recovery_key:{dev_path}"))?;
        if self.container(dev_path).recovery.values().any(|k| k == key) {
            Ok(())
        } else {
            Err(FdeError::backend("invalid recovery key"))
        }
    }

    fn read_key_data(&self, dev_path: &str, slot_name: &str) -> Result<KeyData> {
        self.record(format!("read_key_data:{slot_name}"))?;
        self.container(dev_path)
            .platform
            .get(slot_name)
            .cloned()
            .ok_or_else(|| FdeError::backend(format!("no key data for {slot_name}")))
    }

    fn write_key_data(&self, dev_path: &str, slot_name: &str, key_data: &KeyData) -> Result<()> {
        self.record(format!("write_key_data:{slot_name}"))?;
        self.with_container(dev_path, |c| {
            c.platform.insert(slot_name.to_string(), key_data.clone());
            Ok(())
        })
    }

    fn change_passphrase(&self, key_data: &mut KeyData, old: &str, new: &str) -> Result<()> {
        self.record("change_passphrase".to_string())?;
        if key_data.sealed != old.as_bytes() {
            return Err(FdeError::backend("invalid passphrase"));
        }
        key_data.sealed = new.as_bytes().to_vec();
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeBoot {
    fail: Mutex<Option<String>>,
}

impl FakeBoot {
    pub fn fail(&self, message: &str) {
        *locked(&self.fail) = Some(message.to_string());
    }
}

impl BootEnvironment for FakeBoot {
    fn boot_chains(&self, _method: SealingMethod) -> Result<BootChains> {
        if let Some(message) = locked(&self.fail).clone() {
            return Err(FdeError::runtime(message));
        }
        Ok(BootChains {
            run_mode: vec![BootChain {
                boot_modes: vec!["run".to_string()],
                kernel: "pc-kernel_1.snap".to_string(),
                ..Default::default()
            }],
            recovery: Vec::new(),
        })
    }
}

pub struct FakeSnaps(pub Vec<String>);

impl SnapActivity for FakeSnaps {
    fn relevant_snaps(&self) -> Result<Vec<String>> {
        Ok(self.0.clone())
    }
}

/// Manager wired to fakes, with its files inside a temporary directory.
pub struct Fixture {
    pub dir: tempfile::TempDir,
    pub state: State,
    pub runner: TaskRunner,
    pub manager: Arc<FdeManager>,
    pub backend: Arc<FakeBackend>,
    pub disks: Arc<FakeDisks>,
    pub boot: Arc<FakeBoot>,
}

pub fn test_config(root: &Path) -> FdeConfig {
    FdeConfig {
        data_mount_point: root.join("run/mnt/data"),
        save_mount_point: root.join("var/lib/snapd/save"),
        boot_encryption_key_dir: root.join("boot/device/fde"),
        seed_encryption_key_dir: root.join("seed/device/fde"),
        sealed_keys_stamp: root.join("device/fde/sealed-keys"),
        activation_state_file: root.join("run/unlocked.json"),
        boot_id_file: root.join("boot_id"),
        lockout_auth_file: root.join("device/fde/tpm-lockout-auth"),
        ..FdeConfig::default()
    }
}

pub fn write_file(path: &Path, content: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

impl Fixture {
    /// Encrypted data and save containers with the default key slots,
    /// keys sealed with the TPM and an initialized FDE state.
    pub fn new() -> Self {
        let fixture = Self::with_backend(FakeBackend::with_default_slots(), |_| {});
        assert_eq!(fixture.manager.init_error(), None);
        fixture
    }

    pub fn with_backend(backend: FakeBackend, prepare: impl FnOnce(&mut FdeConfig)) -> Self {
        Self::build(backend, prepare, |collaborators| collaborators)
    }

    pub fn build(
        backend: FakeBackend,
        prepare: impl FnOnce(&mut FdeConfig),
        customize: impl FnOnce(Collaborators) -> Collaborators,
    ) -> Self {
        fde_manager::logging::init_tracing("fde-test");
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        prepare(&mut config);
        write_file(&config.sealed_keys_stamp, "tpm");
        write_file(&config.boot_id_file, "boot-1\n");

        let disks = Arc::new(FakeDisks::default());
        disks.set(&config.data_mount_point, Ok(DATA_UUID.to_string()));
        disks.set(&config.save_mount_point, Ok(SAVE_UUID.to_string()));
        let backend = Arc::new(backend);
        let boot = Arc::new(FakeBoot::default());

        let state = State::new();
        let runner = TaskRunner::new(state.clone());
        let collaborators = customize(Collaborators::new(
            disks.clone(),
            backend.clone(),
            boot.clone(),
            Arc::new(FakeSnaps(vec!["pc".to_string(), "pc-kernel".to_string()])),
        ));
        let manager = FdeManager::new(state.clone(), &runner, config, collaborators).unwrap();
        manager.startup().unwrap();

        Self {
            dir,
            state,
            runner,
            manager,
            backend,
            disks,
            boot,
        }
    }

    pub fn write_activation(&self, record: &serde_json::Value) {
        write_file(
            &self.manager.config().activation_state_file,
            &record.to_string(),
        );
    }

    pub async fn settle(&self) {
        self.runner.settle(Duration::from_secs(10)).await.unwrap();
    }
}

/// Puts `task_set` into a new change of `kind` and returns the change id.
pub fn add_change(st: &mut StateData, kind: &str, task_set: &TaskSet) -> String {
    let change = st.new_change(kind, "test change");
    st.add_all(&change, task_set).unwrap();
    change
}
