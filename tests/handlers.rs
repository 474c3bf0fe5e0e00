mod common;

use serde_json::json;

use std::collections::BTreeMap;

use common::{
    add_change, passphrase_key_data, tpm_key_data, FakeBackend, FakeContainer, Fixture, DATA_DEV,
    SAVE_DEV,
};
use fde_manager::conflicts::{
    CHANGE_PASSPHRASE_CHANGE_KIND, KEYSLOTS_ATTR, REPLACE_PLATFORM_KEY_CHANGE_KIND,
    REPLACE_RECOVERY_KEY_CHANGE_KIND,
};
use fde_manager::handlers::{
    ADD_RECOVERY_KEYS_KIND, RECOVERY_KEY_ID_ATTR, REMOVE_KEYS_KIND, RENAMES_ATTR,
    RENAME_KEYS_KIND,
};
use fde_manager::interfaces::sealing::{AuthMode, VolumesAuthOptions};
use fde_manager::keyslots::{SYSTEM_DATA, SYSTEM_SAVE};
use fde_manager::state::{StateData, Status, Task};
use fde_manager::KeyslotRef;

/// Queues a change holding a single task of `kind`.
fn queue_task(st: &mut StateData, kind: &str, setup: impl FnOnce(&mut Task)) -> String {
    let task = st.new_task(kind, "Key slot task");
    setup(st.task_mut(&task).unwrap());
    let change = st.new_change("fde-test", "");
    st.add_task(&change, &task).unwrap();
    change
}

fn count_calls(f: &Fixture, call: &str) -> usize {
    f.backend.calls().iter().filter(|c| c.as_str() == call).count()
}

#[tokio::test(flavor = "multi_thread")]
async fn replace_recovery_key_swaps_slots() {
    let f = Fixture::new();
    let (key, key_id) = f.manager.generate_recovery_key().unwrap();

    let change = {
        let mut st = f.state.lock();
        let ts = f.manager.replace_recovery_key(&mut st, &key_id, &[]).unwrap();
        add_change(&mut st, REPLACE_RECOVERY_KEY_CHANGE_KIND, &ts)
    };
    f.settle().await;

    let st = f.state.lock();
    assert_eq!(st.change_status(&change), Status::Done, "{:?}", st.change_err(&change));
    for dev in [DATA_DEV, SAVE_DEV] {
        let container = f.backend.container(dev);
        assert_eq!(
            container.recovery.keys().cloned().collect::<Vec<_>>(),
            vec!["default-recovery".to_string()]
        );
        assert_eq!(container.recovery["default-recovery"], key);
    }
    // the key was consumed by the change
    assert!(f.manager.get_recovery_key(&key_id).is_err());

    let calls = f.backend.calls();
    assert!(calls.contains(&"add_recovery_key:snapd-tmp:default-recovery".to_string()));
    assert!(calls.contains(&"rename_key:snapd-tmp:default-recovery".to_string()));
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_recovery_key_addition_removes_added_slots() {
    let f = Fixture::new();
    let (_, key_id) = f.manager.generate_recovery_key().unwrap();
    f.backend.fail("add_recovery_key:b-recovery", "no space left");

    let refs = vec![
        KeyslotRef::new(SYSTEM_DATA, "a-recovery"),
        KeyslotRef::new(SYSTEM_SAVE, "b-recovery"),
    ];
    let change = {
        let mut st = f.state.lock();
        let ts = f.manager.add_recovery_key(&mut st, &key_id, &refs).unwrap();
        add_change(&mut st, "fde-add-recovery-key", &ts)
    };
    f.settle().await;

    let st = f.state.lock();
    assert_eq!(st.change_status(&change), Status::Error);
    assert_eq!(
        st.change_err(&change).unwrap(),
        "cannot perform the following tasks:\n- Add recovery key slots (cannot add recovery key slot (container-role: \"system-save\", name: \"b-recovery\"): no space left)"
    );
    assert!(!f.backend.container(DATA_DEV).recovery.contains_key("a-recovery"));
    assert!(f.backend.calls().contains(&"delete_key:a-recovery".to_string()));
    // the key stays available for a retry
    assert!(f.manager.get_recovery_key(&key_id).is_ok());
}

#[tokio::test(flavor = "multi_thread")]
async fn expired_recovery_key_fails_the_change() {
    let f = Fixture::with_backend(FakeBackend::with_default_slots(), |config| {
        config.recovery_key_ttl_secs = 0;
    });
    let (_, key_id) = f.manager.generate_recovery_key().unwrap();
    let refs = vec![KeyslotRef::new(SYSTEM_DATA, "late-recovery")];
    let change = {
        let mut st = f.state.lock();
        let task = st.new_task(fde_manager::handlers::ADD_RECOVERY_KEYS_KIND, "Add recovery key slots");
        let t = st.task_mut(&task).unwrap();
        t.set(fde_manager::conflicts::KEYSLOTS_ATTR, &refs).unwrap();
        t.set(fde_manager::handlers::RECOVERY_KEY_ID_ATTR, &key_id).unwrap();
        let change = st.new_change("fde-add-recovery-key", "");
        st.add_task(&change, &task).unwrap();
        change
    };
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    f.settle().await;

    let st = f.state.lock();
    assert!(st.change_err(&change).unwrap().contains("recovery key has expired"));
}

#[tokio::test(flavor = "multi_thread")]
async fn replace_platform_key_with_passphrase() {
    let f = Fixture::new();
    let change = {
        let mut st = f.state.lock();
        let ts = f
            .manager
            .replace_platform_key(&mut st, Some(VolumesAuthOptions::passphrase("secret")), &[])
            .unwrap();
        add_change(&mut st, REPLACE_PLATFORM_KEY_CHANGE_KIND, &ts)
    };
    f.settle().await;

    let st = f.state.lock();
    assert_eq!(st.change_status(&change), Status::Done, "{:?}", st.change_err(&change));
    let data = f.backend.container(DATA_DEV);
    assert_eq!(
        data.platform.keys().cloned().collect::<Vec<_>>(),
        vec!["default".to_string(), "default-fallback".to_string()]
    );
    assert_eq!(data.platform["default"], passphrase_key_data("run+recover", "secret"));
    assert_eq!(
        f.backend.container(SAVE_DEV).platform["default-fallback"],
        passphrase_key_data("recover", "secret")
    );
    // parameters were missing and loaded once for the whole task
    let loads = f
        .backend
        .calls()
        .iter()
        .filter(|c| c.as_str() == "load_parameters")
        .count();
    assert_eq!(loads, 1);
    assert_eq!(f.manager.volumes_auth_options(), None);
}

#[tokio::test(flavor = "multi_thread")]
async fn add_platform_keys_refuses_after_recovery_boot() {
    let f = Fixture::new();
    let change = {
        let mut st = f.state.lock();
        let ts = f
            .manager
            .replace_platform_key(&mut st, None, &[KeyslotRef::new(SYSTEM_DATA, "default")])
            .unwrap();
        add_change(&mut st, REPLACE_PLATFORM_KEY_CHANGE_KIND, &ts)
    };
    f.write_activation(&json!({
        "ubuntu-data": {"unlock-state": "unlocked", "unlock-key": "recovery"},
    }));
    f.settle().await;

    let st = f.state.lock();
    assert_eq!(st.change_status(&change), Status::Error);
    assert!(st
        .change_err(&change)
        .unwrap()
        .contains("cannot add protected keys if the system was unlocked with a recovery key during boot"));
    // the old slot is untouched
    assert_eq!(
        f.backend.container(DATA_DEV).platform["default"],
        common::tpm_key_data("run+recover")
    );
}

fn passphrase_backend() -> FakeBackend {
    let backend = FakeBackend::with_default_slots();
    let mut data = FakeContainer::default();
    data.platform.insert(
        "default".to_string(),
        passphrase_key_data("run+recover", "old"),
    );
    data.platform.insert(
        "default-fallback".to_string(),
        passphrase_key_data("recover", "old"),
    );
    backend.set_container(DATA_DEV, data);
    backend
}

fn data_refs() -> Vec<KeyslotRef> {
    vec![
        KeyslotRef::new(SYSTEM_DATA, "default"),
        KeyslotRef::new(SYSTEM_DATA, "default-fallback"),
    ]
}

#[tokio::test(flavor = "multi_thread")]
async fn change_passphrase_updates_every_slot() {
    let f = Fixture::with_backend(passphrase_backend(), |_| {});
    let change = {
        let mut st = f.state.lock();
        let ts = f
            .manager
            .change_auth(&mut st, AuthMode::Passphrase, "old", "new", &data_refs())
            .unwrap();
        add_change(&mut st, CHANGE_PASSPHRASE_CHANGE_KIND, &ts)
    };
    f.settle().await;

    let st = f.state.lock();
    assert_eq!(st.change_status(&change), Status::Done, "{:?}", st.change_err(&change));
    let data = f.backend.container(DATA_DEV);
    for slot in ["default", "default-fallback"] {
        assert_eq!(data.platform[slot].sealed, b"new".to_vec());
    }
    assert!(f.manager.change_auth_options().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn change_passphrase_reverts_on_failure() {
    let f = Fixture::with_backend(passphrase_backend(), |_| {});
    f.backend.fail("write_key_data:default-fallback", "write error");
    let change = {
        let mut st = f.state.lock();
        let ts = f
            .manager
            .change_auth(&mut st, AuthMode::Passphrase, "old", "new", &data_refs())
            .unwrap();
        add_change(&mut st, CHANGE_PASSPHRASE_CHANGE_KIND, &ts)
    };
    f.settle().await;

    let st = f.state.lock();
    assert_eq!(st.change_status(&change), Status::Error);
    assert!(st.change_err(&change).unwrap().contains(
        r#"cannot write key data for (container-role: "system-data", name: "default-fallback"): write error"#
    ));
    let data = f.backend.container(DATA_DEV);
    assert_eq!(data.platform["default"].sealed, b"old".to_vec());
    let writes: Vec<String> = f
        .backend
        .calls()
        .into_iter()
        .filter(|c| c == "write_key_data:default")
        .collect();
    assert_eq!(writes.len(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn change_passphrase_without_options_in_memory() {
    let f = Fixture::with_backend(passphrase_backend(), |_| {});
    let change = {
        let mut st = f.state.lock();
        let ts = f
            .manager
            .change_auth(&mut st, AuthMode::Passphrase, "old", "new", &data_refs())
            .unwrap();
        add_change(&mut st, CHANGE_PASSPHRASE_CHANGE_KIND, &ts)
    };
    // as after a restart
    f.manager.clear_change_auth_options();
    f.settle().await;

    let st = f.state.lock();
    assert!(st
        .change_err(&change)
        .unwrap()
        .contains("cannot find authentication options in memory: unexpected restart"));
    assert_eq!(
        f.backend.container(DATA_DEV).platform["default"].sealed,
        b"old".to_vec()
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn fde_tasks_of_different_changes_run_one_at_a_time() {
    let f = Fixture::new();
    let (_, first) = f.manager.generate_recovery_key().unwrap();
    let (_, second) = f.manager.generate_recovery_key().unwrap();
    let (a, b) = {
        let mut st = f.state.lock();
        let ts = f
            .manager
            .add_recovery_key(&mut st, &first, &[KeyslotRef::new(SYSTEM_DATA, "a-recovery")])
            .unwrap();
        let a = add_change(&mut st, "fde-add-recovery-key", &ts);
        // built directly, the entry point would report a conflict
        let task = st.new_task(fde_manager::handlers::ADD_RECOVERY_KEYS_KIND, "Add recovery key slots");
        let t = st.task_mut(&task).unwrap();
        t.set(
            fde_manager::conflicts::KEYSLOTS_ATTR,
            &[KeyslotRef::new(SYSTEM_SAVE, "b-recovery")],
        )
        .unwrap();
        t.set(fde_manager::handlers::RECOVERY_KEY_ID_ATTR, &second).unwrap();
        let b = st.new_change("fde-add-recovery-key", "");
        st.add_task(&b, &task).unwrap();
        (a, b)
    };
    f.settle().await;

    let st = f.state.lock();
    assert_eq!(st.change_status(&a), Status::Done);
    assert_eq!(st.change_status(&b), Status::Done);
    assert!(f.backend.container(DATA_DEV).recovery.contains_key("a-recovery"));
    assert!(f.backend.container(SAVE_DEV).recovery.contains_key("b-recovery"));
}

#[tokio::test(flavor = "multi_thread")]
async fn remove_keys_retry_skips_removed_slots() {
    let f = Fixture::new();
    f.backend.fail("delete_key:default-fallback", "device busy");
    let refs = data_refs();

    let first = {
        let mut st = f.state.lock();
        queue_task(&mut st, REMOVE_KEYS_KIND, |t| t.set(KEYSLOTS_ATTR, &refs).unwrap())
    };
    f.settle().await;
    {
        let st = f.state.lock();
        assert_eq!(st.change_status(&first), Status::Error);
    }

    f.backend.clear_failures();
    let second = {
        let mut st = f.state.lock();
        queue_task(&mut st, REMOVE_KEYS_KIND, |t| t.set(KEYSLOTS_ATTR, &refs).unwrap())
    };
    f.settle().await;

    let st = f.state.lock();
    assert_eq!(st.change_status(&second), Status::Done, "{:?}", st.change_err(&second));
    assert!(f.backend.container(DATA_DEV).platform.is_empty());
    assert_eq!(count_calls(&f, "delete_key:default"), 1);
    // one failed and one successful call
    assert_eq!(count_calls(&f, "delete_key:default-fallback"), 2);
}

fn renamed_slots_backend() -> FakeBackend {
    let backend = FakeBackend::with_default_slots();
    let mut data = backend.container(DATA_DEV);
    data.platform.insert("new-a".to_string(), tpm_key_data("run+recover"));
    data.platform.insert("new-b".to_string(), tpm_key_data("recover"));
    backend.set_container(DATA_DEV, data);
    backend
}

fn rename_setup(task: &mut Task) {
    let refs = vec![
        KeyslotRef::new(SYSTEM_DATA, "new-a"),
        KeyslotRef::new(SYSTEM_DATA, "new-b"),
    ];
    let renames: BTreeMap<String, String> = refs
        .iter()
        .zip(["final-a", "final-b"])
        .map(|(r, name)| (r.to_string(), name.to_string()))
        .collect();
    task.set(KEYSLOTS_ATTR, &refs).unwrap();
    task.set(RENAMES_ATTR, &renames).unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn rename_keys_retry_skips_renamed_slots() {
    let f = Fixture::with_backend(renamed_slots_backend(), |_| {});
    f.backend.fail("rename_key:new-b", "device busy");

    let first = {
        let mut st = f.state.lock();
        queue_task(&mut st, RENAME_KEYS_KIND, rename_setup)
    };
    f.settle().await;
    {
        let st = f.state.lock();
        assert_eq!(st.change_status(&first), Status::Error);
    }

    f.backend.clear_failures();
    let second = {
        let mut st = f.state.lock();
        queue_task(&mut st, RENAME_KEYS_KIND, rename_setup)
    };
    f.settle().await;

    let st = f.state.lock();
    assert_eq!(st.change_status(&second), Status::Done, "{:?}", st.change_err(&second));
    let data = f.backend.container(DATA_DEV);
    assert!(data.platform.contains_key("final-a"));
    assert!(data.platform.contains_key("final-b"));
    assert!(!data.platform.contains_key("new-a"));
    assert_eq!(count_calls(&f, "rename_key:new-a"), 1);
    assert_eq!(count_calls(&f, "rename_key:new-b"), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn rename_keys_fails_when_source_and_target_are_missing() {
    let f = Fixture::new();
    let change = {
        let mut st = f.state.lock();
        queue_task(&mut st, RENAME_KEYS_KIND, rename_setup)
    };
    f.settle().await;

    let st = f.state.lock();
    assert_eq!(st.change_status(&change), Status::Error);
    assert_eq!(
        st.change_err(&change).unwrap(),
        "cannot perform the following tasks:\n- Key slot task (key slot reference (container-role: \"system-data\", name: \"new-a\") not found)"
    );
    assert_eq!(count_calls(&f, "rename_key:new-a"), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn add_recovery_keys_with_existing_slots_drops_cached_key() {
    let f = Fixture::new();
    let (_, key_id) = f.manager.generate_recovery_key().unwrap();
    let change = {
        let mut st = f.state.lock();
        queue_task(&mut st, ADD_RECOVERY_KEYS_KIND, |t| {
            t.set(KEYSLOTS_ATTR, &[KeyslotRef::new(SYSTEM_DATA, "default-recovery")])
                .unwrap();
            t.set(RECOVERY_KEY_ID_ATTR, &key_id).unwrap();
        })
    };
    f.settle().await;

    let st = f.state.lock();
    assert_eq!(st.change_status(&change), Status::Done);
    assert!(!f
        .backend
        .calls()
        .iter()
        .any(|c| c.starts_with("add_recovery_key:")));
    let err = f.manager.get_recovery_key(&key_id).unwrap_err();
    assert_eq!(err.to_string(), "no recovery key entry for key-id");
}

#[tokio::test(flavor = "multi_thread")]
async fn change_passphrase_rechecks_slots_before_writing() {
    let f = Fixture::with_backend(passphrase_backend(), |_| {});
    let change = {
        let mut st = f.state.lock();
        let ts = f
            .manager
            .change_auth(&mut st, AuthMode::Passphrase, "old", "new", &data_refs())
            .unwrap();
        add_change(&mut st, CHANGE_PASSPHRASE_CHANGE_KIND, &ts)
    };
    // the fallback slot lost its passphrase in the meantime
    let mut data = f.backend.container(DATA_DEV);
    data.platform
        .insert("default-fallback".to_string(), tpm_key_data("recover"));
    f.backend.set_container(DATA_DEV, data);
    f.settle().await;

    let st = f.state.lock();
    assert_eq!(st.change_status(&change), Status::Error);
    assert!(st.change_err(&change).unwrap().contains(
        r#"invalid key slot reference (container-role: "system-data", name: "default-fallback"): unsupported authentication mode "none", expected "passphrase""#
    ));
    assert!(!f
        .backend
        .calls()
        .iter()
        .any(|c| c.starts_with("write_key_data:")));
    assert_eq!(
        f.backend.container(DATA_DEV).platform["default"].sealed,
        b"old".to_vec()
    );
}
