use crate::error::{ChangeConflictError, FdeError};
use crate::keyslots::KeyslotRef;
use crate::state::{StateData, Task};
use crate::Result;

pub const EFI_DB_UPDATE_CHANGE_KIND: &str = "fde-efi-secureboot-db-update";
pub const REPLACE_RECOVERY_KEY_CHANGE_KIND: &str = "fde-replace-recovery-key";
pub const REPLACE_PLATFORM_KEY_CHANGE_KIND: &str = "fde-replace-platform-key";
pub const CHANGE_PASSPHRASE_CHANGE_KIND: &str = "fde-change-passphrase";
pub const CHANGE_PIN_CHANGE_KIND: &str = "fde-change-pin";

/// Task data attribute listing the key slots a task touches.
pub const KEYSLOTS_ATTR: &str = "keyslots";
/// Task data attributes naming the snaps a task operates on.
pub const SNAP_NAME_ATTR: &str = "snap-name";
pub const SNAP_NAMES_ATTR: &str = "snap-names";

const FDE_TASK_PREFIX: &str = "fde-";

pub fn is_fde_task(task: &Task) -> bool {
    task.kind().starts_with(FDE_TASK_PREFIX)
}

fn action_in_progress(change_kind: &str) -> Option<&'static str> {
    match change_kind {
        EFI_DB_UPDATE_CHANGE_KIND => Some("external EFI DBX update"),
        REPLACE_RECOVERY_KEY_CHANGE_KIND => Some("replacing recovery key"),
        REPLACE_PLATFORM_KEY_CHANGE_KIND => Some("replacing platform key"),
        CHANGE_PASSPHRASE_CHANGE_KIND => Some("changing passphrase"),
        CHANGE_PIN_CHANGE_KIND => Some("changing PIN"),
        _ => None,
    }
}

/// Fails when a change that operates on FDE state is still in flight,
/// either by its kind or because it carries an `fde-*` task.
pub fn check_fde_change_conflict(st: &StateData) -> Result<()> {
    for change in st.changes() {
        if st.is_change_ready(change.id()) {
            continue;
        }
        let action = match action_in_progress(change.kind()) {
            Some(action) => action,
            None if st.change_tasks(change.id()).iter().any(|t| is_fde_task(t)) => "FDE change",
            None => continue,
        };
        return Err(ChangeConflictError {
            change_kind: change.kind().to_string(),
            change_id: Some(change.id().to_string()),
            message: format!(
                "{action} in progress, no other FDE changes allowed until this is done"
            ),
            ..Default::default()
        }
        .into());
    }
    Ok(())
}

/// Fails when a pending task already targets one of `refs`.
pub fn check_keyslots_conflict(st: &StateData, refs: &[KeyslotRef]) -> Result<()> {
    for task in st.tasks() {
        if task.status().is_ready() || !task.has(KEYSLOTS_ATTR) {
            continue;
        }
        let Some(change_id) = task.change_id() else {
            continue;
        };
        if st.is_change_ready(change_id) {
            continue;
        }
        let busy: Vec<KeyslotRef> = task.get(KEYSLOTS_ATTR)?.unwrap_or_default();
        if let Some(hit) = refs.iter().find(|r| busy.contains(r)) {
            let change_kind = st
                .change(change_id)
                .map(|c| c.kind().to_string())
                .unwrap_or_default();
            return Err(ChangeConflictError {
                change_kind,
                change_id: Some(change_id.to_string()),
                keyslot_ref: Some(hit.clone()),
                ..Default::default()
            }
            .into());
        }
    }
    Ok(())
}

/// Snaps a task declares in its data.
pub fn declared_snaps(task: &Task) -> Result<Vec<String>> {
    let mut snaps: Vec<String> = task.get(SNAP_NAMES_ATTR)?.unwrap_or_default();
    if let Some(single) = task.get::<String>(SNAP_NAME_ATTR)? {
        snaps.push(single);
    }
    Ok(snaps)
}

/// Fails when a pending change other than `ignore_change` operates on one
/// of `snaps`. `affected` reports the snaps a task affects.
pub fn check_snaps_conflict(
    st: &StateData,
    snaps: &[String],
    ignore_change: Option<&str>,
    affected: &dyn Fn(&Task) -> Result<Vec<String>>,
) -> Result<()> {
    if snaps.is_empty() {
        return Ok(());
    }
    for change in st.changes() {
        if Some(change.id()) == ignore_change || st.is_change_ready(change.id()) {
            continue;
        }
        for task in st.change_tasks(change.id()) {
            if task.status().is_ready() {
                continue;
            }
            if let Some(snap) = affected(task)?.into_iter().find(|s| snaps.contains(s)) {
                return Err(FdeError::ChangeConflict(ChangeConflictError {
                    change_kind: change.kind().to_string(),
                    change_id: Some(change.id().to_string()),
                    snap: Some(snap),
                    ..Default::default()
                }));
            }
        }
    }
    Ok(())
}
