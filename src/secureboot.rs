//! External EFI Secure Boot key database updates.
//!
//! An updater outside this process drives the update in three calls:
//! [`FdeManager::efi_secureboot_db_update_prepare`] before it writes the
//! database, [`FdeManager::efi_secureboot_db_update_cleanup`] once it is
//! done, or [`FdeManager::efi_secureboot_db_manager_startup`] when it
//! restarted and lost track of an update in flight. Each call is backed by
//! a change with a prepare task and an update task. The update task stays
//! blocked until the external operation is completing or aborting.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::conflicts::EFI_DB_UPDATE_CHANGE_KIND;
use crate::error::{ChangeConflictError, FdeError};
use crate::external_fsm::{ExternalAction, ExternalOperationStatus};
use crate::fdestate::{
    add_external_operation, base64_bytes, find_first_external_operation_by_change_id,
    find_first_pending_external_operation_by_kind, remove_external_operation_by_change_id,
    update_external_operation, ExternalOperation,
};
use crate::handlers::current_task;
use crate::interfaces::sealing::{ResealOptions, ResealRequest, SealingMethod};
use crate::manager::FdeManager;
use crate::state::{HandlerContext, StateData, StateGuard, Status, TaskRunner, TaskSet};
use crate::Result;

pub const PREPARE_TASK_KIND: &str = "efi-secureboot-db-update-prepare";
pub const UPDATE_TASK_KIND: &str = "efi-secureboot-db-update";

const ABORTED_REASON: &str =
    "aborted explicitly or due to timeout waiting for subsequent request from the caller";
const STARTUP_REASON: &str = "'startup' action invoked while an operation is in progress";

/// Secure Boot key database targeted by an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EfiSecurebootDb {
    #[serde(rename = "PK")]
    Pk,
    #[serde(rename = "KEK")]
    Kek,
    #[serde(rename = "DB")]
    Db,
    #[serde(rename = "DBX")]
    Dbx,
}

impl fmt::Display for EfiSecurebootDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EfiSecurebootDb::Pk => "PK",
            EfiSecurebootDb::Kek => "KEK",
            EfiSecurebootDb::Db => "DB",
            EfiSecurebootDb::Dbx => "DBX",
        };
        f.write_str(name)
    }
}

/// Context stored with the external operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct UpdateContext {
    #[serde(with = "base64_bytes")]
    payload: Vec<u8>,
    #[serde(rename = "sealing-method")]
    method: SealingMethod,
    db: EfiSecurebootDb,
}

impl UpdateContext {
    fn decode(op: &ExternalOperation) -> Result<Self> {
        serde_json::from_slice(&op.context).map_err(|e| {
            FdeError::runtime(format!(
                "cannot unmarshal context data of external operation for change {}: {e}",
                op.change_id
            ))
        })
    }
}

pub(crate) fn register(manager: &Arc<FdeManager>, runner: &TaskRunner) {
    let m = Arc::clone(manager);
    let undo = Arc::clone(manager);
    runner.add_handler(
        PREPARE_TASK_KIND,
        move |ctx: &HandlerContext| m.do_efi_db_update_prepare(ctx),
        Some(Arc::new(move |ctx: &HandlerContext| {
            undo.undo_efi_db_update_prepare(ctx)
        })),
    );
    let m = Arc::clone(manager);
    runner.add_handler(
        UPDATE_TASK_KIND,
        move |ctx: &HandlerContext| m.do_efi_db_update(ctx),
        None,
    );
    let m = Arc::clone(manager);
    runner.add_cleanup(PREPARE_TASK_KIND, move |ctx: &HandlerContext| {
        m.cleanup_efi_db_update(ctx)
    });

    runner.add_blocked(|st, task, _running| {
        if task.kind() != UPDATE_TASK_KIND {
            return false;
        }
        let Some(change_id) = task.change_id() else {
            return true;
        };
        match find_first_external_operation_by_change_id(st, change_id) {
            Ok(Some(op)) => !matches!(
                op.status,
                ExternalOperationStatus::Completing | ExternalOperationStatus::Aborting
            ),
            Ok(None) => true,
            Err(err) => {
                warn!(change_id, "cannot look up external operation: {err}");
                true
            }
        }
    });
}

fn op_for_change(st: &StateData, change_id: &str) -> Result<ExternalOperation> {
    find_first_external_operation_by_change_id(st, change_id)?.ok_or_else(|| {
        FdeError::internal(format!(
            "no matching external operation for change ID {change_id}"
        ))
    })
}

fn log_task(st: &mut StateData, ctx: &HandlerContext, message: String) {
    if let Some(task) = st.task_mut(ctx.task_id()) {
        task.logf(message);
    }
}

fn conflict(change_id: &str, message: String) -> FdeError {
    FdeError::ChangeConflict(ChangeConflictError {
        change_kind: EFI_DB_UPDATE_CHANGE_KIND.to_string(),
        change_id: Some(change_id.to_string()),
        message,
        ..Default::default()
    })
}

impl FdeManager {
    /// Reseals for the pending database update in `payload` and returns once
    /// the keys can be unlocked both before and after the update is applied.
    /// Systems without sealed keys have nothing to do.
    pub async fn efi_secureboot_db_update_prepare(
        &self,
        db: EfiSecurebootDb,
        payload: Vec<u8>,
    ) -> Result<()> {
        let Some(method) = self.sealed_keys_method()? else {
            debug!(%db, "no sealed keys, skipping EFI update preparation");
            return Ok(());
        };

        let (change_id, mut prepared, mut ready) = {
            let mut st = self.state().lock();
            if let Some(op) =
                find_first_pending_external_operation_by_kind(&st, EFI_DB_UPDATE_CHANGE_KIND)?
            {
                return Err(conflict(
                    &op.change_id,
                    format!("cannot start a new {db} update when conflicting actions are in progress"),
                ));
            }
            self.check_fde_change_conflict(&st)?;
            self.check_relevant_snaps_conflict(&st)?;

            let change_id = add_update_change(&mut st, method, db, payload)?;
            let prepared = self.signals().register(&change_id);
            let ready = st.ready_signal(&change_id);
            (change_id, prepared, ready)
        };
        info!(%db, change_id, "preparing for external EFI update");
        self.state().ensure_before();

        let prepared_ok = tokio::select! {
            biased;
            res = prepared.wait_for(|done| *done) => res.is_ok(),
            _ = ready.wait_for(|ready| *ready) => false,
        };
        if prepared_ok {
            return Ok(());
        }

        let mut st = self.state().lock();
        let err = st
            .change_err(&change_id)
            .unwrap_or_else(|| "change finished without completing preparation".to_string());
        if let Some(mut op) = find_first_external_operation_by_change_id(&st, &change_id)? {
            op.set_failed(format!("prepare task failed early: {err}"));
            update_external_operation(&mut st, &op)?;
        }
        Err(FdeError::runtime(format!("prepare change failed: {err}")))
    }

    /// Completes the pending update: reseals for the new database content
    /// and waits for the change to finish. Failures of the change are
    /// logged, not returned.
    pub async fn efi_secureboot_db_update_cleanup(&self) -> Result<()> {
        if self.sealed_keys_method()?.is_none() {
            return Ok(());
        }
        let change_id = {
            let mut st = self.state().lock();
            let Some(mut op) =
                find_first_pending_external_operation_by_kind(&st, EFI_DB_UPDATE_CHANGE_KIND)?
            else {
                debug!("no pending EFI update to clean up");
                return Ok(());
            };
            if op.status != ExternalOperationStatus::Doing {
                return Err(conflict(
                    &op.change_id,
                    "cannot perform Secureboot Key Database update 'cleanup' action when conflicting actions are in progress".to_string(),
                ));
            }
            op.apply(ExternalAction::Complete)?;
            update_external_operation(&mut st, &op)?;
            op.change_id
        };
        self.wait_for_update_change(&change_id).await
    }

    /// Aborts an update left in flight by a previous run of the external
    /// updater. The keys are resealed for the current database content.
    pub async fn efi_secureboot_db_manager_startup(&self) -> Result<()> {
        if self.sealed_keys_method()?.is_none() {
            return Ok(());
        }
        let change_id = {
            let mut st = self.state().lock();
            let Some(mut op) =
                find_first_pending_external_operation_by_kind(&st, EFI_DB_UPDATE_CHANGE_KIND)?
            else {
                debug!("no pending EFI update at startup");
                return Ok(());
            };
            if op.status != ExternalOperationStatus::Doing {
                return Err(conflict(
                    &op.change_id,
                    "cannot perform Secureboot Key Database 'startup' action when conflicting actions are in progress".to_string(),
                ));
            }
            op.apply(ExternalAction::Abort)?;
            op.err = STARTUP_REASON.to_string();
            update_external_operation(&mut st, &op)?;
            op.change_id
        };
        warn!(change_id, "aborting EFI update left in flight");
        self.wait_for_update_change(&change_id).await
    }

    async fn wait_for_update_change(&self, change_id: &str) -> Result<()> {
        let mut ready = {
            let mut st = self.state().lock();
            st.ready_signal(change_id)
        };
        self.state().ensure_before();
        // the sender lives in the state, it is never dropped before ready
        let _ = ready.wait_for(|ready| *ready).await;

        let st = self.state().lock();
        if let Some(err) = st.change_err(change_id) {
            debug!(change_id, "EFI update change failed: {err}");
        }
        Ok(())
    }

    fn reseal_for_update<'a>(
        &'a self,
        st: StateGuard<'a>,
        method: SealingMethod,
        options: ResealOptions,
        signature_db_update: Option<Vec<u8>>,
    ) -> (StateGuard<'a>, Result<()>) {
        let boot_chains = match self.boot().boot_chains(method) {
            Ok(chains) => chains,
            Err(err) => return (st, Err(err)),
        };
        let request = ResealRequest {
            method,
            boot_chains,
            options,
            signature_db_update,
        };
        self.reseal(st, &request)
    }

    /// Reseal for the database content now in effect, dropping policies
    /// that still accept the old content.
    fn post_update_reseal<'a>(
        &'a self,
        st: StateGuard<'a>,
        method: SealingMethod,
    ) -> (StateGuard<'a>, Result<()>) {
        let options = ResealOptions {
            expect_reseal: true,
            revoke_old_keys: true,
            ..Default::default()
        };
        self.reseal_for_update(st, method, options, None)
    }

    fn do_efi_db_update_prepare(&self, ctx: &HandlerContext) -> Result<()> {
        let mut st = ctx.state().lock();
        let change_id = ctx.change_id()?.to_string();
        let mut op = op_for_change(&st, &change_id)?;
        if op.status != ExternalOperationStatus::Preparing {
            return Err(FdeError::internal(format!(
                "external operation already in state {:?}, but expected {:?}",
                op.status.to_string(),
                ExternalOperationStatus::Preparing.to_string()
            )));
        }
        let update = UpdateContext::decode(&op)?;

        let (guard, result) = self.reseal_for_update(
            st,
            update.method,
            ResealOptions::default(),
            Some(update.payload),
        );
        st = guard;
        if let Err(err) = result {
            let err = FdeError::runtime(format!(
                "cannot perform initial reseal of keys for Secureboot Key Database update: {err}"
            ));
            op.set_failed(err.to_string());
            update_external_operation(&mut st, &op)?;
            return Err(err);
        }

        op.apply(ExternalAction::Prepared)?;
        update_external_operation(&mut st, &op)?;
        // done before the caller wakes up and asks for completion
        if let Some(task) = st.task_mut(ctx.task_id()) {
            task.set_status(Status::Done);
        }
        drop(st);
        self.signals().signal(&change_id);
        Ok(())
    }

    fn undo_efi_db_update_prepare(&self, ctx: &HandlerContext) -> Result<()> {
        let mut st = ctx.state().lock();
        let change_id = ctx.change_id()?.to_string();
        let mut op = op_for_change(&st, &change_id)?;
        log_task(
            &mut st,
            ctx,
            format!(
                "Secureboot Key Database prepare undo called with operation in status: {}",
                op.status
            ),
        );

        match op.status {
            ExternalOperationStatus::Error => {
                log_task(
                    &mut st,
                    ctx,
                    format!("action already in error state with error: {}", op.err),
                );
                Ok(())
            }
            ExternalOperationStatus::Doing | ExternalOperationStatus::Aborting => {
                let update = UpdateContext::decode(&op)?;
                let aborting = op.status == ExternalOperationStatus::Aborting;
                let (guard, result) = self.post_update_reseal(st, update.method);
                st = guard;
                match &result {
                    Err(err) => {
                        log_task(&mut st, ctx, format!("post update reseal failed: {err}"));
                        op.set_failed(format!(
                            "cannot perform post update reseal: {err}, while aborting explicitly or due to timeout waiting for subsequent request from the caller"
                        ));
                    }
                    Ok(()) => {
                        let reason = if aborting && !op.err.is_empty() {
                            op.err.clone()
                        } else {
                            ABORTED_REASON.to_string()
                        };
                        op.set_failed(reason);
                    }
                }
                update_external_operation(&mut st, &op)?;
                log_task(
                    &mut st,
                    ctx,
                    format!("external action state updated to {}: {}", op.status, op.err),
                );
                result.map_err(|e| FdeError::runtime(format!("cannot complete reseal in undo: {e}")))
            }
            other => Err(FdeError::internal(format!(
                "unexpected state of external action in undo handler: {other}"
            ))),
        }
    }

    fn do_efi_db_update(&self, ctx: &HandlerContext) -> Result<()> {
        let mut st = ctx.state().lock();
        let change_id = ctx.change_id()?.to_string();
        let mut op = op_for_change(&st, &change_id)?;
        match op.status {
            ExternalOperationStatus::Completing => {}
            ExternalOperationStatus::Aborting if op.err.is_empty() => {
                return Err(FdeError::runtime("aborted by external request"));
            }
            ExternalOperationStatus::Aborting => return Err(FdeError::runtime(op.err)),
            other => {
                return Err(FdeError::runtime(format!(
                    "cannot perform post update reseal, operation in status {other}"
                )))
            }
        }
        let update = UpdateContext::decode(&op)?;

        let (guard, result) = self.post_update_reseal(st, update.method);
        st = guard;
        match result {
            Err(err) => {
                let task = current_task(&st, ctx)?;
                warn!(task_id = task.id(), "post update reseal failed: {err}");
                op.set_failed(format!(
                    "cannot complete post update reseal: {err}, while completing due to external request"
                ));
                update_external_operation(&mut st, &op)?;
                Err(err)
            }
            Ok(()) => {
                op.apply(ExternalAction::Finish)?;
                update_external_operation(&mut st, &op)?;
                log_task(&mut st, ctx, "external EFI update completed".to_string());
                Ok(())
            }
        }
    }

    fn cleanup_efi_db_update(&self, ctx: &HandlerContext) -> Result<()> {
        let mut st = ctx.state().lock();
        let change_id = ctx.change_id()?;
        remove_external_operation_by_change_id(&mut st, change_id)?;
        self.signals().forget(change_id);
        Ok(())
    }
}

fn add_update_change(
    st: &mut StateData,
    method: SealingMethod,
    db: EfiSecurebootDb,
    payload: Vec<u8>,
) -> Result<String> {
    let prepare = st.new_task(PREPARE_TASK_KIND, &format!("Prepare for external EFI {db} update"));
    let update = st.new_task(UPDATE_TASK_KIND, &format!("Reseal after external EFI {db} update"));
    st.wait_for(&update, &prepare)?;

    let change_id = st.new_change(EFI_DB_UPDATE_CHANGE_KIND, &format!("External EFI {db} update"));
    st.add_all(&change_id, &TaskSet::new(vec![prepare, update]))?;

    let context = serde_json::to_vec(&UpdateContext {
        payload,
        method,
        db,
    })?;
    add_external_operation(
        st,
        ExternalOperation::new(EFI_DB_UPDATE_CHANGE_KIND, change_id.clone(), context),
    )?;
    Ok(change_id)
}
