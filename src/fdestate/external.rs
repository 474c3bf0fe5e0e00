use serde::{Deserialize, Serialize};

use super::{base64_bytes, with_fde_state, FdeState};
use crate::error::FdeError;
use crate::external_fsm::{transition, ExternalAction, ExternalOperationStatus};
use crate::state::StateData;
use crate::Result;

/// Durable record of an operation driven by an actor outside this process.
/// An operation is identified by its kind and change id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalOperation {
    pub kind: String,
    #[serde(rename = "change-id")]
    pub change_id: String,
    #[serde(default, with = "base64_bytes")]
    pub context: Vec<u8>,
    pub status: ExternalOperationStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub err: String,
}

impl ExternalOperation {
    /// New operation in `Preparing` status.
    pub fn new(kind: impl Into<String>, change_id: impl Into<String>, context: Vec<u8>) -> Self {
        Self {
            kind: kind.into(),
            change_id: change_id.into(),
            context,
            status: ExternalOperationStatus::Preparing,
            err: String::new(),
        }
    }

    /// Identity comparison, ignores context and status.
    pub fn same_as(&self, other: &ExternalOperation) -> bool {
        self.kind == other.kind && self.change_id == other.change_id
    }

    pub fn is_ready(&self) -> bool {
        self.status.is_ready()
    }

    /// Moves the operation along the status machine.
    pub fn apply(&mut self, action: ExternalAction) -> Result<()> {
        let next = transition(self.status, action).ok_or_else(|| {
            FdeError::internal(format!(
                "external operation {:?} for change {} cannot handle {action:?} in status {}",
                self.kind, self.change_id, self.status
            ))
        })?;
        self.status = next;
        Ok(())
    }

    /// Marks the operation failed with `reason`, from whatever status it is
    /// in.
    pub fn set_failed(&mut self, reason: impl Into<String>) {
        self.status = ExternalOperationStatus::Error;
        self.err = reason.into();
    }
}

pub fn add_external_operation(st: &mut StateData, op: ExternalOperation) -> Result<()> {
    with_fde_state(st, |fde| {
        if fde.pending_external_operations.iter().any(|o| o.same_as(&op)) {
            return Err(FdeError::internal(format!(
                "external operation {:?} for change {} already exists",
                op.kind, op.change_id
            )));
        }
        fde.pending_external_operations.push(op);
        Ok(())
    })
}

pub fn update_external_operation(st: &mut StateData, op: &ExternalOperation) -> Result<()> {
    with_fde_state(st, |fde| {
        let slot = fde
            .pending_external_operations
            .iter_mut()
            .find(|o| o.same_as(op))
            .ok_or_else(|| {
                FdeError::internal(format!(
                    "cannot find external operation {:?} for change {}",
                    op.kind, op.change_id
                ))
            })?;
        *slot = op.clone();
        Ok(())
    })
}

fn operations(st: &StateData) -> Result<Vec<ExternalOperation>> {
    Ok(FdeState::load(st)?
        .map(|fde| fde.pending_external_operations)
        .unwrap_or_default())
}

/// First operation of `kind` that has not reached a final status.
pub fn find_first_pending_external_operation_by_kind(
    st: &StateData,
    kind: &str,
) -> Result<Option<ExternalOperation>> {
    Ok(operations(st)?
        .into_iter()
        .find(|op| op.kind == kind && !op.is_ready()))
}

pub fn find_first_external_operation_by_change_id(
    st: &StateData,
    change_id: &str,
) -> Result<Option<ExternalOperation>> {
    Ok(operations(st)?
        .into_iter()
        .find(|op| op.change_id == change_id))
}

/// Drops every operation of the change. Returns whether anything was
/// removed.
pub fn remove_external_operation_by_change_id(st: &mut StateData, change_id: &str) -> Result<bool> {
    if FdeState::load(st)?.is_none() {
        return Ok(false);
    }
    with_fde_state(st, |fde| {
        let before = fde.pending_external_operations.len();
        fde.pending_external_operations
            .retain(|op| op.change_id != change_id);
        Ok(before != fde.pending_external_operations.len())
    })
}
