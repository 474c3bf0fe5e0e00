use rust_fsm::*;
use serde::{Deserialize, Serialize};
use std::fmt;

state_machine! {
    external_flow(Default)

    Default(Create) => Preparing,
    Default(HydrateDoing) => Doing,
    Default(HydrateCompleting) => Completing,
    Default(HydrateAborting) => Aborting,
    Default(HydrateDone) => Done,
    Default(HydrateError) => Error,

    Preparing(Prepared) => Doing,
    Preparing(Fail) => Error,

    Doing(Complete) => Completing,
    Doing(Abort) => Aborting,
    Doing(Fail) => Error,

    Completing(Finish) => Done,
    Completing(Fail) => Error,

    Aborting(Fail) => Error,

    Error(Fail) => Error
}

/// Lifecycle of an operation driven by an external actor. `Done` and
/// `Error` are final.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExternalOperationStatus {
    #[default]
    Default,
    Preparing,
    Doing,
    Completing,
    Aborting,
    Done,
    Error,
}

impl ExternalOperationStatus {
    pub fn is_ready(self) -> bool {
        matches!(
            self,
            ExternalOperationStatus::Done | ExternalOperationStatus::Error
        )
    }
}

impl fmt::Display for ExternalOperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExternalOperationStatus::Default => "Default",
            ExternalOperationStatus::Preparing => "Preparing",
            ExternalOperationStatus::Doing => "Doing",
            ExternalOperationStatus::Completing => "Completing",
            ExternalOperationStatus::Aborting => "Aborting",
            ExternalOperationStatus::Done => "Done",
            ExternalOperationStatus::Error => "Error",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExternalAction {
    Create,
    Prepared,
    Complete,
    Abort,
    Finish,
    Fail,
}

fn hydrate(
    machine: &mut external_flow::StateMachine,
    status: ExternalOperationStatus,
) -> Result<(), ()> {
    let input = match status {
        ExternalOperationStatus::Default => return Ok(()),
        ExternalOperationStatus::Preparing => external_flow::Input::Create,
        ExternalOperationStatus::Doing => external_flow::Input::HydrateDoing,
        ExternalOperationStatus::Completing => external_flow::Input::HydrateCompleting,
        ExternalOperationStatus::Aborting => external_flow::Input::HydrateAborting,
        ExternalOperationStatus::Done => external_flow::Input::HydrateDone,
        ExternalOperationStatus::Error => external_flow::Input::HydrateError,
    };
    machine.consume(&input).map_err(|_| ())?;
    Ok(())
}

fn expected_next_status(
    current: ExternalOperationStatus,
    action: ExternalAction,
) -> Option<ExternalOperationStatus> {
    use ExternalAction as A;
    use ExternalOperationStatus as S;
    match (current, action) {
        (S::Default, A::Create) => Some(S::Preparing),
        (S::Preparing, A::Prepared) => Some(S::Doing),
        (S::Doing, A::Complete) => Some(S::Completing),
        (S::Doing, A::Abort) => Some(S::Aborting),
        (S::Completing, A::Finish) => Some(S::Done),
        (S::Preparing | S::Doing | S::Completing | S::Aborting | S::Error, A::Fail) => {
            Some(S::Error)
        }
        _ => None,
    }
}

/// Status reached by applying `action` in `current`, `None` when the
/// transition is not allowed.
pub fn transition(
    current: ExternalOperationStatus,
    action: ExternalAction,
) -> Option<ExternalOperationStatus> {
    let mut machine = external_flow::StateMachine::new();
    hydrate(&mut machine, current).ok()?;

    let input = match action {
        ExternalAction::Create => external_flow::Input::Create,
        ExternalAction::Prepared => external_flow::Input::Prepared,
        ExternalAction::Complete => external_flow::Input::Complete,
        ExternalAction::Abort => external_flow::Input::Abort,
        ExternalAction::Finish => external_flow::Input::Finish,
        ExternalAction::Fail => external_flow::Input::Fail,
    };

    machine.consume(&input).ok()?;
    expected_next_status(current, action)
}
