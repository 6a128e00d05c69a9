use thiserror::Error;

/// Errors raised when an operation is not valid for the task's current state
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StateMachineError {
    #[error("Invalid state transition from {from} on {event}")]
    InvalidTransition { from: String, event: String },

    #[error("Guard condition failed: {reason}")]
    GuardFailed { reason: String },
}

pub type StateMachineResult<T> = Result<T, StateMachineError>;

pub fn guard_failed(reason: impl Into<String>) -> StateMachineError {
    StateMachineError::GuardFailed {
        reason: reason.into(),
    }
}
