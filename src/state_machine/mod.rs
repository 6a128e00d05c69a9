// Task lifecycle state machine.
//
// Transitions are computed by a pure function over (state, event) so the same
// rules apply whether a task lives in memory or in PostgreSQL. Callers persist
// the resulting task immediately after every transition.

pub mod errors;
pub mod events;
pub mod states;
pub mod task_state_machine;

pub use errors::{StateMachineError, StateMachineResult};
pub use events::TaskEvent;
pub use states::TaskState;
pub use task_state_machine::{can_transition, determine_target_state};
