use super::{
    errors::{StateMachineError, StateMachineResult},
    events::TaskEvent,
    states::TaskState,
};

/// Determine the target state based on current state and event.
///
/// Terminal states accept no events, so status can never move backward.
pub fn determine_target_state(
    current_state: TaskState,
    event: &TaskEvent,
) -> StateMachineResult<TaskState> {
    let target = match (current_state, event) {
        (TaskState::Pending, TaskEvent::Start) => TaskState::Running,

        (TaskState::Running, TaskEvent::Complete) => TaskState::Completed,
        (TaskState::Running, TaskEvent::CompleteWithErrors) => TaskState::CompletedWithErrors,

        // A task may fail before it ever starts (unknown connection, duplicate)
        (TaskState::Pending, TaskEvent::Fail(_)) => TaskState::Failed,
        (TaskState::Running, TaskEvent::Fail(_)) => TaskState::Failed,

        (from_state, _) => {
            return Err(StateMachineError::InvalidTransition {
                from: from_state.to_string(),
                event: event.event_type().to_string(),
            })
        }
    };

    Ok(target)
}

pub fn can_transition(current_state: TaskState, event: &TaskEvent) -> bool {
    determine_target_state(current_state, event).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_STATES: [TaskState; 5] = [
        TaskState::Pending,
        TaskState::Running,
        TaskState::Completed,
        TaskState::CompletedWithErrors,
        TaskState::Failed,
    ];

    fn all_events() -> Vec<TaskEvent> {
        vec![
            TaskEvent::Start,
            TaskEvent::Complete,
            TaskEvent::CompleteWithErrors,
            TaskEvent::Fail("boom".to_string()),
        ]
    }

    #[test]
    fn test_happy_path() {
        let running = determine_target_state(TaskState::Pending, &TaskEvent::Start).unwrap();
        assert_eq!(running, TaskState::Running);
        let done = determine_target_state(running, &TaskEvent::Complete).unwrap();
        assert_eq!(done, TaskState::Completed);
    }

    #[test]
    fn test_fail_from_pending_and_running() {
        let fail = TaskEvent::Fail("unreachable".to_string());
        assert_eq!(
            determine_target_state(TaskState::Pending, &fail).unwrap(),
            TaskState::Failed
        );
        assert_eq!(
            determine_target_state(TaskState::Running, &fail).unwrap(),
            TaskState::Failed
        );
    }

    #[test]
    fn test_start_is_not_repeatable() {
        let err = determine_target_state(TaskState::Running, &TaskEvent::Start).unwrap_err();
        assert!(matches!(err, StateMachineError::InvalidTransition { .. }));
    }

    #[test]
    fn test_pending_cannot_complete() {
        assert!(!can_transition(TaskState::Pending, &TaskEvent::Complete));
        assert!(!can_transition(
            TaskState::Pending,
            &TaskEvent::CompleteWithErrors
        ));
    }

    #[test]
    fn test_terminal_states_reject_every_event() {
        for state in ALL_STATES.iter().filter(|s| s.is_terminal()) {
            for event in all_events() {
                assert!(
                    !can_transition(*state, &event),
                    "{state} must not accept {}",
                    event.event_type()
                );
            }
        }
    }
}
