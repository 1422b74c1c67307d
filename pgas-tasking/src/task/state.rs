use crate::errors::invariant_violation;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle state of a task descriptor.
///
/// `Complete` and `Cancelled` are terminal: once reached, the descriptor is
/// only ever recycled, never moved back to a live state.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    Created = 0,
    Blocked = 1,
    Runnable = 2,
    Running = 3,
    Suspended = 4,
    Cancelled = 5,
    Complete = 6,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Cancelled | TaskState::Complete)
    }

    /// Not yet handed to a worker.
    pub fn is_pending(self) -> bool {
        matches!(self, TaskState::Created | TaskState::Blocked)
    }

    fn from_u8(val: u8) -> Self {
        match val {
            0 => TaskState::Created,
            1 => TaskState::Blocked,
            2 => TaskState::Runnable,
            3 => TaskState::Running,
            4 => TaskState::Suspended,
            5 => TaskState::Cancelled,
            6 => TaskState::Complete,
            other => invariant_violation(format!("corrupt task state {other}")),
        }
    }
}

/// Task state readable without holding the descriptor lock.
///
/// Writers always hold the descriptor lock; lock-free readers (statistics,
/// cancellation sweep) only get a snapshot.
#[derive(Debug)]
pub(crate) struct AtomicTaskState(AtomicU8);

impl AtomicTaskState {
    pub(crate) fn new(state: TaskState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub(crate) fn load(&self) -> TaskState {
        TaskState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Moves to `next`. Leaving a terminal state is a bug.
    #[track_caller]
    pub(crate) fn set(&self, next: TaskState) {
        let prev = TaskState::from_u8(self.0.swap(next as u8, Ordering::AcqRel));
        if prev.is_terminal() {
            invariant_violation(format!("task transition out of terminal state {prev:?} to {next:?}"));
        }
    }

    /// Puts a recycled descriptor back in `Created` for its next generation.
    pub(crate) fn reset(&self) {
        self.0.store(TaskState::Created as u8, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::created(TaskState::Created, false, true)]
    #[case::blocked(TaskState::Blocked, false, true)]
    #[case::runnable(TaskState::Runnable, false, false)]
    #[case::running(TaskState::Running, false, false)]
    #[case::suspended(TaskState::Suspended, false, false)]
    #[case::cancelled(TaskState::Cancelled, true, false)]
    #[case::complete(TaskState::Complete, true, false)]
    fn test_state_classes(#[case] state: TaskState, #[case] terminal: bool, #[case] pending: bool) {
        assert_eq!(state.is_terminal(), terminal);
        assert_eq!(state.is_pending(), pending);
        assert_eq!(TaskState::from_u8(state as u8), state);
    }

    #[test]
    fn test_transitions_and_reset() {
        let state = AtomicTaskState::new(TaskState::Created);
        for next in [
            TaskState::Blocked,
            TaskState::Runnable,
            TaskState::Running,
            TaskState::Suspended,
            TaskState::Runnable,
            TaskState::Running,
            TaskState::Complete,
        ] {
            state.set(next);
            assert_eq!(state.load(), next);
        }

        state.reset();
        assert_eq!(state.load(), TaskState::Created);
    }
}
