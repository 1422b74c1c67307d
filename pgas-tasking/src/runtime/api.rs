//! Tasking API for code running under a runtime.
//!
//! Every function here works both on the thread that built the [`Runtime`]
//! and inside a task, on whichever worker it currently runs. Calls made
//! without an active runtime fail with [`TaskingError::NoRuntime`].
//!
//! [`Runtime`]: crate::Runtime
use crate::context::{self, Suspend};
use crate::errors::TaskingError;
use crate::runtime::TaskSummary;
use crate::task::{Dependency, Phase, TaskId};
use crate::transport::{TeamId, Transport, TransportHandle, UnitId};
use std::sync::Arc;

/// Creates a task that runs `body` once all `deps` are satisfied and its
/// phase is runnable.
///
/// The task belongs to the current phase. Created inside a running task, it
/// becomes a child of that task. Blocks transparently while the task pool is
/// full.
///
/// # Example
///
/// ```no_run
/// use pgas_tasking::{Dependency, GlobalRef, UnitId};
///
/// let rt = pgas_tasking::Runtime::init()?;
/// let loc = GlobalRef::new(UnitId(0), 0, 0);
///
/// pgas_tasking::create_task(|| Ok(()), &[Dependency::write(loc)])?;
/// pgas_tasking::create_task(|| Ok(()), &[Dependency::read(loc)])?;
///
/// let summary = pgas_tasking::task_complete()?;
/// assert_eq!(summary.completed, 2);
/// rt.fini();
/// # Ok::<(), pgas_tasking::TaskingError>(())
/// ```
pub fn create_task<F>(body: F, deps: &[Dependency]) -> Result<TaskId, TaskingError>
where
    F: FnOnce() -> anyhow::Result<()> + Send + 'static,
{
    context::scheduler()?.create_task(Box::new(body), deps)
}

/// Waits until every task created so far has retired.
///
/// Inside a task, only that task's children are awaited and the returned
/// summary is empty. On the thread owning the runtime, all phases up to the
/// current one are released and, in a team of several units, the phase is
/// resynchronized with `TEAM_ALL` first. This makes it a collective call.
pub fn task_complete() -> Result<TaskSummary, TaskingError> {
    context::scheduler()?.drain(true)
}

/// Same as [`task_complete`], without the collective resync.
pub fn task_complete_local() -> Result<TaskSummary, TaskingError> {
    context::scheduler()?.drain(false)
}

/// Suspends the calling task until all `handles` complete.
///
/// If a transfer fails, the calling task is failed and does not return from
/// this call; a cooperative abort is broadcast to the team.
pub fn wait_handle(handles: &[TransportHandle]) -> Result<(), TaskingError> {
    context::scheduler()?.wait_handle(handles)
}

/// Lets `handles` complete in the background. The calling task retires only
/// once they did.
pub fn detach_handle(handles: &[TransportHandle]) -> Result<(), TaskingError> {
    context::scheduler()?.detach_handle(handles);
    Ok(())
}

/// Re-queues the calling task behind every task already runnable.
///
/// Outside of a task, runs one runnable task if there is any.
pub fn yield_now() {
    if context::in_task() {
        context::suspend(Suspend::Yield);
        return;
    }

    if let Some(scheduler) = context::try_scheduler() {
        match scheduler.steal_task() {
            Some(task) => scheduler.run_task(task),
            None => scheduler.progress(),
        }
    }
}

/// Returns true while a cancellation is in progress. Long running task bodies
/// should check it periodically.
pub fn should_abort() -> bool {
    context::try_scheduler().is_some_and(|s| s.cancel.should_abort())
}

/// Cancels all tasks on every unit of the team.
///
/// Inside a task, the calling task is unwound and this never returns.
pub fn cancel_bcast() -> Result<(), TaskingError> {
    context::scheduler()?.cancel_bcast();
    Ok(())
}

/// Collective variant of [`cancel_bcast`]: returns once every unit entered
/// it. Calling it again in the same cancellation is a no-op.
///
/// Inside a task, the calling task is unwound and this never returns.
pub fn cancel_barrier() -> Result<(), TaskingError> {
    context::scheduler()?.cancel_barrier()
}

/// Moves to the next phase and returns it.
pub fn phase_advance() -> Result<Phase, TaskingError> {
    Ok(context::scheduler()?.phase_advance())
}

/// Allows tasks of every phase up to `phase` to run.
pub fn phase_set_runnable(phase: Phase) -> Result<(), TaskingError> {
    context::scheduler()?.phase_set_runnable(phase);
    Ok(())
}

/// Aligns the phase of every unit of `team` on their maximum and exchanges
/// remote dependency announcements. Collective.
pub fn phase_resync(team: TeamId) -> Result<Phase, TaskingError> {
    context::scheduler()?.phase_resync(team)
}

pub fn current_phase() -> Result<Phase, TaskingError> {
    Ok(context::scheduler()?.phases.current())
}

pub fn my_unit() -> Result<UnitId, TaskingError> {
    Ok(context::scheduler()?.my_unit)
}

/// The transport the runtime was built with, for issuing transfers.
pub fn transport() -> Result<Arc<dyn Transport>, TaskingError> {
    Ok(Arc::clone(&context::scheduler()?.transport))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_runtime() {
        assert!(matches!(task_complete(), Err(TaskingError::NoRuntime)));
        assert!(matches!(
            create_task(|| Ok(()), &[]),
            Err(TaskingError::NoRuntime)
        ));
        assert!(matches!(phase_advance(), Err(TaskingError::NoRuntime)));
        assert!(!should_abort());

        // No-op without a runtime.
        yield_now();
    }
}
