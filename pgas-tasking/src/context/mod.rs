//! Per-thread runtime context.
//!
//! Every thread participating in a runtime (its workers and the thread that
//! built it) carries a handle to the scheduler. Tasks run on coroutines that
//! may resume on a different worker than the one they suspended on, so every
//! accessor here re-reads thread-local storage on each call and nothing hands
//! out a borrow that could outlive a suspension point.
use crate::errors::{TaskingError, invariant_violation};
use crate::runtime::scheduler::Handle;
use crate::runtime::worker::Worker;
use crate::task::{TaskId, TaskRef};
use std::cell::{Cell, RefCell};
use std::ptr;
use std::rc::Rc;

mod coroutine;
pub(crate) use coroutine::{Suspend, TaskContext, TaskYielder};

pub(crate) mod store;
pub(crate) use store::{ContextStats, ContextStore};

struct ThreadContext {
    scheduler: Handle,

    /// Set on worker threads, `None` on the thread owning the runtime.
    worker: Option<Rc<Worker>>,
}

thread_local! {
    static CONTEXT: RefCell<Option<ThreadContext>> = const { RefCell::new(None) };

    static CURRENT_TASK: Cell<Option<(TaskRef, TaskId)>> = const { Cell::new(None) };

    static CURRENT_YIELDER: Cell<*const TaskYielder> = const { Cell::new(ptr::null()) };
}

pub(crate) fn init_root_context(scheduler: Handle) -> Result<(), TaskingError> {
    CONTEXT.with(|ctx| {
        let mut ctx = ctx.borrow_mut();
        if ctx.is_some() {
            return Err(TaskingError::AlreadyActive);
        }

        *ctx = Some(ThreadContext {
            scheduler,
            worker: None,
        });
        Ok(())
    })
}

pub(crate) fn init_worker_context(scheduler: Handle, worker: Rc<Worker>) {
    CONTEXT.with(|ctx| {
        *ctx.borrow_mut() = Some(ThreadContext {
            scheduler,
            worker: Some(worker),
        });
    });
}

pub(crate) fn clear_context() {
    // Drop outside of the borrow, the scheduler may be the last handle.
    let old = CONTEXT.with(|ctx| ctx.borrow_mut().take());
    drop(old);
}

#[inline(never)]
pub(crate) fn try_scheduler() -> Option<Handle> {
    CONTEXT.with(|ctx| ctx.borrow().as_ref().map(|c| c.scheduler.clone()))
}

/// Returns a clone of the scheduler handle of the current thread.
#[inline(never)]
pub(crate) fn scheduler() -> Result<Handle, TaskingError> {
    try_scheduler().ok_or(TaskingError::NoRuntime)
}

/// Runs `f` with the worker of the current thread. Returns `None` on threads
/// that are not workers. `f` must not suspend.
#[inline(never)]
pub(crate) fn with_worker<F, R>(f: F) -> Option<R>
where
    F: FnOnce(&Worker) -> R,
{
    CONTEXT.with(|ctx| ctx.borrow().as_ref()?.worker.as_deref().map(f))
}

#[inline(never)]
pub(crate) fn current_task() -> Option<(TaskRef, TaskId)> {
    CURRENT_TASK.with(|t| t.get())
}

pub(crate) fn in_task() -> bool {
    current_task().is_some()
}

/// Marks `task` as the task running on this thread until the guard drops.
pub(crate) struct TaskGuard {
    prev: Option<(TaskRef, TaskId)>,
}

pub(crate) fn enter_task(task: TaskRef, id: TaskId) -> TaskGuard {
    TaskGuard {
        prev: CURRENT_TASK.with(|t| t.replace(Some((task, id)))),
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        CURRENT_TASK.with(|t| t.set(self.prev));
        clear_current_yielder();
    }
}

#[inline(never)]
pub(super) fn set_current_yielder(yielder: &TaskYielder) {
    CURRENT_YIELDER.with(|y| y.set(yielder as *const TaskYielder));
}

#[inline(never)]
fn clear_current_yielder() {
    CURRENT_YIELDER.with(|y| y.set(ptr::null()));
}

#[inline(never)]
fn current_yielder() -> *const TaskYielder {
    CURRENT_YIELDER.with(|y| y.get())
}

/// Switches from the running task back to its worker.
///
/// Returns once a worker resumes the task, which is not necessarily the
/// thread that suspended it. Never returns for [`Suspend::Abort`].
#[inline(never)]
pub(crate) fn suspend(reason: Suspend) {
    let yielder = current_yielder();
    if yielder.is_null() {
        invariant_violation("suspend called outside of a task context");
    }

    // Safety: the yielder is owned by the coroutine currently executing on
    // this thread and lives as long as that coroutine.
    let yielder = unsafe { &*yielder };
    yielder.suspend(reason);

    // We may be running on another worker now.
    set_current_yielder(yielder);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_context_outside_runtime() {
        assert!(try_scheduler().is_none());
        assert!(matches!(scheduler(), Err(TaskingError::NoRuntime)));
        assert!(with_worker(|_| ()).is_none());
        assert!(!in_task());
    }

    #[test]
    fn test_task_guard_restores_previous() {
        let outer = (
            TaskRef {
                index: 1,
                generation: 0,
            },
            TaskId::next(),
        );
        let inner = (
            TaskRef {
                index: 2,
                generation: 0,
            },
            TaskId::next(),
        );

        {
            let _outer = enter_task(outer.0, outer.1);
            assert_eq!(current_task(), Some(outer));
            {
                let _inner = enter_task(inner.0, inner.1);
                assert_eq!(current_task(), Some(inner));
            }
            assert_eq!(current_task(), Some(outer));
        }

        assert_eq!(current_task(), None);
    }
}
