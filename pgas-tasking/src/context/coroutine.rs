use crate::task::TaskBody;
use crate::transport::HandleList;
use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};
use std::fmt;

/// Why a task handed control back to its worker.
#[derive(Debug)]
pub(crate) enum Suspend {
    /// Resume once every handle has completed.
    Wait(HandleList),

    /// Re-queue behind other runnable work.
    Yield,

    /// Resume once all children of the task have retired.
    WaitChildren,

    /// Unwind the task, it must not continue.
    Abort,
}

pub(crate) type TaskYielder = Yielder<(), Suspend>;

pub(crate) type TaskExit = anyhow::Result<()>;

/// An executable context: a pooled stack plus the saved machine state of the
/// task running on it.
pub(crate) struct TaskContext {
    co: Coroutine<(), Suspend, TaskExit, DefaultStack>,
}

// Safety: the coroutine only ever runs a `Send` body, and the runtime code on
// its stack re-reads thread-locals after every switch, so moving a suspended
// context to another worker is sound.
unsafe impl Send for TaskContext {}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("started", &self.co.started())
            .field("done", &self.co.done())
            .finish()
    }
}

impl TaskContext {
    pub(super) fn new(stack: DefaultStack, body: TaskBody) -> Self {
        let co = Coroutine::with_stack(stack, move |yielder: &TaskYielder, ()| {
            super::set_current_yielder(yielder);
            body()
        });

        Self { co }
    }

    /// Switches to the task until it suspends or returns. Panics raised by the
    /// task propagate to the caller.
    pub(crate) fn resume(&mut self) -> CoroutineResult<Suspend, TaskExit> {
        self.co.resume(())
    }

    pub(crate) fn is_suspended(&self) -> bool {
        self.co.started() && !self.co.done()
    }

    /// Unwinds a suspended task, running the destructors on its stack, and
    /// returns the stack. A task that never ran only drops its body.
    pub(super) fn into_stack(mut self) -> DefaultStack {
        if !self.co.done() {
            self.co.force_unwind();
        }
        self.co.into_stack()
    }
}
