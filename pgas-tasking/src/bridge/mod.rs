//! Remote-completion bridge.
//!
//! Turns transport handles into task suspension: waiting tasks are parked on a
//! list that idle threads poll, tasks whose body finished with detached
//! handles are held back from retirement until the handles complete, and
//! incoming control messages are routed to the resolver and the cancellation
//! path.
use crate::context::{self, Suspend};
use crate::errors::{TaskingError, invariant_violation};
use crate::resolver::Announcement;
use crate::runtime::scheduler::{Outcome, Scheduler};
use crate::task::{TaskRef, TaskState};
use crate::transport::{HandleList, HandleStatus, TaskingMessage, TransportError, TransportHandle, UnitId};
use parking_lot::Mutex;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug)]
struct Waiter {
    task: TaskRef,
    handles: HandleList,
}

/// A task whose body is done but whose detached handles are still pending.
#[derive(Debug)]
struct Retiring {
    task: TaskRef,
    handles: HandleList,
    outcome: Outcome,
}

#[derive(Debug)]
pub(crate) struct Bridge {
    waiters: Mutex<Vec<Waiter>>,

    retiring: Mutex<Vec<Retiring>>,

    /// Handles detached outside of any task.
    orphans: Mutex<HandleList>,

    /// Serializes message handling, `phase_resync` holds it while it drains.
    messages: Mutex<()>,

    ticks: AtomicU64,
}

impl Bridge {
    pub(crate) fn new() -> Self {
        Self {
            waiters: Mutex::new(Vec::new()),
            retiring: Mutex::new(Vec::new()),
            orphans: Mutex::new(HandleList::new()),
            messages: Mutex::new(()),
            ticks: AtomicU64::new(0),
        }
    }

    /// Called by the worker once the task's context has switched out.
    pub(crate) fn add_waiter(&self, task: TaskRef, handles: HandleList) {
        self.waiters.lock().push(Waiter { task, handles });
    }

    pub(crate) fn add_retiring(&self, task: TaskRef, handles: HandleList, outcome: Outcome) {
        self.retiring.lock().push(Retiring {
            task,
            handles,
            outcome,
        });
    }

    pub(crate) fn has_orphans(&self) -> bool {
        !self.orphans.lock().is_empty()
    }

    /// Returns true while anything needs transport progress to move on.
    pub(crate) fn has_pending(&self) -> bool {
        !self.waiters.lock().is_empty()
            || !self.retiring.lock().is_empty()
            || !self.orphans.lock().is_empty()
    }

    pub(crate) fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }
}

fn split_by_status<T>(
    entries: Vec<T>,
    status: impl Fn(&T) -> HandleStatus,
) -> (Vec<T>, Vec<T>, Vec<T>) {
    let mut pending = Vec::new();
    let mut complete = Vec::new();
    let mut failed = Vec::new();

    for entry in entries {
        match status(&entry) {
            HandleStatus::Pending => pending.push(entry),
            HandleStatus::Complete => complete.push(entry),
            HandleStatus::Failed => failed.push(entry),
        }
    }

    (pending, complete, failed)
}

impl Scheduler {
    /// Drives the transport and everything waiting on it. Called by idle
    /// workers, on ticker events and by threads participating in a drain.
    pub(crate) fn progress(&self) {
        self.transport.progress();
        self.handle_messages();
        self.poll_waiters();
        self.poll_retiring();
        self.poll_orphans();
        self.retry_backlog();
        self.bridge.ticks.fetch_add(1, Ordering::Relaxed);
    }

    fn poll_waiters(&self) {
        let waiters = {
            let mut waiters = self.bridge.waiters.lock();
            if waiters.is_empty() {
                return;
            }
            mem::take(&mut *waiters)
        };

        if self.cancel.should_abort() {
            for waiter in waiters {
                self.retire(waiter.task, Outcome::Aborted);
            }
            return;
        }

        let (pending, complete, failed) =
            split_by_status(waiters, |w| self.transport.testall(&w.handles));

        if !pending.is_empty() {
            self.bridge.waiters.lock().extend(pending);
        }

        for waiter in complete {
            self.resume_waiter(waiter.task);
        }

        if !failed.is_empty() {
            for waiter in failed {
                tracing::error!(task = ?waiter.task, "transfer failed while task was waiting");
                self.retire(waiter.task, Outcome::Failed);
            }
            self.abort_on_transport_failure();
        }
    }

    fn resume_waiter(&self, task: TaskRef) {
        let Some(slot) = self.tasks.slot(task) else {
            return;
        };
        let Some(inner) = slot.lock(task) else {
            return;
        };

        if slot.state.load() != TaskState::Suspended || inner.context.is_none() {
            invariant_violation(format!("waiter {:?} is not suspended", inner.id));
        }

        slot.state.set(TaskState::Runnable);
        drop(inner);
        self.dispatch(task);
    }

    fn poll_retiring(&self) {
        let retiring = {
            let mut retiring = self.bridge.retiring.lock();
            if retiring.is_empty() {
                return;
            }
            mem::take(&mut *retiring)
        };

        if self.cancel.should_abort() {
            for entry in retiring {
                self.retire(entry.task, entry.outcome);
            }
            return;
        }

        let (pending, complete, failed) =
            split_by_status(retiring, |r| self.transport.testall(&r.handles));

        if !pending.is_empty() {
            self.bridge.retiring.lock().extend(pending);
        }

        for entry in complete {
            self.retire(entry.task, entry.outcome);
        }

        if !failed.is_empty() {
            for entry in failed {
                tracing::error!(task = ?entry.task, "detached transfer failed");
                self.retire(entry.task, Outcome::Failed);
            }
            self.abort_on_transport_failure();
        }
    }

    fn poll_orphans(&self) {
        let failed = {
            let mut orphans = self.bridge.orphans.lock();
            if orphans.is_empty() {
                return;
            }

            if self.cancel.should_abort() {
                orphans.clear();
                return;
            }

            let before = orphans.len();
            let mut failed = 0;
            orphans.retain(|h| match self.transport.test(h) {
                HandleStatus::Pending => true,
                HandleStatus::Complete => false,
                HandleStatus::Failed => {
                    failed += 1;
                    false
                }
            });

            tracing::trace!(retired = before - orphans.len(), "detached handles completed");
            failed
        };

        if failed > 0 {
            tracing::error!(failed, "detached transfer failed");
            self.abort_on_transport_failure();
        }
    }

    /// Blocks the caller until every handle completed.
    ///
    /// Inside a task the task is suspended and its worker moves on; on the
    /// thread owning the runtime the caller helps run tasks meanwhile.
    pub(crate) fn wait_handle(&self, handles: &[TransportHandle]) -> Result<(), TaskingError> {
        loop {
            match self.transport.testall(handles) {
                HandleStatus::Complete => return Ok(()),
                HandleStatus::Failed => {
                    if let Some((task, _)) = context::current_task()
                        && let Some(mut inner) = self.tasks.lock(task)
                    {
                        inner.failed = true;
                    }

                    self.abort_on_transport_failure();
                    self.unwind_current_task();

                    return Err(TransportError::Failed("transfer failed".to_string()).into());
                }
                HandleStatus::Pending if context::in_task() => {
                    context::suspend(Suspend::Wait(handles.iter().cloned().collect()));
                }
                HandleStatus::Pending => {
                    self.participate_until(|s| s.transport.testall(handles) != HandleStatus::Pending);
                }
            }
        }
    }

    fn unwind_current_task(&self) {
        if context::in_task() {
            context::suspend(Suspend::Abort);
            invariant_violation("failed task was resumed");
        }
    }

    /// Lets the caller continue while `handles` complete in the background.
    /// They count toward the retirement of the calling task, or toward the
    /// root-level drain outside of a task.
    pub(crate) fn detach_handle(&self, handles: &[TransportHandle]) {
        let pending = handles
            .iter()
            .filter(|h| self.transport.test(h) != HandleStatus::Complete)
            .cloned()
            .collect::<HandleList>();

        if pending.is_empty() {
            return;
        }

        if let Some((task, _)) = context::current_task()
            && let Some(mut inner) = self.tasks.lock(task)
        {
            inner.detached.extend(pending);
            return;
        }

        self.bridge.orphans.lock().extend(pending);
    }

    /// Handles queued messages unless another thread already is.
    pub(crate) fn handle_messages(&self) {
        if let Some(_guard) = self.bridge.messages.try_lock() {
            self.dispatch_messages();
        }
    }

    pub(crate) fn handle_messages_blocking(&self) {
        let _guard = self.bridge.messages.lock();
        self.dispatch_messages();
    }

    fn dispatch_messages(&self) {
        let mut batch = Vec::new();
        self.transport
            .poll_messages(&mut |from, msg| batch.push((from, msg)));

        for (from, msg) in batch {
            self.on_message(from, msg);
        }
    }

    fn on_message(&self, from: UnitId, msg: TaskingMessage) {
        tracing::trace!(%from, ?msg, "tasking message");

        match msg {
            TaskingMessage::AnnounceDep {
                task,
                gref,
                mode,
                phase,
            } => self.on_announce(Announcement {
                origin: from,
                task,
                gref,
                mode,
                phase,
            }),
            TaskingMessage::ReleaseDep { task, proxy } => self.on_release_dep(from, task, proxy),
            TaskingMessage::DepSatisfied { proxy } => self.on_dep_satisfied(proxy),
            TaskingMessage::Cancel => self.on_remote_cancel(),
        }
    }
}
