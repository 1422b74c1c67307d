//! Cooperative cancellation.
//!
//! Aborting is a one-way switch per epoch: the first thread to raise the flag
//! sweeps the task arena, peers are told through the transport and every
//! running task is unwound at its next yield point. A root-level drain that
//! observes the abort acknowledges it and closes the epoch.
use crate::context::{self, Suspend};
use crate::errors::{TaskingError, invariant_violation};
use crate::runtime::scheduler::{Outcome, Scheduler};
use crate::task::TaskState;
use crate::transport::{CollectiveOp, TEAM_ALL};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[derive(Debug)]
pub(crate) struct CancelState {
    abort: AtomicBool,

    /// Sticky for the lifetime of the runtime, decides the exit status.
    ever_aborted: AtomicBool,

    /// The collective part of `cancel_barrier` already ran in this epoch.
    barrier_done: AtomicBool,

    /// Bumped by every abort that raises the flag.
    epoch: AtomicU64,

    /// Last epoch an idle thread swept the arena for.
    swept_epoch: AtomicU64,
}

impl CancelState {
    pub(crate) fn new() -> Self {
        Self {
            abort: AtomicBool::new(false),
            ever_aborted: AtomicBool::new(false),
            barrier_done: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            swept_epoch: AtomicU64::new(0),
        }
    }

    #[inline]
    pub(crate) fn should_abort(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }

    /// Raises the flag. Returns true for the caller that raised it.
    pub(crate) fn begin(&self) -> bool {
        let first = self
            .abort
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if first {
            self.ever_aborted.store(true, Ordering::Release);
            self.epoch.fetch_add(1, Ordering::AcqRel);
        }
        first
    }

    /// Returns true to exactly one idle caller per abort epoch, or again after
    /// [`CancelState::request_sweep`].
    pub(crate) fn claim_idle_sweep(&self) -> bool {
        if !self.should_abort() {
            return false;
        }
        let epoch = self.epoch.load(Ordering::Acquire);
        self.swept_epoch.swap(epoch, Ordering::AcqRel) != epoch
    }

    /// A task or proxy got linked while the abort was starting, so the sweep
    /// of this epoch may have missed it.
    pub(crate) fn request_sweep(&self) {
        let epoch = self.epoch.load(Ordering::Acquire);
        let _ = self.swept_epoch.compare_exchange(
            epoch,
            epoch.wrapping_sub(1),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Returns true for the first caller of the epoch.
    fn enter_barrier(&self) -> bool {
        !self.barrier_done.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn ever_aborted(&self) -> bool {
        self.ever_aborted.load(Ordering::Acquire)
    }

    /// Ends the current abort epoch.
    pub(crate) fn acknowledge(&self) {
        self.barrier_done.store(false, Ordering::Release);
        self.abort.store(false, Ordering::Release);
    }
}

impl Scheduler {
    /// Raises the abort flag and, if we are first, sweeps the arena.
    pub(crate) fn begin_abort(&self, reason: &'static str) {
        if self.cancel.begin() {
            tracing::debug!(unit = %self.my_unit, reason, "abort started");
            self.abort_sweep();
        }
        self.shared.unpark_all();
    }

    /// Starts an abort and tells every peer about it.
    pub(crate) fn broadcast_abort(&self, reason: &'static str) {
        self.begin_abort(reason);

        for &unit in self.team.iter().filter(|&&u| u != self.my_unit) {
            if let Err(e) = self.transport.notify_cancel(unit) {
                tracing::error!(%unit, "failed to notify cancellation: {e}");
            }
        }
    }

    /// A transfer failed: the affected task is already failed, the rest of
    /// the team is torn down cooperatively.
    pub(crate) fn abort_on_transport_failure(&self) {
        self.broadcast_abort("transport failure");
    }

    pub(crate) fn cancel_bcast(&self) {
        self.broadcast_abort("cancel_bcast");
        self.abort_current_task();
    }

    /// Collective cancellation: every unit of `TEAM_ALL` must call it. Only
    /// the first caller of an abort epoch on each unit takes part in the
    /// reduction, later and concurrent callers fall through.
    pub(crate) fn cancel_barrier(&self) -> Result<(), TaskingError> {
        self.begin_abort("cancel_barrier");

        if self.cancel.enter_barrier() {
            let acked = self
                .transport
                .allreduce_max(TEAM_ALL, CollectiveOp::CancelBarrier, 1)?;
            tracing::debug!(unit = %self.my_unit, acked, "cancel barrier passed");
        }

        self.abort_current_task();
        Ok(())
    }

    /// Unwinds the calling task, if any. Never returns inside a task.
    fn abort_current_task(&self) {
        if context::in_task() {
            context::suspend(Suspend::Abort);
            invariant_violation("aborted task was resumed");
        }
    }

    pub(crate) fn on_remote_cancel(&self) {
        self.begin_abort("remote cancel");
    }

    /// Cancels every task that has not started and every remote proxy.
    ///
    /// Runnable tasks are cancelled when a worker picks them up, suspended
    /// waiters by the bridge. Tasks still being created are left alone: they
    /// either get dispatched (and cancelled) or are caught by a later sweep.
    pub(crate) fn abort_sweep(&self) {
        let dropped = self.resolver.drop_outbound();
        let deferred = self.phases.take_all_deferred().len();
        let mut cancelled = 0usize;

        for index in 0..self.tasks.capacity() as u32 {
            let Some(task) = self.tasks.occupant(index) else {
                continue;
            };
            let Some(slot) = self.tasks.slot(task) else {
                continue;
            };

            let retired = match slot.state.load() {
                TaskState::Blocked => {
                    self.retire_if(task, Outcome::Cancelled, |s| s == TaskState::Blocked)
                }
                TaskState::Suspended if slot.lock(task).is_some_and(|inner| inner.is_proxy()) => {
                    self.retire_if(task, Outcome::Cancelled, |s| s == TaskState::Suspended)
                }
                _ => false,
            };

            if retired {
                cancelled += 1;
            }
        }

        if dropped + deferred + cancelled > 0 {
            tracing::debug!(dropped, deferred, cancelled, "abort sweep");
        }
    }
}
