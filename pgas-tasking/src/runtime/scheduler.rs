use crate::bridge::Bridge;
use crate::context::{self, ContextStats, ContextStore, Suspend, TaskContext};
use crate::errors::{TaskingError, invariant_violation};
use crate::resolver::Resolver;
use crate::runtime::RuntimeConfig;
use crate::runtime::cancel::CancelState;
use crate::runtime::phase::PhaseController;
use crate::runtime::pool::ThreadPool;
use crate::runtime::shared::Shared;
use crate::task::{Dependency, Phase, TaskBody, TaskId, TaskInit, TaskKind, TaskPool, TaskRef, TaskState};
use crate::transport::{HandleList, HandleStatus, TEAM_ALL, Transport, UnitId};
use corosensei::CoroutineResult;
use crossbeam_deque::{Injector, Steal};
use std::iter;
use std::ops::Deref;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;

/// How a task left the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Completed,
    /// The body returned an error or panicked, or a transfer it depended on
    /// failed.
    Failed,
    /// Dropped before it started.
    Cancelled,
    /// Unwound at a yield point after it started.
    Aborted,
}

/// Per-outcome task counts reported by `task_complete`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskSummary {
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub aborted: usize,
}

impl TaskSummary {
    pub fn total(&self) -> usize {
        self.completed + self.failed + self.cancelled + self.aborted
    }
}

#[derive(Debug, Default)]
pub(crate) struct SummaryCounters {
    completed: AtomicUsize,
    failed: AtomicUsize,
    cancelled: AtomicUsize,
    aborted: AtomicUsize,
}

impl SummaryCounters {
    pub(crate) fn record(&self, outcome: Outcome) {
        let counter = match outcome {
            Outcome::Completed => &self.completed,
            Outcome::Failed => &self.failed,
            Outcome::Cancelled => &self.cancelled,
            Outcome::Aborted => &self.aborted,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the counts accumulated so far and resets them.
    pub(crate) fn take(&self) -> TaskSummary {
        TaskSummary {
            completed: self.completed.swap(0, Ordering::AcqRel),
            failed: self.failed.swap(0, Ordering::AcqRel),
            cancelled: self.cancelled.swap(0, Ordering::AcqRel),
            aborted: self.aborted.swap(0, Ordering::AcqRel),
        }
    }
}

/// Point-in-time view of a runtime, for diagnostics and tests.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeStats {
    /// Local tasks created and not yet retired.
    pub live_tasks: usize,
    /// Occupied descriptors, remote proxies included.
    pub live_descriptors: usize,
    pub pool_capacity: usize,
    pub pool_high_water: usize,
    pub contexts: ContextStats,
    pub progress_ticks: u64,
    pub current_phase: Phase,
}

/// Number of idle rounds a participating thread spins before parking.
const IDLE_SPINS: u32 = 16;

#[derive(Debug)]
pub(crate) struct Scheduler {
    pub(crate) cfg: RuntimeConfig,

    pub(crate) transport: Arc<dyn Transport>,

    pub(crate) my_unit: UnitId,

    pub(crate) team: Vec<UnitId>,

    pub(crate) tasks: TaskPool,

    pub(crate) contexts: ContextStore,

    pub(crate) resolver: Resolver,

    pub(crate) phases: PhaseController,

    pub(crate) bridge: Bridge,

    pub(crate) cancel: CancelState,

    /// Tasks made runnable off the worker threads and yielded tasks.
    pub(crate) injector: Injector<TaskRef>,

    pub(crate) shared: Shared,

    /// Local tasks created and not yet retired.
    pub(crate) live_tasks: AtomicUsize,

    pub(crate) summary: SummaryCounters,

    pool: OnceLock<ThreadPool>,
}

impl Scheduler {
    pub(crate) fn new(cfg: RuntimeConfig) -> Result<Self, TaskingError> {
        let transport = Arc::clone(&cfg.transport);
        let my_unit = transport.my_unit();
        let team = transport.team_members(TEAM_ALL)?;

        if !team.contains(&my_unit) {
            return Err(TaskingError::Config(format!(
                "unit {my_unit} is not a member of TEAM_ALL"
            )));
        }

        Ok(Self {
            tasks: TaskPool::new(cfg.pool_capacity),
            contexts: ContextStore::new(cfg.stack_size, cfg.max_pooled_contexts),
            resolver: Resolver::new(team.len()),
            phases: PhaseController::new(cfg.phase_gating),
            bridge: Bridge::new(),
            cancel: CancelState::new(),
            injector: Injector::new(),
            shared: Shared::new(&cfg),
            live_tasks: AtomicUsize::new(0),
            summary: SummaryCounters::default(),
            pool: OnceLock::new(),
            transport,
            my_unit,
            team,
            cfg,
        })
    }

    pub(crate) fn into_handle(self) -> Handle {
        Handle(Arc::new(self))
    }

    pub(crate) fn team_size(&self) -> usize {
        self.team.len()
    }

    pub(crate) fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            live_tasks: self.live_tasks.load(Ordering::Acquire),
            live_descriptors: self.tasks.live(),
            pool_capacity: self.tasks.capacity(),
            pool_high_water: self.tasks.high_water(),
            contexts: self.contexts.stats(),
            progress_ticks: self.bridge.ticks(),
            current_phase: self.phases.current(),
        }
    }

    /// Hands a runnable task to a worker. Workers keep tasks they release
    /// themselves; every other thread goes through the global queue.
    pub(crate) fn dispatch(&self, task: TaskRef) {
        if context::with_worker(|worker| worker.push_local(task)).is_none() {
            self.injector.push(task);
        }
        self.shared.unpark_one();
    }

    pub(crate) fn create_task(
        &self,
        body: TaskBody,
        deps: &[Dependency],
    ) -> Result<TaskId, TaskingError> {
        let phase = self.phases.current();

        for dep in deps {
            if dep.gref.unit.index() >= self.team.len() {
                return Err(TaskingError::InvalidArgument(format!(
                    "dependency on {} names a unit outside of a team of {}",
                    dep.gref,
                    self.team.len()
                )));
            }

            if dep.phase.is_some_and(|p| p > phase) {
                return Err(TaskingError::InvalidArgument(format!(
                    "dependency on {} is limited to a future phase (task phase {phase})",
                    dep.gref
                )));
            }
        }

        let id = TaskId::next();
        let parent = context::current_task().map(|(task, _)| task);

        let mut init = TaskInit {
            id,
            kind: TaskKind::Local,
            body: Some(body),
            phase,
            parent,
        };

        let task = loop {
            if self.cancel.should_abort() {
                tracing::trace!(task = %id, "dropped, abort in progress");
                self.summary.record(Outcome::Cancelled);
                return Ok(id);
            }

            match self.tasks.try_alloc(init) {
                Ok(task) => break task,
                Err(back) => {
                    init = back;
                    self.wait_for_space();
                }
            }
        };

        self.live_tasks.fetch_add(1, Ordering::AcqRel);
        if let Some(parent) = parent
            && let Some(mut inner) = self.tasks.lock(parent)
        {
            inner.children += 1;
        }

        tracing::trace!(task = %id, phase, deps = deps.len(), "created");
        self.enqueue(task, deps, phase);
        if self.cancel.should_abort() {
            self.cancel.request_sweep();
        }

        Ok(id)
    }

    /// Back-pressure on a full task pool: tasks step aside, other threads
    /// help drain.
    fn wait_for_space(&self) {
        if context::in_task() {
            context::suspend(Suspend::Yield);
        } else if let Some(task) = self.steal_task() {
            self.run_task(task);
        } else {
            self.progress();
            self.tasks.wait_for_space(self.cfg.park_timeout);
        }
    }

    pub(crate) fn run_task(&self, task: TaskRef) {
        let Some(slot) = self.tasks.slot(task) else {
            return;
        };

        let (id, ctx) = {
            let Some(mut inner) = slot.lock(task) else {
                return;
            };

            if slot.state.load() != TaskState::Runnable {
                return;
            }

            let Some(id) = inner.id else {
                return;
            };

            if self.cancel.should_abort() {
                let outcome = if inner.context.is_some() {
                    Outcome::Aborted
                } else {
                    Outcome::Cancelled
                };
                drop(inner);
                self.retire(task, outcome);
                return;
            }

            let ctx = match inner.context.take() {
                Some(ctx) => {
                    tracing::trace!(task = %id, "resumed");
                    ctx
                }
                None => {
                    let Some(body) = inner.body.take() else {
                        invariant_violation(format!("runnable task {id} has neither body nor context"));
                    };

                    match self.contexts.acquire(body) {
                        Ok(ctx) => ctx,
                        Err(e) => {
                            drop(inner);
                            tracing::error!(task = %id, "failed to acquire a context: {e:#}");
                            self.retire(task, Outcome::Failed);
                            return;
                        }
                    }
                }
            };

            slot.state.set(TaskState::Running);
            (id, ctx)
        };

        self.execute(task, id, ctx);
    }

    fn execute(&self, task: TaskRef, id: TaskId, mut ctx: TaskContext) {
        let result = {
            let _guard = context::enter_task(task, id);
            panic::catch_unwind(AssertUnwindSafe(|| ctx.resume()))
        };

        match result {
            Ok(CoroutineResult::Yield(reason)) => self.on_suspend(task, id, ctx, reason),
            Ok(CoroutineResult::Return(Ok(()))) => {
                self.contexts.release(ctx);
                self.finish(task, Outcome::Completed);
            }
            Ok(CoroutineResult::Return(Err(e))) => {
                tracing::warn!(task = %id, "task failed: {e:#}");
                self.contexts.release(ctx);
                self.finish(task, Outcome::Failed);
            }
            Err(payload) => {
                let msg = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "<non-string panic payload>".to_string());
                tracing::error!(task = %id, "task panicked: {msg}");

                self.contexts.discard(ctx);
                self.finish(task, Outcome::Failed);
            }
        }
    }

    fn on_suspend(&self, task: TaskRef, id: TaskId, ctx: TaskContext, reason: Suspend) {
        let Some(slot) = self.tasks.slot(task) else {
            invariant_violation(format!("task {id} retired while running"));
        };
        let Some(mut inner) = slot.lock(task) else {
            invariant_violation(format!("task {id} retired while running"));
        };

        match reason {
            Suspend::Yield => {
                inner.context = Some(ctx);
                slot.state.set(TaskState::Runnable);
                drop(inner);

                tracing::trace!(task = %id, "yielded");
                self.injector.push(task);
                self.shared.unpark_one();
            }
            Suspend::Wait(handles) => {
                inner.context = Some(ctx);
                slot.state.set(TaskState::Suspended);
                drop(inner);

                tracing::trace!(task = %id, handles = handles.len(), "suspended on transfers");
                self.bridge.add_waiter(task, handles);
            }
            Suspend::WaitChildren => {
                inner.context = Some(ctx);
                if inner.children == 0 {
                    slot.state.set(TaskState::Runnable);
                    drop(inner);
                    self.dispatch(task);
                } else {
                    tracing::trace!(task = %id, children = inner.children, "waiting for children");
                    inner.waiting_children = true;
                    slot.state.set(TaskState::Suspended);
                }
            }
            Suspend::Abort => {
                let outcome = if inner.failed {
                    Outcome::Failed
                } else {
                    Outcome::Aborted
                };
                drop(inner);

                tracing::trace!(task = %id, ?outcome, "unwinding");
                self.contexts.release(ctx);
                self.retire(task, outcome);
            }
        }
    }

    /// The body of `task` is done. Retirement waits for its children and for
    /// every handle it detached.
    pub(crate) fn finish(&self, task: TaskRef, outcome: Outcome) {
        let Some(slot) = self.tasks.slot(task) else {
            return;
        };
        let Some(mut inner) = slot.lock(task) else {
            return;
        };

        if outcome == Outcome::Failed {
            inner.failed = true;
        }
        let outcome = match outcome {
            Outcome::Completed if inner.failed => Outcome::Failed,
            other => other,
        };

        let aborting = self.cancel.should_abort();
        let settled = matches!(outcome, Outcome::Completed | Outcome::Failed);

        if settled && !aborting && inner.children > 0 {
            inner.waiting_children = true;
            slot.state.set(TaskState::Suspended);
            return;
        }

        let detached = std::mem::take(&mut inner.detached);
        let pending = detached
            .into_iter()
            .filter(|h| self.transport.test(h) != HandleStatus::Complete)
            .collect::<HandleList>();

        if settled && !aborting && !pending.is_empty() {
            slot.state.set(TaskState::Suspended);
            drop(inner);
            self.bridge.add_retiring(task, pending, outcome);
            return;
        }

        drop(inner);
        self.retire(task, outcome);
    }

    pub(crate) fn wait_children(&self) {
        context::suspend(Suspend::WaitChildren);
    }

    /// One item of work from the global queue or a worker deque, for threads
    /// that are not workers.
    pub(crate) fn steal_task(&self) -> Option<TaskRef> {
        let stealers = self.pool.get().map(ThreadPool::stealers).unwrap_or_default();

        iter::repeat_with(|| {
            self.injector
                .steal()
                .or_else(|| stealers.iter().map(|s| s.steal()).collect::<Steal<_>>())
        })
        .take(self.cfg.max_steal_retries)
        .find(|s| !s.is_retry())
        .and_then(|s| s.success())
    }

    /// Runs tasks and drives progress on the calling thread until `done`.
    pub(crate) fn participate_until(&self, done: impl Fn(&Self) -> bool) {
        let mut idle = 0u32;
        let mut ran = 0u32;

        while !done(self) {
            if let Some(task) = self.steal_task() {
                self.run_task(task);
                idle = 0;
                ran = ran.wrapping_add(1);
                if ran.is_multiple_of(self.cfg.progress_interval) {
                    self.progress();
                }
                continue;
            }

            self.progress();
            idle += 1;

            if idle < IDLE_SPINS {
                thread::yield_now();
            } else {
                if self.cancel.claim_idle_sweep() {
                    self.abort_sweep();
                }
                self.shared
                    .park_current_thread(&self.injector, self.cfg.park_timeout);
            }
        }
    }

    /// Drains tasks, as `task_complete` does. Inside a task only its children
    /// are awaited.
    pub(crate) fn drain(&self, resync: bool) -> Result<TaskSummary, TaskingError> {
        if context::in_task() {
            self.wait_children();
            return Ok(TaskSummary::default());
        }

        // Announcements must be linked before anything is released.
        let phase = if resync && self.team.len() > 1 {
            self.phase_resync(TEAM_ALL)?
        } else {
            self.phases.current()
        };
        self.phase_set_runnable(phase);

        // Proxies count too: a remote task may still hold one of our locations.
        self.participate_until(|s| {
            s.live_tasks.load(Ordering::Acquire) == 0
                && s.tasks.live() == 0
                && !s.bridge.has_orphans()
        });

        self.resolver
            .index
            .compact(|t| self.tasks.is_retired(t));

        if self.cancel.should_abort() {
            self.cancel.acknowledge();
            tracing::debug!(unit = %self.my_unit, "abort acknowledged");
        }

        Ok(self.summary.take())
    }

    pub(crate) fn start_pool(self: &Arc<Self>, handle: &Handle) -> anyhow::Result<()> {
        let pool = ThreadPool::new(handle)?;
        if self.pool.set(pool).is_err() {
            invariant_violation("worker pool started twice");
        }
        Ok(())
    }

    pub(crate) fn join_pool(&self) -> anyhow::Result<()> {
        match self.pool.get() {
            Some(pool) => pool.join_all(),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Handle(Arc<Scheduler>);

impl Handle {
    pub(crate) fn start(&self) -> anyhow::Result<()> {
        self.0.start_pool(self)
    }
}

impl Deref for Handle {
    type Target = Arc<Scheduler>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
