//! Dependency resolver.
//!
//! Each declared dependency is matched against the chain of prior accesses to
//! the same location. Matches become predecessor edges: the predecessor keeps
//! the successor in its list, the successor counts unresolved predecessors.
//! A task whose count drops to zero is handed to the phase controller, which
//! either dispatches it or defers it until its phase becomes runnable.
//!
//! Dependencies on memory owned by another unit additionally become outbound
//! edges. They are announced at the next `phase_resync`; the owner materialises
//! each announcement as a proxy descriptor ordered against its own tasks.
use crate::context;
use crate::errors::invariant_violation;
use crate::runtime::scheduler::{Outcome, Scheduler};
use crate::task::descriptor::TaskInner;
use crate::task::pool::TaskPool;
use crate::task::{AccessMode, Dependency, Phase, TaskId, TaskInit, TaskKind, TaskRef, TaskState};
use crate::transport::{GlobalRef, RemoteTaskId, TaskingMessage, TransportError, UnitId};
use parking_lot::{Mutex, MutexGuard};
use std::collections::VecDeque;
use std::mem;
use std::sync::atomic::Ordering;

pub(crate) mod index;
use index::{ChainEntry, DependencyIndex};

/// A local task's access to memory owned by another unit.
#[derive(Debug, Clone, Copy)]
pub(crate) struct OutboundEdge {
    task: TaskRef,
    gref: GlobalRef,
    mode: AccessMode,
    phase: Phase,
}

/// An access announced by another unit to memory we own.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Announcement {
    pub(crate) origin: UnitId,
    pub(crate) task: RemoteTaskId,
    pub(crate) gref: GlobalRef,
    pub(crate) mode: AccessMode,
    pub(crate) phase: Phase,
}

#[derive(Debug)]
pub(crate) struct Resolver {
    pub(crate) index: DependencyIndex,

    /// Edges waiting for the next `phase_resync`.
    outbound: Mutex<Vec<OutboundEdge>>,

    /// Announcements that arrived while the task pool was full.
    backlog: Mutex<VecDeque<Announcement>>,
}

impl Resolver {
    pub(crate) fn new(num_units: usize) -> Self {
        Self {
            index: DependencyIndex::new(num_units),
            outbound: Mutex::new(Vec::new()),
            backlog: Mutex::new(VecDeque::new()),
        }
    }

    pub(crate) fn pending_announcements(&self) -> usize {
        self.outbound.lock().len()
    }

    /// Forgets every edge that was not announced yet.
    pub(crate) fn drop_outbound(&self) -> usize {
        mem::take(&mut *self.outbound.lock()).len()
    }
}

fn is_retired(tasks: &TaskPool, task: TaskRef) -> bool {
    tasks
        .slot(task)
        .is_none_or(|slot| slot.state.load().is_terminal())
}

impl Scheduler {
    /// Links a freshly allocated task into the dependency graph and releases
    /// its creation guard.
    pub(crate) fn enqueue(&self, task: TaskRef, deps: &[Dependency], phase: Phase) {
        match self.tasks.lock(task) {
            Some(mut inner) => inner.unresolved = 1,
            None => invariant_violation("enqueued task vanished before linking"),
        }

        for dep in deps {
            let limit = dep.match_limit(phase);

            self.resolver.index.with_chain(dep.gref, |chain| {
                chain.prune(|t| t != task && is_retired(&self.tasks, t));

                let pos = chain.position(phase, false);
                let preds = chain.predecessors(dep.mode, pos, limit);
                let later = chain.later_conflicts(dep.mode, pos);
                chain.insert(
                    pos,
                    ChainEntry {
                        task,
                        mode: dep.mode,
                        phase,
                    },
                );

                for pred in preds.into_iter().filter(|&p| p != task) {
                    self.link(pred, task);
                }
                for succ in later.into_iter().filter(|&s| s != task) {
                    self.link(task, succ);
                }
            });

            if dep.gref.unit != self.my_unit {
                if let Some(mut inner) = self.tasks.lock(task) {
                    inner.unresolved += 1;
                }
                self.resolver.outbound.lock().push(OutboundEdge {
                    task,
                    gref: dep.gref,
                    mode: dep.mode,
                    phase,
                });
            }
        }

        self.release_one(task);
    }

    /// Makes `succ` wait for `pred`.
    ///
    /// The successor count is raised before the edge becomes visible to the
    /// predecessor, so a predecessor retiring concurrently can never release
    /// the successor early.
    pub(crate) fn link(&self, pred: TaskRef, succ: TaskRef) {
        {
            let Some(slot) = self.tasks.slot(succ) else {
                return;
            };
            let Some(mut inner) = slot.lock(succ) else {
                return;
            };

            let state = slot.state.load();
            if !state.is_pending() {
                tracing::warn!(
                    task = ?inner.id,
                    ?state,
                    "dependency declared after the task was released, ordering not enforced"
                );
                return;
            }
            inner.unresolved += 1;
        }

        let linked = match self.tasks.slot(pred) {
            Some(slot) => match slot.lock(pred) {
                Some(mut inner) if !slot.state.load().is_terminal() => {
                    inner.successors.push(succ);
                    true
                }
                _ => false,
            },
            None => false,
        };

        if !linked {
            self.release_one(succ);
        }
    }

    /// One predecessor, remote edge or creation guard of `task` is resolved.
    pub(crate) fn release_one(&self, task: TaskRef) {
        let Some(slot) = self.tasks.slot(task) else {
            return;
        };
        let Some(mut inner) = slot.lock(task) else {
            return;
        };

        let state = slot.state.load();
        if !state.is_pending() {
            return;
        }

        inner.unresolved = match inner.unresolved.checked_sub(1) {
            Some(n) => n,
            None => invariant_violation(format!("unresolved count underflow for {:?}", inner.id)),
        };

        if inner.unresolved > 0 {
            if state == TaskState::Created {
                slot.state.set(TaskState::Blocked);
            }
            return;
        }

        self.make_ready(task, inner);
    }

    /// All dependencies of `task` are satisfied.
    fn make_ready(&self, task: TaskRef, mut inner: MutexGuard<'_, TaskInner>) {
        let Some(slot) = self.tasks.slot(task) else {
            return;
        };

        match inner.kind {
            TaskKind::RemoteProxy {
                origin,
                task: remote,
            } => {
                slot.state.set(TaskState::Suspended);
                drop(inner);

                tracing::trace!(unit = %origin, ?remote, "releasing remote dependency");
                let msg = TaskingMessage::ReleaseDep {
                    task: remote,
                    proxy: task.to_remote(),
                };
                if let Err(e) = self.transport.send(origin, msg) {
                    tracing::error!(unit = %origin, "failed to release remote dependency: {e}");
                    self.retire(task, Outcome::Failed);
                    self.abort_on_transport_failure();
                }
            }
            TaskKind::Local => {
                // During an abort the worker cancels it at dispatch.
                let admitted = self.cancel.should_abort()
                    || self.phases.admit(task, inner.phase, inner.gated);
                if admitted {
                    inner.gated = false;
                    slot.state.set(TaskState::Runnable);
                    tracing::trace!(task = ?inner.id, phase = inner.phase, "runnable");
                    drop(inner);
                    self.dispatch(task);
                } else {
                    inner.gated = true;
                    slot.state.set(TaskState::Blocked);
                    tracing::trace!(task = ?inner.id, phase = inner.phase, "deferred by phase");
                }
            }
        }
    }

    /// Re-examines a task the phase controller let go of.
    pub(crate) fn release_deferred(&self, task: TaskRef) {
        let Some(slot) = self.tasks.slot(task) else {
            return;
        };
        let Some(mut inner) = slot.lock(task) else {
            return;
        };

        if !inner.gated || slot.state.load() != TaskState::Blocked {
            return;
        }

        inner.gated = false;
        if inner.unresolved == 0 {
            slot.state.set(TaskState::Runnable);
            drop(inner);
            self.dispatch(task);
        }
    }

    /// Marks `task` terminal, releases everything waiting on it and recycles
    /// its descriptor. Does nothing if the task already retired or if its
    /// current state is rejected by `accept`.
    pub(crate) fn retire_if(
        &self,
        task: TaskRef,
        outcome: Outcome,
        accept: impl FnOnce(TaskState) -> bool,
    ) -> bool {
        let Some(slot) = self.tasks.slot(task) else {
            return false;
        };

        let (id, kind, parent, successors, remote_successors, context) = {
            let Some(mut inner) = slot.lock(task) else {
                return false;
            };

            let state = slot.state.load();
            if state.is_terminal() || !accept(state) {
                return false;
            }

            slot.state.set(match outcome {
                Outcome::Cancelled | Outcome::Aborted => TaskState::Cancelled,
                Outcome::Completed | Outcome::Failed => TaskState::Complete,
            });

            (
                inner.id,
                inner.kind,
                inner.parent,
                mem::take(&mut inner.successors),
                mem::take(&mut inner.remote_successors),
                inner.context.take(),
            )
        };

        tracing::trace!(task = ?id, ?outcome, successors = successors.len(), "retired");

        if let Some(ctx) = context {
            self.contexts.release(ctx);
        }

        // Workers pop their own deque LIFO while other threads feed the FIFO
        // global queue. Successors that become ready together start in
        // creation order either way.
        if context::with_worker(|_| ()).is_some() {
            successors.into_iter().rev().for_each(|succ| self.release_one(succ));
        } else {
            successors.into_iter().for_each(|succ| self.release_one(succ));
        }

        for (unit, proxy) in remote_successors {
            if let Err(e) = self
                .transport
                .send(unit, TaskingMessage::DepSatisfied { proxy })
            {
                tracing::error!(%unit, "failed to notify remote dependency: {e}");
            }
        }

        if kind == TaskKind::Local {
            if let Some(parent) = parent {
                self.child_retired(parent);
            }
            self.summary.record(outcome);
            self.live_tasks.fetch_sub(1, Ordering::AcqRel);
        }

        // Owned leftovers (an unused body) are dropped outside the slot lock.
        drop(self.tasks.release(task));
        true
    }

    pub(crate) fn retire(&self, task: TaskRef, outcome: Outcome) -> bool {
        self.retire_if(task, outcome, |_| true)
    }

    fn child_retired(&self, parent: TaskRef) {
        let Some(slot) = self.tasks.slot(parent) else {
            return;
        };
        let Some(mut inner) = slot.lock(parent) else {
            return;
        };

        inner.children = inner.children.saturating_sub(1);
        if inner.children > 0 || !inner.waiting_children {
            return;
        }
        inner.waiting_children = false;

        if inner.context.is_some() {
            // Suspended inside `task_complete`.
            slot.state.set(TaskState::Runnable);
            drop(inner);
            self.dispatch(parent);
        } else {
            // The body already returned, only the children held it back.
            let outcome = if inner.failed {
                Outcome::Failed
            } else {
                Outcome::Completed
            };
            drop(inner);
            self.finish(parent, outcome);
        }
    }

    /// Sends every pending outbound edge to the unit owning its location.
    pub(crate) fn flush_announcements(&self) -> Result<usize, TransportError> {
        let edges = mem::take(&mut *self.resolver.outbound.lock());
        let mut sent = 0;

        for edge in edges {
            if is_retired(&self.tasks, edge.task) {
                continue;
            }

            self.transport.announce_remote_dep(
                edge.gref.unit,
                edge.task.to_remote(),
                edge.gref,
                edge.mode,
                edge.phase,
            )?;
            sent += 1;
        }

        Ok(sent)
    }

    /// Materialises an access announced by another unit.
    pub(crate) fn on_announce(&self, ann: Announcement) {
        if ann.gref.unit != self.my_unit {
            tracing::warn!(origin = %ann.origin, gref = %ann.gref, "ignoring misrouted announcement");
            return;
        }

        if self.cancel.should_abort() {
            return;
        }

        let init = TaskInit {
            id: TaskId::next(),
            kind: TaskKind::RemoteProxy {
                origin: ann.origin,
                task: ann.task,
            },
            body: None,
            phase: ann.phase,
            parent: None,
        };

        let proxy = match self.tasks.try_alloc(init) {
            Ok(proxy) => proxy,
            Err(_) => {
                self.resolver.backlog.lock().push_back(ann);
                return;
            }
        };

        if let Some(mut inner) = self.tasks.lock(proxy) {
            inner.unresolved = 1;
        }

        self.resolver.index.with_chain(ann.gref, |chain| {
            chain.prune(|t| is_retired(&self.tasks, t));

            let pos = chain.position(ann.phase, true);
            let preds = chain.predecessors(ann.mode, pos, ann.phase);
            let later = chain.later_conflicts(ann.mode, pos);
            chain.insert(
                pos,
                ChainEntry {
                    task: proxy,
                    mode: ann.mode,
                    phase: ann.phase,
                },
            );

            for pred in preds {
                self.link(pred, proxy);
            }
            for succ in later {
                self.link(proxy, succ);
            }
        });

        tracing::trace!(origin = %ann.origin, gref = %ann.gref, phase = ann.phase, "remote proxy linked");
        self.release_one(proxy);
        if self.cancel.should_abort() {
            self.cancel.request_sweep();
        }
    }

    /// Retries announcements that found the task pool full.
    pub(crate) fn retry_backlog(&self) {
        let backlog = {
            let mut backlog = self.resolver.backlog.lock();
            if backlog.is_empty() {
                return;
            }
            mem::take(&mut *backlog)
        };

        for ann in backlog {
            self.on_announce(ann);
        }
    }

    /// The owner of a remote location released our `task`.
    pub(crate) fn on_release_dep(&self, from: UnitId, task: RemoteTaskId, proxy: RemoteTaskId) {
        let task_ref = TaskRef::from_remote(task);

        let accepted = match self.tasks.slot(task_ref) {
            Some(slot) => match slot.lock(task_ref) {
                Some(mut inner) if !slot.state.load().is_terminal() => {
                    inner.remote_successors.push((from, proxy));
                    true
                }
                _ => false,
            },
            None => false,
        };

        if accepted {
            self.release_one(task_ref);
        } else if let Err(e) = self
            .transport
            .send(from, TaskingMessage::DepSatisfied { proxy })
        {
            // The task is gone (cancelled); let the proxy go as well.
            tracing::error!(unit = %from, "failed to notify remote dependency: {e}");
        }
    }

    /// The remote task behind `proxy` retired.
    pub(crate) fn on_dep_satisfied(&self, proxy: RemoteTaskId) {
        let proxy = TaskRef::from_remote(proxy);
        self.retire_if(proxy, Outcome::Completed, |state| {
            state == TaskState::Suspended
        });
    }
}
