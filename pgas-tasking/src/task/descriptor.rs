use crate::context::TaskContext;
use crate::task::state::{AtomicTaskState, TaskState};
use crate::task::{Phase, TaskId};
use crate::transport::{HandleList, RemoteTaskId, UnitId};
use parking_lot::{Mutex, MutexGuard};
use smallvec::SmallVec;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

/// User code executed by a task. Captured state is the task's argument buffer.
pub(crate) type TaskBody = Box<dyn FnOnce() -> anyhow::Result<()> + Send + 'static>;

/// Generation-checked reference to a descriptor slot.
///
/// Slots are recycled, so a reference whose generation no longer matches the
/// slot points at a task that has already retired.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub(crate) struct TaskRef {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl TaskRef {
    pub(crate) fn to_remote(self) -> RemoteTaskId {
        RemoteTaskId((u64::from(self.generation) << 32) | u64::from(self.index))
    }

    pub(crate) fn from_remote(id: RemoteTaskId) -> Self {
        Self {
            index: id.0 as u32,
            generation: (id.0 >> 32) as u32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskKind {
    /// A task created on this unit with a body to execute.
    Local,

    /// Stands in for `task` on unit `origin`, which accesses memory owned by
    /// this unit. It never runs a body.
    RemoteProxy { origin: UnitId, task: RemoteTaskId },
}

pub(crate) struct TaskInit {
    pub(crate) id: TaskId,
    pub(crate) kind: TaskKind,
    pub(crate) body: Option<TaskBody>,
    pub(crate) phase: Phase,
    pub(crate) parent: Option<TaskRef>,
}

pub(crate) type SuccessorList = SmallVec<[TaskRef; 4]>;

pub(crate) type RemoteSuccessorList = SmallVec<[(UnitId, RemoteTaskId); 2]>;

/// Mutable part of a descriptor, guarded by the slot lock.
pub(crate) struct TaskInner {
    pub(crate) generation: u32,

    /// `None` while the slot is on the free list.
    pub(crate) id: Option<TaskId>,

    pub(crate) kind: TaskKind,

    /// Taken when the task is first dispatched.
    pub(crate) body: Option<TaskBody>,

    /// Present while the task is suspended.
    pub(crate) context: Option<TaskContext>,

    pub(crate) phase: Phase,

    /// Predecessors, outbound remote edges and the creation guard that still
    /// have to release this task.
    pub(crate) unresolved: usize,

    pub(crate) successors: SuccessorList,

    /// Proxies on other units waiting for this task to retire.
    pub(crate) remote_successors: RemoteSuccessorList,

    pub(crate) parent: Option<TaskRef>,

    pub(crate) children: usize,

    /// Suspended in `task_complete` until `children` drops to zero.
    pub(crate) waiting_children: bool,

    /// Handles detached by the body. The task retires once all complete.
    pub(crate) detached: HandleList,

    /// Parked in the phase controller's deferred list.
    pub(crate) gated: bool,

    pub(crate) failed: bool,
}

impl TaskInner {
    fn vacant(generation: u32) -> Self {
        Self {
            generation,
            id: None,
            kind: TaskKind::Local,
            body: None,
            context: None,
            phase: 0,
            unresolved: 0,
            successors: SmallVec::new(),
            remote_successors: SmallVec::new(),
            parent: None,
            children: 0,
            waiting_children: false,
            detached: SmallVec::new(),
            gated: false,
            failed: false,
        }
    }

    pub(crate) fn is_proxy(&self) -> bool {
        matches!(self.kind, TaskKind::RemoteProxy { .. })
    }
}

impl fmt::Debug for TaskInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskInner")
            .field("generation", &self.generation)
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("phase", &self.phase)
            .field("unresolved", &self.unresolved)
            .field("successors", &self.successors.len())
            .field("children", &self.children)
            .field("suspended", &self.context.is_some())
            .finish()
    }
}

/// One descriptor slot of the task arena.
#[derive(Debug)]
pub(crate) struct TaskSlot {
    pub(crate) state: AtomicTaskState,

    /// Mirror of `inner.generation` for lock-free staleness checks.
    generation: AtomicU32,

    inner: Mutex<TaskInner>,
}

impl TaskSlot {
    pub(super) fn new() -> Self {
        Self {
            state: AtomicTaskState::new(TaskState::Created),
            generation: AtomicU32::new(0),
            inner: Mutex::new(TaskInner::vacant(0)),
        }
    }

    pub(crate) fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    /// Locks the descriptor if `task` still refers to it.
    pub(crate) fn lock(&self, task: TaskRef) -> Option<MutexGuard<'_, TaskInner>> {
        let inner = self.inner.lock();
        (inner.generation == task.generation && inner.id.is_some()).then_some(inner)
    }

    /// Occupies a vacant slot. Returns the reference of the new generation.
    pub(super) fn occupy(&self, index: u32, init: TaskInit) -> TaskRef {
        let mut inner = self.inner.lock();
        debug_assert!(inner.id.is_none(), "occupying a live slot");

        inner.id = Some(init.id);
        inner.kind = init.kind;
        inner.body = init.body;
        inner.phase = init.phase;
        inner.parent = init.parent;
        self.state.reset();

        TaskRef {
            index,
            generation: inner.generation,
        }
    }

    /// Bumps the generation and empties the slot. Leftover owned values are
    /// returned so they can be dropped outside the lock.
    pub(super) fn vacate(&self, task: TaskRef) -> Option<TaskInner> {
        let mut inner = self.lock(task)?;
        let next = task.generation.wrapping_add(1);
        let old = std::mem::replace(&mut *inner, TaskInner::vacant(next));
        self.generation.store(next, Ordering::Release);
        Some(old)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(TaskSlot: Send, Sync);
    assert_impl_all!(TaskRef: Send, Sync, Copy);

    #[test]
    fn test_remote_id_round_trip_keeps_generation() {
        let task = TaskRef {
            index: 17,
            generation: u32::MAX - 1,
        };
        assert_eq!(TaskRef::from_remote(task.to_remote()), task);
    }

    #[test]
    fn test_stale_ref_cannot_lock() {
        let slot = TaskSlot::new();
        let task = slot.occupy(
            0,
            TaskInit {
                id: TaskId::next(),
                kind: TaskKind::Local,
                body: None,
                phase: 3,
                parent: None,
            },
        );

        assert_eq!(slot.lock(task).map(|i| i.phase), Some(3));

        let old = slot.vacate(task).unwrap();
        assert_eq!(old.phase, 3);
        assert!(slot.lock(task).is_none());
        assert_eq!(slot.generation(), task.generation + 1);
    }
}
