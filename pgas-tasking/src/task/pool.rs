use crate::task::descriptor::{TaskInit, TaskInner, TaskRef, TaskSlot};
use crossbeam_queue::ArrayQueue;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Fixed-capacity arena of task descriptors.
///
/// Free slot indices live in a lock-free queue. Allocation never blocks: when
/// the arena is full the caller decides how to apply back-pressure and may
/// wait for a slot with [`TaskPool::wait_for_space`].
#[derive(Debug)]
pub(crate) struct TaskPool {
    slots: Box<[TaskSlot]>,

    free: ArrayQueue<u32>,

    live: AtomicUsize,

    high_water: AtomicUsize,

    /// Threads blocked in `wait_for_space`.
    waiters: AtomicUsize,

    space_lock: Mutex<()>,

    space_freed: Condvar,
}

impl TaskPool {
    #[track_caller]
    pub(crate) fn new(capacity: usize) -> Self {
        assert!(
            capacity > 0 && capacity <= u32::MAX as usize,
            "pool capacity must be in 1..=u32::MAX"
        );

        let free = ArrayQueue::new(capacity);
        for index in 0..capacity as u32 {
            // Sized for exactly `capacity` indices, cannot fail.
            let _ = free.push(index);
        }

        Self {
            slots: (0..capacity).map(|_| TaskSlot::new()).collect(),
            free,
            live: AtomicUsize::new(0),
            high_water: AtomicUsize::new(0),
            waiters: AtomicUsize::new(0),
            space_lock: Mutex::new(()),
            space_freed: Condvar::new(),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of occupied descriptors.
    pub(crate) fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Largest number of simultaneously occupied descriptors observed.
    pub(crate) fn high_water(&self) -> usize {
        self.high_water.load(Ordering::Relaxed)
    }

    /// Occupies a free slot, or hands `init` back if the arena is full.
    pub(crate) fn try_alloc(&self, init: TaskInit) -> Result<TaskRef, TaskInit> {
        let Some(index) = self.free.pop() else {
            return Err(init);
        };

        let live = self.live.fetch_add(1, Ordering::AcqRel) + 1;
        self.high_water.fetch_max(live, Ordering::Relaxed);

        Ok(self.slots[index as usize].occupy(index, init))
    }

    pub(crate) fn slot(&self, task: TaskRef) -> Option<&TaskSlot> {
        self.slots
            .get(task.index as usize)
            .filter(|slot| slot.generation() == task.generation)
    }

    pub(crate) fn lock(&self, task: TaskRef) -> Option<MutexGuard<'_, TaskInner>> {
        self.slots.get(task.index as usize)?.lock(task)
    }

    /// Returns true once the descriptor behind `task` has been recycled.
    pub(crate) fn is_retired(&self, task: TaskRef) -> bool {
        self.slot(task).is_none()
    }

    /// Current reference to slot `index`, if occupied.
    pub(crate) fn occupant(&self, index: u32) -> Option<TaskRef> {
        let slot = self.slots.get(index as usize)?;
        let task = TaskRef {
            index,
            generation: slot.generation(),
        };
        slot.lock(task).map(|_| task)
    }

    /// Recycles the slot behind `task`. Leftover owned values are returned to
    /// be dropped by the caller outside of any lock.
    pub(crate) fn release(&self, task: TaskRef) -> Option<TaskInner> {
        let old = self.slots.get(task.index as usize)?.vacate(task)?;

        self.live.fetch_sub(1, Ordering::AcqRel);
        if self.free.push(task.index).is_err() {
            crate::errors::invariant_violation("task pool free-list overflow");
        }

        if self.waiters.load(Ordering::Acquire) > 0 {
            let _guard = self.space_lock.lock();
            self.space_freed.notify_one();
        }

        Some(old)
    }

    /// Blocks until a slot is likely free or `timeout` elapses. Returns true
    /// if the free list is non-empty on return.
    pub(crate) fn wait_for_space(&self, timeout: Duration) -> bool {
        let mut guard = self.space_lock.lock();
        if !self.free.is_empty() {
            return true;
        }

        self.waiters.fetch_add(1, Ordering::AcqRel);
        // Re-check after registering: a release between the two checks would
        // otherwise skip the notification.
        if self.free.is_empty() {
            self.space_freed.wait_for(&mut guard, timeout);
        }
        self.waiters.fetch_sub(1, Ordering::AcqRel);

        !self.free.is_empty()
    }
}
