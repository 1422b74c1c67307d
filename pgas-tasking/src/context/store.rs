use crate::context::TaskContext;
use crate::task::TaskBody;
use anyhow::{Context as _, Result};
use corosensei::stack::DefaultStack;
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};

/// A stack sitting in the free list, not executing anything.
struct PooledStack(DefaultStack);

// Safety: a pooled stack is an exclusively owned memory mapping with no
// coroutine running on it.
unsafe impl Send for PooledStack {}

/// Counters exposed for diagnostics and drain checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ContextStats {
    /// Stacks mapped since the runtime started.
    pub allocated: usize,
    pub acquired: usize,
    pub released: usize,
    /// Stacks currently in the free list.
    pub pooled: usize,
}

impl ContextStats {
    /// Contexts currently owned by a task.
    pub fn outstanding(&self) -> usize {
        self.acquired - self.released
    }
}

/// Process-wide pool of task stacks.
///
/// Stacks come with a guard page and are reused across tasks. Creation is off
/// the hot path, so a single mutex guards the free list.
pub(crate) struct ContextStore {
    stack_size: usize,

    max_pooled: usize,

    free: Mutex<Vec<PooledStack>>,

    allocated: AtomicUsize,

    acquired: AtomicUsize,

    released: AtomicUsize,
}

impl std::fmt::Debug for ContextStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextStore")
            .field("stack_size", &self.stack_size)
            .field("stats", &self.stats())
            .finish()
    }
}

impl ContextStore {
    pub(crate) fn new(stack_size: usize, max_pooled: usize) -> Self {
        Self {
            stack_size,
            max_pooled,
            free: Mutex::new(Vec::with_capacity(max_pooled)),
            allocated: AtomicUsize::new(0),
            acquired: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
        }
    }

    /// Returns a fresh context that will run `body` on its first resume.
    pub(crate) fn acquire(&self, body: TaskBody) -> Result<TaskContext> {
        let pooled = self.free.lock().pop();

        let stack = match pooled {
            Some(PooledStack(stack)) => stack,
            None => {
                let stack = DefaultStack::new(self.stack_size).with_context(|| {
                    format!("failed to map a task stack of {} bytes", self.stack_size)
                })?;
                self.allocated.fetch_add(1, Ordering::Relaxed);
                stack
            }
        };

        self.acquired.fetch_add(1, Ordering::Relaxed);
        Ok(TaskContext::new(stack, body))
    }

    /// Returns the stack of `ctx` to the free list, unwinding the task first
    /// if it is still suspended.
    pub(crate) fn release(&self, ctx: TaskContext) {
        self.released.fetch_add(1, Ordering::Relaxed);

        match panic::catch_unwind(AssertUnwindSafe(|| ctx.into_stack())) {
            Ok(stack) => {
                let mut free = self.free.lock();
                if free.len() < self.max_pooled {
                    free.push(PooledStack(stack));
                }
            }
            Err(_) => {
                tracing::error!("destructor panicked while unwinding a cancelled task");
            }
        }
    }

    /// Drops a context whose task panicked. The stack is not reused.
    pub(crate) fn discard(&self, ctx: TaskContext) {
        self.released.fetch_add(1, Ordering::Relaxed);
        if panic::catch_unwind(AssertUnwindSafe(|| drop(ctx))).is_err() {
            tracing::error!("failed to drop the context of a panicked task");
        }
    }

    /// Unmaps every pooled stack.
    pub(crate) fn clear(&self) {
        let stacks = std::mem::take(&mut *self.free.lock());
        drop(stacks);
    }

    pub(crate) fn stats(&self) -> ContextStats {
        ContextStats {
            allocated: self.allocated.load(Ordering::Relaxed),
            acquired: self.acquired.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            pooled: self.free.lock().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Suspend;
    use corosensei::CoroutineResult;
    use static_assertions::assert_impl_all;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;

    assert_impl_all!(ContextStore: Send, Sync);
    assert_impl_all!(TaskContext: Send);

    const STACK_SIZE: usize = 64 * 1024;

    #[test]
    fn test_stacks_are_reused() -> Result<()> {
        let store = ContextStore::new(STACK_SIZE, 8);

        for _ in 0..4 {
            let mut ctx = store.acquire(Box::new(|| Ok(())))?;
            assert!(matches!(ctx.resume(), CoroutineResult::Return(Ok(()))));
            store.release(ctx);
        }

        let stats = store.stats();
        assert_eq!(stats.allocated, 1);
        assert_eq!(stats.acquired, 4);
        assert_eq!(stats.released, 4);
        assert_eq!(stats.outstanding(), 0);
        assert_eq!(stats.pooled, 1);

        store.clear();
        assert_eq!(store.stats().pooled, 0);
        Ok(())
    }

    #[test]
    fn test_release_unwinds_suspended_task() -> Result<()> {
        struct SetOnDrop(Arc<AtomicBool>);
        impl Drop for SetOnDrop {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let store = ContextStore::new(STACK_SIZE, 8);
        let dropped = Arc::new(AtomicBool::new(false));

        let guard = SetOnDrop(Arc::clone(&dropped));
        let mut ctx = store.acquire(Box::new(move || {
            let _guard = guard;
            crate::context::suspend(Suspend::Yield);
            Ok(())
        }))?;

        assert!(matches!(ctx.resume(), CoroutineResult::Yield(Suspend::Yield)));
        assert!(ctx.is_suspended());
        assert!(!dropped.load(Ordering::SeqCst));

        store.release(ctx);
        assert!(dropped.load(Ordering::SeqCst));
        assert_eq!(store.stats().pooled, 1);
        Ok(())
    }

    #[test]
    fn test_max_pooled_bounds_free_list() -> Result<()> {
        let store = ContextStore::new(STACK_SIZE, 1);

        let a = store.acquire(Box::new(|| Ok(())))?;
        let b = store.acquire(Box::new(|| Ok(())))?;
        store.release(a);
        store.release(b);

        let stats = store.stats();
        assert_eq!(stats.allocated, 2);
        assert_eq!(stats.pooled, 1);
        Ok(())
    }

    #[test]
    fn test_release_never_started_task() -> Result<()> {
        let store = ContextStore::new(STACK_SIZE, 8);
        let ran = Arc::new(AtomicBool::new(false));
        let captured = Arc::new(());

        let ctx = {
            let ran = Arc::clone(&ran);
            let captured = Arc::clone(&captured);
            store.acquire(Box::new(move || {
                let _captured = captured;
                ran.store(true, Ordering::SeqCst);
                Ok(())
            }))?
        };
        assert!(!ctx.is_suspended());
        assert_eq!(Arc::strong_count(&captured), 2);

        store.release(ctx);
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(Arc::strong_count(&captured), 1);

        let stats = store.stats();
        assert_eq!(stats.pooled, 1);
        assert_eq!(stats.outstanding(), 0);

        // The pooled stack runs the next task normally.
        let mut ctx = store.acquire(Box::new(|| Ok(())))?;
        assert!(matches!(ctx.resume(), CoroutineResult::Return(Ok(()))));
        store.release(ctx);
        assert_eq!(store.stats().allocated, 1);
        Ok(())
    }
}
