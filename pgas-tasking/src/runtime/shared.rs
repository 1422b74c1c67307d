use crate::runtime::RuntimeConfig;
use crossbeam_deque::Injector;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, Thread};
use std::time::Duration;

/// State shared by every thread participating in a runtime.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) shutdown: AtomicBool,

    /// LIFO collection of parked threads. The most recently parked thread has
    /// the warmest cache.
    parked_threads: Mutex<VecDeque<Thread>>,
}

impl Shared {
    pub(crate) fn new(cfg: &RuntimeConfig) -> Self {
        Self {
            shutdown: AtomicBool::new(false),
            parked_threads: Mutex::new(VecDeque::with_capacity(cfg.worker_threads + 1)),
        }
    }

    /// Parks the current thread until it is unparked or `timeout` elapses.
    ///
    /// Parking is bounded because remote units never unpark our threads: a
    /// message or a transfer completion is only noticed by polling.
    pub(crate) fn park_current_thread<T>(&self, injector: &Injector<T>, timeout: Duration) {
        let thread = thread::current();
        {
            let mut parked_threads = self.parked_threads.lock();

            // Checked while holding the lock, unparkers take it before
            // popping a thread.
            if !injector.is_empty() || self.shutdown.load(Ordering::Acquire) {
                return;
            }

            parked_threads.push_back(thread.clone());
        }

        thread::park_timeout(timeout);

        // Timed out or spurious wakeup: make sure nobody wastes an unpark on us.
        let id = thread.id();
        self.parked_threads.lock().retain(|t| t.id() != id);
    }

    pub(crate) fn unpark_one(&self) -> bool {
        match self.parked_threads.lock().pop_back() {
            Some(thread) => {
                thread.unpark();
                true
            }
            None => false,
        }
    }

    pub(crate) fn unpark_all(&self) -> usize {
        let parked = std::mem::take(&mut *self.parked_threads.lock());
        let num_unparked = parked.len();

        for thread in parked {
            thread.unpark();
        }

        num_unparked
    }

    pub(crate) fn begin_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.unpark_all();
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}
