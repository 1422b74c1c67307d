use crate::runtime::RuntimeConfig;
use crate::runtime::scheduler::{Handle, Scheduler};
use crate::runtime::ticker::{Ticker, TickerData, TickerEvents};
use crate::task::TaskRef;
use crossbeam_deque::{Injector, Stealer, Worker as CbWorker};
use std::cell::{Cell, RefCell};
use std::iter;
use std::ops::ControlFlow;
use std::thread;

/// Idle rounds spent yielding before the worker parks.
const IDLE_SPINS: u32 = 32;

#[derive(Debug)]
pub(crate) struct Worker {
    pub(crate) index: usize,

    /// Determines how we run the event loop.
    cfg: RefCell<EventLoopConfig>,

    ticker: RefCell<Ticker>,

    /// Whether we should try to find our next task in the global queue.
    pop_global_queue: Cell<bool>,

    /// Runnable tasks released on this thread. Owner pushes and pops LIFO,
    /// thieves take from the other end.
    local: CbWorker<TaskRef>,

    /// Handles to the deques of all other workers.
    stealers: Vec<Stealer<TaskRef>>,
}

impl Worker {
    pub(super) fn new(
        index: usize,
        cfg: &RuntimeConfig,
        local: CbWorker<TaskRef>,
        mut stealers: Vec<Stealer<TaskRef>>,
    ) -> Self {
        // Each worker probes its victims in a different order.
        fastrand::shuffle(&mut stealers);

        Self {
            index,
            cfg: RefCell::new(cfg.into()),
            ticker: RefCell::new(Ticker::new()),
            pop_global_queue: Cell::new(false),
            local,
            stealers,
        }
    }

    pub(crate) fn push_local(&self, task: TaskRef) {
        self.local.push(task);
    }

    fn find_task(&self, global: &Injector<TaskRef>) -> Option<TaskRef> {
        // Force-check the global queue every `global_queue_interval` ticks so
        // yielded and externally released tasks are not starved.
        if self.pop_global_queue.replace(false)
            && let Some(task) = global.steal_batch_and_pop(&self.local).success()
        {
            return Some(task);
        }

        self.local.pop().or_else(|| {
            iter::repeat_with(|| {
                global.steal_batch_and_pop(&self.local).or_else(||
                    // `collect` stops at the first successful steal.
                    self.stealers.iter().map(|s| s.steal()).collect())
            })
            .take(self.cfg.borrow().max_steal_retries)
            .find(|s| !s.is_retry())
            .and_then(|s| s.success())
        })
    }

    pub(crate) fn event_loop(&self, scheduler: &Handle) {
        tracing::debug!(worker = self.index, "worker started");
        let mut idle = 0u32;

        loop {
            if let Some(task) = self.find_task(&scheduler.injector) {
                scheduler.run_task(task);
                idle = 0;
            } else {
                // Nothing to run: drive remote completions before backing off.
                scheduler.progress();
                idle = idle.saturating_add(1);

                if idle < IDLE_SPINS || scheduler.bridge.has_pending() {
                    thread::yield_now();
                } else {
                    scheduler
                        .shared
                        .park_current_thread(&scheduler.injector, scheduler.cfg.park_timeout);
                }
            }

            let events = self.next_events(scheduler);
            if let ControlFlow::Break(()) = self.process_ticker_events(scheduler, events) {
                break;
            }
        }

        tracing::debug!(worker = self.index, "worker stopped");
    }

    fn next_events(&self, scheduler: &Scheduler) -> TickerEvents {
        self.ticker.borrow_mut().tick(scheduler, &mut *self.cfg.borrow_mut())
    }

    #[inline(always)]
    fn process_ticker_events(&self, scheduler: &Scheduler, events: TickerEvents) -> ControlFlow<()> {
        if events.contains(TickerEvents::SHUTDOWN) {
            return ControlFlow::Break(());
        }

        if events.contains(TickerEvents::POP_GLOBAL_QUEUE) {
            self.pop_global_queue.set(true);
        }

        if events.contains(TickerEvents::PROGRESS) {
            scheduler.progress();
        }

        ControlFlow::Continue(())
    }
}

#[derive(Debug, Clone)]
struct EventLoopConfig {
    global_queue_interval: u32,

    progress_interval: u32,

    max_steal_retries: usize,
}

impl EventLoopConfig {
    #[inline(always)]
    fn should_pop_global_queue(&self, tick: u32) -> bool {
        tick.is_multiple_of(self.global_queue_interval)
    }

    #[inline(always)]
    fn should_progress(&self, tick: u32) -> bool {
        tick.is_multiple_of(self.progress_interval)
    }
}

impl From<&RuntimeConfig> for EventLoopConfig {
    fn from(cfg: &RuntimeConfig) -> EventLoopConfig {
        EventLoopConfig {
            global_queue_interval: cfg.global_queue_interval,
            progress_interval: cfg.progress_interval,
            max_steal_retries: cfg.max_steal_retries,
        }
    }
}

impl TickerData for EventLoopConfig {
    type Context = Scheduler;

    #[inline(always)]
    fn update_and_check(&mut self, ctx: &Self::Context, tick: u32) -> TickerEvents {
        if ctx.shared.is_shutdown() {
            return TickerEvents::SHUTDOWN;
        }

        let mut events = TickerEvents::empty();

        if self.should_pop_global_queue(tick) {
            events.insert(TickerEvents::POP_GLOBAL_QUEUE);
        }

        if self.should_progress(tick) {
            events.insert(TickerEvents::PROGRESS);
        }

        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(Worker: Send);

    fn task(index: u32) -> TaskRef {
        TaskRef {
            index,
            generation: 0,
        }
    }

    fn worker(stealers: Vec<Stealer<TaskRef>>) -> Worker {
        Worker::new(0, &RuntimeConfig::for_tests(), CbWorker::new_lifo(), stealers)
    }

    #[test]
    fn test_local_queue_is_lifo() {
        let worker = worker(Vec::new());
        let global = Injector::new();

        worker.push_local(task(1));
        worker.push_local(task(2));

        assert_eq!(worker.find_task(&global), Some(task(2)));
        assert_eq!(worker.find_task(&global), Some(task(1)));
        assert_eq!(worker.find_task(&global), None);
    }

    #[test]
    fn test_pop_global_queue_first_when_flagged() {
        let worker = worker(Vec::new());
        let global = Injector::new();

        worker.push_local(task(1));
        global.push(task(9));

        worker.pop_global_queue.set(true);
        assert_eq!(worker.find_task(&global), Some(task(9)));
        assert_eq!(worker.find_task(&global), Some(task(1)));
    }

    #[test]
    fn test_ticker_reports_shutdown() -> anyhow::Result<()> {
        let scheduler = Scheduler::new(RuntimeConfig::for_tests())?.into_handle();
        let worker = worker(Vec::new());

        assert!(!worker.next_events(&scheduler).contains(TickerEvents::SHUTDOWN));

        scheduler.shared.begin_shutdown();
        assert!(worker.next_events(&scheduler).contains(TickerEvents::SHUTDOWN));
        Ok(())
    }

    #[test]
    fn test_steals_from_peer() {
        let peer = CbWorker::new_lifo();
        peer.push(task(3));
        peer.push(task(4));

        let worker = worker(vec![peer.stealer()]);
        let global = Injector::new();

        // Thieves take the oldest task.
        assert_eq!(worker.find_task(&global), Some(task(3)));
        assert_eq!(peer.pop(), Some(task(4)));
    }
}
