use crate::context;
use crate::runtime::affinity;
use crate::runtime::scheduler::Handle;
use crate::runtime::worker::Worker;
use crate::task::TaskRef;
use anyhow::{Context as _, Result, anyhow};
use crossbeam_deque::{Stealer, Worker as CbWorker};
use parking_lot::{Condvar, Mutex};
use std::rc::Rc;
use std::sync::Arc;
use std::thread;

/// Counts down once per worker that finished its setup.
#[derive(Debug)]
struct StartLatch {
    remaining: Mutex<usize>,
    done: Condvar,
}

impl StartLatch {
    fn new(count: usize) -> Self {
        Self {
            remaining: Mutex::new(count),
            done: Condvar::new(),
        }
    }

    fn count_down(&self) {
        let mut remaining = self.remaining.lock();
        *remaining = remaining.saturating_sub(1);
        if *remaining == 0 {
            self.done.notify_all();
        }
    }

    fn wait(&self) {
        let mut remaining = self.remaining.lock();
        while *remaining > 0 {
            self.done.wait(&mut remaining);
        }
    }
}

/// The worker threads of a runtime.
#[derive(Debug)]
pub(crate) struct ThreadPool {
    /// Stealers for every worker deque, used by threads participating in a
    /// drain from outside the pool.
    stealers: Vec<Stealer<TaskRef>>,

    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl ThreadPool {
    pub(crate) fn new(scheduler: &Handle) -> Result<Self> {
        let num_workers = scheduler.cfg.worker_threads;

        let mut local_queues = Vec::with_capacity(num_workers);
        let mut stealers = Vec::with_capacity(num_workers);

        for _ in 0..num_workers {
            let w = CbWorker::new_lifo();
            stealers.push(w.stealer());
            local_queues.push(w);
        }

        let workers = local_queues
            .into_iter()
            .enumerate()
            .map(|(i, local_queue)| {
                // Give each worker a list of all *other* workers' stealers.
                let other_stealers = stealers
                    .iter()
                    .enumerate()
                    .filter(|(j, _)| *j != i)
                    .map(|(_, s)| s.clone())
                    .collect::<Vec<_>>();

                Worker::new(i, &scheduler.cfg, local_queue, other_stealers)
            })
            .collect::<Vec<_>>();

        let latch = Arc::new(StartLatch::new(num_workers));
        let mut handles = Vec::with_capacity(num_workers);

        for worker in workers {
            match spawn_worker_thread(scheduler.clone(), worker, Arc::clone(&latch)) {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    // Stop the threads already running before bailing out.
                    scheduler.shared.begin_shutdown();
                    join_workers(handles);
                    return Err(e);
                }
            }
        }

        // Spawning is asynchronous, wait until every worker has its context.
        latch.wait();

        Ok(Self {
            stealers,
            handles: Mutex::new(handles),
        })
    }

    pub(crate) fn stealers(&self) -> &[Stealer<TaskRef>] {
        &self.stealers
    }

    pub(crate) fn join_all(&self) -> Result<()> {
        let handles = std::mem::take(&mut *self.handles.lock());

        let panicked = join_workers(handles);
        if panicked == 0 {
            Ok(())
        } else {
            Err(anyhow!("{panicked} worker thread(s) panicked"))
        }
    }
}

/// Joins every handle and returns how many of the threads panicked.
fn join_workers(handles: Vec<thread::JoinHandle<()>>) -> usize {
    handles
        .into_iter()
        .filter_map(|handle| {
            let name = handle.thread().name().unwrap_or("<unnamed>").to_owned();
            let payload = handle.join().err()?;
            let reason = payload
                .downcast_ref::<&str>()
                .copied()
                .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
                .unwrap_or("non-string panic payload");
            tracing::error!(thread = %name, "worker thread panicked: {reason}");
            Some(())
        })
        .count()
}

fn spawn_worker_thread(
    scheduler: Handle,
    worker: Worker,
    latch: Arc<StartLatch>,
) -> Result<thread::JoinHandle<()>> {
    let name = scheduler.cfg.thread_name.0();

    thread::Builder::new()
        .name(name.clone())
        .spawn(move || {
            let index = worker.index;
            affinity::pin_current(scheduler.cfg.affinity, index, scheduler.cfg.worker_threads);

            let worker = Rc::new(worker);
            context::init_worker_context(scheduler.clone(), Rc::clone(&worker));
            latch.count_down();

            worker.event_loop(&scheduler);

            drop(worker);
            context::clear_context();
        })
        .with_context(|| format!("failed to spawn worker thread {name:?}"))
}
