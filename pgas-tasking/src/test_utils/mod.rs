use crate::runtime::{Builder, Runtime};
use crate::transport::{InProcFabric, Transport, UnitId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

mod recorder;
pub(crate) use recorder::Recorder;

/// Starts a runtime on the calling thread with `workers` workers.
#[must_use]
pub(crate) fn init_runtime(workers: usize, builder: Option<Builder>) -> anyhow::Result<Runtime> {
    let builder = builder.unwrap_or_default().worker_threads(workers);
    Ok(builder.try_build()?)
}

/// Runs `unit_main` once per unit of `fabric`, each on its own thread with its
/// own runtime, and returns the results in unit order.
pub(crate) fn run_units<F, R>(fabric: &InProcFabric, workers: usize, unit_main: F) -> Vec<R>
where
    F: Fn(UnitId, &Runtime) -> R + Send + Sync + 'static,
    R: Send + 'static,
{
    let unit_main = Arc::new(unit_main);

    let handles = fabric
        .transports()
        .into_iter()
        .map(|transport| {
            let unit_main = Arc::clone(&unit_main);
            thread::Builder::new()
                .name(format!("unit-{}", transport.my_unit()))
                .spawn(move || {
                    let unit = transport.my_unit();
                    let rt = Builder::new()
                        .worker_threads(workers)
                        .transport(transport as Arc<dyn Transport>)
                        .try_build()
                        .unwrap_or_else(|e| panic!("failed to build runtime of {unit}: {e}"));

                    let result = unit_main(unit, &rt);
                    rt.fini();
                    result
                })
                .unwrap_or_else(|e| panic!("failed to spawn unit thread: {e}"))
        })
        .collect::<Vec<_>>();

    handles
        .into_iter()
        .map(|h| match h.join() {
            Ok(result) => result,
            Err(payload) => std::panic::resume_unwind(payload),
        })
        .collect()
}

/// Counts how many tasks of a group run at the same time.
#[derive(Debug, Default)]
pub(crate) struct Concurrency {
    current: AtomicU64,
    max: AtomicU64,
}

impl Concurrency {
    pub(crate) fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::AcqRel) + 1;
        self.max.fetch_max(now, Ordering::AcqRel);
    }

    pub(crate) fn exit(&self) {
        self.current.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn max(&self) -> u64 {
        self.max.load(Ordering::Acquire)
    }
}

/// Remembers which thread ran each step of a task.
#[derive(Debug, Default)]
pub(crate) struct ThreadLog {
    steps: Mutex<HashMap<&'static str, (thread::ThreadId, Option<String>)>>,
}

impl ThreadLog {
    pub(crate) fn record(&self, step: &'static str) {
        let current = thread::current();
        let name = current.name().map(str::to_owned);
        self.steps.lock().insert(step, (current.id(), name));
    }

    /// True if `step` ran on `root` or on a worker named with `worker_prefix`.
    pub(crate) fn ran_on_runtime(
        &self,
        step: &'static str,
        root: thread::ThreadId,
        worker_prefix: &str,
    ) -> bool {
        self.steps.lock().get(step).is_some_and(|(id, name)| {
            *id == root || name.as_deref().is_some_and(|n| n.starts_with(worker_prefix))
        })
    }
}
