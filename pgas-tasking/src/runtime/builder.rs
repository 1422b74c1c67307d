use crate::errors::TaskingError;
use crate::runtime::affinity::AffinityPolicy;
use crate::runtime::runtime::Runtime;
use crate::transport::{InProcFabric, TEAM_ALL, Transport, UnitId};
use std::convert::TryFrom;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

/// Default size of a task stack.
const STACK_SIZE: usize = 64 * 1024;

/// Smallest task stack we accept. Below that the guard page and the runtime
/// frames leave nothing for the task.
const MIN_STACK_SIZE: usize = 16 * 1024;

/// Default number of task descriptors.
const POOL_CAPACITY: usize = 64 * 1024;

/// Stacks kept around for reuse.
const MAX_POOLED_CONTEXTS: usize = 256;

/// Global queue interval default value.
const GLOBAL_QUEUE_INTERVAL: u32 = 31;

/// Ticks between two progress calls of a busy worker.
#[cfg(not(test))]
const PROGRESS_INTERVAL: u32 = 61;

#[cfg(test)]
const PROGRESS_INTERVAL: u32 = 8; // make tests tick faster

/// Maximum number of stealing attempts.
const MAX_STEAL_RETRIES: usize = 3;

/// Upper bound on how long an idle thread sleeps without polling the
/// transport.
const PARK_TIMEOUT: Duration = Duration::from_millis(1);

pub(crate) const ENV_NUM_WORKERS: &str = "NUM_WORKERS";
pub(crate) const ENV_STACK_SIZE: &str = "STACK_SIZE";
pub(crate) const ENV_POOL_CAPACITY: &str = "POOL_CAPACITY";
pub(crate) const ENV_AFFINITY_POLICY: &str = "AFFINITY_POLICY";

#[derive(Clone)]
pub(crate) struct ThreadNameFn(pub(crate) Arc<dyn Fn() -> String + Send + Sync + 'static>);

fn default_thread_name_fn() -> ThreadNameFn {
    let worker_count = Arc::new(AtomicUsize::new(0));

    ThreadNameFn(Arc::new(move || {
        let id = worker_count.fetch_add(1, Ordering::Relaxed);
        format!("pgas-worker-{id}")
    }))
}

impl fmt::Debug for ThreadNameFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ThreadNameFn").field(&"<function>").finish()
    }
}

/// Configures and starts a [`Runtime`].
///
/// Settings left unset fall back to the `NUM_WORKERS`, `STACK_SIZE`,
/// `POOL_CAPACITY` and `AFFINITY_POLICY` environment variables, then to
/// built-in defaults.
pub struct Builder {
    /// Worker threads, not counting the thread that owns the runtime.
    worker_threads: Option<usize>,

    /// Stack size of every task context.
    stack_size: Option<usize>,

    /// Capacity of the task descriptor arena.
    pool_capacity: Option<usize>,

    affinity: Option<AffinityPolicy>,

    /// Name fn used for threads spawned by the runtime.
    thread_name: ThreadNameFn,

    /// How many ticks before pulling a task from the global queue.
    global_queue_interval: u32,

    /// Drive transport progress every N ticks even when busy.
    progress_interval: u32,

    /// How many times a worker will loop over the global queue and other
    /// workers' deques to find work before it drives progress and backs off.
    max_steal_retries: usize,

    park_timeout: Duration,

    /// `None` enables gating iff the team has more than one unit.
    phase_gating: Option<bool>,

    max_pooled_contexts: usize,

    /// Defaults to a private single-unit fabric.
    transport: Option<Arc<dyn Transport>>,
}

impl fmt::Debug for Builder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder")
            .field("worker_threads", &self.worker_threads)
            .field("stack_size", &self.stack_size)
            .field("pool_capacity", &self.pool_capacity)
            .field("affinity", &self.affinity)
            .field("phase_gating", &self.phase_gating)
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    pub fn new() -> Self {
        Self {
            worker_threads: None,
            stack_size: None,
            pool_capacity: None,
            affinity: None,
            thread_name: default_thread_name_fn(),
            global_queue_interval: GLOBAL_QUEUE_INTERVAL,
            progress_interval: PROGRESS_INTERVAL,
            max_steal_retries: MAX_STEAL_RETRIES,
            park_timeout: PARK_TIMEOUT,
            phase_gating: None,
            max_pooled_contexts: MAX_POOLED_CONTEXTS,
            transport: None,
        }
    }

    /// The number of worker threads. Defaults to one per hardware thread.
    ///
    /// The thread owning the runtime does not count: it takes part in
    /// scheduling only while it waits in `task_complete` or `wait_handle`.
    #[track_caller]
    pub fn worker_threads(mut self, val: usize) -> Self {
        assert!(val > 0, "worker_threads must be greater than 0");
        self.worker_threads = Some(val);
        self
    }

    /// Sets the stack size (in bytes) of task contexts. Defaults to 64 KiB.
    #[track_caller]
    pub fn stack_size(mut self, val: usize) -> Self {
        assert!(
            val >= MIN_STACK_SIZE,
            "stack_size must be at least {MIN_STACK_SIZE} bytes"
        );
        self.stack_size = Some(val);
        self
    }

    /// Sets the number of task descriptors. Creating a task while all of them
    /// are in use waits for one to retire.
    #[track_caller]
    pub fn pool_capacity(mut self, val: usize) -> Self {
        assert!(
            val > 0 && val <= u32::MAX as usize,
            "pool_capacity must be in 1..=u32::MAX"
        );
        self.pool_capacity = Some(val);
        self
    }

    pub fn affinity(mut self, policy: AffinityPolicy) -> Self {
        self.affinity = Some(policy);
        self
    }

    /// Sets name of threads spawned by the `Runtime`'s thread pool.
    ///
    /// The default name is "pgas-worker-{id}", where id is monotonically
    /// increasing.
    pub fn thread_name(mut self, val: impl Into<String>) -> Self {
        let val = val.into();
        self.thread_name = ThreadNameFn(Arc::new(move || val.clone()));
        self
    }

    /// Sets a function used to generate the name of threads spawned by the
    /// `Runtime`'s thread pool.
    pub fn thread_name_fn<F>(mut self, f: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.thread_name = ThreadNameFn(Arc::new(f));
        self
    }

    /// Sets the number of scheduler ticks after which a worker takes its next
    /// task from the global queue rather than its own deque.
    ///
    /// Yielded tasks and tasks released by other threads land in the global
    /// queue, a smaller value gets them running sooner at the cost of cache
    /// locality.
    #[track_caller]
    pub fn global_queue_interval(mut self, val: u32) -> Self {
        assert!(val > 0, "global_queue_interval must be greater than 0");
        self.global_queue_interval = val;
        self
    }

    /// Sets the number of ticks after which a busy worker drives transport
    /// progress. Idle workers always do.
    #[track_caller]
    pub fn progress_interval(mut self, val: u32) -> Self {
        assert!(val > 0, "progress_interval must be greater than 0");
        self.progress_interval = val;
        self
    }

    #[track_caller]
    pub fn max_steal_retries(mut self, val: usize) -> Self {
        assert!(val > 0, "max_steal_retries must be greater than 0");
        self.max_steal_retries = val;
        self
    }

    #[track_caller]
    pub fn park_timeout(mut self, val: Duration) -> Self {
        assert!(!val.is_zero(), "park_timeout must be greater than 0");
        self.park_timeout = val;
        self
    }

    /// Holds tasks back until their phase is released with
    /// `phase_set_runnable`. Enabled by default when the team has more than
    /// one unit.
    pub fn phase_gating(mut self, enabled: bool) -> Self {
        self.phase_gating = Some(enabled);
        self
    }

    pub fn max_pooled_contexts(mut self, val: usize) -> Self {
        self.max_pooled_contexts = val;
        self
    }

    /// The communication substrate of this unit.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Creates the configured `Runtime` and makes it current on this thread.
    pub fn try_build(self) -> Result<Runtime, TaskingError> {
        let cfg = RuntimeConfig::try_from(self)?;
        Runtime::start(cfg)
    }
}

// Export the builder as a RuntimeConfig object consumed by the scheduler and
// the workers.
#[derive(Debug, Clone)]
pub(crate) struct RuntimeConfig {
    pub(crate) worker_threads: usize,
    pub(crate) stack_size: usize,
    pub(crate) pool_capacity: usize,
    pub(crate) affinity: AffinityPolicy,
    pub(crate) thread_name: ThreadNameFn,
    pub(crate) global_queue_interval: u32,
    pub(crate) progress_interval: u32,
    pub(crate) max_steal_retries: usize,
    pub(crate) park_timeout: Duration,
    pub(crate) phase_gating: bool,
    pub(crate) max_pooled_contexts: usize,
    pub(crate) transport: Arc<dyn Transport>,
}

impl RuntimeConfig {
    /// Resolves a builder against the variables returned by `lookup`.
    pub(crate) fn from_lookup(
        builder: Builder,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, TaskingError> {
        let hw_threads = thread::available_parallelism().map_or(1, |n| n.get());

        let worker_threads = match builder.worker_threads {
            Some(n) => n,
            None => match parse_env(&lookup, ENV_NUM_WORKERS, parse_count)? {
                Some(n) => n.min(hw_threads),
                None => hw_threads,
            },
        };

        let stack_size = match builder.stack_size {
            Some(n) => n,
            None => parse_env(&lookup, ENV_STACK_SIZE, parse_size)?.unwrap_or(STACK_SIZE),
        };

        let pool_capacity = match builder.pool_capacity {
            Some(n) => n,
            None => parse_env(&lookup, ENV_POOL_CAPACITY, parse_count)?.unwrap_or(POOL_CAPACITY),
        };

        let affinity = match builder.affinity {
            Some(policy) => policy,
            None => parse_env(&lookup, ENV_AFFINITY_POLICY, |v| v.parse::<AffinityPolicy>())?.unwrap_or_default(),
        };

        let transport: Arc<dyn Transport> = match builder.transport {
            Some(transport) => transport,
            None => InProcFabric::single().transport(UnitId(0))? as Arc<dyn Transport>,
        };

        let team_size = transport.team_size(TEAM_ALL)?;

        let cfg = RuntimeConfig {
            worker_threads,
            stack_size,
            pool_capacity,
            affinity,
            thread_name: builder.thread_name,
            global_queue_interval: builder.global_queue_interval,
            progress_interval: builder.progress_interval,
            max_steal_retries: builder.max_steal_retries,
            park_timeout: builder.park_timeout,
            phase_gating: builder.phase_gating.unwrap_or(team_size > 1),
            max_pooled_contexts: builder.max_pooled_contexts,
            transport,
        };

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), TaskingError> {
        if self.worker_threads == 0 {
            return Err(TaskingError::Config("worker_threads must be greater than 0".into()));
        }

        if self.stack_size < MIN_STACK_SIZE {
            return Err(TaskingError::Config(format!(
                "stack size of {} bytes is below the minimum of {MIN_STACK_SIZE}",
                self.stack_size
            )));
        }

        if self.pool_capacity == 0 || self.pool_capacity > u32::MAX as usize {
            return Err(TaskingError::Config(format!(
                "pool capacity {} out of range",
                self.pool_capacity
            )));
        }

        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        RuntimeConfig::from_lookup(Builder::new().worker_threads(1), |_| None)
            .expect("default test config is valid")
    }
}

impl TryFrom<Builder> for RuntimeConfig {
    type Error = TaskingError;

    fn try_from(builder: Builder) -> Result<Self, Self::Error> {
        RuntimeConfig::from_lookup(builder, |key| std::env::var(key).ok())
    }
}

fn parse_env<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    parse: impl Fn(&str) -> Result<T, String>,
) -> Result<Option<T>, TaskingError> {
    lookup(key)
        .map(|raw| parse(raw.trim()).map_err(|e| TaskingError::Config(format!("{key}={raw:?}: {e}"))))
        .transpose()
}

fn parse_count(raw: &str) -> Result<usize, String> {
    match raw.parse::<usize>() {
        Ok(0) => Err("must be greater than 0".to_string()),
        Ok(n) => Ok(n),
        Err(e) => Err(e.to_string()),
    }
}

/// Parses a byte count with an optional `K` or `M` suffix.
fn parse_size(raw: &str) -> Result<usize, String> {
    let (digits, multiplier) = match raw.char_indices().last() {
        Some((i, 'k' | 'K')) => (&raw[..i], 1024),
        Some((i, 'm' | 'M')) => (&raw[..i], 1024 * 1024),
        _ => (raw, 1),
    };

    let value = parse_count(digits)?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| "size overflows".to_string())
}
