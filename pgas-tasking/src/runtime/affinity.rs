//! Worker pinning.
use std::fmt;
use std::str::FromStr;

/// How worker threads are pinned to cores.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AffinityPolicy {
    /// Leave placement to the OS.
    #[default]
    None,

    /// Worker `i` runs on core `i`, wrapping around.
    Compact,

    /// Workers are spread evenly over all cores.
    Scatter,
}

impl FromStr for AffinityPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(AffinityPolicy::None),
            "compact" => Ok(AffinityPolicy::Compact),
            "scatter" => Ok(AffinityPolicy::Scatter),
            other => Err(format!(
                "unknown affinity policy {other:?}, expected one of: compact, scatter, none"
            )),
        }
    }
}

impl fmt::Display for AffinityPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AffinityPolicy::None => "none",
            AffinityPolicy::Compact => "compact",
            AffinityPolicy::Scatter => "scatter",
        })
    }
}

/// Index of the core `worker` should run on, out of `num_cores`.
pub(crate) fn core_index(
    policy: AffinityPolicy,
    worker: usize,
    num_workers: usize,
    num_cores: usize,
) -> Option<usize> {
    if num_cores == 0 {
        return None;
    }

    match policy {
        AffinityPolicy::None => None,
        AffinityPolicy::Compact => Some(worker % num_cores),
        AffinityPolicy::Scatter => {
            let stride = (num_cores / num_workers.clamp(1, num_cores)).max(1);
            Some((worker * stride) % num_cores)
        }
    }
}

/// Pins the calling thread according to `policy`. Returns false if the
/// thread was left unpinned.
pub(crate) fn pin_current(policy: AffinityPolicy, worker: usize, num_workers: usize) -> bool {
    if policy == AffinityPolicy::None {
        return false;
    }

    let Some(cores) = core_affinity::get_core_ids() else {
        tracing::warn!(%policy, "core ids unavailable, worker left unpinned");
        return false;
    };

    let Some(core) = core_index(policy, worker, num_workers, cores.len()).map(|i| cores[i]) else {
        return false;
    };

    let pinned = core_affinity::set_for_current(core);
    if !pinned {
        tracing::warn!(%policy, worker, core = core.id, "failed to pin worker");
    }
    pinned
}
