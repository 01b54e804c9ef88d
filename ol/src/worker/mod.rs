//! Worker side - pump, host loop, and the worker entry point
//!
//! The worker is a dedicated OS thread owning a single-threaded host run
//! loop. Cached objects are confined to this thread; the command queue, the
//! result queue, and the liveness flag are the only crossing points.

mod host;
mod pump;

pub use host::{HostLoop, IdleLoop};
pub use pump::{Tick, WorkerPump};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cache::{ObjectCache, ObjectMap};
use crate::command::Command;

/// Zero-argument callable run once in the worker before the pump starts;
/// its return value is merged into the object cache.
pub type Initializer = Box<dyn FnOnce() -> ObjectMap + Send>;

/// Builds the host loop on the worker thread (hosts need not be `Send`)
pub type HostBuilder = Box<dyn FnOnce() -> Box<dyn HostLoop> + Send>;

/// Shared shutdown signal: set while the worker should keep polling,
/// cleared to request shutdown.
///
/// The set-to-cleared transition happens at most once per controller
/// lifetime; a cleared flag never comes back.
#[derive(Clone, Debug, Default)]
pub struct LivenessFlag {
    inner: Arc<FlagInner>,
}

#[derive(Debug, Default)]
struct FlagInner {
    set: AtomicBool,
    cleared: AtomicBool,
}

impl LivenessFlag {
    /// Create a flag in the initial (unset, uncleared) state
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set(&self) {
        debug!("LivenessFlag::set");
        self.inner.set.store(true, Ordering::SeqCst);
    }

    pub(crate) fn clear(&self) {
        if !self.inner.cleared.swap(true, Ordering::SeqCst) {
            debug!("LivenessFlag::clear");
        }
        self.inner.set.store(false, Ordering::SeqCst);
    }

    /// Whether the worker should keep polling
    pub fn is_set(&self) -> bool {
        self.inner.set.load(Ordering::SeqCst)
    }

    /// Whether the flag has ever been cleared
    pub fn was_cleared(&self) -> bool {
        self.inner.cleared.load(Ordering::SeqCst)
    }
}

/// Worker thread entry point.
///
/// Builds the cache, runs the initializer, then hands the pump to the host
/// loop until it observes a quit tick.
pub(crate) fn run_worker(
    alive: LivenessFlag,
    commands: mpsc::UnboundedReceiver<Command>,
    results: mpsc::UnboundedSender<Command>,
    initializer: Option<Initializer>,
    host_builder: HostBuilder,
) {
    let mut cache = ObjectCache::new();

    if let Some(initializer) = initializer {
        let seeded = initializer();
        info!(objects = seeded.len(), "worker: cache pre-seeded by initializer");
        if let Err(error) = cache.merge(seeded, false) {
            warn!(%error, "worker: initializer produced conflicting keys");
        }
    }

    let mut pump = WorkerPump::new(alive, commands, results, cache);
    let mut host = host_builder();

    debug!("worker: entering host run loop");
    host.run(&mut pump);
    debug!("worker: host run loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_liveness_flag_transitions() {
        let flag = LivenessFlag::new();
        assert!(!flag.is_set());
        assert!(!flag.was_cleared());

        flag.set();
        assert!(flag.is_set());
        assert!(!flag.was_cleared());

        flag.clear();
        assert!(!flag.is_set());
        assert!(flag.was_cleared());
    }

    #[test]
    fn test_liveness_flag_clear_is_terminal() {
        let flag = LivenessFlag::new();
        flag.set();
        flag.clear();
        flag.clear();
        assert!(!flag.is_set());
        assert!(flag.was_cleared());
    }

    #[test]
    fn test_liveness_flag_clones_share_state() {
        let flag = LivenessFlag::new();
        let other = flag.clone();
        flag.set();
        assert!(other.is_set());
        other.clear();
        assert!(!flag.is_set());
        assert!(flag.was_cleared());
    }
}
