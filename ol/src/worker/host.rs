//! Host loop - the scheduling capability a foreign run loop must expose
//!
//! Subsystems that forbid cross-thread access (GUI toolkits, audio stacks)
//! own a greedy "run forever" loop on the worker thread. The pump never
//! blocks that loop; the host only has to call [`WorkerPump::tick`] from
//! its idle / zero-delay hook and exit its run loop when it observes
//! [`Tick::Quit`].

use std::thread;
use std::time::Duration;

use tracing::debug;

use super::pump::{Tick, WorkerPump};

/// A foreign run loop hosting the worker pump.
///
/// Implementations drive their own loop and invoke `pump.tick()` whenever
/// idle - a zero-interval timer in a toolkit loop, or a plain loop as in
/// [`IdleLoop`]. Termination on [`Tick::Quit`] is best-effort: a host that
/// is already gone has nothing left to stop.
pub trait HostLoop {
    /// Run the loop until the pump requests termination
    fn run(&mut self, pump: &mut WorkerPump);
}

/// Default host: a greedy loop standing in for a toolkit run loop.
///
/// Ticks continuously while commands are flowing and sleeps for the idle
/// wait when the queue is empty, which bounds per-command latency by the
/// idle wait.
pub struct IdleLoop {
    idle_wait: Duration,
}

impl IdleLoop {
    pub fn new(idle_wait: Duration) -> Self {
        Self { idle_wait }
    }
}

impl HostLoop for IdleLoop {
    fn run(&mut self, pump: &mut WorkerPump) {
        debug!(idle_wait_ms = self.idle_wait.as_millis() as u64, "IdleLoop: run loop starting");
        loop {
            match pump.tick() {
                Tick::Executed => {}
                Tick::Idle => thread::sleep(self.idle_wait),
                Tick::Quit => break,
            }
        }
        debug!("IdleLoop: run loop terminated");
    }
}
