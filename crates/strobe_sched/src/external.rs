//! Bridge for running blocking host-native code off the scheduler thread.
//!
//! The scheduler is single-threaded and cooperative; a testbench that must
//! call into blocking host code (a reference model, a file format library,
//! a socket) would stall the whole simulation if it did so inline. The
//! bridge runs the closure on a worker thread and parks the scheduler
//! thread until it completes, so from the simulation's point of view the
//! call is instantaneous: no simulated time passes and no callbacks are
//! delivered while the worker runs.

use std::fmt;
use std::sync::Mutex;
use std::thread;

use crate::error::SchedError;

/// Serializes blocking host-native calls for one scheduler.
///
/// A gate mutex keeps at most one worker in flight relative to scheduler
/// state at a time. Worker panics are contained and surfaced as
/// [`SchedError::WorkerPanicked`] instead of unwinding through the
/// simulator's callback frames.
pub struct ExternalBridge {
    gate: Mutex<()>,
}

impl ExternalBridge {
    /// Creates a new bridge with no worker in flight.
    pub fn new() -> Self {
        Self {
            gate: Mutex::new(()),
        }
    }

    /// Runs `f` on a worker thread, blocking the calling thread until it
    /// returns.
    pub fn call<T, F>(&self, f: F) -> Result<T, SchedError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let _guard = self.gate.lock().map_err(|_| SchedError::BridgePoisoned)?;
        let worker = thread::Builder::new()
            .name("strobe-blocking".into())
            .spawn(f)
            .map_err(|e| {
                log::error!("failed to spawn blocking worker: {e}");
                SchedError::WorkerPanicked
            })?;
        // join() contains a worker panic rather than propagating it into
        // the simulator's callback frame.
        worker.join().map_err(|_| {
            log::error!("blocking worker panicked");
            SchedError::WorkerPanicked
        })
    }
}

impl Default for ExternalBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ExternalBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ExternalBridge")
    }
}
