//! Testbench-facing view of one design signal.

use std::fmt;

use strobe_common::SignalHandle;

use crate::backend::EdgeKind;
use crate::error::SchedError;
use crate::scheduler::Scheduler;
use crate::trigger::Trigger;

/// A named design signal bound to a scheduler.
///
/// Reads go straight to the backend; writes go through the scheduler's
/// write buffer by default, so testbench drives land at the next write-back
/// phase instead of mid-evaluation.
#[derive(Clone)]
pub struct Signal {
    sched: Scheduler,
    handle: SignalHandle,
    name: String,
}

impl Signal {
    pub(crate) fn new(sched: Scheduler, handle: SignalHandle, name: impl Into<String>) -> Self {
        Self {
            sched,
            handle,
            name: name.into(),
        }
    }

    /// Returns the backend handle of this signal.
    pub fn handle(&self) -> SignalHandle {
        self.handle
    }

    /// Returns the signal's hierarchical name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Reads the current value from the backend.
    pub fn value(&self) -> u64 {
        self.sched.read_signal(self.handle)
    }

    /// Buffers a write, applied at the next write-back phase.
    ///
    /// Later writes to the same signal before the flush overwrite earlier
    /// ones. Fails during the read-only phase.
    pub fn set(&self, value: u64) -> Result<(), SchedError> {
        self.sched.save_write(self.handle, value)
    }

    /// Writes the signal immediately, bypassing the write buffer.
    ///
    /// May cascade into value-change callbacks before returning; intended
    /// for initialization and forcing, not for ordinary driving.
    pub fn set_immediate(&self, value: u64) {
        self.sched.write_signal_immediate(self.handle, value);
    }

    /// Returns the interned rising-edge trigger for this signal.
    pub fn rising_edge(&self) -> Trigger {
        self.sched.edge_trigger(self.handle, EdgeKind::Rising)
    }

    /// Returns the interned falling-edge trigger for this signal.
    pub fn falling_edge(&self) -> Trigger {
        self.sched.edge_trigger(self.handle, EdgeKind::Falling)
    }

    /// Returns the interned any-change trigger for this signal.
    pub fn any_edge(&self) -> Trigger {
        self.sched.edge_trigger(self.handle, EdgeKind::Any)
    }
}

impl fmt::Debug for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signal({} = {})", self.name, self.handle)
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}
