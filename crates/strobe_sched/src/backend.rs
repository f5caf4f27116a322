//! The simulator backend capability consumed by the scheduler.
//!
//! The core never talks to a simulator directly; it registers callbacks and
//! performs signal I/O through [`SimulatorBackend`]. Vendor adapters (VPI,
//! VHPI, in-process kernels, the `strobe_harness` test wheel) implement this
//! trait; the scheduler consumes it as an opaque capability.

use serde::{Deserialize, Serialize};
use std::fmt;
use strobe_common::{CallbackHandle, SignalHandle, SimTime};

/// A one-shot callback handed to the backend.
///
/// Fired at most once; the registration is consumed by the fire. Callbacks
/// capture a weak scheduler handle, so a callback outliving its scheduler
/// fires into nothing.
pub type SimCallback = Box<dyn FnOnce()>;

/// Edge polarity for value-change callbacks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EdgeKind {
    /// 0 -> 1 transition on the least significant bit.
    Rising,
    /// 1 -> 0 transition on the least significant bit.
    Falling,
    /// Any change of the signal value.
    Any,
}

impl fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EdgeKind::Rising => "rising",
            EdgeKind::Falling => "falling",
            EdgeKind::Any => "any",
        };
        write!(f, "{s}")
    }
}

/// Callback registration and signal I/O provided by an external simulator.
///
/// Methods take `&self`: a backend may be re-entered while one of its own
/// callbacks is running (a flushed write can cascade into further
/// value-change callbacks), so implementations use interior mutability and
/// must not hold internal borrows while invoking callbacks.
pub trait SimulatorBackend {
    /// Registers a callback to fire after `delay` of simulated time.
    ///
    /// Returns [`CallbackHandle::INVALID`] if the registration failed.
    fn register_timed_callback(&self, delay: SimTime, cb: SimCallback) -> CallbackHandle;

    /// Registers a callback to fire when `signal` changes with the matching
    /// edge polarity.
    fn register_value_change_callback(
        &self,
        signal: SignalHandle,
        cb: SimCallback,
        edge: EdgeKind,
    ) -> CallbackHandle;

    /// Registers a callback to fire when the current time step reaches the
    /// read-only phase (all values settled, writes forbidden).
    fn register_readonly_callback(&self, cb: SimCallback) -> CallbackHandle;

    /// Registers a callback to fire at the read-write synchronization point
    /// of the current time step (buffered writes may be applied).
    fn register_readwrite_sync_callback(&self, cb: SimCallback) -> CallbackHandle;

    /// Registers a callback to fire when the simulator moves to the next
    /// time step.
    fn register_nextstep_callback(&self, cb: SimCallback) -> CallbackHandle;

    /// Cancels a registration that has not fired yet.
    ///
    /// Deregistering a handle that already fired (or was already cancelled)
    /// is a no-op.
    fn deregister_callback(&self, handle: CallbackHandle);

    /// Reads the current raw value of a signal.
    fn get_signal_value(&self, signal: SignalHandle) -> u64;

    /// Writes a signal immediately, bypassing the scheduler's write buffer.
    ///
    /// Used by the write-buffer flush and by the immediate-value testbench
    /// path; may cascade into value-change callbacks before returning.
    fn set_signal_value(&self, signal: SignalHandle, value: u64);
}
