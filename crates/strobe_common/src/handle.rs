//! Opaque handle types for simulator signals and registered callbacks.
//!
//! Handles are plain integer newtypes so that the scheduler core never
//! depends on any particular simulator's object model. The backend hands
//! them out and is the only component that can interpret them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identifier for a signal inside the simulator.
///
/// The backend allocates these; the scheduler only uses them as keys into
/// its write buffer and edge-trigger interning registry. Handles are ordered
/// so the write buffer flushes in a deterministic handle order.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct SignalHandle(u32);

impl SignalHandle {
    /// Creates a `SignalHandle` from a raw index.
    pub fn from_raw(index: u32) -> Self {
        Self(index)
    }

    /// Returns the raw index.
    pub fn as_raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for SignalHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sig#{}", self.0)
    }
}

/// Opaque identifier for a callback registration inside the backend.
///
/// The zero handle is reserved: backends return it when a registration
/// fails (matching the timed-callback failure convention), so
/// [`CallbackHandle::is_valid`] distinguishes success from failure.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct CallbackHandle(u64);

impl CallbackHandle {
    /// The reserved "registration failed" handle.
    pub const INVALID: CallbackHandle = CallbackHandle(0);

    /// Creates a `CallbackHandle` from a raw value.
    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    pub fn as_raw(self) -> u64 {
        self.0
    }

    /// Returns true if this handle denotes a live registration.
    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for CallbackHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cb#{}", self.0)
    }
}
