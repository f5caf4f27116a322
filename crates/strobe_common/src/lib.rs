//! Shared foundational types for the Strobe co-simulation framework.
//!
//! This crate provides simulation time with femtosecond resolution and delta
//! cycle tracking, time unit conversion, and the opaque handle types used to
//! identify simulator signals and registered callbacks.

#![warn(missing_docs)]

pub mod handle;
pub mod time;

pub use handle::{CallbackHandle, SignalHandle};
pub use time::{SimTime, TimeUnit, FS_PER_MS, FS_PER_NS, FS_PER_PS, FS_PER_US};
