//! In-process simulator backend for exercising the Strobe scheduler.
//!
//! [`WheelHandle`] is a small discrete-event wheel implementing
//! [`SimulatorBackend`](strobe_sched::SimulatorBackend): timed callbacks in
//! a binary heap, value-change callbacks fired synchronously from signal
//! writes, and per-time-step region queues (read-write sync, read-only,
//! next-step) sequenced the way an event-driven HDL simulator sequences
//! them. It exists for regressions and examples; it is not a simulator of
//! any particular design, just of the callback contract.

#![warn(missing_docs)]

mod wheel;

pub use wheel::WheelHandle;
