//! Cooperative coroutine scheduler for hardware co-simulation.
//!
//! `strobe_sched` bridges an event-driven simulator and async Rust
//! testbench code. Testbench behavior is written as ordinary `async`
//! functions that await [`Trigger`]s (timers, signal edges, simulation
//! phase boundaries, task completion, events, lock grants); the scheduler
//! suspends and resumes those tasks from the simulator's callbacks, one at
//! a time, on a single thread.
//!
//! The core pieces:
//!
//! - [`Scheduler`]: the dispatcher. Owns the trigger/waiter index, the
//!   deferred write buffer, and the react loop that turns simulator
//!   callbacks into task resumptions.
//! - [`SimulatorBackend`]: the capability a simulator adapter implements;
//!   the scheduler talks to nothing else.
//! - [`Trigger`] and the combinators in [`combine`]: what tasks await.
//! - [`Event`] and [`Lock`]: host-side coordination between tasks.
//! - [`Runner`]: sequential regression execution with per-test schedulers
//!   and machine-readable reports.
//!
//! ```no_run
//! use strobe_common::{SignalHandle, TimeUnit};
//! use strobe_sched::{check, Scheduler, Val};
//!
//! async fn toggle(sched: Scheduler) -> strobe_sched::TaskResult {
//!     let clk = sched.signal(SignalHandle::from_raw(0), "top.clk");
//!     clk.set(0)?;
//!     sched.timer(5, TimeUnit::Ns).await?;
//!     clk.set(1)?;
//!     clk.rising_edge().await?;
//!     check!(clk.value() == 1);
//!     Ok(Val::None)
//! }
//! ```

#![warn(missing_docs)]

pub mod backend;
pub mod combine;
pub mod error;
pub mod external;
pub mod runner;
pub mod scheduler;
pub mod signal;
pub mod sync;
pub mod task;
pub mod trigger;

pub use backend::{EdgeKind, SimCallback, SimulatorBackend};
pub use combine::{clock_cycles, combine, first, with_timeout, WaitAny};
pub use error::SchedError;
pub use external::ExternalBridge;
pub use runner::{Runner, Session, SessionDriver, TestCase, TestFuture, TestOutcome, TestReport};
pub use scheduler::{DispatchState, Scheduler, SimPhase};
pub use signal::Signal;
pub use sync::{Event, Lock};
pub use task::{TaskHandle, TaskId, TaskOutcome, TaskResult, TaskState, TestFail, Val};
pub use trigger::{Trigger, TriggerId, TriggerKind};
