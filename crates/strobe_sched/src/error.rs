//! Scheduler error types for the Strobe co-simulation core.
//!
//! All usage errors and infrastructure failures that can occur while
//! scheduling testbench tasks are represented as variants of [`SchedError`].
//! Errors are values: they propagate to the failing task's joiner, or become
//! the test outcome when the test entry point itself fails.

use strobe_common::SignalHandle;

/// Errors that can occur while scheduling testbench tasks.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SchedError {
    /// A buffered write was attempted during the read-only phase.
    #[error("illegal write to {handle} during read-only phase")]
    ReadOnlyWrite {
        /// The signal the write targeted.
        handle: SignalHandle,
    },

    /// A trigger was primed twice without an intervening fire.
    ///
    /// This indicates a bookkeeping bug in the scheduler itself, checked
    /// defensively.
    #[error("trigger {trigger} primed twice without an intervening fire")]
    DoublePrime {
        /// Description of the offending trigger.
        trigger: String,
    },

    /// The backend refused to register a callback for a trigger.
    #[error("failed to prime trigger {trigger}: {reason}")]
    PrimeFailed {
        /// Description of the trigger being primed.
        trigger: String,
        /// Why the registration failed.
        reason: String,
    },

    /// A trigger was awaited outside of a scheduled task.
    #[error("trigger awaited outside of a scheduled task")]
    AwaitOutsideTask,

    /// A task suspended on something that is not a scheduler trigger.
    ///
    /// Task futures may only suspend by awaiting Strobe triggers; a future
    /// that returns `Pending` without registering any trigger would hang
    /// forever and is failed instead.
    #[error("task '{name}' suspended without awaiting a scheduler trigger")]
    StrandedTask {
        /// Name of the offending task.
        name: String,
    },

    /// `release()` was called on a lock that is not currently held.
    #[error("lock released while not held")]
    ReleaseUnheld,

    /// A wait-for-any was constructed with no triggers.
    #[error("wait-for-any requires at least one trigger")]
    EmptyWait,

    /// A joined child task failed or was cancelled.
    #[error("task '{name}' failed: {message}")]
    TaskFailed {
        /// Name of the failed task.
        name: String,
        /// Description of the failure.
        message: String,
    },

    /// A composed wait was resolved by its timeout timer.
    #[error("operation timed out after {after_fs} fs")]
    Timeout {
        /// The timeout duration in femtoseconds.
        after_fs: u64,
    },

    /// The scheduler is tearing down and no longer accepts work.
    #[error("scheduler is terminating")]
    Terminated,

    /// The external worker thread panicked while running a blocking call.
    #[error("external worker thread panicked")]
    WorkerPanicked,

    /// The external bridge mutex state was poisoned.
    #[error("external bridge state poisoned")]
    BridgePoisoned,
}
