//! Task identity, results, and the testbench-facing task handle.
//!
//! A task wraps one strand of testbench logic as a resumable future. The
//! scheduler owns the future itself; testbench code holds a [`TaskHandle`]
//! which supports `join()` and `kill()`. Completion is an explicit tagged
//! result ([`TaskOutcome`]) rather than a thrown exception, so re-joining a
//! finished task returns the same cached outcome every time.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::{Future, IntoFuture};
use std::pin::Pin;

use crate::error::SchedError;
use crate::scheduler::Scheduler;
use crate::trigger::Trigger;

/// Unique identifier for a scheduled task.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct TaskId(u64);

impl TaskId {
    /// Creates a `TaskId` from a raw value.
    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    pub fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// Lifecycle state of a task.
///
/// A task is in exactly one state at any moment; `Finished` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    /// Spawned but not yet polled for the first time.
    NotStarted,
    /// Suspended, waiting on one or more triggers.
    Waiting,
    /// Currently being resumed by the scheduler.
    Running,
    /// Completed, failed, or cancelled; outcome is cached.
    Finished,
}

/// A small dynamic value returned by task bodies.
///
/// Testbench tasks frequently have nothing interesting to return (`None`),
/// or a scalar sampled from the design; a small enum avoids generic task
/// plumbing through the scheduler.
#[derive(Clone, Debug, PartialEq)]
pub enum Val {
    /// No value.
    None,
    /// A single bit.
    Bit(bool),
    /// An unsigned scalar.
    Int(u64),
    /// A text value.
    Str(String),
}

/// Why a task (or the test it belongs to) failed.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum TestFail {
    /// An explicit assertion-style check failed.
    #[error("assertion failed: {0}")]
    Assertion(String),

    /// A composed wait was resolved by its timeout timer.
    #[error("timed out")]
    Timeout,

    /// An infrastructure or usage error occurred.
    #[error(transparent)]
    Error(#[from] SchedError),
}

/// The result type returned by every task body.
pub type TaskResult = Result<Val, TestFail>;

/// The cached final outcome of a task.
#[derive(Clone, Debug, PartialEq)]
pub enum TaskOutcome {
    /// The task ran to completion with the given result.
    Completed(TaskResult),
    /// The task was forcibly killed before completing.
    Cancelled,
}

impl TaskOutcome {
    /// Returns true if the task completed with `Ok`.
    pub fn is_ok(&self) -> bool {
        matches!(self, TaskOutcome::Completed(Ok(_)))
    }

    /// Returns true if the task was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskOutcome::Cancelled)
    }
}

/// Handle to a spawned task.
///
/// Cheap to clone; all clones refer to the same task.
#[derive(Clone)]
pub struct TaskHandle {
    sched: Scheduler,
    id: TaskId,
}

impl TaskHandle {
    pub(crate) fn new(sched: Scheduler, id: TaskId) -> Self {
        Self { sched, id }
    }

    /// Returns this task's identifier.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Returns the task's completion trigger.
    ///
    /// The trigger is interned per task: every call returns the same
    /// instance, and awaiting it after the task finished resolves
    /// immediately.
    pub fn join_trigger(&self) -> Trigger {
        self.sched.join_trigger(self.id)
    }

    /// Returns true once the task has finished (by any path).
    pub fn is_finished(&self) -> bool {
        self.sched.task_finished(self.id)
    }

    /// Waits for the task to finish and returns its cached outcome.
    ///
    /// Joining an already-finished task resolves immediately with the same
    /// outcome, without re-running anything.
    pub async fn join(&self) -> TaskOutcome {
        if let Some(out) = self.sched.task_outcome(self.id) {
            return out;
        }
        if let Err(e) = self.join_trigger().await {
            return TaskOutcome::Completed(Err(TestFail::Error(e)));
        }
        self.sched
            .task_outcome(self.id)
            .unwrap_or(TaskOutcome::Cancelled)
    }

    /// Forcibly terminates the task.
    ///
    /// Synchronous: by the time this returns the task has been removed from
    /// every waiter index, any trigger left without waiters is unprimed, and
    /// the join trigger has been queued to fire with a cancellation outcome.
    /// Killing a finished task is a no-op.
    pub fn kill(&self) {
        self.sched.kill_task(self.id);
    }
}

/// Awaiting a handle directly is shorthand for [`TaskHandle::join`].
impl IntoFuture for TaskHandle {
    type Output = TaskOutcome;
    type IntoFuture = Pin<Box<dyn Future<Output = TaskOutcome>>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.join().await })
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskHandle({})", self.id)
    }
}

/// Fails the enclosing task with an assertion message unless `cond` holds.
///
/// Usable inside any function returning [`TaskResult`].
#[macro_export]
macro_rules! check {
    ($cond:expr) => {
        if !$cond {
            return Err($crate::task::TestFail::Assertion(format!(
                "check failed: {}",
                stringify!($cond)
            )));
        }
    };
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err($crate::task::TestFail::Assertion(format!($($arg)+)));
        }
    };
}
