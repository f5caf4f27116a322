//! Awaitable trigger conditions.
//!
//! A [`Trigger`] represents one condition a task can wait for: a timer
//! elapsing, a signal edge, a simulation phase boundary, another task
//! finishing, or a host-side notification (event set, lock granted). Trigger
//! instances for identical conditions are interned by the scheduler, so two
//! tasks awaiting the rising edge of the same signal share one instance and
//! one backend registration.
//!
//! Awaiting a `Trigger` suspends the current task until the condition fires.
//! Priming (registering the underlying callback) happens lazily on first
//! await; a fired trigger is unprimed and re-primes on the next await.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use strobe_common::{SignalHandle, SimTime};

use crate::backend::EdgeKind;
use crate::error::SchedError;
use crate::scheduler::Scheduler;
use crate::task::TaskId;

/// Unique identifier for a trigger within one scheduler.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct TriggerId(u64);

impl TriggerId {
    /// Creates a `TriggerId` from a raw value.
    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    pub fn as_raw(self) -> u64 {
        self.0
    }
}

/// The condition a trigger stands for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TriggerKind {
    /// Fires once after a simulated delay.
    Timer {
        /// The delay from the moment of priming.
        delay: SimTime,
    },
    /// Fires on a value-change of the matching polarity.
    Edge {
        /// The observed signal.
        signal: SignalHandle,
        /// The edge polarity.
        edge: EdgeKind,
    },
    /// Fires when the current time step reaches the read-only phase.
    ReadOnly,
    /// Fires at the read-write synchronization point of the time step.
    ReadWrite,
    /// Fires when the simulator moves to the next time step.
    NextTimeStep,
    /// Fires when the referenced task finishes.
    Join {
        /// The task whose completion is awaited.
        task: TaskId,
    },
    /// Fires when the owning [`Event`](crate::sync::Event) is set.
    Event {
        /// Scheduler-local id of the owning event.
        event: u64,
    },
    /// Fires when a queued lock acquirer is handed the lock.
    LockGrant {
        /// Scheduler-local id of the owning lock.
        lock: u64,
        /// FIFO position of this acquirer.
        seq: u64,
    },
    /// Internal: orders the write-buffer flush within the time step.
    WriteBack,
    /// Internal: advances from a read-only phase to the next writable step.
    AdvanceStep,
}

impl TriggerKind {
    /// Returns true if this condition is registered with the simulator
    /// backend (as opposed to the scheduler's host-side bookkeeping).
    pub fn is_backend(&self) -> bool {
        matches!(
            self,
            TriggerKind::Timer { .. }
                | TriggerKind::Edge { .. }
                | TriggerKind::ReadOnly
                | TriggerKind::ReadWrite
                | TriggerKind::NextTimeStep
                | TriggerKind::WriteBack
                | TriggerKind::AdvanceStep
        )
    }

    /// Returns true if the trigger is a single-use instance that is dropped
    /// from the registry after it fires (timers, lock grants).
    pub fn is_ephemeral(&self) -> bool {
        matches!(
            self,
            TriggerKind::Timer { .. } | TriggerKind::LockGrant { .. }
        )
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerKind::Timer { delay } => write!(f, "Timer({delay})"),
            TriggerKind::Edge { signal, edge } => match edge {
                EdgeKind::Rising => write!(f, "RisingEdge({signal})"),
                EdgeKind::Falling => write!(f, "FallingEdge({signal})"),
                EdgeKind::Any => write!(f, "Edge({signal})"),
            },
            TriggerKind::ReadOnly => write!(f, "ReadOnly"),
            TriggerKind::ReadWrite => write!(f, "ReadWrite"),
            TriggerKind::NextTimeStep => write!(f, "NextTimeStep"),
            TriggerKind::Join { task } => write!(f, "Join({task})"),
            TriggerKind::Event { event } => write!(f, "Event(#{event})"),
            TriggerKind::LockGrant { lock, seq } => write!(f, "LockGrant(#{lock}.{seq})"),
            TriggerKind::WriteBack => write!(f, "WriteBack"),
            TriggerKind::AdvanceStep => write!(f, "AdvanceStep"),
        }
    }
}

/// An awaitable trigger condition.
///
/// Cheap to clone; clones of an interned trigger compare equal and share the
/// same waiter bookkeeping. Obtained from the [`Scheduler`] constructors
/// (`timer`, `read_only`, ...), from [`Signal`](crate::signal::Signal) edge
/// methods, or from [`TaskHandle::join_trigger`](crate::task::TaskHandle).
#[derive(Clone)]
pub struct Trigger {
    sched: Scheduler,
    id: TriggerId,
}

impl Trigger {
    pub(crate) fn new(sched: Scheduler, id: TriggerId) -> Self {
        Self { sched, id }
    }

    /// Returns this trigger's identifier.
    pub fn id(&self) -> TriggerId {
        self.id
    }

    /// Returns a clone of the owning scheduler handle.
    pub fn scheduler(&self) -> Scheduler {
        self.sched.clone()
    }

    /// Returns the condition this trigger stands for.
    pub fn kind(&self) -> Option<TriggerKind> {
        self.sched.trigger_kind(self.id)
    }

    /// Returns true while a callback is registered for this trigger.
    pub fn is_primed(&self) -> bool {
        self.sched.trigger_primed(self.id)
    }
}

impl PartialEq for Trigger {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Trigger {}

impl fmt::Debug for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            Some(kind) => write!(f, "Trigger({kind})"),
            None => write!(f, "Trigger(<retired #{}>)", self.id.as_raw()),
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            Some(kind) => write!(f, "{kind}"),
            None => write!(f, "<retired #{}>", self.id.as_raw()),
        }
    }
}

impl Future for Trigger {
    type Output = Result<(), SchedError>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let sched = self.sched.clone();
        let Some(task) = sched.current_task() else {
            return Poll::Ready(Err(SchedError::AwaitOutsideTask));
        };
        // Resumption: the scheduler stores the fired trigger in the task's
        // mailbox just before polling it again.
        if sched.take_fired(task).is_some() {
            return Poll::Ready(Ok(()));
        }
        // Fast path: joining a task that already finished resolves without
        // touching the backend or the waiter index.
        if let Some(TriggerKind::Join { task: joined }) = sched.trigger_kind(self.id) {
            if sched.task_finished(joined) {
                return Poll::Ready(Ok(()));
            }
        }
        match sched.register_wait(task, &[self.id]) {
            Ok(()) => Poll::Pending,
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strobe_common::TimeUnit;

    #[test]
    fn trigger_id_raw_roundtrip() {
        let id = TriggerId::from_raw(9);
        assert_eq!(id.as_raw(), 9);
    }

    #[test]
    fn kind_display() {
        let t = TriggerKind::Timer {
            delay: SimTime::from_units(10, TimeUnit::Ns),
        };
        assert_eq!(t.to_string(), "Timer(10 ns)");
        let e = TriggerKind::Edge {
            signal: SignalHandle::from_raw(1),
            edge: EdgeKind::Rising,
        };
        assert_eq!(e.to_string(), "RisingEdge(sig#1)");
        assert_eq!(TriggerKind::ReadOnly.to_string(), "ReadOnly");
        assert_eq!(
            TriggerKind::Join {
                task: TaskId::from_raw(2)
            }
            .to_string(),
            "Join(task#2)"
        );
    }

    #[test]
    fn backend_vs_host_kinds() {
        assert!(TriggerKind::ReadWrite.is_backend());
        assert!(TriggerKind::WriteBack.is_backend());
        assert!(!TriggerKind::Event { event: 0 }.is_backend());
        assert!(!TriggerKind::Join {
            task: TaskId::from_raw(0)
        }
        .is_backend());
        assert!(!TriggerKind::LockGrant { lock: 0, seq: 0 }.is_backend());
    }

    #[test]
    fn ephemeral_kinds() {
        assert!(TriggerKind::Timer {
            delay: SimTime::zero()
        }
        .is_ephemeral());
        assert!(TriggerKind::LockGrant { lock: 1, seq: 2 }.is_ephemeral());
        assert!(!TriggerKind::ReadOnly.is_ephemeral());
        assert!(!TriggerKind::Edge {
            signal: SignalHandle::from_raw(0),
            edge: EdgeKind::Any,
        }
        .is_ephemeral());
    }
}
