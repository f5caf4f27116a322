//! Host-side coordination primitives: [`Event`] and [`Lock`].
//!
//! Both are purely scheduler-internal; they never register anything with
//! the simulator backend. Their triggers fire through the same react loop
//! as backend callbacks, so tasks blocked on an event or a lock resume
//! with the same ordering guarantees as any other waiter.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

use crate::error::SchedError;
use crate::scheduler::Scheduler;
use crate::task::Val;
use crate::trigger::{Trigger, TriggerId, TriggerKind};

/// A one-to-many notification with an optional data payload.
///
/// `set` wakes every task currently waiting and leaves the event in the
/// set state, so later waiters return immediately until [`Event::clear`].
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Event {
    inner: Rc<EventInner>,
}

struct EventInner {
    sched: Scheduler,
    trigger: Trigger,
    fired: Cell<bool>,
    data: RefCell<Option<Val>>,
}

impl Event {
    /// Creates a new, unset event on the given scheduler.
    pub fn new(sched: &Scheduler) -> Self {
        let event = sched.alloc_object_id();
        let trigger = sched.host_trigger(TriggerKind::Event { event });
        Self {
            inner: Rc::new(EventInner {
                sched: sched.clone(),
                trigger,
                fired: Cell::new(false),
                data: RefCell::new(None),
            }),
        }
    }

    /// Sets the event, waking all current waiters.
    ///
    /// The payload replaces any previous one. Setting an already-set event
    /// updates the payload and wakes any tasks that queued up since.
    pub fn set(&self, data: Option<Val>) {
        *self.inner.data.borrow_mut() = data;
        self.inner.fired.set(true);
        self.inner.sched.queue_fire(self.inner.trigger.id());
    }

    /// Resets the event to unset. The payload is kept until the next `set`.
    pub fn clear(&self) {
        self.inner.fired.set(false);
    }

    /// Returns true while the event is set.
    pub fn is_set(&self) -> bool {
        self.inner.fired.get()
    }

    /// Returns a copy of the current payload.
    pub fn data(&self) -> Option<Val> {
        self.inner.data.borrow().clone()
    }

    /// Returns the underlying trigger, for use in composed waits.
    ///
    /// Awaiting the raw trigger always blocks until the next `set`; use
    /// [`Event::wait`] for the level-sensitive behavior.
    pub fn trigger(&self) -> Trigger {
        self.inner.trigger.clone()
    }

    /// Waits until the event is set and returns the payload.
    ///
    /// Returns immediately if the event is already set.
    pub async fn wait(&self) -> Result<Option<Val>, SchedError> {
        if self.inner.fired.get() {
            return Ok(self.data());
        }
        self.inner.trigger.clone().await?;
        Ok(self.data())
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Event({}, {})",
            self.inner.trigger,
            if self.inner.fired.get() { "set" } else { "unset" }
        )
    }
}

/// A FIFO mutual-exclusion lock for tasks.
///
/// Contended acquirers queue in arrival order; `release` hands the lock
/// directly to the oldest queued acquirer (the lock never goes through an
/// unlocked state during a handover, so a late acquirer cannot barge in).
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Lock {
    inner: Rc<LockInner>,
}

struct LockInner {
    sched: Scheduler,
    id: u64,
    locked: Cell<bool>,
    queue: RefCell<VecDeque<TriggerId>>,
    next_seq: Cell<u64>,
}

impl Lock {
    /// Creates a new, unlocked lock on the given scheduler.
    pub fn new(sched: &Scheduler) -> Self {
        Self {
            inner: Rc::new(LockInner {
                sched: sched.clone(),
                id: sched.alloc_object_id(),
                locked: Cell::new(false),
                queue: RefCell::new(VecDeque::new()),
                next_seq: Cell::new(0),
            }),
        }
    }

    /// Returns true while some task holds the lock.
    pub fn locked(&self) -> bool {
        self.inner.locked.get()
    }

    /// Acquires the lock, queueing behind earlier contenders if necessary.
    pub async fn acquire(&self) -> Result<(), SchedError> {
        if !self.inner.locked.get() && self.inner.queue.borrow().is_empty() {
            self.inner.locked.set(true);
            return Ok(());
        }
        let seq = self.inner.next_seq.get();
        self.inner.next_seq.set(seq + 1);
        let grant = self.inner.sched.host_trigger(TriggerKind::LockGrant {
            lock: self.inner.id,
            seq,
        });
        self.inner.queue.borrow_mut().push_back(grant.id());
        // The grant fires after a release hands the lock to this acquirer;
        // the lock is already marked held when the await resolves.
        grant.await?;
        Ok(())
    }

    /// Releases the lock, handing it to the oldest queued acquirer.
    ///
    /// Queued acquirers whose task was killed while waiting are skipped.
    /// Releasing a lock that is not held is an error.
    pub fn release(&self) -> Result<(), SchedError> {
        if !self.inner.locked.get() {
            return Err(SchedError::ReleaseUnheld);
        }
        loop {
            let next = self.inner.queue.borrow_mut().pop_front();
            match next {
                Some(grant) => {
                    if self.inner.sched.has_waiters(grant) {
                        // Direct handover: `locked` stays true throughout.
                        self.inner.sched.queue_fire(grant);
                        return Ok(());
                    }
                    // Waiter killed before its grant; drop the stale entry.
                }
                None => {
                    self.inner.locked.set(false);
                    return Ok(());
                }
            }
        }
    }
}

impl fmt::Debug for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Lock(#{}, {}, {} queued)",
            self.inner.id,
            if self.inner.locked.get() {
                "held"
            } else {
                "free"
            },
            self.inner.queue.borrow().len()
        )
    }
}
