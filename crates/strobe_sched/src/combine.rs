//! Composed waits: first-of, all-of, cycle counting, and timeouts.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use strobe_common::TimeUnit;

use crate::error::SchedError;
use crate::signal::Signal;
use crate::task::Val;
use crate::trigger::{Trigger, TriggerId, TriggerKind};

/// Future resolving when the first of a set of triggers fires.
///
/// Created by [`first`]. When the winner fires, the waiting task's
/// registrations on all the other triggers are dropped, and any of those
/// triggers left with no remaining waiters is unprimed, so no stale armed
/// callback lingers after the race resolves.
pub struct WaitAny {
    triggers: Vec<Trigger>,
}

impl WaitAny {
    /// Builds a first-of wait over the given triggers.
    pub fn new(triggers: Vec<Trigger>) -> Self {
        Self { triggers }
    }
}

impl Future for WaitAny {
    type Output = Result<Trigger, SchedError>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let Some(head) = self.triggers.first() else {
            return Poll::Ready(Err(SchedError::EmptyWait));
        };
        let sched = head.scheduler();
        let Some(task) = sched.current_task() else {
            return Poll::Ready(Err(SchedError::AwaitOutsideTask));
        };
        if let Some(fired) = sched.take_fired(task) {
            let winner = self
                .triggers
                .iter()
                .find(|t| t.id() == fired)
                .cloned()
                .unwrap_or_else(|| head.clone());
            return Poll::Ready(Ok(winner));
        }
        // A join trigger for an already-finished task wins without touching
        // the waiter index.
        for t in &self.triggers {
            if let Some(TriggerKind::Join { task: joined }) = t.kind() {
                if sched.task_finished(joined) {
                    return Poll::Ready(Ok(t.clone()));
                }
            }
        }
        let ids: Vec<TriggerId> = self.triggers.iter().map(|t| t.id()).collect();
        match sched.register_wait(task, &ids) {
            Ok(()) => Poll::Pending,
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

/// Waits for the first of `triggers` to fire and returns the winner.
///
/// Duplicate triggers in the set collapse to one registration. An empty
/// set is an error.
pub async fn first(triggers: Vec<Trigger>) -> Result<Trigger, SchedError> {
    WaitAny::new(triggers).await
}

/// Waits until every trigger in `triggers` has fired at least once.
///
/// Each trigger is awaited by its own helper task, so coincident fires in
/// one time step are all observed; the caller resumes after the last one.
/// An empty set resolves immediately.
pub async fn combine(triggers: Vec<Trigger>) -> Result<(), SchedError> {
    let Some(head) = triggers.first() else {
        return Ok(());
    };
    let sched = head.scheduler();
    let failure: Rc<RefCell<Option<SchedError>>> = Rc::new(RefCell::new(None));
    let mut children = Vec::with_capacity(triggers.len());
    for (i, trigger) in triggers.into_iter().enumerate() {
        let slot = failure.clone();
        // The helper reports errors through the shared slot and always
        // returns Ok, so a wait failure propagates to the caller here
        // instead of surfacing as an unrelated background-task failure.
        children.push(sched.spawn(format!("combine[{i}]"), async move {
            if let Err(e) = trigger.await {
                let mut slot = slot.borrow_mut();
                if slot.is_none() {
                    *slot = Some(e);
                }
            }
            Ok(Val::None)
        }));
    }
    for child in &children {
        child.join().await;
    }
    let failed = failure.borrow_mut().take();
    match failed {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Waits for `n` rising edges of `signal`.
pub async fn clock_cycles(signal: &Signal, n: u32) -> Result<(), SchedError> {
    for _ in 0..n {
        signal.rising_edge().await?;
    }
    Ok(())
}

/// Awaits `trigger`, failing with [`SchedError::Timeout`] if `amount`
/// `unit`s of simulated time elapse first.
///
/// The loser of the race is cleaned up: on success the timeout timer is
/// unprimed and retired, on timeout the trigger registration is dropped.
pub async fn with_timeout(
    trigger: Trigger,
    amount: u64,
    unit: TimeUnit,
) -> Result<(), SchedError> {
    let sched = trigger.scheduler();
    let timer = sched.timer(amount, unit);
    let winner = first(vec![trigger, timer.clone()]).await?;
    if winner == timer {
        Err(SchedError::Timeout {
            after_fs: unit.to_fs(amount),
        })
    } else {
        Ok(())
    }
}
