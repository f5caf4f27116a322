//! The central dispatcher: trigger/waiter index, phase state machine, write
//! buffer, and the re-entrant react loop.
//!
//! [`Scheduler`] is an explicit, cloneable handle threaded through every
//! trigger, task, and primitive; there is no ambient global instance. All
//! task resumption happens on one logical thread of control driven by the
//! backend's callback delivery: concurrency is purely structural, tasks run
//! one at a time between await points.
//!
//! # The react loop
//!
//! A backend callback fires → [`Scheduler::react`] looks up the tasks
//! waiting on that trigger, pops the waiter list (before resuming anyone),
//! drops the resumed tasks' remaining multi-wait registrations, resumes
//! each task, then starts freshly spawned tasks and delivers queued
//! host-side fires until the world is settled. At outer nesting, one more
//! phase-advancement pass decides whether to prime the write-back or
//! advance-step bookkeeping trigger before control returns to the
//! simulator.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

use strobe_common::{SignalHandle, SimTime, TimeUnit};

use crate::backend::{EdgeKind, SimCallback, SimulatorBackend};
use crate::error::SchedError;
use crate::external::ExternalBridge;
use crate::runner::TestOutcome;
use crate::signal::Signal;
use crate::task::{TaskHandle, TaskId, TaskOutcome, TaskResult, TaskState, TestFail};
use crate::trigger::{Trigger, TriggerId, TriggerKind};

/// The simulation phase the scheduler believes the simulator is in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SimPhase {
    /// Writes may be buffered; normal evaluation.
    Normal,
    /// Settled-value sampling; writes are rejected.
    ReadOnly,
    /// Buffered writes are being applied to the backend.
    WriteBack,
}

/// The scheduler's dispatch state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchState {
    /// Waiting for the next backend callback.
    Idle,
    /// Inside a `react` call.
    Reacting,
    /// Tearing down; further callbacks are ignored.
    Terminating,
}

/// Priming state of one registered trigger condition.
struct TriggerState {
    /// The condition.
    kind: TriggerKind,
    /// Whether a callback is currently registered for this condition.
    primed: bool,
    /// The backend registration, for backend-sourced conditions.
    cb: Option<strobe_common::CallbackHandle>,
}

/// Scheduler-private per-task bookkeeping.
struct TaskEntry {
    /// Task name, for diagnostics.
    name: String,
    /// Lifecycle state.
    state: TaskState,
    /// The suspended computation; taken out while being polled.
    future: Option<Pin<Box<dyn Future<Output = TaskResult>>>>,
    /// Mailbox: the trigger that caused the pending resumption.
    fired: Option<TriggerId>,
    /// Cached final outcome once finished.
    outcome: Option<TaskOutcome>,
    /// The interned completion trigger.
    join_trigger: TriggerId,
}

struct SchedInner {
    backend: Box<dyn SimulatorBackend>,
    phase: Cell<SimPhase>,
    state: Cell<DispatchState>,
    react_depth: Cell<u32>,
    current: Cell<Option<TaskId>>,
    next_task_id: Cell<u64>,
    next_trigger_id: Cell<u64>,
    next_object_id: Cell<u64>,
    tasks: RefCell<HashMap<TaskId, TaskEntry>>,
    triggers: RefCell<HashMap<TriggerId, TriggerState>>,
    edge_triggers: RefCell<HashMap<(SignalHandle, EdgeKind), TriggerId>>,
    waiters: RefCell<HashMap<TriggerId, Vec<TaskId>>>,
    wait_sets: RefCell<HashMap<TaskId, Vec<TriggerId>>>,
    writes: RefCell<BTreeMap<SignalHandle, u64>>,
    start_queue: RefCell<VecDeque<TaskId>>,
    fire_queue: RefCell<VecDeque<TriggerId>>,
    test_task: Cell<Option<TaskId>>,
    outcome: RefCell<Option<TestOutcome>>,
    bridge: ExternalBridge,
    readonly_id: TriggerId,
    readwrite_id: TriggerId,
    nextstep_id: TriggerId,
    writeback_id: TriggerId,
    advance_id: TriggerId,
}

/// Cloneable handle to the co-simulation scheduler.
///
/// All clones refer to the same scheduler state. The handle is deliberately
/// not `Send`: the scheduler is single-threaded cooperative, and the only
/// sanctioned cross-thread interaction is [`Scheduler::run_blocking`].
#[derive(Clone)]
pub struct Scheduler {
    inner: Rc<SchedInner>,
}

impl Scheduler {
    /// Creates a scheduler on top of the given simulator backend.
    pub fn new(backend: Box<dyn SimulatorBackend>) -> Self {
        let mut triggers = HashMap::new();
        let mut next = 1u64;
        let mut singleton = |kind: TriggerKind| {
            let id = TriggerId::from_raw(next);
            next += 1;
            triggers.insert(
                id,
                TriggerState {
                    kind,
                    primed: false,
                    cb: None,
                },
            );
            id
        };
        let readonly_id = singleton(TriggerKind::ReadOnly);
        let readwrite_id = singleton(TriggerKind::ReadWrite);
        let nextstep_id = singleton(TriggerKind::NextTimeStep);
        let writeback_id = singleton(TriggerKind::WriteBack);
        let advance_id = singleton(TriggerKind::AdvanceStep);

        Self {
            inner: Rc::new(SchedInner {
                backend,
                phase: Cell::new(SimPhase::Normal),
                state: Cell::new(DispatchState::Idle),
                react_depth: Cell::new(0),
                current: Cell::new(None),
                next_task_id: Cell::new(1),
                next_trigger_id: Cell::new(next),
                next_object_id: Cell::new(1),
                tasks: RefCell::new(HashMap::new()),
                triggers: RefCell::new(triggers),
                edge_triggers: RefCell::new(HashMap::new()),
                waiters: RefCell::new(HashMap::new()),
                wait_sets: RefCell::new(HashMap::new()),
                writes: RefCell::new(BTreeMap::new()),
                start_queue: RefCell::new(VecDeque::new()),
                fire_queue: RefCell::new(VecDeque::new()),
                test_task: Cell::new(None),
                outcome: RefCell::new(None),
                bridge: ExternalBridge::new(),
                readonly_id,
                readwrite_id,
                nextstep_id,
                writeback_id,
                advance_id,
            }),
        }
    }

    // ------------------------------------------------------------------
    // Trigger constructors
    // ------------------------------------------------------------------

    /// Creates a one-shot timer trigger.
    ///
    /// A zero-amount timer degenerates to the next available time step and
    /// is logged as a suspect usage.
    pub fn timer(&self, amount: u64, unit: TimeUnit) -> Trigger {
        if amount == 0 {
            log::warn!("zero-delay timer degenerates to the next available time step");
        }
        let delay = SimTime::from_units(amount, unit);
        let id = self.alloc_trigger(TriggerKind::Timer { delay });
        Trigger::new(self.clone(), id)
    }

    /// Returns the interned edge trigger for `(signal, edge)`.
    ///
    /// Repeated calls return the same instance, so set-equality bookkeeping
    /// in the waiter index never fragments across logically identical waits.
    pub fn edge_trigger(&self, signal: SignalHandle, edge: EdgeKind) -> Trigger {
        let key = (signal, edge);
        if let Some(&id) = self.inner.edge_triggers.borrow().get(&key) {
            return Trigger::new(self.clone(), id);
        }
        let id = self.alloc_trigger(TriggerKind::Edge { signal, edge });
        self.inner.edge_triggers.borrow_mut().insert(key, id);
        Trigger::new(self.clone(), id)
    }

    /// Returns the read-only phase trigger (per-scheduler singleton).
    pub fn read_only(&self) -> Trigger {
        Trigger::new(self.clone(), self.inner.readonly_id)
    }

    /// Returns the read-write synchronization trigger (singleton).
    pub fn read_write(&self) -> Trigger {
        Trigger::new(self.clone(), self.inner.readwrite_id)
    }

    /// Returns the next-time-step trigger (singleton).
    pub fn next_time_step(&self) -> Trigger {
        Trigger::new(self.clone(), self.inner.nextstep_id)
    }

    /// Wraps a backend signal handle in a testbench [`Signal`].
    pub fn signal(&self, handle: SignalHandle, name: impl Into<String>) -> Signal {
        Signal::new(self.clone(), handle, name)
    }

    pub(crate) fn host_trigger(&self, kind: TriggerKind) -> Trigger {
        Trigger::new(self.clone(), self.alloc_trigger(kind))
    }

    pub(crate) fn alloc_object_id(&self) -> u64 {
        let id = self.inner.next_object_id.get();
        self.inner.next_object_id.set(id + 1);
        id
    }

    fn alloc_trigger(&self, kind: TriggerKind) -> TriggerId {
        let raw = self.inner.next_trigger_id.get();
        self.inner.next_trigger_id.set(raw + 1);
        let id = TriggerId::from_raw(raw);
        self.inner.triggers.borrow_mut().insert(
            id,
            TriggerState {
                kind,
                primed: false,
                cb: None,
            },
        );
        id
    }

    // ------------------------------------------------------------------
    // Task lifecycle
    // ------------------------------------------------------------------

    /// Spawns a new task running `fut` concurrently with the caller.
    ///
    /// Tasks spawned from inside a running task are started before the
    /// current `react` call returns; tasks spawned from outside (setup
    /// code) are started immediately.
    pub fn spawn(
        &self,
        name: impl Into<String>,
        fut: impl Future<Output = TaskResult> + 'static,
    ) -> TaskHandle {
        let handle = self.spawn_deferred(name, fut);
        if self.inner.react_depth.get() == 0 {
            self.pump();
        }
        handle
    }

    /// Spawns `fut` as the test entry point tracked by this scheduler.
    ///
    /// Exactly one test runs per scheduler; its completion (by any path)
    /// produces the scheduler's single [`TestOutcome`] and tears down all
    /// remaining tasks and triggers.
    pub fn start_test(
        &self,
        name: impl Into<String>,
        fut: impl Future<Output = TaskResult> + 'static,
    ) -> TaskHandle {
        let handle = self.spawn_deferred(name, fut);
        self.inner.test_task.set(Some(handle.id()));
        if self.inner.react_depth.get() == 0 {
            self.pump();
        }
        handle
    }

    fn spawn_deferred(
        &self,
        name: impl Into<String>,
        fut: impl Future<Output = TaskResult> + 'static,
    ) -> TaskHandle {
        let name = name.into();
        let raw = self.inner.next_task_id.get();
        self.inner.next_task_id.set(raw + 1);
        let id = TaskId::from_raw(raw);
        let join_trigger = self.alloc_trigger(TriggerKind::Join { task: id });
        let cancelled = self.inner.state.get() == DispatchState::Terminating;
        self.inner.tasks.borrow_mut().insert(
            id,
            TaskEntry {
                name: name.clone(),
                state: if cancelled {
                    TaskState::Finished
                } else {
                    TaskState::NotStarted
                },
                future: if cancelled { None } else { Some(Box::pin(fut)) },
                fired: None,
                outcome: if cancelled {
                    Some(TaskOutcome::Cancelled)
                } else {
                    None
                },
                join_trigger,
            },
        );
        if !cancelled {
            log::debug!("spawn task '{name}' ({id})");
            self.inner.start_queue.borrow_mut().push_back(id);
        }
        TaskHandle::new(self.clone(), id)
    }

    /// Forcibly terminates a task (the `kill` path).
    ///
    /// Synchronous: removes the task from every waiter index, unprimes any
    /// trigger left with no waiters, caches a cancellation outcome, and
    /// queues the join trigger so joiners unblock immediately.
    pub(crate) fn kill_task(&self, id: TaskId) {
        let live = {
            let tasks = self.inner.tasks.borrow();
            matches!(tasks.get(&id), Some(e) if e.state != TaskState::Finished)
        };
        if !live {
            return;
        }
        log::debug!("kill {id}");
        self.unschedule(id);
        self.finish_task(id, TaskOutcome::Cancelled);
    }

    /// Removes a task from every trigger's waiter list, unpriming and
    /// dropping triggers whose waiter list becomes empty.
    fn unschedule(&self, id: TaskId) {
        let set = self
            .inner
            .wait_sets
            .borrow_mut()
            .remove(&id)
            .unwrap_or_default();
        let mut orphaned = Vec::new();
        {
            let mut waiters = self.inner.waiters.borrow_mut();
            for trig in set {
                if let Some(list) = waiters.get_mut(&trig) {
                    list.retain(|t| *t != id);
                    if list.is_empty() {
                        waiters.remove(&trig);
                        orphaned.push(trig);
                    }
                }
            }
        }
        for trig in orphaned {
            self.unprime_trigger(trig);
        }
    }

    fn finish_task(&self, id: TaskId, outcome: TaskOutcome) {
        let (join_trigger, failure) = {
            let mut tasks = self.inner.tasks.borrow_mut();
            let Some(entry) = tasks.get_mut(&id) else {
                return;
            };
            if entry.outcome.is_some() {
                return;
            }
            entry.state = TaskState::Finished;
            entry.future = None;
            entry.fired = None;
            entry.outcome = Some(outcome.clone());
            let failure = match &outcome {
                TaskOutcome::Completed(Err(f)) => Some(f.to_string()),
                _ => None,
            };
            (entry.join_trigger, failure)
        };
        // A task can finish while still holding multi-wait registrations
        // (kill, or a combinator that resolved early).
        self.unschedule(id);
        let has_joiners = self.inner.waiters.borrow().contains_key(&join_trigger);
        if has_joiners {
            self.queue_fire(join_trigger);
        }
        if self.inner.test_task.get() == Some(id) {
            self.finish_test(outcome_to_test(&outcome));
        } else if let Some(message) = failure {
            if !has_joiners {
                let name = self.task_name(id);
                log::error!("unhandled failure in background task '{name}': {message}");
                self.finish_test(TestOutcome::Error {
                    message: format!("unhandled failure in background task '{name}': {message}"),
                });
            }
        }
    }

    /// Records the test outcome (first outcome wins) and tears the run down:
    /// kills every unfinished task, unprimes every primed trigger, and
    /// primes a final bookkeeping timer so the backend observes the end of
    /// the run.
    pub fn finish_test(&self, outcome: TestOutcome) {
        {
            let mut slot = self.inner.outcome.borrow_mut();
            if slot.is_some() {
                // Later failures during teardown are suppressed, not queued.
                return;
            }
            *slot = Some(outcome.clone());
        }
        log::info!("test finished: {outcome}");
        self.inner.state.set(DispatchState::Terminating);
        let mut ids: Vec<TaskId> = self
            .inner
            .tasks
            .borrow()
            .iter()
            .filter(|(_, e)| e.state != TaskState::Finished)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        for id in ids {
            self.unschedule(id);
            let mut tasks = self.inner.tasks.borrow_mut();
            if let Some(entry) = tasks.get_mut(&id) {
                entry.state = TaskState::Finished;
                entry.future = None;
                if entry.outcome.is_none() {
                    entry.outcome = Some(TaskOutcome::Cancelled);
                }
            }
        }
        let mut primed: Vec<TriggerId> = self
            .inner
            .triggers
            .borrow()
            .iter()
            .filter(|(_, st)| st.primed)
            .map(|(id, _)| *id)
            .collect();
        primed.sort_unstable();
        for id in primed {
            self.unprime_trigger(id);
        }
        self.inner.start_queue.borrow_mut().clear();
        self.inner.fire_queue.borrow_mut().clear();
        let _ = self
            .inner
            .backend
            .register_timed_callback(SimTime::from_fs(1), Box::new(|| {}));
    }

    // ------------------------------------------------------------------
    // The react loop
    // ------------------------------------------------------------------

    /// Reacts to a fired trigger.
    ///
    /// Normally invoked through the callbacks the scheduler registers with
    /// the backend; exposed for backend adapters and tests.
    pub fn react(&self, trigger: &Trigger) {
        self.react_by_id(trigger.id());
    }

    pub(crate) fn react_by_id(&self, fired: TriggerId) {
        let inner = &self.inner;
        if inner.state.get() == DispatchState::Terminating {
            return;
        }
        let Some(kind) = self.trigger_kind(fired) else {
            log::error!("callback fired for unknown trigger #{}", fired.as_raw());
            return;
        };
        let outer = inner.react_depth.get() == 0;
        inner.react_depth.set(inner.react_depth.get() + 1);
        if outer {
            inner.state.set(DispatchState::Reacting);
        }
        log::debug!("react: {kind}");

        // The fire consumes the registration; the backend handle is already
        // spent, so this never double-deregisters.
        if let Some(st) = inner.triggers.borrow_mut().get_mut(&fired) {
            st.primed = false;
            st.cb = None;
        }

        // Phase bookkeeping: the read-only callback enters the read-only
        // phase; any other real simulator callback re-enables writes.
        if kind == TriggerKind::ReadOnly {
            inner.phase.set(SimPhase::ReadOnly);
        } else if kind.is_backend() {
            inner.phase.set(SimPhase::Normal);
        }

        if fired == inner.writeback_id {
            // Ordering-only path: apply pending writes relative to the
            // other phase callbacks. Never resumes tasks.
            self.flush_writes();
            self.finish_react(outer, &kind);
            return;
        }
        if fired == inner.advance_id {
            if inner.writes.borrow().is_empty() {
                log::error!("advance-step trigger fired with no pending writes (bookkeeping bug)");
            } else if let Err(e) = self.prime_trigger(inner.writeback_id) {
                log::error!("failed to prime write-back trigger: {e}");
            }
            self.finish_react(outer, &kind);
            return;
        }

        // A user-visible read-write fire applies pending writes before its
        // waiters resume, so "buffer a write, await ReadWrite" observes the
        // flushed value.
        if kind == TriggerKind::ReadWrite {
            self.flush_writes();
        }

        // Pop, don't peek: re-entrant waits during resumption must not see
        // stale waiter lists (each task resumes exactly once per fire).
        let waiting = inner
            .waiters
            .borrow_mut()
            .remove(&fired)
            .unwrap_or_default();
        if waiting.is_empty() && kind.is_backend() {
            log::error!("backend trigger {kind} fired with no tasks waiting (prime/unprime bug)");
        }

        // Multi-wait cleanup: every other trigger these tasks were waiting
        // on loses them as waiters; triggers left with no waiters are
        // unprimed so no stale armed callback lingers.
        let mut orphaned = Vec::new();
        {
            let mut wait_sets = inner.wait_sets.borrow_mut();
            let mut waiters = inner.waiters.borrow_mut();
            for task in &waiting {
                for trig in wait_sets.remove(task).unwrap_or_default() {
                    if trig == fired {
                        continue;
                    }
                    if let Some(list) = waiters.get_mut(&trig) {
                        list.retain(|t| !waiting.contains(t));
                        if list.is_empty() {
                            waiters.remove(&trig);
                            orphaned.push(trig);
                        }
                    }
                }
            }
        }
        for trig in orphaned {
            self.unprime_trigger(trig);
        }

        if kind.is_ephemeral() {
            inner.triggers.borrow_mut().remove(&fired);
        }

        // First-registered wins among tasks woken by the same fire: the
        // waiter list preserves registration order.
        for task in waiting {
            self.resume_task(task, Some(fired));
        }
        self.pump();
        self.finish_react(outer, &kind);
    }

    fn finish_react(&self, outer: bool, kind: &TriggerKind) {
        let inner = &self.inner;
        if outer && kind.is_backend() && inner.state.get() != DispatchState::Terminating {
            self.advance_phase();
        }
        inner.react_depth.set(inner.react_depth.get() - 1);
        if inner.react_depth.get() == 0 && inner.state.get() == DispatchState::Reacting {
            inner.state.set(DispatchState::Idle);
        }
    }

    /// Starts queued tasks and delivers queued host-side fires until the
    /// host-visible world is settled.
    fn pump(&self) {
        loop {
            if self.inner.state.get() == DispatchState::Terminating {
                return;
            }
            let started = self.inner.start_queue.borrow_mut().pop_front();
            if let Some(task) = started {
                self.resume_task(task, None);
                continue;
            }
            let fire = self.inner.fire_queue.borrow_mut().pop_front();
            if let Some(trig) = fire {
                self.react_by_id(trig);
                continue;
            }
            break;
        }
    }

    /// Fires a host-side trigger: immediately when idle, queued for
    /// delivery before the current `react` returns otherwise.
    pub(crate) fn queue_fire(&self, id: TriggerId) {
        if self.inner.state.get() == DispatchState::Terminating {
            return;
        }
        if self.inner.react_depth.get() > 0 {
            self.inner.fire_queue.borrow_mut().push_back(id);
        } else {
            self.react_by_id(id);
        }
    }

    fn resume_task(&self, id: TaskId, fired: Option<TriggerId>) {
        let fut = {
            let mut tasks = self.inner.tasks.borrow_mut();
            let Some(entry) = tasks.get_mut(&id) else {
                return;
            };
            if entry.state == TaskState::Finished {
                return;
            }
            entry.fired = fired;
            entry.state = TaskState::Running;
            entry.future.take()
        };
        let Some(mut fut) = fut else {
            return;
        };
        let prev = self.inner.current.replace(Some(id));
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        let poll = fut.as_mut().poll(&mut cx);
        self.inner.current.set(prev);
        match poll {
            Poll::Ready(result) => {
                self.finish_task(id, TaskOutcome::Completed(result));
            }
            Poll::Pending => {
                let killed = {
                    let mut tasks = self.inner.tasks.borrow_mut();
                    match tasks.get_mut(&id) {
                        Some(entry) if entry.state != TaskState::Finished => {
                            entry.future = Some(fut);
                            entry.state = TaskState::Waiting;
                            false
                        }
                        // Killed from within its own poll; the future is
                        // simply dropped.
                        _ => true,
                    }
                };
                if killed {
                    return;
                }
                let has_wait = self
                    .inner
                    .wait_sets
                    .borrow()
                    .get(&id)
                    .is_some_and(|s| !s.is_empty());
                if !has_wait {
                    // Suspended without awaiting any scheduler trigger: the
                    // task would hang forever, so fail it descriptively.
                    let name = self.task_name(id);
                    log::error!("task '{name}' suspended without awaiting a scheduler trigger");
                    if let Some(entry) = self.inner.tasks.borrow_mut().get_mut(&id) {
                        entry.future = None;
                    }
                    self.finish_task(
                        id,
                        TaskOutcome::Completed(Err(TestFail::Error(SchedError::StrandedTask {
                            name,
                        }))),
                    );
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Priming
    // ------------------------------------------------------------------

    fn backend_callback(&self, id: TriggerId) -> SimCallback {
        let weak = Rc::downgrade(&self.inner);
        Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                Scheduler { inner }.react_by_id(id);
            }
        })
    }

    fn prime_trigger(&self, id: TriggerId) -> Result<(), SchedError> {
        // Teardown already unprimed everything; a task still mid-poll when
        // the test finished must not arm fresh backend callbacks.
        if self.inner.state.get() == DispatchState::Terminating {
            return Err(SchedError::Terminated);
        }
        let kind = {
            let triggers = self.inner.triggers.borrow();
            let Some(st) = triggers.get(&id) else {
                return Err(SchedError::PrimeFailed {
                    trigger: format!("#{}", id.as_raw()),
                    reason: "unknown trigger".into(),
                });
            };
            if st.primed {
                return Err(SchedError::DoublePrime {
                    trigger: st.kind.to_string(),
                });
            }
            st.kind.clone()
        };
        let backend = &self.inner.backend;
        let handle = match &kind {
            TriggerKind::Timer { delay } => {
                backend.register_timed_callback(*delay, self.backend_callback(id))
            }
            TriggerKind::Edge { signal, edge } => {
                backend.register_value_change_callback(*signal, self.backend_callback(id), *edge)
            }
            TriggerKind::ReadOnly => backend.register_readonly_callback(self.backend_callback(id)),
            TriggerKind::ReadWrite | TriggerKind::WriteBack => {
                backend.register_readwrite_sync_callback(self.backend_callback(id))
            }
            TriggerKind::NextTimeStep | TriggerKind::AdvanceStep => {
                backend.register_nextstep_callback(self.backend_callback(id))
            }
            TriggerKind::Join { .. } | TriggerKind::Event { .. } | TriggerKind::LockGrant { .. } => {
                // Host-side conditions register with the scheduler's own
                // bookkeeping only.
                if let Some(st) = self.inner.triggers.borrow_mut().get_mut(&id) {
                    st.primed = true;
                }
                return Ok(());
            }
        };
        if !handle.is_valid() {
            return Err(SchedError::PrimeFailed {
                trigger: kind.to_string(),
                reason: "backend returned the invalid handle".into(),
            });
        }
        if let Some(st) = self.inner.triggers.borrow_mut().get_mut(&id) {
            st.primed = true;
            st.cb = Some(handle);
        }
        Ok(())
    }

    /// Unprimes a trigger. Idempotent; deregisters the backend callback at
    /// most once. Ephemeral triggers with no remaining waiters are retired
    /// from the registry.
    fn unprime_trigger(&self, id: TriggerId) {
        let (cb, ephemeral) = {
            let mut triggers = self.inner.triggers.borrow_mut();
            match triggers.get_mut(&id) {
                Some(st) => {
                    let cb = if st.primed { st.cb.take() } else { None };
                    st.primed = false;
                    (cb, st.kind.is_ephemeral())
                }
                None => return,
            }
        };
        if let Some(handle) = cb {
            self.inner.backend.deregister_callback(handle);
        }
        if ephemeral && !self.inner.waiters.borrow().contains_key(&id) {
            self.inner.triggers.borrow_mut().remove(&id);
        }
    }

    /// Registers `task` as a waiter on each trigger, priming unprimed ones.
    ///
    /// On a priming failure the registrations made by this call are rolled
    /// back and the error is returned, becoming the waiting task's failure.
    pub(crate) fn register_wait(
        &self,
        task: TaskId,
        trigs: &[TriggerId],
    ) -> Result<(), SchedError> {
        if trigs.is_empty() {
            return Err(SchedError::EmptyWait);
        }
        let mut added = Vec::new();
        for &id in trigs {
            let newly = {
                let mut waiters = self.inner.waiters.borrow_mut();
                let list = waiters.entry(id).or_default();
                if list.contains(&task) {
                    false
                } else {
                    list.push(task);
                    true
                }
            };
            if newly {
                self.inner
                    .wait_sets
                    .borrow_mut()
                    .entry(task)
                    .or_default()
                    .push(id);
                added.push(id);
            }
            if !self.trigger_primed(id) {
                if let Err(e) = self.prime_trigger(id) {
                    for &a in &added {
                        self.remove_waiter(task, a);
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn remove_waiter(&self, task: TaskId, trig: TriggerId) {
        let empty = {
            let mut waiters = self.inner.waiters.borrow_mut();
            match waiters.get_mut(&trig) {
                Some(list) => {
                    list.retain(|t| *t != task);
                    if list.is_empty() {
                        waiters.remove(&trig);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };
        if let Some(set) = self.inner.wait_sets.borrow_mut().get_mut(&task) {
            set.retain(|t| *t != trig);
        }
        if empty {
            self.unprime_trigger(trig);
        }
    }

    // ------------------------------------------------------------------
    // Write buffer and phases
    // ------------------------------------------------------------------

    /// Buffers a write to `handle`, to be applied at the next write-back
    /// phase. Later writes to the same handle in the same phase overwrite
    /// earlier ones.
    ///
    /// Rejected during the read-only phase.
    pub fn save_write(&self, handle: SignalHandle, value: u64) -> Result<(), SchedError> {
        if self.inner.phase.get() == SimPhase::ReadOnly {
            return Err(SchedError::ReadOnlyWrite { handle });
        }
        self.inner.writes.borrow_mut().insert(handle, value);
        Ok(())
    }

    /// Reads the current value of a signal from the backend.
    pub fn read_signal(&self, handle: SignalHandle) -> u64 {
        self.inner.backend.get_signal_value(handle)
    }

    /// Writes a signal immediately, bypassing the write buffer.
    pub fn write_signal_immediate(&self, handle: SignalHandle, value: u64) {
        self.inner.backend.set_signal_value(handle, value);
    }

    fn flush_writes(&self) {
        let pending = std::mem::take(&mut *self.inner.writes.borrow_mut());
        if pending.is_empty() {
            return;
        }
        self.inner.phase.set(SimPhase::WriteBack);
        for (handle, value) in pending {
            log::debug!("flush: {handle} <= {value:#x}");
            self.inner.backend.set_signal_value(handle, value);
        }
        self.inner.phase.set(SimPhase::Normal);
    }

    /// Decides, based on pending writes and the current phase, whether the
    /// write-back or the advance-step bookkeeping trigger must be primed
    /// before control returns to the simulator.
    fn advance_phase(&self) {
        if self.inner.writes.borrow().is_empty() {
            return;
        }
        let target = if self.inner.phase.get() == SimPhase::ReadOnly {
            // Cannot write in this step any more; ask for the next one.
            self.inner.advance_id
        } else {
            self.inner.writeback_id
        };
        if !self.trigger_primed(target) {
            if let Err(e) = self.prime_trigger(target) {
                log::error!("failed to prime phase trigger: {e}");
            }
        }
    }

    // ------------------------------------------------------------------
    // External blocking bridge
    // ------------------------------------------------------------------

    /// Runs a blocking host-native function on a dedicated worker thread,
    /// parking the scheduler thread until it completes.
    ///
    /// At most one worker is in flight relative to scheduler state at a
    /// time; simulated time does not advance while the worker runs.
    pub fn run_blocking<T, F>(&self, f: F) -> Result<T, SchedError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.inner.bridge.call(f)
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    /// Returns the current simulation phase.
    pub fn phase(&self) -> SimPhase {
        self.inner.phase.get()
    }

    /// Returns the current dispatch state.
    pub fn dispatch_state(&self) -> DispatchState {
        self.inner.state.get()
    }

    /// Returns the recorded test outcome, if the test has finished.
    pub fn outcome(&self) -> Option<TestOutcome> {
        self.inner.outcome.borrow().clone()
    }

    /// Returns the number of buffered writes awaiting flush.
    pub fn pending_writes(&self) -> usize {
        self.inner.writes.borrow().len()
    }

    pub(crate) fn current_task(&self) -> Option<TaskId> {
        self.inner.current.get()
    }

    pub(crate) fn take_fired(&self, task: TaskId) -> Option<TriggerId> {
        self.inner
            .tasks
            .borrow_mut()
            .get_mut(&task)
            .and_then(|e| e.fired.take())
    }

    pub(crate) fn trigger_kind(&self, id: TriggerId) -> Option<TriggerKind> {
        self.inner.triggers.borrow().get(&id).map(|st| st.kind.clone())
    }

    pub(crate) fn trigger_primed(&self, id: TriggerId) -> bool {
        self.inner
            .triggers
            .borrow()
            .get(&id)
            .is_some_and(|st| st.primed)
    }

    pub(crate) fn has_waiters(&self, id: TriggerId) -> bool {
        self.inner.waiters.borrow().contains_key(&id)
    }

    pub(crate) fn task_finished(&self, id: TaskId) -> bool {
        self.inner
            .tasks
            .borrow()
            .get(&id)
            .map_or(true, |e| e.state == TaskState::Finished)
    }

    pub(crate) fn task_outcome(&self, id: TaskId) -> Option<TaskOutcome> {
        self.inner
            .tasks
            .borrow()
            .get(&id)
            .and_then(|e| e.outcome.clone())
    }

    pub(crate) fn join_trigger(&self, id: TaskId) -> Trigger {
        let trig = self
            .inner
            .tasks
            .borrow()
            .get(&id)
            .map(|e| e.join_trigger)
            .unwrap_or(TriggerId::from_raw(0));
        Trigger::new(self.clone(), trig)
    }

    fn task_name(&self, id: TaskId) -> String {
        self.inner
            .tasks
            .borrow()
            .get(&id)
            .map(|e| e.name.clone())
            .unwrap_or_else(|| id.to_string())
    }
}

fn outcome_to_test(outcome: &TaskOutcome) -> TestOutcome {
    match outcome {
        TaskOutcome::Completed(Ok(_)) => TestOutcome::Passed,
        TaskOutcome::Completed(Err(TestFail::Assertion(m))) => TestOutcome::Failed {
            message: m.clone(),
        },
        TaskOutcome::Completed(Err(TestFail::Timeout)) => TestOutcome::Timeout,
        TaskOutcome::Completed(Err(TestFail::Error(e))) => TestOutcome::Error {
            message: e.to_string(),
        },
        TaskOutcome::Cancelled => TestOutcome::Cancelled,
    }
}

fn noop_raw_waker() -> RawWaker {
    RawWaker::new(std::ptr::null(), &NOOP_WAKER_VTABLE)
}

static NOOP_WAKER_VTABLE: RawWakerVTable =
    RawWakerVTable::new(|_| noop_raw_waker(), |_| {}, |_| {}, |_| {});

/// Tasks are resumed only by the scheduler delivering a fired trigger, so
/// the waker never needs to do anything.
fn noop_waker() -> Waker {
    // SAFETY: every vtable entry ignores its data pointer and keeps no state.
    unsafe { Waker::from_raw(noop_raw_waker()) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Val;
    use std::cell::RefCell;
    use std::collections::HashMap as Map;
    use std::rc::Rc;
    use strobe_common::CallbackHandle;

    /// Records registrations and lets tests fire callbacks by hand.
    #[derive(Clone, Default)]
    struct StubBackend {
        inner: Rc<StubInner>,
    }

    #[derive(Default)]
    struct StubInner {
        next: Cell<u64>,
        values: RefCell<Map<SignalHandle, u64>>,
        pending: RefCell<Map<u64, SimCallback>>,
        kinds: RefCell<Vec<(u64, String)>>,
        deregistered: RefCell<Vec<u64>>,
        fail_registrations: Cell<bool>,
    }

    impl StubBackend {
        fn new() -> Self {
            let b = Self::default();
            b.inner.next.set(1);
            b
        }

        fn register(&self, kind: &str, cb: SimCallback) -> CallbackHandle {
            if self.inner.fail_registrations.get() {
                return CallbackHandle::INVALID;
            }
            let raw = self.inner.next.get();
            self.inner.next.set(raw + 1);
            self.inner.pending.borrow_mut().insert(raw, cb);
            self.inner.kinds.borrow_mut().push((raw, kind.to_string()));
            CallbackHandle::from_raw(raw)
        }

        fn fire(&self, handle: CallbackHandle) {
            let cb = self.inner.pending.borrow_mut().remove(&handle.as_raw());
            if let Some(cb) = cb {
                cb();
            }
        }

        fn last_of(&self, kind: &str) -> Option<CallbackHandle> {
            self.inner
                .kinds
                .borrow()
                .iter()
                .rev()
                .find(|(h, k)| k == kind && self.inner.pending.borrow().contains_key(h))
                .map(|(h, _)| CallbackHandle::from_raw(*h))
        }

        fn pending_count(&self) -> usize {
            self.inner.pending.borrow().len()
        }
    }

    impl SimulatorBackend for StubBackend {
        fn register_timed_callback(&self, _delay: SimTime, cb: SimCallback) -> CallbackHandle {
            self.register("timed", cb)
        }

        fn register_value_change_callback(
            &self,
            _signal: SignalHandle,
            cb: SimCallback,
            _edge: EdgeKind,
        ) -> CallbackHandle {
            self.register("edge", cb)
        }

        fn register_readonly_callback(&self, cb: SimCallback) -> CallbackHandle {
            self.register("readonly", cb)
        }

        fn register_readwrite_sync_callback(&self, cb: SimCallback) -> CallbackHandle {
            self.register("readwrite", cb)
        }

        fn register_nextstep_callback(&self, cb: SimCallback) -> CallbackHandle {
            self.register("nextstep", cb)
        }

        fn deregister_callback(&self, handle: CallbackHandle) {
            self.inner.pending.borrow_mut().remove(&handle.as_raw());
            self.inner.deregistered.borrow_mut().push(handle.as_raw());
        }

        fn get_signal_value(&self, signal: SignalHandle) -> u64 {
            *self.inner.values.borrow().get(&signal).unwrap_or(&0)
        }

        fn set_signal_value(&self, signal: SignalHandle, value: u64) {
            self.inner.values.borrow_mut().insert(signal, value);
        }
    }

    fn pair() -> (StubBackend, Scheduler) {
        let backend = StubBackend::new();
        let sched = Scheduler::new(Box::new(backend.clone()));
        (backend, sched)
    }

    #[test]
    fn starts_idle_in_normal_phase() {
        let (_, sched) = pair();
        assert_eq!(sched.phase(), SimPhase::Normal);
        assert_eq!(sched.dispatch_state(), DispatchState::Idle);
        assert_eq!(sched.outcome(), None);
    }

    #[test]
    fn save_write_last_write_wins() {
        let (backend, sched) = pair();
        let sig = SignalHandle::from_raw(1);
        sched.save_write(sig, 0xA).unwrap();
        sched.save_write(sig, 0xB).unwrap();
        assert_eq!(sched.pending_writes(), 1);
        // Flush happens through the internal write-back trigger.
        let done = Rc::new(Cell::new(false));
        let flag = done.clone();
        let s2 = sched.clone();
        sched.spawn("writer", async move {
            s2.read_write().await?;
            flag.set(true);
            Ok(Val::None)
        });
        let rw = backend.last_of("readwrite").expect("read-write primed");
        backend.fire(rw);
        assert!(done.get());
        assert_eq!(backend.get_signal_value(sig), 0xB);
        assert_eq!(sched.pending_writes(), 0);
    }

    #[test]
    fn save_write_rejected_in_read_only_phase() {
        let (backend, sched) = pair();
        let sig = SignalHandle::from_raw(2);
        let seen = Rc::new(RefCell::new(None));
        let slot = seen.clone();
        let s2 = sched.clone();
        sched.spawn("sampler", async move {
            s2.read_only().await?;
            *slot.borrow_mut() = Some(s2.save_write(sig, 1));
            s2.timer(1, TimeUnit::Ns).await?;
            Ok(Val::None)
        });
        let ro = backend.last_of("readonly").expect("read-only primed");
        backend.fire(ro);
        assert_eq!(
            *seen.borrow(),
            Some(Err(SchedError::ReadOnlyWrite { handle: sig }))
        );
        assert_eq!(sched.phase(), SimPhase::ReadOnly);
    }

    #[test]
    fn timer_resumes_waiting_task() {
        let (backend, sched) = pair();
        let done = Rc::new(Cell::new(false));
        let flag = done.clone();
        let s2 = sched.clone();
        sched.spawn("t", async move {
            s2.timer(10, TimeUnit::Ns).await?;
            flag.set(true);
            Ok(Val::None)
        });
        assert!(!done.get());
        let timed = backend.last_of("timed").expect("timer primed");
        backend.fire(timed);
        assert!(done.get());
    }

    #[test]
    fn interned_edge_trigger_is_shared() {
        let (_, sched) = pair();
        let sig = SignalHandle::from_raw(3);
        let a = sched.edge_trigger(sig, EdgeKind::Rising);
        let b = sched.edge_trigger(sig, EdgeKind::Rising);
        let c = sched.edge_trigger(sig, EdgeKind::Falling);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn two_waiters_one_registration() {
        let (backend, sched) = pair();
        let sig = SignalHandle::from_raw(4);
        for i in 0..2 {
            let s2 = sched.clone();
            sched.spawn(format!("w{i}"), async move {
                s2.edge_trigger(sig, EdgeKind::Rising).await?;
                Ok(Val::None)
            });
        }
        // Both tasks share one interned trigger, so only one backend
        // registration exists (plus none consumed yet).
        assert_eq!(backend.pending_count(), 1);
        let edge = backend.last_of("edge").expect("edge primed");
        backend.fire(edge);
        assert_eq!(backend.pending_count(), 0);
    }

    #[test]
    fn kill_unprimes_only_when_last_waiter_leaves() {
        let (backend, sched) = pair();
        let sig = SignalHandle::from_raw(5);
        let trig = sched.edge_trigger(sig, EdgeKind::Rising);
        let mut handles = Vec::new();
        for i in 0..2 {
            let t = trig.clone();
            handles.push(sched.spawn(format!("w{i}"), async move {
                t.await?;
                Ok(Val::None)
            }));
        }
        assert!(trig.is_primed());
        handles[0].kill();
        assert!(trig.is_primed());
        handles[1].kill();
        assert!(!trig.is_primed());
        // The backend registration was cancelled exactly once.
        assert_eq!(backend.inner.deregistered.borrow().len(), 1);
    }

    #[test]
    fn join_caches_outcome() {
        let (_, sched) = pair();
        let child = sched.spawn("child", async { Ok(Val::Int(7)) });
        assert!(child.is_finished());
        let seen = Rc::new(RefCell::new(Vec::new()));
        let slot = seen.clone();
        let c2 = child.clone();
        sched.spawn("joiner", async move {
            slot.borrow_mut().push(c2.join().await);
            slot.borrow_mut().push(c2.join().await);
            Ok(Val::None)
        });
        let expect = TaskOutcome::Completed(Ok(Val::Int(7)));
        assert_eq!(*seen.borrow(), vec![expect.clone(), expect]);
    }

    #[test]
    fn killed_task_joiner_sees_cancelled() {
        let (_, sched) = pair();
        let s2 = sched.clone();
        let victim = sched.spawn("victim", async move {
            s2.timer(1000, TimeUnit::Ns).await?;
            Ok(Val::None)
        });
        let seen = Rc::new(RefCell::new(None));
        let slot = seen.clone();
        let v2 = victim.clone();
        sched.spawn("joiner", async move {
            *slot.borrow_mut() = Some(v2.join().await);
            Ok(Val::None)
        });
        assert!(seen.borrow().is_none());
        victim.kill();
        assert_eq!(*seen.borrow(), Some(TaskOutcome::Cancelled));
    }

    #[test]
    fn prime_failure_becomes_task_failure() {
        let (backend, sched) = pair();
        backend.inner.fail_registrations.set(true);
        let s2 = sched.clone();
        let task = sched.spawn("t", async move {
            s2.timer(5, TimeUnit::Ns).await?;
            Ok(Val::None)
        });
        match sched.task_outcome(task.id()) {
            Some(TaskOutcome::Completed(Err(TestFail::Error(SchedError::PrimeFailed {
                ..
            })))) => {}
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_outcome_recorded_once() {
        let (_, sched) = pair();
        sched.start_test("t", async { Ok(Val::None) });
        assert_eq!(sched.outcome(), Some(TestOutcome::Passed));
        // A later failure during teardown is suppressed.
        sched.finish_test(TestOutcome::Error {
            message: "late".into(),
        });
        assert_eq!(sched.outcome(), Some(TestOutcome::Passed));
        assert_eq!(sched.dispatch_state(), DispatchState::Terminating);
    }

    #[test]
    fn teardown_kills_background_tasks() {
        let (_, sched) = pair();
        let s2 = sched.clone();
        let bg = sched.spawn("bg", async move {
            s2.timer(100, TimeUnit::Ns).await?;
            Ok(Val::None)
        });
        sched.start_test("t", async { Ok(Val::None) });
        assert_eq!(sched.task_outcome(bg.id()), Some(TaskOutcome::Cancelled));
    }

    #[test]
    fn unjoined_background_failure_fails_test() {
        let (backend, sched) = pair();
        let s2 = sched.clone();
        sched.start_test("t", async move {
            s2.spawn("bg", async { Err(TestFail::Assertion("boom".into())) });
            s2.timer(100, TimeUnit::Ns).await?;
            Ok(Val::None)
        });
        let _ = backend;
        match sched.outcome() {
            Some(TestOutcome::Error { message }) => {
                assert!(message.contains("background task 'bg'"), "{message}");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn teardown_blocks_new_trigger_priming() {
        let (backend, sched) = pair();
        let seen = Rc::new(RefCell::new(None));
        let slot = seen.clone();
        let s2 = sched.clone();
        sched.start_test("t", async move {
            s2.spawn("bg", async { Err(TestFail::Assertion("boom".into())) });
            // The background failure tore the test down while this body was
            // still mid-poll; the await must fail instead of arming a
            // fresh backend callback.
            let waited = s2.timer(100, TimeUnit::Ns).await;
            *slot.borrow_mut() = Some(waited);
            Ok(Val::None)
        });
        assert_eq!(*seen.borrow(), Some(Err(SchedError::Terminated)));
        assert!(matches!(sched.outcome(), Some(TestOutcome::Error { .. })));
        // Only the final bookkeeping timer remains registered.
        assert_eq!(backend.pending_count(), 1);
    }

    #[test]
    fn awaiting_a_handle_joins_the_task() {
        let (backend, sched) = pair();
        let s2 = sched.clone();
        let child = sched.spawn("child", async move {
            s2.timer(5, TimeUnit::Ns).await?;
            Ok(Val::Int(3))
        });
        let seen = Rc::new(RefCell::new(None));
        let slot = seen.clone();
        let c2 = child.clone();
        sched.spawn("parent", async move {
            *slot.borrow_mut() = Some(c2.await);
            Ok(Val::None)
        });
        assert!(seen.borrow().is_none());
        let timed = backend.last_of("timed").expect("timer primed");
        backend.fire(timed);
        assert_eq!(
            *seen.borrow(),
            Some(TaskOutcome::Completed(Ok(Val::Int(3))))
        );
    }

    #[test]
    fn combine_propagates_a_wait_failure() {
        let (backend, sched) = pair();
        backend.inner.fail_registrations.set(true);
        let seen = Rc::new(RefCell::new(None));
        let slot = seen.clone();
        let s2 = sched.clone();
        sched.spawn("all", async move {
            let a = s2.timer(5, TimeUnit::Ns);
            let b = s2.timer(9, TimeUnit::Ns);
            *slot.borrow_mut() = Some(crate::combine::combine(vec![a, b]).await);
            Ok(Val::None)
        });
        assert!(matches!(
            *seen.borrow(),
            Some(Err(SchedError::PrimeFailed { .. }))
        ));
    }

    #[test]
    fn stranded_task_fails_descriptively() {
        use std::future::poll_fn;
        let (_, sched) = pair();
        let task = sched.spawn("stuck", async {
            // Pending without registering any trigger.
            poll_fn(|_| Poll::<()>::Pending).await;
            Ok(Val::None)
        });
        match sched.task_outcome(task.id()) {
            Some(TaskOutcome::Completed(Err(TestFail::Error(SchedError::StrandedTask {
                name,
            })))) => assert_eq!(name, "stuck"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn spawn_after_teardown_is_cancelled() {
        let (_, sched) = pair();
        sched.start_test("t", async { Ok(Val::None) });
        let late = sched.spawn("late", async { Ok(Val::None) });
        assert_eq!(sched.task_outcome(late.id()), Some(TaskOutcome::Cancelled));
    }

    #[test]
    fn write_signal_immediate_bypasses_buffer() {
        let (backend, sched) = pair();
        let sig = SignalHandle::from_raw(9);
        sched.write_signal_immediate(sig, 0x55);
        assert_eq!(backend.get_signal_value(sig), 0x55);
        assert_eq!(sched.pending_writes(), 0);
    }
}
