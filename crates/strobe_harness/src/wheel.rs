//! The event wheel: callback storage, time advancement, region sequencing.

use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::rc::Rc;

use strobe_common::{CallbackHandle, SignalHandle, SimTime};
use strobe_sched::{EdgeKind, SessionDriver, SimCallback, SimulatorBackend};

/// Delta rounds allowed within a single time step before the wheel stops.
///
/// A callback that keeps re-registering for the same step (a read-write or
/// read-only loop that never lets time advance) would otherwise spin
/// forever without ever reaching the step-boundary time-limit check.
const MAX_DELTA_ROUNDS: u32 = 10_000;

/// Which region queue a callback belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Region {
    ReadWrite,
    ReadOnly,
    NextStep,
}

#[derive(Default)]
struct WheelState {
    now: SimTime,
    next_cb: u64,
    next_seq: u64,
    limit_fs: Option<u64>,
    values: HashMap<SignalHandle, u64>,
    names: Vec<String>,
    /// (due time in fs, registration sequence, callback id); the sequence
    /// makes coincident timers fire in registration order.
    timed: BinaryHeap<Reverse<(u64, u64, u64)>>,
    edges: HashMap<SignalHandle, Vec<(u64, EdgeKind)>>,
    readwrite: VecDeque<u64>,
    readonly: VecDeque<u64>,
    nextstep: VecDeque<u64>,
    /// Source of truth for live registrations; deregistration removes the
    /// entry here and the queues skip missing ids lazily.
    callbacks: HashMap<u64, SimCallback>,
}

impl WheelState {
    fn alloc(&mut self, cb: SimCallback) -> u64 {
        self.next_cb += 1;
        let id = self.next_cb;
        self.callbacks.insert(id, cb);
        id
    }
}

/// A shared handle to the event wheel.
///
/// Clones share state: hand one clone to the scheduler as its backend and
/// keep another to drive the simulation and poke signals from test code.
#[derive(Clone, Default)]
pub struct WheelHandle {
    state: Rc<RefCell<WheelState>>,
}

impl WheelHandle {
    /// Creates an empty wheel at time zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stops [`WheelHandle::run_to_completion`] once the wheel would
    /// advance past `limit_fs`, as a backstop against runaway stimulus.
    pub fn set_time_limit(&self, limit_fs: u64) {
        self.state.borrow_mut().limit_fs = Some(limit_fs);
    }

    /// Declares a design signal with an initial value.
    pub fn add_signal(&self, name: impl Into<String>, initial: u64) -> SignalHandle {
        let mut st = self.state.borrow_mut();
        let handle = SignalHandle::from_raw(st.names.len() as u32);
        st.names.push(name.into());
        st.values.insert(handle, initial);
        handle
    }

    /// Returns the current simulated time.
    pub fn now(&self) -> SimTime {
        self.state.borrow().now
    }

    /// Returns the current value of a signal.
    pub fn signal_value(&self, handle: SignalHandle) -> u64 {
        self.state.borrow().values.get(&handle).copied().unwrap_or(0)
    }

    /// Returns the number of live callback registrations.
    pub fn pending_callbacks(&self) -> usize {
        self.state.borrow().callbacks.len()
    }

    /// Runs the wheel until no registered work remains, the time limit is
    /// reached, or a single step exceeds [`MAX_DELTA_ROUNDS`] delta rounds.
    ///
    /// Each time step runs: next-step callbacks, then a settle loop
    /// interleaving due timed callbacks with read-write sync rounds, then
    /// the read-only region, then the step boundary.
    pub fn run_to_completion(&self) {
        loop {
            // Settle loop for the current step. Read-write rounds can
            // buffer more writes and register another sync callback, so
            // iterate until a round does nothing.
            loop {
                let timed = self.fire_due_timed();
                let synced = self.fire_region(Region::ReadWrite);
                if timed == 0 && synced == 0 {
                    break;
                }
                let mut st = self.state.borrow_mut();
                st.now = st.now.next_delta();
                if st.now.delta >= MAX_DELTA_ROUNDS {
                    log::warn!("delta cycle cap reached at {}; stopping the wheel", st.now);
                    return;
                }
            }
            let mut readonly_rounds = 0u32;
            while self.fire_region(Region::ReadOnly) > 0 {
                readonly_rounds += 1;
                if readonly_rounds >= MAX_DELTA_ROUNDS {
                    log::warn!(
                        "read-only region re-registered {readonly_rounds} times at {}; \
                         stopping the wheel",
                        self.now()
                    );
                    return;
                }
            }

            // Step boundary.
            let (next_due, has_nextstep, has_sync) = {
                let st = self.state.borrow();
                (
                    st.timed.peek().map(|Reverse((t, _, _))| *t),
                    !st.nextstep.is_empty(),
                    !st.readwrite.is_empty(),
                )
            };
            if has_sync {
                // Registered during the read-only region; settle again in
                // this step rather than losing the round.
                continue;
            }
            let target = match (next_due, has_nextstep) {
                (Some(t), _) => t,
                (None, true) => self.state.borrow().now.fs + 1,
                (None, false) => return,
            };
            {
                let mut st = self.state.borrow_mut();
                if let Some(limit) = st.limit_fs {
                    if target > limit {
                        log::warn!("wheel time limit {limit} fs reached at {}", st.now);
                        return;
                    }
                }
                if target > st.now.fs {
                    st.now = SimTime::from_fs(target);
                }
            }
            self.fire_region(Region::NextStep);
        }
    }

    /// Pops and fires every timed callback due at the current time, in
    /// registration order. Returns the number actually invoked.
    fn fire_due_timed(&self) -> usize {
        let cbs: Vec<SimCallback> = {
            let mut st = self.state.borrow_mut();
            let now_fs = st.now.fs;
            let mut out = Vec::new();
            while let Some(Reverse((due, _, _))) = st.timed.peek() {
                if *due > now_fs {
                    break;
                }
                let Reverse((_, _, id)) = st.timed.pop().unwrap_or(Reverse((0, 0, 0)));
                if let Some(cb) = st.callbacks.remove(&id) {
                    out.push(cb);
                }
            }
            out
        };
        let n = cbs.len();
        for cb in cbs {
            cb();
        }
        n
    }

    /// Drains one snapshot of a region queue; callbacks registered while
    /// firing land in the fresh queue for the next round.
    fn fire_region(&self, region: Region) -> usize {
        let cbs: Vec<SimCallback> = {
            let mut st = self.state.borrow_mut();
            let queue = match region {
                Region::ReadWrite => std::mem::take(&mut st.readwrite),
                Region::ReadOnly => std::mem::take(&mut st.readonly),
                Region::NextStep => std::mem::take(&mut st.nextstep),
            };
            queue
                .into_iter()
                .filter_map(|id| st.callbacks.remove(&id))
                .collect()
        };
        let n = cbs.len();
        for cb in cbs {
            cb();
        }
        n
    }

    fn register_region(&self, region: Region, cb: SimCallback) -> CallbackHandle {
        let mut st = self.state.borrow_mut();
        let id = st.alloc(cb);
        match region {
            Region::ReadWrite => st.readwrite.push_back(id),
            Region::ReadOnly => st.readonly.push_back(id),
            Region::NextStep => st.nextstep.push_back(id),
        }
        CallbackHandle::from_raw(id)
    }
}

impl SimulatorBackend for WheelHandle {
    fn register_timed_callback(&self, delay: SimTime, cb: SimCallback) -> CallbackHandle {
        let mut st = self.state.borrow_mut();
        // A zero delay cannot fire inside the step it was registered in;
        // it lands on the next available femtosecond.
        let due = st.now.fs + delay.fs.max(1);
        let id = st.alloc(cb);
        st.next_seq += 1;
        let seq = st.next_seq;
        st.timed.push(Reverse((due, seq, id)));
        CallbackHandle::from_raw(id)
    }

    fn register_value_change_callback(
        &self,
        signal: SignalHandle,
        cb: SimCallback,
        edge: EdgeKind,
    ) -> CallbackHandle {
        let mut st = self.state.borrow_mut();
        let id = st.alloc(cb);
        st.edges.entry(signal).or_default().push((id, edge));
        CallbackHandle::from_raw(id)
    }

    fn register_readonly_callback(&self, cb: SimCallback) -> CallbackHandle {
        self.register_region(Region::ReadOnly, cb)
    }

    fn register_readwrite_sync_callback(&self, cb: SimCallback) -> CallbackHandle {
        self.register_region(Region::ReadWrite, cb)
    }

    fn register_nextstep_callback(&self, cb: SimCallback) -> CallbackHandle {
        self.register_region(Region::NextStep, cb)
    }

    fn deregister_callback(&self, handle: CallbackHandle) {
        self.state.borrow_mut().callbacks.remove(&handle.as_raw());
    }

    fn get_signal_value(&self, signal: SignalHandle) -> u64 {
        self.signal_value(signal)
    }

    fn set_signal_value(&self, signal: SignalHandle, value: u64) {
        let cbs: Vec<SimCallback> = {
            let mut st = self.state.borrow_mut();
            let old = st.values.get(&signal).copied().unwrap_or(0);
            st.values.insert(signal, value);
            if old == value {
                return;
            }
            let rising = (old & 1) == 0 && (value & 1) == 1;
            let falling = (old & 1) == 1 && (value & 1) == 0;
            let mut hit = Vec::new();
            if let Some(regs) = st.edges.get_mut(&signal) {
                let mut kept = Vec::new();
                for (id, edge) in regs.drain(..) {
                    let matched = match edge {
                        EdgeKind::Any => true,
                        EdgeKind::Rising => rising,
                        EdgeKind::Falling => falling,
                    };
                    if matched {
                        hit.push(id);
                    } else {
                        kept.push((id, edge));
                    }
                }
                *regs = kept;
            }
            hit.into_iter()
                .filter_map(|id| st.callbacks.remove(&id))
                .collect()
        };
        // Fired outside the borrow: a callback may write further signals
        // and cascade back into this method.
        for cb in cbs {
            cb();
        }
    }
}

impl SessionDriver for WheelHandle {
    fn drive(&mut self) {
        self.run_to_completion();
    }
}
