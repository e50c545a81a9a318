//! Cooperative fibril scheduling.
//!
//! A fibril is a user-level task with its own stack, realized here as one OS
//! thread gated behind a park/wake token. The runtime's single manager
//! hands the token to one ready fibril at a time ([`run_one_ready`]), and
//! the fibril hands it back when it suspends or exits
//! ([`switch_to_manager`]), so at most one fibril runs at any instant.
//! There is no preemption; a fibril runs until it yields.
//!
//! Lock discipline across a yield: the runtime-state guard is always
//! dropped *before* parking and re-acquired after resume. The awaiter flags
//! (`active`, `occurred`, `in_list`) carry intent across that window, and
//! the gate remembers a wake that lands before the park, so no wakeup is
//! ever lost.

use std::cell::Cell;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread;

use ipc_types::{IpcError, IpcResult};
use parking_lot::{Condvar, Mutex};

use crate::runtime::Runtime;

/// Fibril identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fid(pub(crate) u64);

/// One park/wake token. A `wake` that arrives before the `park` is
/// remembered and consumed by it.
pub(crate) struct Gate {
    passed: Mutex<bool>,
    cv: Condvar,
}

impl Gate {
    fn new() -> Arc<Self> {
        Arc::new(Self { passed: Mutex::new(false), cv: Condvar::new() })
    }

    pub(crate) fn wake(&self) {
        let mut passed = self.passed.lock();
        *passed = true;
        self.cv.notify_one();
    }

    pub(crate) fn park(&self) {
        let mut passed = self.passed.lock();
        while !*passed {
            self.cv.wait(&mut passed);
        }
        *passed = false;
    }
}

pub(crate) struct FibrilSlot {
    pub(crate) gate: Arc<Gate>,
    /// The manager that last handed this fibril the token; yields return
    /// there.
    pub(crate) resumed_by: Option<Fid>,
}

/// Scheduler state. Lives inside the runtime lock alongside the IPC state.
pub(crate) struct FibrilTable {
    pub(crate) slots: HashMap<Fid, FibrilSlot>,
    pub(crate) ready: VecDeque<Fid>,
    pub(crate) managers: Vec<Fid>,
    pub(crate) managers_to_stop: usize,
    next_fid: u64,
}

impl FibrilTable {
    pub(crate) fn new() -> Self {
        Self {
            slots: HashMap::new(),
            ready: VecDeque::new(),
            managers: Vec::new(),
            managers_to_stop: 0,
            next_fid: 1,
        }
    }

    pub(crate) fn alloc(&mut self) -> Fid {
        let fid = Fid(self.next_fid);
        self.next_fid += 1;
        self.slots.insert(fid, FibrilSlot { gate: Gate::new(), resumed_by: None });
        fid
    }

    /// Insert into the ready queue. Readying a fibril that is already
    /// queued is a caller bug.
    pub(crate) fn make_ready(&mut self, fid: Fid) {
        debug_assert!(!self.ready.contains(&fid), "fibril {fid:?} readied twice");
        self.ready.push_back(fid);
    }

    fn gate_of(&self, fid: Fid) -> Option<Arc<Gate>> {
        self.slots.get(&fid).map(|s| s.gate.clone())
    }
}

thread_local! {
    static CURRENT_FIBRIL: Cell<Option<Fid>> = const { Cell::new(None) };
    static CURRENT_CONNECTION: Cell<Option<u64>> = const { Cell::new(None) };
}

/// Identity of the calling fibril, `None` outside fibril context.
pub fn current_fibril() -> Option<Fid> {
    CURRENT_FIBRIL.get()
}

pub(crate) fn set_current_fibril(fid: Option<Fid>) {
    CURRENT_FIBRIL.set(fid);
}

/// In-phone hash of the connection served by the calling fibril.
pub(crate) fn current_connection() -> Option<u64> {
    CURRENT_CONNECTION.get()
}

pub(crate) fn set_current_connection(hash: Option<u64>) {
    CURRENT_CONNECTION.set(hash);
}

/// Create a fibril running `body`. It does not run until a manager pops it
/// from the ready queue; pair with [`FibrilTable::make_ready`].
pub(crate) fn create(
    rt: &Runtime,
    name: &str,
    body: impl FnOnce(&Runtime) + Send + 'static,
) -> IpcResult<Fid> {
    let fid = rt.inner.state.lock().fibrils.alloc();
    create_with_fid(rt, fid, name, body)
}

/// Spawn the hosting thread for an already-allocated fibril slot.
pub(crate) fn create_with_fid(
    rt: &Runtime,
    fid: Fid,
    name: &str,
    body: impl FnOnce(&Runtime) + Send + 'static,
) -> IpcResult<Fid> {
    let gate = rt.inner.state.lock().fibrils.gate_of(fid).expect("fibril slot missing");

    let rt2 = rt.clone();
    let spawned = thread::Builder::new().name(format!("fibril-{}-{name}", fid.0)).spawn(move || {
        set_current_fibril(Some(fid));
        gate.park();
        body(&rt2);
        finish(&rt2, fid);
    });

    match spawned {
        Ok(handle) => {
            drop(handle);
            Ok(fid)
        }
        Err(e) => {
            log::warn!("cannot spawn fibril thread: {e}");
            rt.inner.state.lock().fibrils.slots.remove(&fid);
            Err(IpcError::NoMemory)
        }
    }
}

/// Fibril exit: drop the slot and return the token to the resuming manager.
fn finish(rt: &Runtime, fid: Fid) {
    let mgr_gate = {
        let mut st = rt.inner.state.lock();
        let slot = st.fibrils.slots.remove(&fid).expect("finished fibril has no slot");
        let mgr = slot.resumed_by.expect("fibril finished without ever being scheduled");
        st.fibrils
            .gate_of(mgr)
            .or_else(|| st.fibrils.managers.last().and_then(|m| st.fibrils.gate_of(*m)))
            .expect("no manager to return the token to")
    };
    mgr_gate.wake();
}

/// Yield from a fibril back to its manager. Returns once some manager hands
/// the token back. The caller must not hold the runtime-state lock.
pub(crate) fn switch_to_manager(rt: &Runtime) {
    let me = current_fibril().expect("switch outside fibril context");
    let (my_gate, mgr_gate) = {
        let st = rt.inner.state.lock();
        let slot = st.fibrils.slots.get(&me).expect("running fibril has no slot");
        let mgr_gate = slot
            .resumed_by
            .and_then(|m| st.fibrils.gate_of(m))
            .or_else(|| st.fibrils.managers.last().and_then(|m| st.fibrils.gate_of(*m)))
            .expect("no manager to yield to");
        (slot.gate.clone(), mgr_gate)
    };
    mgr_gate.wake();
    my_gate.park();
}

/// Manager half of the switch: hand the token to the first ready fibril and
/// park until it comes back. Returns false when the ready queue is empty.
pub(crate) fn run_one_ready(rt: &Runtime, mgr: Fid) -> bool {
    let (fibril_gate, my_gate) = {
        let mut st = rt.inner.state.lock();
        let Some(fid) = st.fibrils.ready.pop_front() else {
            return false;
        };
        let slot = st.fibrils.slots.get_mut(&fid).expect("ready fibril has no slot");
        slot.resumed_by = Some(mgr);
        let fibril_gate = slot.gate.clone();
        let my_gate = st.fibrils.gate_of(mgr).expect("manager has no slot");
        (fibril_gate, my_gate)
    };
    fibril_gate.wake();
    my_gate.park();
    true
}
