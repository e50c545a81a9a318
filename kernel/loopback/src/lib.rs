//! In-process implementation of the kernel IPC facade.
//!
//! Gives every attached task an answerbox and a phone table with the same
//! observable contract as the real kernel: calls are delivered in send
//! order, answered exactly once, replies find the original caller even
//! across forwards, and `CONNECT_ME_TO` mints the new phone whose hash
//! rides in ARG5. Used by servers running hosted and by the framework's
//! test suite.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ipc_types::{
    Call, CallFlags, CallId, IpcError, IpcEvent, IpcResult, IrqCode, KernelIpc, PhoneId, RC_OK,
    ShareFlags, SharedArea, Transfer,
    kernel::ForwardMode,
    method,
};
use parking_lot::{Condvar, Mutex};

struct Task {
    queue: VecDeque<IpcEvent>,
    cv: Arc<Condvar>,
    poked: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PhoneState {
    /// Allocated during `CONNECT_ME_TO` delivery, activated by `EOK`.
    Connecting,
    Connected,
    Hungup,
}

struct Phone {
    owner: u64,
    target: u64,
    state: PhoneState,
}

/// What a pending call needs at answer time.
enum PendingKind {
    Plain,
    Connect { phone: u64 },
    DataRead { max: usize },
    DataWrite { data: Vec<u8> },
    ShareIn,
    ShareOut { area: SharedArea, flags: ShareFlags },
}

struct Pending {
    caller: u64,
    userdata: u64,
    call: Call,
    kind: PendingKind,
}

struct IrqBinding {
    task: u64,
    #[allow(dead_code)]
    devno: u32,
    code: IrqCode,
}

struct LbState {
    tasks: HashMap<u64, Task>,
    phones: HashMap<u64, Phone>,
    pending: HashMap<u64, Pending>,
    irqs: HashMap<u32, IrqBinding>,
    next_id: u64,
    down: bool,
}

impl LbState {
    fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn deliver(&mut self, task: u64, event: IpcEvent) {
        if let Some(t) = self.tasks.get_mut(&task) {
            t.queue.push_back(event);
            t.cv.notify_all();
        } else {
            log::warn!("dropping event for unknown task {task}");
        }
    }
}

struct LbInner {
    state: Mutex<LbState>,
}

/// The in-process kernel. Attach tasks with [`Loopback::port`], wire the
/// first phone with [`Loopback::connect`].
#[derive(Clone)]
pub struct Loopback {
    inner: Arc<LbInner>,
}

/// One task's endpoint into the loopback kernel.
pub struct Port {
    inner: Arc<LbInner>,
    task: u64,
}

impl Default for Loopback {
    fn default() -> Self {
        Self::new()
    }
}

impl Loopback {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(LbInner {
                state: Mutex::new(LbState {
                    tasks: HashMap::new(),
                    phones: HashMap::new(),
                    pending: HashMap::new(),
                    irqs: HashMap::new(),
                    next_id: 1,
                    down: false,
                }),
            }),
        }
    }

    /// Attach a task and return its kernel endpoint.
    pub fn port(&self, name: &str) -> Port {
        let mut st = self.inner.state.lock();
        let id = st.alloc_id();
        st.tasks.insert(
            id,
            Task { queue: VecDeque::new(), cv: Arc::new(Condvar::new()), poked: false },
        );
        log::debug!("task {id} ({name}) attached");
        Port { inner: self.inner.clone(), task: id }
    }

    /// Wire a phone from `from` to `to` directly, the way a real system
    /// hands every task its bootstrap naming-service phone.
    pub fn connect(&self, from: &Port, to: &Port) -> PhoneId {
        let mut st = self.inner.state.lock();
        let id = st.alloc_id();
        st.phones.insert(id, Phone { owner: from.task, target: to.task, state: PhoneState::Connected });
        PhoneId(id)
    }

    /// Fire interrupt `inr`: delivers the registered notification, if any.
    pub fn trigger_interrupt(&self, inr: u32) -> bool {
        let mut st = self.inner.state.lock();
        let Some(binding) = st.irqs.get(&inr) else {
            return false;
        };
        let (task, code) = (binding.task, binding.code.clone());
        let cid = CallId::from_raw(st.alloc_id() | CallFlags::NOTIFICATION.bits());
        let call = Call::new(code.method, code.args);
        st.deliver(task, IpcEvent::Call { cid, call });
        true
    }

    /// Unblock every receiver, now and in the future. Tasks keep draining
    /// already-queued events.
    pub fn shutdown(&self) {
        let mut st = self.inner.state.lock();
        st.down = true;
        for task in st.tasks.values() {
            task.cv.notify_all();
        }
        log::info!("loopback kernel shut down");
    }
}

impl Port {
    fn answered(cid: CallId) -> CallId {
        CallId::from_raw(cid.index() | CallFlags::ANSWERED.bits())
    }
}

impl KernelIpc for Port {
    fn receive(&self, timeout: Option<Duration>) -> IpcEvent {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut st = self.inner.state.lock();
        loop {
            let task = st.tasks.get_mut(&self.task).expect("receiving task detached");
            if let Some(event) = task.queue.pop_front() {
                return event;
            }
            if task.poked {
                task.poked = false;
                return IpcEvent::TimedOut;
            }
            if st.down {
                return IpcEvent::TimedOut;
            }
            let cv = st.tasks.get(&self.task).expect("receiving task detached").cv.clone();
            match deadline {
                Some(dl) => {
                    if cv.wait_until(&mut st, dl).timed_out() {
                        return IpcEvent::TimedOut;
                    }
                }
                None => cv.wait(&mut st),
            }
        }
    }

    fn send_async(&self, phone: PhoneId, call: Call, userdata: u64, transfer: Transfer) -> IpcResult {
        let mut st = self.inner.state.lock();

        let (owner, target, state) = {
            let ph = st.phones.get(&phone.0).ok_or(IpcError::NotFound)?;
            (ph.owner, ph.target, ph.state)
        };
        if owner != self.task {
            return Err(IpcError::InvalidArgs);
        }
        if state != PhoneState::Connected {
            return Err(IpcError::Hungup);
        }

        let mut call = call;
        call.in_phone_hash = phone.0;

        let kind = match call.method {
            method::CONNECT_ME | method::CONNECT_ME_TO => {
                // Mint the prospective phone now so its hash rides in ARG5;
                // the answer decides whether it lives.
                let new_phone = st.alloc_id();
                st.phones.insert(
                    new_phone,
                    Phone { owner: self.task, target, state: PhoneState::Connecting },
                );
                call.args[4] = new_phone;
                PendingKind::Connect { phone: new_phone }
            }
            method::DATA_READ => PendingKind::DataRead { max: call.args[1] as usize },
            method::DATA_WRITE => {
                let Transfer::Bytes(data) = transfer else {
                    return Err(IpcError::BadMemory);
                };
                call.args[1] = data.len() as u64;
                PendingKind::DataWrite { data }
            }
            method::SHARE_IN => PendingKind::ShareIn,
            method::SHARE_OUT => {
                let Transfer::Area(area, flags) = transfer else {
                    return Err(IpcError::BadMemory);
                };
                call.args[1] = area.len() as u64;
                call.args[2] = flags.bits();
                PendingKind::ShareOut { area, flags }
            }
            method::PHONE_HUNGUP => {
                if let Some(ph) = st.phones.get_mut(&phone.0) {
                    ph.state = PhoneState::Hungup;
                }
                PendingKind::Plain
            }
            _ => PendingKind::Plain,
        };

        let cid = st.alloc_id();
        st.pending.insert(cid, Pending { caller: self.task, userdata, call, kind });
        log::trace!("call {cid}: task {} -> task {target}, method {}", self.task, call.method);
        st.deliver(target, IpcEvent::Call { cid: CallId::from_raw(cid), call });
        Ok(())
    }

    fn answer(&self, cid: CallId, retval: u64, args: [u64; 5]) -> IpcResult {
        let mut st = self.inner.state.lock();
        let p = st.pending.remove(&cid.index()).ok_or(IpcError::NotFound)?;

        let mut args = args;
        if let PendingKind::Connect { phone } = p.kind {
            if retval == RC_OK {
                if let Some(ph) = st.phones.get_mut(&phone) {
                    ph.state = PhoneState::Connected;
                }
                args[4] = phone;
            } else {
                st.phones.remove(&phone);
            }
        }

        st.deliver(
            p.caller,
            IpcEvent::Answer {
                cid: Self::answered(cid),
                userdata: p.userdata,
                retval,
                call: Call::new(0, args),
                transfer: Transfer::None,
            },
        );
        Ok(())
    }

    fn forward(
        &self,
        cid: CallId,
        phone: PhoneId,
        fmethod: u64,
        fargs: [u64; 2],
        _mode: ForwardMode,
    ) -> IpcResult {
        let mut st = self.inner.state.lock();

        let (owner, target, state) = {
            let ph = st.phones.get(&phone.0).ok_or(IpcError::ForwardRejected)?;
            (ph.owner, ph.target, ph.state)
        };
        if owner != self.task {
            return Err(IpcError::InvalidArgs);
        }
        if state != PhoneState::Connected {
            return Err(IpcError::ForwardRejected);
        }

        let p = st.pending.get_mut(&cid.index()).ok_or(IpcError::NotFound)?;
        let mut call = p.call;
        if call.method >= method::FIRST_USER {
            // User methods may be rewritten by the forwarder; system
            // methods keep theirs.
            call.method = fmethod;
            call.args[0] = fargs[0];
            call.args[1] = fargs[1];
        }
        call.in_phone_hash = phone.0;
        p.call = call;
        st.deliver(target, IpcEvent::Call { cid: CallId::from_raw(cid.index()), call });
        Ok(())
    }

    fn data_read_finalize(&self, cid: CallId, data: &[u8]) -> IpcResult {
        let mut st = self.inner.state.lock();
        match st.pending.get(&cid.index()).map(|p| &p.kind) {
            Some(PendingKind::DataRead { .. }) => {}
            Some(_) => return Err(IpcError::InvalidArgs),
            None => return Err(IpcError::NotFound),
        }
        let p = st.pending.remove(&cid.index()).expect("checked above");
        let PendingKind::DataRead { max } = p.kind else { unreachable!() };

        if data.len() > max {
            let (caller, userdata) = (p.caller, p.userdata);
            st.deliver(
                caller,
                IpcEvent::Answer {
                    cid: Self::answered(cid),
                    userdata,
                    retval: IpcError::LimitExceeded.into(),
                    call: Call::default(),
                    transfer: Transfer::None,
                },
            );
            return Err(IpcError::LimitExceeded);
        }

        st.deliver(
            p.caller,
            IpcEvent::Answer {
                cid: Self::answered(cid),
                userdata: p.userdata,
                retval: RC_OK,
                call: Call::new(0, [0, data.len() as u64, 0, 0, 0]),
                transfer: Transfer::Bytes(data.to_vec()),
            },
        );
        Ok(())
    }

    fn data_write_finalize(&self, cid: CallId, size: usize) -> IpcResult<Vec<u8>> {
        let mut st = self.inner.state.lock();
        match st.pending.get(&cid.index()).map(|p| &p.kind) {
            Some(PendingKind::DataWrite { .. }) => {}
            Some(_) => return Err(IpcError::InvalidArgs),
            None => return Err(IpcError::NotFound),
        }
        let p = st.pending.remove(&cid.index()).expect("checked above");
        let PendingKind::DataWrite { mut data } = p.kind else { unreachable!() };

        data.truncate(size);
        st.deliver(
            p.caller,
            IpcEvent::Answer {
                cid: Self::answered(cid),
                userdata: p.userdata,
                retval: RC_OK,
                call: Call::new(0, [0, data.len() as u64, 0, 0, 0]),
                transfer: Transfer::None,
            },
        );
        Ok(data)
    }

    fn share_in_finalize(&self, cid: CallId, area: SharedArea, flags: ShareFlags) -> IpcResult {
        let mut st = self.inner.state.lock();
        match st.pending.get(&cid.index()).map(|p| &p.kind) {
            Some(PendingKind::ShareIn) => {}
            Some(_) => return Err(IpcError::InvalidArgs),
            None => return Err(IpcError::NotFound),
        }
        let p = st.pending.remove(&cid.index()).expect("checked above");

        st.deliver(
            p.caller,
            IpcEvent::Answer {
                cid: Self::answered(cid),
                userdata: p.userdata,
                retval: RC_OK,
                call: Call::new(0, [0, flags.bits(), 0, 0, 0]),
                transfer: Transfer::Area(area, flags),
            },
        );
        Ok(())
    }

    fn share_out_finalize(&self, cid: CallId) -> IpcResult<SharedArea> {
        let mut st = self.inner.state.lock();
        match st.pending.get(&cid.index()).map(|p| &p.kind) {
            Some(PendingKind::ShareOut { .. }) => {}
            Some(_) => return Err(IpcError::InvalidArgs),
            None => return Err(IpcError::NotFound),
        }
        let p = st.pending.remove(&cid.index()).expect("checked above");
        let PendingKind::ShareOut { area, flags: _ } = p.kind else { unreachable!() };

        st.deliver(
            p.caller,
            IpcEvent::Answer {
                cid: Self::answered(cid),
                userdata: p.userdata,
                retval: RC_OK,
                call: Call::default(),
                transfer: Transfer::None,
            },
        );
        Ok(area)
    }

    fn register_irq(&self, inr: u32, devno: u32, code: IrqCode) -> IpcResult {
        let mut st = self.inner.state.lock();
        st.irqs.insert(inr, IrqBinding { task: self.task, devno, code });
        Ok(())
    }

    fn poke(&self) {
        let mut st = self.inner.state.lock();
        if let Some(task) = st.tasks.get_mut(&self.task) {
            task.poked = true;
            task.cv.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_call(args: [u64; 5]) -> Call {
        Call::new(method::FIRST_USER, args)
    }

    #[test]
    fn call_and_answer_round_trip() {
        let lb = Loopback::new();
        let a = lb.port("a");
        let b = lb.port("b");
        let phone = lb.connect(&a, &b);

        a.send_async(phone, user_call([1, 2, 3, 4, 5]), 77, Transfer::None).unwrap();

        let IpcEvent::Call { cid, call } = b.receive(Some(Duration::from_secs(1))) else {
            panic!("expected a call");
        };
        assert_eq!(call.method, method::FIRST_USER);
        assert_eq!(call.in_phone_hash, phone.0);

        b.answer(cid, RC_OK, [9, 0, 0, 0, 0]).unwrap();
        let IpcEvent::Answer { cid, userdata, retval, call, .. } =
            a.receive(Some(Duration::from_secs(1)))
        else {
            panic!("expected an answer");
        };
        assert!(cid.is_answered());
        assert_eq!(userdata, 77);
        assert_eq!(retval, RC_OK);
        assert_eq!(call.args[0], 9);
    }

    #[test]
    fn answer_is_consumed_exactly_once() {
        let lb = Loopback::new();
        let a = lb.port("a");
        let b = lb.port("b");
        let phone = lb.connect(&a, &b);

        a.send_async(phone, user_call([0; 5]), 1, Transfer::None).unwrap();
        let IpcEvent::Call { cid, .. } = b.receive(Some(Duration::from_secs(1))) else {
            panic!("expected a call");
        };
        b.answer(cid, RC_OK, [0; 5]).unwrap();
        assert_eq!(b.answer(cid, RC_OK, [0; 5]), Err(IpcError::NotFound));
    }

    #[test]
    fn hungup_phone_refuses_sends() {
        let lb = Loopback::new();
        let a = lb.port("a");
        let b = lb.port("b");
        let phone = lb.connect(&a, &b);

        a.send_async(phone, Call::new(method::PHONE_HUNGUP, [0; 5]), 1, Transfer::None).unwrap();
        assert_eq!(
            a.send_async(phone, user_call([0; 5]), 2, Transfer::None),
            Err(IpcError::Hungup)
        );
    }

    #[test]
    fn poke_unblocks_receive_once() {
        let lb = Loopback::new();
        let a = lb.port("a");
        a.poke();
        assert!(matches!(a.receive(None), IpcEvent::TimedOut));
        assert!(matches!(a.receive(Some(Duration::from_millis(5))), IpcEvent::TimedOut));
    }

    #[test]
    fn receive_times_out() {
        let lb = Loopback::new();
        let a = lb.port("a");
        let before = Instant::now();
        assert!(matches!(a.receive(Some(Duration::from_millis(10))), IpcEvent::TimedOut));
        assert!(before.elapsed() >= Duration::from_millis(10));
    }
}
