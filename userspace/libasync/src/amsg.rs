//! Outbound calls: the in-flight message table and the wait primitives on
//! top of it.
//!
//! Every `send_*` allocates a message record keyed by the userdata token
//! handed to the kernel; the reply event carries the token back and
//! [`Runtime::complete_amsg`] finishes the record. `done` transitions false
//! to true exactly once, and only there.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use ipc_types::{Call, IpcError, IpcResult, PhoneId, Transfer, retval_to_result};

use crate::fibril::{self, Fid};
use crate::runtime::Runtime;
use crate::timeout::{Awaiter, WakeKey};

/// Handle of one in-flight outbound message. Consumed by the wait that
/// resolves it; a timed-out wait consumes it too, so a message cannot be
/// awaited twice.
#[derive(Debug)]
pub struct Aid(pub(crate) u64);

pub(crate) struct Amsg {
    pub(crate) wdata: Awaiter,
    pub(crate) done: bool,
    /// The waiter timed out and gave up; the reply completion reaps the
    /// record instead of waking anyone.
    pub(crate) abandoned: bool,
    pub(crate) retval: u64,
    pub(crate) reply: Call,
    pub(crate) transfer: Transfer,
}

pub(crate) struct AmsgTable {
    pub(crate) map: HashMap<u64, Amsg>,
    next: u64,
}

impl AmsgTable {
    pub(crate) fn new() -> Self {
        Self { map: HashMap::new(), next: 1 }
    }

    fn alloc(&mut self, fid: Fid) -> u64 {
        let id = self.next;
        self.next += 1;
        self.map.insert(
            id,
            Amsg {
                wdata: Awaiter::new(fid),
                done: false,
                abandoned: false,
                retval: 0,
                reply: Call::default(),
                transfer: Transfer::None,
            },
        );
        id
    }
}

impl Runtime {
    /// Send a message carrying four payload words. The returned handle
    /// feeds [`Runtime::wait_for`] or [`Runtime::wait_timeout`].
    pub fn send_fast(&self, phone: PhoneId, method: u64, a1: u64, a2: u64, a3: u64, a4: u64) -> Aid {
        self.send_call(phone, Call::new(method, [a1, a2, a3, a4, 0]), Transfer::None)
    }

    /// Send a message carrying all five payload words.
    pub fn send_slow(
        &self,
        phone: PhoneId,
        method: u64,
        a1: u64,
        a2: u64,
        a3: u64,
        a4: u64,
        a5: u64,
    ) -> Aid {
        self.send_call(phone, Call::new(method, [a1, a2, a3, a4, a5]), Transfer::None)
    }

    pub(crate) fn send_call(&self, phone: PhoneId, call: Call, transfer: Transfer) -> Aid {
        let me = fibril::current_fibril().expect("send outside fibril context");
        let id = self.inner.state.lock().amsgs.alloc(me);
        log::trace!("send {} method {} as amsg {id}", phone.0, call.method);
        if let Err(e) = self.inner.kernel.send_async(phone, call, id, transfer) {
            // The kernel refused the send; complete locally so the wait
            // surfaces the error through the normal path.
            self.complete_amsg(id, e.into(), Call::default(), Transfer::None);
        }
        Aid(id)
    }

    /// Block until the reply for `aid` arrives and return its payload, or
    /// the error code the peer answered with.
    pub fn wait_for(&self, aid: Aid) -> IpcResult<Call> {
        match self.wait_inner(aid.0, None) {
            Ok((rc, reply, _)) => retval_to_result(rc).map(|()| reply),
            Err(_) => unreachable!("untimed wait cannot time out"),
        }
    }

    /// Like [`Runtime::wait_for`], giving up with [`IpcError::TimedOut`]
    /// after `timeout`. The in-flight message stays alive until its reply
    /// arrives; the handle is consumed either way.
    pub fn wait_timeout(&self, aid: Aid, timeout: Duration) -> IpcResult<Call> {
        let (rc, reply, _) = self.wait_inner(aid.0, Some(timeout))?;
        retval_to_result(rc).map(|()| reply)
    }

    /// Wait variant for the bulk helpers: raw return value plus the
    /// out-of-band transfer riding on the answer.
    pub(crate) fn wait_full(&self, aid: Aid) -> (u64, Call, Transfer) {
        match self.wait_inner(aid.0, None) {
            Ok(parts) => parts,
            Err(_) => unreachable!("untimed wait cannot time out"),
        }
    }

    fn wait_inner(
        &self,
        id: u64,
        timeout: Option<Duration>,
    ) -> Result<(u64, Call, Transfer), IpcError> {
        let me = fibril::current_fibril().expect("wait outside fibril context");

        let parked = {
            let mut guard = self.inner.state.lock();
            let st = &mut *guard;
            let msg = st.amsgs.map.get_mut(&id).expect("wait on an unknown message");
            if msg.done {
                false
            } else {
                msg.wdata.fid = me;
                msg.wdata.active = false;
                if let Some(t) = timeout {
                    msg.wdata.occurred = false;
                    msg.wdata.in_list = true;
                    st.timeouts.insert(Instant::now() + t, WakeKey::Amsg(id));
                } else {
                    msg.wdata.in_list = false;
                }
                true
            }
        };
        if parked {
            fibril::switch_to_manager(self);
        }

        let mut guard = self.inner.state.lock();
        let st = &mut *guard;
        {
            let msg = st.amsgs.map.get_mut(&id).expect("awaited message vanished");
            if !msg.done {
                debug_assert!(msg.wdata.occurred, "woken with neither reply nor timeout");
                msg.abandoned = true;
                return Err(IpcError::TimedOut);
            }
        }
        let msg = st.amsgs.map.remove(&id).expect("awaited message vanished");
        Ok((msg.retval, msg.reply, msg.transfer))
    }

    /// Reply completion, invoked from dispatcher context for every answer
    /// event the kernel delivers.
    pub(crate) fn complete_amsg(&self, userdata: u64, retval: u64, reply: Call, transfer: Transfer) {
        let mut guard = self.inner.state.lock();
        let st = &mut *guard;
        let Some(msg) = st.amsgs.map.get_mut(&userdata) else {
            log::warn!("reply for unknown amsg {userdata}");
            return;
        };
        debug_assert!(!msg.done, "reply delivered twice for amsg {userdata}");
        msg.retval = retval;
        msg.reply = reply;
        msg.transfer = transfer;
        if msg.wdata.in_list {
            msg.wdata.in_list = false;
            st.timeouts.remove(WakeKey::Amsg(userdata));
        }
        msg.done = true;
        if msg.abandoned {
            // The waiter already timed out and moved on.
            st.amsgs.map.remove(&userdata);
        } else if !msg.wdata.active {
            msg.wdata.active = true;
            st.fibrils.make_ready(msg.wdata.fid);
        }
    }

    /// Suspend the calling fibril for `duration`; the hosting thread keeps
    /// serving other fibrils meanwhile.
    pub fn usleep(&self, duration: Duration) {
        let me = fibril::current_fibril().expect("usleep outside fibril context");
        self.inner.state.lock().timeouts.insert(Instant::now() + duration, WakeKey::Sleeper(me));
        fibril::switch_to_manager(self);
    }
}
