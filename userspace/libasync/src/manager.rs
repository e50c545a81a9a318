//! The manager fibril: owns the kernel receive and demultiplexes every
//! inbound event.
//!
//! Each loop iteration first lets ready fibrils run, then blocks in the
//! kernel receive for at most the time until the earliest pending deadline.
//! A received event is a reply (completes its outbound message), a
//! notification (spawns a handler fibril), a connection request (opens a
//! connection) or an in-connection call (routed to its inbox). Anything
//! unroutable is answered `EHANGUP` so the peer observes a definite close.

use std::time::Instant;

use ipc_types::{Call, CallId, IpcError, IpcEvent, method};

use crate::fibril::{self, Fid};
use crate::runtime::Runtime;
use crate::timeout::WakeKey;

enum WaitBudget {
    Expired,
    Wait(std::time::Duration),
    Forever,
}

pub(crate) fn worker(rt: &Runtime, my_fid: Fid) {
    log::info!("async manager {my_fid:?} started");
    loop {
        {
            let mut st = rt.inner.state.lock();
            if st.fibrils.managers_to_stop > 0 {
                st.fibrils.managers_to_stop -= 1;
                st.fibrils.managers.retain(|m| *m != my_fid);
                st.fibrils.slots.remove(&my_fid);
                drop(st);
                // Unblock anyone waiting in create_manager for the slot.
                rt.inner.manager_exited.notify_all();
                break;
            }
        }

        if fibril::run_one_ready(rt, my_fid) {
            // A fibril ran and yielded back; drain the ready queue before
            // touching the kernel again.
            continue;
        }

        let budget = {
            let st = rt.inner.state.lock();
            match st.timeouts.next_deadline() {
                Some(deadline) => {
                    let now = Instant::now();
                    if deadline <= now {
                        WaitBudget::Expired
                    } else {
                        WaitBudget::Wait(deadline - now)
                    }
                }
                None => WaitBudget::Forever,
            }
        };
        let timeout = match budget {
            WaitBudget::Expired => {
                rt.handle_expired_timeouts();
                continue;
            }
            WaitBudget::Wait(d) => Some(d),
            WaitBudget::Forever => None,
        };

        match rt.inner.kernel.receive(timeout) {
            IpcEvent::TimedOut => rt.handle_expired_timeouts(),
            IpcEvent::Answer { cid, userdata, retval, call, transfer } => {
                debug_assert!(cid.is_answered());
                log::trace!("reply {cid:?} for amsg {userdata}");
                rt.complete_amsg(userdata, retval, call, transfer);
            }
            IpcEvent::Call { cid, call } => rt.handle_call(cid, call),
        }
    }
    log::info!("async manager {my_fid:?} stopped");
}

impl Runtime {
    fn handle_call(&self, cid: CallId, call: Call) {
        if cid.is_notification() {
            let handler = self.inner.state.lock().interrupt_received.clone();
            let created = fibril::create(self, "notif", move |rt| handler(rt, cid, &call));
            match created {
                Ok(fid) => self.inner.state.lock().fibrils.make_ready(fid),
                Err(e) => log::warn!("dropping notification {cid:?}: {e}"),
            }
            return;
        }

        match call.method {
            method::CONNECT_ME | method::CONNECT_ME_TO => {
                let handler = self.inner.state.lock().client_connection.clone();
                let _ = self.new_connection(call.args[4], cid, call, handler);
            }
            _ => {
                if !self.route_call(cid, call) {
                    log::warn!("unrouted call {cid:?}, method {}", call.method);
                    let _ = self.inner.kernel.answer(cid, IpcError::Hungup.into(), [0; 5]);
                }
            }
        }
    }

    /// Fire every deadline that has passed, stopping at the first future
    /// one.
    pub(crate) fn handle_expired_timeouts(&self) {
        let now = Instant::now();
        let mut guard = self.inner.state.lock();
        let st = &mut *guard;
        while let Some(key) = st.timeouts.pop_expired(now) {
            match key {
                WakeKey::Sleeper(fid) => st.fibrils.make_ready(fid),
                WakeKey::Connection(hash) => {
                    if let Some(conn) = st.conns.map.get_mut(&hash) {
                        conn.wdata.in_list = false;
                        conn.wdata.occurred = true;
                        if !conn.wdata.active {
                            conn.wdata.active = true;
                            st.fibrils.make_ready(conn.wdata.fid);
                        }
                    }
                }
                WakeKey::Amsg(id) => {
                    if let Some(msg) = st.amsgs.map.get_mut(&id) {
                        msg.wdata.in_list = false;
                        msg.wdata.occurred = true;
                        if !msg.wdata.active {
                            msg.wdata.active = true;
                            st.fibrils.make_ready(msg.wdata.fid);
                        }
                    }
                }
            }
        }
    }
}
