//! Inbound connections: the hash-keyed connection table, call routing, and
//! the per-connection server fibril.
//!
//! A connection is served by exactly one fibril, which is also the single
//! writer of its lifetime: when the user handler returns, the fibril
//! removes the table entry, answers everything still queued with `EHANGUP`
//! and acknowledges a pending hangup with `EOK`.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use ipc_types::{Call, CallId, IpcError, IpcResult, RC_OK, method};

use crate::fibril::{self, Fid};
use crate::runtime::{ConnectionHandler, Runtime};
use crate::timeout::{Awaiter, WakeKey};

pub(crate) struct InboxMsg {
    pub(crate) cid: CallId,
    pub(crate) call: Call,
}

pub(crate) struct Connection {
    pub(crate) inbox: VecDeque<InboxMsg>,
    /// Identification of the pending close call, once the peer hung up.
    pub(crate) close_call: Option<CallId>,
    pub(crate) wdata: Awaiter,
}

/// Connections keyed by in-phone hash. An entry exists exactly as long as
/// its server fibril runs.
pub(crate) struct ConnTable {
    pub(crate) map: HashMap<u64, Connection>,
}

impl ConnTable {
    pub(crate) fn new() -> Self {
        Self { map: HashMap::new() }
    }
}

impl Runtime {
    /// Route an inbound call to the connection it belongs to. Returns false
    /// when no connection matches; the caller then answers the call itself.
    pub(crate) fn route_call(&self, cid: CallId, call: Call) -> bool {
        let mut guard = self.inner.state.lock();
        let st = &mut *guard;
        let Some(conn) = st.conns.map.get_mut(&call.in_phone_hash) else {
            return false;
        };

        conn.inbox.push_back(InboxMsg { cid, call });
        if call.method == method::PHONE_HUNGUP {
            conn.close_call = Some(cid);
        }

        // Wake the server fibril if it is parked waiting for an event.
        if !conn.wdata.active {
            if conn.wdata.in_list {
                conn.wdata.in_list = false;
                st.timeouts.remove(WakeKey::Connection(call.in_phone_hash));
            }
            conn.wdata.active = true;
            st.fibrils.make_ready(conn.wdata.fid);
        }
        true
    }

    /// Install a new connection under `in_phone_hash` and start a server
    /// fibril for it running `handler(opening cid, opening call)`.
    ///
    /// An occupied hash answers the opening call `ELIMIT`; a fibril that
    /// cannot be created answers `ENOMEM`.
    pub fn new_connection(
        &self,
        in_phone_hash: u64,
        cid: CallId,
        call: Call,
        handler: ConnectionHandler,
    ) -> IpcResult<Fid> {
        let fid = {
            let mut guard = self.inner.state.lock();
            let st = &mut *guard;
            if st.conns.map.contains_key(&in_phone_hash) {
                drop(guard);
                log::warn!("connection hash {in_phone_hash} already taken");
                let _ = self.inner.kernel.answer(cid, IpcError::LimitExceeded.into(), [0; 5]);
                return Err(IpcError::LimitExceeded);
            }
            let fid = st.fibrils.alloc();
            st.conns.map.insert(
                in_phone_hash,
                Connection {
                    inbox: VecDeque::new(),
                    close_call: None,
                    // The fibril starts out runnable, not parked.
                    wdata: Awaiter::new(fid),
                },
            );
            fid
        };

        let spawned = spawn_connection_fibril(self, fid, in_phone_hash, cid, call, handler);
        if spawned.is_err() {
            let mut st = self.inner.state.lock();
            st.conns.map.remove(&in_phone_hash);
            st.fibrils.slots.remove(&fid);
            drop(st);
            let _ = self.inner.kernel.answer(cid, IpcError::NoMemory.into(), [0; 5]);
            return Err(IpcError::NoMemory);
        }

        self.inner.state.lock().fibrils.make_ready(fid);
        log::debug!("connection {in_phone_hash} opened, fibril {fid:?}");
        Ok(fid)
    }

    /// Next message for the connection served by the calling fibril.
    /// Blocks until one arrives.
    pub fn get_call(&self) -> (CallId, Call) {
        self.get_call_inner(None).expect("unbounded get_call cannot time out")
    }

    /// Like [`Runtime::get_call`], returning `None` once `timeout` passes
    /// without a message.
    pub fn get_call_timeout(&self, timeout: Duration) -> Option<(CallId, Call)> {
        self.get_call_inner(Some(timeout))
    }

    fn get_call_inner(&self, timeout: Option<Duration>) -> Option<(CallId, Call)> {
        let hash = fibril::current_connection().expect("get_call outside a connection fibril");
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            {
                let mut guard = self.inner.state.lock();
                let st = &mut *guard;
                let conn = st.conns.map.get_mut(&hash).expect("connection record missing");

                if let Some(msg) = conn.inbox.pop_front() {
                    return Some((msg.cid, msg.call));
                }

                if let Some(close_cid) = conn.close_call {
                    // The peer already hung up but the server keeps asking;
                    // repeat the hangup until it notices.
                    let call = Call { method: method::PHONE_HUNGUP, ..Call::default() };
                    return Some((close_cid, call));
                }

                if let Some(dl) = deadline {
                    conn.wdata.occurred = false;
                    conn.wdata.in_list = true;
                    st.timeouts.insert(dl, WakeKey::Connection(hash));
                }
                conn.wdata.active = false;
            }

            // Woken either by route_call or by the expiry sweep.
            fibril::switch_to_manager(self);

            {
                let st = self.inner.state.lock();
                let conn = st.conns.map.get(&hash).expect("connection record missing");
                if deadline.is_some() && conn.wdata.occurred && conn.inbox.is_empty() {
                    return None;
                }
            }
        }
    }
}

fn spawn_connection_fibril(
    rt: &Runtime,
    fid: Fid,
    hash: u64,
    open_cid: CallId,
    open_call: Call,
    handler: ConnectionHandler,
) -> IpcResult<Fid> {
    fibril::create_with_fid(rt, fid, "conn", move |rt| {
        fibril::set_current_connection(Some(hash));
        handler(rt, open_cid, &open_call);

        // Handler is done with the connection; take it out of the table and
        // settle everything still pending.
        let conn = rt.inner.state.lock().conns.map.remove(&hash).expect("connection vanished");
        for msg in conn.inbox {
            let _ = rt.inner.kernel.answer(msg.cid, IpcError::Hungup.into(), [0; 5]);
        }
        if let Some(close_cid) = conn.close_call {
            let _ = rt.inner.kernel.answer(close_cid, RC_OK, [0; 5]);
        }
        fibril::set_current_connection(None);
        log::debug!("connection {hash} closed");
    })
}
