//! The runtime object: owns every piece of shared framework state and
//! exposes the client-side request helpers.

use std::sync::Arc;

use ipc_types::{
    CONNECT_BLOCKING, Call, CallId, IpcResult, IrqCode, KernelIpc, PhoneId, method,
    result_to_retval,
};
use parking_lot::{Condvar, Mutex};

use crate::amsg::AmsgTable;
use crate::conn::ConnTable;
use crate::fibril::{self, Fid, FibrilTable};
use crate::manager;
use crate::timeout::TimeoutQueue;

/// Server function run per connection (or per notification): receives the
/// opening call and typically loops on [`Runtime::get_call`].
pub type ConnectionHandler = Arc<dyn Fn(&Runtime, CallId, &Call) + Send + Sync>;

pub(crate) struct AsyncInner {
    pub(crate) fibrils: FibrilTable,
    pub(crate) conns: ConnTable,
    pub(crate) amsgs: AmsgTable,
    pub(crate) timeouts: TimeoutQueue,
    pub(crate) client_connection: ConnectionHandler,
    pub(crate) interrupt_received: ConnectionHandler,
}

pub(crate) struct RuntimeInner {
    pub(crate) kernel: Arc<dyn KernelIpc>,
    pub(crate) state: Mutex<AsyncInner>,
    /// Signaled by a manager worker once it has deregistered itself.
    pub(crate) manager_exited: Condvar,
}

/// Handle to one async framework instance. Cheap to clone; every fibril of
/// a process shares the same instance.
#[derive(Clone)]
pub struct Runtime {
    pub(crate) inner: Arc<RuntimeInner>,
}

impl Runtime {
    /// Framework over the given kernel endpoint, with the default handlers:
    /// refuse connections with `ENOENT`, ignore notifications.
    pub fn new(kernel: Arc<dyn KernelIpc>) -> Self {
        let client_connection: ConnectionHandler = Arc::new(|rt: &Runtime, cid: CallId, _call: &Call| {
            let _ = rt.answer(cid, Err(ipc_types::IpcError::NotFound), [0; 5]);
        });
        let interrupt_received: ConnectionHandler =
            Arc::new(|_rt: &Runtime, _cid: CallId, _call: &Call| {});
        Self {
            inner: Arc::new(RuntimeInner {
                kernel,
                state: Mutex::new(AsyncInner {
                    fibrils: FibrilTable::new(),
                    conns: ConnTable::new(),
                    amsgs: AmsgTable::new(),
                    timeouts: TimeoutQueue::new(),
                    client_connection,
                    interrupt_received,
                }),
                manager_exited: Condvar::new(),
            }),
        }
    }

    /// Install the server function run for every new inbound connection.
    /// Connections already open keep the handler they started with.
    pub fn set_client_connection(&self, handler: ConnectionHandler) {
        self.inner.state.lock().client_connection = handler;
    }

    /// Install the function run, on a fresh fibril, for every notification.
    pub fn set_interrupt_received(&self, handler: ConnectionHandler) {
        self.inner.state.lock().interrupt_received = handler;
    }

    /// Start the manager worker on its own thread. A runtime hosts one
    /// manager at a time; after [`Runtime::destroy_manager`] this call
    /// waits for the outgoing manager to finish deregistering itself, so
    /// `destroy_manager(); create_manager();` is a safe rotation.
    pub fn create_manager(&self) {
        let fid = {
            let mut st = self.inner.state.lock();
            while !st.fibrils.managers.is_empty() {
                // A live manager that was never asked to stop is a caller
                // bug; one on its way out is waited for.
                assert!(st.fibrils.managers_to_stop > 0, "runtime already has a manager");
                self.inner.manager_exited.wait(&mut st);
            }
            let fid = st.fibrils.alloc();
            st.fibrils.managers.push(fid);
            fid
        };
        let rt = self.clone();
        std::thread::Builder::new()
            .name(format!("manager-{}", fid.0))
            .spawn(move || {
                fibril::set_current_fibril(Some(fid));
                manager::worker(&rt, fid);
            })
            .expect("cannot spawn manager thread");
    }

    /// Ask one manager to exit. Takes effect when that manager next returns
    /// from the kernel receive.
    pub fn destroy_manager(&self) {
        self.inner.state.lock().fibrils.managers_to_stop += 1;
        self.inner.kernel.poke();
    }

    /// Create a fibril running `body` and make it ready. It starts once a
    /// manager picks it up.
    pub fn spawn(
        &self,
        name: &str,
        body: impl FnOnce(&Runtime) + Send + 'static,
    ) -> IpcResult<Fid> {
        let fid = fibril::create(self, name, body)?;
        self.inner.state.lock().fibrils.make_ready(fid);
        // The spawner may not be a fibril of ours, so nudge a receiver.
        self.inner.kernel.poke();
        Ok(fid)
    }

    /// Answer call `cid`.
    pub fn answer(&self, cid: CallId, ret: IpcResult, args: [u64; 5]) -> IpcResult {
        self.inner.kernel.answer(cid, result_to_retval(ret), args)
    }

    /// Send with four payload words and block for the reply.
    /// Pseudo-synchronous from the fibril's point of view.
    pub fn request_fast(
        &self,
        phone: PhoneId,
        method: u64,
        a1: u64,
        a2: u64,
        a3: u64,
        a4: u64,
    ) -> IpcResult<Call> {
        let aid = self.send_fast(phone, method, a1, a2, a3, a4);
        self.wait_for(aid)
    }

    /// Send with all five payload words and block for the reply.
    pub fn request_slow(
        &self,
        phone: PhoneId,
        method: u64,
        a1: u64,
        a2: u64,
        a3: u64,
        a4: u64,
        a5: u64,
    ) -> IpcResult<Call> {
        let aid = self.send_slow(phone, method, a1, a2, a3, a4, a5);
        self.wait_for(aid)
    }

    /// Ask the peer behind `phone` for a new connection. The reply carries
    /// the fresh phone in ARG5.
    pub fn connect_me_to(&self, phone: PhoneId, a1: u64, a2: u64, a3: u64) -> IpcResult<PhoneId> {
        let reply = self.request_fast(phone, method::CONNECT_ME_TO, a1, a2, a3, 0)?;
        Ok(PhoneId(reply.args[4]))
    }

    /// Like [`Runtime::connect_me_to`], asking the kernel to wait for the
    /// destination to appear.
    pub fn connect_me_to_blocking(
        &self,
        phone: PhoneId,
        a1: u64,
        a2: u64,
        a3: u64,
    ) -> IpcResult<PhoneId> {
        let reply =
            self.request_fast(phone, method::CONNECT_ME_TO, a1, a2, a3, CONNECT_BLOCKING)?;
        Ok(PhoneId(reply.args[4]))
    }

    /// Close the connection behind `phone`. Blocks until the peer's server
    /// fibril acknowledged the hangup (or already tore the connection
    /// down, which counts as closed too).
    pub fn hangup(&self, phone: PhoneId) -> IpcResult {
        match self.request_fast(phone, method::PHONE_HUNGUP, 0, 0, 0, 0) {
            Ok(_) | Err(ipc_types::IpcError::Hungup) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Install an interrupt handler program; the notification it produces
    /// runs the `interrupt_received` handler.
    pub fn register_irq(&self, inr: u32, devno: u32, code: IrqCode) -> IpcResult {
        self.inner.kernel.register_irq(inr, devno, code)
    }
}
