//! Asynchronous IPC framework.
//!
//! The kernel's IPC primitive is synchronous and message-oriented: one
//! blocking receive, short identifier-keyed calls, one answer per call.
//! This library turns that into long-lived, multiplexed connections served
//! by cooperatively scheduled fibrils, so servers read as plain sequential
//! code.
//!
//! A server installs a connection handler and starts a manager:
//!
//! ```ignore
//! let rt = Runtime::new(kernel);
//! rt.set_client_connection(Arc::new(|rt, cid, _call| {
//!     let _ = rt.answer(cid, Ok(()), [0; 5]);
//!     loop {
//!         let (cid, call) = rt.get_call();
//!         match call.method {
//!             method::PHONE_HUNGUP => return,
//!             m => { let _ = rt.answer(cid, Ok(()), call.args); }
//!         }
//!     }
//! }));
//! rt.create_manager();
//! ```
//!
//! A client connects and issues pseudo-synchronous requests:
//!
//! ```ignore
//! let session = rt.connect_me_to(phone, 0, 0, 0)?;
//! let reply = rt.request_fast(session, method::FIRST_USER, 42, 0, 0, 0)?;
//! ```

mod amsg;
mod bulk;
mod conn;
mod fibril;
mod manager;
mod runtime;
mod sync;
mod timeout;

pub use amsg::Aid;
pub use bulk::{AcceptLimits, UnexpectedCall};
pub use fibril::{Fid, current_fibril};
pub use runtime::{ConnectionHandler, Runtime};
pub use sync::Semaphore;

pub use ipc_types::{
    Call, CallFlags, CallId, IpcError, IpcResult, IrqCode, KernelIpc, PhoneId, ShareFlags,
    SharedArea, method,
};
