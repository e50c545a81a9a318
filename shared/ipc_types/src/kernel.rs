//! The kernel-IPC facade: the narrow set of operations the async framework
//! actually invokes, abstracted behind a trait so servers run against the
//! real kernel or an in-process stand-in alike.

use std::time::Duration;

use bitflags::bitflags;

use crate::share::{ShareFlags, SharedArea};
use crate::{Call, CallId, IpcResult, PhoneId};

/// Out-of-band data riding on a call or an answer.
#[derive(Debug, Clone, Default)]
pub enum Transfer {
    #[default]
    None,
    /// A byte buffer copied across address spaces.
    Bytes(Vec<u8>),
    /// A shared address space area with the rights it was granted with.
    Area(SharedArea, ShareFlags),
}

/// What a kernel receive produced.
#[derive(Debug)]
pub enum IpcEvent {
    /// The wait budget ran out (or the receive was poked) without a message.
    TimedOut,
    /// An inbound call to be dispatched.
    Call { cid: CallId, call: Call },
    /// A reply to an earlier `send_async`. `userdata` is the token that was
    /// handed to the kernel at send time; `cid` carries the ANSWERED tag.
    Answer { cid: CallId, userdata: u64, retval: u64, call: Call, transfer: Transfer },
}

bitflags! {
    /// Forwarding behavior flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ForwardMode: u64 {
        /// Make the forwarded call appear to come from the forwarder.
        const ROUTE_FROM_ME = 1 << 0;
    }
}

/// An interrupt handler program, distilled to the notification call record
/// the kernel delivers when the interrupt fires.
#[derive(Debug, Clone)]
pub struct IrqCode {
    pub method: u64,
    pub args: [u64; 5],
}

/// Kernel IPC operations consumed by the async framework.
///
/// Answering side and sending side of every operation match the kernel's
/// contract: a call is answered exactly once, replies are delivered to the
/// original caller even across forwards, and notifications expect no answer.
pub trait KernelIpc: Send + Sync {
    /// Block up to `timeout` (forever if `None`) for the next event.
    fn receive(&self, timeout: Option<Duration>) -> IpcEvent;

    /// Non-blocking send. The reply later surfaces as [`IpcEvent::Answer`]
    /// carrying `userdata` back. A refused send reports the error
    /// immediately and produces no reply event.
    fn send_async(&self, phone: PhoneId, call: Call, userdata: u64, transfer: Transfer)
    -> IpcResult;

    /// Answer call `cid` with a return value and up to five reply words.
    fn answer(&self, cid: CallId, retval: u64, args: [u64; 5]) -> IpcResult;

    /// Re-route `cid` through `phone`, preserving the original caller as
    /// the reply destination. User-method calls are rewritten to `method`
    /// and `args`; system-method calls keep theirs.
    fn forward(&self, cid: CallId, phone: PhoneId, method: u64, args: [u64; 2], mode: ForwardMode)
    -> IpcResult;

    /// Answer a `DATA_READ` call by copying `data` to the caller.
    fn data_read_finalize(&self, cid: CallId, data: &[u8]) -> IpcResult;

    /// Answer a `DATA_WRITE` call, accepting `size` bytes of the offered
    /// buffer. Returns the accepted bytes.
    fn data_write_finalize(&self, cid: CallId, size: usize) -> IpcResult<Vec<u8>>;

    /// Answer a `SHARE_IN` call by granting `area` with `flags`.
    fn share_in_finalize(&self, cid: CallId, area: SharedArea, flags: ShareFlags) -> IpcResult;

    /// Answer a `SHARE_OUT` call, accepting the offered area.
    fn share_out_finalize(&self, cid: CallId) -> IpcResult<SharedArea>;

    /// Install an interrupt handler program for interrupt `inr`.
    fn register_irq(&self, inr: u32, devno: u32, code: IrqCode) -> IpcResult;

    /// Make one pending or future `receive` on this task return
    /// [`IpcEvent::TimedOut`] promptly.
    fn poke(&self);
}
