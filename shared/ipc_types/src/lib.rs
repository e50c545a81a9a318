//! IPC ABI shared between the kernel side and userspace.
//!
//! Everything that crosses the kernel boundary is described here: call
//! records, call identifiers and their tag bits, method numbers, error
//! codes, shared memory areas and the [`KernelIpc`] facade itself.

use bitflags::bitflags;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;

pub mod kernel;
pub mod share;

pub use kernel::{IpcEvent, IrqCode, KernelIpc, Transfer};
pub use share::{ShareFlags, SharedArea};

/// Handle of one end of a connection, as seen from the owning task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PhoneId(pub u64);

/// Kernel-assigned identifier of one in-flight call instance.
///
/// The upper bits carry [`CallFlags`]; the rest is an opaque index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallId(u64);

bitflags! {
    /// Tag bits carried inside a [`CallId`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CallFlags: u64 {
        /// The identifier names a reply to an earlier outbound call.
        const ANSWERED = 1 << 63;
        /// The identifier names a kernel notification (no answer expected).
        const NOTIFICATION = 1 << 62;
    }
}

impl CallId {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Identifier with the tag bits stripped.
    pub fn index(self) -> u64 {
        self.0 & !CallFlags::all().bits()
    }

    pub fn is_answered(self) -> bool {
        self.0 & CallFlags::ANSWERED.bits() != 0
    }

    pub fn is_notification(self) -> bool {
        self.0 & CallFlags::NOTIFICATION.bits() != 0
    }
}

/// One IPC call record: a method and up to five payload words.
///
/// `in_phone_hash` is attached by the kernel on delivery and identifies the
/// connection the call arrived on; senders leave it zero.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Call {
    pub method: u64,
    pub args: [u64; 5],
    pub in_phone_hash: u64,
}

impl Call {
    pub const fn new(method: u64, args: [u64; 5]) -> Self {
        Self { method, args, in_phone_hash: 0 }
    }
}

/// System method numbers recognized by the dispatcher.
pub mod method {
    /// Open a connection; the kernel rewrites ARG5 to the new phone hash.
    pub const CONNECT_ME: u64 = 1;
    /// Open a connection to a named destination; ARG5 as above.
    pub const CONNECT_ME_TO: u64 = 2;
    /// Close a connection.
    pub const PHONE_HUNGUP: u64 = 3;
    /// Offer an address space area to the recipient.
    pub const SHARE_OUT: u64 = 4;
    /// Request an address space area from the recipient.
    pub const SHARE_IN: u64 = 5;
    /// Push a byte buffer to the recipient.
    pub const DATA_WRITE: u64 = 6;
    /// Pull a byte buffer from the recipient.
    pub const DATA_READ: u64 = 7;
    /// Kernel interrupt notification.
    pub const INTERRUPT: u64 = 8;
    /// First method number available to applications.
    pub const FIRST_USER: u64 = 1024;
}

/// ARG4 flag on `CONNECT_ME_TO` asking the kernel to wait for the
/// destination to appear.
pub const CONNECT_BLOCKING: u64 = 1;

/// Successful return value on the wire.
pub const RC_OK: u64 = 0;

/// Error codes surfaced at the IPC boundary.
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error, IntoPrimitive, TryFromPrimitive)]
pub enum IpcError {
    #[error("out of memory")]
    NoMemory = 1,
    #[error("no such entry")]
    NotFound = 2,
    #[error("invalid argument")]
    InvalidArgs = 3,
    #[error("connection hung up")]
    Hungup = 4,
    #[error("limit exceeded")]
    LimitExceeded = 5,
    #[error("timed out")]
    TimedOut = 6,
    #[error("forwarding rejected")]
    ForwardRejected = 7,
    #[error("bad memory area")]
    BadMemory = 8,
}

pub type IpcResult<T = ()> = Result<T, IpcError>;

/// Decode a wire return value. Unknown nonzero codes collapse to
/// [`IpcError::InvalidArgs`].
pub fn retval_to_result(raw: u64) -> IpcResult {
    if raw == RC_OK {
        Ok(())
    } else {
        Err(IpcError::try_from(raw).unwrap_or(IpcError::InvalidArgs))
    }
}

/// Encode a result as a wire return value.
pub fn result_to_retval(res: IpcResult) -> u64 {
    match res {
        Ok(()) => RC_OK,
        Err(e) => e.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callid_tag_bits() {
        let plain = CallId::from_raw(17);
        assert!(!plain.is_answered());
        assert!(!plain.is_notification());
        assert_eq!(plain.index(), 17);

        let notif = CallId::from_raw(17 | CallFlags::NOTIFICATION.bits());
        assert!(notif.is_notification());
        assert!(!notif.is_answered());
        assert_eq!(notif.index(), 17);

        let answered = CallId::from_raw(17 | CallFlags::ANSWERED.bits());
        assert!(answered.is_answered());
        assert_eq!(answered.index(), 17);
    }

    #[test]
    fn retval_round_trip() {
        assert_eq!(retval_to_result(RC_OK), Ok(()));
        assert_eq!(retval_to_result(4), Err(IpcError::Hungup));
        assert_eq!(retval_to_result(999), Err(IpcError::InvalidArgs));
        assert_eq!(result_to_retval(Ok(())), RC_OK);
        assert_eq!(result_to_retval(Err(IpcError::TimedOut)), 6);
    }
}
