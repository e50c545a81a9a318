//! Bulk data and sharing handshakes.
//!
//! Every transfer follows the same three-step shape: the sender starts it
//! with a system-method request, the serving fibril receives the call and
//! checks the method discriminator, and a kernel finalize operation moves
//! the payload across address spaces while answering the call.

use ipc_types::{Call, CallId, IpcError, IpcResult, PhoneId, ShareFlags, SharedArea, Transfer, method};

use crate::runtime::Runtime;

/// A call consumed by a bulk receive that was not the expected handshake
/// step. The caller decides how to answer it.
#[derive(Debug)]
pub struct UnexpectedCall {
    pub cid: CallId,
    pub call: Call,
}

/// Size limits enforced by [`Runtime::data_write_accept`].
#[derive(Debug, Clone, Default)]
pub struct AcceptLimits {
    pub min_size: usize,
    /// No upper bound when `None`.
    pub max_size: Option<usize>,
    /// Received size must be divisible by this when set.
    pub granularity: Option<usize>,
    /// Append one zero byte beyond the received data.
    pub null_terminated: bool,
}

impl Runtime {
    // ── DATA_READ: pull bytes from the peer ──────────────────────────────

    /// Ask the peer to fill `dst`. Returns the number of bytes received.
    pub fn data_read_start(&self, phone: PhoneId, dst: &mut [u8]) -> IpcResult<usize> {
        let aid = self.send_fast(phone, method::DATA_READ, 0, dst.len() as u64, 0, 0);
        let (rc, _reply, transfer) = self.wait_full(aid);
        ipc_types::retval_to_result(rc)?;
        let Transfer::Bytes(bytes) = transfer else {
            return Err(IpcError::BadMemory);
        };
        let n = bytes.len().min(dst.len());
        dst[..n].copy_from_slice(&bytes[..n]);
        Ok(n)
    }

    /// Receive a `DATA_READ` call on the current connection. Returns the
    /// caller's maximum size.
    pub fn data_read_receive(&self) -> Result<(CallId, usize), UnexpectedCall> {
        let (cid, call) = self.get_call();
        if call.method != method::DATA_READ {
            return Err(UnexpectedCall { cid, call });
        }
        Ok((cid, call.args[1] as usize))
    }

    /// Answer a `DATA_READ` call with `data`. May be smaller than the
    /// announced maximum, never larger.
    pub fn data_read_finalize(&self, cid: CallId, data: &[u8]) -> IpcResult {
        self.inner.kernel.data_read_finalize(cid, data)
    }

    /// Relay an incoming read request through `phone`: send a companion
    /// request, forward the read, and wait for the companion's reply.
    pub fn data_read_forward(
        &self,
        phone: PhoneId,
        fmethod: u64,
        a1: u64,
        a2: u64,
        a3: u64,
        a4: u64,
    ) -> IpcResult<Call> {
        let (cid, _size) = match self.data_read_receive() {
            Ok(recv) => recv,
            Err(unexpected) => {
                let _ = self.answer(unexpected.cid, Err(IpcError::InvalidArgs), [0; 5]);
                return Err(IpcError::InvalidArgs);
            }
        };
        self.forward_with_companion(cid, phone, fmethod, a1, a2, a3, a4)
    }

    // ── DATA_WRITE: push bytes to the peer ───────────────────────────────

    /// Push `src` to the peer; returns once the peer accepted (or refused)
    /// the buffer.
    pub fn data_write_start(&self, phone: PhoneId, src: &[u8]) -> IpcResult {
        let call = Call::new(method::DATA_WRITE, [0, src.len() as u64, 0, 0, 0]);
        let aid = self.send_call(phone, call, Transfer::Bytes(src.to_vec()));
        self.wait_for(aid).map(|_| ())
    }

    /// Receive a `DATA_WRITE` call on the current connection. Returns the
    /// offered size.
    pub fn data_write_receive(&self) -> Result<(CallId, usize), UnexpectedCall> {
        let (cid, call) = self.get_call();
        if call.method != method::DATA_WRITE {
            return Err(UnexpectedCall { cid, call });
        }
        Ok((cid, call.args[1] as usize))
    }

    /// Accept `size` bytes of an offered buffer and answer the call.
    pub fn data_write_finalize(&self, cid: CallId, size: usize) -> IpcResult<Vec<u8>> {
        self.inner.kernel.data_write_finalize(cid, size)
    }

    /// Receive a write, enforce `limits`, and accept the buffer. A mismatch
    /// or violated limit answers `EINVAL`. With `null_terminated` the
    /// returned vector carries one zero byte beyond the received data.
    pub fn data_write_accept(&self, limits: &AcceptLimits) -> IpcResult<Vec<u8>> {
        let (cid, size) = match self.data_write_receive() {
            Ok(recv) => recv,
            Err(unexpected) => {
                let _ = self.answer(unexpected.cid, Err(IpcError::InvalidArgs), [0; 5]);
                return Err(IpcError::InvalidArgs);
            }
        };

        let granularity_ok = limits.granularity.is_none_or(|g| g == 0 || size % g == 0);
        let max_ok = limits.max_size.is_none_or(|max| size <= max);
        if size < limits.min_size || !max_ok || !granularity_ok {
            let _ = self.answer(cid, Err(IpcError::InvalidArgs), [0; 5]);
            return Err(IpcError::InvalidArgs);
        }

        let mut data = self.data_write_finalize(cid, size)?;
        if limits.null_terminated {
            data.push(0);
        }
        Ok(data)
    }

    /// Refuse whatever data the peer is about to write, answering `ret`.
    pub fn data_write_void(&self, ret: IpcResult) {
        let cid = match self.data_write_receive() {
            Ok((cid, _)) => cid,
            Err(unexpected) => unexpected.cid,
        };
        let _ = self.answer(cid, ret, [0; 5]);
    }

    /// Relay an incoming write through `phone`, like
    /// [`Runtime::data_read_forward`].
    pub fn data_write_forward(
        &self,
        phone: PhoneId,
        fmethod: u64,
        a1: u64,
        a2: u64,
        a3: u64,
        a4: u64,
    ) -> IpcResult<Call> {
        let (cid, _size) = match self.data_write_receive() {
            Ok(recv) => recv,
            Err(unexpected) => {
                let _ = self.answer(unexpected.cid, Err(IpcError::InvalidArgs), [0; 5]);
                return Err(IpcError::InvalidArgs);
            }
        };
        self.forward_with_companion(cid, phone, fmethod, a1, a2, a3, a4)
    }

    /// Companion-request pattern shared by both forwards: the forwarded
    /// call is answered by the final recipient, the companion reply tells
    /// this fibril the outcome.
    fn forward_with_companion(
        &self,
        cid: CallId,
        phone: PhoneId,
        fmethod: u64,
        a1: u64,
        a2: u64,
        a3: u64,
        a4: u64,
    ) -> IpcResult<Call> {
        let aid = self.send_fast(phone, fmethod, a1, a2, a3, a4);
        match self.inner.kernel.forward(
            cid,
            phone,
            0,
            [0, 0],
            ipc_types::kernel::ForwardMode::ROUTE_FROM_ME,
        ) {
            Ok(()) => self.wait_for(aid),
            Err(e) => {
                let _ = self.wait_for(aid);
                let _ = self.answer(cid, Err(e), [0; 5]);
                Err(e)
            }
        }
    }

    // ── SHARE_IN: request an area from the peer ──────────────────────────

    /// Ask the peer for an area of at least `size` bytes; `arg` is passed
    /// through to the serving side.
    pub fn share_in_start(
        &self,
        phone: PhoneId,
        size: usize,
        arg: u64,
    ) -> IpcResult<(SharedArea, ShareFlags)> {
        let aid = self.send_fast(phone, method::SHARE_IN, 0, size as u64, arg, 0);
        let (rc, _reply, transfer) = self.wait_full(aid);
        ipc_types::retval_to_result(rc)?;
        let Transfer::Area(area, flags) = transfer else {
            return Err(IpcError::BadMemory);
        };
        Ok((area, flags))
    }

    /// Receive a `SHARE_IN` call. Returns the requested size.
    pub fn share_in_receive(&self) -> Result<(CallId, usize), UnexpectedCall> {
        let (cid, call) = self.get_call();
        if call.method != method::SHARE_IN {
            return Err(UnexpectedCall { cid, call });
        }
        Ok((cid, call.args[1] as usize))
    }

    /// Grant `area` to the requesting peer.
    pub fn share_in_finalize(&self, cid: CallId, area: SharedArea, flags: ShareFlags) -> IpcResult {
        self.inner.kernel.share_in_finalize(cid, area, flags)
    }

    // ── SHARE_OUT: offer an area to the peer ─────────────────────────────

    /// Offer `area` to the peer with the given access rights.
    pub fn share_out_start(&self, phone: PhoneId, area: &SharedArea, flags: ShareFlags) -> IpcResult {
        let call =
            Call::new(method::SHARE_OUT, [0, area.len() as u64, flags.bits(), 0, 0]);
        let aid = self.send_call(phone, call, Transfer::Area(area.clone(), flags));
        self.wait_for(aid).map(|_| ())
    }

    /// Receive a `SHARE_OUT` call. Returns the offered size and rights.
    pub fn share_out_receive(&self) -> Result<(CallId, usize, ShareFlags), UnexpectedCall> {
        let (cid, call) = self.get_call();
        if call.method != method::SHARE_OUT {
            return Err(UnexpectedCall { cid, call });
        }
        let flags = ShareFlags::from_bits_truncate(call.args[2]);
        Ok((cid, call.args[1] as usize, flags))
    }

    /// Accept the offered area.
    pub fn share_out_finalize(&self, cid: CallId) -> IpcResult<SharedArea> {
        self.inner.kernel.share_out_finalize(cid)
    }
}
