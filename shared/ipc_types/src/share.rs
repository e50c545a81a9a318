//! Shared memory areas passed across tasks by the sharing handshakes.

use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::RwLock;

bitflags! {
    /// Access rights negotiated by the sharing handshakes. Bits can only be
    /// cleared by the granting side, never added.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ShareFlags: u64 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

/// A byte area visible to every task holding a handle to it.
///
/// Stands in for a kernel-backed address space area: cloning the handle is
/// the sharing operation, the bytes themselves live once.
#[derive(Clone)]
pub struct SharedArea {
    bytes: Arc<RwLock<Vec<u8>>>,
}

impl SharedArea {
    pub fn new(size: usize) -> Self {
        Self { bytes: Arc::new(RwLock::new(vec![0; size])) }
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self { bytes: Arc::new(RwLock::new(bytes.to_vec())) }
    }

    pub fn len(&self) -> usize {
        self.bytes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.read().is_empty()
    }

    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.bytes.read())
    }

    pub fn with_bytes_mut<R>(&self, f: impl FnOnce(&mut Vec<u8>) -> R) -> R {
        f(&mut self.bytes.write())
    }
}

impl fmt::Debug for SharedArea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedArea").field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_alias_the_same_bytes() {
        let a = SharedArea::new(4);
        let b = a.clone();
        a.with_bytes_mut(|v| v[0] = 0xAB);
        assert_eq!(b.with_bytes(|v| v[0]), 0xAB);
    }
}
