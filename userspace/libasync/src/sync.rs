//! Mutual exclusion between fibrils of one process.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::fibril::{self, Fid};
use crate::runtime::Runtime;

struct SemInner {
    count: isize,
    waiters: VecDeque<Fid>,
}

/// Counting semaphore that parks fibrils, not threads. `down` on an
/// exhausted count suspends the calling fibril until an `up` readies it;
/// waiters are woken in FIFO order. Initialized to 1 it acts as a lock.
pub struct Semaphore {
    rt: Runtime,
    inner: Mutex<SemInner>,
}

impl Semaphore {
    pub fn new(rt: &Runtime, count: isize) -> Self {
        Self { rt: rt.clone(), inner: Mutex::new(SemInner { count, waiters: VecDeque::new() }) }
    }

    pub fn down(&self) {
        let me = fibril::current_fibril().expect("semaphore down outside fibril context");
        {
            let mut s = self.inner.lock();
            s.count -= 1;
            if s.count >= 0 {
                return;
            }
            s.waiters.push_back(me);
        }
        fibril::switch_to_manager(&self.rt);
    }

    pub fn up(&self) {
        let woken = {
            let mut s = self.inner.lock();
            s.count += 1;
            s.waiters.pop_front()
        };
        if let Some(fid) = woken {
            self.rt.inner.state.lock().fibrils.make_ready(fid);
        }
    }
}
