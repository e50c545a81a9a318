//! Deadline bookkeeping: the sorted timeout queue and the awaiter record
//! that links a suspended fibril to the event that will resume it.

use std::collections::VecDeque;
use std::time::Instant;

use crate::fibril::Fid;

/// Suspension record. `active` is false exactly while the owning fibril is
/// suspended; the waker that flips it back to true is also the one that
/// readies the fibril, so each suspension is woken exactly once.
#[derive(Debug)]
pub(crate) struct Awaiter {
    pub(crate) fid: Fid,
    pub(crate) active: bool,
    pub(crate) occurred: bool,
    pub(crate) in_list: bool,
}

impl Awaiter {
    pub(crate) fn new(fid: Fid) -> Self {
        Self { fid, active: true, occurred: false, in_list: false }
    }
}

/// What an expired deadline should wake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WakeKey {
    /// A connection fibril parked in `get_call`.
    Connection(u64),
    /// A fibril parked in `wait_timeout` on an outbound message.
    Amsg(u64),
    /// A fibril parked in `usleep`.
    Sleeper(Fid),
}

#[derive(Debug)]
struct TimeoutEntry {
    expires: Instant,
    key: WakeKey,
}

/// Deadlines ordered by expiry, ascending; equal deadlines keep insertion
/// order.
pub(crate) struct TimeoutQueue {
    entries: VecDeque<TimeoutEntry>,
}

impl TimeoutQueue {
    pub(crate) fn new() -> Self {
        Self { entries: VecDeque::new() }
    }

    /// Insertion walk from the head, stopping at the first strictly later
    /// deadline.
    pub(crate) fn insert(&mut self, expires: Instant, key: WakeKey) {
        let pos = self
            .entries
            .iter()
            .position(|e| e.expires > expires)
            .unwrap_or(self.entries.len());
        self.entries.insert(pos, TimeoutEntry { expires, key });
    }

    pub(crate) fn remove(&mut self, key: WakeKey) {
        if let Some(pos) = self.entries.iter().position(|e| e.key == key) {
            self.entries.remove(pos);
        }
    }

    /// Earliest pending deadline, if any.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.entries.front().map(|e| e.expires)
    }

    /// Pop the head entry if it has expired at `now`.
    pub(crate) fn pop_expired(&mut self, now: Instant) -> Option<WakeKey> {
        if self.entries.front().is_some_and(|e| e.expires <= now) {
            self.entries.pop_front().map(|e| e.key)
        } else {
            None
        }
    }

    #[cfg(test)]
    fn keys(&self) -> Vec<WakeKey> {
        self.entries.iter().map(|e| e.key).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn orders_by_expiry() {
        let base = Instant::now();
        let mut q = TimeoutQueue::new();
        q.insert(base + Duration::from_millis(30), WakeKey::Amsg(3));
        q.insert(base + Duration::from_millis(10), WakeKey::Amsg(1));
        q.insert(base + Duration::from_millis(20), WakeKey::Amsg(2));
        assert_eq!(q.keys(), vec![WakeKey::Amsg(1), WakeKey::Amsg(2), WakeKey::Amsg(3)]);
        assert_eq!(q.next_deadline(), Some(base + Duration::from_millis(10)));
    }

    #[test]
    fn equal_deadlines_keep_insertion_order() {
        let at = Instant::now() + Duration::from_millis(5);
        let mut q = TimeoutQueue::new();
        q.insert(at, WakeKey::Amsg(1));
        q.insert(at, WakeKey::Amsg(2));
        q.insert(at, WakeKey::Amsg(3));
        assert_eq!(q.keys(), vec![WakeKey::Amsg(1), WakeKey::Amsg(2), WakeKey::Amsg(3)]);
    }

    #[test]
    fn pop_expired_stops_at_future_deadlines() {
        let now = Instant::now();
        let mut q = TimeoutQueue::new();
        q.insert(now - Duration::from_millis(2), WakeKey::Amsg(1));
        q.insert(now - Duration::from_millis(1), WakeKey::Connection(9));
        q.insert(now + Duration::from_secs(60), WakeKey::Amsg(2));
        assert_eq!(q.pop_expired(now), Some(WakeKey::Amsg(1)));
        assert_eq!(q.pop_expired(now), Some(WakeKey::Connection(9)));
        assert_eq!(q.pop_expired(now), None);
        assert_eq!(q.keys(), vec![WakeKey::Amsg(2)]);
    }

    #[test]
    fn remove_by_key() {
        let base = Instant::now();
        let mut q = TimeoutQueue::new();
        q.insert(base + Duration::from_millis(1), WakeKey::Amsg(1));
        q.insert(base + Duration::from_millis(2), WakeKey::Sleeper(Fid(7)));
        q.remove(WakeKey::Amsg(1));
        assert_eq!(q.keys(), vec![WakeKey::Sleeper(Fid(7))]);
        q.remove(WakeKey::Amsg(1));
        assert_eq!(q.keys(), vec![WakeKey::Sleeper(Fid(7))]);
    }
}
