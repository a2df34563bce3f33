use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// A deadline-ordered expiration queue.
///
/// Entries carry an arbitrary payload and become visible to `get_expired`
/// once their deadline has passed. The queue never runs payloads itself;
/// the wait loop drains them in bounded batches and decides what each one
/// means. Insertion order breaks ties between equal deadlines.
pub(crate) struct TimerQueue<T> {
    inner: Mutex<Inner<T>>,
}

struct Inner<T> {
    entries: BTreeMap<Key, T>,
    next_id: u64,
}

/// Handle naming one armed entry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct Key {
    when: Instant,
    id: u64,
}

impl<T> TimerQueue<T> {
    pub fn new() -> TimerQueue<T> {
        TimerQueue {
            inner: Mutex::new(Inner {
                entries: BTreeMap::new(),
                next_id: 0,
            }),
        }
    }

    /// Arms `value` to expire at `deadline`.
    pub fn expire_at(&self, deadline: Instant, value: T) -> Key {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;

        let key = Key { when: deadline, id };
        inner.entries.insert(key.clone(), value);
        key
    }

    /// Arms `value` to expire `delay` from now.
    pub fn expire_in(&self, delay: Duration, value: T) -> Key {
        self.expire_at(Instant::now() + delay, value)
    }

    /// Pops up to `limit` already-expired payloads into `out`, oldest
    /// deadline first. Returns how many were popped.
    pub fn get_expired(&self, out: &mut Vec<T>, limit: usize) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let mut popped = 0;

        while popped < limit {
            let key = match inner.entries.keys().next() {
                Some(key) if key.when <= now => key.clone(),
                _ => break,
            };

            let value = inner
                .entries
                .remove(&key)
                .expect("head entry vanished under the lock");
            out.push(value);
            popped += 1;
        }

        popped
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }
}

impl<T> fmt::Debug for TimerQueue<T> {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("TimerQueue").finish()
    }
}
