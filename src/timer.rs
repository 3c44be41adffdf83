//! Indexed binary min-heap of connection deadlines.
//!
//! Entries are ordered by `(expires, id)`. An id -> heap-index map makes `adjust` and
//! `remove` O(log n) for any entry, not just the root. The structure is not thread-safe
//! and lives on the dispatch thread.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

pub type TimeoutCallback = Box<dyn FnOnce() + Send>;

/// Shortest non-zero wait handed back by `next_tick`; keeps the reactor out of a
/// tight poll loop when the next deadline is a fraction of a millisecond away.
const MIN_TICK: Duration = Duration::from_millis(1);

struct TimerNode<Id> {
    id: Id,
    expires: Instant,
    callback: TimeoutCallback,
}

pub struct TimerWheel<Id> {
    heap: Vec<TimerNode<Id>>,
    index: HashMap<Id, usize>,
}

impl<Id> Default for TimerWheel<Id>
where
    Id: Copy + Eq + Hash + Ord,
{
    fn default() -> Self {
        Self::with_capacity(64)
    }
}

impl<Id> TimerWheel<Id>
where
    Id: Copy + Eq + Hash + Ord,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            heap: Vec::with_capacity(capacity),
            index: HashMap::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn contains(&self, id: Id) -> bool {
        self.index.contains_key(&id)
    }

    pub fn expires_at(&self, id: Id) -> Option<Instant> {
        self.index.get(&id).map(|&i| self.heap[i].expires)
    }

    pub fn add(&mut self, id: Id, timeout: Duration, callback: TimeoutCallback) {
        self.add_at(id, Instant::now() + timeout, callback);
    }

    /// Schedule `id` at `expires`. An id that is already scheduled is moved to the new
    /// deadline and its callback replaced.
    pub fn add_at(&mut self, id: Id, expires: Instant, callback: TimeoutCallback) {
        if let Some(&i) = self.index.get(&id) {
            self.heap[i].callback = callback;
            self.reschedule(i, expires);
            return;
        }
        self.heap.push(TimerNode {
            id,
            expires,
            callback,
        });
        let last = self.heap.len() - 1;
        self.index.insert(id, last);
        self.sift_up(last);
    }

    /// Push `id`'s deadline to `timeout` from now. Returns false if `id` is not scheduled.
    pub fn adjust(&mut self, id: Id, timeout: Duration) -> bool {
        self.adjust_at(id, Instant::now() + timeout)
    }

    pub fn adjust_at(&mut self, id: Id, expires: Instant) -> bool {
        match self.index.get(&id) {
            Some(&i) => {
                self.reschedule(i, expires);
                true
            }
            None => false,
        }
    }

    /// Drop `id` without firing it.
    pub fn remove(&mut self, id: Id) -> bool {
        match self.index.get(&id) {
            Some(&i) => {
                self.delete(i);
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.index.clear();
    }

    /// Fire and evict everything due, then report how long until the next deadline.
    /// `None` means nothing is scheduled and the caller may wait indefinitely.
    pub fn next_tick(&mut self) -> Option<Duration> {
        self.next_tick_at(Instant::now())
    }

    pub fn next_tick_at(&mut self, now: Instant) -> Option<Duration> {
        self.tick_at(now);
        let root = self.heap.first()?;
        let wait = root.expires.saturating_duration_since(now);
        if wait.is_zero() {
            Some(Duration::ZERO)
        } else {
            Some(wait.max(MIN_TICK))
        }
    }

    /// Fire every entry whose deadline is at or before `now`. Returns how many fired.
    pub fn tick_at(&mut self, now: Instant) -> usize {
        let mut fired = 0;
        while self.heap.first().is_some_and(|root| root.expires <= now) {
            let node = self.delete(0);
            (node.callback)();
            fired += 1;
        }
        fired
    }

    fn reschedule(&mut self, i: usize, expires: Instant) {
        self.heap[i].expires = expires;
        if !self.sift_down(i) {
            self.sift_up(i);
        }
    }

    fn delete(&mut self, i: usize) -> TimerNode<Id> {
        let last = self.heap.len() - 1;
        self.swap(i, last);
        let node = self.heap.pop().expect("heap is non-empty");
        self.index.remove(&node.id);
        if i < self.heap.len() && !self.sift_down(i) {
            self.sift_up(i);
        }
        node
    }

    fn less(&self, a: usize, b: usize) -> bool {
        let (a, b) = (&self.heap[a], &self.heap[b]);
        (a.expires, a.id) < (b.expires, b.id)
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if !self.less(i, parent) {
                break;
            }
            self.swap(i, parent);
            i = parent;
        }
    }

    /// Returns true if the node moved.
    fn sift_down(&mut self, start: usize) -> bool {
        let n = self.heap.len();
        let mut i = start;
        loop {
            let left = 2 * i + 1;
            if left >= n {
                break;
            }
            let right = left + 1;
            let child = if right < n && self.less(right, left) {
                right
            } else {
                left
            };
            if !self.less(child, i) {
                break;
            }
            self.swap(i, child);
            i = child;
        }
        i > start
    }

    fn swap(&mut self, i: usize, j: usize) {
        if i == j {
            return;
        }
        self.heap.swap(i, j);
        self.index.insert(self.heap[i].id, i);
        self.index.insert(self.heap[j].id, j);
    }

    #[cfg(test)]
    fn assert_invariants(&self) {
        assert_eq!(self.heap.len(), self.index.len());
        for (i, node) in self.heap.iter().enumerate() {
            assert_eq!(self.index[&node.id], i);
            if i > 0 {
                assert!(!self.less(i, (i - 1) / 2), "heap order broken at {i}");
            }
        }
    }
}
