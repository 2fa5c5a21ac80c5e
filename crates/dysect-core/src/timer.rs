//! Monotonic wait timers.
//!
//! A min-heap of deadlines polled at the select boundary. No signal
//! handlers: the engine loop asks for [`WaitTimer::next_deadline`],
//! bounds its blocking wait with it, and drains expired keys on wake-up.
//!
//! Timestamps are caller-supplied milliseconds from any monotonic
//! origin, which keeps quorum behavior deterministic under test.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};

/// Min-heap timer over ordered keys.
///
/// Re-starting a key replaces its deadline; stale heap entries are
/// dropped lazily.
#[derive(Debug, Clone)]
pub struct WaitTimer<K: Ord + Clone> {
    heap: BinaryHeap<Reverse<(u64, u64, K)>>,
    active: BTreeMap<K, (u64, u64)>,
    seq: u64,
}

impl<K: Ord + Clone> Default for WaitTimer<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord + Clone> WaitTimer<K> {
    /// Empty timer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            active: BTreeMap::new(),
            seq: 0,
        }
    }

    /// Arm (or re-arm) a key at an absolute deadline.
    pub fn start(&mut self, key: K, deadline_ms: u64) {
        self.seq += 1;
        self.active.insert(key.clone(), (deadline_ms, self.seq));
        self.heap.push(Reverse((deadline_ms, self.seq, key)));
    }

    /// Disarm a key. No-op when not armed.
    pub fn clear(&mut self, key: &K) {
        self.active.remove(key);
    }

    /// True while the key is armed.
    #[must_use]
    pub fn running(&self, key: &K) -> bool {
        self.active.contains_key(key)
    }

    /// Armed deadline for a key.
    #[must_use]
    pub fn deadline(&self, key: &K) -> Option<u64> {
        self.active.get(key).map(|&(deadline, _)| deadline)
    }

    /// Number of armed keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.active.len()
    }

    /// True when nothing is armed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    fn top_is_stale(&self) -> bool {
        match self.heap.peek() {
            Some(Reverse((deadline, seq, key))) => {
                self.active.get(key) != Some(&(*deadline, *seq))
            }
            None => false,
        }
    }

    fn drop_stale(&mut self) {
        while self.top_is_stale() {
            self.heap.pop();
        }
    }

    /// Earliest armed deadline; bounds the engine loop's blocking wait.
    pub fn next_deadline(&mut self) -> Option<u64> {
        self.drop_stale();
        self.heap.peek().map(|Reverse((deadline, _, _))| *deadline)
    }

    /// Pop every key whose deadline has passed, in deadline order.
    pub fn drain_expired(&mut self, now_ms: u64) -> Vec<K> {
        let mut expired = Vec::new();
        loop {
            self.drop_stale();
            match self.heap.peek() {
                Some(Reverse((deadline, _, _))) if *deadline <= now_ms => {
                    let Reverse((_, _, key)) = self.heap.pop().expect("peeked entry");
                    self.active.remove(&key);
                    expired.push(key);
                }
                _ => break,
            }
        }
        expired
    }

    /// Disarm everything (session drain).
    pub fn drain_all(&mut self) -> Vec<K> {
        self.heap.clear();
        let keys: Vec<K> = self.active.keys().cloned().collect();
        self.active.clear();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_in_deadline_order() {
        let mut timer = WaitTimer::new();
        timer.start("b", 200);
        timer.start("a", 100);
        timer.start("c", 300);
        assert_eq!(timer.next_deadline(), Some(100));
        assert_eq!(timer.drain_expired(250), vec!["a", "b"]);
        assert_eq!(timer.len(), 1);
        assert_eq!(timer.drain_expired(250), Vec::<&str>::new());
    }

    #[test]
    fn restart_replaces_deadline() {
        let mut timer = WaitTimer::new();
        timer.start("p", 100);
        timer.start("p", 500);
        assert!(timer.drain_expired(200).is_empty(), "stale entry fired");
        assert_eq!(timer.deadline(&"p"), Some(500));
        assert_eq!(timer.drain_expired(500), vec!["p"]);
    }

    #[test]
    fn clear_disarms() {
        let mut timer = WaitTimer::new();
        timer.start("p", 100);
        timer.clear(&"p");
        assert!(!timer.running(&"p"));
        assert!(timer.drain_expired(1000).is_empty());
        assert_eq!(timer.next_deadline(), None);
    }

    #[test]
    fn drain_all_disarms_everything() {
        let mut timer = WaitTimer::new();
        timer.start(1u32, 10);
        timer.start(2u32, 20);
        let mut keys = timer.drain_all();
        keys.sort_unstable();
        assert_eq!(keys, vec![1, 2]);
        assert!(timer.is_empty());
    }
}
