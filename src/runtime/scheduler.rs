//! Seeded randomness and the bounded FIFO of pending mutations.

use rand_chacha::ChaCha20Rng;
use rand_core::{OsRng, RngCore as _, SeedableRng as _};

use std::collections::VecDeque;

/// ChaCha20 seeded from the blake3 digest of `seed`; `None` draws one from the OS.
pub fn seeded_rng(seed: Option<u64>) -> (ChaCha20Rng, u64) {
    let seed = seed.unwrap_or_else(|| OsRng.next_u64());
    let digest = blake3::hash(&seed.to_le_bytes());
    (ChaCha20Rng::from_seed(*digest.as_bytes()), seed)
}

/// Uniform in `[0, 1)`.
pub fn next_unit(rng: &mut ChaCha20Rng) -> f64 {
    (rng.next_u64() >> 11) as f64 / (1u64 << 53) as f64
}

/// Uniform in `0..n`; `n` must be non-zero.
pub fn next_below(rng: &mut ChaCha20Rng, n: usize) -> usize {
    (rng.next_u64() % n as u64) as usize
}

#[derive(Debug, Clone)]
pub struct QueuedMutation<T> {
    pub id: u64,
    pub label: String,
    pub payload: T,
}

/// Mutations waiting for a run, oldest first. Pushes beyond `capacity` are dropped.
#[derive(Debug)]
pub struct MutationQueue<T> {
    queue: VecDeque<QueuedMutation<T>>,
    capacity: Option<usize>,
    next_id: u64,
    dropped: usize,
}

impl<T> MutationQueue<T> {
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            queue: VecDeque::new(),
            capacity,
            next_id: 1,
            dropped: 0,
        }
    }

    /// The bound shrinks as runs are used up.
    pub fn set_capacity(&mut self, capacity: Option<usize>) {
        self.capacity = capacity;
    }

    pub fn has_room(&self) -> bool {
        self.capacity.map_or(true, |c| self.queue.len() < c)
    }

    /// Returns the mutation's id, or `None` if the queue is full.
    pub fn push(&mut self, label: impl Into<String>, payload: T) -> Option<u64> {
        if self.capacity.is_some_and(|c| self.queue.len() >= c) {
            self.dropped += 1;
            return None;
        }
        let id = self.next_id;
        self.next_id = self.next_id.saturating_add(1);
        self.queue.push_back(QueuedMutation {
            id,
            label: label.into(),
            payload,
        });
        Some(id)
    }

    pub fn pop(&mut self) -> Option<QueuedMutation<T>> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn dropped(&self) -> usize {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order_and_capacity() {
        let mut q = MutationQueue::new(Some(2));
        assert_eq!(q.push("a", 1), Some(1));
        assert_eq!(q.push("b", 2), Some(2));
        assert_eq!(q.push("c", 3), None);
        assert_eq!(q.dropped(), 1);
        assert_eq!(q.pop().map(|m| m.label), Some("a".to_string()));
        assert_eq!(q.pop().map(|m| m.payload), Some(2));
        assert!(q.is_empty());
    }

    #[test]
    fn same_seed_same_stream() {
        let (mut a, _) = seeded_rng(Some(7));
        let (mut b, seed) = seeded_rng(Some(7));
        assert_eq!(seed, 7);
        assert_eq!(a.next_u64(), b.next_u64());
        for _ in 0..100 {
            let u = next_unit(&mut a);
            assert!((0.0..1.0).contains(&u));
            assert!(next_below(&mut b, 3) < 3);
        }
    }
}
