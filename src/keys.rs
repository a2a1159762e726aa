//! Registration-key source.
//!
//! Registration keys must be unique process-wide. A process-global atomic
//! counter hands out blocks of 256 keys; each `KeySource` then issues keys
//! from its block single-threadedly, drawing a fresh block when the current
//! one is spent.

use std::sync::atomic::{AtomicU64, Ordering};

const KEY_BLOCK: u64 = 256;

/// The global pool starts above the low key range so that ad-hoc fixed keys
/// used by tests never collide with issued ones.
static NEXT_KEY_POOL: AtomicU64 = AtomicU64::new(512);

/// Single-threaded issuer of process-unique 64-bit registration keys.
#[derive(Debug, Default)]
pub struct KeySource {
    next_key: u64,
}

impl KeySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the next key, drawing a new block from the global pool when the
    /// current block is exhausted.
    pub fn next(&mut self) -> u64 {
        if self.next_key % KEY_BLOCK == 0 {
            self.next_key = NEXT_KEY_POOL.fetch_add(KEY_BLOCK, Ordering::Relaxed);
        }

        let key = self.next_key;
        self.next_key += 1;
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    #[test]
    fn test_keys_unique_within_source() {
        let mut src = KeySource::new();
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            assert!(seen.insert(src.next()));
        }
    }

    #[test]
    fn test_keys_unique_across_threads() {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                thread::spawn(|| {
                    let mut src = KeySource::new();
                    (0..5_000).map(|_| src.next()).collect::<Vec<u64>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for h in handles {
            for key in h.join().unwrap() {
                assert!(seen.insert(key), "duplicate key {key}");
            }
        }
    }
}
