/// Bounded replay cache.
///
/// A ring of fixed-capacity buckets behind one rotating cursor. New nonces
/// go into the cursor bucket; when it is full the cursor advances (wrapping)
/// and the bucket there is replaced, dropping its oldest nonces wholesale.
///
/// Lookups scan from the cursor down to bucket 0, not the whole ring, so
/// right after a wrap the detection window shrinks to the buckets at or
/// below the cursor. A new nonce is never reported as a duplicate.
use parking_lot::Mutex;
use std::collections::HashSet;

use crate::signal::Nonce;

pub struct ReplayCache {
    ring: Mutex<Ring>,
    bucket_size: usize,
}

struct Ring {
    buckets: Vec<HashSet<Nonce>>,
    cursor: usize,
}

impl ReplayCache {
    /// Zero counts are treated as one.
    pub fn new(bucket_count: usize, bucket_size: usize) -> Self {
        let bucket_count = bucket_count.max(1);
        Self {
            ring: Mutex::new(Ring {
                buckets: vec![HashSet::new(); bucket_count],
                cursor: 0,
            }),
            bucket_size: bucket_size.max(1),
        }
    }

    /// Record `id`. Returns `true` if it was new, `false` for a duplicate.
    pub fn put_if_absent(&self, id: &Nonce) -> bool {
        let mut ring = self.ring.lock();
        let cursor = ring.cursor;
        if ring.buckets[..=cursor].iter().any(|bucket| bucket.contains(id)) {
            return false;
        }

        if ring.buckets[cursor].len() >= self.bucket_size {
            let next = (cursor + 1) % ring.buckets.len();
            ring.buckets[next] = HashSet::new();
            ring.cursor = next;
        }
        let at = ring.cursor;
        ring.buckets[at].insert(*id);
        true
    }

    pub fn cursor(&self) -> usize {
        self.ring.lock().cursor
    }

    /// Entries in bucket `index`, or 0 if out of range.
    pub fn bucket_len(&self, index: usize) -> usize {
        self.ring
            .lock()
            .buckets
            .get(index)
            .map_or(0, HashSet::len)
    }

    pub fn bucket_count(&self) -> usize {
        self.ring.lock().buckets.len()
    }

    pub fn bucket_size(&self) -> usize {
        self.bucket_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u32) -> Nonce {
        let mut out = [0u8; 16];
        out[..4].copy_from_slice(&n.to_le_bytes());
        out
    }

    #[test]
    fn first_put_is_new_second_is_duplicate() {
        let cache = ReplayCache::new(4, 8);
        assert!(cache.put_if_absent(&id(1)));
        assert!(!cache.put_if_absent(&id(1)));
    }

    #[test]
    fn overflowing_a_bucket_advances_cursor_once() {
        let cache = ReplayCache::new(4, 8);
        for n in 0..8 {
            assert!(cache.put_if_absent(&id(n)));
        }
        assert_eq!(cache.cursor(), 0);
        assert_eq!(cache.bucket_len(0), 8);

        assert!(cache.put_if_absent(&id(8)));
        assert_eq!(cache.cursor(), 1);
        assert_eq!(cache.bucket_len(1), 1);
        assert_eq!(cache.bucket_len(0), 8);
    }

    #[test]
    fn duplicates_do_not_mutate() {
        let cache = ReplayCache::new(2, 2);
        cache.put_if_absent(&id(1));
        cache.put_if_absent(&id(2));
        assert!(!cache.put_if_absent(&id(2)));
        assert_eq!(cache.cursor(), 0);
        assert_eq!(cache.bucket_len(0), 2);
    }

    #[test]
    fn wrap_replaces_oldest_bucket() {
        let cache = ReplayCache::new(2, 2);
        for n in 0..4 {
            cache.put_if_absent(&id(n));
        }
        assert_eq!(cache.cursor(), 1);

        // Bucket 0 held ids 0 and 1; wrapping clears it for id 4.
        assert!(cache.put_if_absent(&id(4)));
        assert_eq!(cache.cursor(), 0);
        assert_eq!(cache.bucket_len(0), 1);
        assert!(cache.put_if_absent(&id(0)));
    }

    #[test]
    fn scan_skips_buckets_above_cursor() {
        let cache = ReplayCache::new(3, 1);
        cache.put_if_absent(&id(10)); // bucket 0
        cache.put_if_absent(&id(11)); // bucket 1
        cache.put_if_absent(&id(12)); // bucket 2
        cache.put_if_absent(&id(13)); // wraps to bucket 0
        assert_eq!(cache.cursor(), 0);
        // id 11 still sits in bucket 1 but is outside the window.
        assert!(cache.put_if_absent(&id(11)));
    }

    #[test]
    fn zero_sizes_are_clamped() {
        let cache = ReplayCache::new(0, 0);
        assert_eq!(cache.bucket_count(), 1);
        assert_eq!(cache.bucket_size(), 1);
        assert!(cache.put_if_absent(&id(1)));
        assert!(!cache.put_if_absent(&id(1)));
    }

    #[test]
    fn concurrent_callers_agree_on_one_winner() {
        use std::sync::Arc;
        let cache = Arc::new(ReplayCache::new(10, 100));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                std::thread::spawn(move || (0..50).filter(|n| cache.put_if_absent(&id(*n))).count())
            })
            .collect();
        let wins: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(wins, 50);
    }
}
