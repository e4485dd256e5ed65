//! Request Identifier Allocation
//!
//! Issues strictly increasing identifiers for market data requests. The
//! gateway announces the lowest identifier it will accept through
//! `nextValidId`; until then a configured default is used. The allocator
//! never moves backwards, even if the gateway later announces a lower seed.

use std::sync::atomic::{AtomicI64, Ordering};

use crate::domain::market_data::RequestId;

/// Identifier used before the gateway announces its own seed.
pub const DEFAULT_INITIAL_REQUEST_ID: RequestId = 1;

/// Lock-free, monotonic request identifier allocator.
///
/// # Example
///
/// ```rust
/// use tws_session_bridge::domain::subscription::RequestIdAllocator;
///
/// let allocator = RequestIdAllocator::new(1);
/// assert_eq!(allocator.next(), 1);
///
/// allocator.seed(100);
/// assert_eq!(allocator.next(), 100);
///
/// // A lower seed never rewinds the counter.
/// allocator.seed(5);
/// assert_eq!(allocator.next(), 101);
/// ```
#[derive(Debug)]
pub struct RequestIdAllocator {
    next: AtomicI64,
}

impl Default for RequestIdAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_INITIAL_REQUEST_ID)
    }
}

impl RequestIdAllocator {
    /// Create an allocator whose first identifier is `initial`.
    #[must_use]
    pub const fn new(initial: RequestId) -> Self {
        Self {
            next: AtomicI64::new(initial),
        }
    }

    /// Take the next identifier.
    #[must_use]
    pub fn next(&self) -> RequestId {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    /// Raise the counter so the next identifier is at least `seed`.
    ///
    /// Returns the identifier that the next call to [`Self::next`] will yield.
    pub fn seed(&self, seed: RequestId) -> RequestId {
        let previous = self.next.fetch_max(seed, Ordering::SeqCst);
        previous.max(seed)
    }

    /// Identifier the next call to [`Self::next`] will yield.
    #[must_use]
    pub fn peek(&self) -> RequestId {
        self.next.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    use proptest::prelude::*;

    use super::*;

    #[test]
    fn default_starts_at_one() {
        let allocator = RequestIdAllocator::default();
        assert_eq!(allocator.next(), 1);
        assert_eq!(allocator.next(), 2);
    }

    #[test]
    fn seed_raises_counter() {
        let allocator = RequestIdAllocator::new(1);
        assert_eq!(allocator.seed(5), 5);
        assert_eq!(allocator.next(), 5);
        assert_eq!(allocator.peek(), 6);
    }

    #[test]
    fn lower_seed_keeps_own_maximum() {
        let allocator = RequestIdAllocator::new(1);
        allocator.seed(50);
        let _ = allocator.next();

        assert_eq!(allocator.seed(10), 51);
        assert_eq!(allocator.next(), 51);
    }

    #[test]
    fn concurrent_next_yields_distinct_increasing_values() {
        let allocator = Arc::new(RequestIdAllocator::new(1));
        let mut handles = vec![];

        for _ in 0..16 {
            let a = Arc::clone(&allocator);
            handles.push(thread::spawn(move || {
                (0..250).map(|_| a.next()).collect::<Vec<_>>()
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            let ids = handle.join().unwrap();
            // Each thread observes its own ids in increasing order.
            assert!(ids.windows(2).all(|w| w[0] < w[1]));
            all.extend(ids);
        }

        let distinct: HashSet<_> = all.iter().copied().collect();
        assert_eq!(distinct.len(), 16 * 250);

        all.sort_unstable();
        assert!(all.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(all.first().copied(), Some(1));
        assert_eq!(all.last().copied(), Some(16 * 250));
    }

    proptest! {
        #[test]
        fn seeds_never_rewind(initial in 0i64..1_000, seeds in proptest::collection::vec(0i64..2_000, 1..32)) {
            let allocator = RequestIdAllocator::new(initial);
            let mut last = allocator.next();
            for seed in seeds {
                allocator.seed(seed);
                let id = allocator.next();
                prop_assert!(id > last);
                prop_assert!(id >= seed);
                last = id;
            }
        }
    }
}
