//! Bounded Event Buffer
//!
//! Fixed-capacity FIFO ring shared by the price history and the log history.
//! When full, the oldest entry is evicted to make room for the newest.
//!
//! The buffer is internally synchronized: the read loop pushes while
//! observers take snapshots concurrently. Snapshots are copies, so a
//! published window can never be changed by a later push.

use std::collections::VecDeque;

use parking_lot::Mutex;

/// Default capacity of the price tick history.
pub const DEFAULT_PRICE_CAPACITY: usize = 500;

/// Default capacity of the log history.
pub const DEFAULT_LOG_CAPACITY: usize = 100;

/// Fixed-capacity, drop-oldest FIFO buffer.
///
/// # Example
///
/// ```rust
/// use tws_session_bridge::domain::buffer::BoundedEventBuffer;
///
/// let buffer = BoundedEventBuffer::new(2);
/// buffer.push(1);
/// buffer.push(2);
/// buffer.push(3);
///
/// assert_eq!(buffer.snapshot(), vec![2, 3]);
/// ```
#[derive(Debug)]
pub struct BoundedEventBuffer<T> {
    capacity: usize,
    items: Mutex<VecDeque<T>>,
}

impl<T: Clone> BoundedEventBuffer<T> {
    /// Create a buffer holding at most `capacity` items.
    ///
    /// A zero capacity is raised to one so the latest item is always kept.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            items: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Append an item, evicting the oldest one if the buffer is full.
    ///
    /// Returns the evicted item, if any.
    pub fn push(&self, item: T) -> Option<T> {
        let mut items = self.items.lock();
        let evicted = if items.len() == self.capacity {
            items.pop_front()
        } else {
            None
        };
        items.push_back(item);
        evicted
    }

    /// Copy of all items, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<T> {
        self.items.lock().iter().cloned().collect()
    }

    /// Copy of the `n` most recent items, oldest first.
    #[must_use]
    pub fn tail(&self, n: usize) -> Vec<T> {
        let items = self.items.lock();
        let skip = items.len().saturating_sub(n);
        items.iter().skip(skip).cloned().collect()
    }

    /// Most recent item.
    #[must_use]
    pub fn latest(&self) -> Option<T> {
        self.items.lock().back().cloned()
    }

    /// Remove every item.
    pub fn clear(&self) {
        self.items.lock().clear();
    }

    /// Number of buffered items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Whether the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Maximum number of items retained.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}

// =============================================================================
// Tests
// =============================================================================
