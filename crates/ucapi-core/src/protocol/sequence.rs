//! Thread-safe counter for numbering engine-originated frames.
//!
//! Every connection numbers the frames the engine queues for it.  The numbers
//! show up in debug logs so a dropped or reordered frame can be spotted when
//! comparing engine and controller traces.

use std::sync::atomic::{AtomicU64, Ordering};

/// A lock-free, monotonically increasing counter.
///
/// Starts at 0 and wraps at `u64::MAX` without panicking.
///
/// ```rust
/// use ucapi_core::protocol::SequenceCounter;
///
/// let counter = SequenceCounter::new();
/// assert_eq!(counter.next(), 0);
/// assert_eq!(counter.next(), 1);
/// ```
#[derive(Debug)]
pub struct SequenceCounter {
    inner: AtomicU64,
}

impl SequenceCounter {
    pub fn new() -> Self {
        Self {
            inner: AtomicU64::new(0),
        }
    }

    /// Returns the next number and advances the counter.
    ///
    /// `Relaxed` is enough: the value orders log lines, it does not publish
    /// any other memory.
    pub fn next(&self) -> u64 {
        self.inner.fetch_add(1, Ordering::Relaxed)
    }

    /// Number of values handed out so far.
    pub fn current(&self) -> u64 {
        self.inner.load(Ordering::Relaxed)
    }
}

impl Default for SequenceCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_sequence_counter_starts_at_zero() {
        let counter = SequenceCounter::new();
        assert_eq!(counter.next(), 0);
    }

    #[test]
    fn test_sequence_counter_wraps_at_u64_max() {
        // Arrange – start one step before overflow
        let counter = SequenceCounter {
            inner: AtomicU64::new(u64::MAX),
        };

        // Act
        let before_wrap = counter.next();
        let after_wrap = counter.next();

        // Assert
        assert_eq!(before_wrap, u64::MAX);
        assert_eq!(after_wrap, 0);
    }

    #[test]
    fn test_sequence_counter_hands_out_unique_values_across_threads() {
        // Arrange
        let counter = Arc::new(SequenceCounter::new());

        // Act
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let c = Arc::clone(&counter);
                thread::spawn(move || (0..500).map(|_| c.next()).collect::<Vec<_>>())
            })
            .collect();
        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().expect("thread panicked"))
            .collect();

        // Assert
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 2000);
        assert_eq!(counter.current(), 2000);
    }
}
