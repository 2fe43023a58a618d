//! Occurrence-based log throttling for per-frame diagnostics.

use std::sync::atomic::{AtomicU64, Ordering};

/// Lets the first occurrence through, then one in every `every`.
#[derive(Debug)]
pub struct LogThrottle {
    every: u64,
    seen: AtomicU64,
}

impl LogThrottle {
    pub fn new(every: u32) -> Self {
        Self {
            every: u64::from(every.max(1)),
            seen: AtomicU64::new(0),
        }
    }

    /// Record an occurrence; returns whether it should be logged.
    pub fn should_log(&self) -> bool {
        self.seen.fetch_add(1, Ordering::Relaxed) % self.every == 0
    }

    /// Occurrences recorded so far.
    pub fn count(&self) -> u64 {
        self.seen.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.seen.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_then_every_nth() {
        let throttle = LogThrottle::new(60);
        let logged: Vec<u64> = (0..181u64).filter(|_| throttle.should_log()).collect();
        assert_eq!(logged.len(), 4);
        assert_eq!(throttle.count(), 181);
    }

    #[test]
    fn zero_means_every_time() {
        let throttle = LogThrottle::new(0);
        assert!((0..5).all(|_| throttle.should_log()));
    }
}
