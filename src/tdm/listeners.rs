use std::sync::atomic::{AtomicUsize, Ordering};

/// Most listeners one endpoint tracks; further registrations are dropped.
pub const MAX_LISTENERS: usize = 16;

/// Saturating reference count of listeners interested in an endpoint.
///
/// Never blocks; the lifecycle tick only looks at whether the count is zero.
#[derive(Debug)]
pub struct ListenerCount {
    active: AtomicUsize,
    max: usize,
}

impl ListenerCount {
    pub const fn new(max: usize) -> Self {
        Self {
            active: AtomicUsize::new(0),
            max,
        }
    }

    /// Register one listener. Returns `false` when already at capacity.
    pub fn acquire(&self) -> bool {
        let max = self.max;
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .is_ok()
    }

    /// Deregister one listener. Returns `false` when none were registered.
    pub fn release(&self) -> bool {
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn is_idle(&self) -> bool {
        self.active() == 0
    }

    pub fn max(&self) -> usize {
        self.max
    }
}

impl Default for ListenerCount {
    fn default() -> Self {
        Self::new(MAX_LISTENERS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn saturates_at_max() {
        let count = ListenerCount::default();
        for _ in 0..MAX_LISTENERS {
            assert!(count.acquire());
        }
        assert!(!count.acquire());
        assert_eq!(count.active(), MAX_LISTENERS);
    }

    #[test]
    fn never_goes_negative() {
        let count = ListenerCount::new(4);
        assert!(!count.release());
        assert!(count.is_idle());
        count.acquire();
        assert!(count.release());
        assert!(!count.release());
        assert_eq!(count.active(), 0);
    }

    #[test]
    fn stays_in_bounds_under_contention() {
        let count = Arc::new(ListenerCount::default());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let count = count.clone();
                thread::spawn(move || {
                    for i in 0..1000 {
                        if (i + t) % 3 == 0 {
                            count.release();
                        } else {
                            count.acquire();
                        }
                        let n = count.active();
                        assert!(n <= MAX_LISTENERS);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(count.active() <= MAX_LISTENERS);
    }
}
