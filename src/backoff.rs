//! Spin backoff and predicate polling.
//!
//! Every retry loop in this crate spins through a [`SpinBackoff`] before it
//! considers blocking. The backoff busy-spins a capped, exponentially
//! growing number of iterations, and periodically yields the processor so
//! that single-core machines and oversubscribed hosts still make progress.

use std::hint;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Every N-th spin yields the processor instead of busy-spinning.
const YIELD_EVERY: u32 = 10;

/// Cap on the exponential busy-spin growth (2^6 spin hints per iteration).
const MAX_SPIN_SHIFT: u32 = 6;

/// Cached logical CPU count; zero means "not sampled yet".
static LOGICAL_CPUS: AtomicUsize = AtomicUsize::new(0);

fn logical_cpus() -> usize {
    match LOGICAL_CPUS.load(Ordering::Relaxed) {
        0 => {
            let count = num_cpus::get().max(1);
            LOGICAL_CPUS.store(count, Ordering::Relaxed);
            count
        }
        count => count,
    }
}

/// Count-based exponential spin backoff.
///
/// Each call to [`spin_once`](Self::spin_once) either busy-waits a short,
/// monotonically growing number of CPU spin hints, or yields the processor.
/// Yielding is chosen on single-core machines (busy-spinning there only
/// steals time from the thread that would make the condition true) and on
/// every tenth iteration otherwise.
///
/// The backoff holds no shared state; callers keep one per spin session and
/// [`reset`](Self::reset) it after a successful acquisition.
#[derive(Debug, Default)]
pub struct SpinBackoff {
    /// Iterations performed since creation or the last reset.
    count: u32,
}

impl SpinBackoff {
    /// Create a fresh backoff with a zero iteration count.
    pub fn new() -> Self {
        Self { count: 0 }
    }

    /// Number of iterations performed so far.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Whether the next [`spin_once`](Self::spin_once) will yield the
    /// processor rather than busy-spin.
    pub fn next_spin_will_yield(&self) -> bool {
        logical_cpus() == 1 || (self.count + 1) % YIELD_EVERY == 0
    }

    /// Perform a single backoff iteration.
    pub fn spin_once(&mut self) {
        if self.next_spin_will_yield() {
            thread::yield_now();
        } else {
            let spins = 1u32 << self.count.min(MAX_SPIN_SHIFT);
            for _ in 0..spins {
                hint::spin_loop();
            }
        }
        self.count = self.count.wrapping_add(1);
    }

    /// Reset the iteration count after a successful acquisition.
    pub fn reset(&mut self) {
        self.count = 0;
    }

    /// Spin until `condition` returns true or `timeout` elapses.
    ///
    /// A `timeout` of `None` polls indefinitely. Returns `false` only on
    /// timeout; the condition is always checked once before any backoff.
    pub fn spin_until<F>(mut condition: F, timeout: Option<Duration>) -> bool
    where
        F: FnMut() -> bool,
    {
        if condition() {
            return true;
        }

        let deadline = Deadline::start(timeout);
        let mut backoff = SpinBackoff::new();

        loop {
            if deadline.is_expired() {
                return false;
            }
            backoff.spin_once();
            if condition() {
                return true;
            }
        }
    }

    /// Spin until `word` no longer holds `value`, or until `timeout`
    /// elapses.
    ///
    /// Used to sit out transitional states another thread is about to
    /// resolve, such as a wait handle that is mid-creation.
    pub fn spin_until_ne(word: &AtomicU32, value: u32, timeout: Option<Duration>) -> bool {
        Self::spin_until(|| word.load(Ordering::Acquire) != value, timeout)
    }
}

/// Remaining-budget tracker for blocking operations.
///
/// Captures the deadline once at the start of an operation so that retry
/// loops can hand ever-shrinking budgets to nested waits. `None` means the
/// operation has no deadline.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    /// Begin tracking; `None` never expires.
    pub(crate) fn start(timeout: Option<Duration>) -> Self {
        Self {
            at: timeout.map(|timeout| Instant::now() + timeout),
        }
    }

    /// Whether the deadline has passed.
    pub(crate) fn is_expired(&self) -> bool {
        match self.at {
            Some(at) => Instant::now() >= at,
            None => false,
        }
    }

    /// Budget left before the deadline; `None` means unbounded. An expired
    /// deadline reports a zero budget.
    pub(crate) fn remaining(&self) -> Option<Duration> {
        self.at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    #[test]
    fn test_spin_once_advances_count() {
        let mut backoff = SpinBackoff::new();
        assert_eq!(backoff.count(), 0);

        for expected in 1..=25 {
            backoff.spin_once();
            assert_eq!(backoff.count(), expected);
        }

        backoff.reset();
        assert_eq!(backoff.count(), 0);
    }

    #[test]
    fn test_spin_until_immediate() {
        // An already-true condition never spins.
        assert!(SpinBackoff::spin_until(|| true, Some(Duration::ZERO)));
    }

    #[test]
    fn test_spin_until_timeout() {
        let start = Instant::now();
        let result = SpinBackoff::spin_until(|| false, Some(Duration::from_millis(20)));
        assert!(!result);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_spin_until_observes_other_thread() {
        let flag = Arc::new(AtomicBool::new(false));
        let flag_clone = Arc::clone(&flag);

        let setter = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            flag_clone.store(true, Ordering::Release);
        });

        let result = SpinBackoff::spin_until(
            || flag.load(Ordering::Acquire),
            Some(Duration::from_secs(5)),
        );
        assert!(result);

        setter.join().unwrap();
    }

    #[test]
    fn test_spin_until_ne() {
        let word = AtomicU32::new(7);
        assert!(!SpinBackoff::spin_until_ne(
            &word,
            7,
            Some(Duration::from_millis(10))
        ));
        word.store(8, Ordering::Release);
        assert!(SpinBackoff::spin_until_ne(
            &word,
            7,
            Some(Duration::from_millis(10))
        ));
    }

    #[test]
    fn test_deadline_remaining() {
        let unbounded = Deadline::start(None);
        assert!(!unbounded.is_expired());
        assert_eq!(unbounded.remaining(), None);

        let bounded = Deadline::start(Some(Duration::from_millis(50)));
        assert!(!bounded.is_expired());
        assert!(bounded.remaining().unwrap() <= Duration::from_millis(50));

        thread::sleep(Duration::from_millis(60));
        assert!(bounded.is_expired());
        assert_eq!(bounded.remaining().unwrap(), Duration::ZERO);
    }
}
