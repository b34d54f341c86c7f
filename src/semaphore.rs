//! Bounded counting semaphore.
//!
//! [`CountingSemaphore`] tracks *consumed* permits in a single atomic
//! counter (`available = max - consumed`) and pairs it with a
//! [`ManualResetSignal`] that is set while at least one permit is
//! available. Acquisition is a CAS retry loop that only decrements when it
//! can prove a permit exists; the signal is maintained with a lock-free
//! set-then-recheck pattern rather than a transaction spanning both cells,
//! so a release racing the last acquisition can never strand a waiter.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use log::trace;
use thiserror::Error;

use crate::atomic::AtomicFlag;
use crate::backoff::{Deadline, SpinBackoff};
use crate::cancel::CancellationToken;
use crate::signal::{ManualResetSignal, SignalError};

/// CAS attempts per round before a waiter blocks on the signal.
const SPIN_ATTEMPTS: u32 = 10;

/// Error when operating on a counting semaphore.
#[derive(Error, Debug)]
pub enum SemaphoreError {
    /// The semaphore has been disposed.
    #[error("semaphore has been disposed")]
    Disposed,

    /// The wait was canceled through its cancellation token.
    #[error("wait was canceled")]
    Canceled,

    /// The maximum count must be at least one.
    #[error("maximum count must be greater than zero")]
    InvalidMaximum,

    /// The initial count cannot exceed the maximum count.
    #[error("initial count {initial} exceeds maximum count {max}")]
    InvalidInitial {
        /// The rejected initial count.
        initial: usize,
        /// The configured maximum.
        max: usize,
    },

    /// Release counts must be at least one.
    #[error("release count must be greater than zero")]
    InvalidReleaseCount,

    /// The release has no matching acquire outstanding and would push the
    /// available count past the maximum.
    #[error("release of {requested} permit(s) would exceed the maximum count {max}")]
    OverRelease {
        /// Permits the caller tried to return.
        requested: usize,
        /// The configured maximum.
        max: usize,
    },
}

impl From<SignalError> for SemaphoreError {
    fn from(err: SignalError) -> Self {
        match err {
            SignalError::Disposed => Self::Disposed,
            SignalError::Canceled => Self::Canceled,
        }
    }
}

/// A bounded counting semaphore with blocking acquire.
pub struct CountingSemaphore {
    /// Permits currently consumed; `available = max - consumed`. Bounded
    /// to `[0, max]` at every observable instant.
    consumed: AtomicUsize,

    /// Upper bound on outstanding permits.
    max: usize,

    /// Set while at least one permit is available.
    available_signal: ManualResetSignal,

    /// Guards against use after `dispose`.
    disposed: AtomicFlag,
}

impl CountingSemaphore {
    /// Create a semaphore with `initial` available permits out of `max`.
    pub fn new(initial: usize, max: usize) -> Result<Self, SemaphoreError> {
        if max == 0 {
            return Err(SemaphoreError::InvalidMaximum);
        }
        if initial > max {
            return Err(SemaphoreError::InvalidInitial { initial, max });
        }
        Ok(Self {
            consumed: AtomicUsize::new(max - initial),
            max,
            available_signal: ManualResetSignal::new(initial > 0),
            disposed: AtomicFlag::new(false),
        })
    }

    /// The configured maximum count.
    pub fn max(&self) -> usize {
        self.max
    }

    /// Permits currently available.
    pub fn available(&self) -> usize {
        self.max
            .saturating_sub(self.consumed.load(Ordering::Acquire))
    }

    fn ensure_live(&self) -> Result<(), SemaphoreError> {
        if self.disposed.is_set() {
            Err(SemaphoreError::Disposed)
        } else {
            Ok(())
        }
    }

    /// Return one permit. See [`release_many`](Self::release_many).
    pub fn release(&self) -> Result<usize, SemaphoreError> {
        self.release_many(1)
    }

    /// Return `count` permits, waking waiters.
    ///
    /// Returns the available count observed immediately before the
    /// release. A zero `count` and a release that would exceed the maximum
    /// are both rejected without changing the counter.
    pub fn release_many(&self, count: usize) -> Result<usize, SemaphoreError> {
        self.ensure_live()?;
        if count == 0 {
            return Err(SemaphoreError::InvalidReleaseCount);
        }

        let mut consumed = self.consumed.load(Ordering::Acquire);
        loop {
            if consumed < count {
                return Err(SemaphoreError::OverRelease {
                    requested: count,
                    max: self.max,
                });
            }
            match self.consumed.compare_exchange(
                consumed,
                consumed - count,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => consumed = actual,
            }
        }

        let previous_available = self.max - consumed;
        self.available_signal.set()?;
        Ok(previous_available)
    }

    /// Attempt to consume one permit without blocking.
    fn try_take_permit(&self) -> bool {
        let mut consumed = self.consumed.load(Ordering::Acquire);
        loop {
            if consumed == self.max {
                return false;
            }
            match self.consumed.compare_exchange(
                consumed,
                consumed + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    if consumed + 1 == self.max {
                        // Last permit gone: clear the signal, then re-check
                        // in case a release slipped between the two steps.
                        if self.available_signal.reset().is_ok()
                            && self.consumed.load(Ordering::Acquire) < self.max
                        {
                            let _ = self.available_signal.set();
                        }
                    }
                    return true;
                }
                Err(actual) => consumed = actual,
            }
        }
    }

    /// Block until a permit is consumed, the timeout elapses, or the token
    /// is canceled.
    ///
    /// Returns `Ok(true)` once a permit is held and `Ok(false)` on timeout
    /// (`timeout` of `None` waits indefinitely). Cancellation fails with
    /// [`SemaphoreError::Canceled`].
    pub fn wait(
        &self,
        timeout: Option<Duration>,
        token: Option<&CancellationToken>,
    ) -> Result<bool, SemaphoreError> {
        self.ensure_live()?;
        if let Some(token) = token {
            if token.is_canceled() {
                return Err(SemaphoreError::Canceled);
            }
        }

        let deadline = Deadline::start(timeout);
        let mut backoff = SpinBackoff::new();

        loop {
            // Bounded spin/CAS rounds before touching the signal at all.
            for _ in 0..SPIN_ATTEMPTS {
                if self.try_take_permit() {
                    return Ok(true);
                }
                backoff.spin_once();
            }

            self.ensure_live()?;
            if deadline.is_expired() {
                // One last attempt so a permit released right at the
                // deadline edge is not misreported as a timeout.
                return Ok(self.try_take_permit());
            }

            trace!("semaphore contended; blocking on availability signal");
            if !self.available_signal.wait(deadline.remaining(), token)? {
                return Ok(self.try_take_permit());
            }
            backoff.reset();
        }
    }

    /// Dispose the semaphore, waking blocked waiters with
    /// [`SemaphoreError::Disposed`]. Idempotent.
    pub fn dispose(&self) {
        if self.disposed.set() {
            return;
        }
        self.available_signal.dispose();
        trace!("counting semaphore disposed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancellationSource;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_constructor_validation() {
        assert!(matches!(
            CountingSemaphore::new(0, 0),
            Err(SemaphoreError::InvalidMaximum)
        ));
        assert!(matches!(
            CountingSemaphore::new(3, 2),
            Err(SemaphoreError::InvalidInitial { initial: 3, max: 2 })
        ));

        let semaphore = CountingSemaphore::new(1, 2).unwrap();
        assert_eq!(semaphore.available(), 1);
        assert_eq!(semaphore.max(), 2);
    }

    #[test]
    fn test_wait_and_release_roundtrip() {
        let semaphore = CountingSemaphore::new(2, 2).unwrap();

        assert!(semaphore.wait(Some(Duration::ZERO), None).unwrap());
        assert_eq!(semaphore.available(), 1);
        assert!(semaphore.wait(Some(Duration::ZERO), None).unwrap());
        assert_eq!(semaphore.available(), 0);

        // Exhausted: a short wait times out.
        assert!(!semaphore.wait(Some(Duration::from_millis(30)), None).unwrap());

        assert_eq!(semaphore.release().unwrap(), 0);
        assert_eq!(semaphore.available(), 1);
        assert!(semaphore.wait(Some(Duration::ZERO), None).unwrap());
    }

    #[test]
    fn test_release_validation() {
        let semaphore = CountingSemaphore::new(1, 1).unwrap();

        assert!(matches!(
            semaphore.release_many(0),
            Err(SemaphoreError::InvalidReleaseCount)
        ));
        // Nothing consumed: returning a permit has no matching acquire.
        assert!(matches!(
            semaphore.release(),
            Err(SemaphoreError::OverRelease { requested: 1, max: 1 })
        ));

        assert!(semaphore.wait(Some(Duration::ZERO), None).unwrap());
        assert!(matches!(
            semaphore.release_many(2),
            Err(SemaphoreError::OverRelease { requested: 2, max: 1 })
        ));
        assert_eq!(semaphore.release().unwrap(), 0);
    }

    #[test]
    fn test_two_proceed_third_blocks() {
        let semaphore = Arc::new(CountingSemaphore::new(2, 2).unwrap());
        let acquired = Arc::new(AtomicUsize::new(0));

        let mut handles = vec![];
        for _ in 0..3 {
            let semaphore = Arc::clone(&semaphore);
            let acquired = Arc::clone(&acquired);
            handles.push(thread::spawn(move || {
                assert!(semaphore.wait(None, None).unwrap());
                acquired.fetch_add(1, Ordering::SeqCst);
            }));
        }

        // Two waiters get the two permits promptly; the third blocks.
        thread::sleep(Duration::from_millis(100));
        assert_eq!(acquired.load(Ordering::SeqCst), 2);

        semaphore.release().unwrap();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(acquired.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_bounded_counter_invariant_under_contention() {
        let semaphore = Arc::new(CountingSemaphore::new(3, 3).unwrap());
        let thread_count = 4;
        let iterations = 200;

        let mut handles = vec![];
        for _ in 0..thread_count {
            let semaphore = Arc::clone(&semaphore);
            handles.push(thread::spawn(move || {
                for _ in 0..iterations {
                    assert!(semaphore.wait(None, None).unwrap());
                    // The counter must stay within its bounds while held.
                    assert!(semaphore.available() < semaphore.max());
                    let previous = semaphore.release().unwrap();
                    assert!(previous < semaphore.max());
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(semaphore.available(), 3);
    }

    #[test]
    fn test_cancellation_aborts_wait() {
        let semaphore = Arc::new(CountingSemaphore::new(0, 1).unwrap());
        let source = CancellationSource::new();
        let token = source.token();

        let semaphore_clone = Arc::clone(&semaphore);
        let waiter = thread::spawn(move || semaphore_clone.wait(None, Some(&token)));

        thread::sleep(Duration::from_millis(50));
        source.cancel(false).unwrap();

        let result = waiter.join().unwrap();
        assert!(matches!(result, Err(SemaphoreError::Canceled)));
        // No permit was consumed by the canceled waiter.
        assert_eq!(semaphore.available(), 0);
    }

    #[test]
    fn test_timeout_precision_is_reasonable() {
        let semaphore = CountingSemaphore::new(0, 1).unwrap();
        let start = Instant::now();
        assert!(!semaphore
            .wait(Some(Duration::from_millis(50)), None)
            .unwrap());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_dispose_rejects_operations_and_wakes_waiters() {
        let semaphore = Arc::new(CountingSemaphore::new(0, 1).unwrap());

        let semaphore_clone = Arc::clone(&semaphore);
        let waiter = thread::spawn(move || semaphore_clone.wait(None, None));

        thread::sleep(Duration::from_millis(50));
        semaphore.dispose();
        semaphore.dispose(); // Idempotent

        let result = waiter.join().unwrap();
        assert!(matches!(result, Err(SemaphoreError::Disposed)));
        assert!(matches!(
            semaphore.release(),
            Err(SemaphoreError::Disposed)
        ));
        assert!(matches!(
            semaphore.wait(Some(Duration::ZERO), None),
            Err(SemaphoreError::Disposed)
        ));
    }
}
