//! Manual-reset signal with lazy wait-handle promotion.
//!
//! [`ManualResetSignal`] is a level-triggered event with two
//! representations: a single atomic status word on the fast path, and a
//! real blocking wait handle (a mutex-protected flag plus a condition
//! variable) that is only created once a waiter actually needs to block
//! past its spin budget. The creation race is resolved by a CAS into a
//! transitional status, so the fast path never touches a blocking
//! primitive.
//!
//! Status transitions form a DAG terminating at `DISPOSED`:
//!
//! ```text
//! NOT_SET <-> SET
//!    |
//!    v (a waiter needs to block)
//! HANDLE_REQUESTED -> HANDLE_NOT_SET <-> HANDLE_SET
//!
//! any state except HANDLE_REQUESTED -> DISPOSED
//! ```

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use log::{debug, trace};
use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::backoff::{Deadline, SpinBackoff};
use crate::cancel::CancellationToken;

/// No wait handle exists; the signal is not set.
const NOT_SET: u32 = 0;

/// No wait handle exists; the signal is set.
const SET: u32 = 1;

/// One thread is creating the wait handle; resolves shortly.
const HANDLE_REQUESTED: u32 = 2;

/// The wait handle exists; the signal is not set.
const HANDLE_NOT_SET: u32 = 3;

/// The wait handle exists; the signal is set.
const HANDLE_SET: u32 = 4;

/// The signal has been disposed.
const DISPOSED: u32 = 5;

/// Default spin iterations a waiter performs before promoting the signal
/// to a real wait handle.
const DEFAULT_SPIN_BUDGET: u32 = 10;

/// Error when operating on a manual-reset signal.
#[derive(Error, Debug)]
pub enum SignalError {
    /// The signal has been disposed.
    #[error("signal has been disposed")]
    Disposed,

    /// The wait was canceled through its cancellation token.
    #[error("wait was canceled")]
    Canceled,
}

/// Blocking slow path: a condition variable behind a mutex-protected
/// signaled flag. Created at most once per signal.
struct WaitHandle {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl WaitHandle {
    fn new(signaled: bool) -> Self {
        Self {
            signaled: Mutex::new(signaled),
            cond: Condvar::new(),
        }
    }

    /// Wake all waiters without changing the signaled flag. Cancellation
    /// uses this to force a state re-check.
    fn wake_all(&self) {
        let _signaled = self.signaled.lock();
        self.cond.notify_all();
    }
}

/// A level-triggered manual-reset event.
///
/// `set` leaves the signal set until an explicit `reset`; any number of
/// waiters observe a set signal. The signal starts as a bare atomic word
/// and promotes itself to an OS-backed wait only under real contention.
pub struct ManualResetSignal {
    /// Packed status; see the module docs for the transition DAG.
    status: AtomicU32,

    /// Lazily created blocking slow path.
    handle: OnceLock<Arc<WaitHandle>>,

    /// Spin iterations a waiter performs before blocking.
    spin_budget: u32,
}

impl ManualResetSignal {
    /// Create a signal in the given state with the default spin budget.
    pub fn new(initially_set: bool) -> Self {
        Self::with_spin_budget(initially_set, DEFAULT_SPIN_BUDGET)
    }

    /// Create a signal with an explicit pre-block spin budget.
    pub fn with_spin_budget(initially_set: bool, spin_budget: u32) -> Self {
        Self {
            status: AtomicU32::new(if initially_set { SET } else { NOT_SET }),
            handle: OnceLock::new(),
            spin_budget,
        }
    }

    /// Whether the signal is currently set.
    ///
    /// A disposed signal reports `false`.
    pub fn is_set(&self) -> bool {
        matches!(self.status.load(Ordering::Acquire), SET | HANDLE_SET)
    }

    /// Set the signal, waking all current and future waiters.
    pub fn set(&self) -> Result<(), SignalError> {
        self.transition(true)
    }

    /// Reset the signal so future waiters block.
    pub fn reset(&self) -> Result<(), SignalError> {
        self.transition(false)
    }

    fn transition(&self, target: bool) -> Result<(), SignalError> {
        let mut backoff = SpinBackoff::new();
        loop {
            let status = self.status.load(Ordering::Acquire);
            match status {
                DISPOSED => return Err(SignalError::Disposed),
                HANDLE_REQUESTED => {
                    // Another thread is mid-creation; sit it out, then retry.
                    SpinBackoff::spin_until_ne(&self.status, HANDLE_REQUESTED, None);
                }
                NOT_SET | SET => {
                    let desired = if target { SET } else { NOT_SET };
                    if status == desired {
                        return Ok(());
                    }
                    if self
                        .status
                        .compare_exchange(status, desired, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return Ok(());
                    }
                    backoff.spin_once();
                }
                _ => {
                    // A handle exists. The status flip and the handle's
                    // protected flag must move together, or a racing
                    // set/reset pair could strand them disagreeing; the
                    // handle lock serializes both.
                    if let Some(handle) = self.handle.get() {
                        let mut signaled = handle.signaled.lock();
                        match self.status.load(Ordering::Acquire) {
                            DISPOSED => return Err(SignalError::Disposed),
                            HANDLE_NOT_SET | HANDLE_SET => {
                                self.status.store(
                                    if target { HANDLE_SET } else { HANDLE_NOT_SET },
                                    Ordering::Release,
                                );
                                *signaled = target;
                                if target {
                                    handle.cond.notify_all();
                                }
                                return Ok(());
                            }
                            _ => {}
                        }
                    } else {
                        backoff.spin_once();
                    }
                }
            }
        }
    }

    /// Block until the signal is set, the timeout elapses, or the token is
    /// canceled.
    ///
    /// Returns `Ok(true)` when the signal was observed set, `Ok(false)` on
    /// timeout (`timeout` of `None` waits indefinitely), and
    /// [`SignalError::Canceled`] if the token fired. A token canceled
    /// before the call blocks aborts immediately.
    pub fn wait(
        &self,
        timeout: Option<Duration>,
        token: Option<&CancellationToken>,
    ) -> Result<bool, SignalError> {
        if let Some(token) = token {
            if token.is_canceled() {
                return Err(SignalError::Canceled);
            }
        }

        match self.status.load(Ordering::Acquire) {
            SET | HANDLE_SET => return Ok(true),
            DISPOSED => return Err(SignalError::Disposed),
            _ => {}
        }

        let deadline = Deadline::start(timeout);

        // Spin phase: most set/wait pairs resolve within a few iterations
        // without the signal ever owning a wait handle.
        let mut backoff = SpinBackoff::new();
        for _ in 0..self.spin_budget {
            backoff.spin_once();
            match self.status.load(Ordering::Acquire) {
                SET | HANDLE_SET => return Ok(true),
                DISPOSED => return Err(SignalError::Disposed),
                _ => {}
            }
            if let Some(token) = token {
                if token.is_canceled() {
                    return Err(SignalError::Canceled);
                }
            }
            if deadline.is_expired() {
                return Ok(false);
            }
        }

        let handle = self.obtain_handle()?;

        // A canceled token must be able to pull us out of the condvar wait;
        // the forwarded callback only pokes the handle, the loop below does
        // the actual re-check.
        let _cancel_wakeup = token.and_then(|token| {
            let handle = Arc::clone(&handle);
            token.register(move || handle.wake_all()).ok()
        });

        let mut signaled = handle.signaled.lock();
        loop {
            match self.status.load(Ordering::Acquire) {
                SET | HANDLE_SET => return Ok(true),
                DISPOSED => return Err(SignalError::Disposed),
                _ => {}
            }
            if *signaled {
                return Ok(true);
            }
            if let Some(token) = token {
                if token.is_canceled() {
                    return Err(SignalError::Canceled);
                }
            }
            match deadline.remaining() {
                None => handle.cond.wait(&mut signaled),
                Some(remaining) => {
                    if remaining.is_zero() {
                        return Ok(false);
                    }
                    let _ = handle.cond.wait_for(&mut signaled, remaining);
                }
            }
        }
    }

    /// Get the wait handle, creating it if this waiter is the first to
    /// block. Exactly one thread wins the creation race; losers spin until
    /// the transitional state resolves.
    fn obtain_handle(&self) -> Result<Arc<WaitHandle>, SignalError> {
        let mut backoff = SpinBackoff::new();
        loop {
            match self.status.load(Ordering::Acquire) {
                DISPOSED => return Err(SignalError::Disposed),
                NOT_SET => {
                    if self
                        .status
                        .compare_exchange(
                            NOT_SET,
                            HANDLE_REQUESTED,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        let handle = Arc::new(WaitHandle::new(false));
                        let _ = self.handle.set(Arc::clone(&handle));
                        self.status.store(HANDLE_NOT_SET, Ordering::Release);
                        debug!("manual-reset signal promoted to a wait handle");
                        return Ok(handle);
                    }
                }
                SET => {
                    // Became set before the handle was needed; hand out a
                    // pre-signaled handle so the caller returns promptly.
                    if self
                        .status
                        .compare_exchange(SET, HANDLE_REQUESTED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        let handle = Arc::new(WaitHandle::new(true));
                        let _ = self.handle.set(Arc::clone(&handle));
                        self.status.store(HANDLE_SET, Ordering::Release);
                        debug!("manual-reset signal promoted to a wait handle");
                        return Ok(handle);
                    }
                }
                HANDLE_REQUESTED => {
                    SpinBackoff::spin_until_ne(&self.status, HANDLE_REQUESTED, None);
                }
                _ => {
                    // HANDLE_NOT_SET or HANDLE_SET: the handle exists.
                    if let Some(handle) = self.handle.get() {
                        return Ok(Arc::clone(handle));
                    }
                    backoff.spin_once();
                }
            }
        }
    }

    /// Dispose the signal, waking any blocked waiters.
    ///
    /// Idempotent; every operation except `dispose` fails with
    /// [`SignalError::Disposed`] afterwards.
    pub fn dispose(&self) {
        let mut backoff = SpinBackoff::new();
        loop {
            let status = self.status.load(Ordering::Acquire);
            match status {
                DISPOSED => return,
                HANDLE_REQUESTED => {
                    // Let the creating thread finish publishing the handle.
                    SpinBackoff::spin_until_ne(&self.status, HANDLE_REQUESTED, None);
                }
                NOT_SET | SET => {
                    if self
                        .status
                        .compare_exchange(status, DISPOSED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        trace!("manual-reset signal disposed");
                        return;
                    }
                }
                _ => {
                    // Serialize with set/reset under the handle lock, then
                    // wake every parked waiter so it observes the terminal
                    // state.
                    if let Some(handle) = self.handle.get() {
                        let _signaled = handle.signaled.lock();
                        self.status.store(DISPOSED, Ordering::Release);
                        handle.cond.notify_all();
                        trace!("manual-reset signal disposed");
                        return;
                    }
                    backoff.spin_once();
                }
            }
        }
    }
}
