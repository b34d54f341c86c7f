//! Cooperative cancellation.
//!
//! A [`CancellationSource`] owns the right to cancel; a
//! [`CancellationToken`] is a cheap, clonable handle that observers poll,
//! register callbacks on, and thread through blocking waits. Cancellation
//! is a single forward transition guarded by CAS, so `cancel` is
//! idempotent and safe to race from any number of threads: only the
//! winner drains the registered callbacks, each exactly once, in
//! registration order.
//!
//! Callbacks are plain closures; a panicking callback is the Rust analogue
//! of a callback exception. `cancel` runs every callback under
//! `catch_unwind` and either resumes the first panic immediately or
//! collects all of them into [`CancelError::Aggregate`].

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, trace};
use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::signal::ManualResetSignal;

/// Cancellation has not been requested.
const NOT_CANCELED: u32 = 0;

/// The winning `cancel` call is draining callbacks.
const CANCELING: u32 = 1;

/// Cancellation is complete.
const CANCELED: u32 = 2;

/// Error raised by cancellation operations.
#[derive(Error, Debug)]
pub enum CancelError {
    /// The operation observed a canceled token.
    #[error("operation was canceled")]
    Canceled,

    /// The cancellation source has been disposed.
    #[error("cancellation source has been disposed")]
    Disposed,

    /// One or more registered callbacks panicked while `cancel` was
    /// draining them; every callback was still given a chance to run.
    #[error("{} cancellation callback(s) panicked", .0.len())]
    Aggregate(Vec<String>),
}

type Callback = Box<dyn FnOnce() + Send>;

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "<unknown panic>".to_string()
    }
}

/// Shared state behind a source and all tokens derived from it.
struct SourceInner {
    /// Cancellation state machine; see module docs.
    state: AtomicU32,

    /// Guards against use after `dispose`.
    disposed: AtomicBool,

    /// Next registration id; ids only grow, and drain order follows them.
    next_id: AtomicU64,

    /// Pending callbacks by registration id.
    registrations: Mutex<BTreeMap<u64, Callback>>,

    /// Set when cancellation is requested; the wait handle other
    /// primitives race their own waits against.
    canceled_signal: ManualResetSignal,

    /// Deadline timer, created at most once per source.
    timer: OnceLock<DeadlineTimer>,

    /// Registrations held on upstream tokens by a linked source.
    upstream: Mutex<Vec<CancellationRegistration>>,
}

impl SourceInner {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU32::new(NOT_CANCELED),
            disposed: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            registrations: Mutex::new(BTreeMap::new()),
            canceled_signal: ManualResetSignal::new(false),
            timer: OnceLock::new(),
            upstream: Mutex::new(Vec::new()),
        })
    }

    fn is_canceled(&self) -> bool {
        self.state.load(Ordering::Acquire) != NOT_CANCELED
    }

    fn cancel(&self, aggregate_panics: bool) -> Result<(), CancelError> {
        if self
            .state
            .compare_exchange(NOT_CANCELED, CANCELING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Another cancel already won; idempotent.
            return Ok(());
        }

        debug!("cancellation requested; draining registered callbacks");
        let _ = self.canceled_signal.set();

        let mut panics = Vec::new();
        loop {
            // Pop one entry at a time so callbacks run outside the map lock
            // and late registrations racing us still drain.
            let entry = self.registrations.lock().pop_first();
            let (id, callback) = match entry {
                Some(entry) => entry,
                None => break,
            };
            trace!("invoking cancellation callback {}", id);
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(callback)) {
                if aggregate_panics {
                    panics.push(panic_message(&*payload));
                } else {
                    // Publish the terminal state before unwinding so the
                    // flag stays permanently true.
                    self.state.store(CANCELED, Ordering::Release);
                    self.drop_upstream();
                    panic::resume_unwind(payload);
                }
            }
        }

        self.state.store(CANCELED, Ordering::Release);
        self.drop_upstream();

        if panics.is_empty() {
            Ok(())
        } else {
            Err(CancelError::Aggregate(panics))
        }
    }

    /// Unhook this source from any upstream tokens it was linked to.
    fn drop_upstream(&self) {
        self.upstream.lock().clear();
    }

    fn register(self: &Arc<Self>, callback: Callback) -> Result<CancellationRegistration, CancelError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(CancelError::Disposed);
        }
        if self.is_canceled() {
            // Register-after-cancel still fires, synchronously and inline.
            callback();
            return Ok(CancellationRegistration::detached());
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.registrations.lock().insert(id, callback);

        // Re-check against the same status word `cancel` flips: whichever
        // side still finds the entry in the map owns invoking it.
        if self.is_canceled() {
            if let Some(callback) = self.registrations.lock().remove(&id) {
                callback();
            }
            return Ok(CancellationRegistration::detached());
        }

        trace!("registered cancellation callback {}", id);
        Ok(CancellationRegistration {
            id,
            source: Arc::downgrade(self),
        })
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(timer) = self.timer.get() {
            timer.shutdown();
        }
        self.registrations.lock().clear();
        self.drop_upstream();
        self.canceled_signal.dispose();
        trace!("cancellation source disposed");
    }
}

/// Shared state between a deadline timer and its worker thread.
struct TimerShared {
    deadline: Mutex<Option<Instant>>,
    cond: Condvar,
    shutdown: AtomicBool,
}

/// A single worker thread that fires `cancel` when a deadline arrives.
/// Rescheduling moves the deadline; it never spawns a second thread.
struct DeadlineTimer {
    shared: Arc<TimerShared>,
}

impl DeadlineTimer {
    fn spawn(source: Weak<SourceInner>) -> Self {
        let shared = Arc::new(TimerShared {
            deadline: Mutex::new(None),
            cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });

        let thread_shared = Arc::clone(&shared);
        let builder = thread::Builder::new().name("spinblock-cancel-timer".to_string());
        builder
            .spawn(move || Self::timer_loop(thread_shared, source))
            .expect("Failed to spawn cancellation timer thread");

        Self { shared }
    }

    fn timer_loop(shared: Arc<TimerShared>, source: Weak<SourceInner>) {
        let mut deadline = shared.deadline.lock();
        loop {
            if shared.shutdown.load(Ordering::Acquire) {
                return;
            }
            match *deadline {
                None => shared.cond.wait(&mut deadline),
                Some(at) => {
                    let now = Instant::now();
                    if now >= at {
                        *deadline = None;
                        drop(deadline);
                        match source.upgrade() {
                            Some(inner) => {
                                debug!("cancellation timer fired");
                                if let Err(err) = inner.cancel(true) {
                                    error!("cancellation callbacks panicked in timer thread: {}", err);
                                }
                            }
                            // The source is gone; nothing left to time.
                            None => return,
                        }
                        deadline = shared.deadline.lock();
                    } else {
                        let _ = shared.cond.wait_for(&mut deadline, at - now);
                    }
                }
            }
        }
    }

    fn schedule(&self, at: Instant) {
        let mut deadline = self.shared.deadline.lock();
        *deadline = Some(at);
        self.shared.cond.notify_one();
    }

    fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        let _deadline = self.shared.deadline.lock();
        self.shared.cond.notify_one();
    }
}

/// The mutable owner of a cancellation flag.
///
/// Dropping the source disposes it: pending registrations are discarded
/// and the deadline timer, if any, is shut down.
pub struct CancellationSource {
    inner: Arc<SourceInner>,
}

impl CancellationSource {
    /// Create a source that has not been canceled.
    pub fn new() -> Self {
        Self {
            inner: SourceInner::new(),
        }
    }

    /// Create a source that cancels itself after `delay`.
    pub fn with_timeout(delay: Duration) -> Self {
        let source = Self::new();
        // A freshly created source is never disposed or canceled.
        let _ = source.cancel_after(delay);
        source
    }

    /// Create a source canceled as soon as any of `tokens` is canceled.
    ///
    /// The linked source registers a forwarding callback on each upstream
    /// token and drops those registrations once it cancels or is disposed,
    /// so no upstream keeps it alive. An already-canceled upstream cancels
    /// the new source before this returns.
    pub fn linked(tokens: &[CancellationToken]) -> Self {
        let source = Self::new();
        let mut upstream = Vec::with_capacity(tokens.len());
        for token in tokens {
            let inner = Arc::clone(&source.inner);
            let forward = move || {
                if let Err(err) = inner.cancel(true) {
                    error!("linked cancellation callbacks panicked: {}", err);
                }
            };
            // A disposed upstream can never fire; skipping it is safe.
            if let Ok(registration) = token.register(forward) {
                upstream.push(registration);
            }
        }
        *source.inner.upstream.lock() = upstream;
        if source.inner.is_canceled() {
            // An upstream fired inline while we were still wiring up; the
            // forwarding registrations have nothing left to forward.
            source.inner.drop_upstream();
        }
        source
    }

    /// A token observing this source.
    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            kind: TokenKind::Source(Arc::clone(&self.inner)),
        }
    }

    /// Whether cancellation has been requested.
    pub fn is_canceled(&self) -> bool {
        self.inner.is_canceled()
    }

    /// Request cancellation.
    ///
    /// Idempotent and safe to call concurrently; only the winning call
    /// drains callbacks. With `aggregate_panics` every callback panic is
    /// captured into [`CancelError::Aggregate`]; without it the first
    /// panic resumes immediately (the canceled state is published either
    /// way).
    pub fn cancel(&self, aggregate_panics: bool) -> Result<(), CancelError> {
        if self.inner.disposed.load(Ordering::Acquire) {
            return Err(CancelError::Disposed);
        }
        self.inner.cancel(aggregate_panics)
    }

    /// Schedule cancellation after `delay`, creating the timer thread on
    /// first use. Later calls reschedule the same timer.
    pub fn cancel_after(&self, delay: Duration) -> Result<(), CancelError> {
        if self.inner.disposed.load(Ordering::Acquire) {
            return Err(CancelError::Disposed);
        }
        if self.inner.is_canceled() {
            return Ok(());
        }
        let timer = self
            .inner
            .timer
            .get_or_init(|| DeadlineTimer::spawn(Arc::downgrade(&self.inner)));
        timer.schedule(Instant::now() + delay);
        debug!("cancellation scheduled in {:?}", delay);
        Ok(())
    }

    /// Dispose the source. Idempotent; pending registrations are dropped
    /// without being invoked and the timer thread is stopped.
    pub fn dispose(&self) {
        self.inner.dispose();
    }
}

impl Default for CancellationSource {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CancellationSource {
    fn drop(&mut self) {
        self.inner.dispose();
    }
}

#[derive(Clone)]
enum TokenKind {
    /// Never cancels.
    Never,

    /// Permanently canceled.
    AlreadyCanceled,

    /// Observes a live source.
    Source(Arc<SourceInner>),
}

/// A cheap, clonable read handle onto a cancellation source.
#[derive(Clone)]
pub struct CancellationToken {
    kind: TokenKind,
}

impl CancellationToken {
    /// A token that can never be canceled.
    pub fn none() -> Self {
        Self {
            kind: TokenKind::Never,
        }
    }

    /// A token that is already, permanently canceled.
    pub fn already_canceled() -> Self {
        Self {
            kind: TokenKind::AlreadyCanceled,
        }
    }

    /// Whether this token could ever observe a cancellation.
    pub fn can_be_canceled(&self) -> bool {
        !matches!(self.kind, TokenKind::Never)
    }

    /// Whether cancellation has been requested.
    pub fn is_canceled(&self) -> bool {
        match &self.kind {
            TokenKind::Never => false,
            TokenKind::AlreadyCanceled => true,
            TokenKind::Source(inner) => inner.is_canceled(),
        }
    }

    /// Fail with [`CancelError::Canceled`] if cancellation has been
    /// requested.
    pub fn check_canceled(&self) -> Result<(), CancelError> {
        if self.is_canceled() {
            Err(CancelError::Canceled)
        } else {
            Ok(())
        }
    }

    /// Register a callback invoked when cancellation is requested.
    ///
    /// The callback fires exactly once. Registering on an already-canceled
    /// token invokes the callback synchronously before this returns.
    /// Dropping (or [`dispose`](CancellationRegistration::dispose)-ing)
    /// the returned registration before cancellation guarantees the
    /// callback never fires.
    pub fn register<F>(&self, callback: F) -> Result<CancellationRegistration, CancelError>
    where
        F: FnOnce() + Send + 'static,
    {
        match &self.kind {
            TokenKind::Never => Ok(CancellationRegistration::detached()),
            TokenKind::AlreadyCanceled => {
                callback();
                Ok(CancellationRegistration::detached())
            }
            TokenKind::Source(inner) => inner.register(Box::new(callback)),
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::none()
    }
}

/// Handle to a registered cancellation callback.
///
/// Dropping the handle best-effort unregisters the callback: a no-op if
/// the callback has already been invoked or the source is gone.
pub struct CancellationRegistration {
    id: u64,
    source: Weak<SourceInner>,
}

impl CancellationRegistration {
    /// A registration with nothing behind it (sentinel tokens, callbacks
    /// that already ran inline).
    fn detached() -> Self {
        Self {
            id: 0,
            source: Weak::new(),
        }
    }

    /// Unregister the callback. Equivalent to dropping the handle.
    pub fn dispose(self) {
        drop(self);
    }
}

impl Drop for CancellationRegistration {
    fn drop(&mut self) {
        if let Some(source) = self.source.upgrade() {
            source.registrations.lock().remove(&self.id);
        }
    }
}
