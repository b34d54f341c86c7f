#![deny(warnings)]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

//! # Spinblock
//!
//! Hybrid spinning/blocking synchronization primitives.
//!
//! Every primitive in this crate shares one philosophy: stay on a lock-free
//! atomic fast path while uncontended, spin briefly under light contention,
//! and only create and block on a real wait handle when contention demands
//! it. Blocking operations accept an optional timeout and an optional
//! [`CancellationToken`] so that waits compose with cooperative
//! cancellation: a timeout reports `false`, cancellation fails with a
//! distinguished error.
//!
//! The crate provides:
//!
//! - Spin backoff and predicate-polling helpers
//! - A one-word atomic flag with a non-blocking try-acquire
//! - A manual-reset signal with a lazily promoted wait handle
//! - A bounded counting semaphore
//! - Cooperative cancellation sources, tokens, and registrations
//! - A recursion-aware reader/writer coordinator over a packed atomic word

/// Lock-free one-word primitives
pub mod atomic;

/// Spin backoff and predicate polling
pub mod backoff;

/// Cooperative cancellation
pub mod cancel;

/// Reader/writer coordination over a packed atomic word
pub mod rwlock;

/// Bounded counting semaphore
pub mod semaphore;

/// Manual-reset signal with lazy wait-handle promotion
pub mod signal;

// Re-export key types for easier access
pub use atomic::AtomicFlag;
pub use backoff::SpinBackoff;
pub use cancel::{CancelError, CancellationRegistration, CancellationSource, CancellationToken};
pub use rwlock::{ReaderWriterCoordinator, RecursionPolicy, RwLockError};
pub use semaphore::{CountingSemaphore, SemaphoreError};
pub use signal::{ManualResetSignal, SignalError};
