//! Reader/writer coordination over a packed atomic word.
//!
//! [`ReaderWriterCoordinator`] encodes its entire cross-thread state in a
//! single atomic integer so every transition is one CAS:
//!
//! ```text
//! bit 0  WAITING_WRITE    a writer has registered intent
//! bit 1  WAITING_UPGRADE  the upgradeable holder is converting to write
//! bit 2  WRITER_ACTIVE    a writer holds the lock
//! bit 3+                  count of threads holding a read or
//!                         upgradeable-read grant
//! ```
//!
//! Three [`ManualResetSignal`]s park contended threads: `writer_done`
//! (set while no writer is active or pending), `reader_done` (set while
//! the reader count is zero), and `upgrade_available` (set while the
//! single upgradeable slot is free). All three are advisory; every waiter
//! re-checks the packed word after waking, so a stale set can only cost a
//! retry, never correctness.
//!
//! Recursion is tracked per thread in a record looked up through a small
//! fixed-size array indexed by a process-local thread slot id, with a
//! synchronized map fallback for ids beyond the array bound. Only the
//! owning thread mutates its record.
//!
//! Ordering is best-effort by design: a thread re-entering the retry loop
//! may overtake one that has waited longer. There is no fairness queue.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bitflags::bitflags;
use log::trace;
use parking_lot::Mutex;
use thiserror::Error;

use crate::atomic::AtomicFlag;
use crate::backoff::{Deadline, SpinBackoff};
use crate::cancel::CancellationToken;
use crate::signal::{ManualResetSignal, SignalError};

/// A writer has registered intent and waits to activate.
const WAITING_WRITE: usize = 0b001;

/// The upgradeable holder swapped its read grant for write intent.
const WAITING_UPGRADE: usize = 0b010;

/// A writer holds the lock.
const WRITER_ACTIVE: usize = 0b100;

/// All writer-related flag bits; readers defer while any is set.
const WRITER_MASK: usize = WAITING_WRITE | WAITING_UPGRADE | WRITER_ACTIVE;

/// One reader, counted in the region above the flag bits.
const READER_UNIT: usize = 0b1000;

fn reader_count(state: usize) -> usize {
    state >> 3
}

/// Fast-array capacity for per-thread records; threads with higher slot
/// ids fall back to the overflow map.
const FAST_SLOTS: usize = 64;

static NEXT_THREAD_SLOT: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static THREAD_SLOT: u64 = NEXT_THREAD_SLOT.fetch_add(1, Ordering::Relaxed);
}

fn current_thread_slot() -> u64 {
    THREAD_SLOT.with(|slot| *slot)
}

bitflags! {
    /// Lock modes a single thread currently holds.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct HoldMask: u32 {
        const READ = 0b001;
        const WRITE = 0b010;
        const UPGRADE = 0b100;
    }
}

/// Per-thread recursion bookkeeping.
///
/// Only the owning thread mutates its record; the fields are relaxed
/// atomics purely so the shared table stays `Sync` without unsafe code.
#[derive(Default)]
struct ThreadRecord {
    mode: AtomicU32,
    read_count: AtomicU32,
    write_count: AtomicU32,
    upgrade_count: AtomicU32,
}

impl ThreadRecord {
    fn mode(&self) -> HoldMask {
        HoldMask::from_bits_truncate(self.mode.load(Ordering::Relaxed))
    }

    fn add_mode(&self, mode: HoldMask) {
        self.mode.store((self.mode() | mode).bits(), Ordering::Relaxed);
    }

    fn remove_mode(&self, mode: HoldMask) {
        self.mode.store((self.mode() - mode).bits(), Ordering::Relaxed);
    }
}

enum RecordRef<'a> {
    Fast(&'a ThreadRecord),
    Overflow(Arc<ThreadRecord>),
}

impl Deref for RecordRef<'_> {
    type Target = ThreadRecord;

    fn deref(&self) -> &ThreadRecord {
        match self {
            RecordRef::Fast(record) => record,
            RecordRef::Overflow(record) => record,
        }
    }
}

/// Whether a thread may re-acquire lock modes it already holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecursionPolicy {
    /// Any second acquisition on a holding thread fails, except the
    /// upgradeable→read and upgradeable→write transitions, which are the
    /// purpose of the upgradeable mode.
    #[default]
    NoRecursion,

    /// Same-mode re-entry and write→read are permitted and counted per
    /// thread. read→write remains illegal under either policy.
    Recursive,
}

/// Error when operating on a reader/writer coordinator.
#[derive(Error, Debug)]
pub enum RwLockError {
    /// The coordinator has been disposed.
    #[error("coordinator has been disposed")]
    Disposed,

    /// The wait was canceled through its cancellation token.
    #[error("wait was canceled")]
    Canceled,

    /// The calling thread already holds a mode that makes this
    /// acquisition illegal under the configured recursion policy.
    #[error("{0} acquisition would recurse on a thread that already holds the lock")]
    Reentrancy(&'static str),

    /// Disposal was attempted while grants are outstanding.
    #[error("coordinator cannot be disposed while grants are outstanding")]
    LockInUse,

    /// The calling thread does not hold the grant it tried to release.
    #[error("thread does not hold a {0} grant")]
    NotHeld(&'static str),

    /// A write grant taken from upgradeable mode must be released before
    /// the upgradeable grant itself.
    #[error("grants must be released in the reverse order they were acquired")]
    ExitOrder,
}

impl From<SignalError> for RwLockError {
    fn from(err: SignalError) -> Self {
        match err {
            SignalError::Disposed => Self::Disposed,
            SignalError::Canceled => Self::Canceled,
        }
    }
}

/// A reader/writer lock with an upgradeable mode and per-thread recursion
/// tracking.
///
/// Grants are explicit `enter`/`exit` pairs rather than RAII guards
/// because the coordinator protects no data of its own; higher-level
/// containers compose it around their storage.
pub struct ReaderWriterCoordinator {
    /// The packed state word; see the module docs for the layout.
    state: AtomicUsize,

    /// Configured recursion policy.
    policy: RecursionPolicy,

    /// Gate for the single system-wide upgradeable holder.
    upgradeable_taken: AtomicFlag,

    /// Set while no writer is active or pending.
    writer_done: ManualResetSignal,

    /// Set while the reader count is zero.
    reader_done: ManualResetSignal,

    /// Set while the upgradeable slot is free.
    upgrade_available: ManualResetSignal,

    /// Per-thread records for low slot ids; allocation-free lookups.
    fast_records: Box<[ThreadRecord]>,

    /// Per-thread records for slot ids beyond the fast array.
    overflow_records: Mutex<HashMap<u64, Arc<ThreadRecord>>>,

    /// Guards against use after `dispose`.
    disposed: AtomicFlag,
}

impl ReaderWriterCoordinator {
    /// Create a coordinator with the given recursion policy.
    pub fn new(policy: RecursionPolicy) -> Self {
        let mut fast = Vec::with_capacity(FAST_SLOTS);
        fast.resize_with(FAST_SLOTS, ThreadRecord::default);
        Self {
            state: AtomicUsize::new(0),
            policy,
            upgradeable_taken: AtomicFlag::new(false),
            writer_done: ManualResetSignal::new(true),
            reader_done: ManualResetSignal::new(true),
            upgrade_available: ManualResetSignal::new(true),
            fast_records: fast.into_boxed_slice(),
            overflow_records: Mutex::new(HashMap::new()),
            disposed: AtomicFlag::new(false),
        }
    }

    /// The configured recursion policy.
    pub fn policy(&self) -> RecursionPolicy {
        self.policy
    }

    /// Number of threads currently holding a read or upgradeable-read
    /// grant.
    pub fn active_reader_count(&self) -> usize {
        reader_count(self.state.load(Ordering::Acquire))
    }

    /// Whether the calling thread holds a read grant.
    pub fn holds_read(&self) -> bool {
        self.record().mode().contains(HoldMask::READ)
    }

    /// Whether the calling thread holds the write grant.
    pub fn holds_write(&self) -> bool {
        self.record().mode().contains(HoldMask::WRITE)
    }

    /// Whether the calling thread holds the upgradeable-read grant.
    pub fn holds_upgradeable(&self) -> bool {
        self.record().mode().contains(HoldMask::UPGRADE)
    }

    fn record(&self) -> RecordRef<'_> {
        let slot = current_thread_slot();
        if (slot as usize) < FAST_SLOTS {
            RecordRef::Fast(&self.fast_records[slot as usize])
        } else {
            let mut overflow = self.overflow_records.lock();
            let record = overflow
                .entry(slot)
                .or_insert_with(|| Arc::new(ThreadRecord::default()))
                .clone();
            RecordRef::Overflow(record)
        }
    }

    fn ensure_live(&self) -> Result<(), RwLockError> {
        if self.disposed.is_set() {
            Err(RwLockError::Disposed)
        } else {
            Ok(())
        }
    }

    /// Enter read mode, waiting indefinitely.
    pub fn enter_read(&self) -> Result<(), RwLockError> {
        self.try_enter_read(None, None).map(|_| ())
    }

    /// Enter read mode, bounded by a timeout and a cancellation token.
    ///
    /// Returns `Ok(false)` on timeout; cancellation fails with
    /// [`RwLockError::Canceled`].
    pub fn try_enter_read(
        &self,
        timeout: Option<Duration>,
        token: Option<&CancellationToken>,
    ) -> Result<bool, RwLockError> {
        self.ensure_live()?;
        let record = self.record();
        let held = record.mode();

        if held.contains(HoldMask::READ) {
            if self.policy == RecursionPolicy::NoRecursion {
                return Err(RwLockError::Reentrancy("read"));
            }
            record.read_count.fetch_add(1, Ordering::Relaxed);
            return Ok(true);
        }

        if held.contains(HoldMask::UPGRADE)
            || (self.policy == RecursionPolicy::Recursive && held.contains(HoldMask::WRITE))
        {
            // The thread already excludes writers, so the grant is
            // immediate; no rollback race is possible.
            let observed = self.state.fetch_add(READER_UNIT, Ordering::AcqRel) + READER_UNIT;
            if reader_count(observed) == 1 {
                self.reader_done.reset()?;
            }
            record.add_mode(HoldMask::READ);
            record.read_count.store(1, Ordering::Relaxed);
            return Ok(true);
        }

        if !held.is_empty() {
            return Err(RwLockError::Reentrancy("read"));
        }

        let deadline = Deadline::start(timeout);
        if !self.acquire_read_grant(&deadline, token)? {
            return Ok(false);
        }
        record.add_mode(HoldMask::READ);
        record.read_count.store(1, Ordering::Relaxed);
        Ok(true)
    }

    /// Take one unit in the reader-count region, deferring to writers.
    fn acquire_read_grant(
        &self,
        deadline: &Deadline,
        token: Option<&CancellationToken>,
    ) -> Result<bool, RwLockError> {
        let mut backoff = SpinBackoff::new();
        loop {
            self.ensure_live()?;
            let state = self.state.load(Ordering::Acquire);

            if state & WRITER_MASK != 0 {
                if deadline.is_expired() {
                    return Ok(false);
                }
                trace!("read grant deferring to writer (state {:#x})", state);
                self.writer_done.wait(deadline.remaining(), token)?;
                backoff.spin_once();
                continue;
            }

            let observed = self.state.fetch_add(READER_UNIT, Ordering::AcqRel) + READER_UNIT;
            if observed & WRITER_MASK == 0 {
                if reader_count(observed) == 1 {
                    // First reader in: a future writer must wait on us.
                    self.reader_done.reset()?;
                }
                return Ok(true);
            }

            // A writer slipped in between the check and the increment.
            self.state.fetch_sub(READER_UNIT, Ordering::AcqRel);
            if deadline.is_expired() {
                return Ok(false);
            }
            backoff.spin_once();
        }
    }

    /// Release one unit from the reader-count region.
    fn release_read_grant(&self) -> Result<(), RwLockError> {
        let state = self.state.fetch_sub(READER_UNIT, Ordering::AcqRel) - READER_UNIT;
        if reader_count(state) == 0 {
            self.reader_done.set()?;
        }
        Ok(())
    }

    /// Exit read mode.
    pub fn exit_read(&self) -> Result<(), RwLockError> {
        let record = self.record();
        if !record.mode().contains(HoldMask::READ) {
            return Err(RwLockError::NotHeld("read"));
        }
        let remaining = record.read_count.fetch_sub(1, Ordering::Relaxed) - 1;
        if remaining > 0 {
            return Ok(());
        }
        record.remove_mode(HoldMask::READ);
        self.release_read_grant()
    }

    /// Enter write mode, waiting indefinitely.
    pub fn enter_write(&self) -> Result<(), RwLockError> {
        self.try_enter_write(None, None).map(|_| ())
    }

    /// Enter write mode, bounded by a timeout and a cancellation token.
    ///
    /// Returns `Ok(false)` on timeout; cancellation fails with
    /// [`RwLockError::Canceled`]. An upgradeable holder converts its grant
    /// atomically, so no competing writer can interleave the upgrade.
    pub fn try_enter_write(
        &self,
        timeout: Option<Duration>,
        token: Option<&CancellationToken>,
    ) -> Result<bool, RwLockError> {
        self.ensure_live()?;
        let record = self.record();
        let held = record.mode();

        if held.contains(HoldMask::WRITE) {
            if self.policy == RecursionPolicy::NoRecursion {
                return Err(RwLockError::Reentrancy("write"));
            }
            record.write_count.fetch_add(1, Ordering::Relaxed);
            return Ok(true);
        }

        if held.contains(HoldMask::READ) {
            // A plain read grant can never be upgraded; that is what the
            // upgradeable mode is for.
            return Err(RwLockError::Reentrancy("write"));
        }

        let deadline = Deadline::start(timeout);
        let acquired = if held.contains(HoldMask::UPGRADE) {
            self.acquire_write_from_upgrade(&deadline, token)?
        } else {
            self.acquire_write(&deadline, token)?
        };
        if !acquired {
            return Ok(false);
        }
        record.add_mode(HoldMask::WRITE);
        record.write_count.store(1, Ordering::Relaxed);
        Ok(true)
    }

    /// Contend for the writer-active flag from a thread holding nothing.
    fn acquire_write(
        &self,
        deadline: &Deadline,
        token: Option<&CancellationToken>,
    ) -> Result<bool, RwLockError> {
        let mut registered = false;
        let mut backoff = SpinBackoff::new();

        let result = loop {
            if let Err(err) = self.ensure_live() {
                break Err(err);
            }
            let state = self.state.load(Ordering::Acquire);

            let installable = state & (WRITER_ACTIVE | WAITING_UPGRADE) == 0
                && reader_count(state) == 0
                && (registered || state & WAITING_WRITE == 0);
            if installable {
                // Become the active writer, retiring our own wait flag in
                // the same exchange.
                let flag = if registered { WAITING_WRITE } else { 0 };
                let target = state + WRITER_ACTIVE - flag;
                if self
                    .state
                    .compare_exchange(state, target, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    // The install CAS already retired the wait flag.
                    registered = false;
                    if let Err(err) = self.writer_done.reset() {
                        break Err(err.into());
                    }
                    trace!("writer active");
                    break Ok(true);
                }
                backoff.spin_once();
                continue;
            }

            if !registered && state & WAITING_WRITE == 0 {
                if self
                    .state
                    .compare_exchange(
                        state,
                        state | WAITING_WRITE,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    registered = true;
                    trace!("writer registered wait flag");
                    // New readers now defer; the reset makes them block
                    // rather than spin past us.
                    if let Err(err) = self.writer_done.reset() {
                        break Err(err.into());
                    }
                }
                continue;
            }

            if deadline.is_expired() {
                break Ok(false);
            }

            let wait = if state & WRITER_ACTIVE != 0 {
                Some(self.writer_done.wait(deadline.remaining(), token))
            } else if reader_count(state) > 0 {
                Some(self.reader_done.wait(deadline.remaining(), token))
            } else {
                // Another writer holds the wait flag; contend again.
                None
            };
            match wait {
                Some(Ok(_)) => backoff.reset(),
                Some(Err(err)) => break Err(err.into()),
                None => backoff.spin_once(),
            }
        };

        match result {
            Ok(true) => Ok(true),
            other => {
                if registered {
                    self.abandon_write_wait(WAITING_WRITE)?;
                }
                other
            }
        }
    }

    /// Convert an upgradeable-read grant into the writer-active flag.
    fn acquire_write_from_upgrade(
        &self,
        deadline: &Deadline,
        token: Option<&CancellationToken>,
    ) -> Result<bool, RwLockError> {
        // Swap our reader grant for the upgrade-wait flag in one exchange
        // so no plain writer can interleave the conversion.
        let mut state = self.state.load(Ordering::Acquire);
        loop {
            let target = state - READER_UNIT + WAITING_UPGRADE;
            match self
                .state
                .compare_exchange(state, target, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(actual) => state = actual,
            }
        }
        self.writer_done.reset()?;
        trace!("upgradeable holder converting to write");

        let mut backoff = SpinBackoff::new();
        let result = loop {
            let state = self.state.load(Ordering::Acquire);

            if state & WRITER_ACTIVE == 0 && reader_count(state) == 0 {
                let target = state + WRITER_ACTIVE - WAITING_UPGRADE;
                if self
                    .state
                    .compare_exchange(state, target, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    break Ok(true);
                }
                backoff.spin_once();
                continue;
            }

            if deadline.is_expired() {
                break Ok(false);
            }

            let wait = if state & WRITER_ACTIVE != 0 {
                self.writer_done.wait(deadline.remaining(), token)
            } else {
                self.reader_done.wait(deadline.remaining(), token)
            };
            match wait {
                Ok(_) => backoff.reset(),
                Err(err) => break Err(err.into()),
            }
        };

        match result {
            Ok(true) => Ok(true),
            other => {
                // Restore the reader grant we swapped out.
                let restored = self
                    .state
                    .fetch_add(READER_UNIT - WAITING_UPGRADE, Ordering::AcqRel)
                    + (READER_UNIT - WAITING_UPGRADE);
                self.writer_done.set()?;
                if reader_count(restored) == 1 {
                    self.reader_done.reset()?;
                }
                other
            }
        }
    }

    /// Roll back a registered write-wait flag after timeout or
    /// cancellation.
    fn abandon_write_wait(&self, flag: usize) -> Result<(), RwLockError> {
        self.state.fetch_sub(flag, Ordering::AcqRel);
        // Readers parked on the flag this thread just retired re-check the
        // word after waking, so the advisory set is always safe.
        self.writer_done.set()?;
        Ok(())
    }

    /// Exit write mode.
    pub fn exit_write(&self) -> Result<(), RwLockError> {
        let record = self.record();
        if !record.mode().contains(HoldMask::WRITE) {
            return Err(RwLockError::NotHeld("write"));
        }
        let remaining = record.write_count.fetch_sub(1, Ordering::Relaxed) - 1;
        if remaining > 0 {
            return Ok(());
        }
        record.remove_mode(HoldMask::WRITE);

        if record.mode().contains(HoldMask::UPGRADE) {
            // Return to upgradeable-read: swap the writer flag back for a
            // reader grant in one exchange.
            let restored = self
                .state
                .fetch_add(READER_UNIT - WRITER_ACTIVE, Ordering::AcqRel)
                + (READER_UNIT - WRITER_ACTIVE);
            self.writer_done.set()?;
            if reader_count(restored) == 1 {
                self.reader_done.reset()?;
            }
        } else {
            self.state.fetch_sub(WRITER_ACTIVE, Ordering::AcqRel);
            self.writer_done.set()?;
        }
        trace!("writer released");
        Ok(())
    }

    /// Enter upgradeable-read mode, waiting indefinitely.
    pub fn enter_upgradeable_read(&self) -> Result<(), RwLockError> {
        self.try_enter_upgradeable_read(None, None).map(|_| ())
    }

    /// Enter upgradeable-read mode, bounded by a timeout and a
    /// cancellation token.
    ///
    /// At most one thread holds the upgradeable grant per coordinator; it
    /// coexists with plain readers and may later convert to write without
    /// releasing.
    pub fn try_enter_upgradeable_read(
        &self,
        timeout: Option<Duration>,
        token: Option<&CancellationToken>,
    ) -> Result<bool, RwLockError> {
        self.ensure_live()?;
        let record = self.record();
        let held = record.mode();

        if held.contains(HoldMask::UPGRADE) {
            if self.policy == RecursionPolicy::NoRecursion {
                return Err(RwLockError::Reentrancy("upgradeable read"));
            }
            record.upgrade_count.fetch_add(1, Ordering::Relaxed);
            return Ok(true);
        }

        if !held.is_empty() {
            return Err(RwLockError::Reentrancy("upgradeable read"));
        }

        let deadline = Deadline::start(timeout);

        // The flag is the gate; the signal only parks the losers.
        loop {
            self.ensure_live()?;
            if self.upgradeable_taken.try_acquire() {
                break;
            }
            if deadline.is_expired() {
                return Ok(false);
            }
            trace!("upgradeable slot taken; waiting");
            self.upgrade_available.wait(deadline.remaining(), token)?;
        }

        if let Err(err) = self.upgrade_available.reset() {
            self.upgradeable_taken.release();
            return Err(err.into());
        }

        // Take an ordinary read grant, then reclassify it.
        match self.acquire_read_grant(&deadline, token) {
            Ok(true) => {
                record.add_mode(HoldMask::UPGRADE);
                record.upgrade_count.store(1, Ordering::Relaxed);
                Ok(true)
            }
            other => {
                self.upgradeable_taken.release();
                self.upgrade_available.set()?;
                other
            }
        }
    }

    /// Exit upgradeable-read mode.
    pub fn exit_upgradeable_read(&self) -> Result<(), RwLockError> {
        let record = self.record();
        let held = record.mode();
        if !held.contains(HoldMask::UPGRADE) {
            return Err(RwLockError::NotHeld("upgradeable read"));
        }
        if held.contains(HoldMask::WRITE) {
            return Err(RwLockError::ExitOrder);
        }
        let remaining = record.upgrade_count.fetch_sub(1, Ordering::Relaxed) - 1;
        if remaining > 0 {
            return Ok(());
        }
        record.remove_mode(HoldMask::UPGRADE);
        self.release_read_grant()?;
        self.upgradeable_taken.release();
        self.upgrade_available.set()?;
        trace!("upgradeable reader released");
        Ok(())
    }

    /// Dispose the coordinator.
    ///
    /// Fails with [`RwLockError::LockInUse`] while any grant is
    /// outstanding; no partial teardown occurs. Idempotent once it
    /// succeeds.
    pub fn dispose(&self) -> Result<(), RwLockError> {
        if self.disposed.is_set() {
            return Ok(());
        }
        if self.state.load(Ordering::Acquire) != 0 || self.upgradeable_taken.is_set() {
            return Err(RwLockError::LockInUse);
        }
        if self.disposed.set() {
            return Ok(());
        }
        self.writer_done.dispose();
        self.reader_done.dispose();
        self.upgrade_available.dispose();
        trace!("reader/writer coordinator disposed");
        Ok(())
    }
}

impl Default for ReaderWriterCoordinator {
    fn default() -> Self {
        Self::new(RecursionPolicy::NoRecursion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancellationSource;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_read_allows_concurrent_readers() {
        let lock = Arc::new(ReaderWriterCoordinator::default());

        let mut handles = vec![];
        for _ in 0..5 {
            let lock = Arc::clone(&lock);
            handles.push(thread::spawn(move || {
                lock.enter_read().unwrap();
                assert!(lock.holds_read());
                thread::sleep(Duration::from_millis(30));
                lock.exit_read().unwrap();
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(lock.active_reader_count(), 0);
    }

    #[test]
    fn test_writer_excludes_readers() {
        let lock = Arc::new(ReaderWriterCoordinator::default());
        lock.enter_write().unwrap();
        assert!(lock.holds_write());

        let lock_clone = Arc::clone(&lock);
        let reader = thread::spawn(move || {
            lock_clone
                .try_enter_read(Some(Duration::from_millis(50)), None)
                .unwrap()
        });
        assert!(!reader.join().unwrap());

        lock.exit_write().unwrap();
        lock.enter_read().unwrap();
        lock.exit_read().unwrap();
    }

    #[test]
    fn test_readers_block_writer() {
        let lock = Arc::new(ReaderWriterCoordinator::default());
        lock.enter_read().unwrap();

        let lock_clone = Arc::clone(&lock);
        let writer = thread::spawn(move || {
            lock_clone
                .try_enter_write(Some(Duration::from_millis(50)), None)
                .unwrap()
        });
        assert!(!writer.join().unwrap());

        lock.exit_read().unwrap();
        lock.enter_write().unwrap();
        lock.exit_write().unwrap();
    }

    #[test]
    fn test_writer_proceeds_after_readers_drain() {
        let lock = Arc::new(ReaderWriterCoordinator::default());
        lock.enter_read().unwrap();

        let lock_clone = Arc::clone(&lock);
        let writer = thread::spawn(move || {
            lock_clone.enter_write().unwrap();
            lock_clone.exit_write().unwrap();
        });

        thread::sleep(Duration::from_millis(50));
        lock.exit_read().unwrap();
        writer.join().unwrap();
    }

    #[test]
    fn test_no_recursion_read_then_write_fails_fast() {
        let lock = ReaderWriterCoordinator::new(RecursionPolicy::NoRecursion);
        lock.enter_read().unwrap();

        // Must fail with a reentrancy error, not deadlock.
        let start = Instant::now();
        let result = lock.enter_write();
        assert!(matches!(result, Err(RwLockError::Reentrancy("write"))));
        assert!(start.elapsed() < Duration::from_secs(1));

        lock.exit_read().unwrap();
    }

    #[test]
    fn test_no_recursion_rejects_same_mode_reentry() {
        let lock = ReaderWriterCoordinator::new(RecursionPolicy::NoRecursion);

        lock.enter_read().unwrap();
        assert!(matches!(
            lock.enter_read(),
            Err(RwLockError::Reentrancy("read"))
        ));
        lock.exit_read().unwrap();

        lock.enter_write().unwrap();
        assert!(matches!(
            lock.enter_write(),
            Err(RwLockError::Reentrancy("write"))
        ));
        lock.exit_write().unwrap();
    }

    #[test]
    fn test_recursive_policy_counts_reentry() {
        let lock = ReaderWriterCoordinator::new(RecursionPolicy::Recursive);

        lock.enter_read().unwrap();
        lock.enter_read().unwrap();
        lock.exit_read().unwrap();
        assert!(lock.holds_read());
        lock.exit_read().unwrap();
        assert!(!lock.holds_read());
        assert_eq!(lock.active_reader_count(), 0);

        lock.enter_write().unwrap();
        lock.enter_write().unwrap();
        // Write→read is legal under the recursive policy.
        lock.enter_read().unwrap();
        lock.exit_read().unwrap();
        lock.exit_write().unwrap();
        assert!(lock.holds_write());
        lock.exit_write().unwrap();
        assert!(!lock.holds_write());
    }

    #[test]
    fn test_read_to_write_illegal_even_recursive() {
        let lock = ReaderWriterCoordinator::new(RecursionPolicy::Recursive);
        lock.enter_read().unwrap();
        assert!(matches!(
            lock.enter_write(),
            Err(RwLockError::Reentrancy("write"))
        ));
        lock.exit_read().unwrap();
    }

    #[test]
    fn test_exit_without_hold_fails() {
        let lock = ReaderWriterCoordinator::default();
        assert!(matches!(lock.exit_read(), Err(RwLockError::NotHeld("read"))));
        assert!(matches!(
            lock.exit_write(),
            Err(RwLockError::NotHeld("write"))
        ));
        assert!(matches!(
            lock.exit_upgradeable_read(),
            Err(RwLockError::NotHeld("upgradeable read"))
        ));
    }

    #[test]
    fn test_upgradeable_round_trip_restores_state() {
        let lock = ReaderWriterCoordinator::default();

        lock.enter_upgradeable_read().unwrap();
        assert!(lock.holds_upgradeable());
        assert_eq!(lock.active_reader_count(), 1);

        lock.enter_write().unwrap();
        assert!(lock.holds_write());
        assert_eq!(lock.active_reader_count(), 0);

        lock.exit_write().unwrap();
        assert!(!lock.holds_write());
        assert!(lock.holds_upgradeable());
        assert_eq!(lock.active_reader_count(), 1);

        lock.exit_upgradeable_read().unwrap();
        assert!(!lock.holds_upgradeable());
        assert_eq!(lock.active_reader_count(), 0);

        // The lock is back to its pre-acquire state: both a writer and a
        // fresh upgradeable reader can pass through it.
        lock.enter_write().unwrap();
        lock.exit_write().unwrap();
        lock.enter_upgradeable_read().unwrap();
        lock.exit_upgradeable_read().unwrap();
    }

    #[test]
    fn test_single_upgradeable_holder() {
        let lock = Arc::new(ReaderWriterCoordinator::default());
        lock.enter_upgradeable_read().unwrap();

        let lock_clone = Arc::clone(&lock);
        let second = thread::spawn(move || {
            lock_clone
                .try_enter_upgradeable_read(Some(Duration::from_millis(50)), None)
                .unwrap()
        });
        assert!(!second.join().unwrap());

        lock.exit_upgradeable_read().unwrap();

        let lock_clone = Arc::clone(&lock);
        let third = thread::spawn(move || {
            let entered = lock_clone
                .try_enter_upgradeable_read(Some(Duration::from_secs(5)), None)
                .unwrap();
            if entered {
                lock_clone.exit_upgradeable_read().unwrap();
            }
            entered
        });
        assert!(third.join().unwrap());
    }

    #[test]
    fn test_upgradeable_coexists_with_readers() {
        let lock = Arc::new(ReaderWriterCoordinator::default());
        lock.enter_upgradeable_read().unwrap();

        let lock_clone = Arc::clone(&lock);
        let reader = thread::spawn(move || {
            let entered = lock_clone
                .try_enter_read(Some(Duration::from_secs(5)), None)
                .unwrap();
            if entered {
                lock_clone.exit_read().unwrap();
            }
            entered
        });
        assert!(reader.join().unwrap());

        lock.exit_upgradeable_read().unwrap();
    }

    #[test]
    fn test_upgrade_waits_for_readers_to_drain() {
        let lock = Arc::new(ReaderWriterCoordinator::default());
        lock.enter_upgradeable_read().unwrap();

        let reader_in = Arc::new(AtomicUsize::new(0));
        let lock_reader = Arc::clone(&lock);
        let reader_in_clone = Arc::clone(&reader_in);
        let reader = thread::spawn(move || {
            lock_reader.enter_read().unwrap();
            reader_in_clone.store(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(80));
            lock_reader.exit_read().unwrap();
        });

        // Convert only once the reader is provably inside.
        assert!(crate::SpinBackoff::spin_until(
            || reader_in.load(Ordering::SeqCst) == 1,
            Some(Duration::from_secs(5))
        ));
        let start = Instant::now();
        lock.enter_write().unwrap();
        // The conversion had to wait for the reader to drain.
        assert!(start.elapsed() >= Duration::from_millis(30));
        lock.exit_write().unwrap();
        lock.exit_upgradeable_read().unwrap();

        reader.join().unwrap();
    }

    #[test]
    fn test_upgradeable_to_read_and_back() {
        let lock = ReaderWriterCoordinator::default();
        lock.enter_upgradeable_read().unwrap();
        lock.enter_read().unwrap();
        assert!(lock.holds_read());
        assert!(lock.holds_upgradeable());
        assert_eq!(lock.active_reader_count(), 2);

        lock.exit_read().unwrap();
        assert_eq!(lock.active_reader_count(), 1);
        lock.exit_upgradeable_read().unwrap();
        assert_eq!(lock.active_reader_count(), 0);
    }

    #[test]
    fn test_exit_order_enforced_for_upgrade_write() {
        let lock = ReaderWriterCoordinator::default();
        lock.enter_upgradeable_read().unwrap();
        lock.enter_write().unwrap();

        assert!(matches!(
            lock.exit_upgradeable_read(),
            Err(RwLockError::ExitOrder)
        ));

        lock.exit_write().unwrap();
        lock.exit_upgradeable_read().unwrap();
    }

    #[test]
    fn test_cancellation_aborts_write_wait() {
        let lock = Arc::new(ReaderWriterCoordinator::default());
        lock.enter_read().unwrap();

        let source = CancellationSource::new();
        let token = source.token();
        let lock_clone = Arc::clone(&lock);
        let writer = thread::spawn(move || lock_clone.try_enter_write(None, Some(&token)));

        thread::sleep(Duration::from_millis(50));
        source.cancel(false).unwrap();

        let result = writer.join().unwrap();
        assert!(matches!(result, Err(RwLockError::Canceled)));

        // The abandoned wait flag must not block later readers.
        lock.exit_read().unwrap();
        lock.enter_read().unwrap();
        lock.exit_read().unwrap();
    }

    #[test]
    fn test_write_timeout_rolls_back_wait_flag() {
        let lock = Arc::new(ReaderWriterCoordinator::default());
        lock.enter_read().unwrap();

        let lock_clone = Arc::clone(&lock);
        let writer = thread::spawn(move || {
            lock_clone
                .try_enter_write(Some(Duration::from_millis(50)), None)
                .unwrap()
        });
        assert!(!writer.join().unwrap());

        // A fresh reader must get through after the timeout cleanup.
        let lock_clone = Arc::clone(&lock);
        let reader = thread::spawn(move || {
            let entered = lock_clone
                .try_enter_read(Some(Duration::from_secs(5)), None)
                .unwrap();
            if entered {
                lock_clone.exit_read().unwrap();
            }
            entered
        });
        assert!(reader.join().unwrap());

        lock.exit_read().unwrap();
    }

    #[test]
    fn test_dispose_requires_quiescence() {
        let lock = ReaderWriterCoordinator::default();
        lock.enter_read().unwrap();
        assert!(matches!(lock.dispose(), Err(RwLockError::LockInUse)));

        lock.exit_read().unwrap();
        lock.dispose().unwrap();
        lock.dispose().unwrap(); // Idempotent

        assert!(matches!(lock.enter_read(), Err(RwLockError::Disposed)));
        assert!(matches!(lock.enter_write(), Err(RwLockError::Disposed)));
        assert!(matches!(
            lock.enter_upgradeable_read(),
            Err(RwLockError::Disposed)
        ));
    }

    #[test]
    fn test_mutual_exclusion_under_contention() {
        let lock = Arc::new(ReaderWriterCoordinator::default());
        let readers_inside = Arc::new(AtomicUsize::new(0));
        let writers_inside = Arc::new(AtomicUsize::new(0));
        let thread_count = 6;
        let iterations = 100;

        let mut handles = vec![];
        for id in 0..thread_count {
            let lock = Arc::clone(&lock);
            let readers_inside = Arc::clone(&readers_inside);
            let writers_inside = Arc::clone(&writers_inside);

            handles.push(thread::spawn(move || {
                for i in 0..iterations {
                    if (id + i) % 3 == 0 {
                        lock.enter_write().unwrap();
                        let writers = writers_inside.fetch_add(1, Ordering::SeqCst) + 1;
                        let readers = readers_inside.load(Ordering::SeqCst);
                        assert_eq!(writers, 1);
                        assert_eq!(readers, 0);
                        writers_inside.fetch_sub(1, Ordering::SeqCst);
                        lock.exit_write().unwrap();
                    } else {
                        lock.enter_read().unwrap();
                        readers_inside.fetch_add(1, Ordering::SeqCst);
                        assert_eq!(writers_inside.load(Ordering::SeqCst), 0);
                        readers_inside.fetch_sub(1, Ordering::SeqCst);
                        lock.exit_read().unwrap();
                    }
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(lock.active_reader_count(), 0);
        lock.dispose().unwrap();
    }
}
