//! The seam between the blocking primitives and the rest of the kernel.
//!
//! Everything the primitives need from their surroundings — thread
//! identity, the run state of other threads, park/unpark, the clock,
//! pending-signal state, interrupt priority — comes through
//! [`SchedDriver`]. The kernel proper implements it once at bring-up;
//! the host-side fuse harness implements it on OS threads.

use alloc::sync::Arc;
use core::fmt;

use crate::ipl::Ipl;

/// Identity of a kernel execution context.
///
/// Relation-only: holding a `Tid` confers no ownership of the thread it
/// names, and a stale `Tid` must be tolerated by every driver operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tid(pub usize);

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tid{}", self.0)
    }
}

/// Scheduling priority. Larger values win turnstile hand-off.
pub type Priority = u8;

/// Services provided by the scheduler and platform.
///
/// # Park/unpark contract
///
/// `unpark` delivers a one-shot permit; a permit delivered before `park`
/// makes the next `park` return immediately, and permits do not stack.
/// `park` may also return spuriously, so parkers re-check their wakeup
/// predicate in a loop. A driver that posts a signal to a thread must
/// also `unpark` it, so interruptible sleeps can observe the signal.
pub trait SchedDriver: Send + Sync {
    /// Identity of the calling thread.
    fn current(&self) -> Tid;

    /// Index of the processor the calling thread is executing on.
    fn current_cpu(&self) -> usize {
        0
    }

    /// Scheduling priority of `tid`.
    fn priority(&self, tid: Tid) -> Priority;

    /// Whether `tid` is presently executing on some processor. Used to
    /// decide between spinning and sleeping; a stale answer is tolerated,
    /// a dangling one is not.
    fn on_cpu(&self, tid: Tid) -> bool;

    /// Block the calling thread until a permit arrives.
    fn park(&self);

    /// Block until a permit arrives or the clock reaches `deadline`
    /// (ticks, same scale as [`SchedDriver::now`]). Returns `false` once
    /// the deadline has passed.
    fn park_deadline(&self, deadline: u64) -> bool;

    /// Deliver a wakeup permit to `tid`.
    fn unpark(&self, tid: Tid);

    /// Current time in ticks.
    fn now(&self) -> u64;

    /// Whether `tid` has an unhandled signal pending.
    fn signal_pending(&self, tid: Tid) -> bool;

    /// Raise the calling processor's interrupt priority to at least
    /// `ipl` and return the previous level.
    fn splraise(&self, ipl: Ipl) -> Ipl;

    /// Restore a previously returned interrupt priority.
    fn splx(&self, ipl: Ipl);

    /// Lend `prio` to `tid` (priority propagation from a turnstile), or
    /// cancel the loan with `None`. Optional.
    fn lend_priority(&self, _tid: Tid, _prio: Option<Priority>) {}

    /// Whether `tid` currently holds the big coarse-grained kernel lock.
    fn holds_big_lock(&self, _tid: Tid) -> bool {
        false
    }

    /// Whether `tid` is spinning to acquire the big kernel lock.
    fn wants_big_lock(&self, _tid: Tid) -> bool {
        false
    }
}

/// Shared handle to the platform driver.
pub type DriverRef = Arc<dyn SchedDriver>;
