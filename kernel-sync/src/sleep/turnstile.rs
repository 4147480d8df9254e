//! Priority-ordered waiter list for the adaptive mutex.
//!
//! Each adaptive mutex owns one turnstile. Blocking and hand-off run
//! under the turnstile's own spin lock so the mutex can couple "set the
//! waiters flag" and "join the queue" into one critical section. The
//! owner back-reference is a plain [`Tid`] — relation-only, used to lend
//! the top waiter's priority to whoever holds the lock.

use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::{Mutex, MutexGuard};

use crate::driver::{SchedDriver, Tid};
use crate::sleep::Waiter;

pub struct Turnstile {
    inner: Mutex<TsInner>,
    /// Waiter count mirrored outside the lock, for destroy-time checks.
    count: AtomicUsize,
}

pub(crate) struct TsInner {
    /// Sorted by descending priority; FIFO within a priority.
    waiters: Vec<Arc<Waiter>>,
    owner: Option<Tid>,
}

impl Turnstile {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(TsInner {
                waiters: Vec::new(),
                owner: None,
            }),
            count: AtomicUsize::new(0),
        }
    }

    pub(crate) fn enter(&self) -> TurnstileGuard<'_> {
        TurnstileGuard {
            ts: self,
            inner: self.inner.lock(),
        }
    }

    /// Whether any thread is blocked here. Racy by nature; callers use it
    /// only for destroy-time diagnostics.
    pub fn has_waiters(&self) -> bool {
        self.count.load(Ordering::Acquire) != 0
    }
}

pub(crate) struct TurnstileGuard<'a> {
    ts: &'a Turnstile,
    inner: MutexGuard<'a, TsInner>,
}

impl TurnstileGuard<'_> {
    /// Join the queue as the calling thread and lend priority to the
    /// owner if the queue head now outranks it.
    pub(crate) fn insert(&mut self, driver: &dyn SchedDriver, owner: Tid) -> Arc<Waiter> {
        let tid = driver.current();
        debug_assert!(
            !self.inner.waiters.iter().any(|w| w.tid == tid),
            "{} blocked in two turnstiles",
            tid
        );

        let waiter = Waiter::new(tid, driver.priority(tid));
        let pos = self
            .inner
            .waiters
            .iter()
            .position(|w| w.prio < waiter.prio)
            .unwrap_or(self.inner.waiters.len());
        self.inner.waiters.insert(pos, waiter.clone());
        self.ts.count.fetch_add(1, Ordering::AcqRel);
        self.inner.owner = Some(owner);

        let head_prio = self.inner.waiters[0].prio;
        if head_prio > driver.priority(owner) {
            log::debug!("turnstile: lend prio {} to {}", head_prio, owner);
            driver.lend_priority(owner, Some(head_prio));
        }
        waiter
    }

    /// Hand off to the highest-priority waiter. Returns whether more
    /// waiters remain after the wakeup.
    pub(crate) fn wake_highest(&mut self, driver: &dyn SchedDriver) -> bool {
        if let Some(owner) = self.inner.owner.take() {
            driver.lend_priority(owner, None);
        }
        while !self.inner.waiters.is_empty() {
            let w = self.inner.waiters.remove(0);
            self.ts.count.fetch_sub(1, Ordering::AcqRel);
            if w.wake(driver) {
                break;
            }
        }
        !self.inner.waiters.is_empty()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.inner.waiters.is_empty()
    }
}
