//! Keyed rendezvous for blocked threads.

use alloc::{collections::VecDeque, sync::Arc};
use core::sync::atomic::{AtomicU8, Ordering};

use spin::Mutex;

use crate::driver::{Priority, SchedDriver, Tid};

/// Why a sleep ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepResult {
    /// A wakeup was delivered through the channel.
    Woken,
    /// The deadline passed first.
    Timeout,
    /// A signal arrived first.
    Interrupted,
}

const QUEUED: u8 = 0;
const WOKEN: u8 = 1;
const CANCELLED: u8 = 2;

/// One parked thread. Shared between the queue that holds it and the
/// thread that sleeps on it; the `state` word settles the race between a
/// wakeup and a timeout/signal cancellation.
pub(crate) struct Waiter {
    pub(crate) tid: Tid,
    pub(crate) prio: Priority,
    state: AtomicU8,
}

impl Waiter {
    pub(crate) fn new(tid: Tid, prio: Priority) -> Arc<Self> {
        Arc::new(Self {
            tid,
            prio,
            state: AtomicU8::new(QUEUED),
        })
    }

    /// Mark woken and deliver the park permit. Only the first wake
    /// counts; a cancelled waiter is left alone.
    pub(crate) fn wake(&self, driver: &dyn SchedDriver) -> bool {
        if self
            .state
            .compare_exchange(QUEUED, WOKEN, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            driver.unpark(self.tid);
            true
        } else {
            false
        }
    }

    pub(crate) fn is_woken(&self) -> bool {
        self.state.load(Ordering::Acquire) == WOKEN
    }

    /// QUEUED -> CANCELLED. Fails if a wakeup got there first.
    fn try_cancel(&self) -> bool {
        self.state
            .compare_exchange(QUEUED, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Park until woken. For sleeps that cannot time out or be
    /// interrupted (turnstile hand-off).
    pub(crate) fn park_until_woken(&self, driver: &dyn SchedDriver) {
        while !self.is_woken() {
            driver.park();
        }
    }
}

/// A rendezvous point threads can block on.
///
/// The enqueue-then-park split ([`WaitChannel::prepare_sleep`] /
/// [`SleepToken::block`]) lets a caller publish itself as a waiter while
/// still holding the lock that guards the condition it is waiting for,
/// drop that lock, and only then park — so a wakeup issued between the
/// two cannot be lost.
pub struct WaitChannel {
    name: &'static str,
    queue: Mutex<VecDeque<Arc<Waiter>>>,
}

impl WaitChannel {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            queue: Mutex::new(VecDeque::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Enqueue the calling thread. The returned token must be blocked on
    /// (or dropped, which cancels the sleep).
    #[must_use]
    pub fn prepare_sleep(&self, driver: &dyn SchedDriver) -> SleepToken<'_> {
        let tid = driver.current();
        let waiter = Waiter::new(tid, driver.priority(tid));
        self.queue.lock().push_back(waiter.clone());
        SleepToken {
            chan: self,
            waiter,
            done: false,
        }
    }

    /// Wake the longest-waiting thread. Returns whether one was woken.
    pub fn wake_one(&self, driver: &dyn SchedDriver) -> bool {
        let mut q = self.queue.lock();
        while let Some(w) = q.pop_front() {
            if w.wake(driver) {
                return true;
            }
        }
        false
    }

    /// Wake every thread on the channel. Returns how many were woken.
    pub fn wake_all(&self, driver: &dyn SchedDriver) -> usize {
        let mut q = self.queue.lock();
        let mut woken = 0;
        while let Some(w) = q.pop_front() {
            if w.wake(driver) {
                woken += 1;
            }
        }
        woken
    }

    /// Wake a specific thread if it is queued here.
    pub fn wake_tid(&self, driver: &dyn SchedDriver, tid: Tid) -> bool {
        let mut q = self.queue.lock();
        if let Some(pos) = q.iter().position(|w| w.tid == tid) {
            let w = q.remove(pos).unwrap();
            return w.wake(driver);
        }
        false
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    fn remove(&self, waiter: &Arc<Waiter>) {
        let mut q = self.queue.lock();
        q.retain(|w| !Arc::ptr_eq(w, waiter));
    }
}

/// A pending sleep produced by [`WaitChannel::prepare_sleep`].
#[must_use = "a prepared sleep does nothing until blocked on"]
pub struct SleepToken<'a> {
    chan: &'a WaitChannel,
    waiter: Arc<Waiter>,
    done: bool,
}

impl SleepToken<'_> {
    /// Park until woken, until `deadline` (ticks) if one is given, or —
    /// when `catch_signals` is set — until a signal is pending.
    pub fn block(
        mut self,
        driver: &dyn SchedDriver,
        deadline: Option<u64>,
        catch_signals: bool,
    ) -> SleepResult {
        self.done = true;
        loop {
            if self.waiter.is_woken() {
                return SleepResult::Woken;
            }
            if catch_signals && driver.signal_pending(self.waiter.tid) {
                return self.finish(SleepResult::Interrupted);
            }
            match deadline {
                None => driver.park(),
                Some(d) => {
                    if !driver.park_deadline(d) {
                        return self.finish(SleepResult::Timeout);
                    }
                }
            }
        }
    }

    /// Settle a timeout/interrupt against a racing wakeup: whoever flips
    /// the waiter state first wins, and a lost race reports `Woken`.
    fn finish(&self, result: SleepResult) -> SleepResult {
        if self.waiter.try_cancel() {
            self.chan.remove(&self.waiter);
            result
        } else {
            SleepResult::Woken
        }
    }
}

impl Drop for SleepToken<'_> {
    fn drop(&mut self) {
        if !self.done {
            // Sleep abandoned before blocking; withdraw quietly.
            if self.waiter.try_cancel() {
                self.chan.remove(&self.waiter);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_driver::TestDriver;
    use alloc::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn wake_before_block_is_not_lost() {
        let driver = TestDriver::new();
        let d = driver.clone();
        let chan = Arc::new(WaitChannel::new("test"));
        let c = chan.clone();

        let waiter = driver.spawn(move || {
            let token = c.prepare_sleep(&*d);
            // wakeup may land before we park
            thread::sleep(Duration::from_millis(20));
            assert_eq!(token.block(&*d, None, false), SleepResult::Woken);
        });

        thread::sleep(Duration::from_millis(5));
        while !chan.wake_one(&*driver) {
            thread::yield_now();
        }
        waiter.join().unwrap();
    }

    #[test]
    fn deadline_expires_without_wakeup() {
        let driver = TestDriver::new();
        driver.register_current();
        let chan = WaitChannel::new("test");
        let token = chan.prepare_sleep(&*driver);
        let deadline = driver.now() + 10;
        assert_eq!(token.block(&*driver, Some(deadline), false), SleepResult::Timeout);
        assert!(chan.is_empty());
    }

    #[test]
    fn signal_interrupts_sleep() {
        let driver = TestDriver::new();
        let d = driver.clone();
        let chan = Arc::new(WaitChannel::new("test"));
        let c = chan.clone();

        let waiter = driver.spawn(move || {
            let token = c.prepare_sleep(&*d);
            assert_eq!(token.block(&*d, None, true), SleepResult::Interrupted);
        });
        let tid = waiter.tid();
        thread::sleep(Duration::from_millis(10));
        driver.post_signal(tid);
        waiter.join().unwrap();
        assert!(chan.is_empty());
    }

    #[test]
    fn wake_all_resumes_every_waiter() {
        let driver = TestDriver::new();
        let chan = Arc::new(WaitChannel::new("test"));
        let mut handles = alloc::vec::Vec::new();
        for _ in 0..4 {
            let d = driver.clone();
            let c = chan.clone();
            handles.push(driver.spawn(move || {
                let token = c.prepare_sleep(&*d);
                assert_eq!(token.block(&*d, None, false), SleepResult::Woken);
            }));
        }
        // wait until all four are queued
        loop {
            thread::sleep(Duration::from_millis(5));
            if chan.queue.lock().len() == 4 {
                break;
            }
        }
        assert_eq!(chan.wake_all(&*driver), 4);
        for h in handles {
            h.join().unwrap();
        }
    }
}
