use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::Duration;

use crate::processor::ProcessorSet;
use crate::select::{Events, FdSet, PollFd, Pollable, SelInfo, SelScan};
use crate::test_driver::TestDriver;

/// Minimal pollable object: a readiness word plus the embedded selinfo.
struct TestPipe {
    si: SelInfo,
    ready: AtomicU32,
}

impl TestPipe {
    fn new() -> Self {
        Self {
            si: SelInfo::new(),
            ready: AtomicU32::new(0),
        }
    }

    fn ready_events(&self) -> Events {
        Events::from_bits_truncate(self.ready.load(Ordering::Acquire))
    }

    fn make_ready(&self, procs: &ProcessorSet, ev: Events) {
        self.ready.fetch_or(ev.bits(), Ordering::AcqRel);
        self.si.notify(procs, ev);
    }
}

impl Pollable for TestPipe {
    fn poll<'a>(&'a self, scan: &mut SelScan<'a>, interest: Events) -> Events {
        let ev = self.ready_events() & (interest | Events::always());
        if ev.is_empty() {
            scan.record(&self.si);
        }
        ev
    }
}

// record() borrows the selinfo for the scan's lifetime; tests that
// notify from another thread share the pipe through an Arc and poll
// through a reference.

#[test]
fn already_ready_object_returns_without_blocking() {
    let driver = TestDriver::new();
    driver.register_current();
    let procs = ProcessorSet::new(driver.clone(), 1);

    let pipe = TestPipe::new();
    pipe.ready.store(Events::IN.bits(), Ordering::Release);

    let mut fds = [PollFd::new(&pipe, Events::IN)];
    let n = procs.poll(&mut fds, None).unwrap();
    assert_eq!(n, 1);
    assert_eq!(fds[0].revents, Events::IN);
    assert!(!pipe.si.has_waiter());
}

#[test]
fn zero_timeout_is_a_pure_poll() {
    let driver = TestDriver::new();
    driver.register_current();
    let procs = ProcessorSet::new(driver.clone(), 1);

    let pipe = TestPipe::new();
    let mut fds = [PollFd::new(&pipe, Events::IN)];
    let n = procs.poll(&mut fds, Some(0)).unwrap();
    assert_eq!(n, 0);
    assert!(fds[0].revents.is_empty());
    // registration is unwound even on the no-sleep path
    assert!(!pipe.si.has_waiter());
}

#[test]
fn invalid_slot_reports_nval_per_object() {
    let driver = TestDriver::new();
    driver.register_current();
    let procs = ProcessorSet::new(driver.clone(), 1);

    let pipe = TestPipe::new();
    pipe.ready.store(Events::IN.bits(), Ordering::Release);
    let mut fds = [PollFd::invalid(), PollFd::new(&pipe, Events::IN)];
    let n = procs.poll(&mut fds, None).unwrap();
    assert_eq!(n, 2);
    assert_eq!(fds[0].revents, Events::NVAL);
    assert_eq!(fds[1].revents, Events::IN);
}

#[test]
fn deadline_expiry_is_success_with_zero_events() {
    let driver = TestDriver::new();
    driver.register_current();
    let procs = ProcessorSet::new(driver.clone(), 1);

    let pipe = TestPipe::new();
    let mut fds = [PollFd::new(&pipe, Events::IN)];
    let n = procs.poll(&mut fds, Some(30)).unwrap();
    assert_eq!(n, 0);
    assert!(!pipe.si.has_waiter());
}

#[test]
fn signal_interrupts_the_wait() {
    let driver = TestDriver::new();
    driver.register_current();
    let procs = ProcessorSet::new(driver.clone(), 1);

    let pipe = Arc::new(TestPipe::new());
    let p2 = pipe.clone();
    let ps = procs.clone();
    let h = driver.spawn(move || {
        let mut fds = [PollFd::new(&*p2, Events::IN)];
        let res = ps.poll(&mut fds, None);
        assert_eq!(res, Err(crate::errno::Errno::EINTR));
    });
    thread::sleep(Duration::from_millis(20));
    driver.post_signal(h.tid());
    h.join().unwrap();
    assert!(!pipe.si.has_waiter());
}

#[test]
fn notify_wakes_blocked_waiter_directly() {
    let driver = TestDriver::new();
    driver.register_current();
    let procs = ProcessorSet::new(driver.clone(), 1);
    assert!(procs.tunables().direct_select());

    let pipe = Arc::new(TestPipe::new());
    let p2 = pipe.clone();
    let ps = procs.clone();
    let h = driver.spawn(move || {
        let mut fds = [PollFd::new(&*p2, Events::IN | Events::OUT)];
        let n = ps.poll(&mut fds, None).unwrap();
        assert_eq!(n, 1);
        assert_eq!(fds[0].revents, Events::IN);
    });

    // let the waiter get registered and parked
    while !pipe.si.has_waiter() {
        thread::sleep(Duration::from_millis(5));
    }
    thread::sleep(Duration::from_millis(10));
    pipe.make_ready(&procs, Events::IN);
    h.join().unwrap();
    assert!(!pipe.si.has_waiter());
}

#[test]
fn legacy_rescan_mode_still_delivers() {
    let driver = TestDriver::new();
    driver.register_current();
    let procs = ProcessorSet::new(driver.clone(), 1);
    procs
        .tunables()
        .direct_select
        .store(false, Ordering::Relaxed);

    let pipe = Arc::new(TestPipe::new());
    let p2 = pipe.clone();
    let ps = procs.clone();
    let h = driver.spawn(move || {
        let mut fds = [PollFd::new(&*p2, Events::IN)];
        let n = ps.poll(&mut fds, None).unwrap();
        assert_eq!(n, 1);
        assert_eq!(fds[0].revents, Events::IN);
    });

    while !pipe.si.has_waiter() {
        thread::sleep(Duration::from_millis(5));
    }
    thread::sleep(Duration::from_millis(10));
    pipe.make_ready(&procs, Events::IN);
    h.join().unwrap();
}

#[test]
fn collision_wakes_both_waiters() {
    let driver = TestDriver::new();
    driver.register_current();
    let procs = ProcessorSet::new(driver.clone(), 2);

    let pipe = Arc::new(TestPipe::new());
    let mut handles = alloc::vec::Vec::new();
    for cpu in 0..2 {
        let d = driver.clone();
        let p2 = pipe.clone();
        let ps = procs.clone();
        let h = driver.spawn(move || {
            let me = d.register_current();
            d.set_cpu(me, cpu);
            let mut fds = [PollFd::new(&*p2, Events::IN)];
            let n = ps.poll(&mut fds, None).unwrap();
            assert_eq!(n, 1);
        });
        handles.push(h);
    }

    // both threads must be asleep on the object before the event fires
    while !pipe.si.has_waiter() {
        thread::sleep(Duration::from_millis(5));
    }
    thread::sleep(Duration::from_millis(30));
    pipe.make_ready(&procs, Events::IN);

    // neither scanner may starve because the other owns the slot
    for h in handles {
        h.join().unwrap();
    }
    assert!(!pipe.si.has_waiter());
}

#[test]
fn reregistration_is_idempotent() {
    let driver = TestDriver::new();
    driver.register_current();
    let procs = ProcessorSet::new(driver.clone(), 1);

    // the same object scanned through two slots in one call
    let pipe = TestPipe::new();
    let mut fds = [
        PollFd::new(&pipe, Events::IN),
        PollFd::new(&pipe, Events::IN),
    ];
    let n = procs.poll(&mut fds, Some(0)).unwrap();
    assert_eq!(n, 0);
    // one cleanup entry, and the slot is empty after the call
    assert!(!pipe.si.has_waiter());
}

#[test]
fn select_family_maps_bitmask_sets() {
    let driver = TestDriver::new();
    driver.register_current();
    let procs = ProcessorSet::new(driver.clone(), 1);

    let a = TestPipe::new();
    let b = TestPipe::new();
    a.ready.store(Events::IN.bits(), Ordering::Release);
    b.ready.store(Events::OUT.bits(), Ordering::Release);

    let table: [Option<&dyn Pollable>; 3] = [Some(&a), Some(&b), None];
    let mut read = FdSet::new();
    let mut write = FdSet::new();
    let mut except = FdSet::new();
    read.set(0);
    write.set(1);
    read.set(2); // invalid descriptor: flagged, not failed

    let n = procs
        .select(&table, &mut read, &mut write, &mut except, Some(0))
        .unwrap();
    assert_eq!(n, 3);
    assert!(read.is_set(0));
    assert!(write.is_set(1));
    assert!(read.is_set(2));
    assert!(!read.is_set(1));
}

#[test]
fn notify_without_matching_interest_skips_direct_delivery() {
    let driver = TestDriver::new();
    driver.register_current();
    let procs = ProcessorSet::new(driver.clone(), 1);

    let pipe = Arc::new(TestPipe::new());
    let p2 = pipe.clone();
    let ps = procs.clone();
    let h = driver.spawn(move || {
        let mut fds = [PollFd::new(&*p2, Events::IN)];
        // OUT-only readiness must not satisfy an IN waiter
        let n = ps.poll(&mut fds, Some(60)).unwrap();
        assert_eq!(n, 0);
    });

    while !pipe.si.has_waiter() {
        thread::sleep(Duration::from_millis(5));
    }
    pipe.make_ready(&procs, Events::OUT);
    h.join().unwrap();
}
