//! Cross-thread properties of the adaptive mutex.

use std::sync::{Arc, Mutex as StdMutex};
use std::thread;
use std::time::Duration;

use rand::{Rng, SeedableRng};

use kernel_sync::blocking::Mutex;
use kernel_sync_fuse::ThreadDriver;

/// Mutual exclusion under randomized hold and think times, on both the
/// spin-leaning and sleep-only paths.
#[test]
fn mutual_exclusion_with_random_interleavings() {
    for &spin in &[true, false] {
        let driver = ThreadDriver::new();
        driver.register_current();
        driver.set_spin_allowed(spin);

        let m = Arc::new(Mutex::new(driver.clone(), (0u64, false)));
        let mut handles = Vec::new();
        for i in 0..6 {
            let m = m.clone();
            handles.push(driver.spawn(move || {
                let mut rng = rand::rngs::StdRng::seed_from_u64(0xb10c + i);
                for _ in 0..300 {
                    {
                        let mut g = m.lock();
                        assert!(!g.1, "second thread inside the critical section");
                        g.1 = true;
                        if rng.gen_bool(0.05) {
                            thread::sleep(Duration::from_micros(rng.gen_range(1..200)));
                        }
                        g.0 += 1;
                        g.1 = false;
                    }
                    if rng.gen_bool(0.05) {
                        thread::yield_now();
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(m.lock().0, 6 * 300);
    }
}

/// If a thread is blocked in `lock` when the holder releases, it must
/// become runnable and acquire — over many handoffs, on the sleep path.
#[test]
fn release_never_loses_a_blocked_waiter() {
    let driver = ThreadDriver::new();
    driver.register_current();
    driver.set_spin_allowed(false); // every contender sleeps

    let m = Arc::new(Mutex::new(driver.clone(), 0u64));
    let mut handles = Vec::new();
    for _ in 0..4 {
        let m = m.clone();
        handles.push(driver.spawn(move || {
            for _ in 0..2000 {
                *m.lock() += 1;
            }
        }));
    }
    // a hang here means a wakeup fell on the floor
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(*m.lock(), 4 * 2000);
}

/// The turnstile hands the lock to the highest-priority waiter.
#[test]
fn handoff_prefers_the_higher_priority_waiter() {
    let driver = ThreadDriver::new();
    driver.register_current();
    driver.set_spin_allowed(false);

    let m = Arc::new(Mutex::new(driver.clone(), ()));
    let order: Arc<StdMutex<Vec<u8>>> = Arc::new(StdMutex::new(Vec::new()));

    let g = m.lock();

    let mut waiters = Vec::new();
    for &prio in &[10u8, 90, 40] {
        let m = m.clone();
        let order = order.clone();
        let d = driver.clone();
        let h = driver.spawn(move || {
            let me = d.register_current();
            d.set_priority(me, prio);
            let _g = m.lock();
            order.lock().unwrap().push(prio);
        });
        // wait until this waiter is parked before adding the next, so
        // every priority is represented in the turnstile at release time
        while !driver.is_parked(h.tid()) {
            thread::sleep(Duration::from_millis(2));
        }
        waiters.push(h);
    }

    drop(g);
    for h in waiters {
        h.join().unwrap();
    }
    assert_eq!(*order.lock().unwrap(), vec![90, 40, 10]);
}
