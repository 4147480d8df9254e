//! Cross-thread properties of the byte-range lock table.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rand::{Rng, SeedableRng};

use kernel_sync::config::Tunables;
use kernel_sync::errno::Errno;
use kernel_sync::lockf::{LockFlags, LockMode, LockRange, LockTable, OwnerId, ResourceId};
use kernel_sync_fuse::ThreadDriver;

const R1: ResourceId = ResourceId(1);
const R2: ResourceId = ResourceId(2);

fn rng_range(rng: &mut impl Rng) -> LockRange {
    let start = rng.gen_range(0..200u64);
    LockRange::new(start, start + rng.gen_range(1..40))
}

/// Two owners holding one resource each and requesting the
/// other's must not hang — one side reports a deadlock.
#[test]
fn crossing_requests_report_deadlock() {
    let driver = ThreadDriver::new();
    driver.register_current();
    let table = Arc::new(LockTable::new(driver.clone(), &Tunables::new()));
    let wait = LockFlags::WAIT | LockFlags::DETECT;
    let range = LockRange::new(0, 10);

    table
        .set_lock(R1, OwnerId(1), LockMode::Exclusive, range, wait)
        .unwrap();

    let t2 = table.clone();
    let h = driver.spawn(move || {
        t2.set_lock(R2, OwnerId(2), LockMode::Exclusive, range, wait)
            .unwrap();
        // blocks behind owner 1 on R1 until the cycle is broken
        let res = t2.set_lock(R1, OwnerId(2), LockMode::Exclusive, range, wait);
        assert!(res.is_ok());
    });

    while !driver.is_parked(h.tid()) {
        thread::sleep(Duration::from_millis(2));
    }

    // closing the cycle from this side must fail fast, not hang
    let res = table.set_lock(R2, OwnerId(1), LockMode::Exclusive, range, wait);
    assert_eq!(res, Err(Errno::EDEADLK));

    table.clear_lock(R1, OwnerId(1), range).unwrap();
    h.join().unwrap();
}

/// The soft budget refuses fresh non-mergeable ranges, and
/// unlocking under the same load never fails.
#[test]
fn budget_refusal_and_unlock_exemption_under_load() {
    let driver = ThreadDriver::new();
    driver.register_current();
    let mut tn = Tunables::new();
    tn.max_locks_per_owner = 8;
    let table = Arc::new(LockTable::new(driver.clone(), &tn));
    let owner = OwnerId(7);

    // fill the budget with disjoint, non-mergeable ranges
    for i in 0..8u64 {
        table
            .set_lock(
                R1,
                owner,
                LockMode::Exclusive,
                LockRange::new(i * 10, i * 10 + 5),
                LockFlags::empty(),
            )
            .unwrap();
    }
    assert_eq!(
        table.set_lock(
            R1,
            owner,
            LockMode::Exclusive,
            LockRange::new(100, 105),
            LockFlags::empty()
        ),
        Err(Errno::ENOLCK)
    );

    // unlocking, including splits, always goes through
    for i in 0..8u64 {
        table
            .clear_lock(R1, owner, LockRange::new(i * 10 + 2, i * 10 + 3))
            .unwrap();
    }
    assert_eq!(table.owner_records(owner), 16);
    table.clear_lock(R1, owner, LockRange::to_eof(0)).unwrap();
    assert_eq!(table.owner_records(owner), 0);
}

/// Under real contention — waiting requests, random ranges,
/// random unlocks — the stored list never holds a conflicting overlap.
#[test]
fn contended_workload_keeps_the_range_invariant() {
    const OWNERS: usize = 4;
    const ROUNDS: usize = 150;

    let driver = ThreadDriver::new();
    driver.register_current();
    let table = Arc::new(LockTable::new(driver.clone(), &Tunables::new()));

    let mut handles = Vec::new();
    for i in 0..OWNERS {
        let table = table.clone();
        handles.push(driver.spawn(move || {
            let owner = OwnerId(i as u64 + 1);
            let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed + i as u64);
            for _ in 0..ROUNDS {
                let range = rng_range(&mut rng);
                let mode = if rng.gen_bool(0.6) {
                    LockMode::Shared
                } else {
                    LockMode::Exclusive
                };
                if rng.gen_bool(0.35) {
                    table.clear_lock(R1, owner, range).unwrap();
                } else {
                    // DETECT keeps accidental wait cycles bounded
                    let _ = table.set_lock(
                        R1,
                        owner,
                        mode,
                        range,
                        LockFlags::WAIT | LockFlags::DETECT,
                    );
                }
            }
            table.clear_owner(owner);
        }));
    }

    for h in handles {
        h.join().unwrap();
    }

    assert!(table.records(R1).is_empty());
    for i in 0..OWNERS {
        assert_eq!(table.owner_records(OwnerId(i as u64 + 1)), 0);
    }
}

/// End to end: interior unlock splits, same-mode relock of
/// the hole restores exactly the original record.
#[test]
fn split_then_rejoin_restores_the_original_record() {
    let driver = ThreadDriver::new();
    driver.register_current();
    let table = LockTable::new(driver.clone(), &Tunables::new());
    let owner = OwnerId(1);

    table
        .set_lock(R1, owner, LockMode::Exclusive, LockRange::new(0, 100), LockFlags::empty())
        .unwrap();
    table
        .set_lock(R1, owner, LockMode::Exclusive, LockRange::new(20, 30), LockFlags::empty())
        .unwrap();
    let recs = table.records(R1);
    assert_eq!(recs.len(), 1, "covered relock must not split");

    table.clear_lock(R1, owner, LockRange::new(20, 30)).unwrap();
    assert_eq!(table.records(R1).len(), 2);

    table
        .set_lock(R1, owner, LockMode::Exclusive, LockRange::new(20, 30), LockFlags::empty())
        .unwrap();
    let recs = table.records(R1);
    assert_eq!(recs.len(), 1);
    assert_eq!(recs[0].range, LockRange::new(0, 100));
}
