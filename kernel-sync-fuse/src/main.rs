//! Stress/demo tool: drives the blocking primitives on OS threads.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::{App, Arg};
use rand::{Rng, SeedableRng};

use kernel_sync::blocking::Mutex;
use kernel_sync::config::Tunables;
use kernel_sync::lockf::{LockFlags, LockMode, LockRange, LockTable, OwnerId, ResourceId};
use kernel_sync::processor::ProcessorSet;
use kernel_sync::select::{Events, PollFd, Pollable, SelInfo, SelScan};

use kernel_sync_fuse::{logger, ThreadDriver};

fn main() {
    logger::init();
    let matches = App::new("KernelSyncFuse")
        .arg(
            Arg::with_name("scenario")
                .short("s")
                .long("scenario")
                .takes_value(true)
                .help("Scenario to run: mutex | select | lockf | all"),
        )
        .arg(
            Arg::with_name("threads")
                .short("t")
                .long("threads")
                .takes_value(true)
                .help("Worker thread count"),
        )
        .arg(
            Arg::with_name("rounds")
                .short("r")
                .long("rounds")
                .takes_value(true)
                .help("Rounds per worker"),
        )
        .arg(
            Arg::with_name("seed")
                .long("seed")
                .takes_value(true)
                .help("RNG seed for the lockf workload"),
        )
        .get_matches();

    let scenario = matches.value_of("scenario").unwrap_or("all");
    let threads: usize = matches
        .value_of("threads")
        .unwrap_or("8")
        .parse()
        .expect("bad thread count");
    let rounds: usize = matches
        .value_of("rounds")
        .unwrap_or("1000")
        .parse()
        .expect("bad round count");
    let seed: u64 = matches
        .value_of("seed")
        .unwrap_or("42")
        .parse()
        .expect("bad seed");

    match scenario {
        "mutex" => mutex_stress(threads, rounds),
        "select" => select_stress(threads, rounds),
        "lockf" => lockf_stress(threads, rounds, seed),
        "all" => {
            mutex_stress(threads, rounds);
            select_stress(threads, rounds);
            lockf_stress(threads, rounds, seed);
        }
        other => {
            eprintln!("unknown scenario {:?}", other);
            std::process::exit(1);
        }
    }
}

/// Hammer one adaptive mutex from every worker and check the count.
fn mutex_stress(threads: usize, rounds: usize) {
    println!("mutex: {} threads x {} rounds", threads, rounds);
    let driver = ThreadDriver::new();
    driver.register_current();
    let m = Arc::new(Mutex::new(driver.clone(), 0u64));

    let mut handles = Vec::new();
    for _ in 0..threads {
        let m = m.clone();
        handles.push(driver.spawn(move || {
            for _ in 0..rounds {
                *m.lock() += 1;
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    let total = *m.lock();
    assert_eq!(total, (threads * rounds) as u64);
    println!("mutex: ok, counted {}", total);
}

struct Pipe {
    si: SelInfo,
    ready: AtomicU32,
}

impl Pipe {
    fn new() -> Self {
        Self {
            si: SelInfo::new(),
            ready: AtomicU32::new(0),
        }
    }

    fn push(&self, procs: &ProcessorSet) {
        self.ready.fetch_or(Events::IN.bits(), Ordering::AcqRel);
        self.si.notify(procs, Events::IN);
    }

    fn drain(&self) {
        self.ready.store(0, Ordering::Release);
    }
}

impl Pollable for Pipe {
    fn poll<'a>(&'a self, scan: &mut SelScan<'a>, interest: Events) -> Events {
        let ev = Events::from_bits_truncate(self.ready.load(Ordering::Acquire))
            & (interest | Events::ERR | Events::HUP);
        if ev.is_empty() {
            scan.record(&self.si);
        }
        ev
    }
}

/// One consumer multiplexed over a pipe per producer.
fn select_stress(producers: usize, rounds: usize) {
    println!("select: {} producers x {} rounds", producers, rounds);
    let driver = ThreadDriver::new();
    driver.register_current();
    let procs = ProcessorSet::new(driver.clone(), 4);

    let pipes: Arc<Vec<Pipe>> = Arc::new((0..producers).map(|_| Pipe::new()).collect());
    let stop = Arc::new(AtomicBool::new(false));

    let consumer = {
        let pipes = pipes.clone();
        let procs = procs.clone();
        let stop = stop.clone();
        driver.spawn(move || {
            let mut consumed = 0u64;
            while !stop.load(Ordering::Acquire) {
                let mut fds: Vec<PollFd> = pipes
                    .iter()
                    .map(|p| PollFd::new(p, Events::IN))
                    .collect();
                let n = procs.poll(&mut fds, Some(50)).unwrap();
                if n > 0 {
                    for (fd, pipe) in fds.iter().zip(pipes.iter()) {
                        if fd.revents.contains(Events::IN) {
                            pipe.drain();
                            consumed += 1;
                        }
                    }
                }
            }
            println!("select: consumer saw {} readiness events", consumed);
        })
    };

    let mut handles = Vec::new();
    for i in 0..producers {
        let pipes = pipes.clone();
        let procs = procs.clone();
        handles.push(driver.spawn(move || {
            for _ in 0..rounds {
                pipes[i].push(&procs);
                thread::sleep(Duration::from_micros(200));
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    thread::sleep(Duration::from_millis(100));
    stop.store(true, Ordering::Release);
    consumer.join().unwrap();
    println!("select: ok");
}

/// Random set/clear workload, then verify the stored-record invariant.
fn lockf_stress(threads: usize, rounds: usize, seed: u64) {
    println!("lockf: {} owners x {} rounds (seed {})", threads, rounds, seed);
    let driver = ThreadDriver::new();
    driver.register_current();
    let table = Arc::new(LockTable::new(driver.clone(), &Tunables::new()));

    let mut handles = Vec::new();
    for i in 0..threads {
        let table = table.clone();
        handles.push(driver.spawn(move || {
            let owner = OwnerId(i as u64 + 1);
            let mut rng = rand::rngs::StdRng::seed_from_u64(seed ^ (i as u64));
            for _ in 0..rounds {
                let res = ResourceId(rng.gen_range(0..4));
                let start = rng.gen_range(0..900u64);
                let range = LockRange::new(start, start + rng.gen_range(1..100));
                let mode = if rng.gen_bool(0.5) {
                    LockMode::Shared
                } else {
                    LockMode::Exclusive
                };
                if rng.gen_bool(0.3) {
                    table.clear_lock(res, owner, range).unwrap();
                } else {
                    // non-blocking on purpose: EAGAIN is expected noise
                    let _ = table.set_lock(res, owner, mode, range, LockFlags::empty());
                }
            }
            table.clear_owner(owner);
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    for r in 0..4 {
        let recs = table.records(ResourceId(r));
        assert!(recs.is_empty(), "records left on resource {}: {:?}", r, recs);
    }
    println!("lockf: ok");
}
