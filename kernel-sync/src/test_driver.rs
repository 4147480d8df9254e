//! Host-side [`SchedDriver`] for unit tests: threads are OS threads,
//! park/unpark map onto `std::thread`, the clock ticks in milliseconds.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, Thread};
use std::time::{Duration, Instant};

use crate::driver::{Priority, SchedDriver, Tid};
use crate::ipl::Ipl;

// Registrations are per driver instance; the thread local remembers
// which driver it belongs to so one thread can move between drivers.
static DRIVER_IDS: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static CURRENT: Cell<(u64, usize)> = Cell::new((u64::MAX, usize::MAX));
}

const DEFAULT_PRIO: Priority = 50;

struct ThreadSlot {
    thread: Thread,
    parked: AtomicBool,
    prio: AtomicU8,
    signal: AtomicBool,
    ipl: AtomicU8,
    cpu: AtomicUsize,
}

pub(crate) struct TestDriver {
    id: u64,
    start: Instant,
    slots: Mutex<Vec<Arc<ThreadSlot>>>,
    /// When false, every thread reports off-processor, which forces the
    /// adaptive mutex onto its sleep path.
    spin_allowed: AtomicBool,
}

impl TestDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: DRIVER_IDS.fetch_add(1, Ordering::Relaxed),
            start: Instant::now(),
            slots: Mutex::new(Vec::new()),
            spin_allowed: AtomicBool::new(true),
        })
    }

    /// Register the calling thread, idempotently.
    pub fn register_current(&self) -> Tid {
        let (driver, tid) = CURRENT.with(|c| c.get());
        if driver == self.id {
            return Tid(tid);
        }
        let mut slots = self.slots.lock().unwrap();
        let id = slots.len();
        slots.push(Arc::new(ThreadSlot {
            thread: thread::current(),
            parked: AtomicBool::new(false),
            prio: AtomicU8::new(DEFAULT_PRIO),
            signal: AtomicBool::new(false),
            ipl: AtomicU8::new(Ipl::None as u8),
            cpu: AtomicUsize::new(0),
        }));
        CURRENT.with(|c| c.set((self.id, id)));
        Tid(id)
    }

    /// Spawn a thread registered with the driver; `f` runs after
    /// registration so the body can use driver calls immediately.
    pub fn spawn<F>(self: &Arc<Self>, f: F) -> TestThread
    where
        F: FnOnce() + Send + 'static,
    {
        let driver = self.clone();
        let (tx, rx) = mpsc::channel();
        let handle = thread::spawn(move || {
            let tid = driver.register_current();
            tx.send(tid).unwrap();
            f();
        });
        let tid = rx.recv().unwrap();
        TestThread { handle, tid }
    }

    fn slot(&self, tid: Tid) -> Option<Arc<ThreadSlot>> {
        self.slots.lock().unwrap().get(tid.0).cloned()
    }

    fn current_slot(&self) -> Arc<ThreadSlot> {
        let tid = self.register_current();
        self.slot(tid).unwrap()
    }

    pub fn set_spin_allowed(&self, allowed: bool) {
        self.spin_allowed.store(allowed, Ordering::Relaxed);
    }

    pub fn set_priority(&self, tid: Tid, prio: Priority) {
        if let Some(s) = self.slot(tid) {
            s.prio.store(prio, Ordering::Relaxed);
        }
    }

    pub fn set_cpu(&self, tid: Tid, cpu: usize) {
        if let Some(s) = self.slot(tid) {
            s.cpu.store(cpu, Ordering::Relaxed);
        }
    }

    /// Post a signal: mark pending and deliver the wakeup permit, per
    /// the driver contract.
    pub fn post_signal(&self, tid: Tid) {
        if let Some(s) = self.slot(tid) {
            s.signal.store(true, Ordering::Release);
            s.thread.unpark();
        }
    }

    pub fn clear_signal(&self, tid: Tid) {
        if let Some(s) = self.slot(tid) {
            s.signal.store(false, Ordering::Release);
        }
    }

    pub fn current_ipl(&self) -> Ipl {
        Ipl::from_raw(self.current_slot().ipl.load(Ordering::Relaxed)).unwrap()
    }
}

impl SchedDriver for TestDriver {
    fn current(&self) -> Tid {
        self.register_current()
    }

    fn current_cpu(&self) -> usize {
        self.current_slot().cpu.load(Ordering::Relaxed)
    }

    fn priority(&self, tid: Tid) -> Priority {
        self.slot(tid)
            .map(|s| s.prio.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn on_cpu(&self, tid: Tid) -> bool {
        if !self.spin_allowed.load(Ordering::Relaxed) {
            return false;
        }
        self.slot(tid)
            .map(|s| !s.parked.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    fn park(&self) {
        let slot = self.current_slot();
        slot.parked.store(true, Ordering::Release);
        thread::park();
        slot.parked.store(false, Ordering::Release);
    }

    fn park_deadline(&self, deadline: u64) -> bool {
        let now = self.now();
        if now >= deadline {
            return false;
        }
        let slot = self.current_slot();
        slot.parked.store(true, Ordering::Release);
        thread::park_timeout(Duration::from_millis(deadline - now));
        slot.parked.store(false, Ordering::Release);
        self.now() < deadline
    }

    fn unpark(&self, tid: Tid) {
        if let Some(s) = self.slot(tid) {
            s.thread.unpark();
        }
    }

    fn now(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    fn signal_pending(&self, tid: Tid) -> bool {
        self.slot(tid)
            .map(|s| s.signal.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    fn splraise(&self, ipl: Ipl) -> Ipl {
        let slot = self.current_slot();
        let prev = Ipl::from_raw(slot.ipl.load(Ordering::Relaxed)).unwrap();
        if ipl > prev {
            slot.ipl.store(ipl as u8, Ordering::Relaxed);
        }
        prev
    }

    fn splx(&self, ipl: Ipl) {
        self.current_slot().ipl.store(ipl as u8, Ordering::Relaxed);
    }
}

pub(crate) struct TestThread {
    handle: JoinHandle<()>,
    tid: Tid,
}

impl TestThread {
    pub fn tid(&self) -> Tid {
        self.tid
    }

    pub fn join(self) -> thread::Result<()> {
        self.handle.join()
    }
}
