//! Per-object registration state and the notify side of the protocol.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use bitflags::bitflags;
use spin::Mutex;

use crate::driver::Tid;
use crate::processor::ProcessorSet;

bitflags! {
    /// Readiness classes a pollable object can report.
    pub struct Events: u32 {
        const IN   = 0x0001;
        const PRI  = 0x0002;
        const OUT  = 0x0004;
        const ERR  = 0x0008;
        const HUP  = 0x0010;
        const NVAL = 0x0020;
    }
}

impl Events {
    /// Result classes delivered even when not asked for.
    pub(crate) fn always() -> Events {
        Events::ERR | Events::HUP | Events::NVAL
    }
}

/// A waitable object: sockets, pipes, devices. `poll` reports the subset
/// of `interest` that is ready right now; if nothing is, the object
/// registers the scanning thread by calling [`SelScan::record`] on its
/// embedded [`SelInfo`] before returning empty. The `&'a self` receiver
/// ties the registration to the scan: an object cannot go away while a
/// scan that recorded it is still running.
pub trait Pollable: Send + Sync {
    fn poll<'a>(&'a self, scan: &mut SelScan<'a>, interest: Events) -> Events;
}

// Per-scan state machine values.
pub(crate) const SEL_RESET: u8 = 0; // not scanning / must rescan
pub(crate) const SEL_SCANNING: u8 = 1; // walking the candidate list
pub(crate) const SEL_BLOCKING: u8 = 2; // committed to sleep
pub(crate) const SEL_EVENT: u8 = 3; // events delivered directly

/// State shared between one running multiplexed wait and the objects
/// that may notify it. Objects hold it weakly: a scan that has returned
/// is unreachable, never dangling.
pub(crate) struct ScanShared {
    pub(crate) tid: Tid,
    pub(crate) cluster: usize,
    pub(crate) flag: AtomicU8,
    /// Directly-delivered (slot cookie, events) pairs.
    pub(crate) direct: Mutex<Vec<(u32, Events)>>,
}

impl ScanShared {
    pub(crate) fn new(tid: Tid, cluster: usize) -> Arc<Self> {
        Arc::new(Self {
            tid,
            cluster,
            flag: AtomicU8::new(SEL_RESET),
            direct: Mutex::new(Vec::new()),
        })
    }
}

/// The named waiter registered on an object.
struct WaiterRef {
    tid: Tid,
    cluster: usize,
    cookie: u32,
    interest: Events,
    scan: Weak<ScanShared>,
}

/// Registration record embedded in every pollable object.
///
/// At most one thread — the named waiter — is registered at a time;
/// later scanners leave a collision mark instead and are woken through
/// their cluster. The slot is written by the registering thread and
/// cleared by that thread's cleanup or by object destruction, never by
/// third parties.
pub struct SelInfo {
    slot: Mutex<Option<WaiterRef>>,
    collision: AtomicU64,
}

impl SelInfo {
    pub const fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            collision: AtomicU64::new(0),
        }
    }

    /// The notify operation: called by the object's owner when its
    /// readiness state changes. `events` says which classes fired; an
    /// empty set means "state changed, wake for any interest".
    pub fn notify(&self, procs: &ProcessorSet, events: Events) {
        let driver = &**procs.driver();

        let slot = self.slot.lock();
        if let Some(w) = slot.as_ref() {
            if events.is_empty() || events.intersects(w.interest | Events::always()) {
                let cl = &procs.processor(w.cluster).cluster;
                let _cg = cl.lock();
                if let Some(scan) = w.scan.upgrade() {
                    let direct = procs.tunables.direct_select() && !events.is_empty();
                    match scan.flag.load(Ordering::Acquire) {
                        SEL_SCANNING | SEL_BLOCKING => {
                            if direct {
                                scan.direct.lock().push((w.cookie, events));
                                scan.flag.store(SEL_EVENT, Ordering::Release);
                            } else {
                                // legacy path: force a full rescan
                                scan.flag.store(SEL_RESET, Ordering::Release);
                            }
                            cl.chan.wake_tid(driver, w.tid);
                        }
                        SEL_EVENT => {
                            if direct {
                                scan.direct.lock().push((w.cookie, events));
                            }
                            cl.chan.wake_tid(driver, w.tid);
                        }
                        _ => {}
                    }
                }
            }
        }
        drop(slot);

        // Broadcast to every cluster that collided on this object while
        // it had a named waiter. Their sleepers cannot trust state
        // scanned before the collision, so each cluster's generation is
        // bumped and everyone parked there rescans.
        let mask = self.collision.swap(0, Ordering::AcqRel);
        if mask != 0 {
            log::debug!("selnotify: collision broadcast mask {:#x}", mask);
            for id in 0..procs.len() {
                if mask & (1 << id) != 0 {
                    let cl = &procs.processor(id).cluster;
                    let _g = cl.lock();
                    cl.bump_generation();
                    cl.chan.wake_all(driver);
                }
            }
        }
    }

    /// Whether a named waiter is currently registered.
    pub fn has_waiter(&self) -> bool {
        self.slot.lock().is_some()
    }

    fn clear_if(&self, tid: Tid) {
        let mut slot = self.slot.lock();
        if matches!(slot.as_ref(), Some(w) if w.tid == tid) {
            *slot = None;
        }
    }
}

impl Default for SelInfo {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SelInfo {
    // seldestroy: a dying object must leave no registration behind
    fn drop(&mut self) {
        *self.slot.get_mut() = None;
    }
}

/// Transient per-thread state for one multiplexed wait.
pub struct SelScan<'a> {
    pub(crate) procs: &'a ProcessorSet,
    pub(crate) shared: Arc<ScanShared>,
    /// Objects whose named-waiter slot we claimed; unwound on exit.
    pub(crate) registered: Vec<&'a SelInfo>,
    /// Slot index of the object currently being polled.
    pub(crate) cookie: u32,
    /// Interest of the object currently being polled.
    pub(crate) interest: Events,
}

impl<'a> SelScan<'a> {
    pub(crate) fn new(procs: &'a ProcessorSet, shared: Arc<ScanShared>) -> Self {
        Self {
            procs,
            shared,
            registered: Vec::new(),
            cookie: 0,
            interest: Events::empty(),
        }
    }

    /// Register the scanning thread's interest in `si`'s object.
    ///
    /// First scanner in claims the named-waiter slot; anyone else leaves
    /// a collision mark for its own cluster. Re-registering the same
    /// (object, waiter) pair only refreshes the cookie — the cleanup
    /// list never grows a duplicate entry.
    pub fn record(&mut self, si: &'a SelInfo) {
        let mut slot = si.slot.lock();
        let claim = match slot.as_mut() {
            Some(w) if w.tid == self.shared.tid => {
                w.cookie = self.cookie;
                w.interest = self.interest;
                false
            }
            Some(_) => {
                // someone else is the named waiter; leave a calling card
                // so its notify also wakes our cluster
                let mask = self.procs.processor(self.shared.cluster).cluster.mask();
                si.collision.fetch_or(mask, Ordering::AcqRel);
                false
            }
            None => true,
        };
        if claim {
            *slot = Some(WaiterRef {
                tid: self.shared.tid,
                cluster: self.shared.cluster,
                cookie: self.cookie,
                interest: self.interest,
                scan: Arc::downgrade(&self.shared),
            });
            self.registered.push(si);
        }
    }

    /// selclear: withdraw from every object this scan claimed. The only
    /// way a named-waiter slot empties short of object destruction.
    pub(crate) fn clear(&mut self) {
        for si in self.registered.drain(..) {
            si.clear_if(self.shared.tid);
        }
    }
}

impl Drop for SelScan<'_> {
    fn drop(&mut self) {
        self.clear();
    }
}
