//! Advisory byte-range record locks.
//!
//! Each lockable resource carries an ordered list of non-overlapping
//! lock records. A request overlapping foreign records either fails,
//! or blocks on the first conflicting record's wait channel and re-runs
//! the whole overlap resolution when that record changes. Requests
//! overlapping the caller's own records are resolved by the six-way
//! overlap classification: absorb, replace, shrink head or tail, or
//! split the stored record around the new one. Unlocking reuses the
//! same classification to subtract the cleared range.
//!
//! The table is serialized by a single table-wide lock — contention on
//! one file's byte-range locks is rare, so finer sharding buys nothing.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;

use crate::config::Tunables;
use crate::driver::DriverRef;
use crate::errno::Errno;
use crate::sleep::{SleepResult, WaitChannel};
use crate::spin_lock::KSpinLock;

/// Lock-owner identity. One per process for fcntl-style owners; the
/// deadlock chain walk assumes one blocking request per owner at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OwnerId(pub u64);

/// The lockable object (a vnode, in the original consumer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// Sentinel end offset: the range runs to the end of the file.
pub const EOF: u64 = u64::MAX;

/// Half-open byte range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockRange {
    pub start: u64,
    pub end: u64,
}

impl LockRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn to_eof(start: u64) -> Self {
        Self { start, end: EOF }
    }

    fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    fn overlaps(&self, other: &LockRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Overlapping or exactly adjacent; the merge criterion.
    fn touches(&self, other: &LockRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    fn contains(&self, other: &LockRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

bitflags! {
    pub struct LockFlags: u32 {
        /// Sleep until the conflicting range frees up.
        const WAIT = 0x01;
        /// Participate in deadlock detection. Only meaningful for
        /// single-owner-per-identity (fcntl-style) lockers.
        const DETECT = 0x02;
    }
}

/// Description of a stored record, as reported by queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockInfo {
    pub owner: OwnerId,
    pub mode: LockMode,
    pub range: LockRange,
}

struct LockRecord {
    owner: OwnerId,
    mode: LockMode,
    detect: bool,
    // Bounds are mutated in place on shrink; guarded by the table lock,
    // atomics only so the record can live in an Arc.
    start: AtomicU64,
    end: AtomicU64,
    /// Requests blocked against this record.
    chan: WaitChannel,
}

impl LockRecord {
    fn new(owner: OwnerId, mode: LockMode, detect: bool, range: LockRange) -> Arc<Self> {
        Arc::new(Self {
            owner,
            mode,
            detect,
            start: AtomicU64::new(range.start),
            end: AtomicU64::new(range.end),
            chan: WaitChannel::new("lockf"),
        })
    }

    fn range(&self) -> LockRange {
        LockRange {
            start: self.start.load(Ordering::Relaxed),
            end: self.end.load(Ordering::Relaxed),
        }
    }

    fn info(&self) -> LockInfo {
        LockInfo {
            owner: self.owner,
            mode: self.mode,
            range: self.range(),
        }
    }
}

struct Inner {
    spaces: BTreeMap<ResourceId, Vec<Arc<LockRecord>>>,
    /// Outstanding records per owner, across all resources.
    counts: BTreeMap<OwnerId, usize>,
    /// Who each blocked owner is waiting on; the deadlock chain.
    blocked_on: BTreeMap<OwnerId, OwnerId>,
}

/// The byte-range lock table.
pub struct LockTable {
    driver: DriverRef,
    max_per_owner: usize,
    max_depth: usize,
    inner: KSpinLock<Inner>,
}

impl LockTable {
    pub fn new(driver: DriverRef, tunables: &Tunables) -> Self {
        Self {
            driver,
            max_per_owner: tunables.max_locks_per_owner,
            max_depth: tunables.deadlock_max_depth,
            inner: KSpinLock::new(Inner {
                spaces: BTreeMap::new(),
                counts: BTreeMap::new(),
                blocked_on: BTreeMap::new(),
            }),
        }
    }

    /// Acquire `range` in `mode` for `owner`.
    ///
    /// Returns `EAGAIN` when a non-waiting request conflicts, `EDEADLK`
    /// when a waiting request would complete a wait cycle (or the chain
    /// walk exceeds its hop ceiling), `ENOLCK` on budget exhaustion and
    /// `EINTR` when a signal ends the wait.
    pub fn set_lock(
        &self,
        resource: ResourceId,
        owner: OwnerId,
        mode: LockMode,
        range: LockRange,
        flags: LockFlags,
    ) -> Result<(), Errno> {
        if range.is_empty() {
            return Err(Errno::EINVAL);
        }

        loop {
            let mut inner = self.inner.lock();
            let blocker = find_conflict(&inner, resource, owner, mode, &range);
            let Some(blocker) = blocker else {
                return apply_set(
                    &mut inner,
                    resource,
                    owner,
                    mode,
                    flags.contains(LockFlags::DETECT),
                    range,
                    self.max_per_owner,
                    &*self.driver,
                );
            };

            if !flags.contains(LockFlags::WAIT) {
                return Err(Errno::EAGAIN);
            }
            if flags.contains(LockFlags::DETECT)
                && blocker.detect
                && would_deadlock(&inner, owner, blocker.owner, self.max_depth)
            {
                log::debug!(
                    "lockf: {:?} -> {:?} would deadlock",
                    owner,
                    blocker.owner
                );
                return Err(Errno::EDEADLK);
            }

            inner.blocked_on.insert(owner, blocker.owner);
            let token = blocker.chan.prepare_sleep(&*self.driver);
            drop(inner);

            let res = token.block(&*self.driver, None, true);
            self.inner.lock().blocked_on.remove(&owner);
            if res == SleepResult::Interrupted {
                return Err(Errno::EINTR);
            }
            // the record changed shape; resolve overlaps from scratch
        }
    }

    /// Release `owner`'s locks inside `range`. Always succeeds; an
    /// unlock that must split a stored record is exempt from the budget.
    pub fn clear_lock(
        &self,
        resource: ResourceId,
        owner: OwnerId,
        range: LockRange,
    ) -> Result<(), Errno> {
        if range.is_empty() {
            return Err(Errno::EINVAL);
        }
        let mut inner = self.inner.lock();
        subtract_range(&mut inner, resource, owner, None, &range, &*self.driver);
        prune(&mut inner, resource);
        Ok(())
    }

    /// Report the first stored record that would block the request,
    /// without changing any state.
    pub fn get_lock(
        &self,
        resource: ResourceId,
        owner: OwnerId,
        mode: LockMode,
        range: LockRange,
    ) -> Option<LockInfo> {
        let inner = self.inner.lock();
        find_conflict(&inner, resource, owner, mode, &range).map(|r| r.info())
    }

    /// Drop every record `owner` holds, on every resource. The close /
    /// process-exit path.
    pub fn clear_owner(&self, owner: OwnerId) {
        let mut inner = self.inner.lock();
        let resources: Vec<ResourceId> = inner.spaces.keys().copied().collect();
        for resource in resources {
            subtract_range(
                &mut inner,
                resource,
                owner,
                None,
                &LockRange::to_eof(0),
                &*self.driver,
            );
            prune(&mut inner, resource);
        }
        inner.counts.remove(&owner);
    }

    /// Outstanding records charged to `owner`.
    pub fn owner_records(&self, owner: OwnerId) -> usize {
        self.inner
            .lock()
            .counts
            .get(&owner)
            .copied()
            .unwrap_or(0)
    }

    /// Snapshot of a resource's record list, in range order.
    pub fn records(&self, resource: ResourceId) -> Vec<LockInfo> {
        self.inner
            .lock()
            .spaces
            .get(&resource)
            .map(|space| space.iter().map(|r| r.info()).collect())
            .unwrap_or_default()
    }
}

fn modes_conflict(a: LockMode, b: LockMode) -> bool {
    a == LockMode::Exclusive || b == LockMode::Exclusive
}

fn find_conflict(
    inner: &Inner,
    resource: ResourceId,
    owner: OwnerId,
    mode: LockMode,
    range: &LockRange,
) -> Option<Arc<LockRecord>> {
    let space = inner.spaces.get(&resource)?;
    space
        .iter()
        .find(|r| {
            r.owner != owner && r.range().overlaps(range) && modes_conflict(r.mode, mode)
        })
        .cloned()
}

/// Walk the blocked-owner chain from `from`, at most `max_depth` hops.
/// Reaching `requester` is a definite cycle; running out of hops is
/// treated as one — a false positive is preferred over an unbounded
/// search inside a blocking syscall path.
fn would_deadlock(inner: &Inner, requester: OwnerId, from: OwnerId, max_depth: usize) -> bool {
    let mut cur = from;
    for _ in 0..max_depth {
        if cur == requester {
            return true;
        }
        match inner.blocked_on.get(&cur) {
            None => return false,
            Some(&next) => cur = next,
        }
    }
    log::debug!("lockf: chain walk past {} hops, assuming deadlock", max_depth);
    true
}

fn insert_sorted(space: &mut Vec<Arc<LockRecord>>, rec: Arc<LockRecord>) {
    let start = rec.range().start;
    let pos = space
        .iter()
        .position(|r| r.range().start > start)
        .unwrap_or(space.len());
    space.insert(pos, rec);
}

fn charge(inner: &mut Inner, owner: OwnerId, delta: isize) {
    let cnt = inner.counts.entry(owner).or_insert(0);
    if delta < 0 {
        *cnt = cnt.saturating_sub((-delta) as usize);
    } else {
        *cnt += delta as usize;
    }
    if *cnt == 0 {
        inner.counts.remove(&owner);
    }
}

fn prune(inner: &mut Inner, resource: ResourceId) {
    if inner
        .spaces
        .get(&resource)
        .map(|s| s.is_empty())
        .unwrap_or(false)
    {
        inner.spaces.remove(&resource);
    }
}

/// Insert a granted lock, resolving overlaps with the owner's own
/// records. Conflicting foreign records were already ruled out.
fn apply_set(
    inner: &mut Inner,
    resource: ResourceId,
    owner: OwnerId,
    mode: LockMode,
    detect: bool,
    range: LockRange,
    max_per_owner: usize,
    driver: &dyn crate::driver::SchedDriver,
) -> Result<(), Errno> {
    let mut merged = range;
    let space = inner.spaces.entry(resource).or_insert_with(Vec::new);

    // Plan: absorb same-mode records that overlap or adjoin the request,
    // repeating until the merged range stops growing (absorbing one
    // record can bring the range into contact with an earlier one).
    // Nothing is mutated until the budget check has passed.
    let mut absorbed: Vec<Arc<LockRecord>> = Vec::new();
    loop {
        let mut grew = false;
        for r in space.iter() {
            if r.owner == owner
                && r.mode == mode
                && !absorbed.iter().any(|a| Arc::ptr_eq(a, r))
                && r.range().touches(&merged)
            {
                let rr = r.range();
                if rr.start < merged.start {
                    merged.start = rr.start;
                    grew = true;
                }
                if rr.end > merged.end {
                    merged.end = rr.end;
                    grew = true;
                }
                absorbed.push(r.clone());
            }
        }
        if !grew {
            break;
        }
    }

    // Plan the subtraction of the merged range from same-owner records
    // of the other mode: full cover removes, partial overlap shrinks a
    // head or tail, strict containment splits.
    let mut removed: Vec<Arc<LockRecord>> = Vec::new();
    let mut shrink_head: Vec<Arc<LockRecord>> = Vec::new(); // new start = merged.end
    let mut shrink_tail: Vec<Arc<LockRecord>> = Vec::new(); // new end = merged.start
    let mut split: Option<Arc<LockRecord>> = None;
    for r in space.iter() {
        if r.owner != owner || r.mode == mode || !r.range().overlaps(&merged) {
            continue;
        }
        let rr = r.range();
        if merged.contains(&rr) {
            removed.push(r.clone());
        } else if rr.start < merged.start && rr.end > merged.end {
            split = Some(r.clone());
        } else if rr.start < merged.start {
            shrink_tail.push(r.clone());
        } else {
            shrink_head.push(r.clone());
        }
    }

    // Budget: a plain request respects the soft limit, one that has to
    // split may run to the hard limit (twice soft).
    let creates = 1 + split.iter().count();
    let deletes = absorbed.len() + removed.len();
    let net = creates as isize - deletes as isize;
    if net > 0 {
        let cnt = inner.counts.get(&owner).copied().unwrap_or(0);
        let limit = if split.is_some() {
            max_per_owner * 2
        } else {
            max_per_owner
        };
        if cnt + net as usize > limit {
            log::debug!("lockf: {:?} over budget ({} + {})", owner, cnt, net);
            return Err(Errno::ENOLCK);
        }
    }

    // Commit. Every record that goes away or changes shape rewakes its
    // waiters; they re-run the full overlap resolution themselves.
    let space = inner.spaces.get_mut(&resource).unwrap();
    for r in absorbed.iter().chain(removed.iter()) {
        space.retain(|x| !Arc::ptr_eq(x, r));
    }
    for r in absorbed.iter().chain(removed.iter()) {
        r.chan.wake_all(driver);
    }
    for r in &shrink_head {
        r.start.store(merged.end, Ordering::Relaxed);
        r.chan.wake_all(driver);
    }
    for r in &shrink_tail {
        r.end.store(merged.start, Ordering::Relaxed);
        r.chan.wake_all(driver);
    }
    if let Some(r) = &split {
        let rr = r.range();
        r.end.store(merged.start, Ordering::Relaxed);
        let piece = LockRecord::new(r.owner, r.mode, r.detect, LockRange::new(merged.end, rr.end));
        insert_sorted(space, piece);
        r.chan.wake_all(driver);
    }
    insert_sorted(space, LockRecord::new(owner, mode, detect, merged));

    charge(inner, owner, creates as isize - deletes as isize);
    Ok(())
}

/// Subtract `range` from `owner`'s records on `resource`; `mode` narrows
/// the subtraction to records of one mode (unlock clears both). The
/// unlock path: never refused, even when a split pushes the owner past
/// its budget.
fn subtract_range(
    inner: &mut Inner,
    resource: ResourceId,
    owner: OwnerId,
    mode: Option<LockMode>,
    range: &LockRange,
    driver: &dyn crate::driver::SchedDriver,
) {
    let Some(space) = inner.spaces.get_mut(&resource) else {
        return;
    };

    let mut removed: Vec<Arc<LockRecord>> = Vec::new();
    let mut pieces: Vec<Arc<LockRecord>> = Vec::new();
    let mut woken: Vec<Arc<LockRecord>> = Vec::new();

    space.retain(|r| {
        if r.owner != owner
            || mode.map(|m| m != r.mode).unwrap_or(false)
            || !r.range().overlaps(range)
        {
            return true;
        }
        let rr = r.range();
        if range.contains(&rr) {
            removed.push(r.clone());
            return false;
        }
        if rr.start < range.start && rr.end > range.end {
            // split around the cleared hole
            r.end.store(range.start, Ordering::Relaxed);
            pieces.push(LockRecord::new(
                r.owner,
                r.mode,
                r.detect,
                LockRange::new(range.end, rr.end),
            ));
        } else if rr.start < range.start {
            r.end.store(range.start, Ordering::Relaxed);
        } else {
            r.start.store(range.end, Ordering::Relaxed);
        }
        woken.push(r.clone());
        true
    });

    let npieces = pieces.len() as isize;
    for p in pieces {
        insert_sorted(space, p);
    }
    for r in &removed {
        r.chan.wake_all(driver);
    }
    for r in &woken {
        r.chan.wake_all(driver);
    }
    charge(inner, owner, npieces - removed.len() as isize);
}
