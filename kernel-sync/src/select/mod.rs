//! Multiplexed readiness waiting — the engine behind select and poll.
//!
//! A caller hands in a list of candidate objects and the events it cares
//! about per object. The engine scans once without blocking; if nothing
//! is ready it parks on the calling processor's cluster until an object
//! notifies, a collision broadcast forces a rescan, the deadline passes,
//! or a signal arrives. Objects deliver events directly into the
//! waiter's result set when the direct-delivery tunable is on, and fall
//! back to forcing a full rescan when it is off.

mod cluster;
mod info;

pub use cluster::SelectCluster;
pub use info::{Events, Pollable, SelInfo, SelScan};

use core::sync::atomic::Ordering;

use crate::errno::Errno;
use crate::processor::ProcessorSet;
use crate::sleep::SleepResult;

use info::{ScanShared, SEL_BLOCKING, SEL_EVENT, SEL_RESET, SEL_SCANNING};

/// One candidate in a poll-family call.
pub struct PollFd<'a> {
    pub obj: Option<&'a dyn Pollable>,
    pub interest: Events,
    pub revents: Events,
}

impl<'a> PollFd<'a> {
    pub fn new(obj: &'a dyn Pollable, interest: Events) -> Self {
        Self {
            obj: Some(obj),
            interest,
            revents: Events::empty(),
        }
    }

    /// A slot holding no valid object; reported as `NVAL`, never as a
    /// whole-call failure.
    pub fn invalid() -> Self {
        Self {
            obj: None,
            interest: Events::empty(),
            revents: Events::empty(),
        }
    }
}

/// Descriptor bitmask for the select-family entry point.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct FdSet {
    bits: [u64; FdSet::WORDS],
}

impl FdSet {
    pub const SETSIZE: usize = 256;
    const WORDS: usize = Self::SETSIZE / 64;

    pub const fn new() -> Self {
        Self {
            bits: [0; Self::WORDS],
        }
    }

    pub fn set(&mut self, fd: usize) {
        assert!(fd < Self::SETSIZE, "fd {} out of fd_set range", fd);
        self.bits[fd / 64] |= 1 << (fd % 64);
    }

    pub fn clear(&mut self, fd: usize) {
        assert!(fd < Self::SETSIZE, "fd {} out of fd_set range", fd);
        self.bits[fd / 64] &= !(1 << (fd % 64));
    }

    pub fn is_set(&self, fd: usize) -> bool {
        fd < Self::SETSIZE && self.bits[fd / 64] & (1 << (fd % 64)) != 0
    }

    pub fn zero(&mut self) {
        self.bits = [0; Self::WORDS];
    }

    pub fn count(&self) -> usize {
        self.bits.iter().map(|w| w.count_ones() as usize).sum()
    }
}

impl Default for FdSet {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessorSet {
    /// Poll-family entry: wait until one of `fds` reports an event from
    /// its interest set, the relative `timeout` (ticks) elapses, or a
    /// signal interrupts. Fills `revents` per slot and returns how many
    /// slots are ready; a timeout is a success with zero ready slots.
    pub fn poll(&self, fds: &mut [PollFd<'_>], timeout: Option<u64>) -> Result<usize, Errno> {
        self.do_scan(fds, timeout)
    }

    /// Select-family entry over descriptor bitmasks. `table` maps
    /// descriptor numbers to objects; a set bit naming a missing entry
    /// is flagged back in the caller's sets (per-object error) rather
    /// than failing the call. Returns the number of set result bits.
    pub fn select(
        &self,
        table: &[Option<&dyn Pollable>],
        read: &mut FdSet,
        write: &mut FdSet,
        except: &mut FdSet,
        timeout: Option<u64>,
    ) -> Result<usize, Errno> {
        let mut fds = alloc::vec::Vec::new();
        let mut slots = alloc::vec::Vec::new();

        let nfds = Self::highest_fd(read, write, except);
        for fd in 0..nfds {
            let mut interest = Events::empty();
            if read.is_set(fd) {
                interest |= Events::IN;
            }
            if write.is_set(fd) {
                interest |= Events::OUT;
            }
            if except.is_set(fd) {
                interest |= Events::PRI;
            }
            if interest.is_empty() {
                continue;
            }
            let obj = table.get(fd).copied().flatten();
            fds.push(PollFd {
                obj,
                interest,
                revents: Events::empty(),
            });
            slots.push(fd);
        }

        let res = self.do_scan(&mut fds, timeout);

        let (rin, win, ein) = (*read, *write, *except);
        read.zero();
        write.zero();
        except.zero();
        let mut nbits = 0;
        if res.is_ok() {
            for (pf, &fd) in fds.iter().zip(slots.iter()) {
                let ev = pf.revents;
                if ev.is_empty() {
                    continue;
                }
                // an invalid descriptor shows up in every set that named it
                let nval = ev.contains(Events::NVAL);
                if rin.is_set(fd) && (nval || ev.intersects(Events::IN | Events::HUP | Events::ERR)) {
                    read.set(fd);
                    nbits += 1;
                }
                if win.is_set(fd) && (nval || ev.intersects(Events::OUT | Events::ERR)) {
                    write.set(fd);
                    nbits += 1;
                }
                if ein.is_set(fd) && (nval || ev.contains(Events::PRI)) {
                    except.set(fd);
                    nbits += 1;
                }
            }
        }
        res.map(|_| nbits)
    }

    fn highest_fd(read: &FdSet, write: &FdSet, except: &FdSet) -> usize {
        let mut hi = 0;
        for fd in 0..FdSet::SETSIZE {
            if read.is_set(fd) || write.is_set(fd) || except.is_set(fd) {
                hi = fd + 1;
            }
        }
        hi
    }

    /// The scan/block loop shared by both entry points.
    fn do_scan(&self, fds: &mut [PollFd<'_>], timeout: Option<u64>) -> Result<usize, Errno> {
        let driver = &**self.driver();
        let me = driver.current();
        let cpu = driver.current_cpu() % self.len();
        let cl = &self.processor(cpu).cluster;
        let shared = ScanShared::new(me, cpu);
        let mut scan = SelScan::new(self, shared.clone());
        let deadline = timeout.map(|t| driver.now().saturating_add(t));

        let result = loop {
            // snapshot the collision generation before scanning; a bump
            // after this point forces a rescan instead of a sleep
            let gen = {
                let _g = cl.lock();
                shared.flag.store(SEL_SCANNING, Ordering::Release);
                cl.generation()
            };

            let mut nready = 0;
            for (i, fd) in fds.iter_mut().enumerate() {
                fd.revents = Events::empty();
                match fd.obj {
                    None => {
                        fd.revents = Events::NVAL;
                        nready += 1;
                    }
                    Some(obj) => {
                        scan.cookie = i as u32;
                        scan.interest = fd.interest;
                        let ev = obj.poll(&mut scan, fd.interest)
                            & (fd.interest | Events::always());
                        if !ev.is_empty() {
                            fd.revents = ev;
                            nready += 1;
                        }
                    }
                }
            }

            if nready > 0 {
                break Ok(nready);
            }
            if timeout == Some(0) {
                break Ok(0); // pure poll, no sleep
            }

            let g = cl.lock();
            match shared.flag.load(Ordering::Acquire) {
                SEL_EVENT => {
                    drop(g);
                    let n = Self::apply_direct(&shared, fds);
                    if n > 0 {
                        break Ok(n);
                    }
                    continue; // delivery missed our interest; rescan
                }
                _ if cl.generation() != gen => {
                    drop(g);
                    continue; // collided while scanning
                }
                _ => {
                    shared.flag.store(SEL_BLOCKING, Ordering::Release);
                    let token = cl.chan.prepare_sleep(driver);
                    drop(g);

                    match token.block(driver, deadline, true) {
                        SleepResult::Interrupted => break Err(Errno::EINTR),
                        SleepResult::Timeout => {
                            // a delivery can race the deadline; prefer it
                            if shared.flag.load(Ordering::Acquire) == SEL_EVENT {
                                let n = Self::apply_direct(&shared, fds);
                                if n > 0 {
                                    break Ok(n);
                                }
                            }
                            break Ok(0);
                        }
                        SleepResult::Woken => {
                            if shared.flag.load(Ordering::Acquire) == SEL_EVENT {
                                let n = Self::apply_direct(&shared, fds);
                                if n > 0 {
                                    break Ok(n);
                                }
                            }
                            continue; // forced rescan (legacy or collision)
                        }
                    }
                }
            }
        };

        scan.clear();
        shared.flag.store(SEL_RESET, Ordering::Release);
        result
    }

    /// Merge directly-delivered events into the result slots.
    fn apply_direct(shared: &ScanShared, fds: &mut [PollFd<'_>]) -> usize {
        let mut pairs = shared.direct.lock();
        for (cookie, ev) in pairs.drain(..) {
            if let Some(fd) = fds.get_mut(cookie as usize) {
                fd.revents |= ev & (fd.interest | Events::always());
            }
        }
        fds.iter().filter(|fd| !fd.revents.is_empty()).count()
    }
}

#[cfg(test)]
mod tests;
