//! Explicit per-processor contexts.
//!
//! Nothing in this crate hides per-CPU state in globals: a
//! [`ProcessorSet`] is built once at bring-up and handed by reference
//! into the entry points that need it. Each [`Processor`] carries the
//! spin-mutex IPL nesting state and the processor's select cluster.

use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use crate::config::{MAX_PROCESSORS, Tunables};
use crate::driver::{DriverRef, SchedDriver};
use crate::ipl::Ipl;
use crate::select::SelectCluster;

pub struct Processor {
    id: usize,
    /// Depth of nested spin-mutex sections on this processor.
    spl_count: AtomicUsize,
    /// Interrupt priority to restore when the outermost section exits.
    spl_saved: AtomicU8,
    pub(crate) cluster: SelectCluster,
}

impl Processor {
    fn new(id: usize) -> Self {
        Self {
            id,
            spl_count: AtomicUsize::new(0),
            spl_saved: AtomicU8::new(Ipl::None as u8),
            cluster: SelectCluster::new(id),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Enter a spin-mutex critical section: raise the IPL to `ceiling`
    /// and remember the pre-section level if this is the outermost entry.
    pub(crate) fn spl_enter(&self, driver: &dyn SchedDriver, ceiling: Ipl) {
        let prev = driver.splraise(ceiling);
        if self.spl_count.fetch_add(1, Ordering::Relaxed) == 0 {
            self.spl_saved.store(prev as u8, Ordering::Relaxed);
        }
    }

    /// Leave a spin-mutex critical section; the outermost exit restores
    /// the level saved on entry, not the innermost ceiling.
    pub(crate) fn spl_exit(&self, driver: &dyn SchedDriver) {
        if self.spl_count.fetch_sub(1, Ordering::Relaxed) == 1 {
            let saved = Ipl::from_raw(self.spl_saved.load(Ordering::Relaxed)).unwrap_or(Ipl::None);
            driver.splx(saved);
        }
    }
}

/// All processor contexts, created at bring-up.
pub struct ProcessorSet {
    driver: DriverRef,
    procs: Box<[Processor]>,
    pub(crate) tunables: Tunables,
}

impl ProcessorSet {
    pub fn new(driver: DriverRef, count: usize) -> Arc<Self> {
        Self::with_tunables(driver, count, Tunables::new())
    }

    pub fn with_tunables(driver: DriverRef, count: usize, tunables: Tunables) -> Arc<Self> {
        assert!(
            count > 0 && count <= MAX_PROCESSORS,
            "processor count {} out of range",
            count
        );
        log::info!("initialize {} processor context(s)", count);
        let procs: Vec<Processor> = (0..count).map(Processor::new).collect();
        Arc::new(Self {
            driver,
            procs: procs.into_boxed_slice(),
            tunables,
        })
    }

    pub fn len(&self) -> usize {
        self.procs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procs.is_empty()
    }

    pub fn processor(&self, id: usize) -> &Processor {
        &self.procs[id]
    }

    /// Context of the processor the calling thread runs on.
    pub fn current(&self) -> &Processor {
        &self.procs[self.driver.current_cpu() % self.procs.len()]
    }

    pub fn driver(&self) -> &DriverRef {
        &self.driver
    }

    pub fn tunables(&self) -> &Tunables {
        &self.tunables
    }
}
