//! Interrupt priority levels.
//!
//! A spin mutex is created with a ceiling drawn from this ladder; while
//! the lock is held the processor runs with interrupt sources at or below
//! the ceiling blocked out. Levels are totally ordered: raising to a
//! lower level than the current one is a no-op on the driver side.

use strum_macros::{Display, FromRepr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Display, FromRepr)]
#[repr(u8)]
pub enum Ipl {
    /// No interrupts blocked.
    None = 0,
    /// Soft clock interrupts (callouts).
    SoftClock = 1,
    /// Soft block-I/O completion.
    SoftBio = 2,
    /// Soft network protocol processing.
    SoftNet = 3,
    /// Soft serial processing.
    SoftSerial = 4,
    /// Memory management interrupts.
    Vm = 5,
    /// Scheduler / clock hardware interrupts.
    Sched = 6,
    /// Everything blocked.
    High = 7,
}

impl Ipl {
    pub fn from_raw(raw: u8) -> Option<Ipl> {
        Ipl::from_repr(raw)
    }
}
