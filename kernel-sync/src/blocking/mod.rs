//! Blocking locks: primitives that may put the caller to sleep and are
//! therefore illegal in interrupt context.

mod mutex;

pub use mutex::{Mutex, MutexGuard};
