//! Sleep/wakeup layer shared by the higher primitives.
//!
//! [`WaitChannel`] is the generic keyed rendezvous: threads park on a
//! channel and are resumed by `wake_one`/`wake_all`. [`Turnstile`] layers
//! a priority-ordered waiter list on the same parking protocol for the
//! adaptive mutex's hand-off.

mod turnstile;
mod wait_channel;

pub use turnstile::Turnstile;
pub use wait_channel::{SleepResult, SleepToken, WaitChannel};

pub(crate) use wait_channel::Waiter;
