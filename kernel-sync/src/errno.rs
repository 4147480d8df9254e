//! In Unix-like systems a failed call returns -1 and leaves the reason in
//! errno; inside the kernel the reason stays typed until the syscall
//! boundary converts it.

#![allow(missing_docs)]

use strum_macros::{Display, EnumString, FromRepr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, FromRepr)]
#[repr(i32)]
#[strum(serialize_all = "snake_case")]
pub enum Errno {
    #[strum(serialize = "Operation not permitted")]
    EPERM = 1,
    #[strum(serialize = "Interrupted system call")]
    EINTR = 4,
    #[strum(serialize = "Bad file descriptor")]
    EBADF = 9,
    #[strum(serialize = "Resource temporarily unavailable")]
    EAGAIN = 11,
    #[strum(serialize = "Device or resource busy")]
    EBUSY = 16,
    #[strum(serialize = "Invalid argument")]
    EINVAL = 22,
    #[strum(serialize = "Resource deadlock avoided")]
    EDEADLK = 35,
    #[strum(serialize = "No locks available")]
    ENOLCK = 37,
    #[strum(serialize = "Function not implemented")]
    ENOSYS = 38,
}

// i32 -> Errno
impl TryFrom<i32> for Errno {
    type Error = ();

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        Errno::from_repr(value).ok_or(())
    }
}

impl Errno {
    /// Value as seen by user space: `-errno` in the syscall return slot.
    pub fn as_retval(self) -> isize {
        -(self as isize)
    }
}
