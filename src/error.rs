// SPDX-License-Identifier: MPL-2.0

//! Error codes returned by the cache.
//!
//! Shaped after `aster-nix`'s `error` module: a small `Errno` enum plus an
//! `Error` wrapper carrying an optional static message, with
//! `return_errno!`/`return_errno_with_message!` macros for early returns.

use core::fmt;

/// Error number, restricted to the codes this crate actually returns.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Errno {
    /// Invalid argument (misaligned range, bad flag combination, ...).
    EINVAL = 22,
    /// I/O error propagated verbatim from a backing-store callback.
    EIO = 5,
    /// Out of memory / cannot allocate a `CachedSection` or page frame.
    ENOMEM = 12,
    /// Device or resource busy (LRU exhausted, modified list saturated).
    EBUSY = 16,
    /// Resource temporarily unavailable; caller should retry.
    EAGAIN = 11,
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Errno::EINVAL => "invalid argument",
            Errno::EIO => "I/O error",
            Errno::ENOMEM => "out of memory",
            Errno::EBUSY => "resource busy",
            Errno::EAGAIN => "resource temporarily unavailable",
        };
        f.write_str(s)
    }
}

/// The error type used throughout this crate.
#[derive(Debug, Clone, Copy)]
pub struct Error {
    errno: Errno,
    msg: Option<&'static str>,
}

impl Error {
    pub const fn new(errno: Errno) -> Self {
        Error { errno, msg: None }
    }

    pub const fn with_message(errno: Errno, msg: &'static str) -> Self {
        Error {
            errno,
            msg: Some(msg),
        }
    }

    pub const fn errno(&self) -> Errno {
        self.errno
    }
}

impl From<Errno> for Error {
    fn from(errno: Errno) -> Self {
        Error::new(errno)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.msg {
            Some(msg) => write!(f, "{}: {}", self.errno, msg),
            None => fmt::Display::fmt(&self.errno, f),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = core::result::Result<T, Error>;

#[macro_export]
macro_rules! return_errno {
    ($errno:expr) => {
        return Err($crate::error::Error::new($errno))
    };
}

#[macro_export]
macro_rules! return_errno_with_message {
    ($errno:expr, $message:expr) => {
        return Err($crate::error::Error::with_message($errno, $message))
    };
}
