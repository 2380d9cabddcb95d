//! A proxy between an AFL-style fuzzer and a worker process that cannot
//! speak the forkserver protocol itself.
//!
//! The fuzzer side follows the classic forkserver convention: a handshake
//! and per-iteration status words over two inherited pipe file descriptors,
//! plus a shared-memory coverage map. The worker side is two named pipes
//! carrying a go signal one way and status plus raw coverage bytes the
//! other way. [`proxy::Proxy`] is the state machine that translates
//! between the two, relaying each iteration's coverage into the shared
//! map before the fuzzer gets the status word.
//!
//! The protocol has no mid-stream resynchronization, so every short read
//! or write is treated as fatal: errors bubble up as [`Error`] to `main`,
//! which logs and exits with status 1.

use core::fmt;
use std::{env::VarError, io, num::ParseIntError};

pub mod args;
pub mod forkserver;
pub mod logger;
pub mod proxy;
pub mod shmem;
pub mod worker;

/// Main error type for the proxy.
///
/// There is deliberately no "recoverable" category: once framing is off,
/// the connection cannot be trusted and the process must die so the fuzzer
/// notices via EOF or its own timeout.
#[derive(Debug)]
pub enum Error {
    /// File or pipe I/O failed
    File(io::Error),
    /// An OS call failed, with the errno captured at the call site
    OsError(io::Error, String),
    /// A frame transferred fewer bytes than the protocol requires
    IllegalState(String),
    /// Bad configuration: arguments or environment
    IllegalArgument(String),
    /// Something else happened
    Unknown(String),
}

impl Error {
    /// An OS call failed, capture the current `errno`
    #[must_use]
    pub fn last_os_error<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::OsError(io::Error::last_os_error(), arg.into())
    }

    /// A frame transferred fewer bytes than the protocol requires
    #[must_use]
    pub fn illegal_state<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::IllegalState(arg.into())
    }

    /// The argument or environment passed to the proxy is not valid
    #[must_use]
    pub fn illegal_argument<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::IllegalArgument(arg.into())
    }

    /// Something else happened
    #[must_use]
    pub fn unknown<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::Unknown(arg.into())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::File(err) => write!(f, "File IO failed: {err:?}"),
            Self::OsError(err, s) => write!(f, "{s}: {err:?}"),
            Self::IllegalState(s) => write!(f, "Illegal state: {s}"),
            Self::IllegalArgument(s) => write!(f, "Illegal argument: {s}"),
            Self::Unknown(s) => write!(f, "Unknown error: {s}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::File(err)
    }
}

impl From<nix::Error> for Error {
    fn from(err: nix::Error) -> Self {
        Self::unknown(format!("Unix error: {err:?}"))
    }
}

impl From<VarError> for Error {
    fn from(err: VarError) -> Self {
        Self::illegal_argument(format!("Could not get env var: {err:?}"))
    }
}

impl From<ParseIntError> for Error {
    fn from(err: ParseIntError) -> Self {
        Self::illegal_argument(format!("Failed to parse int: {err:?}"))
    }
}
