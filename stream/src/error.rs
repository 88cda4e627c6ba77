use std::fmt::{self, Display};
use std::io;

/// Error kinds surfaced by the pipeline.
///
/// `Canceled` is the clean-shutdown sentinel: blocked buffer operations
/// return it after [`crate::Buffer::cancel`] and workers unwind through it
/// without reporting a failure.
#[derive(Debug)]
pub enum Error {
    /// The resource is held by someone else right now.
    Busy,
    /// The operation cannot proceed in the current state; retry later.
    Again,
    /// An allocation request cannot be satisfied (e.g. a packet larger
    /// than its buffer).
    NoMem,
    /// Caller contract violation.
    Inval,
    /// The format, codec or access mode is not supported.
    NotSup,
    /// The operation was already performed.
    Already,
    /// Malformed or truncated stream data.
    BadMsg,
    /// The buffer was cancelled while waiting.
    Canceled,
    Io(io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn is_cancel(&self) -> bool {
        matches!(self, Error::Canceled)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Busy => write!(f, "resource busy"),
            Error::Again => write!(f, "not ready, try again"),
            Error::NoMem => write!(f, "out of buffer space"),
            Error::Inval => write!(f, "invalid argument"),
            Error::NotSup => write!(f, "not supported"),
            Error::Already => write!(f, "already in progress"),
            Error::BadMsg => write!(f, "bad message"),
            Error::Canceled => write!(f, "cancelled"),
            Error::Io(e) => write!(f, "i/o error: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        Error::Io(e)
    }
}
