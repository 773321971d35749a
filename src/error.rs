use std::fmt::Display;
use std::io;

/// ChronoDB errors.
#[derive(Debug)]
pub enum Error {
    /// An IO error. Merge cycles that hit one are abandoned and retried on
    /// the next offer.
    Io(io::Error),
    /// Failed to decode an on-disk structure. The first field names what was
    /// being decoded.
    Decode(&'static str, io::Error),
    /// Metadata or file contents are inconsistent with the store invariants.
    /// Not recoverable within the worker.
    Corruption(String),
    /// The operation is not valid for the current state of the structure.
    InvalidOperation(String),
    /// A write was attempted on a finished block or table.
    ReadOnly,
    /// The merge worker has been shut down and no longer accepts buffers.
    Shutdown,
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Io(err) => write!(f, "io error: {err}"),
            Error::Decode(what, err) => write!(f, "failed to decode {what}: {err}"),
            Error::Corruption(msg) => write!(f, "corruption: {msg}"),
            Error::InvalidOperation(msg) => write!(f, "invalid operation: {msg}"),
            Error::ReadOnly => write!(f, "write attempted on finished structure"),
            Error::Shutdown => write!(f, "merge worker is shut down"),
        }
    }
}

/// Constructs an Error::Corruption for the given format string.
#[macro_export]
macro_rules! corruption {
    ($($args:tt)*) => { $crate::error::Error::Corruption(format!($($args)*)) };
}

/// A ChronoDB Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::InvalidOperation(err.to_string())
    }
}
