//! Crate-level error type for the handful of APIs where `io::Error` alone
//! doesn't distinguish enough (codec framing failures aren't OS errors).
//! Internal per-connection failures still route through `log`, not this
//! type - see the error-handling design notes for the rationale.

use std::fmt;
use std::io;

#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    Codec(CodecError),
    /// A condition the reactor cannot recover from (pipe/epoll creation
    /// failure, an unwakeable event loop). Callers see this only from
    /// construction paths; once a reactor is running, a fatal condition
    /// is logged and the process aborts rather than returned.
    Fatal(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "io error: {e}"),
            Error::Codec(e) => write!(f, "codec error: {e}"),
            Error::Fatal(msg) => write!(f, "fatal: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Codec(e) => Some(e),
            Error::Fatal(_) => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        Error::Io(e)
    }
}

impl From<CodecError> for Error {
    fn from(e: CodecError) -> Error {
        Error::Codec(e)
    }
}

/// A framing violation: bad magic, an over-length frame, or any other
/// decode rule a `Codec` implementation enforces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecError(pub &'static str);

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for CodecError {}

pub type Result<T> = std::result::Result<T, Error>;
