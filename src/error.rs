use std::io;

use thiserror::Error;

/// The error type returned by every fallible operation in this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// The caller violated an operation's contract (wrong status, wrong
    /// stream, malformed arguments). The message names the contract.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// The peer's end of a pipe is closed and no more bytes remain, or a
    /// poll was issued with no valid endpoint to watch.
    #[error("broken pipe")]
    BrokenPipe,
    /// A wait expired, or a non-blocking endpoint had nothing to offer.
    #[error("timed out")]
    TimedOut,
    /// An OS primitive failed; the underlying error is preserved.
    #[error(transparent)]
    Os(io::Error),
}

/// Alias for `Result` with this crate's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        match err.kind() {
            io::ErrorKind::BrokenPipe => Error::BrokenPipe,
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => Error::TimedOut,
            _ => Error::Os(err),
        }
    }
}
