#![cfg_attr(feature = "fast_thread_local", feature(thread_local))]

#[cfg(feature = "macros")]
pub use ringfiber_macros::main;

pub mod circular_buffer;
pub mod fs;
pub mod net;
pub mod process;
pub mod runtime;
pub mod sync;
pub mod time;
#[cfg(test)]
mod utils;

/// An operation's own failure, or the fact that its task was cancelled instead
/// (§7). Generic over the wrapped error so non-I/O cancellable operations
/// (e.g. [`CancellableResult`]) can reuse the same cancellation wrapper.
#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error<E> {
    #[error(transparent)]
    Original(E),

    #[error("operation was cancelled")]
    Cancelled,
}

impl<E> Error<E> {
    /// Maps the wrapped error, leaving `Cancelled` untouched.
    #[inline]
    pub fn map<F: FnOnce(E) -> U, U>(self, f: F) -> Error<U> {
        match self {
            Error::Original(e) => Error::Original(f(e)),
            Error::Cancelled => Error::Cancelled,
        }
    }

    /// Chains onto the wrapped error, leaving `Cancelled` untouched.
    #[inline]
    pub fn and_then<F: FnOnce(E) -> Error<U>, U>(self, f: F) -> Error<U> {
        match self {
            Error::Original(e) => f(e),
            Error::Cancelled => Error::Cancelled,
        }
    }
}

impl Error<std::io::Error> {
    /// Converts a raw `io::Error` into `Cancelled` if its errno is `ECANCELED`,
    /// otherwise wraps it as-is (§7's "cancellation always wins" rule applied
    /// at the boundary where a caller only has the kernel's own error to go on).
    pub fn from_io_error(error: std::io::Error) -> Self {
        match error.raw_os_error().unwrap() {
            libc::ECANCELED => Error::Cancelled,
            _ => Error::Original(error),
        }
    }
}

impl From<Error<std::io::Error>> for std::io::Error {
    fn from(error: Error<std::io::Error>) -> Self {
        match error {
            Error::Original(e) => e,
            Error::Cancelled => std::io::Error::from_raw_os_error(libc::ECANCELED),
        }
    }
}

/// Result of a cancellable I/O operation: either its success value or an
/// [`Error`] wrapping the kernel's `io::Error` (or `Cancelled`).
pub type IoResult<T> = Result<T, Error<std::io::Error>>;

/// Result of a cancellable operation with no error of its own, only a possible
/// cancellation (e.g. [`crate::time::sleep`]).
pub type CancellableResult<T> = Result<T, Error<()>>;
