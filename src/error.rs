//! Crate-wide error taxonomy.
//!
//! Every fallible operation in this crate returns a [`Result<T>`], never a
//! panic or an exception, so that a medium-level failure on one endpoint
//! can be contained to that endpoint without unwinding across threads.

use std::error;
use std::fmt;
use std::io;
use std::result;

/// The kind of failure that occurred. Carried alongside an optional
/// wrapped error for additional context.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ErrorKind {
    /// A `RequestConnection` was issued for an endpoint we are already
    /// connected to.
    AlreadyConnectedToEndpoint,
    /// Operation referenced an endpoint id with no pending or registered
    /// connection.
    EndpointUnknown,
    /// A `Channel::read`/`Channel::write` failed below the frame layer.
    EndpointIoError,
    /// A frame was read but could not be decoded.
    InvalidProtocolBuffer,
    /// The peer responded with `REJECT`.
    ConnectionRejected,
    /// The key-agreement handshake failed or timed out.
    AuthenticationFailure,
    /// An API call was made in a state that does not allow it, e.g.
    /// `AcceptConnection` without a pending connection.
    OutOfOrderApiCall,
    /// A bounded wait (handshake, initial request, future) expired.
    Timeout,
    /// The caller's cancellation token was set before the operation
    /// completed.
    Cancelled,
    /// Generic fallback, used when no more specific kind applies.
    Error,
}

/// Extension of the standard library's `Result` type, used to wrap its
/// error in a [`Error`].
pub trait ResultWrappedExt {
    type T;

    fn wrapped_msg(self, kind: ErrorKind, msg: &str) -> Result<Self::T>;
    fn wrapped(self, kind: ErrorKind) -> Result<Self::T>;
}

/// Extension of the standard library's `Result` type.
///
/// Different from [`ResultWrappedExt`], this trait drops the underlying
/// error type, which is useful when it doesn't implement `Send`.
pub trait ResultSimpleExt {
    type T;

    fn simple(self, kind: ErrorKind) -> Result<Self::T>;
    fn simple_msg(self, kind: ErrorKind, msg: &str) -> Result<Self::T>;
}

impl<T, E> ResultWrappedExt for result::Result<T, E>
where
    E: Into<Box<dyn error::Error + Send + Sync>>,
{
    type T = T;

    fn wrapped(self, kind: ErrorKind) -> Result<Self::T> {
        self.map_err(|e| Error::wrapped(kind, e))
    }

    fn wrapped_msg(self, kind: ErrorKind, msg: &str) -> Result<Self::T> {
        self.map_err(|e| Error::wrapped(kind, format!("{}: {}", msg, e.into())))
    }
}

impl<T, E> ResultSimpleExt for result::Result<T, E> {
    type T = T;

    fn simple(self, kind: ErrorKind) -> Result<Self::T> {
        self.map_err(|_| Error::simple(kind))
    }

    fn simple_msg(self, kind: ErrorKind, msg: &str) -> Result<Self::T> {
        self.map_err(|_| Error::wrapped(kind, msg.to_owned()))
    }
}

/// Wrapper result type used throughout this crate.
pub type Result<T> = result::Result<T, Error>;

/// The error type returned by fallible operations in this crate.
pub struct Error {
    inner: ErrorInner,
}

enum ErrorInner {
    Simple(ErrorKind),
    Wrapped(ErrorKind, Box<dyn error::Error + Send + Sync>),
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            ErrorInner::Simple(k) => write!(f, "Error::Simple({:?})", k),
            ErrorInner::Wrapped(k, e) => write!(f, "Error::Wrapped({:?}, {:?})", k, e),
        }
    }
}

impl Error {
    /// Returns an error not wrapping another error implementation, with
    /// kind `ErrorKind`.
    pub fn simple(kind: ErrorKind) -> Self {
        Error { inner: ErrorInner::Simple(kind) }
    }

    /// Wraps an arbitrary error in an `Error`, with kind `ErrorKind`.
    pub fn wrapped<E>(kind: ErrorKind, e: E) -> Self
    where
        E: Into<Box<dyn error::Error + Send + Sync>>,
    {
        Error { inner: ErrorInner::Wrapped(kind, e.into()) }
    }

    /// Returns a copy of the `ErrorKind` of this `Error`.
    pub fn kind(&self) -> ErrorKind {
        match &self.inner {
            ErrorInner::Simple(k) => *k,
            ErrorInner::Wrapped(k, _) => *k,
        }
    }

    /// Swaps the `ErrorKind` of this `Error`, preserving any wrapped cause.
    pub fn swap_kind(self, k: ErrorKind) -> Self {
        let inner = match self.inner {
            ErrorInner::Simple(_) => ErrorInner::Simple(k),
            ErrorInner::Wrapped(_, e) => ErrorInner::Wrapped(k, e),
        };
        Error { inner }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            ErrorInner::Simple(k) => write!(f, "{:?}", k),
            ErrorInner::Wrapped(k, e) => write!(f, "{:?}: {}", k, e),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::wrapped(ErrorKind::EndpointIoError, e)
    }
}

impl error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_error_reports_its_kind() {
        let e = Error::simple(ErrorKind::Timeout);
        assert_eq!(e.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn wrapped_error_keeps_cause_in_display() {
        let io_err = io::Error::new(io::ErrorKind::Other, "socket reset");
        let e: Error = io_err.into();
        assert_eq!(e.kind(), ErrorKind::EndpointIoError);
        assert!(e.to_string().contains("socket reset"));
    }

    #[test]
    fn swap_kind_preserves_wrapped_cause() {
        let e = Error::wrapped(ErrorKind::Error, "boom");
        let e = e.swap_kind(ErrorKind::AuthenticationFailure);
        assert_eq!(e.kind(), ErrorKind::AuthenticationFailure);
        assert!(e.to_string().contains("boom"));
    }
}
