//! Ergonomic error context helpers.
//!
//! Provides extension traits for adding context to `Result` types,
//! converting IO errors into the matching `NetError` variants.

use crate::base::neterror::NetError;
use std::io::{self, ErrorKind};

/// Direction of the socket operation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDirection {
    Connect,
    Read,
    Write,
}

/// Map an IO error onto the engine's error codes.
/// Timeouts stay distinct from broken connections.
pub fn classify_io_error(err: &io::Error, direction: IoDirection) -> NetError {
    match err.kind() {
        ErrorKind::TimedOut | ErrorKind::WouldBlock => match direction {
            IoDirection::Connect => NetError::ConnectionTimedOut,
            IoDirection::Read => NetError::ReadTimedOut,
            IoDirection::Write => NetError::WriteTimedOut,
        },
        ErrorKind::ConnectionRefused => NetError::ConnectionRefused,
        ErrorKind::ConnectionReset => NetError::ConnectionReset,
        ErrorKind::ConnectionAborted => NetError::ConnectionAborted,
        ErrorKind::NotConnected => NetError::SocketNotConnected,
        ErrorKind::BrokenPipe | ErrorKind::UnexpectedEof => NetError::ConnectionClosed,
        ErrorKind::AddrNotAvailable => NetError::NameNotResolved,
        _ => match direction {
            IoDirection::Connect => NetError::ConnectionFailed,
            IoDirection::Read | IoDirection::Write => NetError::ConnectionReset,
        },
    }
}

/// Extension trait for adding context to IO Results.
pub trait IoResultExt<T> {
    /// Add connection context to an IO error.
    ///
    /// # Example
    /// ```ignore
    /// use wirenet::base::context::IoResultExt;
    ///
    /// let stream = TcpStream::connect(addr).await
    ///     .connection_context("example.com", 443)?;
    /// ```
    fn connection_context(self, host: &str, port: u16) -> Result<T, NetError>;

    /// Convert a failed socket read.
    fn read_context(self) -> Result<T, NetError>;

    /// Convert a failed socket write.
    fn write_context(self) -> Result<T, NetError>;

    /// Convert a failure to build the runtime a blocking client drives.
    fn runtime_context(self) -> Result<T, NetError>;
}

impl<T> IoResultExt<T> for Result<T, io::Error> {
    fn connection_context(self, host: &str, port: u16) -> Result<T, NetError> {
        self.map_err(|e| {
            tracing::debug!(host = %host, port, error = %e, "connect failed");
            classify_io_error(&e, IoDirection::Connect)
        })
    }

    fn read_context(self) -> Result<T, NetError> {
        self.map_err(|e| classify_io_error(&e, IoDirection::Read))
    }

    fn write_context(self) -> Result<T, NetError> {
        self.map_err(|e| classify_io_error(&e, IoDirection::Write))
    }

    fn runtime_context(self) -> Result<T, NetError> {
        self.map_err(|e| {
            tracing::error!(error = %e, kind = ?e.kind(), "runtime build failed");
            NetError::RuntimeUnavailable
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Error;

    #[test]
    fn test_connection_context() {
        let result: Result<(), io::Error> =
            Err(Error::new(ErrorKind::ConnectionRefused, "refused"));
        let err = result.connection_context("example.com", 443).unwrap_err();
        assert_eq!(err, NetError::ConnectionRefused);
    }

    #[test]
    fn test_timeouts_are_distinct() {
        let read: Result<(), io::Error> = Err(Error::new(ErrorKind::TimedOut, "slow"));
        assert_eq!(read.read_context().unwrap_err(), NetError::ReadTimedOut);

        let write: Result<(), io::Error> = Err(Error::new(ErrorKind::TimedOut, "slow"));
        assert_eq!(write.write_context().unwrap_err(), NetError::WriteTimedOut);
    }

    #[test]
    fn test_runtime_failure_is_not_a_socket_error() {
        let result: Result<(), io::Error> = Err(Error::new(ErrorKind::Other, "too many open files"));
        let err = result.runtime_context().unwrap_err();
        assert_eq!(err, NetError::RuntimeUnavailable);
        assert_eq!(NetError::from(err.as_i32()), NetError::RuntimeUnavailable);
    }

    #[test]
    fn test_eof_is_connection_closed() {
        let result: Result<(), io::Error> = Err(Error::new(ErrorKind::UnexpectedEof, "eof"));
        assert_eq!(result.read_context().unwrap_err(), NetError::ConnectionClosed);
    }
}
