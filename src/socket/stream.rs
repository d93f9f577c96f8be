//! Object-safe socket handle.
//!
//! Connections hold their transport as a [`BoxedSocket`] so that plain TCP,
//! TLS streams produced by a custom connector, and in-memory pipes used in
//! tests all travel through the same code.

use crate::socket::client::StreamSocket;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Type-erased transport. `secure` is captured once at construction.
pub struct BoxedSocket {
    inner: Pin<Box<dyn StreamSocket>>,
    secure: bool,
}

impl BoxedSocket {
    pub fn new<S: StreamSocket>(socket: S) -> Self {
        let secure = socket.is_secure();
        Self { inner: Box::pin(socket), secure }
    }

    /// Whether the transport is TLS protected.
    pub fn is_secure(&self) -> bool {
        self.secure
    }
}

impl std::fmt::Debug for BoxedSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxedSocket").field("secure", &self.secure).finish()
    }
}

impl AsyncRead for BoxedSocket {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        self.inner.as_mut().poll_read(cx, buf)
    }
}

impl AsyncWrite for BoxedSocket {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.inner.as_mut().poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.inner.as_mut().poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.inner.as_mut().poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::client::SecureSocket;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_boxed_socket_passes_bytes_through() {
        let (a, mut b) = tokio::io::duplex(64);
        let mut boxed = BoxedSocket::new(a);
        assert!(!boxed.is_secure());

        boxed.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        b.write_all(b"pong").await.unwrap();
        boxed.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[test]
    fn test_secure_flag_survives_boxing() {
        let (a, _b) = tokio::io::duplex(8);
        assert!(BoxedSocket::new(SecureSocket::new(a)).is_secure());
    }
}
