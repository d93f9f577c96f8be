use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite};

/// A connected transport: TCP, TLS, or a tunnel through a proxy.
///
/// TLS setup is the transport's business; the engine only asks whether
/// the channel is protected.
pub trait StreamSocket: AsyncRead + AsyncWrite + Unpin + Send + Sync + fmt::Debug + 'static {
    /// Returns true if the channel is TLS protected.
    fn is_secure(&self) -> bool {
        false
    }
}

impl StreamSocket for tokio::net::TcpStream {}

impl StreamSocket for tokio::io::DuplexStream {}

/// Wraps a transport that a custom connector secured, so `is_secure`
/// reports it.
#[derive(Debug)]
pub struct SecureSocket<S> {
    inner: S,
}

impl<S> SecureSocket<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for SecureSocket<S> {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for SecureSocket<S> {
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        std::pin::Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl<S> StreamSocket for SecureSocket<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + Sync + fmt::Debug + 'static,
{
    fn is_secure(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secure_wrapper_reports_secure() {
        let (a, _b) = tokio::io::duplex(64);
        assert!(!a.is_secure());
        let secure = SecureSocket::new(a);
        assert!(secure.is_secure());
    }
}
