//! Establishing transports: DNS -> TCP -> (CONNECT tunnel) -> (TLS).
//!
//! The engine only depends on the [`Connector`] trait. [`TcpConnector`] is the
//! stock implementation; TLS is supplied by the embedder through
//! [`TlsUpgrade`].

use crate::base::context::IoResultExt;
use crate::base::neterror::NetError;
use crate::http::headerparser::HeaderBlockParser;
use crate::http::statusline::{HeaderBudget, ParseStatus, StatusLineParser};
use crate::socket::proxy::ProxySettings;
use crate::socket::stream::BoxedSocket;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

pub type ConnectFuture<'a> = Pin<Box<dyn Future<Output = Result<BoxedSocket, NetError>> + Send + 'a>>;

/// Where a connection goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub proxy: Option<ProxySettings>,
}

impl ConnectTarget {
    pub fn is_https(&self) -> bool {
        self.scheme == "https"
    }

    /// A plain-http request through a proxy uses absolute-form targets
    /// and talks HTTP to the proxy itself.
    pub fn uses_proxy_semantics(&self) -> bool {
        self.proxy.is_some() && !self.is_https()
    }

    /// An https request through a proxy runs inside a CONNECT tunnel.
    pub fn is_tunnel(&self) -> bool {
        self.proxy.is_some() && self.is_https()
    }
}

/// Produces connected transports. Roughly equivalent to net::ConnectJob.
pub trait Connector: Send + Sync + 'static {
    fn connect<'a>(&'a self, target: &'a ConnectTarget) -> ConnectFuture<'a>;
}

/// Secures a connected socket for an https origin.
pub trait TlsUpgrade: Send + Sync + 'static {
    fn upgrade<'a>(&'a self, host: &'a str, socket: BoxedSocket) -> ConnectFuture<'a>;
}

/// Plain TCP connector with CONNECT tunnelling and an optional TLS layer.
#[derive(Clone, Default)]
pub struct TcpConnector {
    tls: Option<Arc<dyn TlsUpgrade>>,
    connect_timeout: Option<Duration>,
}

impl std::fmt::Debug for TcpConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnector")
            .field("tls", &self.tls.is_some())
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

impl TcpConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tls(mut self, tls: Arc<dyn TlsUpgrade>) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    async fn connect_tcp(&self, host: &str, port: u16) -> Result<TcpStream, NetError> {
        let addrs = tokio::net::lookup_host((host, port))
            .await
            .map_err(|_| NetError::NameNotResolved)?;

        let mut last_err = NetError::NameNotResolved;
        for addr in addrs {
            let attempt = TcpStream::connect(addr);
            let result = match self.connect_timeout {
                Some(t) => match tokio::time::timeout(t, attempt).await {
                    Ok(r) => r.connection_context(host, port),
                    Err(_) => Err(NetError::ConnectionTimedOut),
                },
                None => attempt.await.connection_context(host, port),
            };
            match result {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    return Ok(stream);
                }
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }

    async fn do_connect(&self, target: &ConnectTarget) -> Result<BoxedSocket, NetError> {
        if target.is_https() && self.tls.is_none() {
            return Err(NetError::DisallowedUrlScheme);
        }

        let socket = match &target.proxy {
            Some(proxy) => {
                let (phost, pport) = proxy.host_port().ok_or(NetError::InvalidUrl)?;
                let mut stream = self
                    .connect_tcp(phost, pport)
                    .await
                    .map_err(|_| NetError::ProxyConnectionFailed)?;
                if target.is_tunnel() {
                    establish_tunnel(&mut stream, &target.host, target.port, proxy).await?;
                }
                BoxedSocket::new(stream)
            }
            None => BoxedSocket::new(self.connect_tcp(&target.host, target.port).await?),
        };

        match (&self.tls, target.is_https()) {
            (Some(tls), true) => tls.upgrade(&target.host, socket).await,
            _ => Ok(socket),
        }
    }
}

impl Connector for TcpConnector {
    fn connect<'a>(&'a self, target: &'a ConnectTarget) -> ConnectFuture<'a> {
        Box::pin(self.do_connect(target))
    }
}

/// Maximum size of a CONNECT response head.
const TUNNEL_HEAD_LIMIT: usize = 16 * 1024;

/// Send `CONNECT host:port` and wait for a 2xx.
pub async fn establish_tunnel<S>(
    stream: &mut S,
    host: &str,
    port: u16,
    proxy: &ProxySettings,
) -> Result<(), NetError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let authority = format!("{}:{}", host, port);
    let mut head = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n", authority, authority);
    if let Some(auth) = proxy.get_auth_header() {
        head.push_str(&format!("Proxy-Authorization: {}\r\n", auth));
    }
    head.push_str("Proxy-Connection: Keep-Alive\r\n\r\n");
    stream.write_all(head.as_bytes()).await.write_context()?;
    stream.flush().await.write_context()?;

    let mut status_parser = StatusLineParser::new();
    let mut header_parser = HeaderBlockParser::new();
    let mut budget = HeaderBudget::new(TUNNEL_HEAD_LIMIT);
    let mut in_headers = false;
    let mut byte = [0u8; 1];

    // One byte at a time: nothing past the head may be consumed.
    loop {
        let n = stream.read(&mut byte).await.read_context()?;
        if n == 0 {
            return Err(NetError::TunnelConnectionFailed);
        }
        let (status, _) = if in_headers {
            header_parser.parse(&byte, &mut budget)
        } else {
            status_parser.parse(&byte, &mut budget)
        };
        match status {
            ParseStatus::NeedMoreData => {}
            ParseStatus::Done if !in_headers => in_headers = true,
            ParseStatus::Done => break,
            ParseStatus::Invalid(_) | ParseStatus::DataTooBig => {
                return Err(NetError::TunnelConnectionFailed)
            }
        }
    }

    let line = status_parser.status_line().ok_or(NetError::TunnelConnectionFailed)?;
    if !(200..300).contains(&line.status) {
        tracing::debug!(status = line.status, proxy = %proxy.url, "CONNECT refused");
        return Err(NetError::TunnelConnectionFailed);
    }
    Ok(())
}
