//! Request head serialization.
//!
//! The head is written as one byte per character. Header values that
//! came in as strings go through [`latin1_value`] first.

use crate::base::neterror::NetError;
use crate::http::framer::HttpBehaviour;
use crate::http::requestbody::WriteMode;
use crate::socket::proxy::ProxySettings;
use bytes::{BufMut, Bytes, BytesMut};
use http::header::{
    HeaderName, CONNECTION, CONTENT_LENGTH, EXPECT, HOST, PROXY_AUTHORIZATION, TRANSFER_ENCODING, USER_AGENT,
};
use http::{HeaderMap, HeaderValue, Method};
use url::Url;

/// Headers the engine owns. Caller values for these are replaced.
const MANAGED: &[&str] =
    &["host", "content-length", "transfer-encoding", "connection", "proxy-connection", "expect", "keep-alive"];

/// Everything needed to write one request head.
#[derive(Debug, Clone, Copy)]
pub struct RequestHead<'a> {
    pub method: &'a Method,
    pub url: &'a Url,
    pub headers: &'a HeaderMap,
    pub write_mode: WriteMode,
    pub content_length: Option<u64>,
    pub expect_continue: bool,
    pub keep_alive: bool,
    pub behaviour: HttpBehaviour,
    /// Plain-http request through this proxy: absolute-form target and
    /// `Proxy-Connection`.
    pub proxy: Option<&'a ProxySettings>,
    pub user_agent: Option<&'a str>,
}

impl RequestHead<'_> {
    /// Request target as sent on the request line.
    pub fn target(&self) -> String {
        if self.proxy.is_some() {
            let mut absolute = self.url.clone();
            absolute.set_fragment(None);
            return absolute.to_string();
        }
        let mut target = self.url.path().to_string();
        if target.is_empty() {
            target.push('/');
        }
        if let Some(query) = self.url.query() {
            target.push('?');
            target.push_str(query);
        }
        target
    }

    fn host_value(&self) -> Result<String, NetError> {
        let host = self.url.host_str().ok_or(NetError::InvalidUrl)?;
        Ok(match self.url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        })
    }

    /// Serialize the head, terminated by the empty line.
    pub fn encode(&self) -> Result<Bytes, NetError> {
        let mut out = BytesMut::with_capacity(256);
        put_latin1(&mut out, self.method.as_str())?;
        out.put_u8(b' ');
        put_latin1(&mut out, &self.target())?;
        out.put_slice(b" HTTP/1.1\r\n");

        put_header(&mut out, HOST.as_str(), self.host_value()?.as_bytes());

        for (name, value) in self.headers {
            if MANAGED.contains(&name.as_str()) {
                continue;
            }
            if name == PROXY_AUTHORIZATION && self.proxy.is_none() {
                continue;
            }
            put_header(&mut out, name.as_str(), value.as_bytes());
        }

        if !self.headers.contains_key(USER_AGENT) {
            if let Some(agent) = self.user_agent {
                put_header(&mut out, USER_AGENT.as_str(), agent.as_bytes());
            }
        }

        match self.write_mode {
            WriteMode::Chunked => put_header(&mut out, TRANSFER_ENCODING.as_str(), b"chunked"),
            WriteMode::ContentLength | WriteMode::Buffered => {
                let len = self.content_length.unwrap_or(0).to_string();
                put_header(&mut out, CONTENT_LENGTH.as_str(), len.as_bytes());
            }
            WriteMode::None => {}
        }

        if self.expect_continue {
            put_header(&mut out, EXPECT.as_str(), b"100-continue");
        }

        let connection: &[u8] = if !self.keep_alive {
            b"close"
        } else if self.behaviour != HttpBehaviour::Http11 {
            b"Keep-Alive"
        } else {
            b""
        };
        if !connection.is_empty() {
            let name = if self.proxy.is_some() { "proxy-connection" } else { CONNECTION.as_str() };
            put_header(&mut out, name, connection);
        }

        if let Some(proxy) = self.proxy {
            if !self.headers.contains_key(PROXY_AUTHORIZATION) {
                if let Some(auth) = proxy.get_auth_header() {
                    put_header(&mut out, PROXY_AUTHORIZATION.as_str(), auth.as_bytes());
                }
            }
        }

        out.put_slice(b"\r\n");
        Ok(out.freeze())
    }
}

fn put_header(out: &mut BytesMut, name: &str, value: &[u8]) {
    out.put_slice(name.as_bytes());
    out.put_slice(b": ");
    out.put_slice(value);
    out.put_slice(b"\r\n");
}

fn put_latin1(out: &mut BytesMut, s: &str) -> Result<(), NetError> {
    for c in s.chars() {
        out.put_u8(u8::try_from(u32::from(c)).map_err(|_| NetError::InvalidHeader)?);
    }
    Ok(())
}

/// A header value from a string, one byte per character.
/// Characters above U+00FF and control characters other than tab are rejected.
pub fn latin1_value(s: &str) -> Result<HeaderValue, NetError> {
    let mut bytes = BytesMut::with_capacity(s.len());
    put_latin1(&mut bytes, s)?;
    HeaderValue::from_maybe_shared(bytes.freeze()).map_err(|_| NetError::InvalidHeader)
}

/// A header name from a string.
pub fn header_name(s: &str) -> Result<HeaderName, NetError> {
    HeaderName::from_bytes(s.as_bytes()).map_err(|_| NetError::InvalidHeader)
}
