//! HTTP Response with body access.

use crate::base::neterror::NetError;
use crate::http::framer;
use crate::http::responsebody::ResponseBody;
use http::{HeaderMap, StatusCode, Version};
use std::time::Duration;
use url::Url;

/// HTTP Response with accessible body.
/// This is the user-facing response type that owns the body.
#[derive(Debug)]
pub struct HttpResponse {
    status: StatusCode,
    version: Version,
    reason: String,
    headers: HeaderMap,
    url: Url,
    body: Option<ResponseBody>,
}

impl HttpResponse {
    pub fn new(
        status: StatusCode,
        version: Version,
        reason: String,
        headers: HeaderMap,
        url: Url,
        body: ResponseBody,
    ) -> Self {
        Self { status, version, reason, headers, url, body: Some(body) }
    }

    #[cfg(test)]
    pub(crate) fn for_test(status: u16, body: &'static [u8]) -> Self {
        Self::new(
            StatusCode::from_u16(status).unwrap(),
            Version::HTTP_11,
            String::new(),
            HeaderMap::new(),
            Url::parse("http://example.com/").unwrap(),
            ResponseBody::full(bytes::Bytes::from_static(body)),
        )
    }

    /// Get the status code.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Get the HTTP version.
    pub fn version(&self) -> Version {
        self.version
    }

    /// Reason phrase exactly as the server sent it.
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Get a reference to the headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The URL that produced this response, after redirects.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Declared `Content-Length`, if valid.
    pub fn content_length(&self) -> Option<u64> {
        framer::parse_content_length(&self.headers).ok().flatten()
    }

    /// Take the response body for consumption.
    /// Can only be called once - subsequent calls return None.
    pub fn take_body(&mut self) -> Option<ResponseBody> {
        self.body.take()
    }

    /// Next piece of the body; `None` at the end or once taken.
    pub async fn chunk(&mut self) -> Result<Option<bytes::Bytes>, NetError> {
        match self.body.as_mut() {
            Some(body) => body.chunk().await,
            None => Ok(None),
        }
    }

    /// Turn a 4xx or 5xx status into [`NetError::HttpStatus`].
    pub fn error_for_status(self) -> Result<Self, NetError> {
        if self.status.is_client_error() || self.status.is_server_error() {
            tracing::debug!(status = self.status.as_u16(), url = %self.url, "error status");
            return Err(NetError::HttpStatus(self.status.as_u16()));
        }
        Ok(self)
    }

    /// Convenience method to consume body as bytes.
    pub async fn bytes(mut self) -> Result<bytes::Bytes, NetError> {
        self.body.take().ok_or(NetError::HttpBodyError)?.bytes().await
    }

    /// Convenience method to consume body as text.
    pub async fn text(mut self) -> Result<String, NetError> {
        self.body.take().ok_or(NetError::HttpBodyError)?.text().await
    }

    /// Convenience method to consume body as JSON.
    #[cfg(feature = "json")]
    pub async fn json<T: serde::de::DeserializeOwned>(mut self) -> Result<T, NetError> {
        self.body.take().ok_or(NetError::HttpBodyError)?.json().await
    }

    /// Discard the body so the connection can serve the next request.
    pub async fn drain(mut self, limit: usize, timeout: Duration) -> Result<(), NetError> {
        match self.body.take() {
            Some(body) => body.drain(limit, timeout).await,
            None => Ok(()),
        }
    }
}
