//! Blocking client.
//!
//! Drives the same engine on a current-thread runtime owned by the client,
//! so the calling thread blocks for connection acquisition and reads.
//! Must not be used from inside an async runtime.

use crate::base::context::IoResultExt;
use crate::base::neterror::NetError;
use crate::client::{self, ClientBuilder};
use crate::http::requestbody::RequestBody;
use crate::http::response::HttpResponse;
use crate::urlrequest::context::EngineConfig;
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

/// Blocking HTTP client. Clones share the runtime and the pool.
#[derive(Clone, Debug)]
pub struct Client {
    inner: client::Client,
    runtime: Arc<Runtime>,
}

impl Client {
    pub fn new() -> Result<Self, NetError> {
        Self::with_builder(ClientBuilder::default())
    }

    pub fn with_config(config: EngineConfig) -> Result<Self, NetError> {
        Self::with_builder(ClientBuilder::default().config(config))
    }

    /// Build from an async [`ClientBuilder`].
    pub fn with_builder(builder: ClientBuilder) -> Result<Self, NetError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .runtime_context()?;
        let inner = {
            let _enter = runtime.enter();
            builder.build()
        };
        Ok(Self { inner, runtime: Arc::new(runtime) })
    }

    pub fn get<U: AsRef<str>>(&self, url: U) -> RequestBuilder {
        self.request(Method::GET, url)
    }

    pub fn post<U: AsRef<str>>(&self, url: U) -> RequestBuilder {
        self.request(Method::POST, url)
    }

    pub fn put<U: AsRef<str>>(&self, url: U) -> RequestBuilder {
        self.request(Method::PUT, url)
    }

    pub fn request<U: AsRef<str>>(&self, method: Method, url: U) -> RequestBuilder {
        RequestBuilder { inner: self.inner.request(method, url), runtime: Arc::clone(&self.runtime) }
    }
}

pub struct RequestBuilder {
    inner: client::RequestBuilder,
    runtime: Arc<Runtime>,
}

impl RequestBuilder {
    pub fn header<K: AsRef<str>, V: AsRef<str>>(mut self, key: K, value: V) -> Self {
        self.inner = self.inner.header(key, value);
        self
    }

    /// Only in-memory bodies; a stream would need the runtime to produce it.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.inner = self.inner.body(RequestBody::Bytes(body.into()));
        self
    }

    pub fn basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.inner = self.inner.basic_auth(username, password);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.inner = self.inner.timeout(timeout);
        self
    }

    /// Send the request and wait for the response head.
    pub fn send(self) -> Result<Response, NetError> {
        let inner = self.runtime.block_on(self.inner.send())?;
        Ok(Response { inner, runtime: self.runtime })
    }
}

/// Response whose body is read on the client's runtime.
#[derive(Debug)]
pub struct Response {
    inner: HttpResponse,
    runtime: Arc<Runtime>,
}

impl Response {
    pub fn status(&self) -> StatusCode {
        self.inner.status()
    }

    pub fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    pub fn url(&self) -> &url::Url {
        self.inner.url()
    }

    pub fn bytes(self) -> Result<Bytes, NetError> {
        self.runtime.block_on(self.inner.bytes())
    }

    pub fn text(self) -> Result<String, NetError> {
        self.runtime.block_on(self.inner.text())
    }

    #[cfg(feature = "json")]
    pub fn json<T: serde::de::DeserializeOwned>(self) -> Result<T, NetError> {
        self.runtime.block_on(self.inner.json())
    }

    /// The async response. Its body can only be read on this client's
    /// runtime.
    pub fn into_inner(self) -> HttpResponse {
        self.inner
    }
}
