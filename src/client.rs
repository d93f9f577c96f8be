//! HTTP Client with builder pattern.
//!
//! # Example
//!
//! ```rust,ignore
//! use wirenet::Client;
//!
//! let client = Client::builder()
//!     .timeout(Duration::from_secs(30))
//!     .build();
//!
//! let resp = client.get("http://example.com")
//!     .send()
//!     .await?;
//! ```

use crate::base::neterror::NetError;
use crate::http::auth::Credentials;
use crate::http::cache::{CacheValidator, NoCache};
use crate::http::requestbody::RequestBody;
use crate::http::requesthead::{header_name, latin1_value};
use crate::http::response::HttpResponse;
use crate::socket::connectjob::{Connector, TcpConnector, TlsUpgrade};
use crate::socket::proxy::{ProxyChain, ProxySettings};
use crate::urlrequest::context::{EngineConfig, URLRequestContext};
use crate::urlrequest::job::URLRequestHttpJob;
use crate::urlrequest::request::{ContinueDelegate, Request, RequestOptions, ResponseObserver};
use http::{HeaderMap, Method};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// HTTP Client for making requests.
///
/// Use [`Client::builder()`] to configure and create a client. Clones share
/// the connection pool.
#[derive(Clone, Debug)]
pub struct Client {
    context: Arc<URLRequestContext>,
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Client {
    /// Create a new client with default settings.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Create a new client builder.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    pub fn context(&self) -> &Arc<URLRequestContext> {
        &self.context
    }

    /// Start building a GET request.
    pub fn get<U: AsRef<str>>(&self, url: U) -> RequestBuilder {
        self.request(Method::GET, url)
    }

    /// Start building a POST request.
    pub fn post<U: AsRef<str>>(&self, url: U) -> RequestBuilder {
        self.request(Method::POST, url)
    }

    /// Start building a PUT request.
    pub fn put<U: AsRef<str>>(&self, url: U) -> RequestBuilder {
        self.request(Method::PUT, url)
    }

    /// Start building a DELETE request.
    pub fn delete<U: AsRef<str>>(&self, url: U) -> RequestBuilder {
        self.request(Method::DELETE, url)
    }

    /// Start building a HEAD request.
    pub fn head<U: AsRef<str>>(&self, url: U) -> RequestBuilder {
        self.request(Method::HEAD, url)
    }

    /// Start building a request with custom method.
    pub fn request<U: AsRef<str>>(&self, method: Method, url: U) -> RequestBuilder {
        RequestBuilder {
            client: self.clone(),
            method,
            url: url.as_ref().to_string(),
            headers: HeaderMap::new(),
            body: RequestBody::Empty,
            options: RequestOptions::from_config(self.context.config()),
            observer: None,
            continue_delegate: None,
            error: None,
        }
    }

    /// Run a request built with [`RequestBuilder::build`]. Abort it from
    /// another task with [`Request::abort`].
    pub async fn execute(&self, request: Arc<Request>) -> Result<HttpResponse, NetError> {
        URLRequestHttpJob::new(Arc::clone(&self.context), request).start().await
    }
}

/// Builder for creating a [`Client`].
#[derive(Default)]
pub struct ClientBuilder {
    config: EngineConfig,
    connector: Option<Arc<dyn Connector>>,
    tls: Option<Arc<dyn TlsUpgrade>>,
    cache: Option<Arc<dyn CacheValidator>>,
}

impl ClientBuilder {
    /// Replace the whole configuration.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Set proxy.
    pub fn proxy(mut self, proxy: ProxySettings) -> Self {
        self.config.proxies = ProxyChain::single(proxy);
        self
    }

    /// Proxies tried in order when one fails.
    pub fn proxies(mut self, proxies: ProxyChain) -> Self {
        self.config.proxies = proxies;
        self
    }

    /// Set request timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = Some(timeout);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = Some(timeout);
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = Some(timeout);
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.config.write_timeout = Some(timeout);
        self
    }

    /// Maximum connections per host group.
    pub fn pool_size_per_host(mut self, max: usize) -> Self {
        self.config.max_connections_per_group = max.max(1);
        self
    }

    pub fn max_idle_time(mut self, idle: Duration) -> Self {
        self.config.max_idle_time = idle;
        self
    }

    pub fn lease_timeout(mut self, lease: Option<Duration>) -> Self {
        self.config.lease_timeout = lease;
        self
    }

    pub fn max_redirects(mut self, max: u32) -> Self {
        self.config.max_redirects = max;
        self
    }

    pub fn auto_redirect(mut self, enabled: bool) -> Self {
        self.config.allow_auto_redirect = enabled;
        self
    }

    pub fn keep_alive(mut self, enabled: bool) -> Self {
        self.config.keep_alive = enabled;
        self
    }

    pub fn pipelining(mut self, enabled: bool) -> Self {
        self.config.pipelined = enabled;
        self
    }

    pub fn expect_continue(mut self, enabled: bool) -> Self {
        self.config.expect_continue = enabled;
        self
    }

    pub fn continue_timeout(mut self, timeout: Duration) -> Self {
        self.config.continue_timeout = timeout;
        self
    }

    pub fn write_buffering(mut self, enabled: bool) -> Self {
        self.config.allow_write_buffering = enabled;
        self
    }

    pub fn user_agent(mut self, agent: impl Into<String>) -> Self {
        self.config.user_agent = Some(agent.into());
        self
    }

    /// Transport used for new connections. Replaces the TCP connector.
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// TLS layer for https origins on the default TCP connector.
    pub fn tls(mut self, tls: Arc<dyn TlsUpgrade>) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn cache_validator(mut self, cache: Arc<dyn CacheValidator>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Build the client.
    pub fn build(self) -> Client {
        let connector = self.connector.unwrap_or_else(|| {
            let mut tcp = TcpConnector::new();
            if let Some(timeout) = self.config.connect_timeout {
                tcp = tcp.with_connect_timeout(timeout);
            }
            if let Some(tls) = self.tls {
                tcp = tcp.with_tls(tls);
            }
            Arc::new(tcp)
        });
        let cache = self.cache.unwrap_or_else(|| Arc::new(NoCache));
        Client { context: Arc::new(URLRequestContext::with_parts(self.config, connector, cache)) }
    }
}

/// Builder for a single request.
pub struct RequestBuilder {
    client: Client,
    method: Method,
    url: String,
    headers: HeaderMap,
    body: RequestBody,
    options: RequestOptions,
    observer: Option<ResponseObserver>,
    continue_delegate: Option<ContinueDelegate>,
    error: Option<NetError>,
}

impl RequestBuilder {
    /// Add a header. The value is sent one byte per character.
    pub fn header<K: AsRef<str>, V: AsRef<str>>(mut self, key: K, value: V) -> Self {
        match (header_name(key.as_ref()), latin1_value(value.as_ref())) {
            (Ok(name), Ok(value)) => {
                self.headers.append(name, value);
            }
            (Err(e), _) | (_, Err(e)) => {
                self.error.get_or_insert(e);
            }
        }
        self
    }

    /// Add already-typed headers.
    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers.extend(headers);
        self
    }

    /// Set request body.
    pub fn body<B: Into<RequestBody>>(mut self, body: B) -> Self {
        self.body = body.into();
        self
    }

    /// Set JSON body.
    #[cfg(feature = "json")]
    pub fn json<T: serde::Serialize>(mut self, json: &T) -> Self {
        match serde_json::to_vec(json) {
            Ok(bytes) => {
                self.body = RequestBody::from(bytes);
                self.headers
                    .insert(http::header::CONTENT_TYPE, http::HeaderValue::from_static("application/json"));
            }
            Err(_) => {
                self.error.get_or_insert(NetError::RequestBodyError);
            }
        }
        self
    }

    /// Credentials offered when the server asks.
    pub fn basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.options.credentials = Some(Credentials::new(username, password));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = Some(timeout);
        self
    }

    pub fn keep_alive(mut self, enabled: bool) -> Self {
        self.options.keep_alive = enabled;
        self
    }

    pub fn pipelined(mut self, enabled: bool) -> Self {
        self.options.pipelined = enabled;
        self
    }

    pub fn expect_continue(mut self, enabled: bool) -> Self {
        self.options.expect_continue = enabled;
        self
    }

    pub fn auto_redirect(mut self, enabled: bool) -> Self {
        self.options.allow_auto_redirect = enabled;
        self
    }

    pub fn write_buffering(mut self, enabled: bool) -> Self {
        self.options.allow_write_buffering = enabled;
        self
    }

    /// Requests in different groups never share a connection.
    pub fn connection_group(mut self, name: impl Into<String>) -> Self {
        self.options.connection_group = Some(name.into());
        self
    }

    /// Called once with the status and headers of a `100 Continue`.
    pub fn on_continue<F>(mut self, f: F) -> Self
    where
        F: Fn(u16, &HeaderMap) + Send + Sync + 'static,
    {
        self.continue_delegate = Some(Arc::new(f));
        self
    }

    /// Called with every final response as it is handed over.
    pub fn observe<F>(mut self, f: F) -> Self
    where
        F: Fn(&HttpResponse) + Send + Sync + 'static,
    {
        self.observer = Some(Arc::new(f));
        self
    }

    /// Build the request without sending it.
    pub fn build(self) -> Result<Arc<Request>, NetError> {
        if let Some(e) = self.error {
            return Err(e);
        }
        let url = Url::parse(&self.url).map_err(|_| NetError::InvalidUrl)?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(NetError::DisallowedUrlScheme);
        }
        Ok(Request::with_hooks(
            self.method,
            url,
            self.headers,
            self.body,
            self.options,
            self.observer,
            self.continue_delegate,
        ))
    }

    /// Send the request.
    pub async fn send(self) -> Result<HttpResponse, NetError> {
        let client = self.client.clone();
        let request = self.build()?;
        client.execute(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_applies_config() {
        let client = Client::builder()
            .pool_size_per_host(0)
            .max_redirects(3)
            .timeout(Duration::from_secs(5))
            .proxy(ProxySettings::new("http://proxy:8080").unwrap())
            .build();
        let config = client.context().config();
        assert_eq!(config.max_connections_per_group, 1);
        assert_eq!(config.max_redirects, 3);
        assert_eq!(config.request_timeout, Some(Duration::from_secs(5)));
        assert_eq!(config.proxies.len(), 1);
    }

    #[test]
    fn test_request_builder_options() {
        let client = Client::new();
        let req = client
            .post("http://example.com/upload")
            .header("X-Name", "caf\u{e9}")
            .basic_auth("u", "p")
            .connection_group("uploads")
            .pipelined(false)
            .body("data")
            .build()
            .unwrap();

        assert_eq!(req.method(), Method::POST);
        assert_eq!(req.options().connection_group.as_deref(), Some("uploads"));
        assert!(!req.pipelined());
        assert!(req.options().credentials.is_some());
        assert_eq!(req.state().headers.get("x-name").unwrap().as_bytes(), b"caf\xe9");
    }

    #[test]
    fn test_invalid_inputs_surface_on_build() {
        let client = Client::new();
        assert_eq!(client.get("not a url").build().unwrap_err(), NetError::InvalidUrl);
        assert_eq!(client.get("ftp://example.com/").build().unwrap_err(), NetError::DisallowedUrlScheme);
        assert_eq!(
            client.get("http://example.com/").header("X", "\u{20ac}").build().unwrap_err(),
            NetError::InvalidHeader
        );
    }
}
