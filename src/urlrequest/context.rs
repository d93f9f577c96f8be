//! Engine configuration and the shared request context.
//!
//! [`EngineConfig`] is a plain struct with defaults; [`URLRequestContext`]
//! bundles the connection pool, the cache validator and a frozen view of
//! the process-wide registry (auth modules, default proxy).

use crate::http::auth::{AuthModule, BasicAuthModule};
use crate::http::cache::{CacheValidator, NoCache};
use crate::socket::authcache::AuthCache;
use crate::socket::connectjob::{Connector, TcpConnector};
use crate::socket::pool::ConnectionPool;
use crate::socket::proxy::{ProxyChain, ProxySettings};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;

/// Configuration options for the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum connections per connection group.
    pub max_connections_per_group: usize,

    /// A connection idle for longer is stale and gets closed.
    pub max_idle_time: Duration,

    /// Connections older than this stop being kept alive.
    pub lease_timeout: Option<Duration>,

    /// How often the pool sweeps idle connections.
    pub cleanup_interval: Duration,

    pub connect_timeout: Option<Duration>,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,

    /// Whole exchange, redirects and retries included.
    pub request_timeout: Option<Duration>,

    /// How long to wait for `100 Continue` before sending the body anyway.
    pub continue_timeout: Duration,
    pub expect_continue: bool,

    /// Budget shared by the status line and header block.
    pub max_header_bytes: usize,
    pub max_redirects: u32,
    pub allow_auto_redirect: bool,

    /// Retain streamed request bodies so they can be resent.
    pub allow_write_buffering: bool,
    pub keep_alive: bool,
    pub pipelined: bool,

    /// Close after an unauthenticated upload larger than this was refused.
    pub unauthorized_upload_threshold: Option<u64>,

    /// Downgrade a proxy that rejects chunked uploads with a bare 400.
    pub detect_proxy_chunked_downgrade: bool,

    /// Bytes and time an intermediate response may spend draining.
    pub drain_limit: usize,
    pub drain_timeout: Duration,

    pub user_agent: Option<String>,

    /// Proxies in failover order. Empty means the registry default.
    pub proxies: ProxyChain,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_connections_per_group: 6,
            max_idle_time: Duration::from_secs(100),
            lease_timeout: None,
            cleanup_interval: Duration::from_secs(30),
            connect_timeout: None,
            read_timeout: None,
            write_timeout: None,
            request_timeout: None,
            continue_timeout: Duration::from_millis(350),
            expect_continue: true,
            max_header_bytes: 64 * 1024,
            max_redirects: 50,
            allow_auto_redirect: true,
            allow_write_buffering: true,
            keep_alive: true,
            pipelined: true,
            unauthorized_upload_threshold: None,
            detect_proxy_chunked_downgrade: true,
            drain_limit: crate::http::responsebody::DEFAULT_DRAIN_LIMIT,
            drain_timeout: crate::http::responsebody::DEFAULT_DRAIN_TIMEOUT,
            user_agent: Some(concat!("wirenet/", env!("CARGO_PKG_VERSION")).to_string()),
            proxies: ProxyChain::default(),
        }
    }
}

/// Process-wide defaults shared by every context created afterwards.
#[derive(Clone)]
pub struct Registry {
    pub auth_modules: Vec<Arc<dyn AuthModule>>,
    pub default_proxy: Option<ProxySettings>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("auth_modules", &self.auth_modules.iter().map(|m| m.scheme()).collect::<Vec<_>>())
            .field("default_proxy", &self.default_proxy)
            .finish()
    }
}

static REGISTRY: Lazy<RwLock<Arc<Registry>>> = Lazy::new(|| {
    RwLock::new(Arc::new(Registry {
        auth_modules: vec![Arc::new(BasicAuthModule::new(AuthCache::new()))],
        default_proxy: None,
    }))
});

/// Current registry contents.
pub fn registry() -> Arc<Registry> {
    Arc::clone(&REGISTRY.read())
}

/// Add an auth module. A module for the same scheme is replaced.
pub fn register_auth_module(module: Arc<dyn AuthModule>) {
    let mut guard = REGISTRY.write();
    let mut next = Registry::clone(&guard);
    next.auth_modules.retain(|m| !m.scheme().eq_ignore_ascii_case(module.scheme()));
    next.auth_modules.push(module);
    *guard = Arc::new(next);
}

/// Remove the module for `scheme`. Returns whether one was registered.
pub fn unregister_auth_module(scheme: &str) -> bool {
    let mut guard = REGISTRY.write();
    let mut next = Registry::clone(&guard);
    let before = next.auth_modules.len();
    next.auth_modules.retain(|m| !m.scheme().eq_ignore_ascii_case(scheme));
    let removed = next.auth_modules.len() != before;
    *guard = Arc::new(next);
    removed
}

pub fn set_default_proxy(proxy: Option<ProxySettings>) {
    let mut guard = REGISTRY.write();
    let mut next = Registry::clone(&guard);
    next.default_proxy = proxy;
    *guard = Arc::new(next);
}

/// Central state shared by every request of one client.
pub struct URLRequestContext {
    config: Arc<EngineConfig>,
    pool: Arc<ConnectionPool>,
    cache: Arc<dyn CacheValidator>,
    auth_modules: Arc<[Arc<dyn AuthModule>]>,
}

impl std::fmt::Debug for URLRequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("URLRequestContext")
            .field("config", &self.config)
            .field("connections", &self.pool.connection_count())
            .field("auth_modules", &self.auth_modules.len())
            .finish()
    }
}

impl URLRequestContext {
    /// Create a context with default configuration.
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let mut connector = TcpConnector::new();
        if let Some(timeout) = config.connect_timeout {
            connector = connector.with_connect_timeout(timeout);
        }
        Self::with_parts(config, Arc::new(connector), Arc::new(NoCache))
    }

    /// Create a context over a custom transport and cache validator.
    pub fn with_parts(
        mut config: EngineConfig,
        connector: Arc<dyn Connector>,
        cache: Arc<dyn CacheValidator>,
    ) -> Self {
        let registry = registry();
        if config.proxies.is_empty() {
            if let Some(proxy) = registry.default_proxy.clone() {
                config.proxies = ProxyChain::single(proxy);
            }
        }

        let config = Arc::new(config);
        let pool = Arc::new(ConnectionPool::new(connector, Arc::clone(&config)));

        // Idle sweeping needs a runtime; without one, stale connections
        // are still caught when a request picks them.
        if tokio::runtime::Handle::try_current().is_ok() {
            pool.start_cleanup_task();
        }

        Self { config, pool, cache, auth_modules: registry.auth_modules.clone().into() }
    }

    pub fn config(&self) -> &Arc<EngineConfig> {
        &self.config
    }

    /// Get the connection pool.
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn cache(&self) -> &Arc<dyn CacheValidator> {
        &self.cache
    }

    /// Auth modules captured from the registry at construction.
    pub fn auth_modules(&self) -> &[Arc<dyn AuthModule>] {
        &self.auth_modules
    }
}

impl Default for URLRequestContext {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for URLRequestContext {
    fn drop(&mut self) {
        self.pool.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fake;

    impl AuthModule for Fake {
        fn scheme(&self) -> &'static str {
            "X-Fake"
        }

        fn attempt_authenticate(
            &self,
            _challenge: &str,
            _ctx: &crate::http::auth::AuthContext<'_>,
        ) -> Option<crate::http::auth::Authorization> {
            None
        }

        fn pre_authenticate(&self, _ctx: &crate::http::auth::AuthContext<'_>) -> Option<crate::http::auth::Authorization> {
            None
        }
    }

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.max_connections_per_group, 6);
        assert_eq!(config.max_redirects, 50);
        assert_eq!(config.continue_timeout, Duration::from_millis(350));
        assert_eq!(config.max_idle_time, Duration::from_secs(100));
        assert!(config.lease_timeout.is_none());
        assert!(config.allow_write_buffering);
    }

    #[test]
    fn test_registry_has_basic_by_default() {
        assert!(registry().auth_modules.iter().any(|m| m.scheme() == "Basic"));
    }

    #[test]
    fn test_register_and_unregister() {
        register_auth_module(Arc::new(Fake));
        register_auth_module(Arc::new(Fake));
        let count = registry().auth_modules.iter().filter(|m| m.scheme() == "X-Fake").count();
        assert_eq!(count, 1);

        assert!(unregister_auth_module("x-fake"));
        assert!(!unregister_auth_module("x-fake"));
    }

    #[test]
    fn test_context_without_runtime() {
        let ctx = URLRequestContext::new();
        assert_eq!(ctx.pool().connection_count(), 0);
        assert!(!ctx.auth_modules().is_empty());
    }
}
