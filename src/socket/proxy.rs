//! Proxy settings and failover chain.

use url::Url;

/// One HTTP proxy.
#[derive(Clone, PartialEq, Eq)]
pub struct ProxySettings {
    /// Proxy URL (e.g., `http://proxy.com:8080`)
    pub url: Url,
    /// Proxy username for authentication
    pub username: Option<String>,
    /// Proxy password
    pub password: Option<String>,
}

impl std::fmt::Debug for ProxySettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxySettings")
            .field("url", &self.url.as_str())
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl ProxySettings {
    /// Create proxy settings from URL string.
    pub fn new(url_str: &str) -> Option<Self> {
        let url = Url::parse(url_str).ok()?;
        if url.scheme() != "http" {
            return None;
        }
        Some(Self { url, username: None, password: None })
    }

    /// Create proxy from environment variables.
    ///
    /// Checks `HTTP_PROXY`/`http_proxy`.
    pub fn from_env() -> Option<Self> {
        let url_str = std::env::var("HTTP_PROXY").or_else(|_| std::env::var("http_proxy")).ok()?;
        Self::new(&url_str)
    }

    /// Add authentication credentials.
    pub fn with_auth(mut self, user: &str, pass: &str) -> Self {
        self.username = Some(user.to_string());
        self.password = Some(pass.to_string());
        self
    }

    /// Get `Proxy-Authorization` header value.
    pub fn get_auth_header(&self) -> Option<String> {
        if let (Some(u), Some(p)) = (&self.username, &self.password) {
            use base64::{engine::general_purpose, Engine as _};
            let creds = format!("{}:{}", u, p);
            let encoded = general_purpose::STANDARD.encode(creds);
            Some(format!("Basic {}", encoded))
        } else {
            None
        }
    }

    /// Get proxy host and port.
    pub fn host_port(&self) -> Option<(&str, u16)> {
        let host = self.url.host_str()?;
        let port = self.url.port().unwrap_or(80);
        Some((host, port))
    }
}

/// Ordered proxies tried one after another when a proxy fails.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyChain {
    proxies: Vec<ProxySettings>,
}

impl ProxyChain {
    pub fn new(proxies: Vec<ProxySettings>) -> Self {
        Self { proxies }
    }

    /// A chain holding one proxy.
    pub fn single(proxy: ProxySettings) -> Self {
        Self { proxies: vec![proxy] }
    }

    pub fn first(&self) -> Option<&ProxySettings> {
        self.proxies.first()
    }

    /// The proxy after `current`, if any.
    pub fn next_after(&self, current: &ProxySettings) -> Option<&ProxySettings> {
        let idx = self.proxies.iter().position(|p| p == current)?;
        self.proxies.get(idx + 1)
    }

    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_header() {
        let proxy = ProxySettings::new("http://proxy.example.com:3128").unwrap().with_auth("user", "pass");
        assert_eq!(proxy.get_auth_header().unwrap(), "Basic dXNlcjpwYXNz");
        assert_eq!(proxy.host_port(), Some(("proxy.example.com", 3128)));
    }

    #[test]
    fn test_only_http_proxies() {
        assert!(ProxySettings::new("socks5://proxy:1080").is_none());
        assert!(ProxySettings::new("not a url").is_none());
    }

    #[test]
    fn test_chain_failover_order() {
        let a = ProxySettings::new("http://a:8080").unwrap();
        let b = ProxySettings::new("http://b:8080").unwrap();
        let chain = ProxyChain::new(vec![a.clone(), b.clone()]);
        assert_eq!(chain.first(), Some(&a));
        assert_eq!(chain.next_after(&a), Some(&b));
        assert_eq!(chain.next_after(&b), None);
    }

    #[test]
    fn test_debug_redacts_password() {
        let proxy = ProxySettings::new("http://p:1").unwrap().with_auth("u", "secret");
        assert!(!format!("{:?}", proxy).contains("secret"));
    }
}
