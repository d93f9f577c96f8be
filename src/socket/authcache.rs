//! Credential cache shared by the Basic module.
//!
//! Entries are keyed by origin and realm. A successful challenge/response
//! leg stores its credentials here so later requests to the same origin
//! can pre-authenticate.

use base64::{engine::general_purpose, Engine as _};
use dashmap::DashMap;
use std::sync::Arc;

/// Cached credentials for one realm.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthEntry {
    /// Realm from WWW-Authenticate or Proxy-Authenticate header
    pub realm: String,
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for AuthEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthEntry")
            .field("realm", &self.realm)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl AuthEntry {
    pub fn basic(
        realm: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self { realm: realm.into(), username: username.into(), password: password.into() }
    }

    /// `Basic base64(user:pass)`.
    pub fn to_header_value(&self) -> String {
        let creds = format!("{}:{}", self.username, self.password);
        format!("Basic {}", general_purpose::STANDARD.encode(creds))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    host: String,
    port: u16,
    realm: String,
}

impl CacheKey {
    fn new(host: &str, port: u16, realm: &str) -> Self {
        Self { host: host.to_ascii_lowercase(), port, realm: realm.to_string() }
    }
}

/// Thread-safe authentication cache.
#[derive(Debug, Clone, Default)]
pub struct AuthCache {
    entries: Arc<DashMap<CacheKey, AuthEntry>>,
}

impl AuthCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, host: &str, port: u16, realm: &str) -> Option<AuthEntry> {
        self.entries.get(&CacheKey::new(host, port, realm)).map(|e| e.clone())
    }

    /// Any entry for the origin, used before a challenge names the realm.
    pub fn lookup_origin(&self, host: &str, port: u16) -> Option<AuthEntry> {
        let host = host.to_ascii_lowercase();
        self.entries
            .iter()
            .find(|e| e.key().host == host && e.key().port == port)
            .map(|e| e.value().clone())
    }

    pub fn store(&self, host: &str, port: u16, realm: &str, entry: AuthEntry) {
        self.entries.insert(CacheKey::new(host, port, realm), entry);
    }

    /// Forget every realm of an origin, e.g. after the server rejected
    /// cached credentials.
    pub fn remove_origin(&self, host: &str, port: u16) {
        let host = host.to_ascii_lowercase();
        self.entries.retain(|k, _| !(k.host == host && k.port == port));
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_and_lookup() {
        let cache = AuthCache::new();
        cache.store("example.com", 8080, "MyRealm", AuthEntry::basic("MyRealm", "user", "pass"));

        let found = cache.lookup("example.com", 8080, "MyRealm").unwrap();
        assert_eq!(found.username, "user");
        assert!(cache.lookup("example.com", 8080, "Other").is_none());
        assert!(cache.lookup("example.com", 80, "MyRealm").is_none());
    }

    #[test]
    fn test_lookup_origin_is_case_insensitive() {
        let cache = AuthCache::new();
        cache.store("Example.COM", 80, "R", AuthEntry::basic("R", "u", "p"));
        assert_eq!(cache.lookup_origin("example.com", 80).unwrap().realm, "R");
        assert!(cache.lookup_origin("example.com", 81).is_none());
    }

    #[test]
    fn test_remove_origin() {
        let cache = AuthCache::new();
        cache.store("a.com", 80, "R1", AuthEntry::basic("R1", "u", "p"));
        cache.store("a.com", 80, "R2", AuthEntry::basic("R2", "u", "p"));
        cache.store("b.com", 80, "R1", AuthEntry::basic("R1", "u", "p"));

        cache.remove_origin("a.com", 80);
        assert_eq!(cache.len(), 1);
        assert!(cache.lookup("b.com", 80, "R1").is_some());
    }

    #[test]
    fn test_header_value_and_debug() {
        let entry = AuthEntry::basic("Realm", "user", "pass");
        assert_eq!(entry.to_header_value(), "Basic dXNlcjpwYXNz");
        assert!(!format!("{:?}", entry).contains("pass\""));
    }
}
