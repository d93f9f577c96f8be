//! Authentication plug-in seam and the retry bookkeeping around it.
//!
//! Schemes are [`AuthModule`]s looked up from the process-wide registry.
//! The engine only drives the protocol: pre-authenticate before a leg,
//! answer a 401/407 challenge with a new leg, and remember what worked.

use crate::socket::authcache::{AuthCache, AuthEntry};
use http::header::{HeaderMap, HeaderName, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION, WWW_AUTHENTICATE};
use http::Method;
use std::sync::Arc;
use url::Url;

/// Who is asking for credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthTarget {
    Server,
    Proxy,
}

impl AuthTarget {
    pub fn status(self) -> u16 {
        match self {
            AuthTarget::Server => 401,
            AuthTarget::Proxy => 407,
        }
    }

    pub fn challenge_header(self) -> HeaderName {
        match self {
            AuthTarget::Server => WWW_AUTHENTICATE,
            AuthTarget::Proxy => PROXY_AUTHENTICATE,
        }
    }

    pub fn authorization_header(self) -> HeaderName {
        match self {
            AuthTarget::Server => http::header::AUTHORIZATION,
            AuthTarget::Proxy => PROXY_AUTHORIZATION,
        }
    }
}

/// A username/password pair.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self { username: username.into(), password: password.into() }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// What a module gets to see of the request.
#[derive(Debug, Clone, Copy)]
pub struct AuthContext<'a> {
    pub target: AuthTarget,
    pub url: &'a Url,
    pub host: &'a str,
    pub port: u16,
    pub method: &'a Method,
    pub credentials: Option<&'a Credentials>,
}

/// A header value produced by a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authorization {
    pub value: String,
    /// No further round trips are needed.
    pub complete: bool,
    pub realm: Option<String>,
}

/// An authentication scheme.
pub trait AuthModule: Send + Sync + 'static {
    /// Scheme token as it appears in challenges, e.g. `Basic`.
    fn scheme(&self) -> &'static str;

    /// Answer one challenge. `None` when the module cannot.
    fn attempt_authenticate(&self, challenge: &str, ctx: &AuthContext<'_>) -> Option<Authorization>;

    /// Produce a header before any challenge was seen.
    fn pre_authenticate(&self, ctx: &AuthContext<'_>) -> Option<Authorization>;

    /// Multi-leg handshakes must stay on one connection.
    fn requires_connection_affinity(&self) -> bool {
        false
    }

    /// The server accepted `authorization`.
    fn on_success(&self, _authorization: &Authorization, _ctx: &AuthContext<'_>) {}
}

/// Per request, per target authentication progress.
#[derive(Default, Clone)]
pub struct AuthState {
    pub module: Option<Arc<dyn AuthModule>>,
    pub authorization: Option<Authorization>,
    /// An answer to a challenge was already sent.
    pub attempted: bool,
    /// The header in flight came from `pre_authenticate`.
    pub pre_authenticated: bool,
}

impl std::fmt::Debug for AuthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthState")
            .field("module", &self.module.as_ref().map(|m| m.scheme()))
            .field("attempted", &self.attempted)
            .field("pre_authenticated", &self.pre_authenticated)
            .finish()
    }
}

impl AuthState {
    /// A handshake is in progress.
    pub fn is_engaged(&self) -> bool {
        self.module.is_some()
    }

    pub fn requires_affinity(&self) -> bool {
        self.module.as_ref().map(|m| m.requires_connection_affinity()).unwrap_or(false)
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Challenge values of a 401/407, one per header line.
pub fn challenges(headers: &HeaderMap, target: AuthTarget) -> Vec<String> {
    headers
        .get_all(target.challenge_header())
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// First module able to answer one of the challenges.
pub fn answer_challenge(
    modules: &[Arc<dyn AuthModule>],
    challenges: &[String],
    ctx: &AuthContext<'_>,
) -> Option<(Arc<dyn AuthModule>, Authorization)> {
    for challenge in challenges {
        for module in modules {
            if !starts_with_scheme(challenge, module.scheme()) {
                continue;
            }
            if let Some(auth) = module.attempt_authenticate(challenge, ctx) {
                return Some((Arc::clone(module), auth));
            }
        }
    }
    None
}

/// First module willing to send credentials up front.
pub fn pre_authenticate(
    modules: &[Arc<dyn AuthModule>],
    ctx: &AuthContext<'_>,
) -> Option<(Arc<dyn AuthModule>, Authorization)> {
    modules.iter().find_map(|m| m.pre_authenticate(ctx).map(|a| (Arc::clone(m), a)))
}

fn starts_with_scheme(challenge: &str, scheme: &str) -> bool {
    let token = challenge.split(|c: char| c == ' ' || c == ',').next().unwrap_or("");
    token.eq_ignore_ascii_case(scheme)
}

/// `realm="..."` parameter of a challenge.
pub fn challenge_realm(challenge: &str) -> Option<String> {
    let lower = challenge.to_ascii_lowercase();
    let idx = lower.find("realm=")?;
    let rest = &challenge[idx + "realm=".len()..];
    if let Some(quoted) = rest.strip_prefix('"') {
        let end = quoted.find('"')?;
        Some(quoted[..end].to_string())
    } else {
        let end = rest.find([',', ' ']).unwrap_or(rest.len());
        Some(rest[..end].to_string())
    }
}

/// `Basic` over the shared [`AuthCache`].
#[derive(Debug, Clone, Default)]
pub struct BasicAuthModule {
    cache: AuthCache,
}

impl BasicAuthModule {
    pub fn new(cache: AuthCache) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &AuthCache {
        &self.cache
    }
}

impl AuthModule for BasicAuthModule {
    fn scheme(&self) -> &'static str {
        "Basic"
    }

    fn attempt_authenticate(&self, challenge: &str, ctx: &AuthContext<'_>) -> Option<Authorization> {
        let creds = ctx.credentials?;
        let realm = challenge_realm(challenge).unwrap_or_default();
        let entry = AuthEntry::basic(realm.clone(), creds.username.clone(), creds.password.clone());
        Some(Authorization { value: entry.to_header_value(), complete: true, realm: Some(realm) })
    }

    fn pre_authenticate(&self, ctx: &AuthContext<'_>) -> Option<Authorization> {
        let entry = self.cache.lookup_origin(ctx.host, ctx.port)?;
        if let Some(creds) = ctx.credentials {
            if creds.username != entry.username {
                return None;
            }
        }
        Some(Authorization {
            value: entry.to_header_value(),
            complete: true,
            realm: Some(entry.realm.clone()),
        })
    }

    fn on_success(&self, authorization: &Authorization, ctx: &AuthContext<'_>) {
        let (Some(creds), Some(realm)) = (ctx.credentials, authorization.realm.as_deref()) else {
            return;
        };
        self.cache.store(
            ctx.host,
            ctx.port,
            realm,
            AuthEntry::basic(realm, creds.username.clone(), creds.password.clone()),
        );
    }
}
