//! Cache validation hooks.
//!
//! The engine keeps no cache itself. An embedder that does plugs in a
//! [`CacheValidator`], which may answer a request before it is sent or
//! swap a response (a `304` for the stored entry, say) after it arrives.

use crate::http::response::HttpResponse;
use http::{HeaderMap, Method};
use url::Url;

/// What the validator sees of a leg.
#[derive(Debug, Clone, Copy)]
pub struct CacheRequest<'a> {
    pub method: &'a Method,
    pub url: &'a Url,
    pub headers: &'a HeaderMap,
}

/// Verdict on a response from the network.
#[derive(Debug)]
pub enum CacheDecision {
    /// Use the network response as is.
    Accept,
    /// Use this response instead.
    Replace(HttpResponse),
    /// The cached entry cannot be used; send the request again to the
    /// origin without validators.
    RetryAgainstOrigin,
}

pub trait CacheValidator: Send + Sync + 'static {
    /// Serve the request without touching the network. May also add
    /// validators such as `If-None-Match` to `headers`.
    fn before_submit(&self, request: &CacheRequest<'_>, headers: &mut HeaderMap) -> Option<HttpResponse>;

    /// Inspect a network response.
    fn after_response(&self, request: &CacheRequest<'_>, response: &HttpResponse) -> CacheDecision;
}

/// Validator that never caches.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCache;

impl CacheValidator for NoCache {
    fn before_submit(&self, _request: &CacheRequest<'_>, _headers: &mut HeaderMap) -> Option<HttpResponse> {
        None
    }

    fn after_response(&self, _request: &CacheRequest<'_>, _response: &HttpResponse) -> CacheDecision {
        CacheDecision::Accept
    }
}
