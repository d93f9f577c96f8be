//! The resubmit loop around [`HttpNetworkTransaction`].
//!
//! Each pass runs one leg. Between legs the job decides whether the
//! response stands or the request goes out again: for an auth challenge,
//! a redirect, a cache miss against a stale entry, or a retryable failure.

use crate::base::loadstate::LoadState;
use crate::base::neterror::{FailureClass, NetError};
use crate::http::auth::{self, AuthContext, AuthModule, AuthTarget, Authorization, Credentials};
use crate::http::cache::{CacheDecision, CacheRequest};
use crate::http::requestbody::{discard_stream, RequestBody, WriteMode};
use crate::http::requesthead::latin1_value;
use crate::http::response::HttpResponse;
use crate::http::retry::{self, FailureAction, FailureRecord};
use crate::http::transaction::HttpNetworkTransaction;
use crate::socket::connectjob::ConnectTarget;
use crate::socket::proxy::ProxySettings;
use crate::urlrequest::context::URLRequestContext;
use crate::urlrequest::request::{Request, RequestState};
use http::header::{AUTHORIZATION, CONTENT_TYPE, LOCATION, REFERER};
use http::{HeaderMap, HeaderName, Method};
use std::sync::Arc;
use url::Url;

/// What to do after a response.
enum Resubmit {
    No,
    Auth { target: AuthTarget, module: Arc<dyn AuthModule>, authorization: Authorization, extra_retry: bool },
    Redirect { url: Url, method: Method, count: u32 },
}

impl Resubmit {
    /// The next leg sends the current body again.
    fn keeps_body(&self, current: &Method) -> bool {
        match self {
            Resubmit::Redirect { method, .. } => method == current,
            _ => true,
        }
    }
}

pub struct URLRequestHttpJob {
    context: Arc<URLRequestContext>,
    request: Arc<Request>,
    proxy: Option<ProxySettings>,
    failures: FailureRecord,
    /// Header names the cache validator added to the current leg.
    validators: Vec<HeaderName>,
    bypass_cache: bool,
}

impl URLRequestHttpJob {
    pub fn new(context: Arc<URLRequestContext>, request: Arc<Request>) -> Self {
        let proxy = request.options().proxies.first().cloned();
        Self { context, request, proxy, failures: FailureRecord::default(), validators: Vec::new(), bypass_cache: false }
    }

    pub fn request(&self) -> &Arc<Request> {
        &self.request
    }

    /// Run the request to its final response or error.
    pub async fn start(&mut self) -> Result<HttpResponse, NetError> {
        let request = Arc::clone(&self.request);
        let result = match request.options().timeout {
            Some(timeout) => {
                let run = self.run();
                tokio::pin!(run);
                tokio::select! {
                    result = &mut run => result,
                    _ = tokio::time::sleep(timeout) => {
                        tracing::debug!(request = request.id(), ?timeout, "request timed out");
                        request.abort_internal();
                        run.await
                    }
                }
            }
            None => self.run().await,
        };

        self.release_affinity();
        match &result {
            Ok(resp) => {
                tracing::debug!(request = request.id(), status = resp.status().as_u16(), "request complete");
                request.set_load_state(LoadState::Complete);
            }
            Err(e) => {
                tracing::debug!(request = request.id(), error = %e, "request failed");
                request.set_load_state(LoadState::Faulted);
            }
        }
        result
    }

    async fn run(&mut self) -> Result<HttpResponse, NetError> {
        loop {
            if self.request.is_aborted() {
                return Err(self.request.abort_error());
            }

            let target = self.connect_target()?;
            self.request.state().proxy = target.proxy.clone();
            self.pre_authenticate();
            if let Some(resp) = self.consult_cache() {
                return Ok(resp);
            }

            let mut transaction =
                HttpNetworkTransaction::new(Arc::clone(self.context.pool()), Arc::clone(&self.request), target);
            let result = transaction.start().await;

            let failure = match result {
                Ok(response) => match self.process_response(response).await? {
                    Some(response) => return Ok(response),
                    None => {
                        self.request.set_load_state(LoadState::Resubmitting);
                        continue;
                    }
                },
                Err(failure) => failure,
            };

            if self.request.is_aborted() {
                return Err(self.request.abort_error());
            }
            self.failures.record(failure);
            let once_failed = {
                let mut st = self.request.state();
                let before = st.once_failed;
                if failure.class == FailureClass::Recoverable {
                    st.once_failed = true;
                }
                before
            };
            let next_proxy = self
                .proxy
                .as_ref()
                .and_then(|p| self.request.options().proxies.next_after(p))
                .cloned();

            match retry::failure_action(&failure, once_failed, next_proxy.is_some()) {
                FailureAction::Resubmit(reason) => {
                    tracing::debug!(request = self.request.id(), ?reason, error = %failure.error, "resubmitting");
                }
                FailureAction::Failover => {
                    tracing::warn!(
                        request = self.request.id(),
                        error = %failure.error,
                        "proxy failed, trying next"
                    );
                    self.proxy = next_proxy;
                    let mut st = self.request.state();
                    st.proxy_auth.clear();
                    st.headers.remove(AuthTarget::Proxy.authorization_header());
                }
                FailureAction::Surface => {
                    let last = self.failures.last().unwrap_or(failure);
                    return Err(last.error);
                }
            }
            self.request.set_load_state(LoadState::Resubmitting);
        }
    }

    fn connect_target(&self) -> Result<ConnectTarget, NetError> {
        let url = self.request.url();
        let scheme = url.scheme();
        if scheme != "http" && scheme != "https" {
            return Err(NetError::DisallowedUrlScheme);
        }
        Ok(ConnectTarget {
            scheme: scheme.to_string(),
            host: url.host_str().ok_or(NetError::InvalidUrl)?.to_string(),
            port: url.port_or_known_default().ok_or(NetError::InvalidUrl)?,
            proxy: self.proxy.clone(),
        })
    }

    /// Offer cached credentials before the server asks.
    fn pre_authenticate(&self) {
        let mut guard = self.request.state();
        let st = &mut *guard;
        if st.server_auth.is_engaged() || st.headers.contains_key(AUTHORIZATION) {
            return;
        }
        let Some((host, port)) = origin_of(&st.url) else {
            return;
        };
        let ctx = AuthContext {
            target: AuthTarget::Server,
            url: &st.url,
            host: &host,
            port,
            method: &st.method,
            credentials: st.credentials.as_ref(),
        };
        let Some((module, authorization)) = auth::pre_authenticate(self.context.auth_modules(), &ctx) else {
            return;
        };
        let Ok(value) = latin1_value(&authorization.value) else {
            return;
        };
        tracing::trace!(request = self.request.id(), scheme = module.scheme(), "pre-authenticating");
        st.headers.insert(AUTHORIZATION, value);
        st.server_auth.module = Some(module);
        st.server_auth.authorization = Some(authorization);
        st.server_auth.pre_authenticated = true;
    }

    fn consult_cache(&mut self) -> Option<HttpResponse> {
        let mut st = self.request.state();
        for name in self.validators.drain(..) {
            st.headers.remove(name);
        }
        if self.bypass_cache {
            return None;
        }
        let req = CacheRequest { method: &st.method, url: &st.url, headers: &st.headers };
        let mut extra = HeaderMap::new();
        if let Some(resp) = self.context.cache().before_submit(&req, &mut extra) {
            tracing::debug!(request = self.request.id(), "served by cache");
            return Some(resp);
        }
        for name in extra.keys() {
            st.headers.remove(name);
            for value in extra.get_all(name) {
                st.headers.append(name.clone(), value.clone());
            }
            self.validators.push(name.clone());
        }
        None
    }

    /// Decide whether `response` is final. `None` means another leg was
    /// prepared.
    async fn process_response(&mut self, response: HttpResponse) -> Result<Option<HttpResponse>, NetError> {
        let response = match self.after_cache(response) {
            Some(response) => response,
            None => return Ok(None),
        };
        self.observe_auth(&response);

        let decision = loop {
            let decision = self.check_resubmit(&response)?;
            if matches!(decision, Resubmit::No) {
                break decision;
            }
            if self.write_wait(&decision).await? {
                continue;
            }
            break decision;
        };

        if matches!(decision, Resubmit::No) {
            return Ok(Some(response));
        }

        let config = self.context.config();
        if let Err(e) = response.drain(config.drain_limit, config.drain_timeout).await {
            tracing::debug!(request = self.request.id(), error = %e, "intermediate response not drained");
        }
        self.apply(decision);
        Ok(None)
    }

    /// Let the cache validator look at a network response. `None` when it
    /// asked for a fresh request to the origin.
    fn after_cache(&mut self, response: HttpResponse) -> Option<HttpResponse> {
        let decision = {
            let st = self.request.state();
            let req = CacheRequest { method: &st.method, url: &st.url, headers: &st.headers };
            self.context.cache().after_response(&req, &response)
        };
        match decision {
            CacheDecision::Accept => Some(response),
            CacheDecision::Replace(replacement) => Some(replacement),
            CacheDecision::RetryAgainstOrigin => {
                tracing::debug!(request = self.request.id(), "cache entry rejected, retrying origin");
                self.bypass_cache = true;
                let config = self.context.config();
                let (limit, timeout) = (config.drain_limit, config.drain_timeout);
                tokio::spawn(async move {
                    let _ = response.drain(limit, timeout).await;
                });
                None
            }
        }
    }

    /// Tell modules whose credentials were accepted. Proxy first.
    fn observe_auth(&self, response: &HttpResponse) {
        let status = response.status().as_u16();
        let mut guard = self.request.state();
        let st = &mut *guard;
        for target in [AuthTarget::Proxy, AuthTarget::Server] {
            let (state, endpoint) = match target {
                AuthTarget::Proxy => (&mut st.proxy_auth, st.proxy.as_ref().and_then(|p| p.host_port())),
                AuthTarget::Server => (&mut st.server_auth, st.url.host_str().zip(st.url.port_or_known_default())),
            };
            if status == target.status() || !(state.attempted || state.pre_authenticated) {
                continue;
            }
            let (Some(module), Some(authorization), Some((host, port))) =
                (state.module.clone(), state.authorization.clone(), endpoint)
            else {
                continue;
            };
            let credentials = match target {
                AuthTarget::Server => st.credentials.clone(),
                AuthTarget::Proxy => st.proxy.as_ref().and_then(proxy_credentials),
            };
            let ctx = AuthContext {
                target,
                url: &st.url,
                host,
                port,
                method: &st.method,
                credentials: credentials.as_ref(),
            };
            module.on_success(&authorization, &ctx);
            tracing::trace!(request = self.request.id(), ?target, scheme = module.scheme(), "auth accepted");
            state.attempted = false;
            state.pre_authenticated = false;
            if state.requires_affinity() {
                if let Some(conn) = st.affinity.take().and_then(|w| w.upgrade()) {
                    conn.unlock(&self.request);
                }
            }
        }
    }

    fn check_resubmit(&self, response: &HttpResponse) -> Result<Resubmit, NetError> {
        let status = response.status().as_u16();
        match status {
            401 => Ok(self.check_resubmit_for_auth(AuthTarget::Server, response)),
            407 => Ok(self.check_resubmit_for_auth(AuthTarget::Proxy, response)),
            300 | 301 | 302 | 303 | 307 | 308 if self.request.options().allow_auto_redirect => {
                self.check_resubmit_for_redirect(status, response)
            }
            _ => Ok(Resubmit::No),
        }
    }

    fn check_resubmit_for_auth(&self, target: AuthTarget, response: &HttpResponse) -> Resubmit {
        let challenges = auth::challenges(response.headers(), target);
        let st = self.request.state();
        let state = match target {
            AuthTarget::Server => &st.server_auth,
            AuthTarget::Proxy => &st.proxy_auth,
        };

        // A challenge answered with a complete authorization was refused.
        // Credentials sent up front get one more try against the fresh
        // challenge.
        let mut extra_retry = false;
        if state.attempted && state.authorization.as_ref().is_some_and(|a| a.complete) {
            return Resubmit::No;
        }
        if state.pre_authenticated {
            if st.extra_401_retry {
                return Resubmit::No;
            }
            extra_retry = true;
        }

        let endpoint = match target {
            AuthTarget::Server => origin_of(&st.url),
            AuthTarget::Proxy => st.proxy.as_ref().and_then(|p| p.host_port()).map(|(h, p)| (h.to_string(), p)),
        };
        let Some((host, port)) = endpoint else {
            return Resubmit::No;
        };
        let credentials = match target {
            AuthTarget::Server => st.credentials.clone(),
            AuthTarget::Proxy => st.proxy.as_ref().and_then(proxy_credentials),
        };
        let ctx = AuthContext {
            target,
            url: &st.url,
            host: &host,
            port,
            method: &st.method,
            credentials: credentials.as_ref(),
        };
        match auth::answer_challenge(self.context.auth_modules(), &challenges, &ctx) {
            Some((module, authorization)) => Resubmit::Auth { target, module, authorization, extra_retry },
            None => {
                tracing::debug!(request = self.request.id(), ?target, "no module answered the challenge");
                Resubmit::No
            }
        }
    }

    fn check_resubmit_for_redirect(&self, status: u16, response: &HttpResponse) -> Result<Resubmit, NetError> {
        let Some(location) = response.headers().get(LOCATION) else {
            return Ok(Resubmit::No);
        };
        let location = std::str::from_utf8(location.as_bytes()).map_err(|_| NetError::InvalidRedirect)?;
        let st = self.request.state();
        let url = st.url.join(location.trim()).map_err(|_| NetError::InvalidRedirect)?;
        if url.scheme() != "http" && url.scheme() != "https" {
            tracing::warn!(request = self.request.id(), location, "redirect to unsupported scheme");
            return Err(NetError::InvalidRedirect);
        }

        let count = st.redirects + 1;
        if count > self.request.options().max_redirects {
            return Err(NetError::TooManyRedirects);
        }

        let method = match status {
            300 | 301 | 302 if st.method == Method::POST => Method::GET,
            303 if st.method != Method::HEAD => Method::GET,
            _ => st.method.clone(),
        };
        Ok(Resubmit::Redirect { url, method, count })
    }

    /// A body the caller is still producing must be finished before the
    /// next leg. Returns true when the decision has to be made again.
    async fn write_wait(&self, decision: &Resubmit) -> Result<bool, NetError> {
        if self.request.options().allow_write_buffering {
            return Ok(false);
        }
        let keeps_body = {
            let st = self.request.state();
            if !st.body.is_stream() {
                return Ok(false);
            }
            decision.keeps_body(&st.method)
        };
        let partial = self.request.body_started();
        if keeps_body && !partial {
            return Ok(false);
        }

        let body = std::mem::replace(&mut self.request.state().body, RequestBody::Consumed);
        if let RequestBody::Stream { mut stream, .. } = body {
            let discarded = discard_stream(&mut stream).await?;
            tracing::debug!(request = self.request.id(), discarded, "unsent request body discarded");
        }
        if keeps_body {
            return Err(NetError::RequestBodyError);
        }
        Ok(true)
    }

    fn apply(&self, decision: Resubmit) {
        let mut guard = self.request.state();
        let st = &mut *guard;
        match decision {
            Resubmit::No => {}
            Resubmit::Auth { target, module, authorization, extra_retry } => {
                let Ok(value) = latin1_value(&authorization.value) else {
                    return;
                };
                tracing::debug!(request = self.request.id(), ?target, scheme = module.scheme(), "answering challenge");
                st.headers.insert(target.authorization_header(), value);
                if extra_retry {
                    st.extra_401_retry = true;
                }
                let state = match target {
                    AuthTarget::Server => &mut st.server_auth,
                    AuthTarget::Proxy => &mut st.proxy_auth,
                };
                state.module = Some(module);
                state.authorization = Some(authorization);
                state.attempted = true;
                state.pre_authenticated = false;
            }
            Resubmit::Redirect { url, method, count } => {
                tracing::debug!(request = self.request.id(), from = %st.url, to = %url, count, "following redirect");
                if st.url.scheme() == "https" && url.scheme() != "https" {
                    st.headers.remove(REFERER);
                }
                if origin_of(&st.url) != origin_of(&url) || st.url.scheme() != url.scheme() {
                    st.credentials = None;
                }
                if method != st.method {
                    drop_body(st);
                }
                st.headers.remove(AUTHORIZATION);
                st.server_auth.clear();
                if let Some(conn) = st.affinity.take().and_then(|w| w.upgrade()) {
                    conn.unlock(&self.request);
                }
                st.url = url;
                st.method = method;
                st.redirects = count;
                st.extra_401_retry = false;
            }
        }
    }

    fn release_affinity(&self) {
        let conn = self.request.state().affinity.take().and_then(|w| w.upgrade());
        if let Some(conn) = conn {
            conn.unlock(&self.request);
        }
    }
}

fn drop_body(st: &mut RequestState) {
    st.body = RequestBody::Empty;
    st.write_mode = WriteMode::None;
    st.content_length = None;
    st.headers.remove(CONTENT_TYPE);
}

fn origin_of(url: &Url) -> Option<(String, u16)> {
    Some((url.host_str()?.to_ascii_lowercase(), url.port_or_known_default()?))
}

fn proxy_credentials(proxy: &ProxySettings) -> Option<Credentials> {
    Some(Credentials::new(proxy.username.clone()?, proxy.password.clone().unwrap_or_default()))
}
