//! The request object.
//!
//! One [`Request`] is one logical HTTP exchange. It outlives the legs
//! (retries, redirects, auth round trips) it takes, and is shared between
//! the caller, the resubmit loop and whichever connection currently carries
//! it.
//!
//! Lock order: a connection's state lock may be held while a request is
//! touched, never the reverse. A request never calls into a connection
//! while holding one of its own locks.

use crate::base::loadstate::LoadState;
use crate::base::neterror::{NetError, RequestFailure};
use crate::http::auth::{AuthState, Credentials};
use crate::http::continuegate::ContinueGate;
use crate::http::requestbody::{RequestBody, WriteMode};
use crate::http::response::HttpResponse;
use crate::socket::connection::Connection;
use crate::socket::proxy::{ProxyChain, ProxySettings};
use crate::urlrequest::context::EngineConfig;
use http::{HeaderMap, Method};
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use url::Url;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

const LIVE: u8 = 0;
const ABORTED_BY_CALLER: u8 = 1;
const ABORTED_INTERNALLY: u8 = 2;

/// Runs inside the completion sink for every final response.
pub type ResponseObserver = Arc<dyn Fn(&HttpResponse) + Send + Sync>;

/// Runs once per leg with the status and headers of a `100 Continue`.
pub type ContinueDelegate = Arc<dyn Fn(u16, &HeaderMap) + Send + Sync>;

/// Per request knobs, seeded from [`EngineConfig`].
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub keep_alive: bool,
    pub pipelined: bool,
    pub expect_continue: bool,
    pub continue_timeout: Duration,
    pub allow_auto_redirect: bool,
    pub max_redirects: u32,
    pub allow_write_buffering: bool,
    pub connection_group: Option<String>,
    pub timeout: Option<Duration>,
    pub credentials: Option<Credentials>,
    pub proxies: ProxyChain,
}

impl RequestOptions {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            keep_alive: config.keep_alive,
            pipelined: config.pipelined,
            expect_continue: config.expect_continue,
            continue_timeout: config.continue_timeout,
            allow_auto_redirect: config.allow_auto_redirect,
            max_redirects: config.max_redirects,
            allow_write_buffering: config.allow_write_buffering,
            connection_group: None,
            timeout: config.request_timeout,
            credentials: None,
            proxies: config.proxies.clone(),
        }
    }
}

/// What a leg ended with.
#[derive(Debug, Default)]
pub enum CoreResponse {
    /// Nothing yet.
    #[default]
    Pending,
    /// Completed without a response, or the outcome was already taken.
    NoResponse,
    Response(Box<HttpResponse>),
    Error(RequestFailure),
}

impl CoreResponse {
    pub fn is_pending(&self) -> bool {
        matches!(self, CoreResponse::Pending)
    }
}

/// Permission to write on a connection.
pub struct Grant {
    pub connection: Arc<Connection>,
    /// The connection has no socket yet; the grantee connects it.
    pub reconnect: bool,
}

impl std::fmt::Debug for Grant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Grant")
            .field("connection", &self.connection.id())
            .field("reconnect", &self.reconnect)
            .finish()
    }
}

#[derive(Debug)]
pub enum LegEvent {
    Granted(Grant),
    Completed(CoreResponse),
}

/// Mutable request fields. Changes between legs, not during one.
#[derive(Debug)]
pub struct RequestState {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: RequestBody,
    pub write_mode: WriteMode,
    pub content_length: Option<u64>,
    pub proxy: Option<ProxySettings>,
    pub redirects: u32,
    pub once_failed: bool,
    pub extra_401_retry: bool,
    pub server_auth: AuthState,
    pub proxy_auth: AuthState,
    pub credentials: Option<Credentials>,
    pub saw_100_continue: bool,
    /// Connection an auth handshake is pinned to.
    pub affinity: Option<Weak<Connection>>,
}

#[derive(Debug, Default)]
struct Sink {
    leg: u64,
    core: CoreResponse,
    grant: Option<Grant>,
    /// A completion owns the slot and is running the observer.
    claimed: bool,
}

/// Gives the slot back if the observer unwinds.
struct ClaimGuard<'a> {
    sink: &'a Mutex<Sink>,
    armed: bool,
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.sink.lock().claimed = false;
        }
    }
}

pub struct Request {
    id: u64,
    origin: Url,
    options: RequestOptions,
    state: Mutex<RequestState>,
    aborted: AtomicU8,
    load_state: AtomicU8,
    gate: ContinueGate,
    has_body: AtomicBool,
    headers_completed: AtomicBool,
    body_started: AtomicBool,
    body_complete: AtomicBool,
    upload_halted: AtomicBool,
    keep_alive: AtomicBool,
    abort_hook: Mutex<Option<Weak<Connection>>>,
    sink: Mutex<Sink>,
    sink_notify: Notify,
    observer: Option<ResponseObserver>,
    continue_delegate: Option<ContinueDelegate>,
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("origin", &self.origin.as_str())
            .field("load_state", &self.load_state())
            .field("aborted", &self.aborted.load(Ordering::Acquire))
            .finish()
    }
}

impl Request {
    pub fn new(
        method: Method,
        url: Url,
        headers: HeaderMap,
        body: RequestBody,
        options: RequestOptions,
    ) -> Arc<Self> {
        Self::with_hooks(method, url, headers, body, options, None, None)
    }

    pub fn with_hooks(
        method: Method,
        url: Url,
        headers: HeaderMap,
        body: RequestBody,
        options: RequestOptions,
        observer: Option<ResponseObserver>,
        continue_delegate: Option<ContinueDelegate>,
    ) -> Arc<Self> {
        let credentials = options.credentials.clone();
        let keep_alive = options.keep_alive;
        Arc::new(Self {
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            origin: url.clone(),
            options,
            state: Mutex::new(RequestState {
                method,
                url,
                headers,
                body,
                write_mode: WriteMode::None,
                content_length: None,
                proxy: None,
                redirects: 0,
                once_failed: false,
                extra_401_retry: false,
                server_auth: AuthState::default(),
                proxy_auth: AuthState::default(),
                credentials,
                saw_100_continue: false,
                affinity: None,
            }),
            aborted: AtomicU8::new(LIVE),
            load_state: AtomicU8::new(LoadState::Created as u8),
            gate: ContinueGate::new(),
            has_body: AtomicBool::new(false),
            headers_completed: AtomicBool::new(false),
            body_started: AtomicBool::new(false),
            body_complete: AtomicBool::new(false),
            upload_halted: AtomicBool::new(false),
            keep_alive: AtomicBool::new(keep_alive),
            abort_hook: Mutex::new(None),
            sink: Mutex::new(Sink::default()),
            sink_notify: Notify::new(),
            observer,
            continue_delegate,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// The URL the request was created with. Never changes.
    pub fn origin(&self) -> &Url {
        &self.origin
    }

    /// The current target, after redirects.
    pub fn url(&self) -> Url {
        self.state.lock().url.clone()
    }

    pub fn method(&self) -> Method {
        self.state.lock().method.clone()
    }

    pub fn redirects(&self) -> u32 {
        self.state.lock().redirects
    }

    pub fn options(&self) -> &RequestOptions {
        &self.options
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, RequestState> {
        self.state.lock()
    }

    pub(crate) fn gate(&self) -> &ContinueGate {
        &self.gate
    }

    pub fn load_state(&self) -> LoadState {
        LoadState::from_u8(self.load_state.load(Ordering::Acquire))
    }

    pub(crate) fn set_load_state(&self, state: LoadState) {
        self.load_state.store(state as u8, Ordering::Release);
    }

    /// Start a new leg: fresh completion slot and per-leg flags.
    pub(crate) fn begin_leg(&self) -> u64 {
        let has_body = {
            let st = self.state.lock();
            !st.body.is_empty()
        };
        self.has_body.store(has_body, Ordering::Release);
        self.headers_completed.store(false, Ordering::Release);
        self.body_started.store(false, Ordering::Release);
        self.body_complete.store(false, Ordering::Release);
        self.upload_halted.store(false, Ordering::Release);
        self.keep_alive.store(self.options.keep_alive, Ordering::Release);
        self.gate.reset();

        let mut sink = self.sink.lock();
        sink.leg += 1;
        sink.core = CoreResponse::Pending;
        sink.grant = None;
        sink.leg
    }

    pub(crate) fn current_leg(&self) -> u64 {
        self.sink.lock().leg
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive.load(Ordering::Acquire)
    }

    pub(crate) fn disable_keep_alive(&self) {
        self.keep_alive.store(false, Ordering::Release);
    }

    pub fn pipelined(&self) -> bool {
        self.options.pipelined
    }

    pub fn has_body(&self) -> bool {
        self.has_body.load(Ordering::Acquire)
    }

    pub(crate) fn headers_completed(&self) -> bool {
        self.headers_completed.load(Ordering::Acquire)
    }

    pub(crate) fn set_headers_completed(&self) {
        self.headers_completed.store(true, Ordering::Release);
    }

    pub(crate) fn body_started(&self) -> bool {
        self.body_started.load(Ordering::Acquire)
    }

    pub(crate) fn mark_body_started(&self) {
        self.body_started.store(true, Ordering::Release);
    }

    pub(crate) fn mark_body_complete(&self) {
        self.body_complete.store(true, Ordering::Release);
    }

    /// The server answered with an error while the body was going out.
    pub(crate) fn upload_halted(&self) -> bool {
        self.upload_halted.load(Ordering::Acquire)
    }

    pub(crate) fn auth_engaged(&self) -> bool {
        let st = self.state.lock();
        st.server_auth.is_engaged() || st.proxy_auth.is_engaged()
    }

    pub(crate) fn write_mode(&self) -> WriteMode {
        self.state.lock().write_mode
    }

    pub(crate) fn content_length(&self) -> Option<u64> {
        self.state.lock().content_length
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire) != LIVE
    }

    /// Error the abort surfaces as.
    pub(crate) fn abort_error(&self) -> NetError {
        match self.aborted.load(Ordering::Acquire) {
            ABORTED_INTERNALLY => NetError::TimedOut,
            _ => NetError::RequestCanceled,
        }
    }

    /// Cancel the request. Only the first abort has any effect.
    pub fn abort(&self) -> bool {
        self.abort_with(ABORTED_BY_CALLER)
    }

    /// Engine-initiated abort, e.g. the overall timeout expired.
    pub(crate) fn abort_internal(&self) -> bool {
        self.abort_with(ABORTED_INTERNALLY)
    }

    fn abort_with(&self, code: u8) -> bool {
        if self
            .aborted
            .compare_exchange(LIVE, code, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        tracing::debug!(request = self.id, code, "request aborted");

        let hook = self.abort_hook.lock().take();
        if let Some(conn) = hook.and_then(|w| w.upgrade()) {
            conn.abort_or_disassociate(self);
        }
        self.gate.signal();
        let leg = self.current_leg();
        self.set_response(leg, CoreResponse::Error(RequestFailure::fatal(self.abort_error())));
        true
    }

    pub(crate) fn set_abort_hook(&self, conn: Weak<Connection>) {
        *self.abort_hook.lock() = Some(conn);
    }

    pub(crate) fn clear_abort_hook(&self) {
        self.abort_hook.lock().take();
    }

    /// Hand this leg permission to write.
    pub(crate) fn grant(&self, leg: u64, grant: Grant) {
        let mut sink = self.sink.lock();
        if sink.leg != leg {
            return;
        }
        sink.grant = Some(grant);
        drop(sink);
        self.sink_notify.notify_one();
    }

    /// Complete `leg`. Returns false for a stale leg or a second completion.
    pub(crate) fn set_response(&self, leg: u64, core: CoreResponse) -> bool {
        let observe = matches!(core, CoreResponse::Response(_)) && self.observer.is_some();
        {
            let mut sink = self.sink.lock();
            if sink.leg != leg || !sink.core.is_pending() || sink.claimed {
                return false;
            }
            if !observe {
                sink.core = core;
                drop(sink);
                self.sink_notify.notify_one();
                return true;
            }
            sink.claimed = true;
        }

        // The slot is ours: an abort racing the observer loses.
        let mut guard = ClaimGuard { sink: &self.sink, armed: true };
        if let (CoreResponse::Response(resp), Some(observer)) = (&core, &self.observer) {
            observer(resp);
        }
        guard.armed = false;
        let mut sink = self.sink.lock();
        sink.claimed = false;
        sink.core = core;
        drop(sink);
        self.sink_notify.notify_one();
        true
    }

    #[cfg(test)]
    pub(crate) fn take_grant(&self) -> Option<Grant> {
        self.sink.lock().grant.take()
    }

    pub(crate) fn has_outcome(&self, leg: u64) -> bool {
        let sink = self.sink.lock();
        sink.leg == leg && !sink.core.is_pending()
    }

    /// Wait for the next thing that happens to `leg`. A completion wins
    /// over a pending grant.
    pub(crate) async fn next_event(&self, leg: u64) -> LegEvent {
        loop {
            let notified = self.sink_notify.notified();
            {
                let mut sink = self.sink.lock();
                if sink.leg == leg && !sink.core.is_pending() {
                    return LegEvent::Completed(std::mem::replace(
                        &mut sink.core,
                        CoreResponse::NoResponse,
                    ));
                }
                if let Some(grant) = sink.grant.take() {
                    return LegEvent::Granted(grant);
                }
            }
            notified.await;
        }
    }

    /// An interim `100 Continue` arrived.
    pub(crate) fn on_continue(&self, status: u16, headers: &HeaderMap) {
        self.state.lock().saw_100_continue = true;
        if self.gate.signal() {
            if let Some(delegate) = &self.continue_delegate {
                delegate(status, headers);
            }
        }
    }

    /// A final response arrived. For `status > 299` an upload still in
    /// progress is stopped; returns true when that happened.
    pub(crate) fn on_final_status(&self, status: u16) -> bool {
        self.gate.signal();
        if status <= 299 || !self.has_body() || self.body_complete.load(Ordering::Acquire) {
            return false;
        }
        self.upload_halted.store(true, Ordering::Release);
        tracing::debug!(request = self.id, status, "error status during upload");
        true
    }

    /// The connection carrying the request failed mid-read.
    pub(crate) fn halt_upload(&self) {
        self.upload_halted.store(true, Ordering::Release);
        self.gate.signal();
    }
}
