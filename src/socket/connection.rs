//! One pooled HTTP/1.x connection and its protocol state machine.
//!
//! A connection carries two queues. `write_list` holds requests that were
//! started on the wire, oldest first; its head owns the read side and gets
//! the next response. `wait_list` holds requests waiting for a slot.
//! Every queue mutation and flag transition happens under the state lock;
//! completions are collected in a [`ConnectionReturnResult`] and delivered
//! after the lock is released.
//!
//! The socket halves sit in slots that a reader or writer checks out for
//! the duration of one operation. Closing drops whatever is in the slots
//! and flips the shutdown flag, which cancels I/O in flight.

use crate::base::context::IoResultExt;
use crate::base::neterror::{FailureClass, NetError, ParseSection, RequestFailure};
use crate::http::framer::{self, Carve, HttpBehaviour, KeepAliveInputs};
use crate::http::headerparser::HeaderBlockParser;
use crate::http::requestbody::WriteMode;
use crate::http::response::HttpResponse;
use crate::http::responsebody::ResponseBody;
use crate::http::statusline::{HeaderBudget, ParseStatus, StatusLine, StatusLineParser};
use crate::socket::connectjob::{ConnectTarget, Connector};
use crate::socket::pool::{ConnectionGroup, ServicePoint};
use crate::socket::returnresult::ConnectionReturnResult;
use crate::socket::stream::BoxedSocket;
use crate::urlrequest::context::EngineConfig;
use crate::urlrequest::request::{CoreResponse, Grant, Request};
use bytes::{Buf, BytesMut};
use futures::FutureExt;
use http::{HeaderMap, StatusCode};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::watch;

/// Initial read buffer size.
pub const READ_BUFFER_SIZE: usize = 4096;

/// Pipelining pauses once this many requests are on the wire...
pub const PIPELINE_PAUSE_AT: usize = 10;
/// ...and resumes when no more than this many are left.
pub const PIPELINE_RESUME_AT: usize = 5;

/// Result of trying to put a request on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// No socket yet; the grantee connects first.
    Reconnect,
    Proceed,
    /// Idle too long, or the peer closed. The submission fails.
    Stale,
}

/// Where the read side is in the current response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPhase {
    Start,
    StatusLine,
    Headers,
    Data,
}

#[derive(Debug)]
struct Entry {
    request: Arc<Request>,
    leg: u64,
}

#[derive(Debug)]
struct WaitEntry {
    entry: Entry,
    queued_at: Instant,
}

#[derive(Debug, Clone, Copy)]
struct Lease {
    duration: Duration,
    started: Instant,
}

#[derive(Debug)]
struct ConnState {
    write_list: VecDeque<Entry>,
    wait_list: VecDeque<WaitEntry>,
    free: bool,
    idle: bool,
    /// Once false, never true again.
    keep_alive: bool,
    can_be_pooled: bool,
    can_pipeline: bool,
    pipelining: bool,
    pipeline_paused: bool,
    write_done: bool,
    read_done: bool,
    non_keep_alive_pipelined: bool,
    locked_request: Option<u64>,
    error: Option<NetError>,
    connect_failure: bool,
    at_least_one_response: bool,
    idle_since: Option<Instant>,
    initializing: bool,
    /// Selections by the pool that have not submitted yet.
    reserved: usize,
    lease: Option<Lease>,
    /// A read loop or a response body holds the read side.
    read_in_progress: bool,
    current_request: Option<Arc<Request>>,
}

impl ConnState {
    fn new(can_pipeline: bool) -> Self {
        Self {
            write_list: VecDeque::new(),
            wait_list: VecDeque::new(),
            free: true,
            idle: true,
            keep_alive: true,
            can_be_pooled: true,
            can_pipeline,
            pipelining: false,
            pipeline_paused: false,
            write_done: true,
            read_done: true,
            non_keep_alive_pipelined: false,
            locked_request: None,
            error: None,
            connect_failure: false,
            at_least_one_response: false,
            idle_since: Some(Instant::now()),
            initializing: true,
            reserved: 0,
            lease: None,
            read_in_progress: false,
            current_request: None,
        }
    }

    fn busy_count(&self) -> usize {
        self.write_list.len() + self.wait_list.len() + self.reserved
    }

    fn write_position(&self, id: u64) -> Option<usize> {
        self.write_list.iter().position(|e| e.request.id() == id)
    }
}

/// The read half plus everything needed to resume parsing.
pub struct ReadSide {
    reader: ReadHalf<BoxedSocket>,
    pub(crate) buf: BytesMut,
    status: StatusLineParser,
    headers: HeaderBlockParser,
    budget: HeaderBudget,
    phase: ReadPhase,
}

impl std::fmt::Debug for ReadSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadSide")
            .field("buffered", &self.buf.len())
            .field("phase", &self.phase)
            .finish()
    }
}

impl ReadSide {
    fn new(reader: ReadHalf<BoxedSocket>, max_header_bytes: usize) -> Self {
        Self {
            reader,
            buf: BytesMut::with_capacity(READ_BUFFER_SIZE),
            status: StatusLineParser::new(),
            headers: HeaderBlockParser::new(),
            budget: HeaderBudget::new(max_header_bytes),
            phase: ReadPhase::Start,
        }
    }

    fn reset_head(&mut self) {
        self.status.reset();
        self.headers.reset();
        self.budget.reset();
        self.phase = ReadPhase::StatusLine;
    }

    /// Read more bytes into the buffer. `Ok(0)` is end of stream.
    pub(crate) async fn fill(
        &mut self,
        shutdown: &mut watch::Receiver<bool>,
        timeout: Option<Duration>,
    ) -> Result<usize, NetError> {
        if self.buf.capacity() - self.buf.len() < READ_BUFFER_SIZE / 4 {
            self.buf.reserve(READ_BUFFER_SIZE);
        }
        let read = async { self.reader.read_buf(&mut self.buf).await.read_context() };
        tokio::select! {
            r = io_timeout(timeout, NetError::ReadTimedOut, read) => r,
            _ = wait_closed(shutdown) => Err(NetError::ConnectionAborted),
        }
    }
}

enum ReadStep {
    /// Nothing to read for: the write list is empty.
    Idle,
    /// The whole response was buffered. The side is back in its slot.
    Complete { request: Arc<Request>, leg: u64, response: HttpResponse },
    /// The body owns the read side now.
    Streaming { request: Arc<Request>, leg: u64, response: HttpResponse },
}

async fn io_timeout<T, F>(limit: Option<Duration>, on_timeout: NetError, fut: F) -> Result<T, NetError>
where
    F: Future<Output = Result<T, NetError>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut).await.unwrap_or(Err(on_timeout)),
        None => fut.await,
    }
}

pub(crate) async fn wait_closed(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Failure class for the requests on the wire when a connection dies.
pub fn classify_failure(
    error: NetError,
    in_flight: usize,
    body_started: bool,
    at_least_one_response: bool,
) -> FailureClass {
    match error {
        NetError::ServerProtocolViolation { .. }
        | NetError::InvalidChunkedEncoding
        | NetError::ResponseHeadersTooBig
        | NetError::SecureChannelFailure
        | NetError::TrustFailure
        | NetError::RequestCanceled => FailureClass::RequestFatal,
        e if e.is_timeout() => FailureClass::RequestFatal,
        _ if in_flight != 1 => FailureClass::Recoverable,
        NetError::KeepAliveFailure if !body_started => FailureClass::Isolated,
        _ if !at_least_one_response && !body_started => FailureClass::Recoverable,
        _ => FailureClass::RequestFatal,
    }
}

/// Point-in-time view used by the pool to pick a connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSnapshot {
    pub busy: usize,
    pub free: bool,
    pub can_be_pooled: bool,
    pub locked_request: Option<u64>,
    pub non_keep_alive_pipelined: bool,
    pub idle_since: Option<Instant>,
}

impl ConnectionSnapshot {
    /// Whether `request` could be submitted here without rejection.
    pub fn accepts(&self, request_id: u64) -> bool {
        self.can_be_pooled
            && !self.non_keep_alive_pipelined
            && self.locked_request.map_or(true, |id| id == request_id)
    }
}

pub struct Connection {
    id: u64,
    target: ConnectTarget,
    connector: Arc<dyn Connector>,
    service_point: Arc<ServicePoint>,
    group: Weak<ConnectionGroup>,
    config: Arc<EngineConfig>,
    state: Mutex<ConnState>,
    reader: Mutex<Option<ReadSide>>,
    writer: Mutex<Option<WriteHalf<BoxedSocket>>>,
    secure: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("host", &self.target.host)
            .field("port", &self.target.port)
            .finish()
    }
}

impl Connection {
    pub fn new(
        id: u64,
        target: ConnectTarget,
        connector: Arc<dyn Connector>,
        service_point: Arc<ServicePoint>,
        group: Weak<ConnectionGroup>,
        config: Arc<EngineConfig>,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        let can_pipeline = service_point.supports_pipelining();
        Arc::new(Self {
            id,
            target,
            connector,
            service_point,
            group,
            config,
            state: Mutex::new(ConnState::new(can_pipeline)),
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            secure: AtomicBool::new(false),
            shutdown,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn target(&self) -> &ConnectTarget {
        &self.target
    }

    pub fn service_point(&self) -> &Arc<ServicePoint> {
        &self.service_point
    }

    pub fn is_secure(&self) -> bool {
        self.secure.load(Ordering::Acquire)
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        let st = self.state.lock();
        ConnectionSnapshot {
            busy: st.busy_count(),
            free: st.free,
            can_be_pooled: st.can_be_pooled,
            locked_request: st.locked_request,
            non_keep_alive_pipelined: st.non_keep_alive_pipelined,
            idle_since: st.idle_since,
        }
    }

    /// Requests on the wire and requests waiting.
    pub fn queue_lengths(&self) -> (usize, usize) {
        let st = self.state.lock();
        (st.write_list.len(), st.wait_list.len())
    }

    pub fn is_pipeline_paused(&self) -> bool {
        self.state.lock().pipeline_paused
    }

    pub fn keep_alive(&self) -> bool {
        self.state.lock().keep_alive
    }

    /// Hold a slot for a pending submission so the connection is not
    /// counted idle in between.
    pub(crate) fn reserve(&self) {
        let mut st = self.state.lock();
        st.reserved += 1;
        self.check_non_idle(&mut st);
    }

    /// Pin the connection to `request` for a connection-affine handshake.
    pub(crate) fn lock_to(&self, request: &Request) {
        self.state.lock().locked_request = Some(request.id());
    }

    pub(crate) fn unlock(&self, request: &Request) {
        let mut st = self.state.lock();
        if st.locked_request == Some(request.id()) {
            st.locked_request = None;
        }
    }

    /// Queue `request` or start it right away.
    ///
    /// Returns false when the connection cannot take it; the caller then
    /// tries another connection.
    pub fn submit_request(self: &Arc<Self>, request: &Arc<Request>, leg: u64, forced: bool) -> bool {
        let mut results = ConnectionReturnResult::new();
        let mut close = false;

        let accepted = {
            let mut st = self.state.lock();
            st.reserved = st.reserved.saturating_sub(1);
            request.set_abort_hook(Arc::downgrade(self));

            if request.is_aborted() {
                let _ = results.add(
                    request,
                    leg,
                    CoreResponse::Error(RequestFailure::fatal(request.abort_error())),
                );
                self.check_idle(&mut st);
                true
            } else if !st.can_be_pooled || (!forced && st.non_keep_alive_pipelined) {
                self.check_idle(&mut st);
                false
            } else {
                self.check_lease(&mut st, request);

                if st.locked_request.is_some_and(|id| id != request.id()) {
                    self.check_idle(&mut st);
                    false
                } else {
                    if !forced {
                        st.non_keep_alive_pipelined = !request.keep_alive();
                    }

                    let can_join = st.write_list.is_empty()
                        || (request.pipelined()
                            && !request.has_body()
                            && st.can_pipeline
                            && st.pipelining
                            && !st.pipeline_paused);

                    // A pinned leg finds its connection idle: nothing would
                    // ever pull it off the wait list.
                    let idle = st.free && st.write_done && st.write_list.is_empty();
                    if (st.free && st.write_done && !forced && can_join) || (forced && idle) {
                        st.free = false;
                        let entry = Entry { request: Arc::clone(request), leg };
                        match self.start_request(&mut st, entry) {
                            StartOutcome::Stale => {
                                tracing::debug!(conn = self.id, "stale connection rejected submission");
                                if st.error.is_none() {
                                    st.error = Some(NetError::ConnectionClosed);
                                }
                                self.prepare_close_connection_socket(&mut st, &mut results);
                                close = true;
                                false
                            }
                            _ => true,
                        }
                    } else {
                        st.wait_list.push_back(WaitEntry {
                            entry: Entry { request: Arc::clone(request), leg },
                            queued_at: Instant::now(),
                        });
                        self.check_non_idle(&mut st);
                        true
                    }
                }
            }
        };

        if close {
            self.close_socket();
        }
        let _ = results.deliver_all();
        accepted
    }

    fn check_lease(&self, st: &mut ConnState, request: &Request) {
        let Some(duration) = self.service_point.lease_timeout() else {
            st.lease = None;
            return;
        };
        let lease = match st.lease {
            Some(lease) if lease.duration == duration => lease,
            _ => {
                let lease = Lease { duration, started: Instant::now() };
                st.lease = Some(lease);
                lease
            }
        };
        if lease.started.elapsed() >= lease.duration {
            tracing::debug!(conn = self.id, "connection lease expired");
            request.disable_keep_alive();
        }
    }

    /// Put `entry` on the write list and grant it the writer.
    fn start_request(self: &Arc<Self>, st: &mut ConnState, entry: Entry) -> StartOutcome {
        if st.write_list.is_empty() {
            let idle_too_long = st
                .idle_since
                .is_some_and(|since| since.elapsed() > self.service_point.max_idle_time());
            if idle_too_long || (!st.initializing && self.poll_stale()) {
                return StartOutcome::Stale;
            }
        }

        st.idle_since = None;
        if !st.pipeline_paused {
            st.pipeline_paused = st.write_list.len() >= PIPELINE_PAUSE_AT;
        }
        let request = &entry.request;
        st.pipelining = st.can_pipeline && request.pipelined() && !request.has_body();
        st.write_done = false;

        let outcome = if st.initializing {
            st.initializing = false;
            StartOutcome::Reconnect
        } else {
            StartOutcome::Proceed
        };

        tracing::trace!(conn = self.id, request = request.id(), ?outcome, "request started");
        request.grant(
            entry.leg,
            Grant { connection: Arc::clone(self), reconnect: outcome == StartOutcome::Reconnect },
        );
        st.write_list.push_back(entry);
        self.check_non_idle(st);
        outcome
    }

    /// Peek at an idle socket. Data or end of stream means it cannot be reused.
    fn poll_stale(&self) -> bool {
        let mut slot = self.reader.lock();
        let Some(side) = slot.as_mut() else {
            return false;
        };
        if !side.buf.is_empty() {
            return true;
        }
        side.buf.reserve(READ_BUFFER_SIZE);
        // Any completion here (data, EOF or error) means the peer moved on.
        side.reader.read_buf(&mut side.buf).now_or_never().is_some()
    }

    /// Next wait-list request allowed onto the wire, if any.
    fn check_next_request(&self, st: &mut ConnState) -> Option<Entry> {
        if st.wait_list.is_empty() {
            st.free = st.keep_alive;
            return None;
        }
        if !st.can_be_pooled {
            return None;
        }
        if st.pipeline_paused {
            st.pipeline_paused = st.write_list.len() > PIPELINE_RESUME_AT;
        }

        let head = &st.wait_list[0].entry.request;
        let pipelinable = head.pipelined()
            && !head.has_body()
            && st.can_pipeline
            && st.pipelining
            && !st.pipeline_paused;
        if !pipelinable && !st.write_list.is_empty() {
            return None;
        }

        let next = st.wait_list.pop_front()?;
        tracing::trace!(
            conn = self.id,
            request = next.entry.request.id(),
            queued_us = next.queued_at.elapsed().as_micros() as u64,
            "request dequeued"
        );
        self.check_idle(st);
        Some(next.entry)
    }

    /// Start `entry` taken off the wait list. A stale socket sends it back
    /// to the pool with an isolated failure.
    fn start_dequeued(
        self: &Arc<Self>,
        st: &mut ConnState,
        entry: Entry,
        results: &mut ConnectionReturnResult,
    ) -> bool {
        let request = Arc::clone(&entry.request);
        let leg = entry.leg;
        if self.start_request(st, entry) != StartOutcome::Stale {
            return false;
        }
        let _ = results.add(
            &request,
            leg,
            CoreResponse::Error(RequestFailure::isolated(NetError::KeepAliveFailure)),
        );
        if st.error.is_none() {
            st.error = Some(NetError::KeepAliveFailure);
        }
        self.prepare_close_connection_socket(st, results);
        true
    }

    /// The request's bytes are all written.
    pub fn write_start_next_request(self: &Arc<Self>, request: &Request) {
        let mut results = ConnectionReturnResult::new();
        let mut close = false;
        {
            let mut st = self.state.lock();
            st.write_done = true;
            tracing::trace!(conn = self.id, request = request.id(), "write done");

            if !st.keep_alive || st.error.is_some() || !st.can_be_pooled {
                if st.read_done {
                    if st.error.is_none() {
                        st.error = Some(NetError::KeepAliveFailure);
                    }
                    self.prepare_close_connection_socket(&mut st, &mut results);
                    close = true;
                }
            } else if st.pipelining || st.read_done {
                if let Some(next) = self.check_next_request(&mut st) {
                    close = self.start_dequeued(&mut st, next, &mut results);
                }
            }
        }
        if close {
            self.close_socket();
        }
        let _ = results.deliver_all();
    }

    /// The request's head is on the wire. Start reading if it is first in line.
    pub fn check_start_receive(self: &Arc<Self>, request: &Request) {
        {
            let mut st = self.state.lock();
            request.set_headers_completed();
            let Some(head) = st.write_list.front() else {
                return;
            };
            if !st.read_done || head.request.id() != request.id() {
                return;
            }
            st.read_done = false;
            st.read_in_progress = true;
        }
        self.spawn_read_loop();
    }

    /// A response is finished. Pops it and decides what the connection does next.
    /// Returns true when the read side should go on with the next pipelined response.
    fn read_start_next_request(
        self: &Arc<Self>,
        request: &Arc<Request>,
        leg: u64,
        response: Option<HttpResponse>,
    ) -> bool {
        let mut results = ConnectionReturnResult::new();
        let mut close = false;
        let mut continue_reading = false;
        {
            let mut st = self.state.lock();
            match st.write_list.front() {
                Some(head) if head.request.id() == request.id() => {
                    st.write_list.pop_front();
                }
                _ => {
                    st.read_in_progress = false;
                    return false;
                }
            }
            st.current_request = None;
            if let Some(response) = response {
                let _ = results.add(request, leg, CoreResponse::Response(Box::new(response)));
            }

            if !st.keep_alive || st.error.is_some() || !st.can_be_pooled {
                st.read_done = true;
                if st.write_done {
                    if st.error.is_none() {
                        st.error = Some(NetError::KeepAliveFailure);
                    }
                    self.prepare_close_connection_socket(&mut st, &mut results);
                    close = true;
                }
            } else {
                st.at_least_one_response = true;
                match st.write_list.front() {
                    Some(next) if next.request.headers_completed() => continue_reading = true,
                    Some(_) => st.read_done = true,
                    None => {
                        st.read_done = true;
                        if st.write_done {
                            if let Some(next) = self.check_next_request(&mut st) {
                                close = self.start_dequeued(&mut st, next, &mut results);
                            }
                        } else {
                            st.free = true;
                        }
                    }
                }
            }
            self.check_idle(&mut st);
            st.read_in_progress = continue_reading;
        }
        if close {
            self.close_socket();
        }
        let _ = results.deliver_all();
        continue_reading
    }

    /// Cancel `request` here. Returns false when it was first in line and the
    /// connection had to be torn down.
    pub fn abort_or_disassociate(self: &Arc<Self>, request: &Request) -> bool {
        let mut results = ConnectionReturnResult::new();
        {
            let mut st = self.state.lock();
            match st.write_position(request.id()) {
                None => {
                    if let Some(pos) = st.wait_list.iter().position(|w| w.entry.request.id() == request.id()) {
                        st.wait_list.remove(pos);
                        if st.locked_request == Some(request.id()) {
                            st.locked_request = None;
                        }
                        self.check_idle(&mut st);
                    }
                    return true;
                }
                // A pipelined follower whose write is finished can leave
                // quietly; the connection closes after the current response.
                Some(pos) if pos > 0 && !(pos == st.write_list.len() - 1 && !st.write_done) => {
                    st.write_list.remove(pos);
                    st.keep_alive = false;
                    return true;
                }
                Some(_) => {
                    st.keep_alive = false;
                    if st.error.is_none() {
                        st.error = Some(NetError::RequestCanceled);
                    }
                    self.prepare_close_connection_socket(&mut st, &mut results);
                }
            }
        }
        tracing::debug!(conn = self.id, request = request.id(), "connection torn down by abort");
        self.close_socket();
        let _ = results.deliver_all();
        false
    }

    /// Fail everything queued here and make the connection unusable.
    /// Called with the state lock held.
    fn prepare_close_connection_socket(&self, st: &mut ConnState, results: &mut ConnectionReturnResult) {
        st.idle_since = None;
        st.can_be_pooled = false;
        st.keep_alive = false;
        st.free = false;
        st.locked_request = None;
        st.current_request = None;

        let error = st.error.unwrap_or(NetError::ConnectionClosed);
        for waiting in st.wait_list.drain(..) {
            let _ = results.add(
                &waiting.entry.request,
                waiting.entry.leg,
                CoreResponse::Error(RequestFailure::isolated(error)),
            );
        }

        if let Some(head) = st.write_list.front() {
            let class = if st.connect_failure {
                if self.target.proxy.is_some() {
                    FailureClass::ServicePointFatal
                } else {
                    FailureClass::Recoverable
                }
            } else {
                classify_failure(
                    error,
                    st.write_list.len(),
                    head.request.body_started(),
                    st.at_least_one_response,
                )
            };
            tracing::debug!(
                conn = self.id,
                error = %error,
                ?class,
                in_flight = st.write_list.len(),
                "closing connection"
            );
            let entries: Vec<Entry> = st.write_list.drain(..).collect();
            results.add_failures(
                entries.iter().map(|e| (&e.request, e.leg)),
                RequestFailure::new(error, class),
                RequestFailure::recoverable(NetError::PipelineFailure),
            );
        }
        self.check_idle(st);
    }

    fn check_idle(&self, st: &mut ConnState) {
        if !st.idle && st.busy_count() == 0 {
            st.idle = true;
            if st.can_be_pooled {
                st.idle_since = Some(Instant::now());
            }
            if let Some(group) = self.group.upgrade() {
                group.leave_busy();
            }
        }
    }

    fn check_non_idle(&self, st: &mut ConnState) {
        if st.idle && st.busy_count() != 0 {
            st.idle = false;
            if let Some(group) = self.group.upgrade() {
                group.enter_busy();
            }
        }
    }

    /// Record `error`, fail what is queued and close.
    pub(crate) fn handle_error(self: &Arc<Self>, error: NetError) {
        let mut results = ConnectionReturnResult::new();
        {
            let mut st = self.state.lock();
            if let Some(current) = st.current_request.take() {
                current.halt_upload();
            }
            if st.error.is_none() {
                st.error = Some(error);
            }
            self.prepare_close_connection_socket(&mut st, &mut results);
        }
        self.close_socket();
        let _ = results.deliver_all();
    }

    /// No further reuse after the current exchange.
    pub(crate) fn mark_no_keep_alive(&self) {
        self.state.lock().keep_alive = false;
    }

    /// Drop the socket and leave the pool.
    pub fn close_socket(&self) {
        self.shutdown.send_replace(true);
        self.reader.lock().take();
        self.writer.lock().take();
        if let Some(group) = self.group.upgrade() {
            group.remove(self.id);
        }
    }

    /// Close if idle longer than the service point allows. Returns true if
    /// this call closed it. A connection already on its way out is left to
    /// the path that condemned it.
    pub fn close_if_expired(self: &Arc<Self>, now: Instant) -> bool {
        let expired = {
            let mut st = self.state.lock();
            let expired = st.can_be_pooled
                && st.busy_count() == 0
                && st.idle_since.is_some_and(|since| {
                    now.saturating_duration_since(since) > self.service_point.max_idle_time()
                });
            if expired {
                st.can_be_pooled = false;
                st.keep_alive = false;
                st.free = false;
            }
            expired
        };
        if expired {
            tracing::debug!(conn = self.id, "closing idle connection");
            self.close_socket();
        }
        expired
    }

    /// Connect the transport. Called by the request granted with `reconnect`.
    pub async fn connect(self: &Arc<Self>) -> Result<(), NetError> {
        tracing::debug!(conn = self.id, host = %self.target.host, port = self.target.port, "connecting");
        let mut rx = self.shutdown.subscribe();
        let result = tokio::select! {
            r = self.connector.connect(&self.target) => r,
            _ = wait_closed(&mut rx) => Err(NetError::ConnectionAborted),
        };

        match result {
            Ok(socket) => {
                self.secure.store(socket.is_secure(), Ordering::Release);
                let (read_half, write_half) = tokio::io::split(socket);
                if self.is_closed() {
                    return Err(NetError::ConnectionAborted);
                }
                *self.reader.lock() = Some(ReadSide::new(read_half, self.config.max_header_bytes));
                *self.writer.lock() = Some(write_half);
                Ok(())
            }
            Err(e) => {
                tracing::debug!(conn = self.id, error = %e, "connect failed");
                let mut results = ConnectionReturnResult::new();
                {
                    let mut st = self.state.lock();
                    if st.error.is_none() {
                        st.error = Some(e);
                        st.connect_failure = true;
                    }
                    self.prepare_close_connection_socket(&mut st, &mut results);
                }
                self.close_socket();
                let _ = results.deliver_all();
                Err(e)
            }
        }
    }

    /// Write bytes for the request that holds the writer. A failure closes
    /// the connection and is delivered through the completion sinks.
    pub async fn write_all(self: &Arc<Self>, data: &[u8]) -> Result<(), NetError> {
        let Some(mut writer) = self.writer.lock().take() else {
            let e = self.state.lock().error.unwrap_or(NetError::SocketNotConnected);
            return Err(e);
        };
        let mut rx = self.shutdown.subscribe();
        let result = {
            let write = async {
                writer.write_all(data).await.write_context()?;
                writer.flush().await.write_context()
            };
            tokio::select! {
                r = io_timeout(self.config.write_timeout, NetError::WriteTimedOut, write) => r,
                _ = wait_closed(&mut rx) => Err(NetError::ConnectionAborted),
            }
        };

        match result {
            Ok(()) => {
                let mut slot = self.writer.lock();
                if !self.is_closed() {
                    *slot = Some(writer);
                }
                Ok(())
            }
            Err(e) => {
                self.handle_error(e);
                Err(e)
            }
        }
    }

    fn put_reader(&self, side: ReadSide) {
        let mut slot = self.reader.lock();
        if !self.is_closed() {
            *slot = Some(side);
        }
    }

    fn spawn_read_loop(self: &Arc<Self>) {
        let conn = Arc::clone(self);
        tokio::spawn(async move { conn.read_loop().await });
    }

    async fn read_loop(self: Arc<Self>) {
        let mut rx = self.shutdown.subscribe();
        loop {
            let Some(side) = self.reader.lock().take() else {
                return;
            };
            match self.read_response(side, &mut rx).await {
                Ok(ReadStep::Idle) => return,
                Ok(ReadStep::Complete { request, leg, response }) => {
                    if !self.read_start_next_request(&request, leg, Some(response)) {
                        return;
                    }
                }
                Ok(ReadStep::Streaming { request, leg, response }) => {
                    let mut results = ConnectionReturnResult::new();
                    let _ = results.add(&request, leg, CoreResponse::Response(Box::new(response)));
                    if let Err(e) = results.deliver_all() {
                        tracing::warn!(conn = self.id, error = %e, "response delivery failed");
                    }
                    return;
                }
                Err(e) => {
                    tracing::debug!(conn = self.id, error = %e, "read failed");
                    self.handle_error(e);
                    return;
                }
            }
        }
    }

    /// Read one response for the head of the write list.
    async fn read_response(
        self: &Arc<Self>,
        mut side: ReadSide,
        rx: &mut watch::Receiver<bool>,
    ) -> Result<ReadStep, NetError> {
        side.phase = ReadPhase::Start;
        let (request, leg) = {
            let mut st = self.state.lock();
            let Some(head) = st.write_list.front() else {
                st.read_done = true;
                st.read_in_progress = false;
                drop(st);
                if !side.buf.is_empty() {
                    return Err(NetError::protocol(ParseSection::Response, "unexpected server response"));
                }
                self.put_reader(side);
                return Ok(ReadStep::Idle);
            };
            let (request, leg) = (Arc::clone(&head.request), head.leg);
            st.keep_alive &= request.keep_alive();
            st.current_request = Some(Arc::clone(&request));
            (request, leg)
        };
        let method = request.method();

        let (line, headers) = loop {
            side.reset_head();
            let (line, headers) = self.read_head(&mut side, rx).await?;
            self.observe_status_line(&line);

            match line.status {
                100 => {
                    tracing::debug!(conn = self.id, request = request.id(), "100 continue");
                    self.service_point.set_understands_100_continue();
                    request.on_continue(line.status, &headers);
                }
                101 => break (line, headers),
                s if s < 200 => {
                    tracing::trace!(conn = self.id, status = s, "interim response skipped");
                }
                _ => break (line, headers),
            }
        };
        side.phase = ReadPhase::Data;

        let status = line.status;
        let behaviour = self.service_point.behaviour();
        if self.config.detect_proxy_chunked_downgrade
            && framer::is_partial_compliance_signature(
                status,
                &line.reason,
                &headers,
                behaviour,
                request.write_mode() == WriteMode::Chunked,
            )
        {
            tracing::debug!(conn = self.id, "server refuses chunked uploads");
            self.service_point.set_behaviour(HttpBehaviour::Http11PartiallyCompliant);
            self.state.lock().can_pipeline = false;
        }

        let framing = framer::resolve(status, &headers, &method)?;
        let mut keep_alive = framer::keep_alive_verdict(&KeepAliveInputs {
            status,
            headers: &headers,
            framing: &framing,
            secure: self.is_secure(),
            method: &method,
            request_length: request.content_length(),
            unauthorized_upload_threshold: self.config.unauthorized_upload_threshold,
            auth_engaged: request.auth_engaged(),
            behaviour: self.service_point.behaviour(),
            proxy_semantics: self.target.proxy.is_some(),
        });
        if status == 101 || request.on_final_status(status) {
            keep_alive = false;
        }
        if !keep_alive {
            let mut st = self.state.lock();
            st.keep_alive = false;
            st.free = false;
        }

        let status_code = StatusCode::from_u16(status)
            .map_err(|_| NetError::protocol(ParseSection::StatusLine, "status code out of range"))?;
        let url = request.url();

        match framer::carve(framing.framing, &side.buf)? {
            Carve::Complete { body, consumed } => {
                side.buf.advance(consumed);
                self.put_reader(side);
                let response = HttpResponse::new(
                    status_code,
                    line.version(),
                    line.reason,
                    headers,
                    url,
                    ResponseBody::full(body),
                );
                Ok(ReadStep::Complete { request, leg, response })
            }
            Carve::Streaming => {
                let body = ResponseBody::streaming(
                    Arc::clone(self),
                    Arc::clone(&request),
                    leg,
                    side,
                    framing.framing,
                    self.config.read_timeout,
                );
                let response =
                    HttpResponse::new(status_code, line.version(), line.reason, headers, url, body);
                Ok(ReadStep::Streaming { request, leg, response })
            }
        }
    }

    /// Parse one status line and header block, reading as needed.
    async fn read_head(
        &self,
        side: &mut ReadSide,
        rx: &mut watch::Receiver<bool>,
    ) -> Result<(StatusLine, HeaderMap), NetError> {
        loop {
            let (status, consumed) = match side.phase {
                ReadPhase::Headers => side.headers.parse(&side.buf, &mut side.budget),
                _ => side.status.parse(&side.buf, &mut side.budget),
            };
            side.buf.advance(consumed);

            match status {
                ParseStatus::Done if side.phase == ReadPhase::Headers => {
                    let line = side
                        .status
                        .status_line()
                        .ok_or(NetError::protocol(ParseSection::StatusLine, "incomplete status line"))?;
                    return Ok((line, side.headers.take_headers()));
                }
                ParseStatus::Done => side.phase = ReadPhase::Headers,
                ParseStatus::Invalid(detail) => {
                    let section = if side.phase == ReadPhase::Headers {
                        ParseSection::Headers
                    } else {
                        ParseSection::StatusLine
                    };
                    return Err(NetError::protocol(section, detail));
                }
                ParseStatus::DataTooBig => return Err(NetError::ResponseHeadersTooBig),
                ParseStatus::NeedMoreData => {
                    if side.fill(rx, self.config.read_timeout).await? == 0 {
                        let nothing_read = side.phase == ReadPhase::StatusLine && side.budget.used() == 0;
                        let reused = self.state.lock().at_least_one_response;
                        return Err(if nothing_read && reused {
                            NetError::KeepAliveFailure
                        } else {
                            NetError::ConnectionClosed
                        });
                    }
                }
            }
        }
    }

    fn observe_status_line(&self, line: &StatusLine) {
        let before = self.service_point.behaviour();
        let after = before.observe(line.is_http11_or_later());
        if after != before {
            self.service_point.set_behaviour(after);
        }
        self.state.lock().can_pipeline = self.service_point.supports_pipelining();
    }

    /// A streamed body reached its end. The read side comes back.
    pub(crate) fn body_finished(self: &Arc<Self>, request: &Arc<Request>, leg: u64, side: ReadSide) {
        self.put_reader(side);
        if self.read_start_next_request(request, leg, None) {
            self.spawn_read_loop();
        }
    }

    /// A streamed body was dropped before its end. The rest of it is still
    /// on the wire, so the connection cannot be reused.
    pub(crate) fn body_abandoned(self: &Arc<Self>, request: &Request) {
        tracing::debug!(conn = self.id, request = request.id(), "response body abandoned");
        self.handle_error(NetError::ConnectionAborted);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::requestbody::RequestBody;
    use crate::socket::connectjob::ConnectFuture;
    use crate::urlrequest::request::{LegEvent, RequestOptions};
    use http::Method;
    use url::Url;

    struct NeverConnector;

    impl Connector for NeverConnector {
        fn connect<'a>(&'a self, _target: &'a ConnectTarget) -> ConnectFuture<'a> {
            Box::pin(async { Err(NetError::ConnectionRefused) })
        }
    }

    fn connection() -> Arc<Connection> {
        let target = ConnectTarget {
            scheme: "http".into(),
            host: "example.com".into(),
            port: 80,
            proxy: None,
        };
        Connection::new(
            1,
            target,
            Arc::new(NeverConnector),
            Arc::new(ServicePoint::new(Duration::from_secs(100))),
            Weak::new(),
            Arc::new(EngineConfig::default()),
        )
    }

    fn get() -> (Arc<Request>, u64) {
        let req = Request::new(
            Method::GET,
            Url::parse("http://example.com/").unwrap(),
            HeaderMap::new(),
            RequestBody::Empty,
            RequestOptions::from_config(&EngineConfig::default()),
        );
        let leg = req.begin_leg();
        (req, leg)
    }

    #[test]
    fn test_classify_failure() {
        let violation = NetError::protocol(ParseSection::Headers, "bad");
        assert_eq!(classify_failure(violation, 1, false, false), FailureClass::RequestFatal);
        assert_eq!(classify_failure(NetError::ReadTimedOut, 3, false, false), FailureClass::RequestFatal);
        assert_eq!(classify_failure(NetError::ConnectionReset, 2, true, true), FailureClass::Recoverable);
        assert_eq!(classify_failure(NetError::KeepAliveFailure, 1, false, true), FailureClass::Isolated);
        assert_eq!(classify_failure(NetError::KeepAliveFailure, 1, true, true), FailureClass::RequestFatal);
        assert_eq!(classify_failure(NetError::ConnectionClosed, 1, false, false), FailureClass::Recoverable);
        assert_eq!(classify_failure(NetError::ConnectionClosed, 1, false, true), FailureClass::RequestFatal);
    }

    #[test]
    fn test_first_submission_reconnects_then_queues() {
        let conn = connection();
        let (a, leg_a) = get();
        let (b, leg_b) = get();

        assert!(conn.submit_request(&a, leg_a, false));
        assert!(conn.submit_request(&b, leg_b, false));
        assert_eq!(conn.queue_lengths(), (1, 1));

        let grant = a.take_grant().expect("first request granted");
        assert!(grant.reconnect);
        assert!(b.take_grant().is_none());
    }

    #[test]
    fn test_pipeline_pauses_at_ten_and_resumes_at_five() {
        let conn = connection();
        let requests: Vec<_> = (0..14).map(|_| get()).collect();
        for (req, leg) in &requests {
            assert!(conn.submit_request(req, *leg, false));
        }
        assert_eq!(conn.queue_lengths(), (1, 13));

        // Each finished write pulls the next pipelined request onto the wire.
        for (req, _) in requests.iter().take(12) {
            conn.write_start_next_request(req);
        }
        let (on_wire, waiting) = conn.queue_lengths();
        assert_eq!(on_wire, PIPELINE_PAUSE_AT + 1);
        assert_eq!(waiting, 3);
        assert!(conn.is_pipeline_paused());

        // Drain responses down to the resume mark.
        {
            let mut st = conn.state.lock();
            while st.write_list.len() > PIPELINE_RESUME_AT {
                st.write_list.pop_front();
            }
            assert!(conn.check_next_request(&mut st).is_some());
            assert!(!st.pipeline_paused);
        }
    }

    #[test]
    fn test_non_keep_alive_blocks_further_submissions() {
        let conn = connection();
        let mut opts = RequestOptions::from_config(&EngineConfig::default());
        opts.keep_alive = false;
        let closing = Request::new(
            Method::GET,
            Url::parse("http://example.com/").unwrap(),
            HeaderMap::new(),
            RequestBody::Empty,
            opts,
        );
        let leg = closing.begin_leg();
        let (other, other_leg) = get();

        assert!(conn.submit_request(&closing, leg, false));
        assert!(!conn.submit_request(&other, other_leg, false));
        assert!(conn.submit_request(&other, other_leg, true));
    }

    #[test]
    fn test_pinned_leg_starts_on_idle_connection() {
        let conn = connection();
        let (a, leg_a) = get();
        assert!(conn.submit_request(&a, leg_a, false));
        assert!(a.take_grant().is_some());
        conn.write_start_next_request(&a);
        conn.read_start_next_request(&a, leg_a, None);
        assert_eq!(conn.queue_lengths(), (0, 0));

        // Next leg of a connection-affine handshake.
        let leg_b = a.begin_leg();
        conn.lock_to(&a);
        conn.reserve();
        assert!(conn.submit_request(&a, leg_b, true));
        assert_eq!(conn.queue_lengths(), (1, 0));
        let grant = a.take_grant().expect("pinned leg granted");
        assert!(!grant.reconnect);

        // Anyone else is turned away while the handshake holds the lock.
        let (other, other_leg) = get();
        assert!(!conn.submit_request(&other, other_leg, false));
    }

    #[test]
    fn test_only_idle_connections_expire() {
        let conn = connection();
        let start = Instant::now();
        assert!(!conn.close_if_expired(start));

        let (a, leg_a) = get();
        assert!(conn.submit_request(&a, leg_a, false));
        let later = start + Duration::from_secs(500);
        assert!(!conn.close_if_expired(later));
        assert!(!conn.is_closed());

        assert!(a.take_grant().is_some());
        conn.write_start_next_request(&a);
        conn.read_start_next_request(&a, leg_a, None);
        assert!(conn.close_if_expired(later));
        assert!(conn.is_closed());
        assert!(!conn.snapshot().can_be_pooled);
        // Already condemned: a second sweep closes nothing.
        assert!(!conn.close_if_expired(later));
    }

    #[test]
    fn test_condemned_connection_is_not_reported_as_expired() {
        let conn = connection();
        conn.handle_error(NetError::ConnectionReset);
        assert!(conn.is_closed());
        assert!(!conn.close_if_expired(Instant::now() + Duration::from_secs(500)));
    }

    #[test]
    fn test_abort_waiting_request_leaves_connection_alone() {
        let conn = connection();
        let (a, leg_a) = get();
        let (b, leg_b) = get();
        conn.submit_request(&a, leg_a, false);
        conn.submit_request(&b, leg_b, false);

        assert!(b.abort());
        assert_eq!(conn.queue_lengths(), (1, 0));
        assert!(conn.snapshot().can_be_pooled);
    }

    #[test]
    fn test_abort_head_tears_down_and_fails_queue() {
        let conn = connection();
        let (a, leg_a) = get();
        let (b, leg_b) = get();
        conn.submit_request(&a, leg_a, false);
        conn.submit_request(&b, leg_b, false);

        assert!(a.abort());
        assert_eq!(conn.queue_lengths(), (0, 0));
        assert!(!conn.snapshot().can_be_pooled);
        assert!(b.has_outcome(leg_b));
    }

    #[tokio::test]
    async fn test_connect_failure_is_recoverable_without_proxy() {
        let conn = connection();
        let (a, leg) = get();
        conn.submit_request(&a, leg, false);
        assert_eq!(conn.connect().await, Err(NetError::ConnectionRefused));

        // The untaken grant loses to the completion.
        match a.next_event(leg).await {
            LegEvent::Completed(CoreResponse::Error(f)) => {
                assert_eq!(f.error, NetError::ConnectionRefused);
                assert_eq!(f.class, FailureClass::Recoverable);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_aborted_request_completes_immediately() {
        let conn = connection();
        let (a, leg) = get();
        a.abort();
        assert!(conn.submit_request(&a, leg, false));
        assert_eq!(conn.queue_lengths(), (0, 0));
    }
}
