//! One leg of a request: pick a connection, write, wait for the outcome.
//!
//! Redirects, auth round trips and retries are separate legs driven by
//! [`URLRequestHttpJob`](crate::urlrequest::job::URLRequestHttpJob).

use crate::base::loadstate::LoadState;
use crate::base::neterror::{NetError, RequestFailure};
use crate::http::chunked::{encode_chunk, LAST_CHUNK};
use crate::http::requestbody::{collect_stream, BodyStream, RequestBody, WriteMode};
use crate::http::requesthead::RequestHead;
use crate::http::response::HttpResponse;
use crate::socket::connection::Connection;
use crate::socket::connectjob::ConnectTarget;
use crate::socket::pool::ConnectionPool;
use crate::urlrequest::request::{CoreResponse, Grant, LegEvent, Request};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use std::sync::Arc;

/// Largest single write of an in-memory body.
const WRITE_CHUNK: usize = 64 * 1024;

/// Internal state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Submit,
    WaitForGrant,
    Connect,
    SendHead,
    AwaitContinue,
    SendBody,
    AwaitResponse,
}

impl State {
    /// Map internal state to public LoadState.
    fn to_load_state(self) -> LoadState {
        match self {
            State::Submit => LoadState::Submitting,
            State::WaitForGrant => LoadState::AwaitingConnection,
            State::Connect => LoadState::Connecting,
            State::SendHead | State::SendBody => LoadState::Writing,
            State::AwaitContinue => LoadState::AwaitingContinue,
            State::AwaitResponse => LoadState::AwaitingResponse,
        }
    }
}

/// Outcome of one leg.
pub type LegResult = Result<HttpResponse, RequestFailure>;

enum Outgoing {
    Empty,
    Bytes(Bytes),
    Stream(BodyStream, Option<u64>),
}

pub struct HttpNetworkTransaction {
    pool: Arc<ConnectionPool>,
    request: Arc<Request>,
    target: ConnectTarget,
    state: State,
    leg: u64,
    connection: Option<Arc<Connection>>,
    expect_continue: bool,
}

impl HttpNetworkTransaction {
    pub fn new(pool: Arc<ConnectionPool>, request: Arc<Request>, target: ConnectTarget) -> Self {
        Self {
            pool,
            request,
            target,
            state: State::Submit,
            leg: 0,
            connection: None,
            expect_continue: false,
        }
    }

    /// Get the current load state (for progress reporting).
    pub fn get_load_state(&self) -> LoadState {
        self.state.to_load_state()
    }

    /// The connection that carried the leg, once granted.
    pub fn connection(&self) -> Option<&Arc<Connection>> {
        self.connection.as_ref()
    }

    /// Run the leg to its outcome.
    pub async fn start(&mut self) -> LegResult {
        self.state = State::Submit;
        let core = match self.do_loop().await {
            Ok(core) => core,
            Err(e) => self.settle(e).await,
        };
        self.request.clear_abort_hook();
        match core {
            CoreResponse::Response(resp) => Ok(*resp),
            CoreResponse::Error(failure) => Err(failure),
            CoreResponse::Pending | CoreResponse::NoResponse => Err(RequestFailure::fatal(NetError::EmptyResponse)),
        }
    }

    async fn do_loop(&mut self) -> Result<CoreResponse, NetError> {
        loop {
            self.request.set_load_state(self.state.to_load_state());
            match self.state {
                State::Submit => self.do_submit().await?,
                State::WaitForGrant => match self.request.next_event(self.leg).await {
                    LegEvent::Completed(core) => return Ok(core),
                    LegEvent::Granted(grant) => self.on_granted(grant),
                },
                State::Connect => {
                    self.conn()?.connect().await?;
                    self.state = State::SendHead;
                }
                State::SendHead => self.do_send_head().await?,
                State::AwaitContinue => self.do_await_continue().await,
                State::SendBody => self.do_send_body().await?,
                State::AwaitResponse => return Ok(self.wait_completion().await),
            }
        }
    }

    /// An error interrupted the loop. Once a connection is involved it has
    /// already classified the failure for this leg; wait for that.
    async fn settle(&mut self, error: NetError) -> CoreResponse {
        if self.connection.is_none() {
            return CoreResponse::Error(RequestFailure::fatal(error));
        }
        if !self.request.has_outcome(self.leg) {
            self.request.set_response(self.leg, CoreResponse::Error(RequestFailure::fatal(error)));
        }
        self.wait_completion().await
    }

    async fn wait_completion(&self) -> CoreResponse {
        loop {
            if let LegEvent::Completed(core) = self.request.next_event(self.leg).await {
                return core;
            }
        }
    }

    fn conn(&self) -> Result<Arc<Connection>, NetError> {
        self.connection.clone().ok_or(NetError::SocketNotConnected)
    }

    async fn do_submit(&mut self) -> Result<(), NetError> {
        let chunked_upload = self.pool.service_point(&self.target).supports_chunked_upload();
        self.prepare_body(chunked_upload).await?;
        self.leg = self.request.begin_leg();

        let conn = self.pool.find_connection(&self.request, self.leg, &self.target)?;
        tracing::debug!(request = self.request.id(), conn = conn.id(), leg = self.leg, "request submitted");
        self.connection = Some(conn);
        self.state = State::WaitForGrant;
        Ok(())
    }

    /// Fix the write mode for this leg. A stream of unknown length the
    /// server cannot take chunked is collected here.
    async fn prepare_body(&mut self, chunked_upload: bool) -> Result<(), NetError> {
        let mut stream = {
            let mut st = self.request.state();
            if matches!(st.body, RequestBody::Consumed) {
                return Err(NetError::RequestBodyError);
            }
            let mode = st.body.write_mode(&st.method, chunked_upload);
            st.write_mode = mode;
            st.content_length = match mode {
                WriteMode::ContentLength => Some(st.body.declared_length().unwrap_or(0)),
                _ => None,
            };
            if mode != WriteMode::Buffered {
                return Ok(());
            }
            match std::mem::replace(&mut st.body, RequestBody::Consumed) {
                RequestBody::Stream { stream, .. } => stream,
                other => {
                    st.body = other;
                    return Ok(());
                }
            }
        };

        let bytes = collect_stream(&mut stream).await?;
        tracing::debug!(request = self.request.id(), len = bytes.len(), "request body buffered");
        let mut st = self.request.state();
        st.content_length = Some(bytes.len() as u64);
        st.body = RequestBody::Bytes(bytes);
        Ok(())
    }

    fn on_granted(&mut self, grant: Grant) {
        let pin = {
            let st = self.request.state();
            st.server_auth.requires_affinity() || st.proxy_auth.requires_affinity()
        };
        if pin {
            grant.connection.lock_to(&self.request);
            self.request.state().affinity = Some(Arc::downgrade(&grant.connection));
        }
        self.state = if grant.reconnect { State::Connect } else { State::SendHead };
        self.connection = Some(grant.connection);
    }

    async fn do_send_head(&mut self) -> Result<(), NetError> {
        let conn = self.conn()?;
        let sp = conn.service_point();
        let config = self.pool.config();
        let proxy = if self.target.uses_proxy_semantics() { self.target.proxy.as_ref() } else { None };

        let (head, has_body) = {
            let st = self.request.state();
            let has_body = st.write_mode != WriteMode::None && !st.body.is_empty();
            self.expect_continue =
                has_body && self.request.options().expect_continue && sp.understands_100_continue();
            let head = RequestHead {
                method: &st.method,
                url: &st.url,
                headers: &st.headers,
                write_mode: st.write_mode,
                content_length: st.content_length,
                expect_continue: self.expect_continue,
                keep_alive: self.request.keep_alive(),
                behaviour: sp.behaviour(),
                proxy,
                user_agent: config.user_agent.as_deref(),
            };
            (head.encode()?, has_body)
        };

        conn.write_all(&head).await?;
        tracing::trace!(request = self.request.id(), conn = conn.id(), bytes = head.len(), "request head written");
        conn.check_start_receive(&self.request);

        self.state = if !has_body {
            conn.write_start_next_request(&self.request);
            State::AwaitResponse
        } else if self.expect_continue {
            State::AwaitContinue
        } else {
            State::SendBody
        };
        Ok(())
    }

    async fn do_await_continue(&mut self) {
        let gate = self.request.gate();
        if gate.trigger() {
            let timeout = self.request.options().continue_timeout;
            if gate.wait_or_expire(timeout).await {
                tracing::debug!(request = self.request.id(), "no 100 Continue, sending body");
                if let Some(conn) = &self.connection {
                    conn.service_point().clear_understands_100_continue();
                }
            }
        }

        if self.request.upload_halted() || self.request.is_aborted() {
            tracing::debug!(request = self.request.id(), "body withheld after final response");
            if let Some(conn) = &self.connection {
                conn.mark_no_keep_alive();
                conn.write_start_next_request(&self.request);
            }
            self.state = State::AwaitResponse;
        } else {
            self.state = State::SendBody;
        }
    }

    async fn do_send_body(&mut self) -> Result<(), NetError> {
        let conn = self.conn()?;
        self.request.mark_body_started();

        let (mode, outgoing) = {
            let mut st = self.request.state();
            let outgoing = match std::mem::replace(&mut st.body, RequestBody::Consumed) {
                RequestBody::Bytes(bytes) => {
                    st.body = RequestBody::Bytes(bytes.clone());
                    Outgoing::Bytes(bytes)
                }
                RequestBody::Stream { stream, length } => Outgoing::Stream(stream, length),
                RequestBody::Empty => {
                    st.body = RequestBody::Empty;
                    Outgoing::Empty
                }
                RequestBody::Consumed => return Err(NetError::RequestBodyError),
            };
            (st.write_mode, outgoing)
        };

        let complete = match outgoing {
            Outgoing::Empty => true,
            Outgoing::Bytes(bytes) => self.write_bytes(&conn, bytes).await?,
            Outgoing::Stream(stream, length) => self.write_stream(&conn, mode, stream, length).await?,
        };

        if complete {
            self.request.mark_body_complete();
        } else {
            tracing::debug!(request = self.request.id(), "upload halted by server response");
        }
        conn.write_start_next_request(&self.request);
        self.state = State::AwaitResponse;
        Ok(())
    }

    /// Write an in-memory body. Returns false when the upload was halted.
    async fn write_bytes(&self, conn: &Arc<Connection>, bytes: Bytes) -> Result<bool, NetError> {
        for piece in bytes.chunks(WRITE_CHUNK) {
            if self.request.upload_halted() {
                return Ok(false);
            }
            conn.write_all(piece).await?;
        }
        Ok(true)
    }

    /// Write a streamed body. With write buffering on, the bytes are kept
    /// so later legs can send them again; otherwise an unsent remainder
    /// stays in the request for the job to dispose of.
    async fn write_stream(
        &self,
        conn: &Arc<Connection>,
        mode: WriteMode,
        mut stream: BodyStream,
        length: Option<u64>,
    ) -> Result<bool, NetError> {
        let mut retained = self.request.options().allow_write_buffering.then(BytesMut::new);
        let mut complete = true;

        while let Some(item) = stream.next().await {
            let chunk = match item {
                Ok(chunk) => chunk,
                Err(e) => {
                    conn.handle_error(e);
                    return Err(e);
                }
            };
            if let Some(buf) = retained.as_mut() {
                buf.extend_from_slice(&chunk);
            }
            if chunk.is_empty() {
                continue;
            }
            if mode == WriteMode::Chunked {
                conn.write_all(&encode_chunk(&chunk)).await?;
            } else {
                conn.write_all(&chunk).await?;
            }
            if self.request.upload_halted() {
                complete = false;
                break;
            }
        }

        if complete && mode == WriteMode::Chunked {
            conn.write_all(LAST_CHUNK).await?;
        }

        let body = match retained {
            Some(mut buf) => {
                if !complete {
                    buf.extend_from_slice(&collect_stream(&mut stream).await?);
                }
                RequestBody::Bytes(buf.freeze())
            }
            None if !complete => RequestBody::Stream { stream, length },
            None => RequestBody::Consumed,
        };
        self.request.state().body = body;
        Ok(complete)
    }
}
