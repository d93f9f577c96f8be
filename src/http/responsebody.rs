//! Response body streaming.
//!
//! A body that arrived together with its head is held in memory. Anything
//! larger is read off the connection on demand: the body owns the
//! connection's read side until its last byte, then hands it back so the
//! next pipelined response can be read.

use crate::base::neterror::NetError;
use crate::http::chunked::ChunkedDecoder;
use crate::http::framer::BodyFraming;
use crate::socket::connection::{Connection, ReadSide};
use crate::urlrequest::request::Request;
use bytes::{Buf, Bytes, BytesMut};
use futures::Stream;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Most bytes [`ResponseBody::drain`] reads before giving up on reuse.
pub const DEFAULT_DRAIN_LIMIT: usize = 64 * 1024;

/// How long [`ResponseBody::drain`] may take by default.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

enum Decoder {
    Length { remaining: u64 },
    Chunked(ChunkedDecoder),
    UntilClose,
}

struct StreamingBody {
    conn: Arc<Connection>,
    request: Arc<Request>,
    leg: u64,
    side: Option<ReadSide>,
    decoder: Decoder,
    shutdown: watch::Receiver<bool>,
    read_timeout: Option<Duration>,
}

impl StreamingBody {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, NetError> {
        loop {
            let Some(side) = self.side.as_mut() else {
                return Ok(None);
            };

            let (chunk, done) = match &mut self.decoder {
                Decoder::Length { remaining } => {
                    let n = (*remaining).min(side.buf.len() as u64) as usize;
                    *remaining -= n as u64;
                    (side.buf.split_to(n).freeze(), *remaining == 0)
                }
                Decoder::Chunked(decoder) => {
                    let mut out = BytesMut::new();
                    let consumed = decoder.decode(&side.buf, &mut out)?;
                    side.buf.advance(consumed);
                    (out.freeze(), decoder.is_done())
                }
                Decoder::UntilClose => (side.buf.split().freeze(), false),
            };

            if done {
                self.finish();
            }
            if !chunk.is_empty() {
                return Ok(Some(chunk));
            }
            if done {
                return Ok(None);
            }

            let Some(side) = self.side.as_mut() else {
                return Ok(None);
            };
            if side.fill(&mut self.shutdown, self.read_timeout).await? == 0 {
                let error = match self.decoder {
                    Decoder::UntilClose => None,
                    Decoder::Length { .. } => Some(NetError::ContentLengthMismatch),
                    Decoder::Chunked(_) => Some(NetError::IncompleteChunkedEncoding),
                };
                return match error {
                    Some(e) => Err(e),
                    None => {
                        self.finish();
                        Ok(None)
                    }
                };
            }
        }
    }

    /// Give the read side back to the connection.
    fn finish(&mut self) {
        if let Some(side) = self.side.take() {
            tracing::trace!(conn = self.conn.id(), request = self.request.id(), "response body complete");
            self.conn.body_finished(&self.request, self.leg, side);
        }
    }

    fn fail(&mut self, error: NetError) {
        if self.side.take().is_some() {
            self.conn.handle_error(error);
        }
    }
}

impl Drop for StreamingBody {
    fn drop(&mut self) {
        if self.side.take().is_some() {
            self.conn.body_abandoned(&self.request);
        }
    }
}

enum BodyInner {
    Full(Bytes),
    Streaming(Box<StreamingBody>),
}

/// Body of an [`HttpResponse`](crate::http::HttpResponse).
pub struct ResponseBody {
    inner: BodyInner,
}

impl std::fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.inner {
            BodyInner::Full(bytes) => f.debug_struct("ResponseBody").field("buffered", &bytes.len()).finish(),
            BodyInner::Streaming(s) => f
                .debug_struct("ResponseBody")
                .field("conn", &s.conn.id())
                .field("finished", &s.side.is_none())
                .finish(),
        }
    }
}

impl ResponseBody {
    /// A body that is already in memory.
    pub fn full(bytes: Bytes) -> Self {
        Self { inner: BodyInner::Full(bytes) }
    }

    pub fn empty() -> Self {
        Self::full(Bytes::new())
    }

    pub(crate) fn streaming(
        conn: Arc<Connection>,
        request: Arc<Request>,
        leg: u64,
        side: ReadSide,
        framing: BodyFraming,
        read_timeout: Option<Duration>,
    ) -> Self {
        let decoder = match framing {
            BodyFraming::Length(n) => Decoder::Length { remaining: n },
            BodyFraming::Chunked => Decoder::Chunked(ChunkedDecoder::new()),
            BodyFraming::UntilClose => Decoder::UntilClose,
            BodyFraming::Empty => Decoder::Length { remaining: 0 },
        };
        let shutdown = conn.shutdown_signal();
        Self {
            inner: BodyInner::Streaming(Box::new(StreamingBody {
                conn,
                request,
                leg,
                side: Some(side),
                decoder,
                shutdown,
                read_timeout,
            })),
        }
    }

    /// The whole body is in memory.
    pub fn is_buffered(&self) -> bool {
        matches!(self.inner, BodyInner::Full(_))
    }

    /// Next piece of the body; `None` at the end.
    pub async fn chunk(&mut self) -> Result<Option<Bytes>, NetError> {
        match &mut self.inner {
            BodyInner::Full(bytes) => {
                if bytes.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(std::mem::take(bytes)))
                }
            }
            BodyInner::Streaming(body) => match body.next_chunk().await {
                Ok(chunk) => Ok(chunk),
                Err(e) => {
                    tracing::debug!(conn = body.conn.id(), error = %e, "response body read failed");
                    body.fail(e);
                    Err(e)
                }
            },
        }
    }

    /// Read entire body as bytes.
    pub async fn bytes(mut self) -> Result<Bytes, NetError> {
        if let BodyInner::Full(bytes) = &mut self.inner {
            return Ok(std::mem::take(bytes));
        }
        let mut out = BytesMut::new();
        while let Some(chunk) = self.chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out.freeze())
    }

    /// Read body as UTF-8 string.
    pub async fn text(self) -> Result<String, NetError> {
        let bytes = self.bytes().await?;
        String::from_utf8(bytes.to_vec()).map_err(|_| NetError::InvalidUtf8)
    }

    /// Read body as JSON, deserializing to type T.
    #[cfg(feature = "json")]
    pub async fn json<T: serde::de::DeserializeOwned>(self) -> Result<T, NetError> {
        let bytes = self.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|_| NetError::JsonParseError)
    }

    /// Read and discard the rest of the body so the connection can be
    /// reused. Gives up after `limit` bytes or `timeout`; the connection is
    /// then closed instead.
    pub async fn drain(mut self, limit: usize, timeout: Duration) -> Result<(), NetError> {
        if self.is_buffered() {
            return Ok(());
        }
        let drained = tokio::time::timeout(timeout, async {
            let mut total = 0usize;
            while let Some(chunk) = self.chunk().await? {
                total += chunk.len();
                if total > limit {
                    return Err(NetError::ResponseBodyTooBigToDrain);
                }
            }
            Ok(())
        })
        .await;
        match drained {
            Ok(result) => result,
            Err(_) => Err(NetError::TimedOut),
        }
    }

    /// The body as a stream of chunks.
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes, NetError>> + Send {
        futures::stream::unfold(Some(self), |body| async move {
            let mut body = body?;
            match body.chunk().await {
                Ok(Some(chunk)) => Some((Ok(chunk), Some(body))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }
}
