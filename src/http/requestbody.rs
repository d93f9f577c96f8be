//! Request body for POST/PUT operations.

use crate::base::neterror::NetError;
use bytes::{Bytes, BytesMut};
use futures::stream::{Stream, StreamExt};
use std::pin::Pin;

/// Producer of body chunks whose total length may be unknown up front.
pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes, NetError>> + Send>>;

/// How the body goes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteMode {
    /// No body and no `Content-Length`.
    #[default]
    None,
    /// `Content-Length` framed.
    ContentLength,
    /// `Transfer-Encoding: chunked`.
    Chunked,
    /// Length unknown and the server cannot take chunked uploads: the body
    /// is collected first and then sent with a `Content-Length`.
    Buffered,
}

/// Request body for HTTP methods that send data.
#[derive(Default)]
pub enum RequestBody {
    /// No body (GET, HEAD, DELETE).
    #[default]
    Empty,
    /// Body with raw bytes.
    Bytes(Bytes),
    /// Streamed body, optionally with a declared length.
    Stream { stream: BodyStream, length: Option<u64> },
    /// A stream that was sent without being retained. It cannot be sent again.
    Consumed,
}

impl std::fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestBody::Empty => f.write_str("Empty"),
            RequestBody::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            RequestBody::Stream { length, .. } => {
                f.debug_struct("Stream").field("length", length).finish()
            }
            RequestBody::Consumed => f.write_str("Consumed"),
        }
    }
}

impl From<String> for RequestBody {
    fn from(s: String) -> Self {
        RequestBody::Bytes(Bytes::from(s))
    }
}

impl From<Vec<u8>> for RequestBody {
    fn from(v: Vec<u8>) -> Self {
        RequestBody::Bytes(Bytes::from(v))
    }
}

impl From<&str> for RequestBody {
    fn from(s: &str) -> Self {
        RequestBody::Bytes(Bytes::from(s.to_owned()))
    }
}

impl From<Bytes> for RequestBody {
    fn from(b: Bytes) -> Self {
        RequestBody::Bytes(b)
    }
}

impl RequestBody {
    /// Wrap a chunk stream. `length` is sent as `Content-Length` when known.
    pub fn stream<S>(stream: S, length: Option<u64>) -> Self
    where
        S: Stream<Item = Result<Bytes, NetError>> + Send + 'static,
    {
        RequestBody::Stream { stream: Box::pin(stream), length }
    }

    /// Check if the body is empty.
    pub fn is_empty(&self) -> bool {
        match self {
            RequestBody::Empty => true,
            RequestBody::Bytes(b) => b.is_empty(),
            RequestBody::Stream { length, .. } => *length == Some(0),
            RequestBody::Consumed => false,
        }
    }

    /// Declared length, `None` when only the stream knows.
    pub fn declared_length(&self) -> Option<u64> {
        match self {
            RequestBody::Empty => Some(0),
            RequestBody::Bytes(b) => Some(b.len() as u64),
            RequestBody::Stream { length, .. } => *length,
            RequestBody::Consumed => None,
        }
    }

    pub fn is_stream(&self) -> bool {
        matches!(self, RequestBody::Stream { .. })
    }

    /// Pick the wire mode for this body.
    ///
    /// POST and PUT always carry a length, so an empty body still gets
    /// `Content-Length: 0`.
    pub fn write_mode(&self, method: &http::Method, chunked_upload: bool) -> WriteMode {
        let needs_length = *method == http::Method::POST || *method == http::Method::PUT;
        match self {
            RequestBody::Empty if needs_length => WriteMode::ContentLength,
            RequestBody::Empty => WriteMode::None,
            RequestBody::Bytes(_) => WriteMode::ContentLength,
            RequestBody::Stream { length: Some(_), .. } => WriteMode::ContentLength,
            RequestBody::Stream { length: None, .. } if chunked_upload => WriteMode::Chunked,
            RequestBody::Stream { length: None, .. } => WriteMode::Buffered,
            RequestBody::Consumed => WriteMode::None,
        }
    }
}

/// Run a stream to completion, keeping the bytes.
pub async fn collect_stream(stream: &mut BodyStream) -> Result<Bytes, NetError> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        buf.extend_from_slice(&chunk?);
    }
    Ok(buf.freeze())
}

/// Run a stream to completion, dropping the bytes.
pub async fn discard_stream(stream: &mut BodyStream) -> Result<u64, NetError> {
    let mut total = 0u64;
    while let Some(chunk) = stream.next().await {
        total += chunk?.len() as u64;
    }
    Ok(total)
}
